//! Block layer
//!
//! Actions are looked up by `(blockName, actionName)`. ACTION_CODE steps go
//! to a single code runner when one is registered.
//!
//! # Example
//!
//! ```ignore
//! use blockflow::block::BlockRegistry;
//!
//! let registry = BlockRegistry::with_core_blocks();
//! let echo = registry.get("core", "echo").expect("core blocks registered");
//! ```

mod builtin;
mod types;

pub use types::{Action, ActionContext, ActionError, ActionHook};

use std::collections::BTreeMap;
use std::sync::Arc;

/// Name of the built-in block
pub const CORE_BLOCK: &str = "core";

/// Maps block actions to their implementations
#[derive(Clone, Default)]
pub struct BlockRegistry {
    actions: BTreeMap<(String, String), Arc<dyn Action>>,
    code_runner: Option<Arc<dyn Action>>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `core` block
    pub fn with_core_blocks() -> Self {
        let mut registry = Self::new();
        builtin::register(&mut registry);
        registry
    }

    /// Register an action, replacing any previous one with the same name
    pub fn register(
        &mut self,
        block_name: impl Into<String>,
        action_name: impl Into<String>,
        action: impl Action + 'static,
    ) -> &mut Self {
        self.actions
            .insert((block_name.into(), action_name.into()), Arc::new(action));
        self
    }

    /// Set the runner used for ACTION_CODE steps
    pub fn set_code_runner(&mut self, runner: impl Action + 'static) -> &mut Self {
        self.code_runner = Some(Arc::new(runner));
        self
    }

    pub fn get(&self, block_name: &str, action_name: &str) -> Option<Arc<dyn Action>> {
        self.actions
            .get(&(block_name.to_string(), action_name.to_string()))
            .cloned()
    }

    pub fn code_runner(&self) -> Option<Arc<dyn Action>> {
        self.code_runner.clone()
    }

    /// All registered `(block, action, description)` in name order
    pub fn list(&self) -> Vec<(&str, &str, &str)> {
        self.actions
            .iter()
            .map(|((block, action), imp)| (block.as_str(), action.as_str(), imp.description()))
            .collect()
    }
}

impl std::fmt::Debug for BlockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRegistry")
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("code_runner", &self.code_runner.is_some())
            .finish()
    }
}
