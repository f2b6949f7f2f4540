//! Core types and traits for block actions

use crate::workflow::{ExecutionType, PauseMetadata, ResumePayload};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Error types an action can fail with
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ActionError {
    /// The action ran and reported a failure
    #[error("{message}")]
    Failed { message: String },

    /// Input could not be resolved or is unusable
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// Action did not finish in time
    #[error("timeout after {elapsed:?}")]
    Timeout { elapsed: Duration },
}

impl ActionError {
    /// Check if this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, ActionError::Failed { .. } | ActionError::Timeout { .. })
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn timeout(elapsed: Duration) -> Self {
        Self::Timeout { elapsed }
    }
}

/// Control-flow request raised by an action during `run`
#[derive(Debug, Clone, PartialEq)]
pub enum ActionHook {
    Pause(PauseMetadata),
    Stop(Value),
}

/// What an action sees while it runs
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub step_name: String,

    /// Resolved input
    pub props_value: Value,

    /// RESUME only for the step that paused the run
    pub execution_type: ExecutionType,

    /// Present when resuming a paused step
    pub resume_payload: Option<ResumePayload>,

    pub run_id: String,

    pub project_id: Option<String>,

    /// Source of an ACTION_CODE step
    pub source_code: Option<String>,

    hook: Option<ActionHook>,
}

impl ActionContext {
    pub fn new(step_name: impl Into<String>, props_value: Value) -> Self {
        Self {
            step_name: step_name.into(),
            props_value,
            execution_type: ExecutionType::Begin,
            resume_payload: None,
            run_id: String::new(),
            project_id: None,
            source_code: None,
            hook: None,
        }
    }

    /// Mark this invocation as the resumption of a paused step
    pub fn resuming(mut self, payload: ResumePayload) -> Self {
        self.execution_type = ExecutionType::Resume;
        self.resume_payload = Some(payload);
        self
    }

    pub fn with_run(mut self, run_id: impl Into<String>, project_id: Option<String>) -> Self {
        self.run_id = run_id.into();
        self.project_id = project_id;
        self
    }

    pub fn with_source_code(mut self, code: impl Into<String>) -> Self {
        self.source_code = Some(code.into());
        self
    }

    /// Suspend the run after this step returns
    pub fn pause(&mut self, metadata: PauseMetadata) {
        self.hook = Some(ActionHook::Pause(metadata));
    }

    /// End the run successfully after this step returns
    pub fn stop(&mut self, response: Value) {
        self.hook = Some(ActionHook::Stop(response));
    }

    pub fn is_resuming(&self) -> bool {
        self.execution_type == ExecutionType::Resume
    }

    /// Read a property from the resolved input
    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props_value.get(key).filter(|v| !v.is_null())
    }

    pub fn take_hook(&mut self) -> Option<ActionHook> {
        self.hook.take()
    }
}

/// A block action the engine can invoke
#[async_trait]
pub trait Action: Send + Sync {
    /// Run the action; call `ctx.pause` or `ctx.stop` to change control flow
    async fn run(&self, ctx: &mut ActionContext) -> Result<Value, ActionError>;

    /// Short description for listings
    fn description(&self) -> &str {
        ""
    }
}
