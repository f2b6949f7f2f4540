//! Variable resolution for step inputs and branch conditions
//!
//! Step inputs are JSON trees whose strings may hold `{{ expr }}` tokens.
//! Expressions are minijinja expressions over the step outputs in scope.
//!
//! # Features
//!
//! - Step access: `{{ trigger.body.email }}`, `{{ send.output.id }}`, `{{ check.conditionEvaluation }}`
//! - Loop access: bare `{{ item }}` / `{{ index }}`, and
//!   `{{ each.output.iterations[0].child.output }}` for recorded iterations
//! - Filters: `json`, `join`, `first`, `last`, `default`, `trim`, `lines`, `strftime`
//! - Missing steps, attributes and indices resolve to null
//!
//! # Example
//!
//! ```ignore
//! use blockflow::template::{Scope, VariableResolver};
//!
//! let resolver = VariableResolver::new();
//! let scope = Scope::of(ctx.shared_steps());
//! let input = resolver.resolve(&json!({"to": "{{ trigger.email }}"}), &scope)?;
//! ```

mod conditionals;
mod context;
mod engine;
mod errors;
mod filters;

pub use conditionals::{compare, evaluate_condition, evaluate_conditions};
pub use context::{LoopCursor, Scope, to_json};
pub use engine::{VariableResolver, tokens, unknown_references};
pub use errors::{TemplateError, suggest_correction};
