//! Flow execution engine for blockflow
//!
//! This module handles:
//! - Run state and per-step output records
//! - Step interpretation (actions, branches, splits, loops)
//! - Pause and resume through a serializable execution context
//! - Retry and continue-on-failure policies
//! - Bounded concurrency for splits and parallel loops
//!
//! # Example
//!
//! ```ignore
//! use blockflow::block::BlockRegistry;
//! use blockflow::config::{EngineConfig, load_flow};
//! use blockflow::workflow::{FlowRunner, ResumePayload};
//! use std::sync::Arc;
//!
//! let runner = FlowRunner::new(
//!     Arc::new(BlockRegistry::with_core_blocks()),
//!     Arc::new(EngineConfig::load(None)?),
//! );
//!
//! let flow = load_flow(Path::new("order.json"))?;
//! let ctx = runner.begin(&flow, json!({"orderId": 7})).await?;
//!
//! if ctx.pause_metadata().is_some() {
//!     let payload = ResumePayload::default().with_query("action", "approve");
//!     let ctx = runner.resume(&flow, ctx, payload).await?;
//! }
//! ```

mod executor;
mod failure;
mod output;
mod pool;
mod runner;
mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use executor::{EngineError, StepWalker, WalkScope};
pub use failure::{FailurePolicy, FailureVerdict, RetryPolicy};
pub use output::{LoopOutput, OutputKind, StepOutput, StepOutputs, StepStatus, millis};
pub use pool::{Settled, run_bounded};
pub use runner::{FlowRunRequest, FlowRunner};
pub use state::{ExecutionContext, ExecutionType, PauseMetadata, ResumePayload, RunStatus, Verdict};
