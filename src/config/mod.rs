//! Configuration types and loading for blockflow

mod flow;
mod loader;

pub use flow::{
    BlockSettings, BranchCondition, BranchSettings, CodeSettings, ConditionOperator,
    ErrorHandlingOptions, FlowVersion, LoopSettings, SplitBranch, SplitBranchType,
    SplitExecution, SplitSettings, Step, StepKind, StepType, Toggle, TriggerSettings,
};
pub use loader::{Defaults, EngineConfig, RetryConfig, load_flow};
