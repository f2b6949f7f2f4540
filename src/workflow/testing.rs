//! Mock actions and flow builders for walker and runner tests

use crate::block::{Action, ActionContext, ActionError, BlockRegistry};
use crate::config::{
    BlockSettings, BranchCondition, BranchSettings, ConditionOperator, EngineConfig,
    ErrorHandlingOptions, FlowVersion, LoopSettings, SplitBranch, SplitBranchType, SplitSettings,
    Step, StepKind, Toggle,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub const TEST_BLOCK: &str = "test";

/// Counts invocations and echoes its input with the count
#[derive(Default)]
pub struct Counting {
    pub calls: AtomicU32,
}

#[async_trait]
impl Action for Counting {
    async fn run(&self, ctx: &mut ActionContext) -> Result<Value, ActionError> {
        let count = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({ "count": count, "input": ctx.props_value }))
    }
}

/// Fails a fixed number of times before succeeding
pub struct FailTimes {
    pub attempts: AtomicU32,
    pub fail_times: u32,
    pub error: ActionError,
}

impl FailTimes {
    pub fn retryable(fail_times: u32) -> Self {
        Self {
            attempts: AtomicU32::new(0),
            fail_times,
            error: ActionError::failed("temporarily unavailable"),
        }
    }

    pub fn non_retryable(fail_times: u32) -> Self {
        Self {
            error: ActionError::invalid_input("bad request"),
            ..Self::retryable(fail_times)
        }
    }
}

#[async_trait]
impl Action for FailTimes {
    async fn run(&self, _ctx: &mut ActionContext) -> Result<Value, ActionError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_times {
            Err(self.error.clone())
        } else {
            Ok(json!({ "attempts": attempt + 1 }))
        }
    }
}

/// Sleeps `ms` from its input, tracking how many run at once
#[derive(Default)]
pub struct Sleeping {
    pub in_flight: AtomicUsize,
    pub max_seen: AtomicUsize,
}

#[async_trait]
impl Action for Sleeping {
    async fn run(&self, ctx: &mut ActionContext) -> Result<Value, ActionError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        let ms = ctx.prop("ms").and_then(Value::as_u64).unwrap_or(5);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ctx.props_value.clone())
    }
}

/// Shared handles to the mocks registered by `registry`
pub struct Mocks {
    pub counting: Arc<Counting>,
    pub flaky: Arc<FailTimes>,
    pub sleeping: Arc<Sleeping>,
}

struct Shared<A: Action>(Arc<A>);

#[async_trait]
impl<A: Action> Action for Shared<A> {
    async fn run(&self, ctx: &mut ActionContext) -> Result<Value, ActionError> {
        self.0.run(ctx).await
    }
}

/// Core blocks plus `test/count`, `test/flaky` (fails twice) and `test/sleep`
pub fn registry() -> (Arc<BlockRegistry>, Mocks) {
    registry_with_flaky(FailTimes::retryable(2))
}

pub fn registry_with_flaky(flaky: FailTimes) -> (Arc<BlockRegistry>, Mocks) {
    let mocks = Mocks {
        counting: Arc::new(Counting::default()),
        flaky: Arc::new(flaky),
        sleeping: Arc::new(Sleeping::default()),
    };
    let mut registry = BlockRegistry::with_core_blocks();
    registry
        .register(TEST_BLOCK, "count", Shared(mocks.counting.clone()))
        .register(TEST_BLOCK, "flaky", Shared(mocks.flaky.clone()))
        .register(TEST_BLOCK, "sleep", Shared(mocks.sleeping.clone()));
    (Arc::new(registry), mocks)
}

/// Engine config with instant retries
pub fn config() -> Arc<EngineConfig> {
    let mut config = EngineConfig::default();
    config.retry.initial_delay = 1;
    config.retry.max_delay = 5;
    config.retry.jitter = false;
    Arc::new(config)
}

pub fn action(name: &str, block: &str, action: &str, input: Value) -> Step {
    Step::new(
        name,
        StepKind::ActionBlock {
            settings: BlockSettings {
                block_name: block.into(),
                action_name: action.into(),
                input,
                error_handling_options: ErrorHandlingOptions::default(),
            },
        },
    )
}

pub fn with_options(mut step: Step, continue_on_failure: bool, retry_on_failure: bool) -> Step {
    if let StepKind::ActionBlock { settings } = &mut step.kind {
        settings.error_handling_options = ErrorHandlingOptions {
            continue_on_failure: Some(Toggle::enabled(continue_on_failure)),
            retry_on_failure: Some(Toggle::enabled(retry_on_failure)),
        };
    }
    step
}

pub fn condition(first: Value, operator: ConditionOperator, second: Value) -> BranchSettings {
    BranchSettings {
        conditions: vec![vec![BranchCondition {
            first_value: first,
            operator,
            second_value: second,
            case_sensitive: false,
        }]],
        expression: None,
    }
}

pub fn branch(name: &str, settings: BranchSettings, on_true: Step, on_false: Step) -> Step {
    Step::new(
        name,
        StepKind::Branch {
            settings,
            on_success_action: Some(Box::new(on_true)),
            on_failure_action: Some(Box::new(on_false)),
        },
    )
}

pub fn split_branch(name: &str, condition: BranchSettings, body: Step) -> SplitBranch {
    SplitBranch {
        name: name.into(),
        branch_type: SplitBranchType::Condition,
        condition,
        next_action: Some(Box::new(body)),
    }
}

pub fn fallback(name: &str, body: Step) -> SplitBranch {
    SplitBranch {
        name: name.into(),
        branch_type: SplitBranchType::Fallback,
        condition: BranchSettings::default(),
        next_action: Some(Box::new(body)),
    }
}

pub fn split(name: &str, settings: SplitSettings, branches: Vec<SplitBranch>) -> Step {
    Step::new(name, StepKind::Split { settings, branches })
}

pub fn looping(name: &str, items: Value, parallel: bool, body: Step) -> Step {
    Step::new(
        name,
        StepKind::LoopOnItems {
            settings: LoopSettings {
                items,
                parallel,
                concurrency: None,
            },
            first_loop_action: Some(Box::new(body)),
        },
    )
}

pub fn always() -> BranchSettings {
    BranchSettings {
        conditions: Vec::new(),
        expression: Some("true".into()),
    }
}

pub fn never() -> BranchSettings {
    BranchSettings {
        conditions: Vec::new(),
        expression: Some("false".into()),
    }
}

/// Flow with an empty trigger followed by `first`
pub fn flow(first: Step) -> FlowVersion {
    let mut flow = FlowVersion::new(Step::new("trigger", StepKind::TriggerEmpty).then(first));
    flow.id = "test-flow".into();
    flow
}
