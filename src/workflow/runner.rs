//! Flow runner - entry point for BEGIN and RESUME

use super::executor::{EngineError, StepWalker, WalkScope};
use super::output::{StepOutput, millis};
use super::state::{ExecutionContext, ResumePayload, RunStatus, Verdict};
use crate::block::BlockRegistry;
use crate::config::{EngineConfig, FlowVersion, StepKind};
use crate::template::VariableResolver;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;

/// One invocation of `execute_flow`
#[derive(Debug, Clone, Default)]
pub struct FlowRunRequest {
    /// Trigger output for a new run
    pub trigger_payload: Value,

    /// Paused context to resume; `None` starts a new run
    pub prior_context: Option<ExecutionContext>,

    /// External input for the paused step
    pub resume_payload: Option<ResumePayload>,

    /// Run id for a new run (generated if unset)
    pub run_id: Option<String>,

    pub project_id: Option<String>,
}

impl FlowRunRequest {
    pub fn begin(trigger_payload: Value) -> Self {
        Self {
            trigger_payload,
            ..Self::default()
        }
    }

    pub fn resume(prior_context: ExecutionContext, resume_payload: ResumePayload) -> Self {
        Self {
            prior_context: Some(prior_context),
            resume_payload: Some(resume_payload),
            ..Self::default()
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }
}

/// Runs flow versions against a block registry
pub struct FlowRunner {
    registry: Arc<BlockRegistry>,
    config: Arc<EngineConfig>,
    resolver: Arc<VariableResolver>,
}

impl FlowRunner {
    pub fn new(registry: Arc<BlockRegistry>, config: Arc<EngineConfig>) -> Self {
        Self {
            registry,
            config,
            resolver: Arc::new(VariableResolver::new()),
        }
    }

    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    /// Start a new run with the given trigger output
    pub async fn begin(
        &self,
        flow: &FlowVersion,
        trigger_payload: Value,
    ) -> Result<ExecutionContext, EngineError> {
        self.execute_flow(flow, FlowRunRequest::begin(trigger_payload))
            .await
    }

    /// Continue a paused run
    pub async fn resume(
        &self,
        flow: &FlowVersion,
        prior: ExecutionContext,
        payload: ResumePayload,
    ) -> Result<ExecutionContext, EngineError> {
        self.execute_flow(flow, FlowRunRequest::resume(prior, payload))
            .await
    }

    /// Walk a flow version to its end or its next pause
    ///
    /// Step failures are reported through the returned context's verdict;
    /// `Err` is reserved for runs that cannot proceed at all.
    pub async fn execute_flow(
        &self,
        flow: &FlowVersion,
        request: FlowRunRequest,
    ) -> Result<ExecutionContext, EngineError> {
        flow.validate()
            .map_err(|errors| EngineError::InvalidFlow(errors.join("; ")))?;

        let started = Instant::now();
        let ctx = match request.prior_context {
            Some(prior) => {
                let status = prior.status();
                if status != RunStatus::Paused {
                    return Err(EngineError::NotPaused {
                        run_id: prior.run_id,
                        status,
                    });
                }
                tracing::info!(run_id = %prior.run_id, flow = %flow.id, "resuming run");
                prior.into_resumed()
            }
            None => {
                let run_id = request
                    .run_id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                tracing::info!(run_id = %run_id, flow = %flow.id, "starting run");
                let mut ctx = ExecutionContext::empty(run_id);
                if let Some(project_id) = request.project_id {
                    ctx = ctx.with_project(project_id);
                }
                ctx.with_step(
                    &flow.trigger.name,
                    StepOutput::succeeded(trigger_input(flow), request.trigger_payload),
                )
            }
        };

        let walker = StepWalker::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.resolver),
            Arc::clone(&self.config),
        )
        .with_resume_payload(request.resume_payload);

        let ctx = walker
            .walk(flow.trigger.next_action.as_deref(), ctx, WalkScope::default())
            .await?;

        let ctx = match ctx.verdict {
            Verdict::Running => ctx.with_verdict(Verdict::Succeeded {
                stop_response: None,
            }),
            _ => ctx,
        };

        tracing::info!(
            run_id = %ctx.run_id,
            status = %ctx.status(),
            steps = ctx.steps().len(),
            duration_ms = millis(started.elapsed()),
            "run finished"
        );
        Ok(ctx)
    }
}

fn trigger_input(flow: &FlowVersion) -> Value {
    match &flow.trigger.kind {
        StepKind::TriggerBlock { settings } => settings.input.clone(),
        _ => json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::output::StepStatus;
    use crate::workflow::testing::{self, TEST_BLOCK};
    use crate::workflow::{ExecutionType, PauseMetadata};
    use std::sync::atomic::Ordering;

    fn approval_flow() -> FlowVersion {
        testing::flow(
            testing::action("count", TEST_BLOCK, "count", json!({"id": "{{trigger.id}}"}))
                .then(testing::action("approve", "core", "approval", json!({})))
                .then(testing::action(
                    "notify",
                    "core",
                    "echo",
                    json!({"approved": "{{approve.approved}}", "count": "{{count.count}}"}),
                )),
        )
    }

    #[tokio::test]
    async fn test_begin_records_trigger_and_succeeds() {
        let (registry, _) = testing::registry();
        let runner = FlowRunner::new(registry, testing::config());
        let flow = testing::flow(testing::action("say", "core", "echo", json!({"v": "{{trigger.v}}"})));

        let ctx = runner
            .execute_flow(&flow, FlowRunRequest::begin(json!({"v": 1})).with_run_id("run-7"))
            .await
            .unwrap();

        assert_eq!(ctx.run_id, "run-7");
        assert_eq!(ctx.status(), RunStatus::Succeeded);
        assert_eq!(ctx.get_step("trigger").unwrap().output(), json!({"v": 1}));
        assert_eq!(ctx.get_step("say").unwrap().output(), json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_pause_then_resume_approval() {
        let (registry, mocks) = testing::registry();
        let runner = FlowRunner::new(registry, testing::config());
        let flow = approval_flow();

        let paused = runner.begin(&flow, json!({"id": 42})).await.unwrap();
        assert_eq!(paused.status(), RunStatus::Paused);
        assert!(matches!(paused.pause_metadata(), Some(PauseMetadata::Webhook { .. })));
        assert!(!paused.has_step("notify"));

        // Resume from the persisted form
        let stored = serde_json::to_string(&paused).unwrap();
        let restored: ExecutionContext = serde_json::from_str(&stored).unwrap();
        let count_before = paused.get_step("count").unwrap().clone();

        let payload = ResumePayload::default().with_query("action", "approve");
        let done = runner.resume(&flow, restored, payload).await.unwrap();

        assert_eq!(done.status(), RunStatus::Succeeded);
        assert_eq!(done.execution_type, ExecutionType::Resume);
        assert_eq!(done.get_step("approve").unwrap().output(), json!({"approved": true}));
        assert_eq!(done.get_step("notify").unwrap().output(), json!({"approved": true, "count": 1}));
        assert_eq!(done.get_step("count").unwrap(), &count_before);
        assert_eq!(mocks.counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disapproval_takes_other_branch() {
        let (registry, _) = testing::registry();
        let runner = FlowRunner::new(registry, testing::config());
        let flow = testing::flow(
            testing::action("approve", "core", "approval", json!({})).then(testing::branch(
                "decide",
                testing::condition(
                    json!("{{approve.approved}}"),
                    crate::config::ConditionOperator::BooleanIsTrue,
                    Value::Null,
                ),
                testing::action("ship", "core", "echo", json!({})),
                testing::action("cancel", "core", "echo", json!({})),
            )),
        );

        let paused = runner.begin(&flow, json!({})).await.unwrap();
        let payload = ResumePayload::default().with_query("action", "disapprove");
        let done = runner.resume(&flow, paused, payload).await.unwrap();

        assert!(done.has_step("cancel"));
        assert!(!done.has_step("ship"));
    }

    #[tokio::test]
    async fn test_resume_inside_loop_finishes_remaining_iterations() {
        let (registry, mocks) = testing::registry();
        let runner = FlowRunner::new(registry, testing::config());
        let flow = testing::flow(testing::looping(
            "each",
            json!("{{trigger.items}}"),
            false,
            testing::action("count", TEST_BLOCK, "count", json!({"v": "{{item}}"})).then(
                testing::branch(
                    "first",
                    testing::condition(
                        json!("{{index}}"),
                        crate::config::ConditionOperator::NumberIsEqualTo,
                        json!(0),
                    ),
                    testing::action("wait", "core", "wait_for_webhook", json!({})),
                    testing::action("skip", "core", "echo", json!({})),
                ),
            ),
        ));

        let paused = runner.begin(&flow, json!({"items": ["a", "b"]})).await.unwrap();
        assert_eq!(paused.status(), RunStatus::Paused);
        assert_eq!(mocks.counting.calls.load(Ordering::SeqCst), 1);

        let payload = ResumePayload::default().with_body(json!({"ok": true}));
        let done = runner.resume(&flow, paused, payload).await.unwrap();

        assert_eq!(done.status(), RunStatus::Succeeded);
        let each = done.get_step("each").unwrap();
        assert_eq!(each.status, StepStatus::Succeeded);
        let iterations = &each.loop_output().unwrap().iterations;
        assert_eq!(iterations[0]["wait"].status, StepStatus::Succeeded);
        assert_eq!(iterations[0]["wait"].output()["body"], json!({"ok": true}));
        assert!(iterations[1].contains_key("skip"));
        assert_eq!(mocks.counting.calls.load(Ordering::SeqCst), 2);
    }

    fn request_id(ctx: &ExecutionContext) -> String {
        match ctx.pause_metadata() {
            Some(PauseMetadata::Webhook { request_id, .. }) => request_id.clone(),
            other => panic!("expected a webhook pause, got {:?}", other),
        }
    }

    fn approval_link(ctx: &ExecutionContext, step: &str) -> String {
        ctx.get_step(step).unwrap().output()["approvalLink"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_split_with_two_approvals_pauses_once_per_request() {
        let (registry, _) = testing::registry();
        let runner = FlowRunner::new(registry, testing::config());
        let flow = testing::flow(
            testing::split(
                "fan",
                crate::config::SplitSettings::default(),
                vec![
                    testing::split_branch(
                        "a",
                        testing::always(),
                        testing::action("approve_a", "core", "approval", json!({})),
                    ),
                    testing::split_branch(
                        "b",
                        testing::always(),
                        testing::action("approve_b", "core", "approval", json!({})),
                    ),
                ],
            )
            .then(testing::action(
                "after",
                "core",
                "echo",
                json!({"a": "{{approve_a.approved}}", "b": "{{approve_b.approved}}"}),
            )),
        );

        let first = runner.begin(&flow, json!({})).await.unwrap();
        assert_eq!(first.status(), RunStatus::Paused);
        assert_eq!(first.steps_with_status(StepStatus::Paused), vec!["approve_a"]);
        assert!(!first.has_step("approve_b"));
        assert_eq!(first.get_step("fan").unwrap().status, StepStatus::Running);
        assert!(approval_link(&first, "approve_a").contains(&request_id(&first)));

        let approve = ResumePayload::default().with_query("action", "approve");
        let second = runner.resume(&flow, first.clone(), approve).await.unwrap();
        assert_eq!(second.status(), RunStatus::Paused);
        assert_eq!(second.get_step("approve_a").unwrap().output(), json!({"approved": true}));
        assert_eq!(second.steps_with_status(StepStatus::Paused), vec!["approve_b"]);
        assert_ne!(request_id(&second), request_id(&first));
        assert!(approval_link(&second, "approve_b").contains(&request_id(&second)));

        let disapprove = ResumePayload::default().with_query("action", "disapprove");
        let done = runner.resume(&flow, second, disapprove).await.unwrap();
        assert_eq!(done.status(), RunStatus::Succeeded);
        assert_eq!(done.get_step("fan").unwrap().status, StepStatus::Succeeded);
        assert_eq!(done.get_step("after").unwrap().output(), json!({"a": true, "b": false}));
    }

    #[tokio::test]
    async fn test_parallel_loop_pauses_resume_one_iteration_each() {
        let (registry, _) = testing::registry();
        let runner = FlowRunner::new(registry, testing::config());
        let flow = testing::flow(testing::looping(
            "each",
            json!("{{trigger.items}}"),
            true,
            testing::action("nap", TEST_BLOCK, "sleep", json!({"ms": 10}))
                .then(testing::action("approve", "core", "approval", json!({}))),
        ));

        let paused_iterations = |ctx: &ExecutionContext| -> Vec<usize> {
            let each = ctx.get_step("each").unwrap().loop_output().unwrap();
            (0..each.iterations.len())
                .filter(|&i| {
                    each.iterations[i]
                        .get("approve")
                        .is_some_and(|s| s.status == StepStatus::Paused)
                })
                .collect()
        };

        let mut ctx = runner.begin(&flow, json!({"items": [1, 2, 3]})).await.unwrap();
        assert_eq!(paused_iterations(&ctx), vec![0]);

        let mut resumes = 0;
        while ctx.status() == RunStatus::Paused {
            assert_eq!(paused_iterations(&ctx).len(), 1);
            let payload = ResumePayload::default().with_query("action", "approve");
            ctx = runner.resume(&flow, ctx, payload).await.unwrap();
            resumes += 1;
            assert!(resumes <= 3, "run did not settle");
        }

        assert_eq!(resumes, 3);
        assert_eq!(ctx.status(), RunStatus::Succeeded);
        let each = ctx.get_step("each").unwrap().loop_output().unwrap();
        for iteration in &each.iterations {
            assert_eq!(iteration["nap"].status, StepStatus::Succeeded);
            assert_eq!(iteration["approve"].output(), json!({"approved": true}));
        }
    }

    #[tokio::test]
    async fn test_resume_pause_two_loops_deep() {
        let (registry, mocks) = testing::registry();
        let runner = FlowRunner::new(registry, testing::config());
        let flow = testing::flow(testing::looping(
            "outer",
            json!("{{trigger.groups}}"),
            false,
            testing::looping(
                "inner",
                json!("{{item}}"),
                false,
                testing::action("count", TEST_BLOCK, "count", json!({"v": "{{item}}"})).then(
                    testing::branch(
                        "second",
                        testing::condition(
                            json!("{{index}}"),
                            crate::config::ConditionOperator::NumberIsEqualTo,
                            json!(1),
                        ),
                        testing::action("wait", "core", "wait_for_webhook", json!({})),
                        testing::action("skip", "core", "echo", json!({})),
                    ),
                ),
            ),
        ));

        let paused = runner
            .begin(&flow, json!({"groups": [["a", "b"], ["c"]]}))
            .await
            .unwrap();
        assert_eq!(paused.status(), RunStatus::Paused);
        assert_eq!(paused.steps_with_status(StepStatus::Paused), vec!["outer"]);
        assert_eq!(mocks.counting.calls.load(Ordering::SeqCst), 2);

        let payload = ResumePayload::default().with_body(json!({"ok": 1}));
        let done = runner.resume(&flow, paused, payload).await.unwrap();

        assert_eq!(done.status(), RunStatus::Succeeded);
        assert_eq!(mocks.counting.calls.load(Ordering::SeqCst), 3);
        let outer = done.get_step("outer").unwrap().loop_output().unwrap();
        let first_inner = outer.iterations[0]["inner"].loop_output().unwrap();
        assert_eq!(first_inner.iterations[1]["wait"].output()["body"], json!({"ok": 1}));
        assert!(first_inner.iterations[0].contains_key("skip"));
        let second_inner = outer.iterations[1]["inner"].loop_output().unwrap();
        assert_eq!(second_inner.iterations[0]["count"].output()["input"], json!({"v": "c"}));
    }

    #[tokio::test]
    async fn test_resume_requires_paused_context() {
        let (registry, _) = testing::registry();
        let runner = FlowRunner::new(registry, testing::config());
        let flow = testing::flow(testing::action("say", "core", "echo", json!({})));

        let done = runner.begin(&flow, json!({})).await.unwrap();
        let err = runner
            .resume(&flow, done, ResumePayload::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::NotPaused {
                status: RunStatus::Succeeded,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_failed_step_reported_in_verdict() {
        let (registry, _) = testing::registry();
        let runner = FlowRunner::new(registry, testing::config());
        let flow = testing::flow(testing::action("boom", "core", "fail", json!({"message": "nope"})));

        let ctx = runner.begin(&flow, json!({})).await.unwrap();
        assert_eq!(
            ctx.verdict,
            Verdict::Failed {
                failed_step: "boom".into(),
                error_message: "nope".into()
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_flow_rejected() {
        let (registry, _) = testing::registry();
        let runner = FlowRunner::new(registry, testing::config());
        let flow = testing::flow(
            testing::action("dup", "core", "echo", json!({}))
                .then(testing::action("dup", "core", "echo", json!({}))),
        );

        let err = runner.begin(&flow, json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidFlow(_)));
    }
}
