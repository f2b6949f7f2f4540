//! Step interpreter
//!
//! Walks a step chain, recording one `StepOutput` per executed step. The same
//! code path serves BEGIN and RESUME: steps already finished in the incoming
//! context are skipped, a paused step is re-invoked with the resume payload,
//! and branches, splits and loops re-enter their recorded decisions.

use super::failure::{FailurePolicy, FailureVerdict, RetryPolicy};
use super::output::{LoopOutput, StepOutput, StepOutputs, StepStatus, millis, withdraw_pauses};
use super::pool::run_bounded;
use super::state::{ExecutionContext, ResumePayload, RunStatus, Verdict};
use crate::block::{Action, ActionContext, ActionError, ActionHook, BlockRegistry};
use crate::config::{
    BranchSettings, EngineConfig, ErrorHandlingOptions, LoopSettings, SplitBranch,
    SplitBranchType, SplitExecution, SplitSettings, Step, StepKind,
};
use crate::template::{LoopCursor, Scope, VariableResolver, evaluate_conditions};
use futures::future::BoxFuture;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors that abort a run instead of failing a step
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid flow: {0}")]
    InvalidFlow(String),

    #[error("step '{step}' uses unknown action '{block}/{action}'")]
    UnknownAction {
        step: String,
        block: String,
        action: String,
    },

    #[error("code step '{step}' cannot run: no code runner registered")]
    NoCodeRunner { step: String },

    #[error("trigger step '{step}' can only start a flow")]
    UnexpectedTrigger { step: String },

    #[error("run '{run_id}' is {status}, only paused runs can be resumed")]
    NotPaused { run_id: String, status: RunStatus },
}

/// Frames enclosing the chain being walked
///
/// The walked chain's own steps form the innermost frame at resolve time.
#[derive(Debug, Clone, Default)]
pub struct WalkScope {
    parents: Scope,
    cursor: Option<LoopCursor>,
}

impl WalkScope {
    fn resolve_scope(&self, ctx: &ExecutionContext) -> Scope {
        self.parents.push(ctx.shared_steps(), self.cursor.clone())
    }

    /// Scope for a loop body, seeing `parent` and the loop cursor
    fn enter_loop(&self, parent: &ExecutionContext, cursor: LoopCursor) -> Self {
        Self {
            parents: self.resolve_scope(parent),
            cursor: Some(cursor),
        }
    }
}

/// Everything a generic step needs besides its context
struct Invocation<'a> {
    action: Arc<dyn Action>,
    input: &'a Value,
    options: ErrorHandlingOptions,
    source_code: Option<&'a str>,
}

/// Interprets steps against an execution context
pub struct StepWalker {
    registry: Arc<BlockRegistry>,
    resolver: Arc<VariableResolver>,
    config: Arc<EngineConfig>,
    failure: FailurePolicy,
    resume_payload: Option<ResumePayload>,
}

impl StepWalker {
    pub fn new(
        registry: Arc<BlockRegistry>,
        resolver: Arc<VariableResolver>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let failure = FailurePolicy::new(RetryPolicy::from_config(&config.retry));
        Self {
            registry,
            resolver,
            config,
            failure,
            resume_payload: None,
        }
    }

    /// Payload handed to the paused step when the walk resumes
    pub fn with_resume_payload(mut self, payload: Option<ResumePayload>) -> Self {
        self.resume_payload = payload;
        self
    }

    fn step_timeout(&self) -> Option<Duration> {
        self.config.defaults.step_timeout.map(Duration::from_secs)
    }

    /// Walk `start` and its successors
    ///
    /// Returns when the chain ends (verdict still RUNNING) or the verdict
    /// becomes final or paused.
    pub fn walk<'a>(
        &'a self,
        start: Option<&'a Step>,
        ctx: ExecutionContext,
        scope: WalkScope,
    ) -> BoxFuture<'a, Result<ExecutionContext, EngineError>> {
        Box::pin(async move {
            let mut ctx = ctx;
            let mut current = start;
            while let Some(step) = current {
                ctx = self.execute_step(step, ctx, &scope).await?;
                if !ctx.verdict.is_running() {
                    break;
                }
                current = step.next_action.as_deref();
            }
            Ok(ctx)
        })
    }

    async fn execute_step(
        &self,
        step: &Step,
        ctx: ExecutionContext,
        scope: &WalkScope,
    ) -> Result<ExecutionContext, EngineError> {
        tracing::debug!(step = %step.name, kind = ?step.step_type(), "executing step");

        match &step.kind {
            StepKind::TriggerEmpty | StepKind::TriggerBlock { .. } => {
                Err(EngineError::UnexpectedTrigger {
                    step: step.name.clone(),
                })
            }
            StepKind::ActionBlock { settings } => {
                if is_finished(&ctx, &step.name) {
                    return Ok(ctx);
                }
                let action = self
                    .registry
                    .get(&settings.block_name, &settings.action_name)
                    .ok_or_else(|| EngineError::UnknownAction {
                        step: step.name.clone(),
                        block: settings.block_name.clone(),
                        action: settings.action_name.clone(),
                    })?;
                let invocation = Invocation {
                    action,
                    input: &settings.input,
                    options: settings.error_handling_options,
                    source_code: None,
                };
                Ok(self.execute_action(step, invocation, ctx, scope).await)
            }
            StepKind::ActionCode { settings } => {
                if is_finished(&ctx, &step.name) {
                    return Ok(ctx);
                }
                let action =
                    self.registry
                        .code_runner()
                        .ok_or_else(|| EngineError::NoCodeRunner {
                            step: step.name.clone(),
                        })?;
                let invocation = Invocation {
                    action,
                    input: &settings.input,
                    options: settings.error_handling_options,
                    source_code: Some(&settings.source_code),
                };
                Ok(self.execute_action(step, invocation, ctx, scope).await)
            }
            StepKind::Branch {
                settings,
                on_success_action,
                on_failure_action,
            } => {
                self.execute_branch(
                    step,
                    settings,
                    on_success_action.as_deref(),
                    on_failure_action.as_deref(),
                    ctx,
                    scope,
                )
                .await
            }
            StepKind::Split { settings, branches } => {
                self.execute_split(step, settings, branches, ctx, scope)
                    .await
            }
            StepKind::LoopOnItems {
                settings,
                first_loop_action,
            } => {
                self.execute_loop(step, settings, first_loop_action.as_deref(), ctx, scope)
                    .await
            }
        }
    }

    /// ACTION_BLOCK / ACTION_CODE: resolve input, invoke, apply failure policy
    async fn execute_action(
        &self,
        step: &Step,
        invocation: Invocation<'_>,
        ctx: ExecutionContext,
        scope: &WalkScope,
    ) -> ExecutionContext {
        let started = Instant::now();
        let resuming = ctx
            .get_step(&step.name)
            .is_some_and(|prior| prior.status == StepStatus::Paused);

        let input = match self
            .resolver
            .resolve(invocation.input, &scope.resolve_scope(&ctx))
        {
            Ok(input) => input,
            Err(e) => {
                let error = ActionError::invalid_input(e.to_string());
                let raw = invocation.input.clone();
                return self.fail_step(step, &invocation.options, raw, error, started, ctx);
            }
        };

        let mut attempt = 0;
        loop {
            let mut action_ctx = ActionContext::new(&step.name, input.clone())
                .with_run(ctx.run_id.clone(), ctx.project_id.clone());
            if resuming {
                action_ctx =
                    action_ctx.resuming(self.resume_payload.clone().unwrap_or_default());
            }
            if let Some(code) = invocation.source_code {
                action_ctx = action_ctx.with_source_code(code);
            }

            let error = match self.invoke(invocation.action.as_ref(), &mut action_ctx).await {
                Ok(output) => {
                    return self.complete(step, ctx, input, output, action_ctx.take_hook(), started);
                }
                Err(error) => error,
            };

            match self.failure.handle(&invocation.options, &error, attempt) {
                FailureVerdict::Retry(delay) => {
                    tracing::warn!(
                        step = %step.name,
                        attempt = attempt + 1,
                        delay_ms = millis(delay),
                        error = %error,
                        "step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                _ => {
                    return self.fail_step(step, &invocation.options, input, error, started, ctx);
                }
            }
        }
    }

    async fn invoke(
        &self,
        action: &dyn Action,
        ctx: &mut ActionContext,
    ) -> Result<Value, ActionError> {
        match self.step_timeout() {
            Some(limit) => tokio::time::timeout(limit, action.run(ctx))
                .await
                .unwrap_or_else(|_| Err(ActionError::timeout(limit))),
            None => action.run(ctx).await,
        }
    }

    /// Record a successful invocation and apply its hook
    fn complete(
        &self,
        step: &Step,
        ctx: ExecutionContext,
        input: Value,
        output: Value,
        hook: Option<ActionHook>,
        started: Instant,
    ) -> ExecutionContext {
        let elapsed = started.elapsed();
        match hook {
            None => {
                tracing::debug!(
                    step = %step.name,
                    duration_ms = millis(elapsed),
                    "step succeeded"
                );
                ctx.with_step(
                    &step.name,
                    StepOutput::succeeded(input, output).with_duration(elapsed),
                )
            }
            Some(ActionHook::Pause(pause_metadata)) => {
                tracing::info!(step = %step.name, "step paused the run");
                ctx.with_step(
                    &step.name,
                    StepOutput::paused(input, output).with_duration(elapsed),
                )
                .with_verdict(Verdict::Paused { pause_metadata })
            }
            Some(ActionHook::Stop(response)) => {
                tracing::info!(step = %step.name, "step stopped the run");
                ctx.with_step(
                    &step.name,
                    StepOutput::succeeded(input, output).with_duration(elapsed),
                )
                .with_verdict(Verdict::Succeeded {
                    stop_response: Some(response),
                })
            }
        }
    }

    /// Record a failed step; abort the run unless `continueOnFailure`
    fn fail_step(
        &self,
        step: &Step,
        options: &ErrorHandlingOptions,
        input: Value,
        error: ActionError,
        started: Instant,
        ctx: ExecutionContext,
    ) -> ExecutionContext {
        let message = error.to_string();
        let ctx = ctx.with_step(
            &step.name,
            StepOutput::failed(input, &message).with_duration(started.elapsed()),
        );

        if options.continue_on_failure() {
            tracing::warn!(step = %step.name, error = %message, "step failed, continuing");
            ctx
        } else {
            tracing::error!(step = %step.name, error = %message, "step failed");
            ctx.with_verdict(Verdict::Failed {
                failed_step: step.name.clone(),
                error_message: message,
            })
        }
    }

    /// BRANCH: evaluate once, then walk the chosen side
    async fn execute_branch(
        &self,
        step: &Step,
        settings: &BranchSettings,
        on_success: Option<&Step>,
        on_failure: Option<&Step>,
        ctx: ExecutionContext,
        scope: &WalkScope,
    ) -> Result<ExecutionContext, EngineError> {
        let started = Instant::now();
        let prior = ctx.get_step(&step.name);

        let (evaluation, ctx) = match prior {
            Some(prior) if prior.status == StepStatus::Failed => return Ok(ctx),
            Some(prior) if prior.status == StepStatus::Succeeded => {
                match prior.condition_evaluation() {
                    Some(evaluation) => (evaluation, ctx),
                    None => return Ok(ctx),
                }
            }
            _ => {
                let resolve_scope = scope.resolve_scope(&ctx);
                let input = self.describe_conditions(settings, &resolve_scope);
                match evaluate_conditions(settings, &self.resolver, &resolve_scope) {
                    Ok(evaluation) => {
                        tracing::debug!(step = %step.name, evaluation, "branch evaluated");
                        let output =
                            StepOutput::branch(input, evaluation).with_duration(started.elapsed());
                        (evaluation, ctx.with_step(&step.name, output))
                    }
                    Err(e) => {
                        let message = format!("condition evaluation failed: {}", e);
                        tracing::error!(step = %step.name, error = %message, "branch failed");
                        return Ok(ctx
                            .with_step(&step.name, StepOutput::failed(input, &message))
                            .with_verdict(Verdict::Failed {
                                failed_step: step.name.clone(),
                                error_message: message,
                            }));
                    }
                }
            }
        };

        let target = if evaluation { on_success } else { on_failure };
        self.walk(target, ctx, scope.clone()).await
    }

    /// Resolved conditions, recorded as a branch's input
    fn describe_conditions(&self, settings: &BranchSettings, scope: &Scope) -> Value {
        let raw = serde_json::to_value(settings).unwrap_or_default();
        self.resolver.resolve(&raw, scope).unwrap_or(raw)
    }

    /// SPLIT: run every taken branch through the worker pool and merge
    async fn execute_split(
        &self,
        step: &Step,
        settings: &SplitSettings,
        branches: &[SplitBranch],
        ctx: ExecutionContext,
        scope: &WalkScope,
    ) -> Result<ExecutionContext, EngineError> {
        let started = Instant::now();
        let prior = ctx.get_step(&step.name);
        if prior.is_some_and(|p| p.status.is_finished()) {
            return Ok(ctx);
        }

        let recorded = prior
            .filter(|p| p.status == StepStatus::Running)
            .and_then(|p| Some((p.input.clone(), p.taken_branches()?.to_vec())));

        let (input, taken) = match recorded {
            Some(recorded) => recorded,
            None => {
                let resolve_scope = scope.resolve_scope(&ctx);
                let input = json!({ "executionType": settings.execution_type });
                match self.choose_branches(settings, branches, &resolve_scope) {
                    Ok(taken) => (input, taken),
                    Err(message) => {
                        tracing::error!(step = %step.name, error = %message, "split failed");
                        return Ok(ctx
                            .with_step(&step.name, StepOutput::failed(input, &message))
                            .with_verdict(Verdict::Failed {
                                failed_step: step.name.clone(),
                                error_message: message,
                            }));
                    }
                }
            }
        };

        tracing::debug!(step = %step.name, taken = ?taken, "split branches taken");
        let base = ctx.with_step(&step.name, StepOutput::split(input.clone(), taken.clone()));

        let taken_branches: Vec<&SplitBranch> = branches
            .iter()
            .filter(|b| taken.contains(&b.name))
            .collect();
        let tasks: Vec<_> = taken_branches
            .iter()
            .map(|&branch| {
                let branch_ctx = base.clone();
                let branch_scope = scope.clone();
                move || self.walk(branch.next_action.as_deref(), branch_ctx, branch_scope)
            })
            .collect();
        let results = run_bounded(tasks, self.config.pool_size(settings.concurrency)).await;

        let mut merged = base.clone();
        let mut failed: Option<Verdict> = None;
        let mut stopped: Option<Verdict> = None;
        let mut paused: Option<Verdict> = None;
        for (branch, settled) in taken_branches.iter().zip(results) {
            let branch_ctx = settled.into_result()?;
            for (name, output) in branch_ctx.steps() {
                if base.get_step(name) != Some(output) {
                    merged = merged.with_step(name.clone(), output.clone());
                }
            }
            match branch_ctx.verdict {
                Verdict::Running => {}
                v @ Verdict::Failed { .. } => {
                    failed.get_or_insert(v);
                }
                v @ Verdict::Succeeded { .. } => {
                    stopped.get_or_insert(v);
                }
                Verdict::Paused { .. } if paused.is_some() => {
                    // One pause per run; this branch starts over on resume
                    tracing::debug!(
                        step = %step.name,
                        branch = %branch.name,
                        "withdrawing second pause"
                    );
                    merged = merged.without_pauses(branch_step_names(branch));
                }
                v @ Verdict::Paused { .. } => {
                    paused = Some(v);
                }
            }
        }

        let record = StepOutput::split(input, taken).with_duration(started.elapsed());
        let merged = match (failed, stopped, paused) {
            (Some(verdict), _, _) => merged
                .with_step(
                    &step.name,
                    record
                        .with_status(StepStatus::Failed)
                        .with_error("a branch failed"),
                )
                .with_verdict(verdict),
            (None, Some(verdict), _) => merged
                .with_step(&step.name, record.with_status(StepStatus::Succeeded))
                .with_verdict(verdict),
            // Stays RUNNING so resume re-enters the taken branches
            (None, None, Some(verdict)) => {
                merged.with_step(&step.name, record).with_verdict(verdict)
            }
            (None, None, None) => {
                merged.with_step(&step.name, record.with_status(StepStatus::Succeeded))
            }
        };
        Ok(merged)
    }

    /// Names of the branches a split takes, in branch order
    fn choose_branches(
        &self,
        settings: &SplitSettings,
        branches: &[SplitBranch],
        scope: &Scope,
    ) -> Result<Vec<String>, String> {
        let mut taken = Vec::new();
        for branch in branches
            .iter()
            .filter(|b| b.branch_type == SplitBranchType::Condition)
        {
            let matched = evaluate_conditions(&branch.condition, &self.resolver, scope)
                .map_err(|e| format!("branch '{}': {}", branch.name, e))?;
            if matched {
                taken.push(branch.name.clone());
                if settings.execution_type == SplitExecution::ExecuteFirstMatch {
                    break;
                }
            }
        }

        if taken.is_empty() {
            taken.extend(
                branches
                    .iter()
                    .find(|b| b.branch_type == SplitBranchType::Fallback)
                    .map(|b| b.name.clone()),
            );
        }
        Ok(taken)
    }

    /// LOOP_ON_ITEMS: walk the body once per item in a nested context
    async fn execute_loop(
        &self,
        step: &Step,
        settings: &LoopSettings,
        body: Option<&Step>,
        ctx: ExecutionContext,
        scope: &WalkScope,
    ) -> Result<ExecutionContext, EngineError> {
        let started = Instant::now();
        let prior = ctx.get_step(&step.name);
        if prior.is_some_and(|p| p.status.is_finished()) {
            return Ok(ctx);
        }

        let recorded = prior.and_then(|p| {
            let items = p.input.get("items")?.as_array()?.clone();
            Some((items, p.loop_output()?.iterations.clone()))
        });

        let (items, mut iterations) = match recorded {
            Some(recorded) => recorded,
            None => match self.resolve_items(settings, &scope.resolve_scope(&ctx)) {
                Ok(items) => (items, Vec::new()),
                Err(message) => {
                    tracing::error!(step = %step.name, error = %message, "loop failed");
                    return Ok(ctx
                        .with_step(
                            &step.name,
                            StepOutput::failed(json!({ "items": settings.items }), &message),
                        )
                        .with_verdict(Verdict::Failed {
                            failed_step: step.name.clone(),
                            error_message: message,
                        }));
                }
            },
        };
        iterations.resize_with(items.len(), StepOutputs::new);
        let input = json!({ "items": items });

        tracing::debug!(
            step = %step.name,
            items = items.len(),
            parallel = settings.parallel,
            "looping"
        );

        let outcome = if settings.parallel {
            self.run_parallel_iterations(
                step,
                settings,
                body,
                &items,
                &mut iterations,
                &input,
                &ctx,
                scope,
            )
            .await?
        } else {
            self.run_sequential_iterations(step, body, &items, &mut iterations, &input, &ctx, scope)
                .await?
        };

        let (position, verdict) = match outcome {
            Some((index, verdict)) => (index, verdict),
            None => (items.len().saturating_sub(1), Verdict::Running),
        };
        let loop_output = LoopOutput {
            item: items.get(position).cloned().unwrap_or(Value::Null),
            index: position,
            iterations,
        };
        let record = StepOutput::looping(input, loop_output).with_duration(started.elapsed());

        let record = match &verdict {
            Verdict::Running | Verdict::Succeeded { .. } => {
                record.with_status(StepStatus::Succeeded)
            }
            Verdict::Paused { .. } => record.with_status(StepStatus::Paused),
            Verdict::Failed { error_message, .. } => record
                .with_status(StepStatus::Failed)
                .with_error(error_message.clone()),
        };
        Ok(ctx.with_step(&step.name, record).with_verdict(verdict))
    }

    fn resolve_items(&self, settings: &LoopSettings, scope: &Scope) -> Result<Vec<Value>, String> {
        match self.resolver.resolve(&settings.items, scope) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(Value::Null) => Ok(Vec::new()),
            Ok(other) => Err(format!("loop items must be a list, got {}", other)),
            Err(e) => Err(format!("loop items: {}", e)),
        }
    }

    /// Context and scope one iteration runs in
    #[allow(clippy::too_many_arguments)]
    fn iteration(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        scope: &WalkScope,
        input: &Value,
        items: &[Value],
        index: usize,
        recorded: &StepOutputs,
    ) -> (ExecutionContext, WalkScope) {
        let item = items[index].clone();
        let parent_view = ctx.upsert_step(
            &step.name,
            StepOutput::looping(
                input.clone(),
                LoopOutput {
                    item: item.clone(),
                    index,
                    iterations: Vec::new(),
                },
            ),
        );
        let child_scope = scope.enter_loop(&parent_view, LoopCursor::new(item, index));
        (ctx.nested_with(recorded.clone()), child_scope)
    }

    /// One iteration at a time; stops at the first non-running verdict
    #[allow(clippy::too_many_arguments)]
    async fn run_sequential_iterations(
        &self,
        step: &Step,
        body: Option<&Step>,
        items: &[Value],
        iterations: &mut [StepOutputs],
        input: &Value,
        ctx: &ExecutionContext,
        scope: &WalkScope,
    ) -> Result<Option<(usize, Verdict)>, EngineError> {
        for index in 0..items.len() {
            let (child_ctx, child_scope) =
                self.iteration(step, ctx, scope, input, items, index, &iterations[index]);
            let child = self.walk(body, child_ctx, child_scope).await?;
            let verdict = child.verdict.clone();
            iterations[index] = child.into_steps();
            if !verdict.is_running() {
                return Ok(Some((index, verdict)));
            }
        }
        Ok(None)
    }

    /// Iterations through the worker pool; once one stops the run, unstarted
    /// iterations are skipped
    #[allow(clippy::too_many_arguments)]
    async fn run_parallel_iterations(
        &self,
        step: &Step,
        settings: &LoopSettings,
        body: Option<&Step>,
        items: &[Value],
        iterations: &mut [StepOutputs],
        input: &Value,
        ctx: &ExecutionContext,
        scope: &WalkScope,
    ) -> Result<Option<(usize, Verdict)>, EngineError> {
        let halted = AtomicBool::new(false);
        let tasks: Vec<_> = (0..items.len())
            .map(|index| {
                let (child_ctx, child_scope) =
                    self.iteration(step, ctx, scope, input, items, index, &iterations[index]);
                let halted = &halted;
                move || async move {
                    if halted.load(Ordering::SeqCst) {
                        return Ok::<_, EngineError>(None);
                    }
                    let child = self.walk(body, child_ctx, child_scope).await?;
                    if !child.verdict.is_running() {
                        halted.store(true, Ordering::SeqCst);
                    }
                    Ok(Some(child))
                }
            })
            .collect();
        let results = run_bounded(tasks, self.config.pool_size(settings.concurrency)).await;

        let mut failed: Option<(usize, Verdict)> = None;
        let mut stopped: Option<(usize, Verdict)> = None;
        let mut paused: Option<(usize, Verdict)> = None;
        for (index, settled) in results.into_iter().enumerate() {
            let Some(child) = settled.into_result()? else {
                continue;
            };
            let verdict = child.verdict.clone();
            iterations[index] = child.into_steps();
            match verdict {
                Verdict::Running => {}
                Verdict::Failed { .. } => {
                    failed.get_or_insert((index, verdict));
                }
                Verdict::Succeeded { .. } => {
                    stopped.get_or_insert((index, verdict));
                }
                Verdict::Paused { .. } if paused.is_some() => {
                    tracing::debug!(step = %step.name, index, "withdrawing second pause");
                    withdraw_pauses(&mut iterations[index]);
                }
                Verdict::Paused { .. } => paused = Some((index, verdict)),
            }
        }

        Ok(failed.or(stopped).or(paused))
    }
}

/// Every step reachable from a split branch
fn branch_step_names(branch: &SplitBranch) -> Vec<&str> {
    branch
        .next_action
        .as_deref()
        .map(Step::descendants)
        .unwrap_or_default()
        .into_iter()
        .map(|step| step.name.as_str())
        .collect()
}

fn is_finished(ctx: &ExecutionContext, name: &str) -> bool {
    ctx.get_step(name).is_some_and(|s| s.status.is_finished())
}
