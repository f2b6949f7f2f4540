//! CLI command implementations

use super::output::{OutputEvent, OutputHandler};
use crate::block::BlockRegistry;
use crate::config::{FlowVersion, Step, StepKind, load_flow};
use crate::template::unknown_references;
use crate::workflow::{
    ExecutionContext, FlowRunRequest, FlowRunner, ResumePayload, RunStatus, millis,
};
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

/// Exit code for a run status: 0 succeeded, 1 failed, 2 paused
pub fn exit_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Succeeded => 0,
        RunStatus::Paused => 2,
        RunStatus::Failed | RunStatus::Running => 1,
    }
}

/// Begin a new run of the flow at `flow_path`
pub async fn run_flow(
    runner: &FlowRunner,
    flow_path: &Path,
    payload: Value,
    state_out: Option<&Path>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let flow = load_flow(flow_path)?;

    handler.emit(OutputEvent::RunStart {
        flow: flow_label(&flow, flow_path),
        resume: false,
    });

    let started = Instant::now();
    let ctx = runner
        .execute_flow(&flow, FlowRunRequest::begin(payload))
        .await
        .with_context(|| format!("running {}", flow_path.display()))?;

    finish(ctx, started, state_out, handler)
}

/// Resume the paused run stored at `state_path`
pub async fn resume_flow(
    runner: &FlowRunner,
    flow_path: &Path,
    state_path: &Path,
    query: &[String],
    body: Option<Value>,
    state_out: Option<&Path>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let flow = load_flow(flow_path)?;
    let prior = read_state(state_path)?;

    let mut payload = ResumePayload::default().with_body(body.unwrap_or(Value::Null));
    payload.query_params = parse_query(query)?;

    handler.emit(OutputEvent::RunStart {
        flow: flow_label(&flow, flow_path),
        resume: true,
    });

    let started = Instant::now();
    let ctx = runner
        .execute_flow(&flow, FlowRunRequest::resume(prior, payload))
        .await
        .with_context(|| format!("resuming {}", state_path.display()))?;

    finish(ctx, started, state_out, handler)
}

fn finish(
    ctx: ExecutionContext,
    started: Instant,
    state_out: Option<&Path>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    for event in OutputEvent::for_run(&ctx, millis(started.elapsed())) {
        handler.emit(event);
    }

    if let Some(path) = state_out {
        write_state(&ctx, path)?;
        handler.emit(OutputEvent::Info {
            message: format!("State written to {}", path.display()),
        });
    }

    let status = ctx.status();
    handler.result(status, final_output(&ctx).as_ref());
    Ok(exit_code(status))
}

/// Stop response if the run was stopped, else the last step's output
fn final_output(ctx: &ExecutionContext) -> Option<Value> {
    if let Some(response) = ctx.stop_response() {
        return Some(response.clone());
    }
    ctx.steps().values().last().map(|s| s.output())
}

fn flow_label(flow: &FlowVersion, path: &Path) -> String {
    if flow.id.is_empty() {
        path.display().to_string()
    } else {
        flow.id.clone()
    }
}

/// Parse `key=value` query parameters
fn parse_query(args: &[String]) -> Result<HashMap<String, String>> {
    args.iter()
        .map(|arg| {
            arg.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow::anyhow!("invalid query parameter '{}', expected key=value", arg))
        })
        .collect()
}

/// Parse a JSON argument; bare text becomes a JSON string
pub fn parse_json_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub fn read_state(path: &Path) -> Result<ExecutionContext> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

pub fn write_state(ctx: &ExecutionContext, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(ctx)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))
}

/// Validate a flow file without running it
///
/// Structural errors fail validation. Unknown actions and references to
/// steps that do not exist are reported as warnings.
pub fn validate_flow(
    flow_path: &Path,
    registry: &BlockRegistry,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let flow = match load_flow(flow_path) {
        Ok(flow) => flow,
        Err(e) => {
            handler.emit(OutputEvent::Error {
                error: format!("{:#}", e),
            });
            return Ok(1);
        }
    };

    let warnings = lint_flow(&flow, registry);
    let steps = flow.trigger.descendants().len();
    handler.emit(OutputEvent::Info {
        message: format!(
            "✓ Flow '{}' is valid ({} steps, {} warning(s))",
            flow_label(&flow, flow_path),
            steps,
            warnings.len()
        ),
    });
    for warning in warnings {
        handler.emit(OutputEvent::Info {
            message: format!("  - {}", warning),
        });
    }
    Ok(0)
}

/// Non-fatal problems: unregistered actions and unknown references
fn lint_flow(flow: &FlowVersion, registry: &BlockRegistry) -> Vec<String> {
    let mut known = flow.step_names();
    known.extend(["item", "index"]);

    let mut warnings = Vec::new();
    for step in flow.trigger.descendants() {
        match &step.kind {
            StepKind::ActionBlock { settings }
                if registry
                    .get(&settings.block_name, &settings.action_name)
                    .is_none() =>
            {
                warnings.push(format!(
                    "step '{}': action '{}/{}' is not registered",
                    step.name, settings.block_name, settings.action_name
                ));
            }
            StepKind::ActionCode { .. } if registry.code_runner().is_none() => {
                warnings.push(format!("step '{}': no code runner registered", step.name));
            }
            _ => {}
        }

        for template in step_templates(step) {
            for error in unknown_references(&template, &known) {
                warnings.push(format!("step '{}': {}", step.name, error));
            }
        }
    }
    warnings
}

/// Templated values a step resolves at run time
fn step_templates(step: &Step) -> Vec<Value> {
    match &step.kind {
        StepKind::ActionBlock { settings } => vec![settings.input.clone()],
        StepKind::ActionCode { settings } => vec![settings.input.clone()],
        StepKind::Branch { settings, .. } => {
            vec![serde_json::to_value(settings).unwrap_or_default()]
        }
        StepKind::Split { branches, .. } => branches
            .iter()
            .map(|b| serde_json::to_value(&b.condition).unwrap_or_default())
            .collect(),
        StepKind::LoopOnItems { settings, .. } => vec![settings.items.clone()],
        StepKind::TriggerEmpty | StepKind::TriggerBlock { .. } => Vec::new(),
    }
}

/// List registered block actions
pub fn list_blocks(registry: &BlockRegistry, handler: &dyn OutputHandler) {
    let actions = registry.list();
    if actions.is_empty() {
        handler.emit(OutputEvent::Info {
            message: "(no blocks registered)".into(),
        });
        return;
    }

    for (block, action, description) in actions {
        let message = if description.is_empty() {
            format!("{}/{}", block, action)
        } else {
            format!("{}/{} - {}", block, action, description)
        };
        handler.emit(OutputEvent::Info { message });
    }

    if registry.code_runner().is_some() {
        handler.emit(OutputEvent::Info {
            message: "(code runner registered)".into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    struct MockHandler {
        events: Arc<Mutex<Vec<OutputEvent>>>,
        results: Arc<Mutex<Vec<(RunStatus, Option<Value>)>>>,
    }

    impl MockHandler {
        fn new() -> Self {
            Self {
                events: Arc::new(Mutex::new(Vec::new())),
                results: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn events(&self) -> Vec<OutputEvent> {
            self.events.lock().unwrap().clone()
        }

        fn messages(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    OutputEvent::Info { message } => Some(message),
                    _ => None,
                })
                .collect()
        }
    }

    impl OutputHandler for MockHandler {
        fn emit(&self, event: OutputEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn result(&self, status: RunStatus, output: Option<&Value>) {
            self.results.lock().unwrap().push((status, output.cloned()));
        }
    }

    fn runner() -> FlowRunner {
        FlowRunner::new(
            Arc::new(BlockRegistry::with_core_blocks()),
            Arc::new(EngineConfig::default()),
        )
    }

    const APPROVAL_FLOW: &str = r#"{
        "id": "orders",
        "trigger": {
            "name": "trigger",
            "type": "TRIGGER_EMPTY",
            "nextAction": {
                "name": "approve",
                "type": "ACTION_BLOCK",
                "settings": {"blockName": "core", "actionName": "approval", "input": {}},
                "nextAction": {
                    "name": "notify",
                    "type": "ACTION_BLOCK",
                    "settings": {
                        "blockName": "core",
                        "actionName": "echo",
                        "input": {"order": "{{trigger.id}}", "approved": "{{approve.approved}}"}
                    }
                }
            }
        }
    }"#;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(RunStatus::Succeeded), 0);
        assert_eq!(exit_code(RunStatus::Failed), 1);
        assert_eq!(exit_code(RunStatus::Paused), 2);
    }

    #[test]
    fn test_parse_query() {
        let parsed = parse_query(&["action=approve".to_string(), "note=a=b".to_string()]).unwrap();
        assert_eq!(parsed.get("action"), Some(&"approve".to_string()));
        assert_eq!(parsed.get("note"), Some(&"a=b".to_string()));
        assert!(parse_query(&["oops".to_string()]).is_err());
    }

    #[test]
    fn test_parse_json_arg() {
        assert_eq!(parse_json_arg(r#"{"a": 1}"#), json!({"a": 1}));
        assert_eq!(parse_json_arg("hello"), json!("hello"));
    }

    #[tokio::test]
    async fn test_run_then_resume_through_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let flow_path = dir.path().join("orders.json");
        let state_path = dir.path().join("state/run.json");
        std::fs::write(&flow_path, APPROVAL_FLOW).unwrap();
        let runner = runner();

        let handler = MockHandler::new();
        let code = run_flow(&runner, &flow_path, json!({"id": 7}), Some(&state_path), &handler)
            .await
            .unwrap();
        assert_eq!(code, 2);
        assert!(
            handler
                .events()
                .iter()
                .any(|e| matches!(e, OutputEvent::RunPaused { .. }))
        );

        let paused = read_state(&state_path).unwrap();
        assert_eq!(paused.status(), RunStatus::Paused);

        let handler = MockHandler::new();
        let code = resume_flow(
            &runner,
            &flow_path,
            &state_path,
            &["action=approve".to_string()],
            None,
            Some(&state_path),
            &handler,
        )
        .await
        .unwrap();
        assert_eq!(code, 0);

        let results = handler.results.lock().unwrap().clone();
        assert_eq!(
            results,
            vec![(RunStatus::Succeeded, Some(json!({"order": 7, "approved": true})))]
        );
        assert_eq!(read_state(&state_path).unwrap().status(), RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_resume_finished_state_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let flow_path = dir.path().join("orders.json");
        let state_path = dir.path().join("run.json");
        std::fs::write(&flow_path, APPROVAL_FLOW).unwrap();
        write_state(&ExecutionContext::empty("done"), &state_path).unwrap();

        let result = resume_flow(
            &runner(),
            &flow_path,
            &state_path,
            &[],
            None,
            None,
            &MockHandler::new(),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_reports_typos_as_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let flow_path = dir.path().join("orders.json");
        std::fs::write(&flow_path, APPROVAL_FLOW.replace("{{trigger.id}}", "{{triger.id}}"))
            .unwrap();
        let handler = MockHandler::new();

        let code = validate_flow(&flow_path, &BlockRegistry::with_core_blocks(), &handler).unwrap();

        assert_eq!(code, 0);
        let messages = handler.messages();
        assert!(messages[0].contains("1 warning"));
        assert!(messages[1].contains("did you mean 'trigger'"));
    }

    #[test]
    fn test_validate_unregistered_action() {
        let dir = tempfile::tempdir().unwrap();
        let flow_path = dir.path().join("orders.json");
        std::fs::write(&flow_path, APPROVAL_FLOW.replace("\"echo\"", "\"send_mail\"")).unwrap();
        let handler = MockHandler::new();

        validate_flow(&flow_path, &BlockRegistry::with_core_blocks(), &handler).unwrap();

        assert!(
            handler
                .messages()
                .iter()
                .any(|m| m.contains("core/send_mail") && m.contains("not registered"))
        );
    }

    #[test]
    fn test_validate_invalid_flow_fails() {
        let dir = tempfile::tempdir().unwrap();
        let flow_path = dir.path().join("broken.json");
        std::fs::write(&flow_path, APPROVAL_FLOW.replace("\"notify\"", "\"approve\"")).unwrap();
        let handler = MockHandler::new();

        let code = validate_flow(&flow_path, &BlockRegistry::with_core_blocks(), &handler).unwrap();

        assert_eq!(code, 1);
        assert!(matches!(&handler.events()[0], OutputEvent::Error { error } if error.contains("duplicate")));
    }

    #[test]
    fn test_list_blocks_includes_core() {
        let handler = MockHandler::new();
        list_blocks(&BlockRegistry::with_core_blocks(), &handler);
        assert!(handler.messages().iter().any(|m| m.starts_with("core/approval")));
    }
}
