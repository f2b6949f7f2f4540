//! Output handlers for CLI commands
//!
//! Supports console (pretty), JSON, and quiet output modes.

use crate::workflow::{ExecutionContext, RunStatus, StepStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Output mode for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Console,
    Json,
    Quiet,
}

impl OutputMode {
    /// Pick a mode from the global flags; `--json` wins over `--quiet`
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if json {
            Self::Json
        } else if quiet {
            Self::Quiet
        } else {
            Self::Console
        }
    }
}

/// Events emitted while running a flow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum OutputEvent {
    RunStart {
        flow: String,
        resume: bool,
    },
    StepSummary {
        name: String,
        status: StepStatus,
        duration_ms: Option<u64>,
    },
    RunPaused {
        run_id: String,
        pause: Value,
    },
    RunFailed {
        run_id: String,
        step: String,
        error: String,
    },
    RunComplete {
        run_id: String,
        status: RunStatus,
        duration_ms: u64,
        steps: usize,
    },
    Error {
        error: String,
    },
    Info {
        message: String,
    },
}

impl OutputEvent {
    /// Terminal events for a finished walk: one summary per top-level step,
    /// then paused/failed, then complete
    pub fn for_run(ctx: &ExecutionContext, duration_ms: u64) -> Vec<OutputEvent> {
        let mut events: Vec<OutputEvent> = ctx
            .steps()
            .iter()
            .map(|(name, output)| OutputEvent::StepSummary {
                name: name.clone(),
                status: output.status,
                duration_ms: output.duration,
            })
            .collect();

        if let Some(pause) = ctx.pause_metadata() {
            events.push(OutputEvent::RunPaused {
                run_id: ctx.run_id.clone(),
                pause: serde_json::to_value(pause).unwrap_or_default(),
            });
        }
        if let crate::workflow::Verdict::Failed {
            failed_step,
            error_message,
        } = &ctx.verdict
        {
            events.push(OutputEvent::RunFailed {
                run_id: ctx.run_id.clone(),
                step: failed_step.clone(),
                error: error_message.clone(),
            });
        }

        events.push(OutputEvent::RunComplete {
            run_id: ctx.run_id.clone(),
            status: ctx.status(),
            duration_ms,
            steps: ctx.steps().len(),
        });
        events
    }
}

/// Output handler trait
pub trait OutputHandler: Send + Sync {
    /// Emit an event
    fn emit(&self, event: OutputEvent);

    /// Write final result
    fn result(&self, status: RunStatus, output: Option<&Value>);
}

/// Console output handler
pub struct ConsoleHandler {
    debug: bool,
}

impl ConsoleHandler {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    fn format_duration(ms: u64) -> String {
        if ms < 1000 {
            format!("{}ms", ms)
        } else {
            format!("{:.1}s", ms as f64 / 1000.0)
        }
    }

    fn status_mark(status: StepStatus) -> &'static str {
        match status {
            StepStatus::Succeeded => "✓",
            StepStatus::Failed => "✗",
            StepStatus::Paused => "⏸",
            StepStatus::Running => "…",
        }
    }
}

impl OutputHandler for ConsoleHandler {
    fn emit(&self, event: OutputEvent) {
        match event {
            OutputEvent::RunStart { flow, resume } => {
                let verb = if resume { "Resuming" } else { "Running" };
                eprintln!("{} flow '{}'", verb, flow);
            }
            OutputEvent::StepSummary {
                name,
                status,
                duration_ms,
            } => match duration_ms.filter(|_| self.debug) {
                Some(ms) => eprintln!(
                    "  {} {} ({})",
                    Self::status_mark(status),
                    name,
                    Self::format_duration(ms)
                ),
                None => eprintln!("  {} {}", Self::status_mark(status), name),
            },
            OutputEvent::RunPaused { run_id, pause } => {
                eprintln!("⏸ Run {} paused: {}", run_id, pause);
            }
            OutputEvent::RunFailed { step, error, .. } => {
                eprintln!("Error in step '{}': {}", step, error);
            }
            OutputEvent::RunComplete {
                status,
                duration_ms,
                steps,
                ..
            } => {
                eprintln!();
                eprintln!(
                    "Run {} ({} steps in {})",
                    status,
                    steps,
                    Self::format_duration(duration_ms)
                );
            }
            OutputEvent::Error { error } => {
                eprintln!("Error: {}", error);
            }
            OutputEvent::Info { message } => {
                eprintln!("{}", message);
            }
        }
    }

    fn result(&self, _status: RunStatus, output: Option<&Value>) {
        if let Some(out) = output {
            println!("{}", out);
        }
    }
}

/// JSON output handler, one document per event
pub struct JsonHandler {
    pretty: bool,
}

impl JsonHandler {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    fn print_json<T: Serialize>(&self, value: &T) {
        let json = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };

        if let Ok(s) = json {
            println!("{}", s);
        }
    }
}

impl OutputHandler for JsonHandler {
    fn emit(&self, event: OutputEvent) {
        self.print_json(&event);
    }

    fn result(&self, status: RunStatus, output: Option<&Value>) {
        #[derive(Serialize)]
        struct FinalResult<'a> {
            status: RunStatus,
            output: Option<&'a Value>,
        }

        self.print_json(&FinalResult { status, output });
    }
}

/// Quiet handler that only prints the final output
pub struct QuietHandler;

impl OutputHandler for QuietHandler {
    fn emit(&self, _event: OutputEvent) {}

    fn result(&self, _status: RunStatus, output: Option<&Value>) {
        if let Some(out) = output {
            println!("{}", out);
        }
    }
}

/// Create an output handler based on mode
pub fn create_handler(mode: OutputMode, debug: bool) -> Box<dyn OutputHandler> {
    match mode {
        OutputMode::Console => Box::new(ConsoleHandler::new(debug)),
        OutputMode::Json => Box::new(JsonHandler::new(false)),
        OutputMode::Quiet => Box::new(QuietHandler),
    }
}
