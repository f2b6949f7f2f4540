//! Per-step result records

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Step outputs keyed by step name, in execution order
pub type StepOutputs = IndexMap<String, StepOutput>;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Running,
    Succeeded,
    Failed,
    Paused,
}

impl StepStatus {
    /// Finished steps are never executed again within a run
    pub fn is_finished(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Failed)
    }
}

/// Loop step output: current cursor plus one step map per iteration
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct LoopOutput {
    #[serde(default)]
    pub item: Value,

    #[serde(default)]
    pub index: usize,

    #[serde(default)]
    pub iterations: Vec<StepOutputs>,
}

/// Kind-specific body of a step output
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputKind {
    Generic {
        #[serde(default)]
        output: Value,
    },
    Branch {
        #[serde(rename = "conditionEvaluation")]
        condition_evaluation: bool,
    },
    Split {
        #[serde(rename = "takenBranches", default)]
        taken_branches: Vec<String>,
    },
    LoopOnItems {
        #[serde(default)]
        output: LoopOutput,
    },
}

/// Result record of one step execution
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepOutput {
    pub status: StepStatus,

    /// Resolved input actually used
    #[serde(default)]
    pub input: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Duration in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,

    #[serde(flatten)]
    pub kind: OutputKind,
}

impl StepOutput {
    pub fn succeeded(input: Value, output: Value) -> Self {
        Self {
            status: StepStatus::Succeeded,
            input,
            error_message: None,
            duration: None,
            kind: OutputKind::Generic { output },
        }
    }

    pub fn failed(input: Value, error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            input,
            error_message: Some(error.into()),
            duration: None,
            kind: OutputKind::Generic {
                output: Value::Null,
            },
        }
    }

    pub fn paused(input: Value, output: Value) -> Self {
        Self {
            status: StepStatus::Paused,
            ..Self::succeeded(input, output)
        }
    }

    pub fn branch(input: Value, condition_evaluation: bool) -> Self {
        Self {
            status: StepStatus::Succeeded,
            input,
            error_message: None,
            duration: None,
            kind: OutputKind::Branch {
                condition_evaluation,
            },
        }
    }

    pub fn split(input: Value, taken_branches: Vec<String>) -> Self {
        Self {
            status: StepStatus::Running,
            input,
            error_message: None,
            duration: None,
            kind: OutputKind::Split { taken_branches },
        }
    }

    pub fn looping(input: Value, output: LoopOutput) -> Self {
        Self {
            status: StepStatus::Running,
            input,
            error_message: None,
            duration: None,
            kind: OutputKind::LoopOnItems { output },
        }
    }

    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(millis(duration));
        self
    }

    /// The value other steps see as `{{name.output}}`
    pub fn output(&self) -> Value {
        match &self.kind {
            OutputKind::Generic { output } => output.clone(),
            OutputKind::Branch {
                condition_evaluation,
            } => serde_json::json!({ "conditionEvaluation": condition_evaluation }),
            OutputKind::Split { taken_branches } => {
                serde_json::json!({ "takenBranches": taken_branches })
            }
            OutputKind::LoopOnItems { output } => {
                serde_json::to_value(output).unwrap_or(Value::Null)
            }
        }
    }

    pub fn condition_evaluation(&self) -> Option<bool> {
        match &self.kind {
            OutputKind::Branch {
                condition_evaluation,
            } => Some(*condition_evaluation),
            _ => None,
        }
    }

    pub fn taken_branches(&self) -> Option<&[String]> {
        match &self.kind {
            OutputKind::Split { taken_branches } => Some(taken_branches),
            _ => None,
        }
    }

    pub fn loop_output(&self) -> Option<&LoopOutput> {
        match &self.kind {
            OutputKind::LoopOnItems { output } => Some(output),
            _ => None,
        }
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Forget the pause recorded for `name` so the step starts afresh
///
/// A paused action is removed. A paused loop goes back to RUNNING and keeps
/// its iterations, minus their own pauses.
pub fn withdraw_pause(steps: &mut StepOutputs, name: &str) {
    let Some(record) = steps.get_mut(name) else {
        return;
    };
    if record.status != StepStatus::Paused {
        return;
    }
    if let OutputKind::LoopOnItems { output } = &mut record.kind {
        record.status = StepStatus::Running;
        output.iterations.iter_mut().for_each(withdraw_pauses);
        return;
    }
    steps.shift_remove(name);
}

/// `withdraw_pause` for every paused step in the map
pub fn withdraw_pauses(steps: &mut StepOutputs) {
    let paused: Vec<String> = steps
        .iter()
        .filter(|(_, s)| s.status == StepStatus::Paused)
        .map(|(name, _)| name.clone())
        .collect();
    for name in paused {
        withdraw_pause(steps, &name);
    }
}
