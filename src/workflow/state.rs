//! Run-scoped execution state

use super::output::{StepOutput, StepOutputs, StepStatus, withdraw_pause};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// How the current walk was entered
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    #[default]
    Begin,
    Resume,
}

/// What a paused step is waiting for
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseMetadata {
    /// Resume when an external request arrives (approval links, webhooks)
    #[serde(rename_all = "camelCase")]
    Webhook {
        request_id: String,
        #[serde(default)]
        response: Value,
    },
    /// Resume at a point in time
    #[serde(rename_all = "camelCase")]
    Delay { resume_date_time: DateTime<Utc> },
}

/// External input delivered on resume
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResumePayload {
    #[serde(default)]
    pub body: Value,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub query_params: HashMap<String, String>,
}

impl ResumePayload {
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }
}

/// Outcome of the walk so far
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    #[default]
    Running,
    #[serde(rename_all = "camelCase")]
    Succeeded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_response: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Paused { pause_metadata: PauseMetadata },
    #[serde(rename_all = "camelCase")]
    Failed {
        failed_step: String,
        error_message: String,
    },
}

impl Verdict {
    pub fn is_running(&self) -> bool {
        matches!(self, Verdict::Running)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, Verdict::Paused { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Verdict::Failed { .. })
    }
}

/// Top-level run status reported to the caller
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Paused,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
            RunStatus::Paused => "PAUSED",
        };
        write!(f, "{}", s)
    }
}

/// All step outputs of one run plus run metadata
///
/// Updates never mutate a context another holder can see: `upsert_step`
/// returns a new context and the step map is shared until written.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub run_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    #[serde(default)]
    pub execution_type: ExecutionType,

    #[serde(default)]
    pub verdict: Verdict,

    #[serde(default)]
    steps: Arc<StepOutputs>,
}

impl ExecutionContext {
    /// Fresh context for a new run
    pub fn empty(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            project_id: None,
            execution_type: ExecutionType::Begin,
            verdict: Verdict::Running,
            steps: Arc::new(StepOutputs::new()),
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Empty context for a loop iteration, sharing run identity
    pub fn nested(&self) -> Self {
        self.nested_with(StepOutputs::new())
    }

    /// Iteration context seeded with previously recorded steps
    pub fn nested_with(&self, steps: StepOutputs) -> Self {
        Self {
            run_id: self.run_id.clone(),
            project_id: self.project_id.clone(),
            execution_type: self.execution_type,
            verdict: Verdict::Running,
            steps: Arc::new(steps),
        }
    }

    /// Re-open a paused context for a resumed walk
    pub fn into_resumed(mut self) -> Self {
        self.execution_type = ExecutionType::Resume;
        self.verdict = Verdict::Running;
        self
    }

    /// Return a new context with the step inserted or replaced
    ///
    /// Replacing keeps the step's original position.
    pub fn upsert_step(&self, name: impl Into<String>, output: StepOutput) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.steps).insert(name.into(), output);
        next
    }

    /// Owned form of `upsert_step`; copies the map only if it is shared
    pub fn with_step(mut self, name: impl Into<String>, output: StepOutput) -> Self {
        Arc::make_mut(&mut self.steps).insert(name.into(), output);
        self
    }

    /// Withdraw the pauses recorded for `names` so those steps run afresh
    pub fn without_pauses<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        let steps = Arc::make_mut(&mut self.steps);
        for name in names {
            withdraw_pause(steps, name);
        }
        self
    }

    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = verdict;
        self
    }

    pub fn get_step(&self, name: &str) -> Option<&StepOutput> {
        self.steps.get(name)
    }

    pub fn has_step(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// Step outputs in execution order
    pub fn steps(&self) -> &StepOutputs {
        &self.steps
    }

    /// Shared handle to the step map, for resolver scopes
    pub fn shared_steps(&self) -> Arc<StepOutputs> {
        Arc::clone(&self.steps)
    }

    pub fn into_steps(self) -> StepOutputs {
        Arc::unwrap_or_clone(self.steps)
    }

    pub fn pause_metadata(&self) -> Option<&PauseMetadata> {
        match &self.verdict {
            Verdict::Paused { pause_metadata } => Some(pause_metadata),
            _ => None,
        }
    }

    pub fn stop_response(&self) -> Option<&Value> {
        match &self.verdict {
            Verdict::Succeeded { stop_response } => stop_response.as_ref(),
            _ => None,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self.verdict {
            Verdict::Running => RunStatus::Running,
            Verdict::Succeeded { .. } => RunStatus::Succeeded,
            Verdict::Paused { .. } => RunStatus::Paused,
            Verdict::Failed { .. } => RunStatus::Failed,
        }
    }

    /// Error message of the step that failed the run
    pub fn error_message(&self) -> Option<&str> {
        match &self.verdict {
            Verdict::Failed { error_message, .. } => Some(error_message),
            _ => None,
        }
    }

    /// Names of steps with the given status, in execution order
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, s)| s.status == status)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
