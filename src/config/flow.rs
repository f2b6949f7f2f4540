//! Flow version and step configuration

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::LazyLock;

static STEP_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid step name regex"));

/// Step type tag, as it appears in persisted flows and step outputs
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    TriggerEmpty,
    TriggerBlock,
    ActionBlock,
    ActionCode,
    Branch,
    Split,
    LoopOnItems,
}

impl StepType {
    pub fn is_trigger(&self) -> bool {
        matches!(self, StepType::TriggerEmpty | StepType::TriggerBlock)
    }
}

/// A single toggle in `errorHandlingOptions`
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Toggle {
    #[serde(default)]
    pub value: bool,

    /// Hidden options are not applicable to the step
    #[serde(default)]
    pub hidden: bool,
}

impl Toggle {
    pub fn enabled(value: bool) -> Self {
        Self {
            value,
            hidden: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.value && !self.hidden
    }
}

/// Per-step failure handling
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandlingOptions {
    pub continue_on_failure: Option<Toggle>,
    pub retry_on_failure: Option<Toggle>,
}

impl ErrorHandlingOptions {
    pub fn continue_on_failure(&self) -> bool {
        self.continue_on_failure.is_some_and(|t| t.is_enabled())
    }

    pub fn retry_on_failure(&self) -> bool {
        self.retry_on_failure.is_some_and(|t| t.is_enabled())
    }
}

/// Settings for an ACTION_BLOCK step
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSettings {
    pub block_name: String,
    pub action_name: String,

    /// Input template, resolved before the action runs
    #[serde(default)]
    pub input: Value,

    #[serde(default)]
    pub error_handling_options: ErrorHandlingOptions,
}

/// Settings for an ACTION_CODE step
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSettings {
    pub source_code: String,

    #[serde(default)]
    pub input: Value,

    #[serde(default)]
    pub error_handling_options: ErrorHandlingOptions,
}

/// Settings for a TRIGGER_BLOCK step
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSettings {
    pub block_name: String,
    pub trigger_name: String,

    #[serde(default)]
    pub input: Value,
}

/// Comparison applied by a branch condition
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionOperator {
    TextContains,
    TextDoesNotContain,
    TextExactlyMatches,
    TextDoesNotExactlyMatch,
    TextStartsWith,
    TextEndsWith,
    TextMatchesRegex,
    NumberIsGreaterThan,
    NumberIsLessThan,
    NumberIsEqualTo,
    BooleanIsTrue,
    BooleanIsFalse,
    Exists,
    DoesNotExist,
    ListIsEmpty,
    ListIsNotEmpty,
    ListContains,
}

/// One comparison; values are templates resolved against the context
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchCondition {
    #[serde(default)]
    pub first_value: Value,

    pub operator: ConditionOperator,

    #[serde(default)]
    pub second_value: Value,

    #[serde(default)]
    pub case_sensitive: bool,
}

/// Condition set: OR over AND-groups, optionally with a boolean expression
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchSettings {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Vec<BranchCondition>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

impl BranchSettings {
    pub fn is_empty(&self) -> bool {
        self.expression.is_none() && self.conditions.iter().all(|group| group.is_empty())
    }
}

/// Which matching split branches run
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SplitExecution {
    #[default]
    ExecuteAllMatch,
    ExecuteFirstMatch,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitSettings {
    #[serde(default)]
    pub execution_type: SplitExecution,

    /// Worker pool size for taken branches (engine default if unset)
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SplitBranchType {
    #[default]
    Condition,
    /// Taken only when no condition branch is
    Fallback,
}

/// One branch of a SPLIT step
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitBranch {
    pub name: String,

    #[serde(default)]
    pub branch_type: SplitBranchType,

    #[serde(flatten)]
    pub condition: BranchSettings,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<Box<Step>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopSettings {
    /// Template resolving to the list to iterate
    #[serde(default)]
    pub items: Value,

    /// Run iterations through the worker pool instead of one by one
    #[serde(default)]
    pub parallel: bool,

    pub concurrency: Option<usize>,
}

/// Step kind with its settings and structural links
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    TriggerEmpty,
    TriggerBlock {
        settings: TriggerSettings,
    },
    ActionBlock {
        settings: BlockSettings,
    },
    ActionCode {
        settings: CodeSettings,
    },
    Branch {
        settings: BranchSettings,
        #[serde(rename = "onSuccessAction", default, skip_serializing_if = "Option::is_none")]
        on_success_action: Option<Box<Step>>,
        #[serde(rename = "onFailureAction", default, skip_serializing_if = "Option::is_none")]
        on_failure_action: Option<Box<Step>>,
    },
    Split {
        #[serde(default)]
        settings: SplitSettings,
        #[serde(default)]
        branches: Vec<SplitBranch>,
    },
    LoopOnItems {
        settings: LoopSettings,
        #[serde(rename = "firstLoopAction", default, skip_serializing_if = "Option::is_none")]
        first_loop_action: Option<Box<Step>>,
    },
}

/// A node in the flow graph
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Step name (unique within the flow version, referenced as `{{name}}`)
    pub name: String,

    #[serde(default)]
    pub display_name: String,

    #[serde(flatten)]
    pub kind: StepKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<Box<Step>>,
}

impl Step {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            display_name: String::new(),
            kind,
            next_action: None,
        }
    }

    /// Append a step to the end of this step's sequential chain
    pub fn then(mut self, next: Step) -> Self {
        let chained = match self.next_action.take() {
            Some(existing) => (*existing).then(next),
            None => next,
        };
        self.next_action = Some(Box::new(chained));
        self
    }

    pub fn step_type(&self) -> StepType {
        match self.kind {
            StepKind::TriggerEmpty => StepType::TriggerEmpty,
            StepKind::TriggerBlock { .. } => StepType::TriggerBlock,
            StepKind::ActionBlock { .. } => StepType::ActionBlock,
            StepKind::ActionCode { .. } => StepType::ActionCode,
            StepKind::Branch { .. } => StepType::Branch,
            StepKind::Split { .. } => StepType::Split,
            StepKind::LoopOnItems { .. } => StepType::LoopOnItems,
        }
    }

    /// Failure handling for steps that have a single failure mode
    pub fn error_handling(&self) -> ErrorHandlingOptions {
        match &self.kind {
            StepKind::ActionBlock { settings } => settings.error_handling_options,
            StepKind::ActionCode { settings } => settings.error_handling_options,
            _ => ErrorHandlingOptions::default(),
        }
    }

    /// Direct children: structural links first, then the sequential successor
    pub fn children(&self) -> Vec<&Step> {
        let mut children: Vec<&Step> = Vec::new();
        match &self.kind {
            StepKind::Branch {
                on_success_action,
                on_failure_action,
                ..
            } => {
                children.extend(on_success_action.as_deref());
                children.extend(on_failure_action.as_deref());
            }
            StepKind::Split { branches, .. } => {
                children.extend(branches.iter().filter_map(|b| b.next_action.as_deref()));
            }
            StepKind::LoopOnItems {
                first_loop_action, ..
            } => children.extend(first_loop_action.as_deref()),
            _ => {}
        }
        children.extend(self.next_action.as_deref());
        children
    }

    /// Every step reachable from this one, depth first, including itself
    pub fn descendants(&self) -> Vec<&Step> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(step) = stack.pop() {
            out.push(step);
            for child in step.children().into_iter().rev() {
                stack.push(child);
            }
        }
        out
    }
}

/// Immutable snapshot of a flow's graph
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowVersion {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub display_name: String,

    pub trigger: Step,
}

impl FlowVersion {
    pub fn new(trigger: Step) -> Self {
        Self {
            id: String::new(),
            display_name: String::new(),
            trigger,
        }
    }

    /// Find a step anywhere in the graph
    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.trigger.descendants().into_iter().find(|s| s.name == name)
    }

    /// Names of all steps, trigger first
    pub fn step_names(&self) -> Vec<&str> {
        self.trigger
            .descendants()
            .into_iter()
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Validate the flow graph
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.trigger.step_type().is_trigger() {
            errors.push(format!(
                "first step '{}' must be a trigger",
                self.trigger.name
            ));
        }

        let mut seen_names = HashSet::new();
        for step in self.trigger.descendants() {
            if !seen_names.insert(step.name.as_str()) {
                errors.push(format!("duplicate step name: {}", step.name));
            }
            if !STEP_NAME.is_match(&step.name) {
                errors.push(format!(
                    "step name '{}' must start with a letter or underscore and contain only letters, digits and underscores",
                    step.name
                ));
            }
            if step.step_type().is_trigger() && !std::ptr::eq(step, &self.trigger) {
                errors.push(format!(
                    "trigger step '{}' can only be the first step",
                    step.name
                ));
            }

            match &step.kind {
                StepKind::TriggerEmpty => {}
                StepKind::TriggerBlock { settings } => {
                    if settings.block_name.is_empty() || settings.trigger_name.is_empty() {
                        errors.push(format!(
                            "trigger '{}' missing 'blockName' or 'triggerName'",
                            step.name
                        ));
                    }
                }
                StepKind::ActionBlock { settings } => {
                    if settings.block_name.is_empty() || settings.action_name.is_empty() {
                        errors.push(format!(
                            "block step '{}' missing 'blockName' or 'actionName'",
                            step.name
                        ));
                    }
                }
                StepKind::ActionCode { settings } => {
                    if settings.source_code.trim().is_empty() {
                        errors.push(format!("code step '{}' missing 'sourceCode'", step.name));
                    }
                }
                StepKind::Branch { settings, .. } => {
                    if settings.is_empty() {
                        errors.push(format!("branch step '{}' has no conditions", step.name));
                    }
                }
                StepKind::Split { branches, .. } => {
                    let mut branch_names = HashSet::new();
                    for branch in branches {
                        if branch.name.trim().is_empty() {
                            errors.push(format!("split step '{}' has an unnamed branch", step.name));
                        } else if !branch_names.insert(branch.name.as_str()) {
                            errors.push(format!(
                                "split step '{}' has duplicate branch '{}'",
                                step.name, branch.name
                            ));
                        }
                    }
                    let fallbacks = branches
                        .iter()
                        .filter(|b| b.branch_type == SplitBranchType::Fallback)
                        .count();
                    if fallbacks > 1 {
                        errors.push(format!(
                            "split step '{}' has {} fallback branches, at most one allowed",
                            step.name, fallbacks
                        ));
                    }
                }
                StepKind::LoopOnItems { .. } => {}
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
