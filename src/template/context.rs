//! Resolver scope: step outputs visible to templates
//!
//! A scope is a stack of frames, outermost first. Each frame holds the step
//! map of one nesting level (the flow, or one loop iteration) and, inside a
//! loop, the current item and index. Lookups go innermost first.

use crate::workflow::{LoopOutput, OutputKind, StepOutput, StepOutputs};
use minijinja::value::{Enumerator, Object, Value, ValueKind};
use std::sync::Arc;

/// Current position of a loop iteration
#[derive(Debug, Clone, PartialEq)]
pub struct LoopCursor {
    pub item: serde_json::Value,
    pub index: usize,
}

impl LoopCursor {
    pub fn new(item: serde_json::Value, index: usize) -> Self {
        Self { item, index }
    }
}

#[derive(Debug, Clone)]
struct Frame {
    steps: Arc<StepOutputs>,
    cursor: Option<LoopCursor>,
}

/// Frames visible while resolving a step's input
#[derive(Debug, Clone, Default)]
pub struct Scope {
    frames: Vec<Frame>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope with a single frame
    pub fn of(steps: Arc<StepOutputs>) -> Self {
        Self::new().push(steps, None)
    }

    /// Return a new scope with an inner frame added
    pub fn push(&self, steps: Arc<StepOutputs>, cursor: Option<LoopCursor>) -> Self {
        let mut frames = self.frames.clone();
        frames.push(Frame { steps, cursor });
        Self { frames }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Innermost step with this name
    pub fn step(&self, name: &str) -> Option<&StepOutput> {
        self.frames.iter().rev().find_map(|f| f.steps.get(name))
    }

    /// Innermost loop position
    pub fn cursor(&self) -> Option<&LoopCursor> {
        self.frames.iter().rev().find_map(|f| f.cursor.as_ref())
    }

    /// Every name a template can start with
    pub fn known_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .frames
            .iter()
            .flat_map(|f| f.steps.keys().map(|k| k.as_str()))
            .collect();
        if self.cursor().is_some() {
            names.extend(["item", "index"]);
        }
        names
    }

    /// Convert to a minijinja Value for expression evaluation
    pub fn to_value(&self) -> Value {
        Value::from_object(ScopeObject(self.clone()))
    }
}

/// Root object of every expression
#[derive(Debug)]
struct ScopeObject(Scope);

impl Object for ScopeObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let name = key.as_str()?;
        if let Some(cursor) = self.0.cursor() {
            match name {
                "item" => return Some(Value::from_serialize(&cursor.item)),
                "index" => return Some(Value::from(cursor.index)),
                _ => {}
            }
        }
        self.0
            .step(name)
            .map(|step| Value::from_object(StepObject(step.clone())))
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Values(
            self.0
                .known_names()
                .into_iter()
                .map(|n| Value::from(n.to_string()))
                .collect(),
        )
    }
}

/// One step's record; unknown attributes read through to its output
#[derive(Debug)]
pub(crate) struct StepObject(pub(crate) StepOutput);

impl StepObject {
    fn output_value(&self) -> Value {
        match &self.0.kind {
            OutputKind::LoopOnItems { output } => {
                Value::from_object(LoopOutputObject(output.clone()))
            }
            OutputKind::Generic { output } => Value::from_serialize(output),
            _ => Value::from_serialize(self.0.output()),
        }
    }
}

impl Object for StepObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let explicit = match key.as_str() {
            Some("output") => Some(self.output_value()),
            Some("input") => Some(Value::from_serialize(&self.0.input)),
            Some("status") => Some(Value::from_serialize(self.0.status)),
            Some("errorMessage") => Some(Value::from(self.0.error_message.clone())),
            Some("duration") => Some(Value::from(self.0.duration)),
            Some("conditionEvaluation") => self.0.condition_evaluation().map(Value::from),
            Some("takenBranches") => self
                .0
                .taken_branches()
                .map(|b| Value::from_serialize(b)),
            _ => None,
        };
        if explicit.is_some() {
            return explicit;
        }

        self.output_value()
            .get_item(key)
            .ok()
            .filter(|v| !v.is_undefined())
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(&["output", "input", "status", "errorMessage", "duration"])
    }
}

/// Loop output with iterations exposed as step maps
#[derive(Debug)]
pub(crate) struct LoopOutputObject(pub(crate) LoopOutput);

impl Object for LoopOutputObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "item" => Some(Value::from_serialize(&self.0.item)),
            "index" => Some(Value::from(self.0.index)),
            "iterations" => Some(Value::from_iter(
                self.0
                    .iterations
                    .iter()
                    .map(|steps| Value::from_object(StepsObject(steps.clone()))),
            )),
            _ => None,
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(&["item", "index", "iterations"])
    }
}

/// Step map of one loop iteration
#[derive(Debug)]
pub(crate) struct StepsObject(pub(crate) StepOutputs);

impl Object for StepsObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let name = key.as_str()?;
        self.0
            .get(name)
            .map(|step| Value::from_object(StepObject(step.clone())))
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Values(self.0.keys().map(|k| Value::from(k.clone())).collect())
    }
}

/// Convert an evaluated value back to JSON
///
/// Step objects become their output, loop outputs and iteration maps their
/// serialized form. Undefined becomes null.
pub fn to_json(value: &Value) -> serde_json::Value {
    if value.is_undefined() || value.is_none() {
        return serde_json::Value::Null;
    }
    if let Some(step) = value.downcast_object_ref::<StepObject>() {
        return step.0.output();
    }
    if let Some(output) = value.downcast_object_ref::<LoopOutputObject>() {
        return serde_json::to_value(&output.0).unwrap_or_default();
    }
    if let Some(steps) = value.downcast_object_ref::<StepsObject>() {
        return serde_json::to_value(&steps.0).unwrap_or_default();
    }
    if value.downcast_object_ref::<ScopeObject>().is_some() {
        return serde_json::Value::Null;
    }

    match value.kind() {
        ValueKind::Seq | ValueKind::Iterable => match value.try_iter() {
            Ok(iter) => serde_json::Value::Array(iter.map(|v| to_json(&v)).collect()),
            Err(_) => serde_json::Value::Null,
        },
        ValueKind::Map => {
            let mut map = serde_json::Map::new();
            if let Ok(keys) = value.try_iter() {
                for key in keys {
                    let item = value.get_item(&key).unwrap_or_default();
                    map.insert(key.to_string(), to_json(&item));
                }
            }
            serde_json::Value::Object(map)
        }
        _ => serde_json::to_value(value).unwrap_or_default(),
    }
}

/// Truthiness used by branch expressions
pub fn value_as_bool(value: &Value) -> bool {
    match value.kind() {
        ValueKind::Bool => value.is_true(),
        ValueKind::String => value.as_str().is_some_and(|s| !s.is_empty()),
        ValueKind::Seq | ValueKind::Map => value.len().unwrap_or(0) > 0,
        ValueKind::None | ValueKind::Undefined => false,
        _ => value.is_true(),
    }
}
