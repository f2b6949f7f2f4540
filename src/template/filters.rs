//! Filters available in step input expressions
//!
//! Filters see step data after JSON conversion, so null means "absent" and
//! text helpers treat it as the empty string.

use super::context::to_json;
use chrono::{DateTime, Utc};
use minijinja::value::Value;
use minijinja::{Error, ErrorKind, State};

pub fn register_filters(env: &mut minijinja::Environment) {
    env.add_filter("json", json);
    env.add_filter("join", join);
    env.add_filter("first", first);
    env.add_filter("last", last);
    env.add_filter("default", default);
    env.add_filter("trim", trim);
    env.add_filter("lines", lines);
    env.add_filter("strftime", strftime);
}

fn invalid(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidOperation, message.into())
}

fn is_absent(value: &Value) -> bool {
    value.is_undefined() || value.is_none()
}

/// Strings raw, absent as "", anything else as compact JSON
fn as_text(value: &Value) -> String {
    if is_absent(value) {
        return String::new();
    }
    match value.as_str() {
        Some(s) => s.to_string(),
        None => to_json(value).to_string(),
    }
}

/// `{{ step.output | json }}`, or `json(2)` for indented output
fn json(_state: &State, value: Value, indent: Option<usize>) -> Result<Value, Error> {
    let data = to_json(&value);
    let text = match indent {
        Some(_) => serde_json::to_string_pretty(&data),
        None => serde_json::to_string(&data),
    }
    .map_err(|e| invalid(format!("cannot serialize to JSON: {}", e)))?;
    Ok(Value::from(text))
}

/// Join list items with a separator (default ", ")
fn join(_state: &State, value: Value, separator: Option<String>) -> Result<Value, Error> {
    let separator = separator.as_deref().unwrap_or(", ");
    if is_absent(&value) {
        return Ok(Value::from(""));
    }
    let joined = match value.try_iter() {
        Ok(items) => items
            .map(|item| as_text(&item))
            .collect::<Vec<_>>()
            .join(separator),
        Err(_) => as_text(&value),
    };
    Ok(Value::from(joined))
}

/// First list item; absent for an empty or absent list
fn first(_state: &State, value: Value) -> Result<Value, Error> {
    if is_absent(&value) {
        return Ok(Value::from(()));
    }
    let mut items = value
        .try_iter()
        .map_err(|_| invalid("first expects a list"))?;
    Ok(items.next().unwrap_or_else(|| Value::from(())))
}

fn last(_state: &State, value: Value) -> Result<Value, Error> {
    if is_absent(&value) {
        return Ok(Value::from(()));
    }
    let items = value
        .try_iter()
        .map_err(|_| invalid("last expects a list"))?;
    Ok(items.last().unwrap_or_else(|| Value::from(())))
}

/// Fallback for absent values and empty strings
fn default(_state: &State, value: Value, fallback: Value) -> Result<Value, Error> {
    let empty = is_absent(&value) || value.as_str().is_some_and(str::is_empty);
    Ok(if empty { fallback } else { value })
}

fn trim(_state: &State, value: Value) -> Result<Value, Error> {
    Ok(Value::from(as_text(&value).trim()))
}

fn lines(_state: &State, value: Value) -> Result<Value, Error> {
    Ok(Value::from_iter(as_text(&value).lines().map(Value::from)))
}

/// Format a point in time
///
/// Accepts `"now"`, an RFC3339 string, or Unix seconds.
/// Example: `{{ trigger.createdAt | strftime("%Y-%m-%d") }}`
fn strftime(_state: &State, value: Value, format: String) -> Result<Value, Error> {
    let at: DateTime<Utc> = match to_json(&value) {
        serde_json::Value::String(s) if s == "now" => Utc::now(),
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .map_err(|e| invalid(format!("cannot parse '{}' as RFC3339: {}", s, e)))?
            .with_timezone(&Utc),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| invalid(format!("{} is not a valid Unix timestamp", n)))?,
        other => {
            return Err(invalid(format!(
                "strftime expects \"now\", an RFC3339 string or Unix seconds, got {}",
                other
            )));
        }
    };
    Ok(Value::from(at.format(&format).to_string()))
}
