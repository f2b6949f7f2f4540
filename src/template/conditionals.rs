//! Branch condition evaluation
//!
//! A condition set is an OR over AND-groups of operator comparisons, plus an
//! optional boolean expression. When both are given, both must hold.

use super::context::Scope;
use super::engine::VariableResolver;
use super::errors::TemplateError;
use crate::config::{BranchCondition, BranchSettings, ConditionOperator};
use regex::RegexBuilder;
use serde_json::Value;

/// Evaluate a condition set against a scope
///
/// An empty set is false.
pub fn evaluate_conditions(
    settings: &BranchSettings,
    resolver: &VariableResolver,
    scope: &Scope,
) -> Result<bool, TemplateError> {
    if settings.is_empty() {
        return Ok(false);
    }

    let groups: Vec<&Vec<BranchCondition>> = settings
        .conditions
        .iter()
        .filter(|group| !group.is_empty())
        .collect();

    let mut groups_hold = groups.is_empty();
    for group in groups {
        let mut all = true;
        for condition in group {
            if !evaluate_condition(condition, resolver, scope)? {
                all = false;
                break;
            }
        }
        if all {
            groups_hold = true;
            break;
        }
    }
    if !groups_hold {
        return Ok(false);
    }

    match settings.expression.as_deref() {
        Some(expr) => resolver.evaluate_bool(expr, scope),
        None => Ok(true),
    }
}

/// Resolve both operands and apply the operator
pub fn evaluate_condition(
    condition: &BranchCondition,
    resolver: &VariableResolver,
    scope: &Scope,
) -> Result<bool, TemplateError> {
    let first = resolver.resolve(&condition.first_value, scope)?;
    let second = resolver.resolve(&condition.second_value, scope)?;
    compare(condition.operator, &first, &second, condition.case_sensitive)
}

/// Apply an operator to two resolved values
pub fn compare(
    operator: ConditionOperator,
    first: &Value,
    second: &Value,
    case_sensitive: bool,
) -> Result<bool, TemplateError> {
    use ConditionOperator::*;

    let text = |v: &Value| {
        let s = as_text(v);
        if case_sensitive { s } else { s.to_lowercase() }
    };

    let result = match operator {
        TextContains => text(first).contains(&text(second)),
        TextDoesNotContain => !text(first).contains(&text(second)),
        TextExactlyMatches => text(first) == text(second),
        TextDoesNotExactlyMatch => text(first) != text(second),
        TextStartsWith => text(first).starts_with(&text(second)),
        TextEndsWith => text(first).ends_with(&text(second)),
        TextMatchesRegex => {
            let pattern = as_text(second);
            let regex = RegexBuilder::new(&pattern)
                .case_insensitive(!case_sensitive)
                .build()
                .map_err(|e| TemplateError::expression(format!("invalid regex '{}': {}", pattern, e)))?;
            regex.is_match(&as_text(first))
        }
        NumberIsGreaterThan => numbers(first, second)?.is_some_and(|(a, b)| a > b),
        NumberIsLessThan => numbers(first, second)?.is_some_and(|(a, b)| a < b),
        NumberIsEqualTo => numbers(first, second)?.is_some_and(|(a, b)| a == b),
        BooleanIsTrue => boolean(first)? == Some(true),
        BooleanIsFalse => boolean(first)? == Some(false),
        Exists => exists(first),
        DoesNotExist => !exists(first),
        ListIsEmpty => as_list(first)?.is_empty(),
        ListIsNotEmpty => !as_list(first)?.is_empty(),
        ListContains => as_list(first)?
            .iter()
            .any(|item| values_equal(item, second, case_sensitive)),
    };

    Ok(result)
}

/// Strings raw, null empty, everything else compact JSON
fn as_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn as_number(value: &Value) -> Result<f64, TemplateError> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.ok_or_else(|| TemplateError::type_mismatch("number", type_name(value)))
}

/// Both operands as numbers; `None` when either is absent
fn numbers(first: &Value, second: &Value) -> Result<Option<(f64, f64)>, TemplateError> {
    if !exists(first) || !exists(second) {
        return Ok(None);
    }
    Ok(Some((as_number(first)?, as_number(second)?)))
}

/// Absent values are neither true nor false
fn boolean(value: &Value) -> Result<Option<bool>, TemplateError> {
    if !exists(value) {
        return Ok(None);
    }
    as_bool(value).map(Some)
}

fn as_bool(value: &Value) -> Result<bool, TemplateError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(TemplateError::type_mismatch("boolean", type_name(other))),
    }
}

/// Null counts as an empty list
fn as_list(value: &Value) -> Result<&[Value], TemplateError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(&[]),
        other => Err(TemplateError::type_mismatch("list", type_name(other))),
    }
}

fn exists(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn values_equal(a: &Value, b: &Value, case_sensitive: bool) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) if !case_sensitive => {
            x.to_lowercase() == y.to_lowercase()
        }
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_number(a), as_number(b)) {
            (Ok(x), Ok(y)) => x == y,
            _ => a == b,
        },
        _ => a == b,
    }
}
