//! Variable resolver for step inputs

use super::context::{Scope, to_json, value_as_bool};
use super::errors::TemplateError;
use super::filters;
use minijinja::{Environment, UndefinedBehavior};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{\{(.*?)\}\}").expect("valid token regex"));

static ROOT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)").expect("valid root regex"));

/// Names that are part of the expression language, not references
const KEYWORDS: &[&str] = &["true", "false", "none", "True", "False", "None", "not"];

/// Resolves `{{ expr }}` tokens in JSON templates
///
/// Wraps minijinja with custom filters and chainable undefined handling, so
/// a missing step, attribute or index resolves to null.
pub struct VariableResolver {
    env: Environment<'static>,
}

impl Default for VariableResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableResolver {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        filters::register_filters(&mut env);
        Self { env }
    }

    /// Resolve every token in a template tree
    ///
    /// A string that is exactly one token keeps the token's JSON type. Text
    /// around tokens makes the result a string. Object keys are untouched.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let resolver = VariableResolver::new();
    /// let input = json!({"to": "{{trigger.email}}", "subject": "Order #{{trigger.id}}"});
    /// let resolved = resolver.resolve(&input, &scope)?;
    /// ```
    pub fn resolve(&self, template: &Value, scope: &Scope) -> Result<Value, TemplateError> {
        match template {
            Value::String(s) => self.resolve_str(s, scope),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve(v, scope)?)))
                .collect::<Result<serde_json::Map<_, _>, _>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Resolve a single string
    pub fn resolve_str(&self, s: &str, scope: &Scope) -> Result<Value, TemplateError> {
        if !s.contains("{{") {
            return Ok(Value::String(s.to_string()));
        }

        let trimmed = s.trim();
        let whole = TOKEN
            .captures(trimmed)
            .filter(|caps| caps.get(0).is_some_and(|m| m.len() == trimmed.len()));
        if let Some(caps) = whole {
            return self.evaluate(&caps[1], scope);
        }

        let mut out = String::with_capacity(s.len());
        let mut last = 0;
        for caps in TOKEN.captures_iter(s) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&s[last..whole.start()]);
            match self.evaluate(&caps[1], scope)? {
                Value::Null => {}
                Value::String(text) => out.push_str(&text),
                other => out.push_str(&other.to_string()),
            }
            last = whole.end();
        }
        out.push_str(&s[last..]);
        Ok(Value::String(out))
    }

    /// Evaluate one expression (without braces)
    pub fn evaluate(&self, expr: &str, scope: &Scope) -> Result<Value, TemplateError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Ok(Value::Null);
        }

        let compiled = self
            .env
            .compile_expression(expr)
            .map_err(|e| TemplateError::from_minijinja(expr, e))?;
        let value = compiled
            .eval(scope.to_value())
            .map_err(|e| TemplateError::from_minijinja(expr, e))?;

        Ok(to_json(&value))
    }

    /// Evaluate a boolean expression, with or without surrounding braces
    pub fn evaluate_bool(&self, expr: &str, scope: &Scope) -> Result<bool, TemplateError> {
        let expr = expr.trim();
        let inner = TOKEN
            .captures(expr)
            .filter(|caps| caps.get(0).is_some_and(|m| m.len() == expr.len()))
            .and_then(|caps| caps.get(1))
            .map_or(expr, |m| m.as_str())
            .trim();
        if inner.is_empty() {
            return Ok(false);
        }

        let compiled = self
            .env
            .compile_expression(inner)
            .map_err(|e| TemplateError::from_minijinja(inner, e))?;
        let value = compiled
            .eval(scope.to_value())
            .map_err(|e| TemplateError::from_minijinja(inner, e))?;

        Ok(value_as_bool(&value))
    }

    /// Check that every token in a template parses
    pub fn validate(&self, template: &Value) -> Result<(), TemplateError> {
        for expr in tokens(template) {
            self.env
                .compile_expression(&expr)
                .map_err(|e| TemplateError::from_minijinja(&expr, e))?;
        }
        Ok(())
    }
}

/// Expressions of every token in a template tree, in document order
pub fn tokens(template: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_tokens(template, &mut out);
    out
}

fn collect_tokens(template: &Value, out: &mut Vec<String>) {
    match template {
        Value::String(s) => out.extend(
            TOKEN
                .captures_iter(s)
                .map(|caps| caps[1].trim().to_string()),
        ),
        Value::Array(items) => items.iter().for_each(|v| collect_tokens(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_tokens(v, out)),
        _ => {}
    }
}

/// Root names referenced by a template that are not in `known`
///
/// Unknown references resolve to null at run time; this reports them early
/// with a suggestion.
pub fn unknown_references(template: &Value, known: &[&str]) -> Vec<TemplateError> {
    let mut errors: Vec<TemplateError> = Vec::new();
    for expr in tokens(template) {
        let Some(root) = ROOT_NAME.captures(&expr).map(|c| c[1].to_string()) else {
            continue;
        };
        if known.contains(&root.as_str()) || KEYWORDS.contains(&root.as_str()) {
            continue;
        }
        let error = TemplateError::undefined_variable(root, known);
        if !errors.contains(&error) {
            errors.push(error);
        }
    }
    errors
}
