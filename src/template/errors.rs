//! Resolver error types with typo suggestions

use thiserror::Error;

/// Template resolution errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TemplateError {
    /// Referenced name matches no step in scope
    #[error("undefined variable '{name}'{}", .suggestion.as_ref().map(|s| format!(", did you mean '{}'?", s)).unwrap_or_default())]
    UndefinedVariable {
        name: String,
        suggestion: Option<String>,
    },

    /// Expression could not be parsed
    #[error("invalid expression '{expression}': {message}")]
    SyntaxError { expression: String, message: String },

    /// Filter execution error
    #[error("filter '{filter}' failed: {message}")]
    FilterError { filter: String, message: String },

    /// Operand of a condition has the wrong type
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Expression evaluation error
    #[error("expression error: {message}")]
    ExpressionError { message: String },
}

impl TemplateError {
    /// Create an undefined variable error with optional suggestion
    pub fn undefined_variable(name: impl Into<String>, known_vars: &[&str]) -> Self {
        let name = name.into();
        let suggestion = suggest_correction(&name, known_vars);
        Self::UndefinedVariable { name, suggestion }
    }

    pub fn syntax(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SyntaxError {
            expression: expression.into(),
            message: message.into(),
        }
    }

    pub fn filter(filter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FilterError {
            filter: filter.into(),
            message: message.into(),
        }
    }

    pub fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn expression(message: impl Into<String>) -> Self {
        Self::ExpressionError {
            message: message.into(),
        }
    }

    /// Build from a minijinja error raised while compiling or evaluating `expression`
    pub(crate) fn from_minijinja(expression: &str, err: minijinja::Error) -> Self {
        use minijinja::ErrorKind;

        match err.kind() {
            ErrorKind::SyntaxError => Self::syntax(expression, err.to_string()),
            ErrorKind::UnknownFilter | ErrorKind::InvalidOperation => {
                Self::filter(expression, err.to_string())
            }
            _ => Self::expression(format!("{}: {}", expression, err)),
        }
    }
}

/// Closest candidate to a misspelled step name
///
/// Case-only differences win outright. Otherwise the nearest name by edit
/// distance, within half the typo's length (at least 2); ties keep the
/// earlier candidate.
pub fn suggest_correction(typo: &str, candidates: &[&str]) -> Option<String> {
    if let Some(exact) = candidates.iter().find(|c| c.eq_ignore_ascii_case(typo)) {
        return Some(exact.to_string());
    }

    let limit = (typo.chars().count() / 2).max(2);
    candidates
        .iter()
        .map(|c| (edit_distance(typo, c), *c))
        .filter(|(distance, _)| *distance <= limit)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, name)| name.to_string())
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = diagonal + usize::from(ca != *cb);
            diagonal = row[j + 1];
            row[j + 1] = substitution.min(row[j] + 1).min(diagonal + 1);
        }
    }

    row[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("trigger", "tirgger"), 2);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("abc", ""), 3);
        assert_eq!(edit_distance("step_1", "step_1"), 0);
    }

    #[test]
    fn test_suggest_step_names() {
        let steps = ["trigger", "approve", "send_email", "each_order"];

        assert_eq!(suggest_correction("tirgger", &steps), Some("trigger".into()));
        assert_eq!(suggest_correction("send_emial", &steps), Some("send_email".into()));
        assert_eq!(suggest_correction("Each_Order", &steps), Some("each_order".into()));
        assert_eq!(suggest_correction("completely_different", &steps), None);
        assert_eq!(suggest_correction("anything", &[]), None);
    }

    #[test]
    fn test_nearest_candidate_wins() {
        let steps = ["step_10", "step_1"];
        assert_eq!(suggest_correction("step_2", &steps), Some("step_1".into()));
        assert_eq!(suggest_correction("step_3", &["step_1", "step_2"]), Some("step_1".into()));
    }

    #[test]
    fn test_error_display() {
        let err = TemplateError::undefined_variable("tirgger", &["trigger", "approve"]);
        let msg = err.to_string();
        assert!(msg.contains("undefined variable 'tirgger'"));
        assert!(msg.contains("did you mean 'trigger'"));

        let err = TemplateError::syntax("a +", "unexpected end of input");
        assert_eq!(
            err.to_string(),
            "invalid expression 'a +': unexpected end of input"
        );
    }

    #[test]
    fn test_filter_failures_are_classified() {
        let mut env = minijinja::Environment::new();
        crate::template::filters::register_filters(&mut env);
        let expr = "flag | strftime('%Y')";
        let err = env
            .compile_expression(expr)
            .unwrap()
            .eval(minijinja::context! { flag => true })
            .unwrap_err();
        assert!(matches!(
            TemplateError::from_minijinja(expr, err),
            TemplateError::FilterError { .. }
        ));
    }
}
