//! Classified condition-evaluation errors.

/// Why a rule could not produce a boolean.
///
/// Every variant carries the rule text so a routing failure can be reported
/// without the caller keeping it around.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConditionError {
    /// The rule cannot be tokenized or is not well formed (`a..b`, `a &`,
    /// unbalanced parentheses).
    #[error("grammar error in rule `{rule}`: {message}")]
    Grammar { rule: String, message: String },

    /// The rule is well formed but a variable reference cannot be resolved.
    #[error("parse error in rule `{rule}`: {message}")]
    Parse { rule: String, message: String },

    /// A value has the wrong type, including a non-boolean final result.
    #[error("type conversion error in rule `{rule}`: {message}")]
    TypeConversion { rule: String, message: String },
}

impl ConditionError {
    pub fn grammar(rule: &str, message: impl Into<String>) -> Self {
        ConditionError::Grammar {
            rule: rule.to_string(),
            message: message.into(),
        }
    }

    pub fn parse(rule: &str, message: impl Into<String>) -> Self {
        ConditionError::Parse {
            rule: rule.to_string(),
            message: message.into(),
        }
    }

    pub fn type_conversion(rule: &str, message: impl Into<String>) -> Self {
        ConditionError::TypeConversion {
            rule: rule.to_string(),
            message: message.into(),
        }
    }

    /// Stable classification code reported with routing failures.
    pub fn code(&self) -> &'static str {
        match self {
            ConditionError::Grammar { .. } => "GRAMMAR_ERROR",
            ConditionError::Parse { .. } => "PARSE_ERROR",
            ConditionError::TypeConversion { .. } => "TYPE_CONVERSION_ERROR",
        }
    }

    pub fn rule(&self) -> &str {
        match self {
            ConditionError::Grammar { rule, .. }
            | ConditionError::Parse { rule, .. }
            | ConditionError::TypeConversion { rule, .. } => rule,
        }
    }
}
