//! Condition rules for branching.
//!
//! A rule is a small boolean expression over two maps, `businessData` and
//! `passData`:
//!
//! ```text
//! businessData.amount >= 100 && !passData.flagged
//! businessData.name.len() > 4 or businessData.tags.contains('vip')
//! {{region}} == 'emea'
//! ```
//!
//! The result must be a real boolean. Nothing is coerced: a rule that resolves
//! to `1`, or `1 && true`, is a `TypeConversion` error.

mod error;
mod eval;
mod lexer;
mod parser;

pub use error::ConditionError;

use streamflow_types::DataMap;

use eval::Scope;
use parser::Expr;

/// A parsed rule, ready to evaluate any number of times.
#[derive(Debug, Clone)]
pub struct Rule {
    source: String,
    expr: Expr,
}

impl Rule {
    /// Tokenize and parse `source`. Fails only with `ConditionError::Grammar`.
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = lexer::tokenize(source)?;
        let expr = parser::parse(source, tokens)?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against the two data maps. The result must be a boolean.
    pub fn evaluate(&self, business: &DataMap, pass: &DataMap) -> Result<bool, ConditionError> {
        let scope = Scope {
            rule: &self.source,
            business,
            pass,
        };
        scope.boolean(&self.expr, "rule result")
    }
}

/// Parse and evaluate `rule` in one step.
pub fn evaluate(rule: &str, business: &DataMap, pass: &DataMap) -> Result<bool, ConditionError> {
    Rule::parse(rule)?.evaluate(business, pass)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
