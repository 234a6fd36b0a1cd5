// error.rs - Error types for expression evaluation and risk configuration.

use thiserror::Error;

/// Errors produced while parsing or evaluating a predicate expression.
///
/// None of these are fatal to request processing: the engines treat a
/// failing expression as a rule that does not fire and log the reason.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    /// The text is not a well-formed expression in the supported grammar.
    #[error("invalid expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    /// The expression referenced a context field that does not exist.
    #[error("unbound name '{name}'")]
    UnboundName { name: String },

    /// An operator was applied to values it does not support.
    #[error("type mismatch: {detail}")]
    TypeMismatch { detail: String },

    /// Division or modulo by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// A call to a function outside the whitelist.
    #[error("function '{name}' is not allowed")]
    UnknownFunction { name: String },
}

impl ExprError {
    pub(crate) fn invalid(expr: &str, reason: impl Into<String>) -> Self {
        ExprError::InvalidExpression {
            expr: expr.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn mismatch(detail: impl Into<String>) -> Self {
        ExprError::TypeMismatch {
            detail: detail.into(),
        }
    }
}

/// Errors that make a whole risk configuration unusable.
///
/// Defects inside a single rule are not errors; see
/// [`RiskEngine::diagnostics`](crate::RiskEngine::diagnostics).
#[derive(Debug, Error)]
pub enum RiskError {
    /// `risk.modes` is empty.
    #[error("risk.modes must declare at least one mode")]
    NoModes,

    /// Two modes share a baseline score, so their order is ambiguous.
    #[error("risk modes '{first}' and '{second}' share baseline score {score}")]
    AmbiguousModeOrder {
        first: String,
        second: String,
        score: i64,
    },

    /// `set_mode_by_score` names a mode that is not declared.
    #[error("set_mode_by_score references unknown mode '{mode}'")]
    UnknownThresholdMode { mode: String },

    /// A threshold expression failed to parse.
    #[error("set_mode_by_score.{mode}: {source}")]
    InvalidThreshold {
        mode: String,
        #[source]
        source: ExprError,
    },

    /// The risk document could not be read.
    #[error("failed to read risk config at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The risk document is not valid YAML for the expected shape.
    #[error("failed to parse risk config: {0}")]
    Parse(#[from] serde_yaml::Error),
}
