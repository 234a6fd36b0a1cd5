// error.rs - Error types for the policy subsystem.

use ctrl_risk::ExprError;
use thiserror::Error;

/// Errors that can occur while loading or compiling a policy.
///
/// A policy that fails to compile is rejected as a whole: dropping one rule
/// would silently change which rule matches first.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Two rules share an id.
    #[error("duplicate policy id '{id}'")]
    DuplicateId { id: String },

    /// A rule has an empty id.
    #[error("policy at index {index} has an empty id")]
    EmptyId { index: usize },

    /// A match field is not a valid wildcard.
    #[error("policy '{policy_id}': invalid {field} pattern '{pattern}': {reason}")]
    InvalidPattern {
        policy_id: String,
        field: &'static str,
        pattern: String,
        reason: String,
    },

    /// A guard expression does not parse.
    #[error("policy '{policy_id}': invalid {guard} guard: {source}")]
    InvalidGuard {
        policy_id: String,
        guard: &'static str,
        #[source]
        source: ExprError,
    },

    /// A policy or fixture file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A policy or fixture file is not valid YAML for the expected shape.
    #[error("failed to parse policy document: {0}")]
    Parse(#[from] serde_yaml::Error),
}
