// error.rs - Error types for the ledger.

use thiserror::Error;

use crate::status::{DecisionOutcome, RequestStatus, UnknownVariant};

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Database error from SQLite, including append-only trigger aborts.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A JSON column could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The database directory could not be created.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// No request with this id.
    #[error("unknown request id '{id}'")]
    UnknownRequestId { id: String },

    /// The compare-and-set lost: the request was no longer in `expected`.
    #[error("request '{id}' is {actual}, expected {expected}")]
    AlreadyResolved {
        id: String,
        expected: RequestStatus,
        actual: RequestStatus,
    },

    /// The edge is not part of the lifecycle.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },

    /// Human resolutions cannot be a request's first decision.
    #[error("'{decision}' cannot be the first decision of a request")]
    InvalidInitialDecision { decision: DecisionOutcome },

    /// A stored value did not parse.
    #[error("corrupt ledger row: {0}")]
    Corrupt(#[from] UnknownVariant),

    /// Another thread panicked while holding the connection.
    #[error("ledger connection lock poisoned")]
    LockPoisoned,
}
