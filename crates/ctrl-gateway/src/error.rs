// error.rs - Error types for the gateway, the coordinator and dispatch.

use ctrl_ledger::{LedgerError, RequestStatus};
use ctrl_policy::PolicyError;
use ctrl_risk::RiskError;
use thiserror::Error;

/// Errors from loading configuration and running the intercept pipeline.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A settings or servers file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// `ctrl.toml` did not parse.
    #[error("invalid settings in {path}: {source}")]
    Settings {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    /// `servers.yaml` did not parse.
    #[error("invalid servers config: {0}")]
    Servers(#[from] serde_yaml::Error),

    /// Two servers share a name.
    #[error("duplicate server name '{name}'")]
    DuplicateServer { name: String },

    #[error("risk config error: {0}")]
    Risk(#[from] RiskError),

    #[error("policy config error: {0}")]
    Policy(#[from] PolicyError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Another thread panicked while swapping engine generations.
    #[error("engine generation lock poisoned")]
    LockPoisoned,
}

/// Operator-facing outcomes of resolving or replaying a request.
///
/// Only `AlreadyResolved` and `ExternalDispatchFailure` are abnormal
/// conditions; both leave the ledger consistent.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("unknown request id '{id}'")]
    UnknownRequestId { id: String },

    /// Another caller won the transition; this call performed no side effect.
    #[error("request '{id}' already resolved (status={status})")]
    AlreadyResolved { id: String, status: RequestStatus },

    /// The external action server failed or timed out. Recorded as `failed`.
    #[error("external dispatch failed: {message}")]
    ExternalDispatchFailure { message: String },

    #[error("ledger error: {0}")]
    Ledger(LedgerError),
}

impl From<LedgerError> for CoordinatorError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::UnknownRequestId { id } => CoordinatorError::UnknownRequestId { id },
            LedgerError::AlreadyResolved { id, actual, .. } => {
                CoordinatorError::AlreadyResolved { id, status: actual }
            }
            other => CoordinatorError::Ledger(other),
        }
    }
}

/// Failures talking to an external action server.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no server named '{name}' is configured")]
    UnknownServer { name: String },

    /// The server's `tools/list` does not offer the requested tool.
    #[error("server '{server}' has no tool named '{tool}'")]
    UnknownTool { server: String, tool: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a JSON-RPC error or a tool-level error.
    #[error("server error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("invalid response: {detail}")]
    InvalidResponse { detail: String },
}
