//! # ctrl-gateway
//!
//! Ties the engines and the ledger together for agent adapters and operators.
//!
//! - [`Gateway::intercept`] scores, decides and records every incoming tool
//!   call and tells the adapter to allow, deny or hold it.
//! - [`ApprovalCoordinator`] lists held requests, resolves them and replays
//!   approved calls against the external action server.
//! - [`EngineSet`] is one immutable configuration generation; reloads swap
//!   it atomically.
//!
//! ## Key invariants
//!
//! - **At most one dispatch per request**: every dispatch is preceded by a
//!   committed `-> executing` compare-and-set.
//! - **No lock across I/O**: the ledger is never locked while an external
//!   call is in flight.
//! - **No automatic retry**: failures and timeouts are terminal `failed`.

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod engines;
pub mod error;
pub mod execute;
pub mod intercept;

pub use config::{
    load_servers_config, ApprovalsConfig, CtrlConfig, DispatchConfig, HttpConfig, RecoveryConfig,
    ServerDef, ServersConfig, Transport, DEFAULT_CONFIG_FILE,
};
pub use coordinator::{
    ApprovalCoordinator, RequestView, Resolution, ResolveOutcome, StaleAlert, DEFAULT_APPROVER,
};
pub use dispatch::{ActionDispatcher, HttpDispatcher, PROTOCOL_VERSION};
pub use engines::{EngineSet, Explanation};
pub use error::{CoordinatorError, DispatchError, GatewayError};
pub use execute::{preview, PREVIEW_CHARS};
pub use intercept::{Gateway, InterceptOutcome};
