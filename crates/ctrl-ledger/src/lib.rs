//! # ctrl-ledger
//!
//! Durable record of every intercepted tool call: the request as proposed,
//! each decision made about it, and an append-only timeline of events.
//!
//! ## Key invariants
//!
//! - **Intent is immutable**: server, tool, env, arguments and their hash
//!   never change after insert; SQLite triggers reject such updates.
//! - **Nothing is deleted**: decision and event rows are never updated or
//!   removed, and requests are never removed.
//! - **One winner per transition**: [`Ledger::transition`] is a
//!   compare-and-set on the current status, so duplicate resolutions of the
//!   same request perform their side effect at most once.
//! - **Every transition leaves an event** in the same transaction as the
//!   status change.

pub mod error;
pub mod hasher;
pub mod record;
pub mod schema;
pub mod status;
pub mod store;

pub use error::LedgerError;
pub use hasher::{canonical_json, hash_args, hash_bytes};
pub use record::{
    DecisionRecord, EventKind, EventRecord, NewDecision, NewIntent, RequestRecord, Transition,
};
pub use status::{DecisionOutcome, RequestStatus, UnknownVariant};
pub use store::{clamp_limit, Ledger, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT};
