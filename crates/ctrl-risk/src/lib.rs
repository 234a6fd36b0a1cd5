//! # ctrl-risk
//!
//! Risk assessment for intercepted tool calls.
//!
//! Two pieces live here:
//!
//! - [`expr`]: a small, closed expression language used by every
//!   configuration-supplied predicate (`risk.mode in ['review', 'danger']`,
//!   `score >= 70`). Parsing and evaluation have no access to I/O, host
//!   functions, or mutable state.
//! - [`RiskEngine`]: applies ordered risk rules to a [`ToolCall`] and
//!   returns a mode and score that always agree after reconciliation.
//!
//! ## Key invariants
//!
//! - **Never fatal**: a broken rule is skipped and reported, scoring still
//!   produces a result.
//! - **Escalation is monotonic**: `escalate` never lowers the mode and never
//!   goes past the most severe one.
//! - **Bounded scores**: the final score is always within `0..=100`.

pub mod call;
pub mod config;
pub mod engine;
pub mod error;
pub mod expr;
pub mod pattern;

pub use call::ToolCall;
pub use config::{
    load_risk_config, ArgPredicate, Escalation, ModeDef, RiskConfig, RiskDocument, RiskRule,
    VarDef, When,
};
pub use engine::{RiskEngine, RiskResult, RuleDiagnostic, MAX_SCORE, MIN_SCORE, RESERVED_NAMES};
pub use error::{ExprError, RiskError};
pub use expr::{evaluate, Context, Expr, Value};
pub use pattern::{wildcard_matches, Wildcard};
