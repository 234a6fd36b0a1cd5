//! # ctrl-policy
//!
//! Ordered, first-match policy evaluation for intercepted tool calls.
//!
//! A [`PolicyConfig`] is a list of rules, each matching server/tool/env by
//! wildcard and carrying an effect (`allow`, `deny`, `hold`). The
//! [`PolicyEngine`] turns a call plus its risk result into exactly one
//! [`PolicyDecision`].
//!
//! ## Key invariants
//!
//! - **First match wins**: a later rule never decides a call an earlier rule
//!   matched.
//! - **Default deny**: no matching rule → deny, with no policy id.
//! - **Guards fail closed**: a `deny` or `require_approval_if` guard that
//!   cannot be evaluated counts as satisfied.
//! - **Pure**: evaluation has no side effects, so `explain` and fixture runs
//!   are safe to repeat.

pub mod engine;
pub mod error;
pub mod fixtures;
pub mod lint;
pub mod rule;

pub use engine::{
    guard_context, EvaluationStep, EvaluationTrace, PolicyDecision, PolicyEngine, Verdict,
    GUARD_NAMES, NO_MATCH_REASON,
};
pub use error::PolicyError;
pub use fixtures::{
    load_fixtures, run_fixtures, Fixture, FixtureFile, FixtureInput, FixtureOutcome, FixtureReport,
};
pub use lint::{lint, LintFinding, LintOptions, LintReport, Severity};
pub use rule::{load_policy_config, Effect, PolicyConfig, PolicyMatch, PolicyRule};
