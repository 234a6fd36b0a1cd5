// status.rs - Request lifecycle state machine and decision outcomes.
//
// The state machine enforces a valid lifecycle:
//   Proposed → Allowed | Denied | Held
//   Held     → Approved | Denied          (human resolution, first one wins)
//   Allowed  → Executing                  (adapter asked the engine to forward)
//   Approved → Executing → Executed | Failed
//
// Proposed is never written durably: risk and policy run before the first
// insert, so a stored request starts at Allowed, Denied or Held.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A string from the database did not name a known variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Intent captured, not yet decided. Transient.
    Proposed,
    /// Policy allowed the call; the adapter forwards it.
    Allowed,
    /// Denied by policy or by a human. Terminal.
    Denied,
    /// Waiting for a human.
    Held,
    /// A human approved; replay has not started yet.
    Approved,
    /// Dispatched to the external action server, no result yet.
    Executing,
    /// The external call succeeded. Terminal.
    Executed,
    /// The external call failed or timed out. Terminal.
    Failed,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 8] = [
        RequestStatus::Proposed,
        RequestStatus::Allowed,
        RequestStatus::Denied,
        RequestStatus::Held,
        RequestStatus::Approved,
        RequestStatus::Executing,
        RequestStatus::Executed,
        RequestStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Proposed => "proposed",
            RequestStatus::Allowed => "allowed",
            RequestStatus::Denied => "denied",
            RequestStatus::Held => "held",
            RequestStatus::Approved => "approved",
            RequestStatus::Executing => "executing",
            RequestStatus::Executed => "executed",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Denied | RequestStatus::Executed | RequestStatus::Failed
        )
    }

    /// States where an external dispatch may be in flight. A request stuck
    /// here past the staleness window needs an operator.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, RequestStatus::Approved | RequestStatus::Executing)
    }

    /// Check whether moving from this state to `next` is a legal edge.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (RequestStatus::Proposed, RequestStatus::Allowed)
                | (RequestStatus::Proposed, RequestStatus::Denied)
                | (RequestStatus::Proposed, RequestStatus::Held)
                | (RequestStatus::Held, RequestStatus::Approved)
                | (RequestStatus::Held, RequestStatus::Denied)
                | (RequestStatus::Allowed, RequestStatus::Executing)
                | (RequestStatus::Approved, RequestStatus::Executing)
                | (RequestStatus::Executing, RequestStatus::Executed)
                | (RequestStatus::Executing, RequestStatus::Failed)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        // Rows written before the rename use `pending` for held.
        if wanted == "pending" {
            return Ok(RequestStatus::Held);
        }
        RequestStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or(UnknownVariant {
                kind: "request status",
                value: s.to_string(),
            })
    }
}

/// Verdict stored on a decision row. The first decision of a request is
/// `allow`, `deny` or `hold`; a human resolution adds `approved` or `denied`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Allow,
    Deny,
    Hold,
    Approved,
    Denied,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::Allow => "allow",
            DecisionOutcome::Deny => "deny",
            DecisionOutcome::Hold => "hold",
            DecisionOutcome::Approved => "approved",
            DecisionOutcome::Denied => "denied",
        }
    }

    /// Status a request enters when this is its first decision.
    pub fn initial_status(&self) -> Option<RequestStatus> {
        match self {
            DecisionOutcome::Allow => Some(RequestStatus::Allowed),
            DecisionOutcome::Deny => Some(RequestStatus::Denied),
            DecisionOutcome::Hold => Some(RequestStatus::Held),
            DecisionOutcome::Approved | DecisionOutcome::Denied => None,
        }
    }
}

impl fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionOutcome {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(DecisionOutcome::Allow),
            "deny" => Ok(DecisionOutcome::Deny),
            "hold" | "pending" => Ok(DecisionOutcome::Hold),
            "approved" => Ok(DecisionOutcome::Approved),
            "denied" => Ok(DecisionOutcome::Denied),
            other => Err(UnknownVariant {
                kind: "decision",
                value: other.to_string(),
            }),
        }
    }
}
