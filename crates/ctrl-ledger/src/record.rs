// record.rs - Rows of the three ledger tables and the inputs that create them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::status::{DecisionOutcome, RequestStatus};

/// A captured intent and its current lifecycle state.
///
/// Everything except `status`, `updated_at`, the risk fields and
/// `result_ref` is fixed at creation; the database rejects updates to the
/// argument payload and hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub server: String,
    pub tool: String,
    pub env: String,
    pub args: Value,
    pub args_hash: String,
    pub actor: Option<String>,
    pub status: RequestStatus,
    pub risk_mode: Option<String>,
    pub risk_score: Option<i64>,
    /// Id of the `tool.result` event holding the execution result.
    pub result_ref: Option<String>,
}

/// One verdict for a request. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub request_id: String,
    pub decided_at: DateTime<Utc>,
    pub decision: DecisionOutcome,
    pub matched_policy_id: Option<String>,
    pub condition: Option<String>,
    pub reason: String,
    /// Approver for human resolutions.
    pub decided_by: Option<String>,
}

/// Timeline entry. Append-only; `seq` gives the total order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: i64,
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub request_id: Option<String>,
    pub kind: String,
    pub payload: Value,
}

/// Event kinds written by the ledger and coordinator. Stored as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RequestCreated,
    RiskScored,
    DecisionMade,
    RequestAllowed,
    RequestDenied,
    RequestHeld,
    ApprovalGranted,
    ApprovalDenied,
    ActionDispatched,
    ToolResult,
    ActionExecuted,
    ExecutionFailed,
    ConfigReloaded,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RequestCreated => "request.created",
            EventKind::RiskScored => "risk.scored",
            EventKind::DecisionMade => "decision.made",
            EventKind::RequestAllowed => "request.allowed",
            EventKind::RequestDenied => "request.denied",
            EventKind::RequestHeld => "request.held",
            EventKind::ApprovalGranted => "approval.granted",
            EventKind::ApprovalDenied => "approval.denied",
            EventKind::ActionDispatched => "action.dispatched",
            EventKind::ToolResult => "tool.result",
            EventKind::ActionExecuted => "action.executed",
            EventKind::ExecutionFailed => "execution.failed",
            EventKind::ConfigReloaded => "config.reloaded",
        }
    }

    /// The event that records a status change.
    pub fn for_transition(from: RequestStatus, to: RequestStatus) -> Self {
        match (from, to) {
            (RequestStatus::Held, RequestStatus::Denied) => EventKind::ApprovalDenied,
            (_, RequestStatus::Proposed) => EventKind::RequestCreated,
            (_, RequestStatus::Allowed) => EventKind::RequestAllowed,
            (_, RequestStatus::Denied) => EventKind::RequestDenied,
            (_, RequestStatus::Held) => EventKind::RequestHeld,
            (_, RequestStatus::Approved) => EventKind::ApprovalGranted,
            (_, RequestStatus::Executing) => EventKind::ActionDispatched,
            (_, RequestStatus::Executed) => EventKind::ActionExecuted,
            (_, RequestStatus::Failed) => EventKind::ExecutionFailed,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input for `Ledger::record_intent`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewIntent {
    pub server: String,
    pub tool: String,
    pub env: String,
    pub args: Value,
    pub actor: Option<String>,
    pub risk_mode: String,
    pub risk_score: i64,
    pub risk_reasons: Vec<String>,
    pub risk_rules: Vec<String>,
}

/// Input for a decision row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDecision {
    pub decision: DecisionOutcome,
    pub matched_policy_id: Option<String>,
    pub condition: Option<String>,
    pub reason: String,
    pub decided_by: Option<String>,
}

impl NewDecision {
    pub fn new(decision: DecisionOutcome, reason: impl Into<String>) -> Self {
        Self {
            decision,
            matched_policy_id: None,
            condition: None,
            reason: reason.into(),
            decided_by: None,
        }
    }

    pub fn with_policy(mut self, policy_id: Option<String>, condition: Option<String>) -> Self {
        self.matched_policy_id = policy_id;
        self.condition = condition;
        self
    }

    pub fn with_decided_by(mut self, who: impl Into<String>) -> Self {
        self.decided_by = Some(who.into());
        self
    }

    pub(crate) fn payload(&self) -> Value {
        json!({
            "decision": self.decision,
            "matched_policy_id": self.matched_policy_id,
            "condition": self.condition,
            "reason": self.reason,
            "decided_by": self.decided_by,
        })
    }
}

/// A guarded status change, applied by `Ledger::transition`.
///
/// Besides the status event (always written), a transition may carry a
/// decision row and a result event whose id becomes `result_ref`.
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: RequestStatus,
    pub to: RequestStatus,
    /// Extra fields merged into the status event payload.
    pub details: Map<String, Value>,
    pub decision: Option<NewDecision>,
    /// Payload of a `tool.result` event.
    pub result: Option<Value>,
}

impl Transition {
    pub fn new(from: RequestStatus, to: RequestStatus) -> Self {
        Self {
            from,
            to,
            details: Map::new(),
            decision: None,
            result: None,
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_decision(mut self, decision: NewDecision) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn with_result(mut self, payload: Value) -> Self {
        self.result = Some(payload);
        self
    }

    pub(crate) fn status_payload(&self) -> Value {
        let mut payload = self.details.clone();
        payload.insert("from".to_string(), json!(self.from));
        payload.insert("to".to_string(), json!(self.to));
        Value::Object(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_events_follow_the_lifecycle() {
        use RequestStatus::*;
        assert_eq!(EventKind::for_transition(Held, Denied), EventKind::ApprovalDenied);
        assert_eq!(EventKind::for_transition(Proposed, Denied), EventKind::RequestDenied);
        assert_eq!(EventKind::for_transition(Held, Approved), EventKind::ApprovalGranted);
        assert_eq!(
            EventKind::for_transition(Approved, Executing),
            EventKind::ActionDispatched
        );
        assert_eq!(
            EventKind::for_transition(Executing, Failed).as_str(),
            "execution.failed"
        );
    }

    #[test]
    fn status_payload_keeps_details_and_edge() {
        let t = Transition::new(RequestStatus::Held, RequestStatus::Approved)
            .with_detail("approved_by", "alice");
        assert_eq!(
            t.status_payload(),
            json!({"from": "held", "to": "approved", "approved_by": "alice"})
        );
    }
}
