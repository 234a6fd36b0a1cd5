// coordinator.rs - Human resolution of held requests and approved-call replay.
//
// resolve() is safe under duplicate concurrent calls: the Held -> Approved
// (or Held -> Denied) compare-and-set in the ledger picks one winner, and
// only the winner dispatches. Dispatch runs with no ledger lock held.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ctrl_ledger::{
    DecisionOutcome, DecisionRecord, Ledger, NewDecision, RequestRecord, RequestStatus,
    Transition,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dispatch::ActionDispatcher;
use crate::error::CoordinatorError;
use crate::execute::{execute, preview};

/// Approver recorded when the caller does not name one.
pub const DEFAULT_APPROVER: &str = "human";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Approve,
    Deny,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Approve => write!(f, "approve"),
            Resolution::Deny => write!(f, "deny"),
        }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Ok(Resolution::Approve),
            "deny" | "denied" => Ok(Resolution::Deny),
            other => Err(format!("unknown resolution '{other}' (expected approve or deny)")),
        }
    }
}

/// Result of a successful `resolve`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveOutcome {
    pub ok: bool,
    pub request_id: String,
    pub status: RequestStatus,
    pub result_preview: Option<String>,
}

/// A request plus what is known about its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestView {
    pub request: RequestRecord,
    pub latest_decision: Option<DecisionRecord>,
    pub result_preview: Option<String>,
}

/// A request stuck in `approved` or `executing` past the staleness window.
/// Reported, never retried: replay is not known to be idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaleAlert {
    pub request_id: String,
    pub server: String,
    pub tool: String,
    pub env: String,
    pub status: RequestStatus,
    pub since: DateTime<Utc>,
    pub stuck_secs: i64,
}

pub struct ApprovalCoordinator {
    ledger: Ledger,
    dispatcher: Arc<dyn ActionDispatcher>,
    dispatch_timeout: Duration,
    stale_after: chrono::Duration,
}

impl ApprovalCoordinator {
    pub fn new(ledger: Ledger, dispatcher: Arc<dyn ActionDispatcher>) -> Self {
        Self {
            ledger,
            dispatcher,
            dispatch_timeout: Duration::from_secs(30),
            stale_after: chrono::Duration::seconds(300),
        }
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn with_stale_after(mut self, window: chrono::Duration) -> Self {
        self.stale_after = window;
        self
    }

    pub fn list_held(&self) -> Result<Vec<RequestRecord>, CoordinatorError> {
        Ok(self.ledger.list_held()?)
    }

    pub fn status(&self, request_id: &str) -> Result<RequestView, CoordinatorError> {
        let request = self
            .ledger
            .get_request(request_id)?
            .ok_or_else(|| CoordinatorError::UnknownRequestId {
                id: request_id.to_string(),
            })?;
        Ok(RequestView {
            latest_decision: self.ledger.latest_decision(request_id)?,
            result_preview: self.ledger.result_preview(request_id)?,
            request,
        })
    }

    /// Approve (and replay) or deny a held request.
    ///
    /// Losers of a concurrent race get `AlreadyResolved` and have done
    /// nothing. A failed replay is recorded as `failed` and reported as
    /// `ExternalDispatchFailure`.
    pub async fn resolve(
        &self,
        request_id: &str,
        resolution: Resolution,
        approver: &str,
    ) -> Result<ResolveOutcome, CoordinatorError> {
        let approver = match approver.trim() {
            "" => DEFAULT_APPROVER,
            name => name,
        };
        match resolution {
            Resolution::Deny => {
                let record = self.ledger.transition(
                    request_id,
                    &Transition::new(RequestStatus::Held, RequestStatus::Denied)
                        .with_detail("by", approver)
                        .with_decision(
                            NewDecision::new(DecisionOutcome::Denied, format!("denied by {approver}"))
                                .with_decided_by(approver),
                        ),
                )?;
                info!(request_id, approver, "held request denied");
                Ok(ResolveOutcome {
                    ok: true,
                    request_id: record.id,
                    status: record.status,
                    result_preview: None,
                })
            }
            Resolution::Approve => {
                let approved = self.ledger.transition(
                    request_id,
                    &Transition::new(RequestStatus::Held, RequestStatus::Approved)
                        .with_detail("by", approver)
                        .with_decision(
                            NewDecision::new(
                                DecisionOutcome::Approved,
                                format!("approved by {approver}"),
                            )
                            .with_decided_by(approver),
                        ),
                )?;
                info!(request_id, approver, "held request approved, replaying");
                let result = execute(
                    &self.ledger,
                    &approved,
                    RequestStatus::Approved,
                    Arc::clone(&self.dispatcher),
                    self.dispatch_timeout,
                )
                .await?;
                Ok(ResolveOutcome {
                    ok: true,
                    request_id: approved.id,
                    status: RequestStatus::Executed,
                    result_preview: Some(preview(&result)),
                })
            }
        }
    }

    /// Requests in flight for longer than the staleness window.
    pub fn stale_alerts(&self) -> Result<Vec<StaleAlert>, CoordinatorError> {
        let now = Utc::now();
        let alerts: Vec<StaleAlert> = self
            .ledger
            .stale_in_flight(self.stale_after)?
            .into_iter()
            .map(|r| StaleAlert {
                stuck_secs: (now - r.updated_at).num_seconds(),
                request_id: r.id,
                server: r.server,
                tool: r.tool,
                env: r.env,
                status: r.status,
                since: r.updated_at,
            })
            .collect();
        for alert in &alerts {
            warn!(
                request_id = %alert.request_id,
                server = %alert.server,
                tool = %alert.tool,
                status = %alert.status,
                stuck_secs = alert.stuck_secs,
                "request stuck in flight; inspect the action server before acting"
            );
        }
        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_parses_loosely() {
        assert_eq!("Approve".parse::<Resolution>().unwrap(), Resolution::Approve);
        assert_eq!("denied".parse::<Resolution>().unwrap(), Resolution::Deny);
        assert!("maybe".parse::<Resolution>().is_err());
        assert_eq!(Resolution::Deny.to_string(), "deny");
    }
}
