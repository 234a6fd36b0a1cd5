// intercept.rs - The decision path for one incoming tool call.
//
// intercept: risk -> policy -> ledger.record_intent, returning the verdict
// the adapter must enforce. Engines are read from the current generation;
// nothing here mutates shared rule state, so calls for different requests
// never contend beyond the ledger insert.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use ctrl_ledger::{
    DecisionOutcome, EventKind, Ledger, NewDecision, NewIntent, RequestRecord, RequestStatus,
    Transition,
};
use ctrl_policy::Verdict;
use ctrl_risk::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::CtrlConfig;
use crate::dispatch::ActionDispatcher;
use crate::engines::{EngineSet, Explanation};
use crate::error::{CoordinatorError, GatewayError};
use crate::execute::{execute, record_outcome};

/// What the adapter must do with the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum InterceptOutcome {
    /// Forward the call (or ask the gateway to forward it).
    Allow { request_id: String },
    /// Refuse the call.
    Deny { request_id: String, reason: String },
    /// Refuse for now; a human may approve and the gateway will replay it.
    Hold { request_id: String, reason: String },
}

impl InterceptOutcome {
    pub fn request_id(&self) -> &str {
        match self {
            InterceptOutcome::Allow { request_id }
            | InterceptOutcome::Deny { request_id, .. }
            | InterceptOutcome::Hold { request_id, .. } => request_id,
        }
    }

    pub fn verdict(&self) -> Verdict {
        match self {
            InterceptOutcome::Allow { .. } => Verdict::Allow,
            InterceptOutcome::Deny { .. } => Verdict::Deny,
            InterceptOutcome::Hold { .. } => Verdict::Hold,
        }
    }
}

/// The control plane's entry point for agent adapters.
pub struct Gateway {
    ledger: Ledger,
    engines: RwLock<Arc<EngineSet>>,
    default_env: String,
    approvals_enabled: bool,
}

impl Gateway {
    pub fn new(ledger: Ledger, engines: EngineSet) -> Self {
        Self {
            ledger,
            engines: RwLock::new(Arc::new(engines)),
            default_env: "dev".to_string(),
            approvals_enabled: true,
        }
    }

    /// Open and migrate the ledger and load the engines named in `config`.
    pub fn from_config(config: &CtrlConfig) -> Result<Self, GatewayError> {
        let ledger = Ledger::open(&config.db_path)?;
        ledger.migrate()?;
        Ok(Self::new(ledger, EngineSet::load(config)?)
            .with_default_env(&config.default_env)
            .with_approvals(config.approvals.enabled))
    }

    pub fn with_default_env(mut self, env: &str) -> Self {
        self.default_env = env.to_string();
        self
    }

    pub fn with_approvals(mut self, enabled: bool) -> Self {
        self.approvals_enabled = enabled;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The current engine generation.
    pub fn engines(&self) -> Result<Arc<EngineSet>, GatewayError> {
        self.engines
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| GatewayError::LockPoisoned)
    }

    /// Swap in a new engine generation. In-flight evaluations keep the old one.
    pub fn reload(&self, mut engines: EngineSet) -> Result<u64, GatewayError> {
        let generation = {
            let mut current = self.engines.write().map_err(|_| GatewayError::LockPoisoned)?;
            engines.generation = current.generation + 1;
            let generation = engines.generation;
            *current = Arc::new(engines);
            generation
        };
        let engines = self.engines()?;
        self.ledger.append_event(
            None,
            EventKind::ConfigReloaded,
            &json!({
                "generation": generation,
                "policies": engines.policy.len(),
                "risk_rules": engines.risk.rule_count(),
            }),
        )?;
        info!(generation, "engines reloaded");
        Ok(generation)
    }

    /// Dry run: no ledger row is written.
    pub fn explain(&self, call: &ToolCall) -> Result<Explanation, GatewayError> {
        Ok(self.engines()?.explain(&self.with_env(call.clone())))
    }

    /// Score, decide and record one call.
    pub fn intercept(&self, call: ToolCall) -> Result<InterceptOutcome, GatewayError> {
        let call = self.with_env(call);
        let engines = self.engines()?;
        let (risk, decision) = engines.evaluate(&call);

        let (verdict, reason) = match decision.verdict {
            Verdict::Hold if !self.approvals_enabled => {
                warn!(
                    server = %call.server,
                    tool = %call.tool,
                    "approval required but approvals are disabled, denying"
                );
                (
                    Verdict::Deny,
                    format!("approvals disabled: {}", decision.reason),
                )
            }
            verdict => (verdict, decision.reason.clone()),
        };
        let outcome = match verdict {
            Verdict::Allow => DecisionOutcome::Allow,
            Verdict::Deny => DecisionOutcome::Deny,
            Verdict::Hold => DecisionOutcome::Hold,
        };

        let intent = NewIntent {
            server: call.server.clone(),
            tool: call.tool.clone(),
            env: call.env.clone(),
            args: call.args.clone(),
            actor: call.actor.clone(),
            risk_mode: risk.mode.clone(),
            risk_score: risk.score,
            risk_reasons: risk.reasons.clone(),
            risk_rules: risk.matched_rules.clone(),
        };
        let record = self.ledger.record_intent(
            &intent,
            &NewDecision::new(outcome, reason.clone())
                .with_policy(decision.matched_policy_id.clone(), decision.condition.clone()),
        )?;
        info!(
            request_id = %record.id,
            server = %call.server,
            tool = %call.tool,
            env = %call.env,
            verdict = %verdict,
            risk_mode = %risk.mode,
            risk_score = risk.score,
            policy = decision.matched_policy_id.as_deref().unwrap_or("none"),
            generation = engines.generation,
            "intercepted tool call"
        );

        let request_id = record.id;
        Ok(match verdict {
            Verdict::Allow => InterceptOutcome::Allow { request_id },
            Verdict::Deny => InterceptOutcome::Deny { request_id, reason },
            Verdict::Hold => InterceptOutcome::Hold { request_id, reason },
        })
    }

    /// Forward an allowed request through `dispatcher` and record the result.
    /// The dispatch finishes even if the returned future is dropped.
    pub async fn forward(
        &self,
        request_id: &str,
        dispatcher: Arc<dyn ActionDispatcher>,
        timeout: Duration,
    ) -> Result<Value, CoordinatorError> {
        let request = self.request(request_id)?;
        execute(&self.ledger, &request, RequestStatus::Allowed, dispatcher, timeout).await
    }

    /// Record the result of an allowed call the adapter forwarded itself.
    pub fn record_forward_result(
        &self,
        request_id: &str,
        outcome: Result<Value, String>,
    ) -> Result<RequestRecord, CoordinatorError> {
        self.ledger.transition(
            request_id,
            &Transition::new(RequestStatus::Allowed, RequestStatus::Executing)
                .with_detail("forwarded_by", "adapter"),
        )?;
        Ok(record_outcome(&self.ledger, request_id, &outcome)?)
    }

    fn request(&self, request_id: &str) -> Result<RequestRecord, CoordinatorError> {
        self.ledger
            .get_request(request_id)?
            .ok_or_else(|| CoordinatorError::UnknownRequestId {
                id: request_id.to_string(),
            })
    }

    fn with_env(&self, mut call: ToolCall) -> ToolCall {
        if call.env.trim().is_empty() {
            call.env = self.default_env.clone();
        }
        call
    }
}
