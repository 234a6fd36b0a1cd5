// engines.rs - One configuration generation of the risk and policy engines.
//
// An EngineSet is built once from the YAML documents and never mutated.
// Reloading builds a fresh set and swaps the Arc; evaluations already
// holding the old set finish against it.

use std::path::Path;

use ctrl_policy::{load_policy_config, EvaluationTrace, PolicyDecision, PolicyEngine};
use ctrl_risk::{load_risk_config, RiskConfig, RiskEngine, RiskResult, ToolCall};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::CtrlConfig;
use crate::error::GatewayError;

/// Immutable risk + policy engines for one configuration generation.
pub struct EngineSet {
    pub risk: RiskEngine,
    pub policy: PolicyEngine,
    /// Starts at 1 and increases on every reload.
    pub generation: u64,
}

/// Dry-run result: the risk score and the full policy trace.
#[derive(Debug, Clone, Serialize)]
pub struct Explanation {
    pub call: ToolCall,
    pub risk: RiskResult,
    pub trace: EvaluationTrace,
}

impl EngineSet {
    pub fn new(risk: RiskEngine, policy: PolicyEngine) -> Self {
        Self {
            risk,
            policy,
            generation: 1,
        }
    }

    /// Build engines from the risk and policy documents named in `config`.
    pub fn load(config: &CtrlConfig) -> Result<Self, GatewayError> {
        let risk_config = load_risk_or_minimal(&config.risk_path)?;
        let risk = RiskEngine::new(&risk_config)?;
        for diagnostic in risk.diagnostics() {
            warn!(%diagnostic, "risk rule skipped");
        }
        let policy = PolicyEngine::new(&load_policy_config(&config.policy_path)?)?;
        info!(
            policies = policy.len(),
            risk_rules = risk.rule_count(),
            "loaded engines"
        );
        Ok(Self::new(risk, policy))
    }

    /// Score and decide one call. Pure.
    pub fn evaluate(&self, call: &ToolCall) -> (RiskResult, PolicyDecision) {
        let risk = self.risk.score(call);
        let decision = self.policy.decide(call, &risk);
        (risk, decision)
    }

    pub fn explain(&self, call: &ToolCall) -> Explanation {
        let risk = self.risk.score(call);
        let trace = self.policy.explain(call, &risk);
        Explanation {
            call: call.clone(),
            risk,
            trace,
        }
    }
}

fn load_risk_or_minimal(path: &Path) -> Result<RiskConfig, GatewayError> {
    if path.exists() {
        Ok(load_risk_config(path)?)
    } else {
        warn!(path = %path.display(), "risk config not found, scoring every call as safe");
        Ok(RiskConfig::minimal())
    }
}
