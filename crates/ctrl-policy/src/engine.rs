// engine.rs - Policy evaluation engine.
//
// Every intercepted call passes through `decide()`:
//
// 1. Walk the rules in declared order; the first whose server/tool/env
//    wildcards all match is authoritative. Later rules are never consulted.
// 2. `deny` → deny. `hold` → hold. Guards are ignored for both.
// 3. `allow` → the `deny` guard is checked first, then `require_approval_if`.
//    A guard that cannot be evaluated counts as satisfied.
// 4. No matching rule → deny.
//
// The engine is a pure function over the call and its risk result; it never
// executes anything and never blocks.

use std::fmt;

use ctrl_risk::{Context, Expr, ExprError, RiskResult, ToolCall, Wildcard};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::PolicyError;
use crate::rule::{Effect, PolicyConfig, PolicyRule};

/// Root names a guard expression may reference.
pub const GUARD_NAMES: &[&str] = &[
    "risk",
    "risk_mode",
    "risk_score",
    "server",
    "tool",
    "env",
    "actor",
    "args",
];

/// Reason recorded when nothing matched.
pub const NO_MATCH_REASON: &str = "no policy matched";

/// The engine's output verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
    #[serde(alias = "pending")]
    Hold,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
            Verdict::Hold => "hold",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Effect> for Verdict {
    fn from(effect: Effect) -> Self {
        match effect {
            Effect::Allow => Verdict::Allow,
            Effect::Deny => Verdict::Deny,
            Effect::Hold => Verdict::Hold,
        }
    }
}

/// One decision for one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub verdict: Verdict,
    /// Id of the rule that matched, `None` on fail-closed deny.
    pub matched_policy_id: Option<String>,
    /// `server=<p> tool=<p> env=<p>`, plus the guard text when a guard fired.
    pub condition: Option<String>,
    pub reason: String,
}

impl PolicyDecision {
    fn no_match() -> Self {
        Self {
            verdict: Verdict::Deny,
            matched_policy_id: None,
            condition: None,
            reason: NO_MATCH_REASON.to_string(),
        }
    }
}

/// A step in the evaluation chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationStep {
    /// What was checked (e.g., "rule[0] no-prod-deletes", "deny_guard").
    pub check: String,
    /// The outcome (e.g., "matched server=* tool=*delete* env=prod").
    pub outcome: String,
    /// Whether this step decided the verdict.
    pub terminal: bool,
}

/// Decision plus every step that led to it. Returned by `explain`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationTrace {
    pub decision: PolicyDecision,
    pub steps: Vec<EvaluationStep>,
    /// Ids of the rules inspected, in order.
    pub rules_checked: Vec<String>,
    /// Position of the matching rule, if any.
    pub matched_index: Option<usize>,
}

#[derive(Debug, Clone)]
struct CompiledPolicy {
    rule: PolicyRule,
    server: Wildcard,
    tool: Wildcard,
    env: Wildcard,
    deny: Option<Expr>,
    hold: Option<Expr>,
}

impl CompiledPolicy {
    fn compile(rule: &PolicyRule) -> Result<Self, PolicyError> {
        let wildcard = |field: &'static str, pattern: &str| {
            Wildcard::new(pattern).map_err(|e| PolicyError::InvalidPattern {
                policy_id: rule.id.clone(),
                field,
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
        };
        let guard = |guard: &'static str, text: &Option<String>| -> Result<Option<Expr>, PolicyError> {
            text.as_deref()
                .map(|t| {
                    Expr::parse(t).map_err(|source| PolicyError::InvalidGuard {
                        policy_id: rule.id.clone(),
                        guard,
                        source,
                    })
                })
                .transpose()
        };
        Ok(Self {
            server: wildcard("server", &rule.matcher.server)?,
            tool: wildcard("tool", &rule.matcher.tool)?,
            env: wildcard("env", &rule.matcher.env)?,
            deny: guard("deny", &rule.deny)?,
            hold: guard("require_approval_if", &rule.require_approval_if)?,
            rule: rule.clone(),
        })
    }

    fn matches(&self, call: &ToolCall) -> bool {
        self.server.matches(&call.server)
            && self.tool.matches(&call.tool)
            && self.env.matches(&call.env)
    }

    fn reason_or(&self, fallback: String) -> String {
        if self.rule.reason.is_empty() {
            fallback
        } else {
            self.rule.reason.clone()
        }
    }
}

/// Result of one guard check. `Failed` is handled like `Fired`.
enum GuardOutcome {
    Clear,
    Fired,
    Failed(ExprError),
}

fn check_guard(expr: &Expr, ctx: &Context) -> GuardOutcome {
    match expr.eval_bool(ctx) {
        Ok(true) => GuardOutcome::Fired,
        Ok(false) => GuardOutcome::Clear,
        Err(e) => GuardOutcome::Failed(e),
    }
}

/// Compiled, ordered policy for one configuration generation.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    rules: Vec<CompiledPolicy>,
}

impl PolicyEngine {
    /// Compile a policy. Fails on duplicate ids, invalid wildcards, or guard
    /// syntax errors.
    pub fn new(config: &PolicyConfig) -> Result<Self, PolicyError> {
        config.validate()?;
        let rules = config
            .policies
            .iter()
            .map(CompiledPolicy::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Decide a verdict for one call.
    ///
    /// A guard that fails to evaluate (unbound name, type mismatch, division
    /// by zero) is treated as satisfied rather than as a rule that did not
    /// fire: a failing `deny` guard denies and a failing
    /// `require_approval_if` guard holds. The failure is logged at `warn`
    /// and named in the decision reason.
    pub fn decide(&self, call: &ToolCall, risk: &RiskResult) -> PolicyDecision {
        self.explain(call, risk).decision
    }

    /// Same as `decide` but records every step.
    pub fn explain(&self, call: &ToolCall, risk: &RiskResult) -> EvaluationTrace {
        let mut steps = Vec::new();
        let mut rules_checked = Vec::new();

        for (index, policy) in self.rules.iter().enumerate() {
            let rule = &policy.rule;
            rules_checked.push(rule.id.clone());
            let check = format!("rule[{}] {}", index, rule.id);

            if !policy.matches(call) {
                steps.push(EvaluationStep {
                    check,
                    outcome: format!("no match ({})", rule.matcher),
                    terminal: false,
                });
                continue;
            }
            steps.push(EvaluationStep {
                check,
                outcome: format!("matched {} effect={}", rule.matcher, rule.effect),
                terminal: false,
            });

            let decision = self.resolve(policy, call, risk, &mut steps);
            debug!(
                policy = %rule.id,
                verdict = %decision.verdict,
                server = %call.server,
                tool = %call.tool,
                "policy matched"
            );
            return EvaluationTrace {
                decision,
                steps,
                rules_checked,
                matched_index: Some(index),
            };
        }

        steps.push(EvaluationStep {
            check: "default".to_string(),
            outcome: "no policy matched: deny".to_string(),
            terminal: true,
        });
        debug!(server = %call.server, tool = %call.tool, env = %call.env, "no policy matched");
        EvaluationTrace {
            decision: PolicyDecision::no_match(),
            steps,
            rules_checked,
            matched_index: None,
        }
    }

    fn resolve(
        &self,
        policy: &CompiledPolicy,
        call: &ToolCall,
        risk: &RiskResult,
        steps: &mut Vec<EvaluationStep>,
    ) -> PolicyDecision {
        let rule = &policy.rule;
        let condition = rule.matcher.to_string();
        let decision = |verdict: Verdict, condition: String, reason: String| PolicyDecision {
            verdict,
            matched_policy_id: Some(rule.id.clone()),
            condition: Some(condition),
            reason,
        };

        match rule.effect {
            Effect::Deny => {
                steps.push(terminal("effect", "deny"));
                return decision(
                    Verdict::Deny,
                    condition,
                    policy.reason_or(format!("denied by policy '{}'", rule.id)),
                );
            }
            Effect::Hold => {
                steps.push(terminal("effect", "hold"));
                return decision(
                    Verdict::Hold,
                    condition,
                    policy.reason_or(format!("held for approval by policy '{}'", rule.id)),
                );
            }
            Effect::Allow => {}
        }

        let ctx = guard_context(call, risk);
        let guards = [
            (Verdict::Deny, "deny_guard", &policy.deny),
            (Verdict::Hold, "approval_guard", &policy.hold),
        ];
        for (verdict, name, guard) in guards {
            let Some(expr) = guard else { continue };
            match check_guard(expr, &ctx) {
                GuardOutcome::Clear => steps.push(EvaluationStep {
                    check: name.to_string(),
                    outcome: format!("not satisfied: {}", expr.source()),
                    terminal: false,
                }),
                GuardOutcome::Fired => {
                    steps.push(terminal(name, &format!("satisfied: {}", expr.source())));
                    let reason = match verdict {
                        Verdict::Deny => format!("deny guard matched: {}", expr.source()),
                        _ => format!("approval required: {}", expr.source()),
                    };
                    return decision(
                        verdict,
                        format!("{} {}: {}", condition, name, expr.source()),
                        reason,
                    );
                }
                GuardOutcome::Failed(e) => {
                    warn!(policy = %rule.id, guard = name, error = %e, "guard evaluation failed");
                    steps.push(terminal(name, &format!("failed ({}): treated as satisfied", e)));
                    return decision(
                        verdict,
                        format!("{} {}: {}", condition, name, expr.source()),
                        format!("{} could not be evaluated ({}); failing closed", name, e),
                    );
                }
            }
        }

        steps.push(terminal("effect", "allow"));
        decision(
            Verdict::Allow,
            condition,
            policy.reason_or(format!("allowed by policy '{}'", rule.id)),
        )
    }
}

fn terminal(check: &str, outcome: &str) -> EvaluationStep {
    EvaluationStep {
        check: check.to_string(),
        outcome: outcome.to_string(),
        terminal: true,
    }
}

/// Context visible to `deny` and `require_approval_if` guards.
pub fn guard_context(call: &ToolCall, risk: &RiskResult) -> Context {
    Context::new()
        .with(
            "risk",
            json!({
                "mode": risk.mode,
                "score": risk.score,
                "reasons": risk.reasons,
                "rules": risk.matched_rules,
            }),
        )
        .with("risk_mode", risk.mode.clone())
        .with("risk_score", risk.score)
        .with("server", call.server.clone())
        .with("tool", call.tool.clone())
        .with("env", call.env.clone())
        .with("actor", call.actor.clone())
        .with("args", call.args.clone())
}
