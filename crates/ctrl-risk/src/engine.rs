// engine.rs - Risk scoring.
//
// The RiskEngine turns a `ToolCall` into a `RiskResult { mode, score }`:
//
// 1. Start at the lowest mode and its baseline score.
// 2. Compute `vars` in declaration order (a failing var is bound to 0).
// 3. Apply each matching rule in order: set the mode, escalate one step,
//    or add to the score. A mode change lifts the score to at least that
//    mode's baseline.
// 4. Clamp the score to 0..=100.
// 5. Reconcile: the first `set_mode_by_score` threshold that holds, checked
//    from most to least severe mode, decides the final mode.
//
// Rules that cannot be compiled are dropped at construction and reported by
// `diagnostics()`; rules that fail at evaluation time do not fire and leave
// a reason on the result. Scoring itself never fails.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::call::ToolCall;
use crate::config::{ArgPredicate, RiskConfig, RiskRule};
use crate::error::{ExprError, RiskError};
use crate::expr::{Context, Expr};
use crate::pattern::Wildcard;

pub const MIN_SCORE: i64 = 0;
pub const MAX_SCORE: i64 = 100;

/// Names the scoring context defines itself. Arguments and vars with these
/// names are not bound at the top level.
pub const RESERVED_NAMES: &[&str] = &[
    "server", "tool", "env", "actor", "args", "score", "mode", "risk",
];

/// Outcome of scoring one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskResult {
    pub mode: String,
    pub score: i64,
    pub reasons: Vec<String>,
    pub matched_rules: Vec<String>,
}

/// A configuration defect found while compiling the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDiagnostic {
    /// Where the defect is, e.g. `rules[2] (big_payment)` or `vars.norm`.
    pub location: String,
    pub problem: String,
}

impl fmt::Display for RuleDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.problem)
    }
}

#[derive(Debug, Clone)]
struct Mode {
    name: String,
    baseline: i64,
}

/// What a matching rule does. Closed set; the config's optional fields are
/// collapsed into exactly one of these at construction.
#[derive(Debug, Clone)]
enum RiskAction {
    SetMode(usize),
    Escalate,
    ScoreDelta(i64),
    ScoreExpr(Expr),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    name: String,
    reason: String,
    server: Wildcard,
    tool: Wildcard,
    env: Wildcard,
    args: Vec<(String, ArgPredicate)>,
    expr: Option<Expr>,
    action: RiskAction,
}

impl CompiledRule {
    fn matches(&self, call: &ToolCall, ctx: &Context) -> Result<bool, ExprError> {
        if !(self.server.matches(&call.server)
            && self.tool.matches(&call.tool)
            && self.env.matches(&call.env))
        {
            return Ok(false);
        }
        if !self
            .args
            .iter()
            .all(|(path, predicate)| predicate.holds(call.arg(path)))
        {
            return Ok(false);
        }
        match &self.expr {
            Some(expr) => expr.eval_bool(ctx),
            None => Ok(true),
        }
    }
}

/// Compiled risk rules for one configuration generation. Read-only after
/// construction and safe to share across threads.
#[derive(Debug, Clone)]
pub struct RiskEngine {
    /// Ascending severity.
    modes: Vec<Mode>,
    vars: Vec<(String, Result<Expr, ExprError>)>,
    rules: Vec<CompiledRule>,
    /// (mode index, threshold), most severe first.
    thresholds: Vec<(usize, Expr)>,
    diagnostics: Vec<RuleDiagnostic>,
}

impl RiskEngine {
    pub fn new(config: &RiskConfig) -> Result<Self, RiskError> {
        let mut modes: Vec<Mode> = config
            .modes
            .iter()
            .map(|(name, def)| Mode {
                name: name.clone(),
                baseline: def.score,
            })
            .collect();
        if modes.is_empty() {
            return Err(RiskError::NoModes);
        }
        modes.sort_by_key(|m| m.baseline);
        for pair in modes.windows(2) {
            if pair[0].baseline == pair[1].baseline {
                return Err(RiskError::AmbiguousModeOrder {
                    first: pair[0].name.clone(),
                    second: pair[1].name.clone(),
                    score: pair[0].baseline,
                });
            }
        }

        let mut thresholds = Vec::new();
        for (mode, text) in &config.set_mode_by_score {
            let index = modes
                .iter()
                .position(|m| &m.name == mode)
                .ok_or_else(|| RiskError::UnknownThresholdMode { mode: mode.clone() })?;
            let expr = Expr::parse(text).map_err(|source| RiskError::InvalidThreshold {
                mode: mode.clone(),
                source,
            })?;
            thresholds.push((index, expr));
        }
        thresholds.sort_by(|a, b| b.0.cmp(&a.0));

        let mut diagnostics = Vec::new();

        let mut vars = Vec::new();
        for var in &config.vars {
            let location = format!("vars.{}", var.name);
            if RESERVED_NAMES.contains(&var.name.as_str()) {
                diagnostics.push(RuleDiagnostic {
                    location,
                    problem: "name is reserved by the scoring context".to_string(),
                });
                continue;
            }
            let compiled = Expr::parse(&var.expr);
            if let Err(e) = &compiled {
                diagnostics.push(RuleDiagnostic {
                    location,
                    problem: e.to_string(),
                });
            }
            vars.push((var.name.clone(), compiled));
        }

        let mut rules = Vec::new();
        for (index, rule) in config.rules.iter().enumerate() {
            match compile_rule(rule, &modes) {
                Ok(compiled) => rules.push(compiled),
                Err(problem) => {
                    let location = format!("rules[{}] ({})", index, rule.name);
                    warn!(rule = %rule.name, %problem, "skipping risk rule");
                    diagnostics.push(RuleDiagnostic { location, problem });
                }
            }
        }

        Ok(Self {
            modes,
            vars,
            rules,
            thresholds,
            diagnostics,
        })
    }

    /// Defects found at construction. Affected rules never fire.
    pub fn diagnostics(&self) -> &[RuleDiagnostic] {
        &self.diagnostics
    }

    /// Mode names in ascending severity with their baselines.
    pub fn modes(&self) -> impl Iterator<Item = (&str, i64)> {
        self.modes.iter().map(|m| (m.name.as_str(), m.baseline))
    }

    pub fn default_mode(&self) -> &str {
        &self.modes[0].name
    }

    /// Number of rules that compiled.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn score(&self, call: &ToolCall) -> RiskResult {
        let mut mode = 0usize;
        let mut score = self.modes[0].baseline;
        let mut reasons = Vec::new();
        let mut matched_rules = Vec::new();

        let mut ctx = base_context(call);

        for (name, compiled) in &self.vars {
            let value = match compiled {
                Ok(expr) => expr.eval(&ctx).map(|v| v.to_json()),
                Err(e) => Err(e.clone()),
            };
            match value {
                Ok(v) => ctx.insert(name.clone(), v),
                Err(e) => {
                    warn!(var = %name, error = %e, "risk var failed, bound to 0");
                    reasons.push(format!("var '{}' failed ({}); using 0", name, e));
                    ctx.insert(name.clone(), 0);
                }
            }
        }

        for rule in &self.rules {
            ctx.insert("score", score);
            ctx.insert("mode", self.modes[mode].name.clone());

            match rule.matches(call, &ctx) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(rule = %rule.name, error = %e, "risk rule expression failed");
                    reasons.push(format!("rule '{}' skipped: {}", rule.name, e));
                    continue;
                }
            }

            debug!(rule = %rule.name, "risk rule matched");
            matched_rules.push(rule.name.clone());
            if !rule.reason.is_empty() {
                reasons.push(rule.reason.clone());
            }

            let before = mode;
            match &rule.action {
                RiskAction::SetMode(target) => mode = *target,
                RiskAction::Escalate => mode = (mode + 1).min(self.modes.len() - 1),
                RiskAction::ScoreDelta(delta) => score = score.saturating_add(*delta),
                RiskAction::ScoreExpr(expr) => match expr.eval_number(&ctx) {
                    Ok(v) if v.is_finite() => score = score.saturating_add(v.round() as i64),
                    Ok(v) => {
                        warn!(rule = %rule.name, value = v, "score_expr is not finite");
                        reasons.push(format!("rule '{}' score_expr gave {}; ignored", rule.name, v));
                    }
                    Err(e) => {
                        warn!(rule = %rule.name, error = %e, "score_expr failed");
                        reasons.push(format!("rule '{}' score_expr failed: {}", rule.name, e));
                    }
                },
            }
            if mode != before {
                score = score.max(self.modes[mode].baseline);
            }
        }

        let score = score.clamp(MIN_SCORE, MAX_SCORE);
        let mode = self.reconcile(mode, score, &mut ctx, &mut reasons);

        RiskResult {
            mode: self.modes[mode].name.clone(),
            score,
            reasons,
            matched_rules,
        }
    }

    fn reconcile(
        &self,
        mode: usize,
        score: i64,
        ctx: &mut Context,
        reasons: &mut Vec<String>,
    ) -> usize {
        if self.thresholds.is_empty() {
            return mode;
        }
        ctx.insert("score", score);
        ctx.insert("mode", self.modes[mode].name.clone());

        for (candidate, threshold) in &self.thresholds {
            let name = &self.modes[*candidate].name;
            match threshold.eval_bool(ctx) {
                Ok(true) => {
                    if *candidate != mode {
                        debug!(from = %self.modes[mode].name, to = %name, score, "mode reconciled by score");
                    }
                    return *candidate;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(mode = %name, error = %e, "set_mode_by_score threshold failed");
                    reasons.push(format!("set_mode_by_score.{} failed: {}", name, e));
                }
            }
        }

        reasons.push(format!(
            "no set_mode_by_score threshold matched score {}; keeping mode '{}'",
            score, self.modes[mode].name
        ));
        mode
    }
}

fn compile_rule(rule: &RiskRule, modes: &[Mode]) -> Result<CompiledRule, String> {
    let declared = [
        rule.set_mode.is_some(),
        rule.escalate.is_some(),
        rule.score_delta.is_some(),
        rule.score_expr.is_some(),
    ]
    .iter()
    .filter(|present| **present)
    .count();
    if declared == 0 {
        return Err("no action (set_mode, escalate, score_delta or score_expr)".to_string());
    }
    if declared > 1 {
        return Err("more than one action declared".to_string());
    }

    let action = if let Some(target) = &rule.set_mode {
        let index = modes
            .iter()
            .position(|m| &m.name == target)
            .ok_or_else(|| format!("set_mode references unknown mode '{}'", target))?;
        RiskAction::SetMode(index)
    } else if rule.escalate.is_some() {
        RiskAction::Escalate
    } else if let Some(delta) = rule.score_delta {
        RiskAction::ScoreDelta(delta)
    } else if let Some(text) = &rule.score_expr {
        RiskAction::ScoreExpr(Expr::parse(text).map_err(|e| format!("score_expr: {}", e))?)
    } else {
        return Err("no action".to_string());
    };

    let wildcard = |field: &str, pattern: &str| {
        Wildcard::new(pattern)
            .map_err(|e| format!("invalid {} pattern '{}': {}", field, pattern, e))
    };

    let expr = match &rule.when.expr {
        Some(text) => Some(Expr::parse(text).map_err(|e| format!("when.expr: {}", e))?),
        None => None,
    };

    Ok(CompiledRule {
        name: rule.name.clone(),
        reason: rule.reason.clone(),
        server: wildcard("server", &rule.when.server)?,
        tool: wildcard("tool", &rule.when.tool)?,
        env: wildcard("env", &rule.when.env)?,
        args: rule
            .when
            .args
            .iter()
            .map(|(path, predicate)| (path.clone(), predicate.clone()))
            .collect(),
        expr,
        action,
    })
}

/// Scoring context before vars: request fields, the full payload under
/// `args`, and scalar top-level arguments by name.
fn base_context(call: &ToolCall) -> Context {
    let mut ctx = Context::new()
        .with("server", call.server.clone())
        .with("tool", call.tool.clone())
        .with("env", call.env.clone())
        .with("actor", call.actor.clone())
        .with("args", call.args.clone());

    if let Json::Object(args) = &call.args {
        for (name, value) in args {
            let scalar = matches!(value, Json::Bool(_) | Json::Number(_) | Json::String(_));
            if scalar && !RESERVED_NAMES.contains(&name.as_str()) {
                ctx.insert(name.clone(), value.clone());
            }
        }
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModeDef, VarDef};
    use serde_json::json;

    fn ladder() -> RiskConfig {
        let mut cfg = RiskConfig::default();
        for (name, score) in [("safe", 0), ("review", 40), ("danger", 70)] {
            cfg.modes.insert(name.to_string(), ModeDef { score });
        }
        cfg
    }

    fn with_thresholds(mut cfg: RiskConfig) -> RiskConfig {
        for (mode, expr) in [
            ("danger", "score >= 70"),
            ("review", "score >= 40"),
            ("safe", "score < 40"),
        ] {
            cfg.set_mode_by_score
                .insert(mode.to_string(), expr.to_string());
        }
        cfg
    }

    fn rule(name: &str) -> RiskRule {
        RiskRule {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn call() -> ToolCall {
        ToolCall::new("web", "publish_page", "prod")
    }

    #[test]
    fn no_rules_yields_default_mode_and_baseline() {
        let engine = RiskEngine::new(&ladder()).unwrap();
        let result = engine.score(&call());
        assert_eq!(result.mode, "safe");
        assert_eq!(result.score, 0);
        assert!(result.matched_rules.is_empty());
        assert_eq!(engine.default_mode(), "safe");
    }

    #[test]
    fn score_contributions_reconcile_to_danger() {
        let mut cfg = with_thresholds(ladder());
        cfg.rules.push(RiskRule {
            score_delta: Some(50),
            ..rule("base")
        });
        cfg.rules.push(RiskRule {
            score_expr: Some("score - 20".to_string()),
            ..rule("expr")
        });
        let engine = RiskEngine::new(&cfg).unwrap();
        let result = engine.score(&call());
        assert_eq!(result.score, 80);
        assert_eq!(result.mode, "danger");
        assert_eq!(result.matched_rules, vec!["base", "expr"]);
    }

    #[test]
    fn script_in_nested_html_sets_danger() {
        let mut cfg = ladder();
        let mut script = RiskRule {
            set_mode: Some("danger".to_string()),
            reason: "inline script".to_string(),
            ..rule("script")
        };
        script.when.args.insert(
            "page.html".to_string(),
            ArgPredicate {
                contains: Some("<script".to_string()),
                ..Default::default()
            },
        );
        cfg.rules.push(script);
        let engine = RiskEngine::new(&cfg).unwrap();

        let hostile = call().with_args(json!({"page": {"html": "<p><script>x()</script>"}}));
        let result = engine.score(&hostile);
        assert_eq!(result.mode, "danger");
        assert_eq!(result.score, 70);
        assert_eq!(result.reasons, vec!["inline script"]);

        let benign = call().with_args(json!({"page": {"html": "<p>hello</p>"}}));
        assert_eq!(engine.score(&benign).mode, "safe");
    }

    #[test]
    fn escalation_stops_at_the_top_mode() {
        let mut cfg = ladder();
        for name in ["one", "two", "three", "four"] {
            cfg.rules.push(RiskRule {
                escalate: Some(crate::config::Escalation::OneLevel),
                ..rule(name)
            });
        }
        let result = RiskEngine::new(&cfg).unwrap().score(&call());
        assert_eq!(result.mode, "danger");
        assert_eq!(result.matched_rules.len(), 4);
    }

    #[test]
    fn scores_are_clamped() {
        let mut cfg = ladder();
        cfg.rules.push(RiskRule {
            score_delta: Some(i64::MAX),
            ..rule("huge")
        });
        assert_eq!(RiskEngine::new(&cfg).unwrap().score(&call()).score, 100);

        let mut cfg = ladder();
        cfg.rules.push(RiskRule {
            score_delta: Some(-50),
            ..rule("negative")
        });
        assert_eq!(RiskEngine::new(&cfg).unwrap().score(&call()).score, 0);
    }

    #[test]
    fn wildcards_and_flattened_args_gate_rules() {
        let mut cfg = ladder();
        let mut payments = RiskRule {
            score_delta: Some(45),
            ..rule("big_payment")
        };
        payments.when.tool = "pay*".to_string();
        payments.when.env = "prod".to_string();
        payments.when.expr = Some("amount >= 1000".to_string());
        cfg.rules.push(payments);
        let engine = RiskEngine::new(&cfg).unwrap();

        let big = ToolCall::new("bank", "pay_invoice", "prod").with_args(json!({"amount": 2500}));
        assert_eq!(engine.score(&big).matched_rules, vec!["big_payment"]);

        let small = ToolCall::new("bank", "pay_invoice", "prod").with_args(json!({"amount": 10}));
        assert!(engine.score(&small).matched_rules.is_empty());

        let dev = ToolCall::new("bank", "pay_invoice", "dev").with_args(json!({"amount": 2500}));
        assert!(engine.score(&dev).matched_rules.is_empty());
    }

    #[test]
    fn unbound_rule_expression_does_not_fire() {
        let mut cfg = ladder();
        let mut r = RiskRule {
            set_mode: Some("danger".to_string()),
            ..rule("needs_amount")
        };
        r.when.expr = Some("amount > 1".to_string());
        cfg.rules.push(r);
        let result = RiskEngine::new(&cfg).unwrap().score(&call());
        assert_eq!(result.mode, "safe");
        assert!(result.reasons[0].contains("unbound name 'amount'"));
    }

    #[test]
    fn vars_are_computed_in_order_and_failures_bind_zero() {
        let mut cfg = ladder();
        cfg.vars = vec![
            VarDef {
                name: "norm".to_string(),
                expr: "min(100, amount / 10)".to_string(),
            },
            VarDef {
                name: "double".to_string(),
                expr: "norm * 2".to_string(),
            },
            VarDef {
                name: "broken".to_string(),
                expr: "missing + 1".to_string(),
            },
        ];
        cfg.rules.push(RiskRule {
            score_expr: Some("double + broken".to_string()),
            ..rule("use_vars")
        });
        let engine = RiskEngine::new(&cfg).unwrap();
        let result = engine.score(&call().with_args(json!({"amount": 200})));
        assert_eq!(result.score, 40);
        assert!(result.reasons.iter().any(|r| r.contains("var 'broken'")));
    }

    #[test]
    fn defective_rules_are_skipped_with_diagnostics() {
        let mut cfg = ladder();
        cfg.rules.push(rule("no_action"));
        cfg.rules.push(RiskRule {
            set_mode: Some("panic".to_string()),
            ..rule("unknown_mode")
        });
        cfg.rules.push(RiskRule {
            score_delta: Some(1),
            escalate: Some(crate::config::Escalation::OneLevel),
            ..rule("two_actions")
        });
        let mut bad_glob = RiskRule {
            score_delta: Some(1),
            ..rule("bad_glob")
        };
        bad_glob.when.tool = "[oops".to_string();
        cfg.rules.push(bad_glob);
        cfg.rules.push(RiskRule {
            score_expr: Some("score +".to_string()),
            ..rule("bad_expr")
        });
        cfg.rules.push(RiskRule {
            score_delta: Some(10),
            ..rule("fine")
        });
        cfg.vars.push(VarDef {
            name: "score".to_string(),
            expr: "1".to_string(),
        });

        let engine = RiskEngine::new(&cfg).unwrap();
        assert_eq!(engine.rule_count(), 1);
        assert_eq!(engine.diagnostics().len(), 6);
        assert!(engine.diagnostics()[0].location.starts_with("vars.score"));
        assert!(engine.diagnostics()[2].problem.contains("unknown mode 'panic'"));

        let result = engine.score(&call());
        assert_eq!(result.matched_rules, vec!["fine"]);
        assert_eq!(result.score, 10);
    }

    #[test]
    fn construction_errors() {
        assert!(matches!(
            RiskEngine::new(&RiskConfig::default()),
            Err(RiskError::NoModes)
        ));

        let mut tie = ladder();
        tie.modes.insert("also_safe".to_string(), ModeDef { score: 0 });
        assert!(matches!(
            RiskEngine::new(&tie),
            Err(RiskError::AmbiguousModeOrder { score: 0, .. })
        ));

        let mut unknown = ladder();
        unknown
            .set_mode_by_score
            .insert("extreme".to_string(), "score > 99".to_string());
        assert!(matches!(
            RiskEngine::new(&unknown),
            Err(RiskError::UnknownThresholdMode { .. })
        ));

        let mut bad = ladder();
        bad.set_mode_by_score
            .insert("danger".to_string(), "score >>".to_string());
        match RiskEngine::new(&bad) {
            Err(RiskError::InvalidThreshold { mode, .. }) => assert_eq!(mode, "danger"),
            other => panic!("expected InvalidThreshold, got {:?}", other),
        }
    }

    #[test]
    fn unmatched_thresholds_keep_rule_mode() {
        let mut cfg = ladder();
        cfg.set_mode_by_score
            .insert("danger".to_string(), "score >= 90".to_string());
        cfg.rules.push(RiskRule {
            set_mode: Some("review".to_string()),
            ..rule("review")
        });
        let result = RiskEngine::new(&cfg).unwrap().score(&call());
        assert_eq!(result.mode, "review");
        assert!(result
            .reasons
            .last()
            .is_some_and(|r| r.contains("no set_mode_by_score threshold")));
    }

    #[test]
    fn final_mode_satisfies_its_threshold_across_scores() {
        for delta in [-10, 0, 15, 39, 40, 41, 69, 70, 95, 300] {
            let mut cfg = with_thresholds(ladder());
            cfg.rules.push(RiskRule {
                set_mode: Some("danger".to_string()),
                ..rule("force_danger")
            });
            cfg.rules.push(RiskRule {
                score_expr: Some(format!("{} - score", delta)),
                ..rule("reset")
            });
            let result = RiskEngine::new(&cfg).unwrap().score(&call());
            let threshold = Expr::parse(&cfg.set_mode_by_score[&result.mode]).unwrap();
            let ctx = Context::new().with("score", result.score);
            assert!(
                threshold.eval_bool(&ctx).unwrap(),
                "mode {} disagrees with score {}",
                result.mode,
                result.score
            );
        }
    }
}
