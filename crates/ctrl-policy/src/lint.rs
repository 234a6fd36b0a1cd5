// lint.rs - Static checks over a policy set.
//
// Errors make the policy unloadable; warnings are smells worth a look:
//
// - no catch-all rule (unmatched traffic falls through to the default deny)
// - a rule shadowed by an earlier one whose wildcards cover it
// - hold effects or approval guards while approvals are disabled
// - guards on `deny`/`hold` rules (they are never evaluated)
// - guards referencing names the guard context does not provide

use std::collections::HashSet;
use std::fmt;

use ctrl_risk::{Expr, Wildcard};
use serde::{Deserialize, Serialize};

use crate::engine::GUARD_NAMES;
use crate::rule::{Effect, PolicyRule};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintFinding {
    pub severity: Severity,
    /// Rule the finding is about, if any.
    pub policy_id: Option<String>,
    pub message: String,
}

impl fmt::Display for LintFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity {
            Severity::Error => "ERR ",
            Severity::Warning => "WARN",
        };
        match &self.policy_id {
            Some(id) => write!(f, "{} [{}] {}", label, id, self.message),
            None => write!(f, "{} {}", label, self.message),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LintReport {
    pub findings: Vec<LintFinding>,
}

impl LintReport {
    pub fn errors(&self) -> impl Iterator<Item = &LintFinding> {
        self.findings.iter().filter(|f| f.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &LintFinding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    fn error(&mut self, policy_id: Option<&str>, message: String) {
        self.push(Severity::Error, policy_id, message);
    }

    fn warn(&mut self, policy_id: Option<&str>, message: String) {
        self.push(Severity::Warning, policy_id, message);
    }

    fn push(&mut self, severity: Severity, policy_id: Option<&str>, message: String) {
        self.findings.push(LintFinding {
            severity,
            policy_id: policy_id.map(str::to_string),
            message,
        });
    }
}

/// Deployment facts lint needs that the policy itself does not carry.
#[derive(Debug, Clone)]
pub struct LintOptions {
    /// Whether a human approval path is configured.
    pub approvals_enabled: bool,
}

impl Default for LintOptions {
    fn default() -> Self {
        Self {
            approvals_enabled: true,
        }
    }
}

pub fn lint(rules: &[PolicyRule], options: &LintOptions) -> LintReport {
    let mut report = LintReport::default();

    let mut seen = HashSet::new();
    for rule in rules {
        if rule.id.trim().is_empty() {
            report.error(None, "policy with an empty id".to_string());
        } else if !seen.insert(rule.id.as_str()) {
            report.error(Some(&rule.id), "duplicate policy id".to_string());
        }
    }

    // Compiled wildcards; `None` where the pattern is invalid.
    let mut compiled = Vec::with_capacity(rules.len());
    for rule in rules {
        let mut fields = Vec::with_capacity(3);
        for (field, pattern) in [
            ("server", &rule.matcher.server),
            ("tool", &rule.matcher.tool),
            ("env", &rule.matcher.env),
        ] {
            match Wildcard::new(pattern) {
                Ok(w) => fields.push(w),
                Err(e) => report.error(
                    Some(&rule.id),
                    format!("invalid {} pattern '{}': {}", field, pattern, e),
                ),
            }
        }
        compiled.push(if fields.len() == 3 { Some(fields) } else { None });
    }

    if !rules.iter().any(|r| r.matcher.is_catch_all()) {
        report.warn(
            None,
            "no catch-all policy (server=* tool=* env=*); unmatched requests are denied"
                .to_string(),
        );
    }

    for (j, later) in rules.iter().enumerate() {
        let Some(later_fields) = &compiled[j] else { continue };
        for (i, earlier) in rules.iter().enumerate().take(j) {
            let Some(earlier_fields) = &compiled[i] else { continue };
            // A guarded allow can still fall through to a deny or hold, but
            // never to a later rule: first match is authoritative.
            if earlier_fields
                .iter()
                .zip(later_fields)
                .all(|(a, b)| a.covers(b))
            {
                report.warn(
                    Some(&later.id),
                    format!(
                        "unreachable: shadowed by '{}' (index {}, {})",
                        earlier.id, i, earlier.matcher
                    ),
                );
                break;
            }
        }
    }

    for rule in rules {
        let id = Some(rule.id.as_str());

        if !options.approvals_enabled {
            if rule.effect == Effect::Hold {
                report.warn(
                    id,
                    "effect is hold but approvals are disabled; held requests can never be resolved"
                        .to_string(),
                );
            }
            if rule.require_approval_if.is_some() {
                report.warn(
                    id,
                    "require_approval_if is set but approvals are disabled".to_string(),
                );
            }
        }

        for (guard, text) in [
            ("deny", &rule.deny),
            ("require_approval_if", &rule.require_approval_if),
        ] {
            let Some(text) = text else { continue };
            if rule.effect != Effect::Allow {
                report.warn(
                    id,
                    format!("{} guard is ignored on effect {}", guard, rule.effect),
                );
            }
            match Expr::parse(text) {
                Err(e) => report.error(id, format!("{} guard: {}", guard, e)),
                Ok(expr) => {
                    for name in expr.referenced_names() {
                        let root = name.split('.').next().unwrap_or_default();
                        if !GUARD_NAMES.contains(&root) {
                            report.warn(
                                id,
                                format!("{} guard references unknown name '{}'", guard, name),
                            );
                        }
                    }
                }
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::PolicyMatch;

    fn messages(report: &LintReport, severity: Severity) -> Vec<String> {
        report
            .findings
            .iter()
            .filter(|f| f.severity == severity)
            .map(|f| f.message.clone())
            .collect()
    }

    #[test]
    fn clean_policy_has_no_findings() {
        let rules = vec![
            PolicyRule::new("deny-deletes", PolicyMatch::new("*", "*delete*", "prod"), Effect::Deny),
            PolicyRule::new("default", PolicyMatch::default(), Effect::Allow)
                .with_approval_guard("risk.mode in ['review', 'danger']"),
        ];
        let report = lint(&rules, &LintOptions::default());
        assert!(report.findings.is_empty(), "{:?}", report.findings);
    }

    #[test]
    fn missing_catch_all_is_a_warning() {
        let rules = vec![PolicyRule::new("x", PolicyMatch::new("x", "*", "*"), Effect::Allow)];
        let report = lint(&rules, &LintOptions::default());
        assert!(!report.has_errors());
        assert!(messages(&report, Severity::Warning)[0].contains("no catch-all"));
    }

    #[test]
    fn detects_shadowed_rules() {
        let rules = vec![
            PolicyRule::new("github-any", PolicyMatch::new("github", "*", "*"), Effect::Allow),
            PolicyRule::new("github-merge", PolicyMatch::new("github", "merge", "prod"), Effect::Deny),
            PolicyRule::new("default", PolicyMatch::default(), Effect::Deny),
            PolicyRule::new("after-default", PolicyMatch::new("x", "y", "z"), Effect::Allow),
        ];
        let report = lint(&rules, &LintOptions::default());
        let shadowed: Vec<_> = report
            .warnings()
            .filter_map(|f| f.policy_id.clone())
            .collect();
        assert_eq!(shadowed, vec!["github-merge", "after-default"]);
    }

    #[test]
    fn errors_for_duplicates_patterns_and_guard_syntax() {
        let rules = vec![
            PolicyRule::new("a", PolicyMatch::new("[bad", "*", "*"), Effect::Allow),
            PolicyRule::new("a", PolicyMatch::default(), Effect::Allow).with_deny_guard("score >"),
        ];
        let report = lint(&rules, &LintOptions::default());
        let errors = messages(&report, Severity::Error);
        assert_eq!(errors.len(), 3);
        assert!(errors[0].contains("duplicate"));
        assert!(errors[1].contains("invalid server pattern"));
        assert!(errors[2].starts_with("deny guard"));
    }

    #[test]
    fn approval_paths_when_approvals_disabled() {
        let rules = vec![
            PolicyRule::new("held", PolicyMatch::new("s", "*", "*"), Effect::Hold),
            PolicyRule::new("default", PolicyMatch::default(), Effect::Allow)
                .with_approval_guard("risk_score > 50"),
        ];
        let off = LintOptions {
            approvals_enabled: false,
        };
        assert_eq!(lint(&rules, &off).warnings().count(), 2);
        assert_eq!(lint(&rules, &LintOptions::default()).warnings().count(), 0);
    }

    #[test]
    fn guard_warnings_for_ignored_and_unknown_names() {
        let rules = vec![
            PolicyRule::new("deny-x", PolicyMatch::new("x", "*", "*"), Effect::Deny)
                .with_deny_guard("risk_score > 1"),
            PolicyRule::new("default", PolicyMatch::default(), Effect::Allow)
                .with_approval_guard("score > 40 or risk.mode == 'danger'"),
        ];
        let warnings = messages(&lint(&rules, &LintOptions::default()), Severity::Warning);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("ignored on effect deny"));
        assert!(warnings[1].contains("unknown name 'score'"));
    }

    #[test]
    fn finding_display_includes_policy_id() {
        let finding = LintFinding {
            severity: Severity::Warning,
            policy_id: Some("p1".to_string()),
            message: "something".to_string(),
        };
        assert_eq!(finding.to_string(), "WARN [p1] something");
    }
}
