// fixtures.rs - Named policy test cases.
//
// ```yaml
// tests:
//   - name: prod deletes are denied
//     input: { server: db, tool: delete_table, env: prod }
//     expect: deny
// ```
//
// Each input is scored by the risk engine and decided by the policy engine
// exactly as a live request would be, without touching the ledger.

use std::fmt;
use std::path::Path;

use ctrl_risk::{RiskEngine, ToolCall};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{PolicyEngine, Verdict};
use crate::error::PolicyError;
use crate::rule::read_file;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureFile {
    #[serde(default)]
    pub tests: Vec<Fixture>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
    #[serde(default = "unnamed")]
    pub name: String,
    #[serde(default)]
    pub input: FixtureInput,
    pub expect: Verdict,
}

fn unnamed() -> String {
    "<unnamed>".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureInput {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl FixtureInput {
    pub fn to_call(&self) -> ToolCall {
        let mut call = ToolCall::new(&self.server, &self.tool, &self.env);
        if let Some(args) = &self.args {
            call = call.with_args(args.clone());
        }
        call.actor = self.actor.clone();
        call
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureOutcome {
    pub name: String,
    pub input: FixtureInput,
    pub expected: Verdict,
    pub got: Verdict,
    pub matched_policy_id: Option<String>,
    pub risk_mode: String,
    pub passed: bool,
}

impl fmt::Display for FixtureOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = format!(
            "{}.{} env={}",
            self.input.server, self.input.tool, self.input.env
        );
        if self.passed {
            write!(f, "PASS {}  ({}) => {}", self.name, target, self.got)
        } else {
            write!(
                f,
                "FAIL {}  ({}) => got {}, expected {}",
                self.name, target, self.got, self.expected
            )
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureReport {
    pub outcomes: Vec<FixtureOutcome>,
    pub failures: usize,
}

impl FixtureReport {
    pub fn passed(&self) -> bool {
        self.failures == 0
    }
}

pub fn load_fixtures(path: &Path) -> Result<FixtureFile, PolicyError> {
    let text = read_file(path)?;
    Ok(serde_yaml::from_str::<Option<FixtureFile>>(&text)?.unwrap_or_default())
}

pub fn run_fixtures(fixtures: &FixtureFile, policy: &PolicyEngine, risk: &RiskEngine) -> FixtureReport {
    let mut report = FixtureReport::default();
    for fixture in &fixtures.tests {
        let call = fixture.input.to_call();
        let risk_result = risk.score(&call);
        let decision = policy.decide(&call, &risk_result);
        let passed = decision.verdict == fixture.expect;
        if !passed {
            report.failures += 1;
        }
        report.outcomes.push(FixtureOutcome {
            name: fixture.name.clone(),
            input: fixture.input.clone(),
            expected: fixture.expect,
            got: decision.verdict,
            matched_policy_id: decision.matched_policy_id,
            risk_mode: risk_result.mode,
            passed,
        });
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::PolicyConfig;
    use ctrl_risk::RiskConfig;

    const POLICY: &str = r#"
policies:
  - id: no-prod-deletes
    match: { tool: "*delete*", env: prod }
    effect: deny
  - id: big-payments
    match: { tool: pay }
    effect: allow
    require_approval_if: "args.amount >= 1000"
  - id: default
    effect: allow
"#;

    const FIXTURES: &str = r#"
tests:
  - name: prod delete
    input: { server: db, tool: delete_table, env: prod }
    expect: deny
  - name: small payment
    input: { server: bank, tool: pay, env: prod, args: { amount: 10 } }
    expect: allow
  - name: big payment
    input: { server: bank, tool: pay, env: prod, args: { amount: 5000 } }
    expect: pending
  - input: { server: db, tool: delete_table, env: dev }
    expect: deny
"#;

    #[test]
    fn runs_fixtures_and_counts_failures() {
        let policy = PolicyEngine::new(&PolicyConfig::from_yaml(POLICY).unwrap()).unwrap();
        let risk = RiskEngine::new(&RiskConfig::minimal()).unwrap();
        let fixtures: FixtureFile = serde_yaml::from_str(FIXTURES).unwrap();

        let report = run_fixtures(&fixtures, &policy, &risk);
        assert_eq!(report.outcomes.len(), 4);
        assert_eq!(report.failures, 1);
        assert!(!report.passed());

        let failed = &report.outcomes[3];
        assert_eq!(failed.name, "<unnamed>");
        assert_eq!(failed.got, Verdict::Allow);
        assert_eq!(
            failed.to_string(),
            "FAIL <unnamed>  (db.delete_table env=dev) => got allow, expected deny"
        );
        assert_eq!(report.outcomes[2].got, Verdict::Hold);
        assert!(report.outcomes[0].to_string().starts_with("PASS prod delete"));
    }

    #[test]
    fn loads_fixture_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy_tests.yaml");
        std::fs::write(&path, FIXTURES).unwrap();
        assert_eq!(load_fixtures(&path).unwrap().tests.len(), 4);

        std::fs::write(&path, "").unwrap();
        assert!(load_fixtures(&path).unwrap().tests.is_empty());
    }
}
