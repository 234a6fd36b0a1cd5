// validate.rs - validate-config: load every configured document, make sure
// the ledger exists and is migrated, and report.

use ctrl_gateway::{load_servers_config, CtrlConfig};
use ctrl_policy::{load_policy_config, PolicyEngine};
use ctrl_risk::{load_risk_config, RiskEngine};

/// Outcome of loading one document.
#[derive(Debug)]
pub struct Check {
    pub document: &'static str,
    pub ok: bool,
    pub detail: String,
    /// Non-fatal problems, such as risk rules skipped at compile time.
    pub warnings: Vec<String>,
}

impl Check {
    fn pass(document: &'static str, detail: String) -> Self {
        Self {
            document,
            ok: true,
            detail,
            warnings: Vec::new(),
        }
    }

    fn fail(document: &'static str, err: impl std::fmt::Display) -> Self {
        Self {
            document,
            ok: false,
            detail: err.to_string(),
            warnings: Vec::new(),
        }
    }
}

pub fn execute(config: &CtrlConfig) -> anyhow::Result<()> {
    let checks = check_all(config);
    for check in &checks {
        let label = if check.ok { "OK  " } else { "FAIL" };
        println!("{} {:<8} {}", label, check.document, check.detail);
        for warning in &check.warnings {
            println!("     WARN {}", warning);
        }
    }

    let failed = checks.iter().filter(|c| !c.ok).count();
    if failed > 0 {
        anyhow::bail!("{} configuration document(s) failed to load", failed);
    }
    println!("Configuration valid.");
    Ok(())
}

pub fn check_all(config: &CtrlConfig) -> Vec<Check> {
    vec![
        check_servers(config),
        check_policy(config),
        check_risk(config),
        check_ledger(config),
    ]
}

fn check_ledger(config: &CtrlConfig) -> Check {
    match super::open_ledger(config).and_then(|l| Ok(l.applied_migrations()?)) {
        Ok(applied) => Check::pass(
            "ledger",
            format!(
                "{} at schema {}",
                config.db_path.display(),
                applied.last().map(String::as_str).unwrap_or("none")
            ),
        ),
        Err(e) => Check::fail("ledger", format!("{e:#}")),
    }
}

fn check_servers(config: &CtrlConfig) -> Check {
    match load_servers_config(&config.servers_path) {
        Ok(servers) => Check::pass(
            "servers",
            format!(
                "{} server(s) in {}",
                servers.servers.len(),
                config.servers_path.display()
            ),
        ),
        Err(e) => Check::fail("servers", e),
    }
}

fn check_policy(config: &CtrlConfig) -> Check {
    let engine = load_policy_config(&config.policy_path).and_then(|p| PolicyEngine::new(&p));
    match engine {
        Ok(engine) => Check::pass(
            "policy",
            format!(
                "{} rule(s) in {}",
                engine.len(),
                config.policy_path.display()
            ),
        ),
        Err(e) => Check::fail("policy", e),
    }
}

fn check_risk(config: &CtrlConfig) -> Check {
    if !config.risk_path.exists() {
        let mut check = Check::pass(
            "risk",
            format!("{} not found, every call scores safe", config.risk_path.display()),
        );
        check.warnings.push("no risk document configured".to_string());
        return check;
    }
    let engine = load_risk_config(&config.risk_path).and_then(|r| RiskEngine::new(&r));
    match engine {
        Ok(engine) => {
            let mut check = Check::pass(
                "risk",
                format!(
                    "{} rule(s), default mode {} in {}",
                    engine.rule_count(),
                    engine.default_mode(),
                    config.risk_path.display()
                ),
            );
            check.warnings = engine
                .diagnostics()
                .iter()
                .map(|d| format!("skipped {}", d))
                .collect();
            check
        }
        Err(e) => Check::fail("risk", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testutil::config_in;
    use tempfile::TempDir;

    #[test]
    fn valid_documents_pass() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path());
        let checks = check_all(&config);
        assert!(checks.iter().all(|c| c.ok), "{checks:?}");
        assert!(checks[1].detail.starts_with("3 rule(s)"));
        assert!(checks[3].detail.ends_with("003_append_only_guards"));
        assert!(config.db_path.exists());
        assert!(execute(&config).is_ok());
    }

    #[test]
    fn broken_policy_and_missing_servers_fail() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path());
        std::fs::write(
            &config.policy_path,
            "policies:\n  - {id: a, effect: allow}\n  - {id: a, effect: deny}\n",
        )
        .unwrap();
        std::fs::remove_file(&config.servers_path).unwrap();

        let checks = check_all(&config);
        assert!(!checks[0].ok);
        assert!(!checks[1].ok);
        assert!(checks[2].ok);
        assert!(checks[3].ok);
        assert!(execute(&config).is_err());
    }

    #[test]
    fn skipped_risk_rules_are_warnings() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path());
        std::fs::write(
            &config.risk_path,
            r#"
risk:
  modes: {safe: {score: 0}}
  rules:
    - name: broken
      when: {tool: "*"}
      reason: no action given
"#,
        )
        .unwrap();
        let risk = check_risk(&config);
        assert!(risk.ok);
        assert_eq!(risk.warnings.len(), 1);
        assert!(risk.warnings[0].contains("broken"));
    }

    #[test]
    fn missing_risk_document_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(dir.path());
        config.risk_path = dir.path().join("absent.yaml");
        let risk = check_risk(&config);
        assert!(risk.ok);
        assert!(!risk.warnings.is_empty());
    }
}
