// mod.rs - Subcommand modules and the helpers they share.

pub mod audit;
pub mod db;
pub mod policy;
pub mod requests;
pub mod validate;

use anyhow::Context;
use ctrl_gateway::CtrlConfig;
use ctrl_ledger::Ledger;

/// Open the configured ledger and apply any pending migrations.
pub(crate) fn open_ledger(config: &CtrlConfig) -> anyhow::Result<Ledger> {
    let ledger = Ledger::open(&config.db_path)
        .with_context(|| format!("failed to open ledger at {}", config.db_path.display()))?;
    let applied = ledger.migrate()?;
    tracing::debug!(path = %config.db_path.display(), ?applied, "ledger ready");
    Ok(ledger)
}

/// Cut `text` to at most `max` characters, marking the cut with "...".
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::Path;

    use ctrl_gateway::CtrlConfig;

    pub const POLICY: &str = r#"
policies:
  - id: no-prod-deletes
    match: {tool: "delete_*", env: prod}
    effect: deny
    reason: deletes in prod are never automatic
  - id: publish-review
    match: {server: cms, tool: "publish_*"}
    effect: allow
    require_approval_if: "risk.score >= 40"
  - id: default-allow
    match: {}
    effect: allow
"#;

    pub const RISK: &str = r#"
risk:
  modes:
    safe: {score: 0}
    review: {score: 40}
    danger: {score: 80}
  rules:
    - name: prod
      when: {env: prod}
      reason: production target
      escalate: one_level
"#;

    /// Write policy and risk documents into `dir` and point a config at them.
    pub fn config_in(dir: &Path) -> CtrlConfig {
        std::fs::write(dir.join("policy.yaml"), POLICY).unwrap();
        std::fs::write(dir.join("risk.yaml"), RISK).unwrap();
        std::fs::write(
            dir.join("servers.yaml"),
            "servers:\n  - {name: cms, transport: http, base_url: \"http://127.0.0.1:9\"}\n",
        )
        .unwrap();
        CtrlConfig {
            db_path: dir.join("ctrl.db"),
            servers_path: dir.join("servers.yaml"),
            policy_path: dir.join("policy.yaml"),
            risk_path: dir.join("risk.yaml"),
            ..CtrlConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_marks_cut_text() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }
}
