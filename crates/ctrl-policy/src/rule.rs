// rule.rs - Policy document types (`policy.yaml`).
//
// ```yaml
// policies:
//   - id: no-prod-deletes
//     match: { tool: "*delete*", env: prod }
//     effect: deny
//     reason: destructive operation in prod
//   - id: default-allow
//     match: {}
//     effect: allow
//     require_approval_if: "risk.mode in ['review', 'danger']"
// ```

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// What a matching rule does before its guards are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
    /// Hold for human approval. `pending` is accepted as an alias.
    #[serde(alias = "pending")]
    Hold,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Allow => write!(f, "allow"),
            Effect::Deny => write!(f, "deny"),
            Effect::Hold => write!(f, "hold"),
        }
    }
}

/// Per-field wildcards. Absent fields match anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMatch {
    #[serde(default = "any")]
    pub server: String,
    #[serde(default = "any")]
    pub tool: String,
    #[serde(default = "any")]
    pub env: String,
}

fn any() -> String {
    "*".to_string()
}

impl Default for PolicyMatch {
    fn default() -> Self {
        Self {
            server: any(),
            tool: any(),
            env: any(),
        }
    }
}

impl PolicyMatch {
    pub fn new(server: &str, tool: &str, env: &str) -> Self {
        Self {
            server: server.to_string(),
            tool: tool.to_string(),
            env: env.to_string(),
        }
    }

    /// `*` on every field.
    pub fn is_catch_all(&self) -> bool {
        self.server == "*" && self.tool == "*" && self.env == "*"
    }
}

impl fmt::Display for PolicyMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server={} tool={} env={}", self.server, self.tool, self.env)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    #[serde(rename = "match", default)]
    pub matcher: PolicyMatch,
    pub effect: Effect,
    #[serde(default)]
    pub reason: String,
    /// Guard that turns an `allow` into a `deny`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny: Option<String>,
    /// Guard that turns an `allow` into a `hold`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_approval_if: Option<String>,
}

impl PolicyRule {
    pub fn new(id: &str, matcher: PolicyMatch, effect: Effect) -> Self {
        Self {
            id: id.to_string(),
            matcher,
            effect,
            reason: String::new(),
            deny: None,
            require_approval_if: None,
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = reason.to_string();
        self
    }

    pub fn with_deny_guard(mut self, expr: &str) -> Self {
        self.deny = Some(expr.to_string());
        self
    }

    pub fn with_approval_guard(mut self, expr: &str) -> Self {
        self.require_approval_if = Some(expr.to_string());
        self
    }
}

/// An ordered policy set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub policies: Vec<PolicyRule>,
}

impl PolicyConfig {
    pub fn new(policies: Vec<PolicyRule>) -> Self {
        Self { policies }
    }

    /// Parse YAML without checking ids. Used by `lint`, which reports
    /// duplicates itself.
    pub fn parse(text: &str) -> Result<Self, PolicyError> {
        Ok(serde_yaml::from_str::<Option<Self>>(text)?.unwrap_or_default())
    }

    /// Parse and validate ids.
    pub fn from_yaml(text: &str) -> Result<Self, PolicyError> {
        let config = Self::parse(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Ids must be present and unique.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let mut seen = HashSet::new();
        for (index, rule) in self.policies.iter().enumerate() {
            if rule.id.trim().is_empty() {
                return Err(PolicyError::EmptyId { index });
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(PolicyError::DuplicateId {
                    id: rule.id.clone(),
                });
            }
        }
        Ok(())
    }
}

pub(crate) fn read_file(path: &Path) -> Result<String, PolicyError> {
    std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Load and validate a `policy.yaml` file.
pub fn load_policy_config(path: &Path) -> Result<PolicyConfig, PolicyError> {
    PolicyConfig::from_yaml(&read_file(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_policy_document_with_defaults() {
        let text = r#"
policies:
  - id: no-prod-deletes
    match: { tool: "*delete*", env: prod }
    effect: deny
    reason: destructive
  - id: legacy
    match: { server: legacy }
    effect: pending
  - id: default
    effect: allow
    require_approval_if: "risk.score >= 40"
"#;
        let cfg = PolicyConfig::from_yaml(text).unwrap();
        assert_eq!(cfg.policies.len(), 3);
        assert_eq!(cfg.policies[0].matcher.server, "*");
        assert_eq!(cfg.policies[1].effect, Effect::Hold);
        assert!(cfg.policies[2].matcher.is_catch_all());
        assert_eq!(
            cfg.policies[0].matcher.to_string(),
            "server=* tool=*delete* env=prod"
        );
    }

    #[test]
    fn unknown_effect_is_a_parse_error() {
        let text = "policies:\n  - id: a\n    effect: maybe\n";
        assert!(matches!(
            PolicyConfig::from_yaml(text),
            Err(PolicyError::Parse(_))
        ));
    }

    #[test]
    fn duplicate_and_empty_ids_are_rejected() {
        let text = "policies:\n  - { id: a, effect: allow }\n  - { id: a, effect: deny }\n";
        match PolicyConfig::from_yaml(text) {
            Err(PolicyError::DuplicateId { id }) => assert_eq!(id, "a"),
            other => panic!("expected DuplicateId, got {:?}", other),
        }
        assert!(PolicyConfig::parse(text).is_ok());

        let text = "policies:\n  - { id: ' ', effect: allow }\n";
        assert!(matches!(
            PolicyConfig::from_yaml(text),
            Err(PolicyError::EmptyId { index: 0 })
        ));
    }

    #[test]
    fn empty_document_is_an_empty_policy() {
        assert!(PolicyConfig::from_yaml("").unwrap().policies.is_empty());
        assert!(PolicyConfig::from_yaml("policies: []").unwrap().policies.is_empty());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        std::fs::write(&path, "policies:\n  - { id: all, effect: allow }\n").unwrap();
        assert_eq!(load_policy_config(&path).unwrap().policies[0].id, "all");
        assert!(matches!(
            load_policy_config(&dir.path().join("nope.yaml")),
            Err(PolicyError::Io { .. })
        ));
    }
}
