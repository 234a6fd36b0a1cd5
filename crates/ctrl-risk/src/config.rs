// config.rs - Risk configuration document (`risk.yaml`).
//
// Shape:
//
// ```yaml
// risk:
//   modes:
//     safe:   { score: 0 }
//     review: { score: 40 }
//     danger: { score: 70 }
//   vars:
//     amount_norm: "min(100, amount / 100)"
//   rules:
//     - name: script_in_html
//       when: { tool: "publish*", args: { html: { contains: "<script" } } }
//       set_mode: danger
//       reason: "inline script in published html"
//   set_mode_by_score:
//     danger: "score >= 70"
//     review: "score >= 40"
//     safe:   "score < 40"
// ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::RiskError;

/// Top-level `risk.yaml` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskDocument {
    pub risk: RiskConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Mode name -> baseline. Severity order is by ascending score.
    pub modes: BTreeMap<String, ModeDef>,
    /// Derived values, computed in declaration order.
    #[serde(default, with = "ordered_vars")]
    pub vars: Vec<VarDef>,
    #[serde(default)]
    pub rules: Vec<RiskRule>,
    /// Mode name -> threshold expression.
    #[serde(default)]
    pub set_mode_by_score: BTreeMap<String, String>,
}

impl RiskConfig {
    /// A single `safe` mode with baseline 0 and no rules.
    pub fn minimal() -> Self {
        let mut modes = BTreeMap::new();
        modes.insert("safe".to_string(), ModeDef { score: 0 });
        Self {
            modes,
            ..Self::default()
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self, RiskError> {
        let doc: RiskDocument = serde_yaml::from_str(text)?;
        Ok(doc.risk)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeDef {
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarDef {
    pub name: String,
    pub expr: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskRule {
    #[serde(default = "default_rule_name")]
    pub name: String,
    #[serde(default)]
    pub when: When,
    #[serde(default)]
    pub reason: String,

    // Actions. Exactly one must be present; the engine rejects the rest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate: Option<Escalation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_expr: Option<String>,
}

fn default_rule_name() -> String {
    "rule".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Escalation {
    OneLevel,
}

/// Match predicate of a risk rule. Every present part must hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct When {
    #[serde(default = "any")]
    pub server: String,
    #[serde(default = "any")]
    pub tool: String,
    #[serde(default = "any")]
    pub env: String,
    /// Dotted argument path -> predicate.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, ArgPredicate>,
    /// Optional expression over the scoring context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
}

impl Default for When {
    fn default() -> Self {
        Self {
            server: any(),
            tool: any(),
            env: any(),
            args: BTreeMap::new(),
            expr: None,
        }
    }
}

fn any() -> String {
    "*".to_string()
}

/// Test applied to one argument value. All present operators must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArgPredicate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eq: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ne: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    #[serde(default, rename = "in", skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<Value>>,
}

impl ArgPredicate {
    /// Evaluate against an argument value; a missing argument is `null`.
    pub fn holds(&self, value: Option<&Value>) -> bool {
        let value = value.unwrap_or(&Value::Null);
        let number = value.as_f64();

        if let Some(want) = &self.eq {
            if !json_eq(value, want) {
                return false;
            }
        }
        if let Some(unwanted) = &self.ne {
            if json_eq(value, unwanted) {
                return false;
            }
        }
        let bounds: [(Option<f64>, fn(f64, f64) -> bool); 4] = [
            (self.gt, |v, b| v > b),
            (self.gte, |v, b| v >= b),
            (self.lt, |v, b| v < b),
            (self.lte, |v, b| v <= b),
        ];
        for (bound, check) in bounds {
            if let Some(bound) = bound {
                match number {
                    Some(v) if check(v, bound) => {}
                    _ => return false,
                }
            }
        }
        if let Some(needle) = &self.contains {
            match value.as_str() {
                Some(text) if text.contains(needle.as_str()) => {}
                _ => return false,
            }
        }
        if let Some(options) = &self.one_of {
            if !options.iter().any(|option| json_eq(value, option)) {
                return false;
            }
        }
        true
    }
}

/// JSON equality where `1` and `1.0` are equal.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Load and parse a `risk.yaml` file.
pub fn load_risk_config(path: &Path) -> Result<RiskConfig, RiskError> {
    let text = std::fs::read_to_string(path).map_err(|source| RiskError::Io {
        path: path.display().to_string(),
        source,
    })?;
    RiskConfig::from_yaml(&text)
}

/// `vars` is written as a mapping but its order matters, so it is kept as
/// a list of definitions.
mod ordered_vars {
    use super::*;

    pub fn serialize<S: Serializer>(vars: &[VarDef], serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(vars.len()))?;
        for var in vars {
            map.serialize_entry(&var.name, &var.expr)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<VarDef>, D::Error> {
        deserializer.deserialize_any(VarsVisitor)
    }

    struct VarsVisitor;

    impl<'de> Visitor<'de> for VarsVisitor {
        type Value = Vec<VarDef>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a mapping of variable name to expression")
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut vars = Vec::new();
            while let Some((name, expr)) = access.next_entry::<String, String>()? {
                vars.push(VarDef { name, expr });
            }
            Ok(vars)
        }
    }
}
