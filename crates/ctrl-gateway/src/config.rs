// config.rs - Process settings (ctrl.toml) and the external server registry.
//
// CtrlConfig decides where the ledger lives, which YAML documents define the
// engines, and the timing knobs for dispatch and stale-request recovery.
// A missing ctrl.toml means defaults; CTRL_* environment variables override
// the file's paths.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

pub const DEFAULT_CONFIG_FILE: &str = "ctrl.toml";

/// Settings for one ctrl process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CtrlConfig {
    /// SQLite ledger file.
    pub db_path: PathBuf,
    pub servers_path: PathBuf,
    pub policy_path: PathBuf,
    /// Risk document. When the file does not exist a single `safe` mode is used.
    pub risk_path: PathBuf,
    /// Environment tag for calls that do not carry one.
    pub default_env: String,
    pub approvals: ApprovalsConfig,
    pub dispatch: DispatchConfig,
    pub recovery: RecoveryConfig,
    pub http: HttpConfig,
}

impl Default for CtrlConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("ctrl.db"),
            servers_path: PathBuf::from("configs/servers.yaml"),
            policy_path: PathBuf::from("configs/policy.yaml"),
            risk_path: PathBuf::from("configs/risk.yaml"),
            default_env: "dev".to_string(),
            approvals: ApprovalsConfig::default(),
            dispatch: DispatchConfig::default(),
            recovery: RecoveryConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalsConfig {
    /// When false, a hold verdict is recorded as deny.
    pub enabled: bool,
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// How long a request may sit in approved/executing before it is reported.
    pub stale_after_secs: u64,
    /// Period of the daemon's stale scan.
    pub scan_interval_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 300,
            scan_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
        }
    }
}

impl CtrlConfig {
    /// Load settings from `path` (default `ctrl.toml`), then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, GatewayError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text).map_err(|source| GatewayError::Settings {
                path: path.display().to_string(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(GatewayError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `CTRL_DB_PATH`, `CTRL_SERVERS_PATH`, `CTRL_POLICY_PATH` and
    /// `CTRL_RISK_PATH` as returned by `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let overrides: [(&str, &mut PathBuf); 4] = [
            ("CTRL_DB_PATH", &mut self.db_path),
            ("CTRL_SERVERS_PATH", &mut self.servers_path),
            ("CTRL_POLICY_PATH", &mut self.policy_path),
            ("CTRL_RISK_PATH", &mut self.risk_path),
        ];
        for (key, slot) in overrides {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *slot = PathBuf::from(value);
            }
        }
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.timeout_secs.max(1))
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.recovery.stale_after_secs).unwrap_or(i64::MAX))
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.recovery.scan_interval_secs.max(1))
    }
}

/// How the gateway reaches an external action server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDef {
    pub name: String,
    pub transport: Transport,
    pub base_url: String,
}

/// Contents of `servers.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServersConfig {
    #[serde(default)]
    pub servers: Vec<ServerDef>,
    /// Free-form defaults shared by adapters (e.g. `env`).
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
}

impl ServersConfig {
    pub fn from_yaml(text: &str) -> Result<Self, GatewayError> {
        let config: Self = serde_yaml::from_str::<Option<Self>>(text)?.unwrap_or_default();
        let mut seen = HashSet::new();
        for server in &config.servers {
            if !seen.insert(server.name.as_str()) {
                return Err(GatewayError::DuplicateServer {
                    name: server.name.clone(),
                });
            }
        }
        Ok(config)
    }

    pub fn get(&self, name: &str) -> Option<&ServerDef> {
        self.servers.iter().find(|s| s.name == name)
    }
}

pub fn load_servers_config(path: &Path) -> Result<ServersConfig, GatewayError> {
    let text = std::fs::read_to_string(path).map_err(|source| GatewayError::Io {
        path: path.display().to_string(),
        source,
    })?;
    ServersConfig::from_yaml(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = CtrlConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(loaded.http.bind, "127.0.0.1:8787");
        assert_eq!(loaded.dispatch.timeout_secs, 30);
        assert_eq!(loaded.recovery.stale_after_secs, 300);
        assert_eq!(loaded.default_env, "dev");
        assert!(loaded.approvals.enabled);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = CtrlConfig::from_toml(
            r#"
db_path = "/var/lib/ctrl/ledger.db"

[approvals]
enabled = false

[recovery]
stale_after_secs = 60
"#,
        )
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/ctrl/ledger.db"));
        assert!(!config.approvals.enabled);
        assert_eq!(config.recovery.stale_after_secs, 60);
        assert_eq!(config.recovery.scan_interval_secs, 60);
        assert_eq!(config.policy_path, PathBuf::from("configs/policy.yaml"));
    }

    #[test]
    fn environment_overrides_win() {
        let mut config = CtrlConfig::from_toml("db_path = \"file.db\"").unwrap();
        config.apply_env_overrides(|key| match key {
            "CTRL_DB_PATH" => Some("env.db".to_string()),
            "CTRL_RISK_PATH" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.db_path, PathBuf::from("env.db"));
        assert_eq!(config.risk_path, PathBuf::from("configs/risk.yaml"));
    }

    #[test]
    fn servers_must_have_unique_names() {
        let ok = ServersConfig::from_yaml(
            "servers:\n  - {name: github, transport: http, base_url: 'http://localhost:9001/mcp'}\n",
        )
        .unwrap();
        assert_eq!(ok.get("github").unwrap().transport, Transport::Http);
        assert!(ok.get("slack").is_none());

        let dup = ServersConfig::from_yaml(
            "servers:\n  - {name: a, transport: http, base_url: 'http://x'}\n  - {name: a, transport: http, base_url: 'http://y'}\n",
        );
        assert!(matches!(dup, Err(GatewayError::DuplicateServer { name }) if name == "a"));
    }

    #[test]
    fn unsupported_transport_is_rejected() {
        let err = ServersConfig::from_yaml(
            "servers:\n  - {name: a, transport: stdio, base_url: 'x'}\n",
        );
        assert!(matches!(err, Err(GatewayError::Servers(_))));
    }
}
