use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Resolve the agent data directory in a platform-appropriate location.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir().unwrap_or(std::env::temp_dir()).join("mesh-agent")
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("mesh-agent").join("config.toml"))
}

fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-node".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Unique identifier of this node (defaults to the host name).
    pub node_id: String,
    pub data_dir: PathBuf,
    /// Overwrite the cloud-reported master with this node.
    pub force_master: bool,
    /// Run without pairing or a cloud directory: this node is its own single-node mesh.
    pub no_cloud: bool,
    pub board_type: Option<String>,
    pub mqtt: MqttConfig,
    pub cloud: CloudConfig,
    pub discovery: DiscoveryConfig,
    pub orphan: OrphanConfig,
    pub bridge: BridgeConfig,
    pub retry: RetryConfig,
    pub orchestrator: OrchestratorConfig,
    pub restart: RestartConfig,
    /// Bind address of the metrics endpoint; empty disables it.
    pub metrics_addr: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            data_dir: default_data_dir(),
            force_master: false,
            no_cloud: false,
            board_type: None,
            mqtt: MqttConfig::default(),
            cloud: CloudConfig::default(),
            discovery: DiscoveryConfig::default(),
            orphan: OrphanConfig::default(),
            bridge: BridgeConfig::default(),
            retry: RetryConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            restart: RestartConfig::default(),
            metrics_addr: "127.0.0.1:9921".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Port advertised to peers for the master-side bridge connection.
    pub advertised_port: u16,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self { host: "localhost".to_string(), port: 1883, advertised_port: 1883 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Activation URL template; `{node_id}`, `{ip}` and `{board}` are substituted.
    pub activation_url: String,
    /// Node directory URL template; `{token}` is substituted.
    pub nodes_url: String,
    /// Site directory URL template; `{token}` is substituted.
    pub sites_url: String,
    /// Upstream URL handed to the local bridge when this node is master.
    pub bridge_url: String,
    pub allow_self_signed: bool,
    pub request_timeout_secs: u64,
    pub activation_timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            activation_url: "https://api.example.com/rest/v1/nodes/{node_id}/activate?ip={ip}&board={board}".to_string(),
            nodes_url: "https://api.example.com/rest/v1/nodes?access_token={token}".to_string(),
            sites_url: "https://api.example.com/rest/v1/sites?access_token={token}".to_string(),
            bridge_url: "ssl://mqtt.example.com:8883".to_string(),
            allow_self_signed: false,
            request_timeout_secs: 30,
            activation_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub service_type: String,
    pub setup_service_type: String,
    pub setup_port: u16,
    pub interval_secs: u64,
    pub window_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: "_ninja-homecloud-mqtt._tcp.local.".to_string(),
            setup_service_type: "_ninja-setup-assistant-rest._tcp.local.".to_string(),
            setup_port: 8888,
            interval_secs: 30,
            window_secs: 5,
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrphanConfig {
    pub timeout_secs: u64,
    pub disconnect_debounce_secs: u64,
    pub reconnect_debounce_secs: u64,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self { timeout_secs: 30, disconnect_debounce_secs: 5, reconnect_debounce_secs: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub topics: Vec<String>,
    pub connect_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            topics: common::DEFAULT_BRIDGE_TOPICS.iter().map(|t| t.to_string()).collect(),
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub pairing_secs: u64,
    pub reconcile_secs: u64,
    pub orchestrator_secs: u64,
    pub export_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { pairing_secs: 3, reconcile_secs: 10, orchestrator_secs: 5, export_secs: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub start_command: Vec<String>,
    pub stop_command: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            start_command: vec!["systemctl".into(), "start".into(), "homecloud".into()],
            stop_command: vec!["systemctl".into(), "stop".into(), "director".into()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartMode {
    /// Exit with a distinct status and let the service manager respawn us.
    Exit,
    /// Re-execute the current binary directly.
    Respawn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub mode: RestartMode,
    /// Restarts tolerated within `window_secs` before backing off.
    pub max_restarts: usize,
    pub window_secs: u64,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            mode: RestartMode::Exit,
            max_restarts: 3,
            window_secs: 300,
            base_backoff_secs: 10,
            max_backoff_secs: 300,
        }
    }
}

impl AgentConfig {
    /// Load the TOML config at `path`, or the default location when `path` is
    /// `None`. A missing default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };
        if !explicit && !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn mesh_path(&self) -> PathBuf {
        self.data_dir.join("mesh.json")
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("credentials.json")
    }

    pub fn restart_ledger_path(&self) -> PathBuf {
        self.data_dir.join("restarts.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: AgentConfig = toml::from_str(
            r#"
            node_id = "node-a"
            force_master = true

            [orphan]
            timeout_secs = 10

            [restart]
            mode = "respawn"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.node_id, "node-a");
        assert!(cfg.force_master);
        assert_eq!(cfg.orphan.timeout_secs, 10);
        assert_eq!(cfg.orphan.disconnect_debounce_secs, 5);
        assert_eq!(cfg.restart.mode, RestartMode::Respawn);
        assert_eq!(cfg.discovery.interval_secs, 30);
        assert_eq!(cfg.bridge.topics.len(), common::DEFAULT_BRIDGE_TOPICS.len());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AgentConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
