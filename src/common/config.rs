//! Configuration for minicfg components
//!
//! Loaded from an optional TOML file layered with `MINICFG__*` environment
//! variables. Command-line flags override both.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::{Error, Result};

/// Default config file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "minicfg.toml";

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node-specific config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeConfig>,

    /// Orchestrator-specific config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from `path` (or `minicfg.toml` when absent) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => config::File::from(p.to_path_buf()).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = config::Config::builder()
            .set_default("log_level", default_log_level())?
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("MINICFG")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("client.endpoints")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        if let Some(client) = &config.client {
            client.validate()?;
        }
        Ok(config)
    }
}

/// Which durable change log a node writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    Memory,
    #[default]
    File,
    Sled,
}

impl std::str::FromStr for LogBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(LogBackend::Memory),
            "file" => Ok(LogBackend::File),
            "sled" => Ok(LogBackend::Sled),
            other => Err(Error::InvalidConfig(format!("unknown log backend: {}", other))),
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name this node reports in logs
    pub node_name: String,

    /// Bind address for the HTTP API
    pub bind_addr: SocketAddr,

    /// Directory holding the change log and config snapshots
    pub data_dir: PathBuf,

    #[serde(default)]
    pub log_backend: LogBackend,

    /// Change log sync policy
    #[serde(default)]
    pub wal_sync: WalSyncPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "node-1".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9410)),
            data_dir: PathBuf::from("./node-data"),
            log_backend: LogBackend::File,
            wal_sync: WalSyncPolicy::Always,
        }
    }
}

impl NodeConfig {
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("changes.log")
    }

    pub fn sled_path(&self) -> PathBuf {
        self.data_dir.join("changes.sled")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.data_dir.join("config")
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Node base URLs, e.g. `http://10.0.0.1:9410`
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Per-call timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Host recorded as the mutation host on every node
    #[serde(default = "crate::common::utils::local_host")]
    pub host: String,

    /// User recorded as the mutation user on every node
    #[serde(default = "crate::common::utils::local_user")]
    pub user: String,
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            timeout_ms: default_timeout_ms(),
            host: crate::common::utils::local_host(),
            user: crate::common::utils::local_user(),
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::InvalidConfig("timeout_ms must be positive".into()));
        }
        if self.host.is_empty() || self.user.is_empty() {
            return Err(Error::InvalidConfig(
                "mutation host and user cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

/// WAL sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalSyncPolicy {
    /// fsync after every batch
    #[default]
    Always,
    /// flush to the OS after every batch
    Interval,
    /// leave it to the OS
    Never,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("minicfg.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[node]
node_name = "node-7"
bind_addr = "127.0.0.1:9417"
data_dir = "/tmp/node-7"
log_backend = "memory"

[client]
endpoints = ["http://127.0.0.1:9417"]
timeout_ms = 250
host = "ops-box"
user = "alice"
"#
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.log_level, "debug");

        let node = config.node.unwrap();
        assert_eq!(node.node_name, "node-7");
        assert_eq!(node.log_backend, LogBackend::Memory);
        assert_eq!(node.wal_sync, WalSyncPolicy::Always);
        assert_eq!(node.log_path(), PathBuf::from("/tmp/node-7/changes.log"));

        let client = config.client.unwrap();
        assert_eq!(client.endpoints.len(), 1);
        assert_eq!(client.timeout(), Duration::from_millis(250));
        assert_eq!(client.user, "alice");
    }

    #[test]
    fn test_invalid_client_config() {
        let client = ClientConfig {
            timeout_ms: 0,
            ..Default::default()
        };
        assert!(client.validate().is_err());
    }

    #[test]
    fn test_log_backend_parse() {
        assert_eq!("sled".parse::<LogBackend>().unwrap(), LogBackend::Sled);
        assert!("rocks".parse::<LogBackend>().is_err());
    }
}
