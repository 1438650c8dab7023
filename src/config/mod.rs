//! Configuration loading: defaults, an optional TOML file, and environment
//! overrides.

mod defaults;

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

pub use defaults::{
    default_db_path, default_heartbeat_period_secs, default_lookupd_timeout_secs,
    default_nsq_poll_interval_secs, default_port, default_session_ttl_secs, default_true,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// This node's identity, used as the consumer-channel name and in
/// `sender.hostname`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub ssl: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

/// Bus transport configuration: writer destinations and reader discovery.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BusConfig {
    #[serde(default)]
    pub nsqd_tcp_address: Vec<String>,
    #[serde(default)]
    pub lookupd_http_address: Vec<String>,
    #[serde(default = "default_lookupd_timeout_secs")]
    pub lookupd_timeout_secs: u64,
    #[serde(default = "default_nsq_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

/// Realm policy flags controlling implicit user/group creation.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RealmPolicyConfig {
    #[serde(default)]
    pub user_on_request: bool,
    #[serde(default)]
    pub group_on_request: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_period_secs")]
    pub period_secs: u64,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            period_secs: default_heartbeat_period_secs(),
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub realm: RealmPolicyConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Config {
    /// Load from a TOML file at `path`, falling back to built-in defaults for
    /// any key the file omits. A missing file is not an error: the caller may
    /// run with `NodeConfig::hostname` supplied entirely through env/CLI in
    /// that case via [`Config::from_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_str(&text, path)
    }

    pub fn from_str(text: &str, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: path.as_ref().display().to_string(),
            source: e,
        })
    }
}
