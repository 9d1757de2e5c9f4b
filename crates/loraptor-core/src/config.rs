//! Configuration system for LoRaptor.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $LORAPTOR_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/loraptor/config.toml
//!   3. ~/.config/loraptor/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraptorConfig {
    pub node: NodeConfig,
    pub mesh: MeshConfig,
    pub messaging: MessagingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Mesh address of this node. 0 = derive from the process id.
    pub address: u16,
    /// Name shown by the console banner.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// IPv4 multicast group the simulated radio channel lives on.
    pub multicast_group: String,
    pub port: u16,
    /// Forget a neighbour after this many seconds of silence.
    pub node_ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingSettings {
    /// Capacity of each per-connection message buffer.
    pub buffer_size: usize,
    /// Minimum gap between retransmissions of an unacknowledged message.
    pub retry_interval_ms: u32,
    /// Transmissions before an unacknowledged message is dropped.
    pub max_retries: u8,
    /// Period of the outgoing sweep.
    pub sweep_interval_ms: u64,
    /// Send each message once and never wait for an ACK.
    pub acks_disabled: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: 0,
            name: "LoRaptor".to_string(),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            multicast_group: "239.255.76.82".to_string(),
            port: 47682,
            node_ttl_secs: 60,
        }
    }
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            buffer_size: 64,
            retry_interval_ms: 5000,
            max_retries: 5,
            sweep_interval_ms: 100,
            acks_disabled: false,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("loraptor")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl LoraptorConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            LoraptorConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("LORAPTOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&LoraptorConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply LORAPTOR_* overrides. `lookup` resolves a variable name;
    /// unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(a) = lookup("LORAPTOR_NODE__ADDRESS").and_then(|v| crate::wire::parse_address(&v).ok()) {
            self.node.address = a;
        }
        if let Some(p) = lookup("LORAPTOR_MESH__PORT").and_then(|v| v.parse().ok()) {
            self.mesh.port = p;
        }
        if let Some(ms) = lookup("LORAPTOR_MESSAGING__RETRY_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.messaging.retry_interval_ms = ms;
        }
        if let Some(n) = lookup("LORAPTOR_MESSAGING__MAX_RETRIES").and_then(|v| v.parse().ok()) {
            self.messaging.max_retries = n;
        }
        if let Some(v) = lookup("LORAPTOR_MESSAGING__ACKS_DISABLED") {
            self.messaging.acks_disabled = v == "true" || v == "1";
        }
    }
}
