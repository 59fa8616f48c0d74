//! Configuration types for fleetlink-node.
//! Parsed from ~/.fleetlink/config.toml.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use fleetlink_crypto::{key_from_hex, NonceLayout};
use fleetlink_protocol::schema::PostInitData;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub overseer: OverseerSection,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_workers")]
    pub workers_per_connection: usize,
    #[serde(default = "default_write_queue")]
    pub write_queue: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            workers_per_connection: default_workers(),
            write_queue: default_write_queue(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSection {
    #[serde(default = "default_lobby_timeout")]
    pub lobby_timeout_ms: u64,
    #[serde(default = "default_500")]
    pub lobby_sweep_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_10000")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_500")]
    pub heartbeat_sweep_ms: u64,
    #[serde(default = "default_10000")]
    pub response_timeout_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            lobby_timeout_ms: default_lobby_timeout(),
            lobby_sweep_ms: 500,
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: 10_000,
            heartbeat_sweep_ms: 500,
            response_timeout_ms: 10_000,
        }
    }
}

impl TimeoutSection {
    pub fn lobby_timeout(&self) -> Duration {
        Duration::from_millis(self.lobby_timeout_ms)
    }
    pub fn lobby_sweep(&self) -> Duration {
        Duration::from_millis(self.lobby_sweep_ms)
    }
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
    pub fn heartbeat_sweep(&self) -> Duration {
        Duration::from_millis(self.heartbeat_sweep_ms)
    }
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverseerSection {
    #[serde(default = "default_500")]
    pub sweep_ms: u64,
    #[serde(default = "default_message_expiry")]
    pub message_expiry_ms: u64,
}

impl Default for OverseerSection {
    fn default() -> Self {
        Self {
            sweep_ms: 500,
            message_expiry_ms: default_message_expiry(),
        }
    }
}

impl OverseerSection {
    pub fn sweep(&self) -> Duration {
        Duration::from_millis(self.sweep_ms)
    }
    pub fn message_expiry(&self) -> Duration {
        Duration::from_millis(self.message_expiry_ms)
    }
}

/// A game server allowed to connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub public_id: String,
    pub server_id: String,
    /// Hex-encoded 32-byte shared key.
    pub key: String,
    /// Initial nonce layout; the agreed default when absent.
    #[serde(default)]
    pub nonce_offsets: Option<Vec<u8>>,
    /// Sent to the server during initialization.
    #[serde(default)]
    pub settings: PostInitData,
}

// Default value functions
fn default_listen_addr() -> String {
    "0.0.0.0:3003".into()
}
fn default_workers() -> usize {
    4
}
fn default_write_queue() -> usize {
    256
}
fn default_lobby_timeout() -> u64 {
    15_000
}
fn default_heartbeat_interval() -> u64 {
    30_000
}
fn default_message_expiry() -> u64 {
    60_000
}
fn default_500() -> u64 {
    500
}
fn default_10000() -> u64 {
    10_000
}

impl NodeConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.workers_per_connection == 0 {
            anyhow::bail!("server.workers_per_connection must be at least 1");
        }
        if self.server.write_queue == 0 {
            anyhow::bail!("server.write_queue must be at least 1");
        }
        let timers = [
            ("timeouts.lobby_sweep_ms", self.timeouts.lobby_sweep_ms),
            ("timeouts.heartbeat_sweep_ms", self.timeouts.heartbeat_sweep_ms),
            ("overseer.sweep_ms", self.overseer.sweep_ms),
        ];
        for (name, value) in timers {
            if value == 0 {
                anyhow::bail!("{name} must be greater than zero");
            }
        }

        let mut seen = HashSet::new();
        for entry in &self.servers {
            if !seen.insert(entry.public_id.as_str()) {
                anyhow::bail!("duplicate public_id {:?}", entry.public_id);
            }
            key_from_hex(&entry.key)
                .map_err(|e| anyhow::anyhow!("server {}: {e}", entry.public_id))?;
            if let Some(offsets) = &entry.nonce_offsets {
                NonceLayout::new(offsets)
                    .map_err(|e| anyhow::anyhow!("server {}: {e}", entry.public_id))?;
            }
        }
        Ok(())
    }
}
