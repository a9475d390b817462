//! TOML configuration for peers and the relay server.
//!
//! Every field has a default, so an empty or missing file is valid.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use p2p_mesh::{OverlayConfig, RelayClientConfig};
use p2p_relay::RelayServerConfig;
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "p2p.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub local: LocalSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub server: ServerSection,
}

/// Relay this peer registers with. No host means direct-only operation.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalSection {
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address other peers should dial. Falls back to `host` when that is a
    /// concrete address, otherwise to loopback.
    #[serde(default)]
    pub advertise_ip: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_secs: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_discovery")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_backoff")]
    pub reconnect_backoff_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_secs: u64,
    #[serde(default = "default_sweep")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_port() -> u16 {
    12345
}
fn default_bind_host() -> String {
    "0.0.0.0".into()
}
fn default_peer_timeout() -> u64 {
    120
}
fn default_heartbeat() -> u64 {
    30
}
fn default_discovery() -> u64 {
    60
}
fn default_backoff() -> u64 {
    5
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_write_timeout() -> u64 {
    10
}
fn default_sweep() -> u64 {
    30
}
fn default_read_timeout() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
        }
    }
}

impl Default for LocalSection {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_port(),
            advertise_ip: None,
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            peer_timeout_secs: default_peer_timeout(),
            heartbeat_interval_secs: default_heartbeat(),
            discovery_interval_secs: default_discovery(),
            reconnect_backoff_secs: default_backoff(),
            connect_timeout_secs: default_connect_timeout(),
            write_timeout_secs: default_write_timeout(),
            auto_reconnect: true,
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_port(),
            peer_timeout_secs: default_peer_timeout(),
            sweep_interval_secs: default_sweep(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            relay: RelaySection::default(),
            local: LocalSection::default(),
            network: NetworkSection::default(),
            server: ServerSection::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("parse configuration")
    }

    pub fn overlay_config(&self) -> OverlayConfig {
        OverlayConfig {
            connect_timeout: Duration::from_secs(self.network.connect_timeout_secs),
            write_timeout: Duration::from_secs(self.network.write_timeout_secs),
        }
    }

    /// Client settings advertising `listen_port`, the port the overlay
    /// actually bound.
    pub fn relay_client_config(&self, listen_port: u16) -> RelayClientConfig {
        let net = &self.network;
        RelayClientConfig {
            advertise_ip: self.local.advertised_ip(),
            advertise_port: listen_port,
            heartbeat_interval: Duration::from_secs(net.heartbeat_interval_secs),
            discovery_interval: Duration::from_secs(net.discovery_interval_secs),
            reconnect_backoff: Duration::from_secs(net.reconnect_backoff_secs),
            connect_timeout: Duration::from_secs(net.connect_timeout_secs),
            peer_timeout: Duration::from_secs(net.peer_timeout_secs),
            auto_reconnect: net.auto_reconnect,
            ..RelayClientConfig::default()
        }
    }

    pub fn relay_server_config(&self) -> RelayServerConfig {
        RelayServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            peer_timeout: Duration::from_secs(self.server.peer_timeout_secs),
            sweep_interval: Duration::from_secs(self.server.sweep_interval_secs),
            read_timeout: Duration::from_secs(self.server.read_timeout_secs),
            write_timeout: Duration::from_secs(self.server.write_timeout_secs),
            ..RelayServerConfig::default()
        }
    }
}

impl LocalSection {
    pub fn advertised_ip(&self) -> String {
        if let Some(ip) = &self.advertise_ip {
            return ip.clone();
        }
        match self.host.as_str() {
            "0.0.0.0" | "::" | "" => "127.0.0.1".into(),
            host => host.to_string(),
        }
    }
}

/// Read `path`, or fall back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<NodeConfig> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        NodeConfig::from_toml(&text).with_context(|| format!("load {}", path.display()))
    } else {
        Ok(NodeConfig::default())
    }
}
