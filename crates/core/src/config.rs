use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::paths::Paths;

/// Largest port range a single discoverer is allowed to scan.
pub const MAX_PORT_RANGE: u16 = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_host")]
    pub host: String,
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Abort deadline for a single reachability probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_discovery_host() -> String {
    "localhost".to_string()
}

fn default_port_range_start() -> u16 {
    2769
}

fn default_port_range_end() -> u16 {
    2799
}

fn default_scan_interval_ms() -> u64 {
    5000
}

fn default_probe_timeout_ms() -> u64 {
    500
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            host: default_discovery_host(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            scan_interval_ms: default_scan_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl DiscoveryConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn ports(&self) -> std::ops::RangeInclusive<u16> {
        self.port_range_start..=self.port_range_end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    /// Fixed listen port. When unset the server takes the first free port of
    /// the discovery range so peers can find it.
    #[serde(default)]
    pub port: Option<u16>,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcConfig {
    /// Default deadline applied to every call. 0 disables it.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_identity_timeout_ms")]
    pub identity_timeout_ms: u64,
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_identity_timeout_ms() -> u64 {
    10_000
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            identity_timeout_ms: default_identity_timeout_ms(),
        }
    }
}

impl RpcConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        if self.call_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.call_timeout_ms))
        }
    }

    pub fn identity_timeout(&self) -> Duration {
        Duration::from_millis(self.identity_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConfig {
    #[serde(default = "default_peer_name")]
    pub name: String,
    /// Stable peer id. A random one is generated per run when unset.
    #[serde(default)]
    pub peer_id: Option<String>,
}

fn default_peer_name() -> String {
    "tabmesh-peer".to_string()
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: default_peer_name(),
            peer_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub peer: PeerConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            debug!(path = %config_path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.discovery;
        if d.port_range_start == 0 || d.port_range_start > d.port_range_end {
            return Err(Error::Config(format!(
                "invalid discovery port range {}-{}",
                d.port_range_start, d.port_range_end
            )));
        }
        if d.port_range_end - d.port_range_start >= MAX_PORT_RANGE {
            return Err(Error::Config(format!(
                "discovery port range {}-{} exceeds {} ports",
                d.port_range_start, d.port_range_end, MAX_PORT_RANGE
            )));
        }
        if d.scan_interval_ms == 0 {
            return Err(Error::Config("scanIntervalMs must be positive".to_string()));
        }
        if d.probe_timeout_ms == 0 {
            return Err(Error::Config("probeTimeoutMs must be positive".to_string()));
        }
        if d.host.trim().is_empty() {
            return Err(Error::Config("discovery host is empty".to_string()));
        }
        Ok(())
    }
}
