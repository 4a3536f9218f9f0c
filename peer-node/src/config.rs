//! Configuration loading for hearth nodes.
//!
//! Configuration is loaded from a TOML file (default: `hearth.toml`). Every
//! field has a default, so an empty file is a valid configuration.

use peer_core::Backoff;
use peer_types::PeerId;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for a node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Directory for identity, keys and content (default: ./user_data).
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    /// Port of the local web layer (default: 8080). Validated, not served here.
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    /// Port accepting peer connections (default: 9999).
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,
    /// Attempt automatic port mapping (default: true).
    #[serde(default = "default_enable_upnp")]
    pub enable_upnp: bool,
    /// Log filter used when RUST_LOG is unset (default: info).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Maximum concurrent peer sessions (default: 50).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Registry base URLs, highest priority first (default: none).
    #[serde(default)]
    pub registries: Vec<String>,
    /// Interface the peer listener binds (default: 0.0.0.0).
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Host to advertise instead of the detected local address.
    #[serde(default)]
    pub advertise_host: Option<String>,
    /// Peers known up front.
    #[serde(default)]
    pub peers: Vec<PeerSeed>,
    /// NAT traversal tuning.
    #[serde(default)]
    pub nat: NatConfig,
    /// Connection manager tuning.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Synchronization tuning.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Registry client tuning.
    #[serde(default)]
    pub registry_client: RegistryClientConfig,
    /// LAN discovery.
    #[serde(default)]
    pub lan: LanConfig,
}

/// A peer known from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeerSeed {
    /// The peer's id (base64).
    pub peer_id: PeerId,
    /// Host to dial.
    pub host: String,
    /// Port to dial.
    pub port: u16,
}

/// NAT traversal configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// Bound on one port-mapping request (default: 5).
    pub mapping_timeout_secs: u64,
    /// Requested mapping lifetime (default: 7200).
    pub lease_secs: u64,
    /// Gateway address; detected from the default route when unset.
    pub gateway: Option<String>,
    /// Bound on the reachability check (default: 5).
    pub reachability_timeout_secs: u64,
    /// How often to retry mapping from RelayOnly (default: 600).
    pub retry_interval_secs: u64,
}

/// Connection manager configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bound on one dial plus handshake (default: 5).
    pub attempt_timeout_secs: u64,
    /// Delay between launching successive candidates (default: 250).
    pub stagger_ms: u64,
    /// Passes over the candidate list before giving up (default: 3).
    pub dial_rounds: u32,
    /// Base delay between rounds (default: 1).
    pub retry_base_secs: u64,
    /// Sessions unused this long are closed (default: 300).
    pub idle_timeout_secs: u64,
    /// How long an address that failed authentication is skipped (default: 300).
    pub blacklist_secs: u64,
    /// Window in which a second malformed message penalizes (default: 60).
    pub penalty_window_secs: u64,
    /// How long a penalized peer is refused (default: 600).
    pub penalty_secs: u64,
    /// Forget peers not seen for this long (default: 30 days).
    pub peer_inactivity_secs: u64,
    /// Bound on writing one frame before the session is dropped (default: 10).
    pub write_timeout_secs: u64,
}

/// Synchronization configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Bound on undelivered deltas per destination (default: 1000).
    pub queue_capacity: usize,
    /// Maintenance loop period (default: 30).
    pub maintenance_interval_secs: u64,
    /// TTL of published address records (default: 300).
    pub record_ttl_secs: u32,
}

/// Registry client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryClientConfig {
    /// Heartbeat period (default: 30).
    pub heartbeat_secs: u64,
    /// Bound on one registry request (default: 3000).
    pub query_timeout_ms: u64,
    /// Consecutive failures before an endpoint is Down (default: 3).
    pub down_after: u32,
    /// First retry delay for a Down endpoint (default: 5).
    pub backoff_base_secs: u64,
    /// Longest retry delay (default: 300).
    pub backoff_max_secs: u64,
}

/// LAN discovery configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LanConfig {
    /// Announce and listen on the local network (default: true).
    pub enabled: bool,
    /// UDP discovery port (default: p2p_port + 100).
    pub port: Option<u16>,
    /// Announcement period (default: 30).
    pub interval_secs: u64,
    /// Addresses heard on the LAN are dropped after this long (default: 300).
    pub expiry_secs: u64,
    /// Broadcast to every local IPv4 network (default: true).
    pub broadcast: bool,
    /// Extra `ip:port` targets announced to directly.
    pub targets: Vec<String>,
}

// Default value functions
fn default_storage_path() -> PathBuf {
    PathBuf::from("./user_data")
}

fn default_web_port() -> u16 {
    8080
}

fn default_p2p_port() -> u16 {
    9999
}

fn default_enable_upnp() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_connections() -> usize {
    50
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            mapping_timeout_secs: 5,
            lease_secs: 7200,
            gateway: None,
            reachability_timeout_secs: 5,
            retry_interval_secs: 600,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: 5,
            stagger_ms: 250,
            dial_rounds: 3,
            retry_base_secs: 1,
            idle_timeout_secs: 300,
            blacklist_secs: 300,
            penalty_window_secs: 60,
            penalty_secs: 600,
            peer_inactivity_secs: 30 * 24 * 60 * 60,
            write_timeout_secs: 10,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_capacity: peer_core::DEFAULT_QUEUE_CAPACITY,
            maintenance_interval_secs: 30,
            record_ttl_secs: 300,
        }
    }
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: None,
            interval_secs: 30,
            expiry_secs: 300,
            broadcast: true,
            targets: Vec::new(),
        }
    }
}

impl Default for RegistryClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30,
            query_timeout_ms: 3000,
            down_after: 3,
            backoff_base_secs: 5,
            backoff_max_secs: 300,
        }
    }
}

impl RegistryClientConfig {
    /// Retry schedule for Down endpoints.
    pub fn backoff(&self) -> Backoff {
        let base = Duration::from_secs(self.backoff_base_secs);
        Backoff::new(base, Duration::from_secs(self.backoff_max_secs), base / 4)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            web_port: default_web_port(),
            p2p_port: default_p2p_port(),
            enable_upnp: default_enable_upnp(),
            log_level: default_log_level(),
            max_connections: default_max_connections(),
            registries: Vec::new(),
            bind_host: default_bind_host(),
            advertise_host: None,
            peers: Vec::new(),
            nat: NatConfig::default(),
            connection: ConnectionConfig::default(),
            sync: SyncConfig::default(),
            registry_client: RegistryClientConfig::default(),
            lan: LanConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Check value ranges. Collects every problem into one error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();

        for (name, port) in [("web_port", self.web_port), ("p2p_port", self.p2p_port)] {
            if port < 1024 {
                issues.push(format!("invalid {name}: {port} (must be 1024-65535)"));
            }
        }
        if self.web_port == self.p2p_port {
            issues.push("web_port and p2p_port cannot be the same".to_string());
        }
        if self.max_connections == 0 {
            issues.push("max_connections must be at least 1".to_string());
        }
        for url in &self.registries {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                issues.push(format!("registry url must start with http:// or https://: {url}"));
            }
        }
        if self.connection.write_timeout_secs == 0 {
            issues.push("connection.write_timeout_secs must be at least 1".to_string());
        }
        if self.connection.dial_rounds == 0 {
            issues.push("connection.dial_rounds must be at least 1".to_string());
        }
        if self.lan.interval_secs == 0 || self.lan.expiry_secs == 0 {
            issues.push("lan.interval_secs and lan.expiry_secs must be at least 1".to_string());
        }
        for target in &self.lan.targets {
            if target.parse::<std::net::SocketAddr>().is_err() {
                issues.push(format!("lan target must be ip:port: {target}"));
            }
        }
        if self.sync.record_ttl_secs == 0 {
            issues.push("sync.record_ttl_secs must be at least 1".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(issues.join("; ")))
        }
    }

    /// Per-attempt dial timeout.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.attempt_timeout_secs)
    }

    /// UDP port used for LAN discovery.
    pub fn lan_port(&self) -> u16 {
        self.lan.port.unwrap_or_else(|| self.p2p_port.saturating_add(100))
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Values out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
