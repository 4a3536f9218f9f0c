//! Configuration loading for the registry server.
//!
//! Configuration is loaded from a TOML file (default: `registry.toml`).
//! Every section is optional.

use serde::Deserialize;
use std::path::PathBuf;

/// Root configuration for the registry server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Rate limiting configuration.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// HTTP endpoints configuration.
    #[serde(default)]
    pub http: HttpConfig,
    /// Cleanup task configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP API (default: 0.0.0.0:8470).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Longest TTL a record may claim, in seconds (default: 1 day).
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u32,
    /// Most addresses a single record may carry (default: 16).
    #[serde(default = "default_max_addresses")]
    pub max_addresses: usize,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Publishes allowed per peer per minute (default: 30).
    #[serde(default = "default_publishes_per_minute")]
    pub publishes_per_minute: u32,
    /// Requests per second across all clients (default: 1000).
    #[serde(default = "default_global_requests_per_second")]
    pub global_requests_per_second: u32,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    /// Connect-back timeout for the echo endpoint, in milliseconds (default: 2000).
    #[serde(default = "default_echo_timeout_ms")]
    pub echo_timeout_ms: u64,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Sweep interval in seconds (default: 60).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

fn default_bind_address() -> String {
    "0.0.0.0:8470".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("registry.db")
}

fn default_max_ttl_secs() -> u32 {
    24 * 60 * 60
}

fn default_max_addresses() -> usize {
    16
}

fn default_publishes_per_minute() -> u32 {
    30
}

fn default_global_requests_per_second() -> u32 {
    1000
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_echo_timeout_ms() -> u64 {
    2000
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_cleanup_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            max_ttl_secs: default_max_ttl_secs(),
            max_addresses: default_max_addresses(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            publishes_per_minute: default_publishes_per_minute(),
            global_requests_per_second: default_global_requests_per_second(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: default_metrics_enabled(),
            echo_timeout_ms: default_echo_timeout_ms(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            enabled: default_cleanup_enabled(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();
        if self.storage.max_ttl_secs == 0 {
            issues.push("storage.max_ttl_secs must be at least 1");
        }
        if self.storage.max_addresses == 0 {
            issues.push("storage.max_addresses must be at least 1");
        }
        if self.limits.publishes_per_minute == 0 {
            issues.push("limits.publishes_per_minute must be at least 1");
        }
        if self.limits.global_requests_per_second == 0 {
            issues.push("limits.global_requests_per_second must be at least 1");
        }
        if self.cleanup.enabled && self.cleanup.interval_secs == 0 {
            issues.push("cleanup.interval_secs must be at least 1");
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(issues.join("; ")))
        }
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
    #[error("invalid config: {0}")]
    Invalid(String),
}
