//! Top-level error type for the node.

use crate::config::ConfigError;
use crate::connection::ConnectError;
use crate::crypto::CryptoError;
use crate::registry::RegistryError;
use crate::sync::SyncError;
use thiserror::Error;

/// Node errors.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Key material could not be loaded or used.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Connecting to a peer failed.
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),

    /// A registry operation failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Queueing or applying a delta failed.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// No registries are configured.
    #[error("no registries configured")]
    NoRegistry,

    /// Socket or filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
