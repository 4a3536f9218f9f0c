//! Error types for the registry server.

/// Main error type for registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryServerError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Record signature does not verify against its peer id.
    #[error("record signature does not verify")]
    InvalidSignature,

    /// Record claims a longer lifetime than this registry allows.
    #[error("record ttl {ttl}s exceeds maximum {max}s")]
    TtlExceeded {
        /// Claimed TTL.
        ttl: u32,
        /// Configured maximum.
        max: u32,
    },

    /// Record carries too many addresses.
    #[error("record has {count} addresses (max {max})")]
    TooManyAddresses {
        /// Addresses in the record.
        count: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Path segment is not a peer id.
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    /// No live record for this peer.
    #[error("no record for peer {peer_id}")]
    NotFound {
        /// The requested peer.
        peer_id: String,
    },

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimited(#[from] crate::limits::RateLimitError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryServerError {
    /// Stable machine-readable code sent in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Storage(_) => "StorageError",
            Self::InvalidSignature => "InvalidSignature",
            Self::TtlExceeded { .. } => "TtlExceeded",
            Self::TooManyAddresses { .. } => "TooManyAddresses",
            Self::InvalidPeerId(_) => "InvalidPeerId",
            Self::NotFound { .. } => "NotFound",
            Self::RateLimited(_) => "RateLimited",
            Self::Io(_) => "IoError",
        }
    }
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored row could not be decoded.
    #[error("corrupt record for {peer_id}: {reason}")]
    Corrupt {
        /// Hex of the stored key.
        peer_id: String,
        /// What failed.
        reason: String,
    },

    /// Record could not be encoded for storage.
    #[error("record encoding failed: {0}")]
    Encoding(#[from] rmp_serde::encode::Error),

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: std::path::PathBuf,
    },
}

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryServerError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
