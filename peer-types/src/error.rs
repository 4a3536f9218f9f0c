//! Error types for the hearth wire format.

use thiserror::Error;

/// Errors that can occur encoding, decoding or verifying wire data.
#[derive(Debug, Error)]
pub enum WireError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Signature did not verify against the claimed peer id
    #[error("invalid signature")]
    InvalidSignature,

    /// Frame length exceeds the protocol maximum
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Declared frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}
