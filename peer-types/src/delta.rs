//! Delta: one unit of synchronized content.

use crate::ids::{ContentHash, PeerId, Sequence};

/// One unit of synchronized content.
///
/// `payload` is always ciphertext under the at-rest key of the node holding
/// the delta; it is re-sealed on every hop and never travels as-is.
#[derive(Clone, PartialEq, Eq)]
pub struct Delta {
    /// The authoring peer.
    pub origin: PeerId,
    /// Per-origin sequence number.
    pub sequence: Sequence,
    /// Hash of (origin, sequence, plaintext content).
    pub content_hash: ContentHash,
    /// At-rest encrypted payload.
    pub payload: Vec<u8>,
}

impl Delta {
    /// Create a delta.
    pub fn new(origin: PeerId, sequence: Sequence, content_hash: ContentHash, payload: Vec<u8>) -> Self {
        Self {
            origin,
            sequence,
            content_hash,
            payload,
        }
    }

    /// The ordering key within one destination queue.
    pub fn key(&self) -> (PeerId, Sequence) {
        (self.origin, self.sequence)
    }
}

impl std::fmt::Debug for Delta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delta")
            .field("origin", &self.origin)
            .field("sequence", &self.sequence)
            .field("content_hash", &self.content_hash)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
