//! Identity and ordering types for hearth peers.

use crate::encoding::BytesVisitor;
use crate::error::WireError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A stable identifier for a peer in the network.
///
/// The 32 bytes are the peer's Ed25519 verifying key, so the id is derived
/// deterministically from key material and is enough to check any signature
/// the peer produces. Displayed as URL-safe base64.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Wrap raw verifying-key bytes.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a PeerId from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }

    /// Get the raw bytes of this PeerId.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Decode the Ed25519 verifying key behind this id.
    pub fn verifying_key(&self) -> Result<ed25519_dalek::VerifyingKey, WireError> {
        ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|e| WireError::InvalidData(format!("peer id is not a valid key: {e}")))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &self.to_string()[..8])
    }
}

impl FromStr for PeerId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| WireError::InvalidData(format!("bad peer id encoding: {e}")))?;
        Self::from_bytes(&raw)
            .ok_or_else(|| WireError::InvalidData(format!("peer id must be 32 bytes, got {}", raw.len())))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            text.parse().map_err(de::Error::custom)
        } else {
            let raw = deserializer.deserialize_byte_buf(BytesVisitor)?;
            let len = raw.len();
            Self::from_bytes(&raw).ok_or_else(|| de::Error::invalid_length(len, &"32 bytes"))
        }
    }
}

/// A per-origin, monotonically increasing sequence number.
///
/// Assigned by the authoring peer. Sequence 0 means "nothing yet"; the
/// first authored delta carries sequence 1.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Sequence(u64);

impl Sequence {
    /// Create a new Sequence with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this Sequence.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The sequence before any delta was authored.
    pub fn zero() -> Self {
        Self(0)
    }

    /// Increment the sequence by one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sequence({})", self.0)
    }
}

/// BLAKE3 hash identifying one delta.
///
/// Computed over the origin, the sequence and the plaintext content, so it is
/// unique per (origin, sequence) and makes delivery idempotent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(#[serde(with = "crate::encoding::array32")] [u8; 32]);

impl ContentHash {
    /// Domain separator mixed into every content hash.
    pub const DOMAIN: &'static [u8] = b"hearth-delta-v1";

    /// Hash a delta's content.
    pub fn compute(origin: &PeerId, sequence: Sequence, content: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(Self::DOMAIN);
        hasher.update(origin.as_bytes());
        hasher.update(&sequence.value().to_be_bytes());
        hasher.update(content);
        Self(*hasher.finalize().as_bytes())
    }

    /// Wrap raw hash bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of this hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &hex::encode(self.0)[..12])
    }
}
