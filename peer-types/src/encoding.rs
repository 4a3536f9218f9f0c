//! Serde helpers for binary fields.
//!
//! Binary fields travel as raw MessagePack `bin` values on the peer wire and
//! as hex strings in the JSON bodies exchanged with registries. Use with
//! `#[serde(with = "peer_types::encoding::bytes")]`.

use serde::de;
use std::fmt;

/// `Vec<u8>` fields: hex in human-readable formats, raw bytes otherwise.
pub mod bytes {
    use super::{BytesVisitor, HexVisitor};
    use serde::{Deserializer, Serializer};

    /// Serialize a byte slice.
    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(value))
        } else {
            serializer.serialize_bytes(value)
        }
    }

    /// Deserialize a byte vector.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_str(HexVisitor)
        } else {
            deserializer.deserialize_byte_buf(BytesVisitor)
        }
    }
}

/// `[u8; 32]` fields, encoded like [`bytes`] with a length check.
pub mod array32 {
    use serde::{de, Deserializer, Serializer};

    /// Serialize a 32-byte array.
    pub fn serialize<S: Serializer>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        super::bytes::serialize(value, serializer)
    }

    /// Deserialize a 32-byte array.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let raw = super::bytes::deserialize(deserializer)?;
        let len = raw.len();
        raw.try_into()
            .map_err(|_| de::Error::invalid_length(len, &"32 bytes"))
    }
}

pub(crate) struct HexVisitor;

impl<'de> de::Visitor<'de> for HexVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a hex string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        hex::decode(v).map_err(E::custom)
    }
}

pub(crate) struct BytesVisitor;

impl<'de> de::Visitor<'de> for BytesVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a byte buffer")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        Ok(v.to_vec())
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
        Ok(v)
    }

    // Encoders that write byte arrays as sequences of integers.
    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(byte) = seq.next_element::<u8>()? {
            out.push(byte);
        }
        Ok(out)
    }
}
