//! Peer-to-peer frames.
//!
//! Every frame on a peer connection decodes into exactly one [`WireMessage`]
//! variant; receivers dispatch with an exhaustive `match`.

use serde::{Deserialize, Serialize};

use crate::{ContentHash, PeerId, RegistryRecord, Sequence, WireError};

/// The closed set of frames exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// One flight of the mutual-authentication handshake
    Handshake(Handshake),
    /// Signed address set, gossiped over an established session
    AddressRecord(RegistryRecord),
    /// One delta, sealed with the session key
    SyncMessage(SyncMessage),
    /// Cumulative acknowledgement for one origin
    Ack(Ack),
}

impl WireMessage {
    /// Serialize to MessagePack bytes (named fields).
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec_named(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }

    /// Variant name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Handshake(_) => "Handshake",
            WireMessage::AddressRecord(_) => "AddressRecord",
            WireMessage::SyncMessage(_) => "SyncMessage",
            WireMessage::Ack(_) => "Ack",
        }
    }
}

/// Handshake flight: `{ peer_id, ephemeral_pubkey, signature_over_nonce }`.
///
/// The nonce each side signs is the counterpart's fresh ephemeral key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Sender identity
    pub peer_id: PeerId,
    /// Sender's X25519 ephemeral public key
    #[serde(with = "crate::encoding::array32")]
    pub ephemeral_pubkey: [u8; 32],
    /// Ed25519 signature over the flight transcript
    #[serde(with = "crate::encoding::bytes")]
    pub signature_over_nonce: Vec<u8>,
}

/// Delta frame: `{ origin_peer, sequence, content_hash, ciphertext, mac }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Authoring peer
    pub origin_peer: PeerId,
    /// Per-origin sequence number
    pub sequence: Sequence,
    /// Hash of (origin, sequence, plaintext)
    pub content_hash: ContentHash,
    /// Payload sealed with the session key
    #[serde(with = "crate::encoding::bytes")]
    pub ciphertext: Vec<u8>,
    /// Poly1305 tag over ciphertext and header
    #[serde(with = "crate::encoding::bytes")]
    pub mac: Vec<u8>,
}

/// Acknowledges every delta of `origin_peer` up to and including `sequence`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Origin being acknowledged
    pub origin_peer: PeerId,
    /// Highest applied sequence for that origin
    pub sequence: Sequence,
    /// Poly1305 tag over (origin, sequence) under the sender's session key
    #[serde(with = "crate::encoding::bytes")]
    pub mac: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Protocol, WireAddress};

    fn peer(n: u8) -> PeerId {
        PeerId::new([n; 32])
    }

    #[test]
    fn sync_message_frame_decodes_to_same_variant() {
        let msg = WireMessage::SyncMessage(SyncMessage {
            origin_peer: peer(1),
            sequence: Sequence::new(7),
            content_hash: ContentHash::compute(&peer(1), Sequence::new(7), b"post"),
            ciphertext: vec![1, 2, 3, 4],
            mac: vec![9; 16],
        });

        let bytes = msg.to_bytes().unwrap();
        let decoded = WireMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.kind(), "SyncMessage");
    }

    #[test]
    fn frames_carry_wire_field_names() {
        let msg = WireMessage::Handshake(Handshake {
            peer_id: peer(2),
            ephemeral_pubkey: [5; 32],
            signature_over_nonce: vec![6; 64],
        });
        let bytes = msg.to_bytes().unwrap();

        let haystack = String::from_utf8_lossy(&bytes);
        for field in ["peer_id", "ephemeral_pubkey", "signature_over_nonce"] {
            assert!(haystack.contains(field), "missing field name {field}");
        }
    }

    #[test]
    fn address_record_variant_decodes() {
        let msg = WireMessage::AddressRecord(RegistryRecord {
            peer_id: peer(3),
            addresses: vec![WireAddress {
                proto: Protocol::Tcp,
                host: "203.0.113.9".into(),
                port: 9999,
                ttl: 300,
            }],
            signature: vec![0; 64],
        });
        let decoded = WireMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert!(matches!(decoded, WireMessage::AddressRecord(r) if r.addresses[0].port == 9999));
    }

    #[test]
    fn garbage_is_a_deserialization_error() {
        let result = WireMessage::from_bytes(&[0xc1, 0x00, 0xff]);
        assert!(matches!(result, Err(WireError::Deserialization(_))));
    }
}
