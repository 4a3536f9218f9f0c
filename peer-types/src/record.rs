//! Signed address records exchanged with registries and between peers.

use crate::address::WireAddress;
use crate::error::WireError;
use crate::ids::PeerId;
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};

/// Domain separator for record signatures.
pub const RECORD_SIGNING_DOMAIN: &[u8] = b"hearth-address-record-v1";

/// A peer's signed address set.
///
/// Wire shape: `{ peer_id, addresses: [{proto, host, port, ttl}], signature }`.
/// The signature is an Ed25519 signature by `peer_id` over
/// [`RegistryRecord::signing_bytes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRecord {
    /// The publishing peer.
    pub peer_id: PeerId,
    /// Addresses the peer can be reached at.
    pub addresses: Vec<WireAddress>,
    /// Ed25519 signature over the canonical encoding.
    #[serde(with = "crate::encoding::bytes")]
    pub signature: Vec<u8>,
}

impl RegistryRecord {
    /// Canonical byte string covered by the signature.
    ///
    /// Length-prefixed so that no two distinct address lists encode the same.
    /// Fails when a host does not fit its 16-bit length prefix.
    pub fn signing_bytes(peer_id: &PeerId, addresses: &[WireAddress]) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(RECORD_SIGNING_DOMAIN.len() + 36 + addresses.len() * 32);
        out.extend_from_slice(RECORD_SIGNING_DOMAIN);
        out.extend_from_slice(peer_id.as_bytes());
        out.extend_from_slice(&(addresses.len() as u32).to_be_bytes());
        for addr in addresses {
            out.push(addr.proto.code());
            let host_len = u16::try_from(addr.host.len()).map_err(|_| {
                WireError::InvalidData(format!("host is {} bytes, max {}", addr.host.len(), u16::MAX))
            })?;
            out.extend_from_slice(&host_len.to_be_bytes());
            out.extend_from_slice(addr.host.as_bytes());
            out.extend_from_slice(&addr.port.to_be_bytes());
            out.extend_from_slice(&addr.ttl.to_be_bytes());
        }
        Ok(out)
    }

    /// The record's TTL: the longest address lifetime it advertises.
    pub fn ttl(&self) -> u32 {
        self.addresses.iter().map(|a| a.ttl).max().unwrap_or(0)
    }

    /// Check the signature against the claimed peer id.
    pub fn verify(&self) -> Result<(), WireError> {
        let key = self.peer_id.verifying_key().map_err(|_| WireError::InvalidSignature)?;
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| WireError::InvalidSignature)?;
        key.verify_strict(&Self::signing_bytes(&self.peer_id, &self.addresses)?, &signature)
            .map_err(|_| WireError::InvalidSignature)
    }
}
