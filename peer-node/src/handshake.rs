//! Mutually authenticated session handshake.
//!
//! Three `WireMessage::Handshake` flights over a fresh stream:
//!
//! ```text
//! I -> R  { I, eI, Sign_I(init    || eI) }
//! R -> I  { R, eR, Sign_R(resp    || eR || eI) }
//! I -> R  { I, eI, Sign_I(confirm || eI || eR) }
//! ```
//!
//! Each side signs the counterpart's fresh ephemeral key, so a recorded
//! flight cannot be replayed into a new handshake. Session keys come from
//! X25519(eI, eR) through HKDF bound to the full transcript.

use crate::crypto::{
    derive_session_keys, verify_signature, CryptoError, EphemeralKeypair, IdentityKeypair, Role,
    SessionCipher,
};
use crate::transport::{FramedStream, TransportError};
use peer_types::{Handshake, PeerId, WireMessage};
use thiserror::Error;

const INIT_LABEL: &[u8] = b"hearth-handshake-v1/init";
const RESP_LABEL: &[u8] = b"hearth-handshake-v1/resp";
const CONFIRM_LABEL: &[u8] = b"hearth-handshake-v1/confirm";

/// Handshake errors.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The responder proved a different identity than the one dialed.
    #[error("identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch {
        /// Peer id we dialed.
        expected: PeerId,
        /// Peer id that answered.
        actual: PeerId,
    },

    /// A flight's signature did not verify against its claimed peer id.
    #[error("invalid handshake signature from {0}")]
    InvalidSignature(PeerId),

    /// The confirm flight changed identity or ephemeral key.
    #[error("handshake transcript changed mid-flight")]
    TranscriptMismatch,

    /// The remote presented our own identity.
    #[error("refusing handshake with own identity")]
    SelfConnection,

    /// Something other than a handshake flight arrived.
    #[error("unexpected {0} frame during handshake")]
    UnexpectedMessage(&'static str),

    /// Stream failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Key agreement or derivation failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl HandshakeError {
    /// Whether the failure means the remote could not prove the expected identity.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            Self::IdentityMismatch { .. }
                | Self::InvalidSignature(_)
                | Self::TranscriptMismatch
                | Self::SelfConnection
                | Self::Crypto(CryptoError::WeakKeyAgreement)
        )
    }
}

/// Result of a completed handshake.
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// Authenticated remote identity.
    pub peer_id: PeerId,
    /// Directional session keys.
    pub cipher: SessionCipher,
}

/// Run the initiator side. If `expected` is set, the responder must prove that identity.
pub async fn initiate(
    stream: &mut FramedStream,
    identity: &IdentityKeypair,
    expected: Option<PeerId>,
) -> Result<HandshakeOutcome, HandshakeError> {
    let local = identity.peer_id();
    let ephemeral = EphemeralKeypair::generate()?;
    let e_i = ephemeral.public_bytes();

    stream
        .send(&WireMessage::Handshake(Handshake {
            peer_id: local,
            ephemeral_pubkey: e_i,
            signature_over_nonce: identity.sign(&transcript(INIT_LABEL, &[&e_i])),
        }))
        .await?;

    let resp = expect_handshake(stream.recv().await?)?;
    let remote = resp.peer_id;
    let e_r = resp.ephemeral_pubkey;
    if !verify_signature(&remote, &transcript(RESP_LABEL, &[&e_r, &e_i]), &resp.signature_over_nonce) {
        return Err(HandshakeError::InvalidSignature(remote));
    }
    if let Some(expected) = expected {
        if remote != expected {
            return Err(HandshakeError::IdentityMismatch {
                expected,
                actual: remote,
            });
        }
    }
    if remote == local {
        return Err(HandshakeError::SelfConnection);
    }

    stream
        .send(&WireMessage::Handshake(Handshake {
            peer_id: local,
            ephemeral_pubkey: e_i,
            signature_over_nonce: identity.sign(&transcript(CONFIRM_LABEL, &[&e_i, &e_r])),
        }))
        .await?;

    let shared = ephemeral.agree(&e_r)?;
    let cipher = derive_session_keys(&shared, &key_info(&local, &remote, &e_i, &e_r), Role::Initiator)?;
    Ok(HandshakeOutcome {
        peer_id: remote,
        cipher,
    })
}

/// Run the responder side on an accepted stream.
pub async fn respond(
    stream: &mut FramedStream,
    identity: &IdentityKeypair,
) -> Result<HandshakeOutcome, HandshakeError> {
    let local = identity.peer_id();

    let init = expect_handshake(stream.recv().await?)?;
    let remote = init.peer_id;
    let e_i = init.ephemeral_pubkey;
    if !verify_signature(&remote, &transcript(INIT_LABEL, &[&e_i]), &init.signature_over_nonce) {
        return Err(HandshakeError::InvalidSignature(remote));
    }
    if remote == local {
        return Err(HandshakeError::SelfConnection);
    }

    let ephemeral = EphemeralKeypair::generate()?;
    let e_r = ephemeral.public_bytes();
    stream
        .send(&WireMessage::Handshake(Handshake {
            peer_id: local,
            ephemeral_pubkey: e_r,
            signature_over_nonce: identity.sign(&transcript(RESP_LABEL, &[&e_r, &e_i])),
        }))
        .await?;

    let confirm = expect_handshake(stream.recv().await?)?;
    if confirm.peer_id != remote || confirm.ephemeral_pubkey != e_i {
        return Err(HandshakeError::TranscriptMismatch);
    }
    if !verify_signature(&remote, &transcript(CONFIRM_LABEL, &[&e_i, &e_r]), &confirm.signature_over_nonce) {
        return Err(HandshakeError::InvalidSignature(remote));
    }

    let shared = ephemeral.agree(&e_i)?;
    let cipher = derive_session_keys(&shared, &key_info(&remote, &local, &e_i, &e_r), Role::Responder)?;
    Ok(HandshakeOutcome {
        peer_id: remote,
        cipher,
    })
}

fn expect_handshake(message: WireMessage) -> Result<Handshake, HandshakeError> {
    match message {
        WireMessage::Handshake(h) => Ok(h),
        other => Err(HandshakeError::UnexpectedMessage(other.kind())),
    }
}

fn transcript(label: &[u8], keys: &[&[u8; 32]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(label.len() + keys.len() * 32);
    out.extend_from_slice(label);
    for key in keys {
        out.extend_from_slice(*key);
    }
    out
}

fn key_info(initiator: &PeerId, responder: &PeerId, e_i: &[u8; 32], e_r: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(initiator.as_bytes());
    out.extend_from_slice(responder.as_bytes());
    out.extend_from_slice(e_i);
    out.extend_from_slice(e_r);
    out
}
