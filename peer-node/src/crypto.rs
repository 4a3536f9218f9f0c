//! Encryption Core for hearth peers.
//!
//! This module provides:
//! - Node identity (Ed25519), persisted so the peer id is stable
//! - At-rest encryption (XChaCha20-Poly1305) behind the [`ContentCipher`] seam,
//!   with device-adaptive Argon2id for passphrase-derived keys
//! - Ephemeral X25519 agreement and HKDF-SHA256 session key derivation
//! - [`SessionCipher`] sealing deltas and acknowledgements on a session
//!
//! # Security Notes
//!
//! - At-rest nonces are 192-bit and random
//! - Session nonces are derived from (direction key, origin, sequence); every
//!   session has fresh keys so a nonce never repeats under one key
//! - Key material is zeroized on drop and redacted in `Debug`

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, AeadInPlace, KeyInit},
    Tag, XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey};
use hkdf::Hkdf;
use peer_types::{ContentHash, PeerId, RegistryRecord, Sequence, WireAddress, WireError};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size for XChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Poly1305 tag size.
pub const TAG_SIZE: usize = 16;

/// File holding the node identity inside the storage directory.
pub const IDENTITY_FILE: &str = "identity.key";

/// File holding the at-rest key inside the storage directory.
pub const STORAGE_KEY_FILE: &str = "storage.key";

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// The OS random number generator failed.
    #[error("random number generation failed: {0}")]
    Random(String),

    /// Key agreement produced a non-contributory (low-order) secret.
    #[error("key agreement rejected: low-order public key")]
    WeakKeyAgreement,

    /// Key file unreadable or malformed.
    #[error("key file {path}: {reason}")]
    KeyFile {
        /// File path.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// IO error while reading or writing key material.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The address set cannot be encoded for signing.
    #[error("unsignable record: {0}")]
    Record(#[from] WireError),
}

fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes).map_err(|e| CryptoError::Random(e.to_string()))?;
    Ok(bytes)
}

// ===========================================
// Argon2
// ===========================================

/// Argon2id parameters for device-adaptive key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Params {
    memory_mib: u32,
    iterations: u32,
    parallelism: u32,
}

impl Argon2Params {
    /// Create parameters based on available RAM in MB.
    ///
    /// Scaling:
    /// - < 2000 MB: 12 MiB, 3 iterations (small boards, Raspberry Pi class)
    /// - < 4000 MB: 19 MiB, 2 iterations
    /// - < 8000 MB: 46 MiB, 1 iteration
    /// - >= 8000 MB: 64 MiB, 3 iterations (desktop/server)
    pub fn for_ram_mb(ram_mb: u64) -> Self {
        let (memory_mib, iterations, parallelism) = match ram_mb {
            0..=1999 => (12, 3, 1),
            2000..=3999 => (19, 2, 1),
            4000..=7999 => (46, 1, 1),
            _ => (64, 3, 4),
        };
        Self {
            memory_mib,
            iterations,
            parallelism,
        }
    }

    /// Get memory in MiB.
    pub fn memory_mib(&self) -> u32 {
        self.memory_mib
    }

    /// Get iteration count.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    fn to_argon2_params(self) -> Result<Params, CryptoError> {
        Params::new(
            self.memory_mib * 1024, // MiB to KiB
            self.iterations,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))
    }
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self::for_ram_mb(detect_available_ram_mb())
    }
}

/// Detect total RAM in megabytes.
pub fn detect_available_ram_mb() -> u64 {
    use sysinfo::System;
    let sys = System::new_all();
    sys.total_memory() / (1024 * 1024)
}

// ===========================================
// At-rest encryption
// ===========================================

/// At-rest encryption seam consumed by the synchronization engine.
///
/// `seal` output is self-contained (nonce included) so it can be stored and
/// later handed back to `open` unchanged.
pub trait ContentCipher: Send + Sync {
    /// Encrypt `plaintext` for storage.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt a value produced by [`ContentCipher::seal`].
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Symmetric key for data at rest.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StorageKey([u8; KEY_SIZE]);

impl StorageKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Wrap a key of unchecked length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self(key))
    }

    /// Generate a random key.
    pub fn random() -> Result<Self, CryptoError> {
        Ok(Self(random_bytes()?))
    }

    /// Load `<dir>/storage.key`, creating a random key (mode 0600) on first start.
    pub fn load_or_create(dir: &Path) -> Result<Self, CryptoError> {
        let path = dir.join(STORAGE_KEY_FILE);
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let mut bytes = hex::decode(text.trim()).map_err(|e| CryptoError::KeyFile {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            let key = Self::from_slice(&bytes);
            bytes.zeroize();
            return key;
        }

        std::fs::create_dir_all(dir)?;
        let key = Self::random()?;
        let mut encoded = hex::encode(key.0);
        write_private_file(&path, encoded.as_bytes())?;
        encoded.zeroize();
        Ok(key)
    }

    /// Derive a key from a passphrase with Argon2id, tuned to this machine.
    pub fn from_passphrase(passphrase: &str, salt: &[u8]) -> Result<Self, CryptoError> {
        Self::from_passphrase_with_params(passphrase, salt, Argon2Params::default())
    }

    /// Derive a key from a passphrase with explicit Argon2 parameters.
    pub fn from_passphrase_with_params(
        passphrase: &str,
        salt: &[u8],
        params: Argon2Params,
    ) -> Result<Self, CryptoError> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2_params()?);
        let mut output = [0u8; KEY_SIZE];
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, &mut output)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        Ok(Self(output))
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305, CryptoError> {
        XChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }
}

impl ContentCipher for StorageKey {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes: [u8; NONCE_SIZE] = random_bytes()?;
        let ciphertext = self
            .cipher()?
            .encrypt(XNonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher()?
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageKey([REDACTED])")
    }
}

// ===========================================
// Identity
// ===========================================

/// The node's long-term Ed25519 identity. Its verifying key is the peer id.
pub struct IdentityKeypair {
    signing: SigningKey,
}

impl IdentityKeypair {
    /// Generate a fresh identity.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut seed: [u8; 32] = random_bytes()?;
        let identity = Self::from_secret_bytes(&seed);
        seed.zeroize();
        Ok(identity)
    }

    /// Rebuild an identity from its 32-byte secret.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    /// Load `<dir>/identity.key`, creating it (mode 0600) on first start.
    pub fn load_or_create(dir: &Path) -> Result<Self, CryptoError> {
        let path = dir.join(IDENTITY_FILE);
        let file_error = |reason: String| CryptoError::KeyFile {
            path: path.display().to_string(),
            reason,
        };

        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let mut bytes = hex::decode(text.trim()).map_err(|e| file_error(e.to_string()))?;
            let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                file_error(format!("expected 32 bytes, found {}", bytes.len()))
            })?;
            bytes.zeroize();
            return Ok(Self::from_secret_bytes(&secret));
        }

        std::fs::create_dir_all(dir)?;
        let identity = Self::generate()?;
        let mut encoded = hex::encode(identity.signing.to_bytes());
        write_private_file(&path, encoded.as_bytes())?;
        encoded.zeroize();
        Ok(identity)
    }

    /// This node's peer id.
    pub fn peer_id(&self) -> PeerId {
        PeerId::new(self.signing.verifying_key().to_bytes())
    }

    /// Sign `message`, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    /// Build a signed address record for this node.
    pub fn sign_record(&self, addresses: Vec<WireAddress>) -> Result<RegistryRecord, CryptoError> {
        let peer_id = self.peer_id();
        let signature = self.sign(&RegistryRecord::signing_bytes(&peer_id, &addresses)?);
        Ok(RegistryRecord {
            peer_id,
            addresses,
            signature,
        })
    }
}

impl std::fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityKeypair {{ peer_id: {}, secret: [REDACTED] }}", self.peer_id())
    }
}

/// Verify an Ed25519 signature made by `peer`.
pub fn verify_signature(peer: &PeerId, message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = peer.verifying_key() else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify_strict(message, &signature).is_ok()
}

#[cfg(unix)]
fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

// ===========================================
// Session keys
// ===========================================

/// One-shot X25519 keypair for a single handshake.
pub struct EphemeralKeypair {
    secret: x25519_dalek::StaticSecret,
    public: x25519_dalek::PublicKey,
}

impl EphemeralKeypair {
    /// Generate a fresh ephemeral keypair.
    pub fn generate() -> Result<Self, CryptoError> {
        let secret = x25519_dalek::StaticSecret::from(random_bytes::<32>()?);
        let public = x25519_dalek::PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Public half, sent in the handshake.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Diffie-Hellman with the counterpart's ephemeral key.
    pub fn agree(self, remote: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
        let shared = self.secret.diffie_hellman(&x25519_dalek::PublicKey::from(*remote));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakKeyAgreement);
        }
        Ok(shared.to_bytes())
    }
}

impl std::fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EphemeralKeypair {{ public: {}, secret: [REDACTED] }}", hex::encode(self.public.as_bytes()))
    }
}

/// Which end of the handshake we were.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed out.
    Initiator,
    /// Accepted.
    Responder,
}

/// Derive directional session keys from an X25519 shared secret.
///
/// `transcript` binds the keys to both identities and ephemeral keys.
pub fn derive_session_keys(
    shared: &[u8; 32],
    transcript: &[u8],
    role: Role,
) -> Result<SessionCipher, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(b"hearth-session-v1"), shared);
    let mut i2r = [0u8; KEY_SIZE];
    let mut r2i = [0u8; KEY_SIZE];
    let expand_err = |e: hkdf::InvalidLength| CryptoError::KeyDerivationFailed(e.to_string());
    hkdf.expand_multi_info(&[transcript, b"initiator->responder".as_slice()], &mut i2r)
        .map_err(expand_err)?;
    hkdf.expand_multi_info(&[transcript, b"responder->initiator".as_slice()], &mut r2i)
        .map_err(expand_err)?;

    let (send_key, recv_key) = match role {
        Role::Initiator => (i2r, r2i),
        Role::Responder => (r2i, i2r),
    };
    let cipher = SessionCipher { send_key, recv_key };
    i2r.zeroize();
    r2i.zeroize();
    Ok(cipher)
}

/// Nonce domains keep delta and ack nonces apart under one key.
const DELTA_DOMAIN: &[u8] = b"hearth-delta-nonce";
const ACK_DOMAIN: &[u8] = b"hearth-ack-nonce";

/// Per-session AEAD for deltas and acknowledgements.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionCipher {
    send_key: [u8; KEY_SIZE],
    recv_key: [u8; KEY_SIZE],
}

impl SessionCipher {
    /// Seal a delta payload for sending. Returns `(ciphertext, mac)`.
    pub fn seal_delta(
        &self,
        origin: &PeerId,
        sequence: Sequence,
        hash: &ContentHash,
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let mut buffer = plaintext.to_vec();
        let tag = cipher_for(&self.send_key)?
            .encrypt_in_place_detached(
                &derive_nonce(DELTA_DOMAIN, origin, sequence),
                &delta_aad(origin, sequence, hash),
                &mut buffer,
            )
            .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;
        Ok((buffer, tag.to_vec()))
    }

    /// Open a received delta payload; fails if anything in the header or body changed.
    pub fn open_delta(
        &self,
        origin: &PeerId,
        sequence: Sequence,
        hash: &ContentHash,
        ciphertext: &[u8],
        mac: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if mac.len() != TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let mut buffer = ciphertext.to_vec();
        cipher_for(&self.recv_key)?
            .decrypt_in_place_detached(
                &derive_nonce(DELTA_DOMAIN, origin, sequence),
                &delta_aad(origin, sequence, hash),
                &mut buffer,
                Tag::from_slice(mac),
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(buffer)
    }

    /// Authentication tag for an outgoing acknowledgement.
    pub fn ack_tag(&self, origin: &PeerId, sequence: Sequence) -> Result<Vec<u8>, CryptoError> {
        let tag = cipher_for(&self.send_key)?
            .encrypt_in_place_detached(
                &derive_nonce(ACK_DOMAIN, origin, sequence),
                &ack_aad(origin, sequence),
                &mut [],
            )
            .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;
        Ok(tag.to_vec())
    }

    /// Check the tag of a received acknowledgement.
    pub fn verify_ack(&self, origin: &PeerId, sequence: Sequence, mac: &[u8]) -> bool {
        if mac.len() != TAG_SIZE {
            return false;
        }
        let Ok(cipher) = cipher_for(&self.recv_key) else {
            return false;
        };
        cipher
            .decrypt_in_place_detached(
                &derive_nonce(ACK_DOMAIN, origin, sequence),
                &ack_aad(origin, sequence),
                &mut [],
                Tag::from_slice(mac),
            )
            .is_ok()
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionCipher {{ send_key: [REDACTED], recv_key: [REDACTED] }}")
    }
}

fn cipher_for(key: &[u8; KEY_SIZE]) -> Result<XChaCha20Poly1305, CryptoError> {
    XChaCha20Poly1305::new_from_slice(key).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

fn derive_nonce(domain: &[u8], origin: &PeerId, sequence: Sequence) -> XNonce {
    let digest = Sha256::new()
        .chain_update(domain)
        .chain_update(origin.as_bytes())
        .chain_update(sequence.value().to_be_bytes())
        .finalize();
    XNonce::clone_from_slice(&digest[..NONCE_SIZE])
}

fn delta_aad(origin: &PeerId, sequence: Sequence, hash: &ContentHash) -> Vec<u8> {
    let mut aad = Vec::with_capacity(32 + 8 + 32);
    aad.extend_from_slice(origin.as_bytes());
    aad.extend_from_slice(&sequence.value().to_be_bytes());
    aad.extend_from_slice(hash.as_bytes());
    aad
}

fn ack_aad(origin: &PeerId, sequence: Sequence) -> Vec<u8> {
    let mut aad = Vec::with_capacity(32 + 8);
    aad.extend_from_slice(origin.as_bytes());
    aad.extend_from_slice(&sequence.value().to_be_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn session_pair() -> (SessionCipher, SessionCipher) {
        let a = EphemeralKeypair::generate().unwrap();
        let b = EphemeralKeypair::generate().unwrap();
        let (a_pub, b_pub) = (a.public_bytes(), b.public_bytes());
        let shared_a = a.agree(&b_pub).unwrap();
        let shared_b = b.agree(&a_pub).unwrap();
        assert_eq!(shared_a, shared_b);

        let transcript = b"test transcript";
        (
            derive_session_keys(&shared_a, transcript, Role::Initiator).unwrap(),
            derive_session_keys(&shared_b, transcript, Role::Responder).unwrap(),
        )
    }

    // ===========================================
    // Argon2 Parameter Tests
    // ===========================================

    #[test]
    fn argon2_parameters_scale_with_ram() {
        assert_eq!(Argon2Params::for_ram_mb(1500).memory_mib(), 12);
        assert_eq!(Argon2Params::for_ram_mb(1500).iterations(), 3);
        assert_eq!(Argon2Params::for_ram_mb(3000).memory_mib(), 19);
        assert_eq!(Argon2Params::for_ram_mb(6000).memory_mib(), 46);
        assert_eq!(Argon2Params::for_ram_mb(6000).iterations(), 1);
        assert_eq!(Argon2Params::for_ram_mb(16000).memory_mib(), 64);
    }

    #[test]
    fn passphrase_key_is_deterministic_per_salt() {
        let params = Argon2Params::for_ram_mb(1500);
        let start = std::time::Instant::now();
        let k1 = StorageKey::from_passphrase_with_params("correct horse", b"node-salt-0001", params).unwrap();
        assert!(start.elapsed() <= Duration::from_secs(10));
        let k2 = StorageKey::from_passphrase_with_params("correct horse", b"node-salt-0001", params).unwrap();
        let k3 = StorageKey::from_passphrase_with_params("correct horse", b"node-salt-0002", params).unwrap();

        let sealed = k1.seal(b"profile").unwrap();
        assert_eq!(k2.open(&sealed).unwrap(), b"profile");
        assert!(k3.open(&sealed).is_err());
    }

    // ===========================================
    // At-rest Tests
    // ===========================================

    #[test]
    fn seal_prefixes_random_nonce() {
        let key = StorageKey::random().unwrap();
        let s1 = key.seal(b"same post").unwrap();
        let s2 = key.seal(b"same post").unwrap();

        assert_eq!(s1.len(), NONCE_SIZE + b"same post".len() + TAG_SIZE);
        assert_ne!(s1[..NONCE_SIZE], s2[..NONCE_SIZE]);
        assert_eq!(key.open(&s1).unwrap(), b"same post");
        assert_eq!(key.open(&s2).unwrap(), b"same post");
    }

    #[test]
    fn corrupted_or_short_input_fails_open() {
        let key = StorageKey::random().unwrap();
        let mut sealed = key.seal(b"post").unwrap();
        sealed[NONCE_SIZE] ^= 0xFF;
        assert!(matches!(key.open(&sealed), Err(CryptoError::DecryptionFailed)));
        assert!(matches!(key.open(&[0u8; 10]), Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn keys_are_redacted_in_debug() {
        assert!(format!("{:?}", StorageKey::random().unwrap()).contains("REDACTED"));
        let (session, _) = session_pair();
        assert!(format!("{session:?}").contains("REDACTED"));
    }

    // ===========================================
    // Identity Tests
    // ===========================================

    #[test]
    fn identity_persists_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let first = IdentityKeypair::load_or_create(dir.path()).unwrap();
        let second = IdentityKeypair::load_or_create(dir.path()).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join(IDENTITY_FILE))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn storage_key_persists_and_checks_length() {
        let dir = tempfile::tempdir().unwrap();
        let first = StorageKey::load_or_create(dir.path()).unwrap();
        let second = StorageKey::load_or_create(dir.path()).unwrap();
        let sealed = first.seal(b"post").unwrap();
        assert_eq!(second.open(&sealed).unwrap(), b"post");

        assert!(matches!(
            StorageKey::from_slice(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength { expected: 32, actual: 16 })
        ));
    }

    #[test]
    fn malformed_identity_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IDENTITY_FILE), "abcd").unwrap();
        let err = IdentityKeypair::load_or_create(dir.path()).unwrap_err();
        assert!(matches!(err, CryptoError::KeyFile { .. }));
    }

    #[test]
    fn signed_record_verifies_against_peer_id() {
        let id = IdentityKeypair::generate().unwrap();
        let record = id.sign_record(vec![WireAddress::from_endpoint(
            &peer_types::Endpoint::tcp("203.0.113.5", 9999),
            300,
        )])
        .unwrap();
        assert_eq!(record.peer_id, id.peer_id());
        assert!(record.verify().is_ok());

        let sig = id.sign(b"hello");
        assert!(verify_signature(&id.peer_id(), b"hello", &sig));
        assert!(!verify_signature(&id.peer_id(), b"hellp", &sig));
    }

    // ===========================================
    // Session Tests
    // ===========================================

    #[test]
    fn session_delta_opens_on_the_other_end() {
        let (initiator, responder) = session_pair();
        let origin = PeerId::new([7; 32]);
        let seq = Sequence::new(3);
        let hash = ContentHash::compute(&origin, seq, b"hi");

        let (ct, mac) = initiator.seal_delta(&origin, seq, &hash, b"hi").unwrap();
        assert_eq!(mac.len(), TAG_SIZE);
        assert_eq!(responder.open_delta(&origin, seq, &hash, &ct, &mac).unwrap(), b"hi");

        // Directional: our own send key cannot open what we sent.
        assert!(initiator.open_delta(&origin, seq, &hash, &ct, &mac).is_err());
    }

    #[test]
    fn tampered_header_or_mac_is_rejected() {
        let (initiator, responder) = session_pair();
        let origin = PeerId::new([7; 32]);
        let seq = Sequence::new(3);
        let hash = ContentHash::compute(&origin, seq, b"hi");
        let (ct, mac) = initiator.seal_delta(&origin, seq, &hash, b"hi").unwrap();

        assert!(responder.open_delta(&origin, Sequence::new(4), &hash, &ct, &mac).is_err());
        let other = ContentHash::compute(&origin, seq, b"ho");
        assert!(responder.open_delta(&origin, seq, &other, &ct, &mac).is_err());
        let mut bad_mac = mac.clone();
        bad_mac[0] ^= 1;
        assert!(responder.open_delta(&origin, seq, &hash, &ct, &bad_mac).is_err());
        assert!(responder.open_delta(&origin, seq, &hash, &ct, &mac[..8]).is_err());
    }

    #[test]
    fn ack_tags_verify_only_for_same_cursor() {
        let (initiator, responder) = session_pair();
        let origin = PeerId::new([1; 32]);
        let tag = responder.ack_tag(&origin, Sequence::new(9)).unwrap();

        assert!(initiator.verify_ack(&origin, Sequence::new(9), &tag));
        assert!(!initiator.verify_ack(&origin, Sequence::new(10), &tag));
        assert!(!initiator.verify_ack(&PeerId::new([2; 32]), Sequence::new(9), &tag));
    }

    #[test]
    fn low_order_point_is_rejected() {
        let eph = EphemeralKeypair::generate().unwrap();
        assert!(matches!(eph.agree(&[0u8; 32]), Err(CryptoError::WeakKeyAgreement)));
    }

    #[test]
    fn detect_ram_returns_reasonable_value() {
        let ram_mb = detect_available_ram_mb();
        assert!(ram_mb >= 128, "Detected RAM: {} MB", ram_mb);
        assert!(ram_mb < 1024 * 1024, "Detected RAM: {} MB", ram_mb);
    }
}
