//! # Message Signing
//!
//! secp256k1 signatures over SHA-256 of the canonical payload, plus the
//! public-key ↔ peer-id mapping every verification depends on.
//!
//! ## Signing Discipline
//!
//! The payload is hashed with SHA-256 before any signature operation, matching
//! the gossip library's internal framing. A peer id is the SHA-256 of the
//! signer's SEC1-compressed public key, so the id commits to the key but the
//! key itself is not recoverable from it: envelopes carry the key in their
//! `key` field and the [`P2pKeyConverter`] keeps the bounded mapping learned
//! from them. A mismatch between a claimed peer id and the carried key is
//! fatal for that message.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use k256::ecdsa::signature::{DigestSigner, DigestVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::peer::PeerId;

/// Upper bound on remembered peer-id → public-key associations.
pub const MAX_KNOWN_PUBLIC_KEYS: usize = 10_000;

/// Error type for signing and verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningError {
    /// The private key bytes do not form a valid secp256k1 scalar.
    InvalidPrivateKey,
    /// The public key bytes are not a valid SEC1 point.
    InvalidPublicKey,
    /// The signature bytes are malformed.
    InvalidSignature,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// No public key is known for the claimed peer id.
    UnknownPeer,
    /// The claimed peer id does not match the carried public key.
    PeerIdMismatch,
}

impl fmt::Display for SigningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningError::InvalidPrivateKey => write!(f, "invalid secp256k1 private key"),
            SigningError::InvalidPublicKey => write!(f, "invalid secp256k1 public key"),
            SigningError::InvalidSignature => write!(f, "malformed signature"),
            SigningError::VerificationFailed => write!(f, "signature verification failed"),
            SigningError::UnknownPeer => write!(f, "no public key known for peer id"),
            SigningError::PeerIdMismatch => write!(f, "peer id does not match public key"),
        }
    }
}

impl std::error::Error for SigningError {}

/// Maps between public keys and peer ids and remembers the association so
/// later envelopes from the same peer can be verified without carrying a key.
pub trait P2pKeyConverter: Send + Sync {
    /// Derive the peer id of a SEC1-encoded public key without remembering it.
    fn peer_id_from_public_key(&self, key_bytes: &[u8]) -> Result<PeerId, SigningError>;

    /// Validate a SEC1-encoded public key, remember its association and
    /// return the derived peer id.
    fn register_public_key(&self, key_bytes: &[u8]) -> Result<PeerId, SigningError>;

    /// Look up the SEC1-compressed public key previously learned for a peer.
    fn public_key_from_peer_id(&self, pid: &PeerId) -> Result<Vec<u8>, SigningError>;
}

/// Default converter: an LRU-bounded registry of learned keys.
pub struct RegistryKeyConverter {
    known: Mutex<LruCache<PeerId, Vec<u8>>>,
}

impl RegistryKeyConverter {
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(MAX_KNOWN_PUBLIC_KEYS).expect("cache capacity is non-zero");
        Self {
            known: Mutex::new(LruCache::new(cap)),
        }
    }
}

impl Default for RegistryKeyConverter {
    fn default() -> Self {
        Self::new()
    }
}

fn compressed_key_bytes(key: &VerifyingKey) -> Vec<u8> {
    key.to_encoded_point(true).as_bytes().to_vec()
}

/// The peer id of a verifying key: SHA-256 of its SEC1-compressed encoding.
pub fn peer_id_from_verifying_key(key: &VerifyingKey) -> PeerId {
    let digest = Sha256::digest(compressed_key_bytes(key));
    PeerId::from_bytes(digest.to_vec())
}

impl P2pKeyConverter for RegistryKeyConverter {
    fn peer_id_from_public_key(&self, key_bytes: &[u8]) -> Result<PeerId, SigningError> {
        let key =
            VerifyingKey::from_sec1_bytes(key_bytes).map_err(|_| SigningError::InvalidPublicKey)?;
        Ok(peer_id_from_verifying_key(&key))
    }

    fn register_public_key(&self, key_bytes: &[u8]) -> Result<PeerId, SigningError> {
        let key =
            VerifyingKey::from_sec1_bytes(key_bytes).map_err(|_| SigningError::InvalidPublicKey)?;
        let pid = peer_id_from_verifying_key(&key);

        let mut known = self.known.lock().expect("key registry lock poisoned");
        known.put(pid.clone(), compressed_key_bytes(&key));

        Ok(pid)
    }

    fn public_key_from_peer_id(&self, pid: &PeerId) -> Result<Vec<u8>, SigningError> {
        let mut known = self.known.lock().expect("key registry lock poisoned");
        known.get(pid).cloned().ok_or(SigningError::UnknownPeer)
    }
}

/// Signs outbound payloads with the node key and verifies inbound ones
/// against the key learned for the claimed originator.
pub struct P2pSigner {
    signing_key: SigningKey,
    converter: Arc<dyn P2pKeyConverter>,
}

impl P2pSigner {
    /// The node's own key is registered immediately so loopback messages verify.
    pub fn new(signing_key: SigningKey, converter: Arc<dyn P2pKeyConverter>) -> Self {
        let own_key = compressed_key_bytes(signing_key.verifying_key());
        // Registration of our own freshly derived key cannot fail.
        let _ = converter.register_public_key(&own_key);

        Self {
            signing_key,
            converter,
        }
    }

    /// Convenience constructor generating a fresh node key.
    pub fn generate(converter: Arc<dyn P2pKeyConverter>) -> Self {
        Self::new(SigningKey::random(&mut rand::rngs::OsRng), converter)
    }

    pub fn own_peer_id(&self) -> PeerId {
        peer_id_from_verifying_key(self.signing_key.verifying_key())
    }

    /// SEC1-compressed encoding of the node's public key, carried in envelopes.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        compressed_key_bytes(self.signing_key.verifying_key())
    }

    pub fn key_converter(&self) -> &Arc<dyn P2pKeyConverter> {
        &self.converter
    }

    /// Sign SHA-256(payload) with the node key.
    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, SigningError> {
        let signature: Signature = self
            .signing_key
            .sign_digest(Sha256::new_with_prefix(payload));
        Ok(signature.to_bytes().to_vec())
    }

    /// Check the (SHA-256(payload), peer id, signature) tuple.
    pub fn verify(
        &self,
        payload: &[u8],
        pid: &PeerId,
        signature: &[u8],
    ) -> Result<(), SigningError> {
        let key_bytes = self.converter.public_key_from_peer_id(pid)?;
        let key = VerifyingKey::from_sec1_bytes(&key_bytes)
            .map_err(|_| SigningError::InvalidPublicKey)?;
        let signature =
            Signature::from_slice(signature).map_err(|_| SigningError::InvalidSignature)?;

        key.verify_digest(Sha256::new_with_prefix(payload), &signature)
            .map_err(|_| SigningError::VerificationFailed)
    }

    /// Sign SHA-256(payload) with a caller-provided private key.
    pub fn sign_using_private_key(
        &self,
        sk_bytes: &[u8],
        payload: &[u8],
    ) -> Result<Vec<u8>, SigningError> {
        let sk = SigningKey::from_slice(sk_bytes).map_err(|_| SigningError::InvalidPrivateKey)?;
        let signature: Signature = sk.sign_digest(Sha256::new_with_prefix(payload));
        Ok(signature.to_bytes().to_vec())
    }

    /// Derive (peer id, SEC1-compressed public key) from raw private key bytes.
    /// Used to enforce that a caller-provided pid matches the signing key.
    pub fn identity_from_private_key(
        &self,
        sk_bytes: &[u8],
    ) -> Result<(PeerId, Vec<u8>), SigningError> {
        let sk = SigningKey::from_slice(sk_bytes).map_err(|_| SigningError::InvalidPrivateKey)?;
        let key = sk.verifying_key();
        Ok((peer_id_from_verifying_key(key), compressed_key_bytes(key)))
    }
}
