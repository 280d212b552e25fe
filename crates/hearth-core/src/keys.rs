//! Key material: device signing keys, the community key, per-file keys
//!
//! Each device owns one Ed25519 keypair; the community shares one 32-byte
//! symmetric key distributed out-of-band; every upload mints a fresh file
//! key. Debug output never prints secret bytes.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;

/// Key errors
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    BadSignature,
}

/// Ed25519 keypair for authorship and summary signing.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from seed bytes (deterministic, used by the simulator and the
    /// daemon's persisted identity).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Get the public key bytes.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature against a raw public key.
    pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> Result<(), KeyError> {
        let verifying_key =
            VerifyingKey::from_bytes(public_key).map_err(|_| KeyError::InvalidPublicKey)?;
        let sig = Signature::from_bytes(signature);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| KeyError::BadSignature)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({})", &hex::encode(self.public_key())[..16])
    }
}

/// The 32-byte symmetric key shared by every community member; AEAD key for
/// every event envelope.
#[derive(Clone, PartialEq, Eq)]
pub struct CommunityKey(pub [u8; 32]);

impl CommunityKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the key from a shared passphrase with HKDF-SHA256.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let hkdf = Hkdf::<Sha256>::new(None, passphrase.as_bytes());
        let mut key = [0u8; 32];
        // expand only fails for absurd output lengths
        hkdf.expand(b"hearth community key v1", &mut key)
            .expect("32 bytes is a valid HKDF output length");
        Self(key)
    }
}

impl fmt::Debug for CommunityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CommunityKey(..)")
    }
}

/// Per-file symmetric key, minted at upload and carried in the manifest.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileKey(#[serde(with = "hex::serde")] pub [u8; 32]);

impl FileKey {
    /// Mint a key from the caller's randomness source.
    pub fn generate(rng: &mut dyn RngCore) -> Self {
        let mut key = [0u8; 32];
        rng.fill_bytes(&mut key);
        Self(key)
    }
}

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FileKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = KeyPair::generate();
        let msg = b"hello world";
        let sig = kp.sign(msg);
        assert!(KeyPair::verify(&kp.public_key(), msg, &sig).is_ok());
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"hello");
        assert!(matches!(
            KeyPair::verify(&kp.public_key(), b"hullo", &sig),
            Err(KeyError::BadSignature)
        ));
    }

    #[test]
    fn seeded_keypair_is_deterministic() {
        let a = KeyPair::from_seed(&[7; 32]);
        let b = KeyPair::from_seed(&[7; 32]);
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn passphrase_derivation_is_stable() {
        let a = CommunityKey::from_passphrase("correct horse battery staple");
        let b = CommunityKey::from_passphrase("correct horse battery staple");
        let c = CommunityKey::from_passphrase("other phrase");
        assert_eq!(a.0, b.0);
        assert_ne!(a.0, c.0);
    }

    #[test]
    fn debug_redacts_secrets() {
        let key = CommunityKey::generate();
        assert_eq!(format!("{:?}", key), "CommunityKey(..)");
    }
}
