//! Event codec: sign, encrypt and content-address individual events
//!
//! `payload_cipher = nonce(12) || AEAD_ciphertext || AEAD_tag(16)` under the
//! community key; `event_id = SHA-256(payload_cipher)`. The nonce source is
//! pluggable so the simulator's replay mode can freeze nonce generation to a
//! seeded stream.

use crate::canonical::{canonical_bytes, sign_bytes};
use crate::error::CodecError;
use crate::keys::{CommunityKey, KeyPair};
use crate::types::{DeviceId, Envelope, EventId, EventMeta, Payload};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::VerifyingKey;
use rand::rngs::OsRng;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha12Rng;
use sha2::{Digest, Sha256};

/// AEAD nonce length prepended to every ciphertext.
pub const NONCE_LEN: usize = 12;
/// Poly1305 tag length appended by the AEAD.
pub const TAG_LEN: usize = 16;

/// Maximum tolerated forward clock skew for `authored_ts`.
pub const MAX_CLOCK_SKEW_MS: i64 = 60_000;
/// Events older than this are rejected on open.
pub const MAX_EVENT_AGE_MS: i64 = 365 * 24 * 3600 * 1000;

/// Source of AEAD nonces.
///
/// Live devices draw from the OS; replay mode substitutes a seeded stream so
/// sealed bytes reproduce exactly.
pub trait NonceSource: Send {
    fn next_nonce(&mut self) -> [u8; NONCE_LEN];
}

/// OS-entropy nonces (the default).
pub struct OsNonce;

impl NonceSource for OsNonce {
    fn next_nonce(&mut self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }
}

/// Deterministic nonce stream for replay mode.
pub struct SeededNonce(ChaCha12Rng);

impl SeededNonce {
    pub fn new(seed: [u8; 32]) -> Self {
        Self(ChaCha12Rng::from_seed(seed))
    }
}

impl NonceSource for SeededNonce {
    fn next_nonce(&mut self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        self.0.fill_bytes(&mut nonce);
        nonce
    }
}

/// A sealed event ready for storage or the wire.
#[derive(Clone, Debug)]
pub struct SealedEvent {
    pub event_id: EventId,
    pub payload_cipher: Vec<u8>,
    pub meta: EventMeta,
}

/// A successfully opened event.
#[derive(Clone, Debug)]
pub struct OpenedEvent {
    pub payload: Payload,
    pub author: DeviceId,
    pub authored_ts: i64,
}

/// Compute the content address of a ciphertext.
pub fn event_id(payload_cipher: &[u8]) -> EventId {
    let digest = Sha256::digest(payload_cipher);
    EventId(digest.into())
}

/// Serialize, sign, encrypt and content-address a plaintext payload.
pub fn seal(
    payload: Payload,
    author: &DeviceId,
    keys: &KeyPair,
    community_key: &CommunityKey,
    authored_ts: i64,
    nonces: &mut dyn NonceSource,
) -> Result<SealedEvent, CodecError> {
    let signature = keys.sign(&sign_bytes(&payload, author, authored_ts)?);
    let meta = EventMeta::of(&payload);

    let envelope = Envelope {
        payload,
        author: author.clone(),
        authored_ts,
        signature: BASE64.encode(signature),
    };
    let envelope_bytes = canonical_bytes(&envelope)?;

    let cipher = ChaCha20Poly1305::new_from_slice(&community_key.0)
        .expect("community key is 32 bytes");
    let nonce_bytes = nonces.next_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, envelope_bytes.as_slice())
        .map_err(|_| CodecError::Decrypt)?;

    let mut payload_cipher = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    payload_cipher.extend_from_slice(&nonce_bytes);
    payload_cipher.extend_from_slice(&ciphertext);

    Ok(SealedEvent {
        event_id: event_id(&payload_cipher),
        payload_cipher,
        meta,
    })
}

/// Decrypt, parse and authenticate a `payload_cipher`.
///
/// `resolve_pubkey` maps the claimed author to a known verifying key; an
/// unresolvable author is rejected before signature verification.
pub fn open(
    payload_cipher: &[u8],
    community_key: &CommunityKey,
    resolve_pubkey: impl Fn(&DeviceId) -> Option<VerifyingKey>,
    now: i64,
) -> Result<OpenedEvent, CodecError> {
    if payload_cipher.len() < NONCE_LEN + TAG_LEN {
        return Err(CodecError::Decrypt);
    }
    let (nonce_bytes, ciphertext) = payload_cipher.split_at(NONCE_LEN);

    let cipher = ChaCha20Poly1305::new_from_slice(&community_key.0)
        .expect("community key is 32 bytes");
    let envelope_bytes = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CodecError::Decrypt)?;

    let envelope: Envelope = serde_json::from_slice(&envelope_bytes)
        .map_err(|e| CodecError::Deserialize(e.to_string()))?;

    let verifying_key = resolve_pubkey(&envelope.author)
        .ok_or_else(|| CodecError::UnknownAuthor(envelope.author.clone()))?;

    let signature: [u8; 64] = BASE64
        .decode(&envelope.signature)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(CodecError::BadSignature)?;
    let signed = sign_bytes(&envelope.payload, &envelope.author, envelope.authored_ts)?;
    KeyPair::verify(&verifying_key.to_bytes(), &signed, &signature)
        .map_err(|_| CodecError::BadSignature)?;

    if envelope.authored_ts > now + MAX_CLOCK_SKEW_MS
        || envelope.authored_ts < now - MAX_EVENT_AGE_MS
    {
        return Err(CodecError::OutOfRange {
            authored_ts: envelope.authored_ts,
            now,
        });
    }

    Ok(OpenedEvent {
        payload: envelope.payload,
        author: envelope.author,
        authored_ts: envelope.authored_ts,
    })
}
