//! Hearth Core Library
//!
//! Core building blocks of the Hearth messaging substrate: the event model,
//! the canonical encoding used for signing, the sealing codec, Bloom
//! summaries for anti-entropy, and key material.
//!
//! # Modules
//!
//! - [`types`]: event model (ids, payloads, envelopes, clear metadata)
//! - [`canonical`]: deterministic serialization for hashing/signing
//! - [`codec`]: seal/open between plaintext payloads and `payload_cipher`
//! - [`bloom`]: fixed-size probabilistic event-id summaries
//! - [`keys`]: device keypairs, community key, file keys
//! - [`error`]: shared error types

pub mod bloom;
pub mod canonical;
pub mod codec;
pub mod error;
pub mod keys;
pub mod types;

pub use bloom::{BloomSummary, SignedSummary};
pub use codec::{open, seal, NonceSource, OpenedEvent, OsNonce, SealedEvent, SeededNonce};
pub use error::CodecError;
pub use keys::{CommunityKey, FileKey, KeyPair};
pub use types::*;
