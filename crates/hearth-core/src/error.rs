//! Error types shared across the core

use crate::types::DeviceId;
use thiserror::Error;

/// Codec errors: everything that can go wrong sealing or opening an event.
#[derive(Debug, Error)]
pub enum CodecError {
    /// AEAD failure: wrong community key or corrupted ciphertext.
    #[error("decryption failed")]
    Decrypt,

    /// The decrypted envelope is not valid canonical JSON.
    #[error("envelope deserialization failed: {0}")]
    Deserialize(String),

    /// The claimed author has no known public key.
    #[error("unknown author: {0}")]
    UnknownAuthor(DeviceId),

    /// The envelope signature does not verify against the author's key.
    #[error("bad envelope signature")]
    BadSignature,

    /// `authored_ts` is in the future or more than a year old.
    #[error("authored_ts {authored_ts} out of range at {now}")]
    OutOfRange { authored_ts: i64, now: i64 },

    /// Canonical serialization failed while sealing.
    #[error("serialization error: {0}")]
    Serialize(String),
}
