//! Core event types for the Hearth substrate
//!
//! Everything that crosses a device boundary is either an encrypted event
//! (`payload_cipher`) or the clear metadata that rides beside it. Identifiers
//! serialize as lowercase hex in JSON so the canonical envelope encoding is
//! stable across implementations.

use crate::keys::FileKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Base64 serde for bulk byte fields; hex would double their envelope size.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// 32-byte fixed-size array used for hashes and identifiers.
pub type Bytes32 = [u8; 32];

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// Device identifier: a short, human-assigned string, unique per community.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Logical stream identifier for messages and reactions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Event identifier: SHA-256 of the full `payload_cipher` (nonce included).
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(#[serde(with = "hex::serde")] pub Bytes32);

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", &hex::encode(self.0)[..16])
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// File identifier: 32 random bytes chosen by the uploader.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(#[serde(with = "hex::serde")] pub Bytes32);

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", &hex::encode(self.0)[..16])
    }
}

/// Keyed pseudorandom tag identifying one file chunk to file-key holders.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrfTag(#[serde(with = "hex::serde")] pub [u8; 16]);

// =============================================================================
// PLAINTEXT PAYLOAD
// =============================================================================

/// File manifest carried inside a message attachment.
///
/// `chunk_count` counts data chunks only; parity chunk numbering continues
/// after the data chunks. The manifest is confidential (it carries the file
/// key) and only ever appears inside an encrypted payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FileManifest {
    pub file_id: FileId,
    pub file_key: FileKey,
    pub mime: String,
    pub byte_length: u64,
    pub chunk_count: u32,
    pub parity_count: u32,
    pub parity_group_size: u32,
    /// BLAKE3 of the original file bytes, checked after reassembly.
    #[serde(with = "hex::serde")]
    pub content_hash: Bytes32,
}

/// Plaintext event payload: the tagged union inside the encrypted envelope.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// A chat message, optionally announcing file attachments.
    Message {
        channel: ChannelId,
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<FileManifest>,
    },
    /// A reaction on an earlier event. Removal is itself an event.
    Reaction {
        channel: ChannelId,
        target: EventId,
        emoji: String,
        remove: bool,
    },
    /// One encrypted chunk of an uploaded file.
    ///
    /// `cipher` is ciphertext under the per-file key, opaque to everyone who
    /// only holds the community key. The PRF tag is computed by the uploader
    /// (it requires the file key) and travels inside the payload so sealing
    /// can extract complete metadata.
    FileChunk {
        file_id: FileId,
        chunk_no: u32,
        is_parity: bool,
        prf_tag: PrfTag,
        #[serde(with = "b64")]
        cipher: Vec<u8>,
    },
    /// Connectivity announcement, authored by the simulation layer.
    DeviceStatus { online: bool },
}

impl Payload {
    /// The channel this payload belongs to, if any.
    pub fn channel(&self) -> Option<&ChannelId> {
        match self {
            Payload::Message { channel, .. } | Payload::Reaction { channel, .. } => Some(channel),
            _ => None,
        }
    }
}

// =============================================================================
// SIGNED ENVELOPE
// =============================================================================

/// The signed plaintext of every event, JSON-encoded before encryption.
///
/// `signature` is the base64 Ed25519 signature over the canonical bytes of
/// `(author, authored_ts, payload)`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub payload: Payload,
    pub author: DeviceId,
    pub authored_ts: i64,
    pub signature: String,
}

// =============================================================================
// CLEAR METADATA
// =============================================================================

/// File metadata columns, present iff the event is a `file_chunk`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMeta {
    pub file_id: FileId,
    pub chunk_no: u32,
    pub is_parity: bool,
    pub prf_tag: PrfTag,
}

/// Metadata that travels in the clear beside `payload_cipher` and feeds the
/// store's secondary indexes.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EventMeta {
    pub channel: Option<ChannelId>,
    pub file: Option<FileMeta>,
}

impl EventMeta {
    /// Extract the indexable metadata from a plaintext payload.
    pub fn of(payload: &Payload) -> Self {
        let file = match payload {
            Payload::FileChunk {
                file_id,
                chunk_no,
                is_parity,
                prf_tag,
                ..
            } => Some(FileMeta {
                file_id: *file_id,
                chunk_no: *chunk_no,
                is_parity: *is_parity,
                prf_tag: *prf_tag,
            }),
            _ => None,
        };
        Self {
            channel: payload.channel().cloned(),
            file,
        }
    }

    /// Check that clear metadata agrees with the decrypted payload.
    ///
    /// The metadata is unauthenticated on the wire; a mismatch means the
    /// sender tampered with it and the event must be dropped.
    pub fn matches(&self, payload: &Payload) -> bool {
        *self == Self::of(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_hex_roundtrip() {
        let id = EventId([0xab; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        let back: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn meta_extraction() {
        let msg = Payload::Message {
            channel: ChannelId::new("general"),
            text: "hi".into(),
            attachments: vec![],
        };
        let meta = EventMeta::of(&msg);
        assert_eq!(meta.channel, Some(ChannelId::new("general")));
        assert!(meta.file.is_none());

        let chunk = Payload::FileChunk {
            file_id: FileId([1; 32]),
            chunk_no: 4,
            is_parity: true,
            prf_tag: PrfTag([2; 16]),
            cipher: vec![1, 2, 3],
        };
        let meta = EventMeta::of(&chunk);
        assert!(meta.channel.is_none());
        let file = meta.file.unwrap();
        assert_eq!(file.chunk_no, 4);
        assert!(file.is_parity);
    }

    #[test]
    fn meta_mismatch_detected() {
        let chunk = Payload::FileChunk {
            file_id: FileId([1; 32]),
            chunk_no: 0,
            is_parity: false,
            prf_tag: PrfTag([2; 16]),
            cipher: vec![],
        };
        let mut meta = EventMeta::of(&chunk);
        assert!(meta.matches(&chunk));
        meta.file.as_mut().unwrap().chunk_no = 1;
        assert!(!meta.matches(&chunk));
    }
}
