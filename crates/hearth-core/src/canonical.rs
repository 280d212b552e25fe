//! Canonical encoding for signed objects
//!
//! Everything that is hashed or signed goes through one encoding: the UTF-8
//! JSON serialization of the value with object keys in lexicographic order.
//! `serde_json::Value` keeps object members in a sorted map, so routing the
//! serialization through `Value` yields the canonical form; implementations
//! in other languages must produce identical bytes.

use crate::error::CodecError;
use crate::types::{DeviceId, Payload};
use serde::Serialize;

/// Serialize a value to canonical bytes.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let value = serde_json::to_value(value).map_err(|e| CodecError::Serialize(e.to_string()))?;
    serde_json::to_vec(&value).map_err(|e| CodecError::Serialize(e.to_string()))
}

#[derive(Serialize)]
struct SignInput<'a> {
    author: &'a DeviceId,
    authored_ts: i64,
    payload: &'a Payload,
}

/// The exact bytes covered by an event signature.
pub fn sign_bytes(
    payload: &Payload,
    author: &DeviceId,
    authored_ts: i64,
) -> Result<Vec<u8>, CodecError> {
    canonical_bytes(&SignInput {
        author,
        authored_ts,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelId;

    fn test_payload() -> Payload {
        Payload::Message {
            channel: ChannelId::new("general"),
            text: "hello".into(),
            attachments: vec![],
        }
    }

    #[test]
    fn keys_are_sorted() {
        let bytes = sign_bytes(&test_payload(), &DeviceId::new("alice"), 42).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            r#"{"author":"alice","authored_ts":42,"payload":{"channel":"general","text":"hello","type":"message"}}"#
        );
    }

    #[test]
    fn canonical_bytes_deterministic() {
        let a = sign_bytes(&test_payload(), &DeviceId::new("alice"), 42).unwrap();
        let b = sign_bytes(&test_payload(), &DeviceId::new("alice"), 42).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn author_changes_bytes() {
        let a = sign_bytes(&test_payload(), &DeviceId::new("alice"), 42).unwrap();
        let b = sign_bytes(&test_payload(), &DeviceId::new("bob"), 42).unwrap();
        assert_ne!(a, b);
    }
}
