//! Datagram framing for sync packets
//!
//! Wire format:
//! - 1 byte: packet kind
//! - 1 byte: source device id length, then the id bytes (UTF-8)
//! - 1 byte: target device id length, then the id bytes (UTF-8)
//! - N bytes: body
//!
//! A datagram is delivered whole or not at all; there is no streaming and no
//! reassembly below the sync layer.

use bytes::{BufMut, BytesMut};
use hearth_core::types::{ChannelId, DeviceId, EventId, FileMeta};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum datagram payload the protocol will emit (conservative IPv4 UDP).
pub const MAX_DATAGRAM: usize = 1200;

/// Framing errors
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("datagram truncated at {0} bytes")]
    Truncated(usize),
    #[error("unknown packet kind: {0}")]
    UnknownKind(u8),
    #[error("device id is not valid UTF-8")]
    BadName,
    #[error("device id too long: {0} bytes (max 255)")]
    NameTooLong(usize),
    #[error("body serialization error: {0}")]
    Body(#[from] postcard::Error),
}

/// Packet kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketKind {
    /// Signed Bloom summary of the sender's recent event ids.
    Summary = 0,
    /// Request for specific event ids the sender knows it is missing.
    Solicit = 1,
    /// One full event (cipher plus clear metadata).
    Event = 2,
    /// Identical body to Event; distinct kind for statistics.
    FileChunk = 3,
}

impl TryFrom<u8> for PacketKind {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Summary),
            1 => Ok(Self::Solicit),
            2 => Ok(Self::Event),
            3 => Ok(Self::FileChunk),
            other => Err(PacketError::UnknownKind(other)),
        }
    }
}

/// A framed sync packet.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub source: DeviceId,
    pub target: DeviceId,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn new(kind: PacketKind, source: DeviceId, target: DeviceId, body: Vec<u8>) -> Self {
        Self {
            kind,
            source,
            target,
            body,
        }
    }

    /// Encode into datagram bytes.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let source = self.source.as_str().as_bytes();
        let target = self.target.as_str().as_bytes();
        if source.len() > u8::MAX as usize {
            return Err(PacketError::NameTooLong(source.len()));
        }
        if target.len() > u8::MAX as usize {
            return Err(PacketError::NameTooLong(target.len()));
        }

        let mut buf = BytesMut::with_capacity(3 + source.len() + target.len() + self.body.len());
        buf.put_u8(self.kind as u8);
        buf.put_u8(source.len() as u8);
        buf.put_slice(source);
        buf.put_u8(target.len() as u8);
        buf.put_slice(target);
        buf.put_slice(&self.body);
        Ok(buf.to_vec())
    }

    /// Decode a datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut at = 0usize;

        let kind = PacketKind::try_from(take(bytes, &mut at, 1)?[0])?;
        let source_len = take(bytes, &mut at, 1)?[0] as usize;
        let source = std::str::from_utf8(take(bytes, &mut at, source_len)?)
            .map_err(|_| PacketError::BadName)?
            .to_string();
        let target_len = take(bytes, &mut at, 1)?[0] as usize;
        let target = std::str::from_utf8(take(bytes, &mut at, target_len)?)
            .map_err(|_| PacketError::BadName)?
            .to_string();

        Ok(Self {
            kind,
            source: DeviceId(source),
            target: DeviceId(target),
            body: bytes[at..].to_vec(),
        })
    }
}

fn take<'a>(bytes: &'a [u8], at: &mut usize, n: usize) -> Result<&'a [u8], PacketError> {
    if *at + n > bytes.len() {
        return Err(PacketError::Truncated(bytes.len()));
    }
    let slice = &bytes[*at..*at + n];
    *at += n;
    Ok(slice)
}

/// Body of an EVENT or FILE_CHUNK packet: the opaque cipher plus the clear
/// metadata the receiver indexes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EventFrame {
    pub payload_cipher: Vec<u8>,
    pub channel: Option<ChannelId>,
    pub file: Option<FileMeta>,
}

impl EventFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, PacketError> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Body of a SOLICIT packet: the ids the sender wants.
pub fn encode_solicit(wanted: &[EventId]) -> Result<Vec<u8>, PacketError> {
    Ok(postcard::to_allocvec(&wanted.to_vec())?)
}

pub fn decode_solicit(bytes: &[u8]) -> Result<Vec<EventId>, PacketError> {
    Ok(postcard::from_bytes(bytes)?)
}
