//! Hearth synchronization layer
//!
//! This crate provides:
//! - The per-peer anti-entropy state machine (Bloom summary exchange,
//!   missing-event push, solicitation, backoff)
//! - The file layer (chunking, per-chunk encryption, XOR parity, PRF tags)
//! - The device facade binding one identity to one store, one sync engine
//!   and one network endpoint

pub mod device;
pub mod engine;
pub mod files;

pub use device::{
    AuthorError, DecodedEvent, Device, DeviceConfig, DeviceStats, Identity, SubscribeError,
    SubscriptionId, UploadError,
};
pub use engine::{PeerState, SyncConfig, SyncEngine, SyncError, SyncStats};
pub use files::{assemble, chunk_file, prf_tag, ChunkCipher, ErasureConfig, FileError, CHUNK_SIZE};
