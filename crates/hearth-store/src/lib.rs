//! Hearth Event Store
//!
//! A per-device, append-only, content-addressed event log backed by sled.
//! Inserts are serialized and assign a strictly increasing `arrival_seq`;
//! duplicate event ids are no-ops. Secondary indexes (event id, channel,
//! file chunk tuple, PRF tag) are derivable from the primary rows, so a
//! device can restart from its stored blobs alone.

pub mod storage;

pub use storage::{Insert, Storage, StorageError, StoredEvent};
