//! Persistent event storage using sled
//!
//! One append-only log per device. The primary tree maps `arrival_seq` to a
//! serialized row; secondary trees index event id, channel, file chunk tuple
//! and PRF tag. Every index can be rebuilt from the primary tree alone, so a
//! device restarts from its `payload_cipher` blobs plus its keypair.

use hearth_core::codec;
use hearth_core::types::{ChannelId, EventId, EventMeta, FileId, PrfTag};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("corrupt index entry for {0}")]
    CorruptIndex(String),
}

/// One stored event row.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoredEvent {
    /// Local monotonic insert sequence, never reused.
    pub arrival_seq: u64,
    /// Content address: SHA-256 of `payload_cipher`.
    pub event_id: EventId,
    pub channel: Option<ChannelId>,
    pub authored_ts: i64,
    /// Local clock at first insert; never leaves this device.
    pub received_ts: i64,
    pub payload_cipher: Vec<u8>,
    pub file: Option<hearth_core::types::FileMeta>,
}

/// Outcome of an insert: duplicates are detected by event id and are no-ops.
#[derive(Clone, Debug, PartialEq)]
pub enum Insert {
    Inserted(StoredEvent),
    Duplicate(EventId),
}

/// Storage backend for one device.
pub struct Storage {
    db: Db,
    /// Primary tree: arrival_seq (u64 BE) -> StoredEvent
    events: sled::Tree,
    /// event_id -> arrival_seq (u64 BE)
    event_ids: sled::Tree,
    /// channel bytes || 0x00 || arrival_seq BE -> ()
    channels: sled::Tree,
    /// file_id || chunk_no BE || is_parity -> arrival_seq BE
    file_chunks: sled::Tree,
    /// prf_tag || arrival_seq BE -> ()
    prf_tags: sled::Tree,
    /// Serializes inserts; holds the next arrival_seq.
    next_seq: Mutex<u64>,
}

impl Storage {
    /// Open (or create) storage at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// Open an in-memory store, used by the simulator and tests.
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let events = db.open_tree("events")?;
        let event_ids = db.open_tree("event_ids")?;
        let channels = db.open_tree("channels")?;
        let file_chunks = db.open_tree("file_chunks")?;
        let prf_tags = db.open_tree("prf_tags")?;

        // Resume the sequence counter from the last stored row.
        let next = match events.last()? {
            Some((key, _)) => u64::from_be_bytes(
                key.as_ref()
                    .try_into()
                    .map_err(|_| StorageError::CorruptIndex("events".into()))?,
            ) + 1,
            None => 0,
        };

        let storage = Self {
            db,
            events,
            event_ids,
            channels,
            file_chunks,
            prf_tags,
            next_seq: Mutex::new(next),
        };

        // A store opened from bare rows (restored blobs) re-derives indexes.
        if storage.event_ids.is_empty() && !storage.events.is_empty() {
            storage.reindex()?;
        }

        Ok(storage)
    }

    fn chunk_key(file_id: &FileId, chunk_no: u32, is_parity: bool) -> [u8; 37] {
        let mut key = [0u8; 37];
        key[..32].copy_from_slice(&file_id.0);
        key[32..36].copy_from_slice(&chunk_no.to_be_bytes());
        key[36] = is_parity as u8;
        key
    }

    fn channel_key(channel: &ChannelId, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(channel.0.len() + 9);
        key.extend_from_slice(channel.0.as_bytes());
        key.push(0);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn index_row(&self, row: &StoredEvent) -> Result<(), StorageError> {
        let seq_be = row.arrival_seq.to_be_bytes();
        self.event_ids.insert(row.event_id.0, &seq_be)?;
        if let Some(channel) = &row.channel {
            self.channels
                .insert(Self::channel_key(channel, row.arrival_seq), &seq_be)?;
        }
        if let Some(file) = &row.file {
            let key = Self::chunk_key(&file.file_id, file.chunk_no, file.is_parity);
            match self.file_chunks.get(key)? {
                Some(existing) if existing.as_ref() != seq_be => {
                    // Two distinct events claiming one chunk slot violates the
                    // per-device uniqueness of (file_id, chunk_no, is_parity).
                    debug_assert!(false, "duplicate chunk tuple {:?}", file);
                    warn!(?file, "duplicate chunk tuple; keeping first index entry");
                }
                _ => {
                    self.file_chunks.insert(key, &seq_be)?;
                }
            }
            let mut tag_key = [0u8; 24];
            tag_key[..16].copy_from_slice(&file.prf_tag.0);
            tag_key[16..].copy_from_slice(&seq_be);
            self.prf_tags.insert(tag_key, &seq_be)?;
        }
        Ok(())
    }

    /// Append an event. Duplicate ids are detected and become no-ops.
    ///
    /// Inserts are serialized per device; `arrival_seq` is assigned under the
    /// lock and strictly increases.
    pub fn insert(
        &self,
        payload_cipher: Vec<u8>,
        meta: EventMeta,
        authored_ts: i64,
        now: i64,
    ) -> Result<Insert, StorageError> {
        let event_id = codec::event_id(&payload_cipher);

        let mut next = self.next_seq.lock();
        if self.event_ids.contains_key(event_id.0)? {
            return Ok(Insert::Duplicate(event_id));
        }

        let row = StoredEvent {
            arrival_seq: *next,
            event_id,
            channel: meta.channel,
            authored_ts,
            received_ts: now,
            payload_cipher,
            file: meta.file,
        };

        self.events
            .insert(row.arrival_seq.to_be_bytes(), postcard::to_allocvec(&row)?)?;
        self.index_row(&row)?;
        *next += 1;

        Ok(Insert::Inserted(row))
    }

    /// Look up an event by content address.
    pub fn get(&self, event_id: &EventId) -> Result<Option<StoredEvent>, StorageError> {
        match self.event_ids.get(event_id.0)? {
            Some(seq) => self.get_seq(u64::from_be_bytes(
                seq.as_ref()
                    .try_into()
                    .map_err(|_| StorageError::CorruptIndex("event_ids".into()))?,
            )),
            None => Ok(None),
        }
    }

    /// Look up an event by arrival sequence.
    pub fn get_seq(&self, arrival_seq: u64) -> Result<Option<StoredEvent>, StorageError> {
        match self.events.get(arrival_seq.to_be_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Whether an event id is already stored.
    pub fn contains(&self, event_id: &EventId) -> Result<bool, StorageError> {
        Ok(self.event_ids.contains_key(event_id.0)?)
    }

    /// Rows with `arrival_seq > seq_exclusive`, at most `limit`, in order.
    pub fn since(&self, seq_exclusive: Option<u64>, limit: usize) -> Result<Vec<StoredEvent>, StorageError> {
        let start = match seq_exclusive {
            Some(seq) => seq + 1,
            None => 0,
        };
        self.events
            .range(start.to_be_bytes()..)
            .take(limit)
            .map(|entry| {
                let (_, bytes) = entry?;
                Ok(postcard::from_bytes(&bytes)?)
            })
            .collect()
    }

    /// All events on a channel, in arrival order.
    pub fn query_channel(&self, channel: &ChannelId) -> Result<Vec<StoredEvent>, StorageError> {
        let mut prefix = Vec::with_capacity(channel.0.len() + 1);
        prefix.extend_from_slice(channel.0.as_bytes());
        prefix.push(0);

        self.channels
            .scan_prefix(&prefix)
            .map(|entry| {
                let (key, _) = entry?;
                let seq = u64::from_be_bytes(
                    key[prefix.len()..]
                        .try_into()
                        .map_err(|_| StorageError::CorruptIndex("channels".into()))?,
                );
                self.get_seq(seq)?
                    .ok_or_else(|| StorageError::CorruptIndex("channels".into()))
            })
            .collect()
    }

    /// All chunks of a file (data and parity), ordered by chunk number.
    pub fn query_file_chunks(&self, file_id: &FileId) -> Result<Vec<StoredEvent>, StorageError> {
        self.file_chunks
            .scan_prefix(file_id.0)
            .map(|entry| {
                let (_, seq) = entry?;
                let seq = u64::from_be_bytes(
                    seq.as_ref()
                        .try_into()
                        .map_err(|_| StorageError::CorruptIndex("file_chunks".into()))?,
                );
                self.get_seq(seq)?
                    .ok_or_else(|| StorageError::CorruptIndex("file_chunks".into()))
            })
            .collect()
    }

    /// Chunk events carrying a given PRF tag.
    pub fn query_by_prf_tag(&self, tag: &PrfTag) -> Result<Vec<StoredEvent>, StorageError> {
        self.prf_tags
            .scan_prefix(tag.0)
            .map(|entry| {
                let (key, _) = entry?;
                let seq = u64::from_be_bytes(
                    key[16..]
                        .try_into()
                        .map_err(|_| StorageError::CorruptIndex("prf_tags".into()))?,
                );
                self.get_seq(seq)?
                    .ok_or_else(|| StorageError::CorruptIndex("prf_tags".into()))
            })
            .collect()
    }

    /// Total number of stored events.
    pub fn count(&self) -> u64 {
        self.events.len() as u64
    }

    /// Ids of the most recent `window` inserts, used to build Bloom summaries.
    pub fn recent_ids(&self, window: usize) -> Result<Vec<EventId>, StorageError> {
        let mut ids = Vec::with_capacity(window.min(self.events.len()));
        for entry in self.events.iter().rev().take(window) {
            let (_, bytes) = entry?;
            let row: StoredEvent = postcard::from_bytes(&bytes)?;
            ids.push(row.event_id);
        }
        Ok(ids)
    }

    /// Rebuild every secondary index from the primary tree.
    pub fn reindex(&self) -> Result<(), StorageError> {
        self.event_ids.clear()?;
        self.channels.clear()?;
        self.file_chunks.clear()?;
        self.prf_tags.clear()?;
        for entry in self.events.iter() {
            let (_, bytes) = entry?;
            let row: StoredEvent = postcard::from_bytes(&bytes)?;
            self.index_row(&row)?;
        }
        Ok(())
    }

    /// Flush all pending writes.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::types::FileMeta;
    use tempfile::tempdir;

    fn meta_on(channel: &str) -> EventMeta {
        EventMeta {
            channel: Some(ChannelId::new(channel)),
            file: None,
        }
    }

    fn chunk_meta(file_id: FileId, chunk_no: u32, is_parity: bool, tag: u8) -> EventMeta {
        EventMeta {
            channel: None,
            file: Some(FileMeta {
                file_id,
                chunk_no,
                is_parity,
                prf_tag: PrfTag([tag; 16]),
            }),
        }
    }

    #[test]
    fn insert_assigns_monotonic_seqs() {
        let storage = Storage::temporary().unwrap();

        for i in 0..5u8 {
            let insert = storage
                .insert(vec![i; 40], meta_on("general"), 10, 100 + i as i64)
                .unwrap();
            match insert {
                Insert::Inserted(row) => {
                    assert_eq!(row.arrival_seq, i as u64);
                    assert_eq!(row.event_id, codec::event_id(&[i; 40]));
                }
                Insert::Duplicate(_) => panic!("fresh cipher reported duplicate"),
            }
        }
        assert_eq!(storage.count(), 5);

        // received_ts never decreases along arrival_seq
        let rows = storage.since(None, 100).unwrap();
        for pair in rows.windows(2) {
            assert!(pair[0].received_ts <= pair[1].received_ts);
        }
    }

    #[test]
    fn duplicate_is_noop() {
        let storage = Storage::temporary().unwrap();
        let cipher = vec![7u8; 64];

        let first = storage
            .insert(cipher.clone(), meta_on("general"), 0, 0)
            .unwrap();
        assert!(matches!(first, Insert::Inserted(_)));

        let second = storage.insert(cipher, meta_on("general"), 0, 5).unwrap();
        assert_eq!(second, Insert::Duplicate(codec::event_id(&[7u8; 64])));
        assert_eq!(storage.count(), 1);
    }

    #[test]
    fn get_by_id_and_seq() {
        let storage = Storage::temporary().unwrap();
        let cipher = vec![1u8; 48];
        let Insert::Inserted(row) = storage.insert(cipher, meta_on("dev"), 3, 4).unwrap() else {
            panic!("expected insert");
        };

        assert_eq!(storage.get(&row.event_id).unwrap().unwrap(), row);
        assert_eq!(storage.get_seq(row.arrival_seq).unwrap().unwrap(), row);
        assert!(storage.contains(&row.event_id).unwrap());
        assert!(storage.get(&EventId([0xee; 32])).unwrap().is_none());
    }

    #[test]
    fn since_paginates_in_order() {
        let storage = Storage::temporary().unwrap();
        for i in 0..10u8 {
            storage.insert(vec![i; 40], meta_on("c"), 0, 0).unwrap();
        }

        let first = storage.since(None, 4).unwrap();
        assert_eq!(
            first.iter().map(|r| r.arrival_seq).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        let rest = storage.since(Some(3), 100).unwrap();
        assert_eq!(rest.len(), 6);
        assert_eq!(rest[0].arrival_seq, 4);
    }

    #[test]
    fn file_chunk_index_orders_by_chunk_no() {
        let storage = Storage::temporary().unwrap();
        let file_id = FileId([9; 32]);

        // insert out of order, with a parity chunk at the end
        for (i, chunk_no) in [2u32, 0, 1].iter().enumerate() {
            storage
                .insert(
                    vec![i as u8; 40],
                    chunk_meta(file_id, *chunk_no, false, *chunk_no as u8),
                    0,
                    0,
                )
                .unwrap();
        }
        storage
            .insert(vec![0xaa; 40], chunk_meta(file_id, 3, true, 3), 0, 0)
            .unwrap();
        // a chunk of another file must not leak into the query
        storage
            .insert(vec![0xbb; 40], chunk_meta(FileId([8; 32]), 0, false, 9), 0, 0)
            .unwrap();

        let chunks = storage.query_file_chunks(&file_id).unwrap();
        let numbers: Vec<(u32, bool)> = chunks
            .iter()
            .map(|r| {
                let f = r.file.as_ref().unwrap();
                (f.chunk_no, f.is_parity)
            })
            .collect();
        assert_eq!(numbers, vec![(0, false), (1, false), (2, false), (3, true)]);
    }

    #[test]
    fn prf_tag_lookup() {
        let storage = Storage::temporary().unwrap();
        let file_id = FileId([9; 32]);
        storage
            .insert(vec![1; 40], chunk_meta(file_id, 0, false, 0xaa), 0, 0)
            .unwrap();
        storage
            .insert(vec![2; 40], chunk_meta(file_id, 1, false, 0xbb), 0, 0)
            .unwrap();

        let hits = storage.query_by_prf_tag(&PrfTag([0xaa; 16])).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file.as_ref().unwrap().chunk_no, 0);
        assert!(storage
            .query_by_prf_tag(&PrfTag([0xcc; 16]))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn channel_query_does_not_cross_prefixes() {
        let storage = Storage::temporary().unwrap();
        storage.insert(vec![1; 40], meta_on("gen"), 0, 0).unwrap();
        storage
            .insert(vec![2; 40], meta_on("general"), 0, 0)
            .unwrap();

        assert_eq!(storage.query_channel(&ChannelId::new("gen")).unwrap().len(), 1);
        assert_eq!(
            storage
                .query_channel(&ChannelId::new("general"))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn recent_ids_returns_tail() {
        let storage = Storage::temporary().unwrap();
        for i in 0..8u8 {
            storage.insert(vec![i; 40], meta_on("c"), 0, 0).unwrap();
        }
        let ids = storage.recent_ids(3).unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&codec::event_id(&[7u8; 40])));
        assert!(ids.contains(&codec::event_id(&[5u8; 40])));
        assert!(!ids.contains(&codec::event_id(&[0u8; 40])));
    }

    #[test]
    fn reopen_resumes_sequence_and_indexes() {
        let dir = tempdir().unwrap();
        {
            let storage = Storage::open(dir.path()).unwrap();
            for i in 0..3u8 {
                storage.insert(vec![i; 40], meta_on("c"), 0, 0).unwrap();
            }
            storage.flush().unwrap();
        }

        let storage = Storage::open(dir.path()).unwrap();
        assert_eq!(storage.count(), 3);
        let Insert::Inserted(row) = storage.insert(vec![9; 40], meta_on("c"), 0, 0).unwrap() else {
            panic!("expected insert");
        };
        assert_eq!(row.arrival_seq, 3);
        assert!(storage.contains(&codec::event_id(&[1u8; 40])).unwrap());
    }

    #[test]
    fn reindex_rebuilds_all_secondary_trees() {
        let storage = Storage::temporary().unwrap();
        let file_id = FileId([4; 32]);
        storage.insert(vec![1; 40], meta_on("c"), 0, 0).unwrap();
        storage
            .insert(vec![2; 40], chunk_meta(file_id, 0, false, 0xdd), 0, 0)
            .unwrap();

        storage.reindex().unwrap();

        assert!(storage.contains(&codec::event_id(&[1u8; 40])).unwrap());
        assert_eq!(storage.query_file_chunks(&file_id).unwrap().len(), 1);
        assert_eq!(storage.query_by_prf_tag(&PrfTag([0xdd; 16])).unwrap().len(), 1);
        assert_eq!(storage.query_channel(&ChannelId::new("c")).unwrap().len(), 1);
    }
}
