//! Device facade: one store, one sync engine, one file layer, one identity
//!
//! The facade owns everything a single device needs and exposes the four
//! external contracts: author, query, subscribe and online control. It is
//! single-threaded by design; `step` and `handle_datagram` return the
//! datagrams to emit and the caller carries them to whatever network exists.

use crate::engine::{SyncConfig, SyncEngine, SyncStats};
use crate::files::{self, ChunkCipher, ErasureConfig, FileError};
use ed25519_dalek::VerifyingKey;
use hearth_core::codec::{self, NonceSource, OpenedEvent};
use hearth_core::keys::{CommunityKey, KeyPair};
use hearth_core::types::{
    DeviceId, EventId, EventMeta, FileId, FileManifest, Payload,
};
use hearth_net::packet::{EventFrame, Packet, PacketKind, MAX_DATAGRAM};
use hearth_store::{Insert, Storage, StorageError, StoredEvent};
use rand::RngCore;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::warn;

/// Failures visible to `author`.
#[derive(Debug, Error)]
pub enum AuthorError {
    #[error("device has no identity bound")]
    NotInitialized,
    #[error("store error: {0}")]
    Store(#[from] StorageError),
    #[error("event of {0} bytes exceeds the datagram budget")]
    ResourceExhaustion(usize),
}

/// Failures visible to `subscribe`.
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("too many subscribers (limit {0})")]
    TooManySubscribers(usize),
}

/// Failures visible to `upload`.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Author(#[from] AuthorError),
    #[error(transparent)]
    File(#[from] FileError),
}

/// A device's signing keys plus the community key.
#[derive(Clone)]
pub struct Identity {
    pub keys: KeyPair,
    pub community: CommunityKey,
}

/// Per-device configuration.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub id: DeviceId,
    pub sync: SyncConfig,
    pub erasure: ErasureConfig,
    pub max_subscribers: usize,
}

impl DeviceConfig {
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            sync: SyncConfig::default(),
            erasure: ErasureConfig::default(),
            max_subscribers: 64,
        }
    }
}

/// A decrypted, authenticated event as handed to queries and subscribers.
#[derive(Clone, Debug)]
pub struct DecodedEvent {
    pub arrival_seq: u64,
    pub event_id: EventId,
    pub author: DeviceId,
    pub authored_ts: i64,
    pub received_ts: i64,
    pub channel: Option<hearth_core::types::ChannelId>,
    pub payload: Payload,
}

/// Subscription handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Predicate = Box<dyn Fn(&DecodedEvent) -> bool + Send>;
type Callback = Box<dyn FnMut(&DecodedEvent) + Send>;

struct Subscription {
    id: SubscriptionId,
    predicate: Predicate,
    callback: Callback,
}

/// Read-only device counters.
#[derive(Clone, Debug, Default)]
pub struct DeviceStats {
    pub events_received: u64,
    pub duplicates: u64,
    pub decode_failures: u64,
    pub unknown_authors: u64,
    pub untrusted_dropped: u64,
    pub meta_mismatches: u64,
    pub invalid_packets: u64,
}

/// One device: store + sync engine + file layer + identity.
pub struct Device {
    config: DeviceConfig,
    identity: Option<Identity>,
    store: Storage,
    engine: SyncEngine,
    /// Public keys of every device we have seen or been configured with.
    known_peers: BTreeMap<DeviceId, VerifyingKey>,
    /// Devices admitted as event sources.
    trusted: BTreeSet<DeviceId>,
    /// File ids announced by trusted message attachments (or our uploads);
    /// chunks of these files are accepted regardless of chunk author.
    announced_files: BTreeSet<FileId>,
    subscribers: Vec<Subscription>,
    next_subscription: u64,
    online: bool,
    nonces: Box<dyn NonceSource + Send>,
    rng: Box<dyn RngCore + Send>,
    stats: DeviceStats,
}

impl Device {
    pub fn new(
        config: DeviceConfig,
        store: Storage,
        identity: Option<Identity>,
        nonces: Box<dyn NonceSource + Send>,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        let engine = SyncEngine::new(config.id.clone(), config.sync.clone());
        let mut device = Self {
            engine,
            config,
            identity,
            store,
            known_peers: BTreeMap::new(),
            trusted: BTreeSet::new(),
            announced_files: BTreeSet::new(),
            subscribers: Vec::new(),
            next_subscription: 0,
            online: true,
            nonces,
            rng,
            stats: DeviceStats::default(),
        };
        // A device resolves and trusts its own authorship.
        if let Some(identity) = &device.identity {
            device
                .known_peers
                .insert(device.config.id.clone(), identity.keys.verifying_key());
            device.trusted.insert(device.config.id.clone());
        }
        device
    }

    pub fn id(&self) -> &DeviceId {
        &self.config.id
    }

    pub fn store(&self) -> &Storage {
        &self.store
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    pub fn sync_stats(&self) -> &SyncStats {
        self.engine.stats()
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// The device's public key, when an identity is bound.
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        self.identity
            .as_ref()
            .map(|identity| identity.keys.verifying_key())
    }

    /// Flip the device's network state.
    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    /// Record a device's public key without admitting it as a source.
    pub fn add_known_peer(&mut self, peer: DeviceId, key: VerifyingKey) {
        self.known_peers.insert(peer, key);
    }

    /// Admit a device as a trusted event source and sync partner.
    pub fn trust_peer(&mut self, peer: DeviceId, key: VerifyingKey) {
        self.known_peers.insert(peer.clone(), key);
        self.trusted.insert(peer.clone());
        self.engine.add_peer(peer);
    }

    pub fn trusted_peers(&self) -> impl Iterator<Item = &DeviceId> {
        self.trusted.iter().filter(|id| **id != self.config.id)
    }

    /// Seal, insert and announce a payload authored by this device.
    pub fn author(&mut self, payload: Payload, now: i64) -> Result<EventId, AuthorError> {
        let identity = self.identity.as_ref().ok_or(AuthorError::NotInitialized)?;
        let sealed = codec::seal(
            payload.clone(),
            &self.config.id,
            &identity.keys,
            &identity.community,
            now,
            self.nonces.as_mut(),
        )
        .expect("own payloads always serialize");

        // The event must fit one datagram once framed, or no peer could
        // ever receive it.
        let frame = EventFrame {
            payload_cipher: sealed.payload_cipher.clone(),
            channel: sealed.meta.channel.clone(),
            file: sealed.meta.file,
        };
        let framed_len = frame.to_bytes().expect("event frame serializes").len()
            + 3
            + 2 * self.config.id.as_str().len();
        if framed_len > MAX_DATAGRAM {
            return Err(AuthorError::ResourceExhaustion(framed_len));
        }

        match self.store.insert(sealed.payload_cipher, sealed.meta, now, now)? {
            Insert::Inserted(row) => {
                let event_id = row.event_id;
                self.post_insert(
                    &row,
                    OpenedEvent {
                        payload,
                        author: self.config.id.clone(),
                        authored_ts: now,
                    },
                );
                Ok(event_id)
            }
            Insert::Duplicate(event_id) => Ok(event_id),
        }
    }

    /// Bookkeeping and subscriber dispatch for a fresh insert. Runs as one
    /// atomic sequence with the insert itself.
    fn post_insert(&mut self, row: &StoredEvent, opened: OpenedEvent) {
        match &opened.payload {
            Payload::Message { attachments, .. } => {
                for manifest in attachments {
                    self.announced_files.insert(manifest.file_id);
                }
            }
            Payload::Reaction { target, .. } => {
                // A reaction to an event we do not hold is a dangling
                // reference worth soliciting.
                if !self.store.contains(target).unwrap_or(false) {
                    self.engine.want(*target);
                }
            }
            _ => {}
        }
        self.engine.satisfy(&row.event_id);

        let decoded = DecodedEvent {
            arrival_seq: row.arrival_seq,
            event_id: row.event_id,
            author: opened.author,
            authored_ts: opened.authored_ts,
            received_ts: row.received_ts,
            channel: row.channel.clone(),
            payload: opened.payload,
        };
        for subscription in &mut self.subscribers {
            if (subscription.predicate)(&decoded) {
                (subscription.callback)(&decoded);
            }
        }
    }

    /// The scheduled sync step; returns the datagrams to emit.
    pub fn step(&mut self, now: i64) -> Vec<Packet> {
        if !self.online {
            return Vec::new();
        }
        let keys = self.identity.as_ref().map(|identity| &identity.keys);
        match self.engine.step(now, &self.store, keys) {
            Ok(packets) => packets,
            Err(error) => {
                warn!(%error, "sync step failed; retrying next tick");
                Vec::new()
            }
        }
    }

    /// Process one inbound datagram; returns any immediate replies.
    pub fn handle_datagram(&mut self, now: i64, bytes: &[u8]) -> Vec<Packet> {
        if !self.online {
            return Vec::new();
        }
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(_) => {
                self.stats.invalid_packets += 1;
                return Vec::new();
            }
        };
        if packet.target != self.config.id {
            self.stats.invalid_packets += 1;
            return Vec::new();
        }

        match packet.kind {
            PacketKind::Summary => {
                let pubkey = self.known_peers.get(&packet.source).map(|vk| vk.to_bytes());
                self.engine
                    .handle_summary(now, &packet.source, &packet.body, pubkey.as_ref());
                Vec::new()
            }
            PacketKind::Solicit => {
                match self
                    .engine
                    .handle_solicit(now, &packet.source, &packet.body, &self.store)
                {
                    Ok(replies) => replies,
                    Err(error) => {
                        warn!(%error, "solicit handling failed");
                        Vec::new()
                    }
                }
            }
            PacketKind::Event | PacketKind::FileChunk => {
                self.handle_event(now, &packet);
                Vec::new()
            }
        }
    }

    fn handle_event(&mut self, now: i64, packet: &Packet) {
        let Some(identity) = self.identity.as_ref() else {
            self.stats.invalid_packets += 1;
            return;
        };
        let frame = match EventFrame::from_bytes(&packet.body) {
            Ok(frame) => frame,
            Err(_) => {
                self.stats.invalid_packets += 1;
                return;
            }
        };

        let known_peers = &self.known_peers;
        let opened = match codec::open(
            &frame.payload_cipher,
            &identity.community,
            |author| known_peers.get(author).copied(),
            now,
        ) {
            Ok(opened) => opened,
            Err(hearth_core::CodecError::UnknownAuthor(_)) => {
                self.stats.unknown_authors += 1;
                return;
            }
            Err(_) => {
                self.stats.decode_failures += 1;
                return;
            }
        };

        // Accept from trusted authors, or chunks of announced files from
        // anyone who could seal them under the community key.
        let trusted_author = self.trusted.contains(&opened.author);
        let announced_chunk = matches!(
            &opened.payload,
            Payload::FileChunk { file_id, .. } if self.announced_files.contains(file_id)
        );
        if !trusted_author && !announced_chunk {
            self.stats.untrusted_dropped += 1;
            return;
        }

        // Clear metadata is unauthenticated; reject it unless it matches the
        // decrypted payload.
        let meta = EventMeta {
            channel: frame.channel.clone(),
            file: frame.file,
        };
        if !meta.matches(&opened.payload) {
            self.stats.meta_mismatches += 1;
            return;
        }

        match self
            .store
            .insert(frame.payload_cipher, meta, opened.authored_ts, now)
        {
            Ok(Insert::Inserted(row)) => {
                self.stats.events_received += 1;
                self.engine.note_received(&packet.source, &row.event_id);
                self.post_insert(&row, opened);
            }
            Ok(Insert::Duplicate(event_id)) => {
                self.stats.duplicates += 1;
                self.engine.note_received(&packet.source, &event_id);
            }
            Err(error) => {
                // the peer will re-push after the next summary exchange
                warn!(%error, "insert failed; awaiting redelivery");
            }
        }
    }

    fn decode_row(&self, row: &StoredEvent) -> Option<DecodedEvent> {
        let identity = self.identity.as_ref()?;
        let known_peers = &self.known_peers;
        // range was enforced at arrival; re-opening old rows must not expire
        let opened = codec::open(
            &row.payload_cipher,
            &identity.community,
            |author| known_peers.get(author).copied(),
            row.authored_ts,
        )
        .ok()?;
        Some(DecodedEvent {
            arrival_seq: row.arrival_seq,
            event_id: row.event_id,
            author: opened.author,
            authored_ts: opened.authored_ts,
            received_ts: row.received_ts,
            channel: row.channel.clone(),
            payload: opened.payload,
        })
    }

    /// Decrypt-and-filter scan over the whole store. Never fails; rows that
    /// cannot be decoded are skipped.
    pub fn query(&self, predicate: impl Fn(&DecodedEvent) -> bool) -> Vec<DecodedEvent> {
        let rows = match self.store.since(None, usize::MAX) {
            Ok(rows) => rows,
            Err(_) => return Vec::new(),
        };
        rows.iter()
            .filter_map(|row| self.decode_row(row))
            .filter(|decoded| predicate(decoded))
            .collect()
    }

    /// Register a callback fired exactly once per matching insert, in
    /// arrival order.
    pub fn subscribe(
        &mut self,
        predicate: impl Fn(&DecodedEvent) -> bool + Send + 'static,
        callback: impl FnMut(&DecodedEvent) + Send + 'static,
    ) -> Result<SubscriptionId, SubscribeError> {
        if self.subscribers.len() >= self.config.max_subscribers {
            return Err(SubscribeError::TooManySubscribers(
                self.config.max_subscribers,
            ));
        }
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push(Subscription {
            id,
            predicate: Box::new(predicate),
            callback: Box::new(callback),
        });
        Ok(id)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    /// Chunk, encrypt and author a file; returns the manifest to attach to
    /// a message.
    pub fn upload(&mut self, data: &[u8], mime: &str, now: i64) -> Result<FileManifest, UploadError> {
        if self.identity.is_none() {
            return Err(AuthorError::NotInitialized.into());
        }
        let erasure = self.config.erasure.clone();
        let (manifest, payloads) = files::chunk_file(
            data,
            mime,
            &erasure,
            self.rng.as_mut(),
            self.nonces.as_mut(),
        )?;
        self.announced_files.insert(manifest.file_id);
        for payload in payloads {
            self.author(payload, now)?;
        }
        Ok(manifest)
    }

    /// Reassemble a file from locally stored chunks.
    pub fn download(&self, manifest: &FileManifest) -> Option<Vec<u8>> {
        let rows = self.store.query_file_chunks(&manifest.file_id).ok()?;
        let chunks: Vec<ChunkCipher> = rows
            .iter()
            .filter_map(|row| self.decode_row(row))
            .filter_map(|decoded| ChunkCipher::from_payload(&decoded.payload, &manifest.file_id))
            .collect();
        files::assemble(manifest, &chunks)
    }

    /// The surviving reactions on an event: (emoji, reactor) pairs after
    /// folding removals in authored order.
    pub fn reactions_for(&self, target: &EventId) -> Vec<(String, DeviceId)> {
        let mut reactions = self.query(|event| {
            matches!(&event.payload, Payload::Reaction { target: t, .. } if t == target)
        });
        reactions.sort_by_key(|event| (event.authored_ts, event.arrival_seq));

        let mut surviving: BTreeSet<(String, DeviceId)> = BTreeSet::new();
        for event in reactions {
            if let Payload::Reaction { emoji, remove, .. } = event.payload {
                let key = (emoji, event.author);
                if remove {
                    surviving.remove(&key);
                } else {
                    surviving.insert(key);
                }
            }
        }
        surviving.into_iter().collect()
    }
}
