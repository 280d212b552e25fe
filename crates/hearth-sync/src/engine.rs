//! Anti-entropy sync engine
//!
//! One state machine per device, one `PeerState` per trusted peer. The
//! engine never touches the network directly: `step` and the packet handlers
//! return the datagrams to emit, and the caller (simulator or daemon)
//! carries them. All engine state lives in ordered maps so a seeded run is
//! reproducible.

use hearth_core::bloom::{BloomSummary, SignedSummary, DEFAULT_BITS, DEFAULT_HASHES};
use hearth_core::keys::KeyPair;
use hearth_core::types::{DeviceId, EventId};
use hearth_net::packet::{
    decode_solicit, encode_solicit, EventFrame, Packet, PacketKind, MAX_DATAGRAM,
};
use hearth_store::{Storage, StorageError, StoredEvent};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

/// Sync engine errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StorageError),
    #[error("packet error: {0}")]
    Packet(#[from] hearth_net::packet::PacketError),
    #[error("bloom error: {0}")]
    Bloom(#[from] hearth_core::bloom::BloomError),
}

/// Tunables for the periodic sync step.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// How often the scheduled step fires.
    pub sync_interval_ms: u64,
    /// Base period between summaries to one peer.
    pub summary_period_ms: u64,
    /// Maximum events pushed to one peer per step.
    pub batch_max: usize,
    /// Store rows scanned against one peer filter per step.
    pub scan_batch: usize,
    /// Tail window of arrival_seqs summarized into the Bloom filter.
    pub bloom_window: usize,
    /// Estimated FPR above which the summary window halves.
    pub max_fpr: f64,
    /// How long a pushed or solicited id suppresses a resend.
    pub inflight_timeout_ms: i64,
    /// Summaries older than this are ignored.
    pub summary_stale_ms: u64,
    /// Consecutive silent summary emissions before backoff kicks in.
    pub backoff_threshold: u32,
    /// Cap on the summary-period multiplier.
    pub backoff_cap: u64,
    /// Maximum ids in one SOLICIT packet.
    pub solicit_max: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 1_000,
            summary_period_ms: 1_000,
            batch_max: 8,
            scan_batch: 256,
            bloom_window: 4_096,
            max_fpr: 0.01,
            inflight_timeout_ms: 2_000,
            summary_stale_ms: 60_000,
            backoff_threshold: 3,
            backoff_cap: 60,
            solicit_max: 32,
        }
    }
}

/// Per-peer sync state.
#[derive(Debug)]
pub struct PeerState {
    pub last_sent_summary_ts: Option<i64>,
    pub last_recv_summary_ts: Option<i64>,
    pub last_known_summary: Option<BloomSummary>,
    /// Ids recently pushed to or solicited from this peer, with expiry.
    inflight: BTreeMap<EventId, i64>,
    /// Last arrival_seq evaluated against the peer's current filter.
    scan_seq: Option<u64>,
    consecutive_failures: u32,
    backoff_multiplier: u64,
    /// A summary went out and nothing has come back yet.
    awaiting_reply: bool,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            last_sent_summary_ts: None,
            last_recv_summary_ts: None,
            last_known_summary: None,
            inflight: BTreeMap::new(),
            scan_seq: None,
            consecutive_failures: 0,
            backoff_multiplier: 1,
            awaiting_reply: false,
        }
    }
}

impl PeerState {
    pub fn backoff_multiplier(&self) -> u64 {
        self.backoff_multiplier
    }
}

/// Read-only sync statistics.
#[derive(Clone, Debug, Default)]
pub struct SyncStats {
    pub summaries_sent: u64,
    pub summaries_received: u64,
    pub stale_summaries: u64,
    pub invalid_summaries: u64,
    pub invalid_solicits: u64,
    pub events_pushed: u64,
    pub solicits_sent: u64,
    pub solicits_answered: u64,
}

/// Per-device anti-entropy driver.
pub struct SyncEngine {
    local: DeviceId,
    config: SyncConfig,
    peers: BTreeMap<DeviceId, PeerState>,
    /// Ids this device knows it is missing (dangling references).
    wanted: BTreeSet<EventId>,
    stats: SyncStats,
}

impl SyncEngine {
    pub fn new(local: DeviceId, config: SyncConfig) -> Self {
        Self {
            local,
            config,
            peers: BTreeMap::new(),
            wanted: BTreeSet::new(),
            stats: SyncStats::default(),
        }
    }

    pub fn add_peer(&mut self, peer: DeviceId) {
        self.peers.entry(peer).or_default();
    }

    pub fn remove_peer(&mut self, peer: &DeviceId) {
        self.peers.remove(peer);
    }

    pub fn peer(&self, peer: &DeviceId) -> Option<&PeerState> {
        self.peers.get(peer)
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Register an id this device wants but does not hold.
    pub fn want(&mut self, id: EventId) {
        self.wanted.insert(id);
    }

    /// An id arrived (or was authored locally); stop asking for it.
    pub fn satisfy(&mut self, id: &EventId) {
        self.wanted.remove(id);
        for state in self.peers.values_mut() {
            state.inflight.remove(id);
        }
    }

    /// Any packet from a peer counts as liveness and resets its backoff.
    pub fn mark_inbound(&mut self, from: &DeviceId) {
        if let Some(state) = self.peers.get_mut(from) {
            state.awaiting_reply = false;
            state.consecutive_failures = 0;
            state.backoff_multiplier = 1;
        }
    }

    /// Build the local Bloom summary from the store tail, shrinking the
    /// window while the estimated false-positive rate is above the bound.
    fn build_summary(&self, now: i64, store: &Storage) -> Result<BloomSummary, SyncError> {
        let mut ids = store.recent_ids(self.config.bloom_window)?;
        loop {
            let mut candidate = BloomSummary::new(DEFAULT_BITS, DEFAULT_HASHES, now as u64)?;
            for id in &ids {
                candidate.add(id);
            }
            if candidate.estimated_fpr() <= self.config.max_fpr || ids.len() <= 16 {
                return Ok(candidate);
            }
            // recent_ids is newest-first, so halving keeps the freshest tail
            ids.truncate(ids.len() / 2);
        }
    }

    /// The scheduled sync step. Returns the datagrams to emit.
    pub fn step(
        &mut self,
        now: i64,
        store: &Storage,
        keys: Option<&KeyPair>,
    ) -> Result<Vec<Packet>, SyncError> {
        let mut out = Vec::new();
        let local = self.local.clone();
        let config = self.config.clone();

        // Expired inflight entries become eligible for resend.
        for state in self.peers.values_mut() {
            state.inflight.retain(|_, expires| *expires > now);
        }

        let summary = self.build_summary(now, store)?;
        let summary_bytes = match keys {
            Some(keys) => summary.sign(keys).to_bytes(),
            None => summary.to_bytes(),
        };

        let mut summaries_sent = 0u64;
        let mut events_pushed = 0u64;
        let mut solicits_sent = 0u64;

        for (peer_id, state) in self.peers.iter_mut() {
            // Summary emission, stretched by backoff.
            let period = config.summary_period_ms.saturating_mul(state.backoff_multiplier) as i64;
            let due = match state.last_sent_summary_ts {
                Some(last) => now - last >= period,
                None => true,
            };
            if due {
                if state.awaiting_reply {
                    state.consecutive_failures += 1;
                    if state.consecutive_failures >= config.backoff_threshold {
                        state.backoff_multiplier =
                            (state.backoff_multiplier * 2).min(config.backoff_cap);
                        debug!(
                            peer = %peer_id,
                            multiplier = state.backoff_multiplier,
                            "summary backoff"
                        );
                    }
                }
                out.push(Packet::new(
                    PacketKind::Summary,
                    local.clone(),
                    peer_id.clone(),
                    summary_bytes.clone(),
                ));
                state.last_sent_summary_ts = Some(now);
                state.awaiting_reply = true;
                summaries_sent += 1;
            }

            // Push events the peer's filter says it is missing.
            let Some(filter) = state.last_known_summary.clone() else {
                continue;
            };
            let rows = store.since(state.scan_seq, config.scan_batch)?;
            let mut pushed = 0usize;
            for row in rows {
                if pushed >= config.batch_max {
                    break;
                }
                state.scan_seq = Some(row.arrival_seq);
                if filter.maybe_contains(&row.event_id) {
                    continue;
                }
                if state.inflight.contains_key(&row.event_id) {
                    continue;
                }
                state
                    .inflight
                    .insert(row.event_id, now + config.inflight_timeout_ms);
                pushed += 1;
                events_pushed += 1;
                out.push(event_packet(&local, peer_id, &row)?);
            }

            // Solicit ids we know we are missing from peers that may hold them.
            let wanted: Vec<EventId> = self
                .wanted
                .iter()
                .filter(|id| filter.maybe_contains(id))
                .filter(|id| !state.inflight.contains_key(id))
                .take(config.solicit_max)
                .copied()
                .collect();
            if !wanted.is_empty() {
                for id in &wanted {
                    state.inflight.insert(*id, now + config.inflight_timeout_ms);
                }
                out.push(Packet::new(
                    PacketKind::Solicit,
                    local.clone(),
                    peer_id.clone(),
                    encode_solicit(&wanted)?,
                ));
                solicits_sent += 1;
            }
        }

        self.stats.summaries_sent += summaries_sent;
        self.stats.events_pushed += events_pushed;
        self.stats.solicits_sent += solicits_sent;

        Ok(out)
    }

    /// Handle a SUMMARY packet. Invalid or stale summaries are dropped with
    /// a metric; a fresh summary resets the scan cursor so the whole store
    /// is re-evaluated against the new filter.
    pub fn handle_summary(
        &mut self,
        now: i64,
        from: &DeviceId,
        body: &[u8],
        peer_pubkey: Option<&[u8; 32]>,
    ) {
        if !self.peers.contains_key(from) {
            self.stats.invalid_summaries += 1;
            return;
        }
        let (summary, signature) = match BloomSummary::from_bytes(body, DEFAULT_BITS, DEFAULT_HASHES)
        {
            Ok(parsed) => parsed,
            Err(_) => {
                self.stats.invalid_summaries += 1;
                return;
            }
        };

        // When the peer's key is known, an unsigned or forged summary is
        // dropped outright.
        if let Some(pubkey) = peer_pubkey {
            let verified = signature
                .map(|signature| SignedSummary { summary: summary.clone(), signature }.verify(pubkey))
                .unwrap_or(false);
            if !verified {
                self.stats.invalid_summaries += 1;
                return;
            }
        }

        if (summary.timestamp() + self.config.summary_stale_ms) < now as u64 {
            self.stats.stale_summaries += 1;
            return;
        }

        let state = self.peers.get_mut(from).expect("peer exists");
        state.last_known_summary = Some(summary);
        state.last_recv_summary_ts = Some(now);
        state.scan_seq = None;
        self.stats.summaries_received += 1;
        self.mark_inbound(from);
    }

    /// Handle a SOLICIT packet: answer with the requested events we hold.
    pub fn handle_solicit(
        &mut self,
        now: i64,
        from: &DeviceId,
        body: &[u8],
        store: &Storage,
    ) -> Result<Vec<Packet>, SyncError> {
        if !self.peers.contains_key(from) {
            return Ok(Vec::new());
        }
        self.mark_inbound(from);

        let wanted = match decode_solicit(body) {
            Ok(ids) => ids,
            Err(_) => {
                self.stats.invalid_solicits += 1;
                return Ok(Vec::new());
            }
        };

        let mut out = Vec::new();
        for id in wanted.into_iter().take(self.config.batch_max) {
            if let Some(row) = store.get(&id)? {
                let packet = event_packet(&self.local, from, &row)?;
                if packet.encode()?.len() <= MAX_DATAGRAM {
                    let state = self.peers.get_mut(from).expect("peer exists");
                    state
                        .inflight
                        .insert(id, now + self.config.inflight_timeout_ms);
                    out.push(packet);
                }
            }
        }
        if !out.is_empty() {
            self.stats.solicits_answered += 1;
        }
        Ok(out)
    }

    /// An event arrived from `from`; clear its inflight entry everywhere.
    pub fn note_received(&mut self, from: &DeviceId, id: &EventId) {
        self.mark_inbound(from);
        self.satisfy(id);
    }
}

/// Build an EVENT or FILE_CHUNK packet carrying one stored row.
fn event_packet(local: &DeviceId, target: &DeviceId, row: &StoredEvent) -> Result<Packet, SyncError> {
    let kind = if row.file.is_some() {
        PacketKind::FileChunk
    } else {
        PacketKind::Event
    };
    let frame = EventFrame {
        payload_cipher: row.payload_cipher.clone(),
        channel: row.channel.clone(),
        file: row.file,
    };
    Ok(Packet::new(
        kind,
        local.clone(),
        target.clone(),
        frame.to_bytes()?,
    ))
}
