//! Lossy datagram network model
//!
//! Packets queue with a sampled latency and dispatch against the simulated
//! clock. Loss, jitter, per-device online state and the MTU all apply at
//! `send`; a datagram is delivered whole at its due time or not at all.
//! Delivery order is (deliver_at, insertion), never sender order.

use hearth_core::types::DeviceId;
use hearth_net::packet::{Packet, PacketError, PacketKind};
use rand::Rng;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use thiserror::Error;

/// Network model errors
#[derive(Debug, Error)]
pub enum NetError {
    #[error("datagram of {size} bytes exceeds mtu {mtu}")]
    MtuExceeded { size: usize, mtu: usize },
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),
    #[error("frame error: {0}")]
    Frame(#[from] PacketError),
}

/// Link behavior knobs.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Probability each packet is dropped at queueing time.
    pub packet_loss_rate: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    /// Zero-mean extra noise added to the sampled latency.
    pub jitter_ms: u64,
    /// Datagrams larger than this are rejected at send time.
    pub mtu_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            packet_loss_rate: 0.0,
            min_latency_ms: 10,
            max_latency_ms: 100,
            jitter_ms: 0,
            mtu_bytes: hearth_net::packet::MAX_DATAGRAM,
        }
    }
}

/// Per-link counters.
#[derive(Clone, Debug, Default)]
pub struct LinkStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
}

/// Aggregate network counters, read-only to callers.
#[derive(Clone, Debug, Default)]
pub struct NetStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub per_link: BTreeMap<(DeviceId, DeviceId), LinkStats>,
}

struct QueuedPacket {
    deliver_at: i64,
    seq: u64,
    target: DeviceId,
    source: DeviceId,
    bytes: Vec<u8>,
}

impl PartialEq for QueuedPacket {
    fn eq(&self, other: &Self) -> bool {
        self.deliver_at == other.deliver_at && self.seq == other.seq
    }
}

impl Eq for QueuedPacket {}

impl PartialOrd for QueuedPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deliver_at, self.seq).cmp(&(other.deliver_at, other.seq))
    }
}

/// A delivered datagram, handed to the target's executor.
#[derive(Debug)]
pub struct Delivery {
    pub target: DeviceId,
    pub source: DeviceId,
    pub bytes: Vec<u8>,
}

/// The in-memory datagram network shared by every simulated device.
pub struct NetworkModel {
    config: NetworkConfig,
    online: BTreeMap<DeviceId, bool>,
    queue: BinaryHeap<Reverse<QueuedPacket>>,
    next_seq: u64,
    stats: NetStats,
}

impl NetworkModel {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            online: BTreeMap::new(),
            queue: BinaryHeap::new(),
            next_seq: 0,
            stats: NetStats::default(),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Make a device known to the network (initially online).
    pub fn register(&mut self, device: DeviceId) {
        self.online.entry(device).or_insert(true);
    }

    pub fn set_online(&mut self, device: &DeviceId, online: bool) {
        if let Some(state) = self.online.get_mut(device) {
            *state = online;
        }
    }

    pub fn is_online(&self, device: &DeviceId) -> bool {
        self.online.get(device).copied().unwrap_or(false)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.online.keys()
    }

    pub fn stats(&self) -> &NetStats {
        &self.stats
    }

    fn drop_packet(&mut self, source: &DeviceId, target: &DeviceId) {
        self.stats.dropped += 1;
        let link = self
            .stats
            .per_link
            .entry((source.clone(), target.clone()))
            .or_default();
        link.dropped += 1;
    }

    /// Queue a datagram for delivery. An oversized datagram is an error;
    /// loss and offline endpoints are silent, counted drops.
    pub fn send<R: Rng>(&mut self, now: i64, packet: Packet, rng: &mut R) -> Result<(), NetError> {
        if !self.online.contains_key(&packet.target) {
            return Err(NetError::UnknownDevice(packet.target));
        }
        let bytes = packet.encode()?;
        if bytes.len() > self.config.mtu_bytes {
            return Err(NetError::MtuExceeded {
                size: bytes.len(),
                mtu: self.config.mtu_bytes,
            });
        }

        self.stats.sent += 1;
        self.stats
            .per_link
            .entry((packet.source.clone(), packet.target.clone()))
            .or_default()
            .sent += 1;

        if !self.is_online(&packet.source) || !self.is_online(&packet.target) {
            self.drop_packet(&packet.source, &packet.target);
            return Ok(());
        }
        if self.config.packet_loss_rate > 0.0 && rng.gen::<f64>() < self.config.packet_loss_rate {
            self.drop_packet(&packet.source, &packet.target);
            return Ok(());
        }

        let base = if self.config.max_latency_ms > self.config.min_latency_ms {
            rng.gen_range(self.config.min_latency_ms..=self.config.max_latency_ms)
        } else {
            self.config.min_latency_ms
        } as i64;
        let jitter = if self.config.jitter_ms > 0 {
            let j = self.config.jitter_ms as i64;
            rng.gen_range(-j..=j)
        } else {
            0
        };
        let latency = (base + jitter).max(0);

        self.queue.push(Reverse(QueuedPacket {
            deliver_at: now + latency,
            seq: self.next_seq,
            target: packet.target,
            source: packet.source,
            bytes,
        }));
        self.next_seq += 1;
        Ok(())
    }

    /// Send one body to every registered device except the source.
    pub fn broadcast<R: Rng>(
        &mut self,
        now: i64,
        kind: PacketKind,
        source: &DeviceId,
        body: &[u8],
        rng: &mut R,
    ) -> Result<(), NetError> {
        let targets: Vec<DeviceId> = self
            .online
            .keys()
            .filter(|id| *id != source)
            .cloned()
            .collect();
        for target in targets {
            self.send(
                now,
                Packet::new(kind, source.clone(), target, body.to_vec()),
                rng,
            )?;
        }
        Ok(())
    }

    /// Pop every datagram due by `now`, in (deliver_at, insertion) order.
    /// Packets whose target is offline at delivery time are lost.
    pub fn tick(&mut self, now: i64) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Some(Reverse(head)) = self.queue.peek() {
            if head.deliver_at > now {
                break;
            }
            let Reverse(packet) = self.queue.pop().expect("peeked entry exists");
            if !self.is_online(&packet.target) {
                self.drop_packet(&packet.source, &packet.target);
                continue;
            }
            self.stats.delivered += 1;
            self.stats
                .per_link
                .entry((packet.source.clone(), packet.target.clone()))
                .or_default()
                .delivered += 1;
            out.push(Delivery {
                target: packet.target,
                source: packet.source,
                bytes: packet.bytes,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    fn packet(source: &str, target: &str, body: Vec<u8>) -> Packet {
        Packet::new(
            PacketKind::Event,
            DeviceId::new(source),
            DeviceId::new(target),
            body,
        )
    }

    fn network(config: NetworkConfig) -> NetworkModel {
        let mut net = NetworkModel::new(config);
        net.register(DeviceId::new("a"));
        net.register(DeviceId::new("b"));
        net.register(DeviceId::new("c"));
        net
    }

    #[test]
    fn delivers_within_latency_bounds() {
        let mut net = network(NetworkConfig {
            min_latency_ms: 10,
            max_latency_ms: 50,
            ..NetworkConfig::default()
        });
        let mut rng = ChaCha12Rng::seed_from_u64(1);

        net.send(0, packet("a", "b", vec![1]), &mut rng).unwrap();
        assert!(net.tick(9).is_empty());
        let delivered = net.tick(50);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].target, DeviceId::new("b"));
        assert_eq!(net.stats().delivered, 1);
    }

    #[test]
    fn full_loss_drops_everything() {
        let mut net = network(NetworkConfig {
            packet_loss_rate: 1.0,
            ..NetworkConfig::default()
        });
        let mut rng = ChaCha12Rng::seed_from_u64(2);

        for i in 0..10u8 {
            net.send(0, packet("a", "b", vec![i]), &mut rng).unwrap();
        }
        assert!(net.tick(10_000).is_empty());
        assert_eq!(net.stats().dropped, 10);
        assert_eq!(net.stats().sent, 10);
    }

    #[test]
    fn mtu_violation_is_an_error() {
        let mut net = network(NetworkConfig {
            mtu_bytes: 64,
            ..NetworkConfig::default()
        });
        let mut rng = ChaCha12Rng::seed_from_u64(3);

        let result = net.send(0, packet("a", "b", vec![0; 128]), &mut rng);
        assert!(matches!(result, Err(NetError::MtuExceeded { .. })));
        assert_eq!(net.stats().sent, 0);
    }

    #[test]
    fn offline_target_drops_at_send_and_delivery() {
        let mut net = network(NetworkConfig::default());
        let mut rng = ChaCha12Rng::seed_from_u64(4);
        let b = DeviceId::new("b");

        // offline at send time
        net.set_online(&b, false);
        net.send(0, packet("a", "b", vec![1]), &mut rng).unwrap();
        assert_eq!(net.stats().dropped, 1);

        // offline at delivery time
        net.set_online(&b, true);
        net.send(100, packet("a", "b", vec![2]), &mut rng).unwrap();
        net.set_online(&b, false);
        assert!(net.tick(1_000).is_empty());
        assert_eq!(net.stats().dropped, 2);
    }

    #[test]
    fn delivery_order_is_by_due_time_then_insertion() {
        let mut net = network(NetworkConfig {
            min_latency_ms: 30,
            max_latency_ms: 30,
            ..NetworkConfig::default()
        });
        let mut rng = ChaCha12Rng::seed_from_u64(5);

        net.send(0, packet("a", "b", vec![1]), &mut rng).unwrap();
        net.send(0, packet("c", "b", vec![2]), &mut rng).unwrap();
        net.send(10, packet("a", "b", vec![3]), &mut rng).unwrap();

        let delivered = net.tick(100);
        let bodies: Vec<u8> = delivered
            .iter()
            .map(|d| Packet::decode(&d.bytes).unwrap().body[0])
            .collect();
        assert_eq!(bodies, vec![1, 2, 3]);
    }

    #[test]
    fn broadcast_reaches_everyone_but_source() {
        let mut net = network(NetworkConfig {
            min_latency_ms: 5,
            max_latency_ms: 5,
            ..NetworkConfig::default()
        });
        let mut rng = ChaCha12Rng::seed_from_u64(6);

        net.broadcast(0, PacketKind::Summary, &DeviceId::new("a"), &[7], &mut rng)
            .unwrap();
        let delivered = net.tick(10);
        let mut targets: Vec<String> = delivered.iter().map(|d| d.target.0.clone()).collect();
        targets.sort();
        assert_eq!(targets, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn unknown_target_is_an_error() {
        let mut net = network(NetworkConfig::default());
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        assert!(matches!(
            net.send(0, packet("a", "nobody", vec![]), &mut rng),
            Err(NetError::UnknownDevice(_))
        ));
    }

    #[test]
    fn per_link_stats_accumulate() {
        let mut net = network(NetworkConfig {
            min_latency_ms: 1,
            max_latency_ms: 1,
            ..NetworkConfig::default()
        });
        let mut rng = ChaCha12Rng::seed_from_u64(8);

        net.send(0, packet("a", "b", vec![1]), &mut rng).unwrap();
        net.send(0, packet("a", "b", vec![2]), &mut rng).unwrap();
        net.send(0, packet("b", "a", vec![3]), &mut rng).unwrap();
        net.tick(10);

        let ab = &net.stats().per_link[&(DeviceId::new("a"), DeviceId::new("b"))];
        assert_eq!(ab.sent, 2);
        assert_eq!(ab.delivered, 2);
        let ba = &net.stats().per_link[&(DeviceId::new("b"), DeviceId::new("a"))];
        assert_eq!(ba.sent, 1);
    }
}
