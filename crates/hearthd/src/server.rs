//! hearthd server - UDP service loop
//!
//! One device, one socket, one task. The select loop interleaves inbound
//! datagrams, the periodic sync step and shutdown, which keeps the device's
//! single-threaded discipline without any locking.

use crate::config::{Config, NodeState};
use anyhow::Context;
use ed25519_dalek::VerifyingKey;
use hearth_core::codec::OsNonce;
use hearth_core::keys::{CommunityKey, KeyPair};
use hearth_core::types::DeviceId;
use hearth_net::packet::Packet;
use hearth_store::Storage;
use hearth_sync::{Device, DeviceConfig, Identity};
use rand::rngs::OsRng;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

pub struct Server {
    config: Config,
    device: Device,
    peer_addrs: BTreeMap<DeviceId, SocketAddr>,
}

impl Server {
    /// Build the device from persisted state and configuration.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating {}", config.data_dir.display()))?;

        let state = NodeState::load_or_create(&config.data_dir)?;
        let keys = KeyPair::from_seed(&state.keypair_seed);
        info!(
            device = %config.device_id,
            pubkey = %hex::encode(keys.public_key()),
            "identity loaded"
        );

        let community = CommunityKey::from_passphrase(&config.community);
        let storage = Storage::open(config.data_dir.join("store"))?;

        let mut device_config = DeviceConfig::new(DeviceId::new(config.device_id.clone()));
        device_config.sync.sync_interval_ms = config.sync_interval_ms;
        device_config.sync.summary_period_ms = config.summary_period_ms;
        device_config.erasure.enabled = config.erasure;

        let mut device = Device::new(
            device_config,
            storage,
            Some(Identity { keys, community }),
            Box::new(OsNonce),
            Box::new(OsRng),
        );

        let mut peer_addrs = BTreeMap::new();
        for peer in &config.peers {
            let key = VerifyingKey::from_bytes(&peer.pubkey)
                .with_context(|| format!("invalid public key for peer {}", peer.id))?;
            device.trust_peer(peer.id.clone(), key);
            peer_addrs.insert(peer.id.clone(), peer.addr);
            info!(peer = %peer.id, addr = %peer.addr, "trusted peer");
        }

        Ok(Self {
            config,
            device,
            peer_addrs,
        })
    }

    pub fn public_key(&self) -> Option<[u8; 32]> {
        self.device.verifying_key().map(|key| key.to_bytes())
    }

    pub fn event_count(&self) -> u64 {
        self.device.store().count()
    }

    fn now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0)
    }

    async fn send_all(&self, socket: &UdpSocket, packets: Vec<Packet>) {
        for packet in packets {
            let Some(addr) = self.peer_addrs.get(&packet.target) else {
                debug!(target = %packet.target, "no address for peer");
                continue;
            };
            match packet.encode() {
                Ok(bytes) => {
                    if let Err(error) = socket.send_to(&bytes, addr).await {
                        warn!(%error, %addr, "send failed");
                    }
                }
                Err(error) => warn!(%error, "packet encode failed"),
            }
        }
    }

    /// Run until ctrl-c.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let socket = UdpSocket::bind(self.config.listen)
            .await
            .with_context(|| format!("binding {}", self.config.listen))?;
        info!("listening on {}", self.config.listen);

        let mut sync_ticker = interval(Duration::from_millis(self.config.sync_interval_ms));
        let mut stats_ticker = interval(Duration::from_secs(60));
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => {
                            debug!(bytes = len, %from, "datagram");
                            let replies = self.device.handle_datagram(Self::now_ms(), &buf[..len]);
                            self.send_all(&socket, replies).await;
                        }
                        Err(error) => warn!(%error, "recv failed"),
                    }
                }
                _ = sync_ticker.tick() => {
                    let packets = self.device.step(Self::now_ms());
                    self.send_all(&socket, packets).await;
                }
                _ = stats_ticker.tick() => {
                    let sync = self.device.sync_stats();
                    info!(
                        events = self.device.store().count(),
                        summaries_sent = sync.summaries_sent,
                        summaries_received = sync.summaries_received,
                        events_pushed = sync.events_pushed,
                        "sync status"
                    );
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    break;
                }
            }
        }

        self.device.store().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            data_dir: dir.to_path_buf(),
            device_id: "alice".to_string(),
            community: "a long enough passphrase".to_string(),
            peers: vec![],
            sync_interval_ms: 1_000,
            summary_period_ms: 2_000,
            erasure: false,
            log_format: "pretty".to_string(),
        }
    }

    #[test]
    fn server_creation_and_identity_persistence() {
        let dir = tempdir().unwrap();

        let first = Server::new(test_config(dir.path())).unwrap();
        let pubkey = first.public_key().unwrap();
        assert_eq!(first.event_count(), 0);
        drop(first);

        // a restart keeps the same identity
        let second = Server::new(test_config(dir.path())).unwrap();
        assert_eq!(second.public_key().unwrap(), pubkey);
    }

    #[test]
    fn short_passphrase_rejected() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.community = "short".into();
        assert!(Server::new(config).is_err());
    }
}
