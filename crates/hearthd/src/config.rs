//! Configuration for hearthd

use clap::Parser;
use hearth_core::types::DeviceId;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// hearthd - Hearth community sync daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "hearthd")]
#[command(about = "Hearth event store and anti-entropy sync daemon")]
pub struct Config {
    /// UDP listen address
    #[arg(short, long, default_value = "0.0.0.0:9300")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/hearthd")]
    pub data_dir: PathBuf,

    /// This device's identifier within the community
    #[arg(long, env = "HEARTH_DEVICE_ID")]
    pub device_id: String,

    /// Community passphrase; the shared AEAD key derives from it
    #[arg(long, env = "HEARTH_COMMUNITY")]
    pub community: String,

    /// Trusted peer as id=addr=pubkey_hex (repeatable)
    #[arg(long = "peer", value_parser = PeerSpec::parse_arg)]
    pub peers: Vec<PeerSpec>,

    /// Sync step interval in milliseconds
    #[arg(long, default_value = "1000")]
    pub sync_interval_ms: u64,

    /// Summary period per peer in milliseconds
    #[arg(long, default_value = "2000")]
    pub summary_period_ms: u64,

    /// Generate XOR parity chunks for uploads
    #[arg(long)]
    pub erasure: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.device_id.is_empty() {
            anyhow::bail!("device id cannot be empty");
        }
        if self.device_id.len() > u8::MAX as usize {
            anyhow::bail!("device id too long");
        }
        if self.community.len() < 12 {
            anyhow::bail!("community passphrase must be at least 12 characters");
        }
        Ok(())
    }
}

/// One trusted peer: identity, socket address and Ed25519 public key.
#[derive(Debug, Clone)]
pub struct PeerSpec {
    pub id: DeviceId,
    pub addr: SocketAddr,
    pub pubkey: [u8; 32],
}

impl PeerSpec {
    /// Parse `id=addr=pubkey_hex`.
    pub fn parse_arg(value: &str) -> Result<Self, String> {
        let parts: Vec<&str> = value.split('=').collect();
        let [id, addr, pubkey_hex] = parts.as_slice() else {
            return Err("expected id=addr=pubkey_hex".to_string());
        };
        if id.is_empty() {
            return Err("peer id cannot be empty".to_string());
        }
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| format!("bad peer address: {e}"))?;
        let bytes = hex::decode(pubkey_hex).map_err(|e| format!("bad peer pubkey: {e}"))?;
        let pubkey: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "peer pubkey must be 32 bytes".to_string())?;
        Ok(Self {
            id: DeviceId::new(*id),
            addr,
            pubkey,
        })
    }
}

/// Persisted node state: the keypair seed survives restarts so the device
/// keeps its identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    #[serde(with = "hex::serde")]
    pub keypair_seed: [u8; 32],
}

impl NodeState {
    /// Load the node state, creating a fresh identity on first run.
    pub fn load_or_create(data_dir: &Path) -> anyhow::Result<Self> {
        let path = data_dir.join("node_state.json");
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            Ok(serde_json::from_slice(&bytes)?)
        } else {
            let mut seed = [0u8; 32];
            OsRng.fill_bytes(&mut seed);
            let state = Self { keypair_seed: seed };
            std::fs::write(&path, serde_json::to_vec_pretty(&state)?)?;
            Ok(state)
        }
    }
}
