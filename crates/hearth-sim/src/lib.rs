//! Hearth simulation harness
//!
//! A single-threaded, deterministic discrete-event simulator for fleets of
//! Hearth devices: a lossy datagram network model with latency, jitter and
//! per-device connectivity, plus a virtual clock, a scheduled timeline,
//! Poisson traffic generators and replay/record support. Everything random
//! routes through one seeded PRNG; a replay-mode flag freezes AEAD nonces so
//! whole runs reproduce byte-for-byte.

pub mod network;
pub mod sim;

pub use network::{Delivery, LinkStats, NetError, NetStats, NetworkConfig, NetworkModel};
pub use sim::{
    Action, AttachmentSpec, SimConfig, SimError, Simulator, TimelineEvent, TrafficProfile,
};
