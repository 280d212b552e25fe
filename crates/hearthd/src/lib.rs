//! hearthd - Hearth event sync daemon
//!
//! This daemon provides:
//! - Persistent event storage for one community device
//! - Periodic Bloom-summary exchange with configured peers over UDP
//! - Event solicitation and delivery
//! - A persisted device identity

pub mod config;
pub mod server;

pub use config::{Config, NodeState, PeerSpec};
pub use server::Server;
