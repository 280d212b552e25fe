//! Wire primitives for the Hearth sync protocol
//!
//! This crate defines the datagram framing shared by the sync engine, the
//! simulated network and the UDP daemon. It knows nothing about transport
//! scheduling; senders hand encoded packets to whatever carries datagrams.

pub mod packet;

pub use packet::{
    decode_solicit, encode_solicit, EventFrame, Packet, PacketError, PacketKind, MAX_DATAGRAM,
};
