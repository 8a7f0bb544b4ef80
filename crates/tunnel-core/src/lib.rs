//! Core tunnel types, framing, and constants.
//!
//! This crate provides:
//! - The [`L3Packet`] contract plus IPv4/IPv6/UDP implementations
//! - Transport message framing (the header that carries the nonce counter)
//! - Pooled packet buffers with independent read views
//! - Seams for the raw I/O collaborators (TUN device, datagram socket)

#![forbid(unsafe_code)]

pub mod buffer;
pub mod io;
pub mod packet;
pub mod transport;

pub use buffer::{
    ByteOrder, PacketBufferPool, PacketBufferPoolConfig, PacketBufferPoolStats, PacketView,
    PooledBuffer, PooledPacket,
};
pub use io::{DatagramSocket, MemoryTun, MemoryTunHandle, TunDevice, UdpDatagramSocket};
pub use packet::{write_packet, Ipv4Packet, Ipv6Packet, Keepalive, L3Packet, L4Packet, UdpDatagram};
pub use transport::{
    sealed_message_len, TransportHeader, AEAD_TAG_SIZE, MESSAGE_TRANSPORT_TYPE,
    MIN_TRANSPORT_MESSAGE_SIZE, TRANSPORT_HEADER_SIZE,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("buffer is not big enough (expected {requested}, got {available})")]
    Capacity { requested: usize, available: usize },
    #[error("message too short: {0}")]
    TooShort(usize),
    #[error("invalid message type (expected 4, got {0})")]
    InvalidMessageType(u8),
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("position {position} outside limit {limit}")]
    OutOfBounds { position: usize, limit: usize },
}
