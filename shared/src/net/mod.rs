//! Networking: the lock-free packet pool handoff and the reliable-UDP
//! transport built on top of it.

pub mod spsc;
pub mod transport;

pub use transport::{
    hash_addr, NetError, PacketHeader, Polled, Transport, UnknownSenderPolicy, HEADER_SIZE,
    MAX_PACKET_SIZE, MAX_PEERS, MAX_RETRANSMIT_ATTEMPTS, PACKET_POOL_SIZE,
    PEER_INACTIVITY_TIMEOUT, WINDOW_SIZE,
};
