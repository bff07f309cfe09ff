//! Reliable-UDP transport with piggybacked acknowledgments.
//!
//! All traffic is packet based. TCP-style reliability stores each packet
//! until an explicit ack arrives and resends on a timer; ordering falls out
//! of numbering every packet. Most of this game's messages don't want any
//! of that — a late input is worse than a lost one, and a lost snapshot is
//! covered by the next one 50 ms later. A few messages (connect accept, a
//! player dying or leaving) genuinely must arrive.
//!
//! Rather than opening a TCP connection beside the UDP socket, the
//! transport exploits the continuous bidirectional traffic already flowing
//! (inputs one way, snapshots the other): every outgoing header carries the
//! highest sequence received from that peer plus a 32-bit bitfield covering
//! the 32 sequences before it. Acks for reliable messages piggyback on
//! whatever is being sent anyway; there are no dedicated ack packets.
//! Unreliable messages are sent and forgotten; reliable ones sit in a
//! 32-slot window, retransmitted at 1.1x the measured round trip until the
//! ack bit comes back or the peer is declared gone.
//!
//! Reception runs on a dedicated thread: it pulls a free index from the
//! buffer pool, blocks in `recv_from` (100 ms timeout so shutdown is
//! prompt), and hands completed receptions to the main thread over an SPSC
//! ring. Every other piece of state — the peer map, sequence counters,
//! windows, timers — belongs to the main thread alone.

use crate::net::spsc::SpscRing;
use crate::protocol::WireMessage;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

pub const MAX_PACKET_SIZE: usize = 1500;
pub const PACKET_POOL_SIZE: usize = 256;
pub const WINDOW_SIZE: u16 = 32;
pub const MAX_PEERS: usize = 16;

/// Serialized size of [`PacketHeader`]; pinned by a test.
pub const HEADER_SIZE: usize = 10;

pub const MAX_RETRANSMIT_ATTEMPTS: u8 = 10;
pub const PEER_INACTIVITY_TIMEOUT: f64 = 4.0;

/// A real implementation would smooth the RTT estimate so one dropped
/// packet doesn't at minimum double it; most-recent-wins is good enough
/// for scheduling retransmits here.
const RETRANSMIT_RTT_SCALE: f64 = 1.1;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const POOL_EXHAUSTED_BACKOFF: Duration = Duration::from_micros(100);

pub const FLAG_RELIABLE: u8 = 0x01;

/// Ten bytes prefixed to every packet.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Message code, see [`crate::protocol::MessageType`].
    pub msg_type: u8,
    /// Bit 0 set = reliable.
    pub flags: u8,
    /// Sender's sequence number for this packet.
    pub sequence: u16,
    /// Bit i set = sequence `ack - i - 1` was received.
    pub ack_bits: u32,
    /// Highest sequence received from the destination peer.
    pub ack: u16,
}

#[derive(Debug, Error)]
pub enum NetError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("failed to configure UDP socket: {0}")]
    Socket(std::io::Error),
    #[error("failed to spawn receive thread: {0}")]
    Thread(std::io::Error),
}

/// What to do with a packet from an address that has no peer entry.
/// Servers accept (that's how clients join); clients only ever talk to the
/// server they added explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownSenderPolicy {
    AcceptPeers,
    Discard,
}

#[derive(Debug, Clone, Copy, Default)]
struct PendingPacket {
    buffer_idx: u8,
    size: u16,
    send_time: f64,
    next_retransmit_time: f64,
    retry_count: u8,
}

struct PeerState {
    address: SocketAddr,

    local_sequence: u16,
    remote_sequence: u16,
    remote_ack_bits: u32,

    /// Oldest local sequence not yet acknowledged.
    window_start: u16,
    /// Bit per window slot: slot occupied by an in-flight reliable packet.
    window_mask: u32,
    window: [PendingPacket; WINDOW_SIZE as usize],

    last_seen_time: f64,
    round_trip_time: f64,
}

impl PeerState {
    fn new(address: SocketAddr, now: f64) -> Self {
        Self {
            address,
            local_sequence: 0,
            remote_sequence: 0,
            remote_ack_bits: 0,
            window_start: 0,
            window_mask: 0,
            window: [PendingPacket::default(); WINDOW_SIZE as usize],
            last_seen_time: now,
            round_trip_time: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ReceivedPacketInfo {
    buffer_index: u8,
    from: SocketAddr,
    size: u16,
}

/// A packet handed to the application. The payload stays in the pool;
/// call [`Transport::release`] once it has been decoded.
#[derive(Debug)]
pub struct Polled {
    /// Peer id of the sender.
    pub from: u32,
    /// Message code from the header.
    pub msg_type: u8,
    buffer_index: u8,
    size: u16,
}

/// Byte storage for in-flight packets, indexed 0..256. Indices move between
/// the free ring, the receive ring and the retransmit windows; whoever
/// holds an index owns that buffer.
struct PacketPool {
    buffers: Box<[UnsafeCell<[u8; MAX_PACKET_SIZE]>]>,
}

// Safety: buffer access is gated on holding the index, and indices are
// transferred between threads only through the SPSC rings whose
// release/acquire pair orders the byte writes before the reads.
unsafe impl Sync for PacketPool {}

impl PacketPool {
    fn new() -> Self {
        Self {
            buffers: (0..PACKET_POOL_SIZE)
                .map(|_| UnsafeCell::new([0u8; MAX_PACKET_SIZE]))
                .collect(),
        }
    }

    /// Safety: the caller must hold `idx` (acquired from a ring and not yet
    /// released) and must not hold another reference to the same buffer.
    #[allow(clippy::mut_from_ref)]
    unsafe fn buffer_mut(&self, idx: u8) -> &mut [u8; MAX_PACKET_SIZE] {
        &mut *self.buffers[idx as usize].get()
    }

    /// Safety: same ownership rule as [`Self::buffer_mut`].
    unsafe fn buffer(&self, idx: u8) -> &[u8; MAX_PACKET_SIZE] {
        &*self.buffers[idx as usize].get()
    }
}

/// State shared with the receive thread.
struct Shared {
    pool: PacketPool,
    free_indices: SpscRing<u8, PACKET_POOL_SIZE>,
    recv_queue: SpscRing<ReceivedPacketInfo, PACKET_POOL_SIZE>,
    running: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        let shared = Self {
            pool: PacketPool::new(),
            free_indices: SpscRing::new(),
            recv_queue: SpscRing::new(),
            running: AtomicBool::new(true),
        };
        for i in 0..PACKET_POOL_SIZE {
            shared.free_indices.try_push(i as u8);
        }
        shared
    }
}

pub struct Transport {
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    recv_thread: Option<JoinHandle<()>>,
    peers: HashMap<u32, PeerState>,
    current_time: f64,
    unknown_policy: UnknownSenderPolicy,
}

/// Peers are keyed by a hash of their address so the id fits in a u32 and
/// survives being sent around as a plain value.
pub fn hash_addr(addr: &SocketAddr) -> u32 {
    match addr {
        SocketAddr::V4(v4) => {
            let ip = u32::from_be_bytes(v4.ip().octets());
            let port = v4.port() as u32;
            ip ^ (port << 16) ^ (port >> 16)
        }
        SocketAddr::V6(v6) => {
            let octets = v6.ip().octets();
            let mut hash = 0u32;
            for chunk in octets.chunks_exact(4) {
                hash ^= u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            let port = v6.port() as u32;
            hash ^ (port << 16) ^ (port >> 16)
        }
    }
}

fn acknowledge(
    free_indices: &SpscRing<u8, PACKET_POOL_SIZE>,
    peer: &mut PeerState,
    sequence: u16,
    now: f64,
) {
    let diff = sequence.wrapping_sub(peer.window_start) as i16;
    if diff < 0 || diff >= WINDOW_SIZE as i16 {
        return;
    }

    let slot = (sequence & (WINDOW_SIZE - 1)) as usize;
    if peer.window_mask & (1 << slot) == 0 {
        return;
    }

    peer.round_trip_time = now - peer.window[slot].send_time;
    free_indices.try_push(peer.window[slot].buffer_idx);
    peer.window_mask &= !(1 << slot);
}

fn process_ack_bits(
    free_indices: &SpscRing<u8, PACKET_POOL_SIZE>,
    peer: &mut PeerState,
    most_recent_ack: u16,
    mut ack_bits: u32,
    now: f64,
) {
    acknowledge(free_indices, peer, most_recent_ack, now);

    while ack_bits != 0 {
        // With acks [0,0,1,0,...] the lowest set bit index is 2,
        // acknowledging sequence `most_recent_ack - 3`.
        let bit_index = ack_bits.trailing_zeros() as u16;
        let sequence = most_recent_ack.wrapping_sub(bit_index).wrapping_sub(1);
        acknowledge(free_indices, peer, sequence, now);
        ack_bits &= !(1u32 << bit_index);
    }
}

fn advance_window_start(peer: &mut PeerState) {
    while peer.window_mask != 0 {
        let slot = (peer.window_start & (WINDOW_SIZE - 1)) as usize;
        if peer.window_mask & (1 << slot) != 0 {
            break;
        }
        peer.window_start = peer.window_start.wrapping_add(1);
    }

    if peer.window_mask == 0 {
        peer.window_start = peer.local_sequence;
    }
}

/// Applies the newness test from the receive path and updates the peer's
/// ack state. Returns `true` when the packet should reach the application.
fn register_incoming(peer: &mut PeerState, sequence: u16) -> bool {
    let diff = sequence.wrapping_sub(peer.remote_sequence) as i16 as i32;

    if diff > 0 {
        if diff <= WINDOW_SIZE as i32 {
            // A shift by the full width is not defined for u32; a jump of
            // exactly the window size drops every old bit anyway.
            peer.remote_ack_bits = if diff < 32 {
                peer.remote_ack_bits << diff
            } else {
                0
            };
            peer.remote_ack_bits |= 1u32 << (diff - 1);
        } else {
            peer.remote_ack_bits = 0;
        }
        peer.remote_sequence = sequence;
        return true;
    }

    if diff == 0 {
        return false;
    }

    if -diff >= WINDOW_SIZE as i32 {
        // Too old to fit in the ack window; can't even ack it.
        return false;
    }

    let bit_index = (-diff - 1) as u32;
    let already_received = peer.remote_ack_bits & (1u32 << bit_index) != 0;
    peer.remote_ack_bits |= 1u32 << bit_index;

    !already_received
}

fn encode_packet<M: WireMessage>(
    buf: &mut [u8],
    header: &PacketHeader,
    msg: &M,
) -> Option<usize> {
    let payload_size = bincode::serialized_size(msg).ok()? as usize;
    let total = HEADER_SIZE + payload_size;
    if total > buf.len() {
        return None;
    }
    bincode::serialize_into(&mut buf[..HEADER_SIZE], header).ok()?;
    bincode::serialize_into(&mut buf[HEADER_SIZE..total], msg).ok()?;
    Some(total)
}

fn receive_loop(socket: Arc<UdpSocket>, shared: Arc<Shared>) {
    // Receive packets into the pool shared between this thread and the
    // main thread. The pool itself is not thread safe; ownership of
    // specific indices is what the rings hand back and forth.
    while shared.running.load(Ordering::Acquire) {
        let Some(buffer_idx) = shared.free_indices.try_pop() else {
            debug!("packet pool exhausted, receive thread waiting");
            thread::sleep(POOL_EXHAUSTED_BACKOFF);
            continue;
        };

        let buffer = unsafe { shared.pool.buffer_mut(buffer_idx) };
        match socket.recv_from(buffer) {
            Ok((bytes, from)) if bytes >= HEADER_SIZE => {
                let info = ReceivedPacketInfo {
                    buffer_index: buffer_idx,
                    from,
                    size: bytes as u16,
                };
                if !shared.recv_queue.try_push(info) {
                    shared.free_indices.try_push(buffer_idx);
                }
            }
            Ok(_) => {
                // Runt packet, not even a full header.
                shared.free_indices.try_push(buffer_idx);
            }
            Err(e) => {
                shared.free_indices.try_push(buffer_idx);
                if !matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) {
                    warn!("udp receive error: {e}");
                }
            }
        }
    }
}

impl Transport {
    /// Binds the socket and starts the receive thread.
    pub fn bind(ip: Ipv4Addr, port: u16) -> Result<Self, NetError> {
        let addr = SocketAddr::from((ip, port));
        let socket = UdpSocket::bind(addr).map_err(|source| NetError::Bind { addr, source })?;
        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .map_err(NetError::Socket)?;

        let socket = Arc::new(socket);
        let shared = Arc::new(Shared::new());

        let recv_thread = thread::Builder::new()
            .name("net-recv".into())
            .spawn({
                let socket = Arc::clone(&socket);
                let shared = Arc::clone(&shared);
                move || receive_loop(socket, shared)
            })
            .map_err(NetError::Thread)?;

        Ok(Self {
            socket,
            shared,
            recv_thread: Some(recv_thread),
            peers: HashMap::new(),
            current_time: 0.0,
            unknown_policy: UnknownSenderPolicy::Discard,
        })
    }

    pub fn set_unknown_sender_policy(&mut self, policy: UnknownSenderPolicy) {
        self.unknown_policy = policy;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// Registers a peer, returning its id. Adding an address twice yields
    /// the same id; a full peer table yields `None`.
    pub fn add_peer(&mut self, address: SocketAddr) -> Option<u32> {
        let peer_id = hash_addr(&address);
        if self.peers.contains_key(&peer_id) {
            return Some(peer_id);
        }
        if self.peers.len() >= MAX_PEERS {
            warn!("cannot add peer {address}, limit reached");
            return None;
        }

        self.peers.insert(peer_id, PeerState::new(address, self.current_time));
        Some(peer_id)
    }

    /// Drops a peer and returns every pool index its window still held.
    pub fn remove_peer(&mut self, peer_id: u32) -> bool {
        let Some(peer) = self.peers.remove(&peer_id) else {
            return false;
        };

        let mut slots = peer.window_mask;
        while slots != 0 {
            let slot = slots.trailing_zeros() as usize;
            self.shared.free_indices.try_push(peer.window[slot].buffer_idx);
            slots &= !(1u32 << slot);
        }

        info!("removed peer {peer_id:#010x}");
        true
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_rtt(&self, peer_id: u32) -> Option<f64> {
        self.peers.get(&peer_id).map(|p| p.round_trip_time)
    }

    /// Free pool buffers right now; diagnostic only. The receive thread
    /// holds one index while it blocks in `recv_from`, so an idle
    /// transport reports 255 or 256.
    pub fn free_buffers(&self) -> usize {
        self.shared.free_indices.len()
    }

    pub fn send_reliable<M: WireMessage>(&mut self, peer_id: u32, msg: &M) -> bool {
        self.send_message(peer_id, msg, true)
    }

    pub fn send_unreliable<M: WireMessage>(&mut self, peer_id: u32, msg: &M) -> bool {
        self.send_message(peer_id, msg, false)
    }

    fn send_message<M: WireMessage>(&mut self, peer_id: u32, msg: &M, reliable: bool) -> bool {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            warn!("send to unknown peer {peer_id:#010x}");
            return false;
        };

        // Reliable sends need a pool buffer for retransmits and a window
        // slot; failing either is a silent drop the caller may retry.
        let mut retained_idx = None;
        if reliable {
            let Some(idx) = self.shared.free_indices.try_pop() else {
                debug!("no free buffers, dropping reliable packet");
                return false;
            };

            let next_seq = peer.local_sequence.wrapping_add(1);
            let diff = next_seq.wrapping_sub(peer.window_start) as i16;
            if diff < 0 || diff >= WINDOW_SIZE as i16 {
                debug!("send window full, dropping reliable packet");
                self.shared.free_indices.try_push(idx);
                return false;
            }
            retained_idx = Some(idx);
        }

        peer.local_sequence = peer.local_sequence.wrapping_add(1);
        let sequence = peer.local_sequence;

        let header = PacketHeader {
            msg_type: M::TYPE as u8,
            flags: if reliable { FLAG_RELIABLE } else { 0 },
            sequence,
            ack_bits: peer.remote_ack_bits,
            ack: peer.remote_sequence,
        };

        let mut scratch = [0u8; MAX_PACKET_SIZE];
        let Some(total) = encode_packet(&mut scratch, &header, msg) else {
            warn!("payload too large for packet, dropping");
            if let Some(idx) = retained_idx {
                self.shared.free_indices.try_push(idx);
            }
            return false;
        };

        // Best-effort; a failed send is indistinguishable from loss.
        let _ = self.socket.send_to(&scratch[..total], peer.address);

        let Some(idx) = retained_idx else {
            return true;
        };

        let stored = unsafe { self.shared.pool.buffer_mut(idx) };
        stored[..total].copy_from_slice(&scratch[..total]);

        let slot = (sequence & (WINDOW_SIZE - 1)) as usize;
        peer.window[slot] = PendingPacket {
            buffer_idx: idx,
            size: total as u16,
            send_time: self.current_time,
            next_retransmit_time: self.current_time
                + peer.round_trip_time * RETRANSMIT_RTT_SCALE,
            retry_count: 0,
        };
        peer.window_mask |= 1u32 << slot;
        true
    }

    /// Pops the next accepted packet. Acks piggybacked on every packet are
    /// processed before the newness test, so even a duplicate still
    /// delivers its acks before being discarded.
    pub fn poll(&mut self) -> Option<Polled> {
        loop {
            let info = self.shared.recv_queue.try_pop()?;

            let header = {
                let data = unsafe { self.shared.pool.buffer(info.buffer_index) };
                match bincode::deserialize::<PacketHeader>(&data[..HEADER_SIZE]) {
                    Ok(header) => header,
                    Err(_) => {
                        self.shared.free_indices.try_push(info.buffer_index);
                        continue;
                    }
                }
            };

            let peer_id = hash_addr(&info.from);
            if !self.peers.contains_key(&peer_id) {
                let accepted = self.unknown_policy == UnknownSenderPolicy::AcceptPeers
                    && self.add_peer(info.from).is_some();
                if !accepted {
                    self.shared.free_indices.try_push(info.buffer_index);
                    continue;
                }
            }

            let now = self.current_time;
            let Some(peer) = self.peers.get_mut(&peer_id) else {
                self.shared.free_indices.try_push(info.buffer_index);
                continue;
            };

            peer.last_seen_time = now;

            process_ack_bits(
                &self.shared.free_indices,
                peer,
                header.ack,
                header.ack_bits,
                now,
            );
            advance_window_start(peer);

            if !register_incoming(peer, header.sequence) {
                self.shared.free_indices.try_push(info.buffer_index);
                continue;
            }

            return Some(Polled {
                from: peer_id,
                msg_type: header.msg_type,
                buffer_index: info.buffer_index,
                size: info.size - HEADER_SIZE as u16,
            });
        }
    }

    /// Payload bytes of a polled packet, valid until [`Self::release`].
    pub fn payload(&self, polled: &Polled) -> &[u8] {
        let data = unsafe { self.shared.pool.buffer(polled.buffer_index) };
        &data[HEADER_SIZE..HEADER_SIZE + polled.size as usize]
    }

    /// Returns a polled packet's buffer to the pool.
    pub fn release(&self, polled: &Polled) {
        self.shared.free_indices.try_push(polled.buffer_index);
    }

    /// Advances transport time, retires silent peers and retransmits
    /// overdue reliable packets. Returns the ids of peers removed this
    /// call (timeout or retry exhaustion) so the caller can react.
    pub fn update(&mut self, dt: f32) -> Vec<u32> {
        self.current_time += dt as f64;

        let mut removed = Vec::new();
        let peer_ids: Vec<u32> = self.peers.keys().copied().collect();

        for peer_id in peer_ids {
            let Some(peer) = self.peers.get(&peer_id) else {
                continue;
            };

            if self.current_time - peer.last_seen_time > PEER_INACTIVITY_TIMEOUT {
                self.remove_peer(peer_id);
                removed.push(peer_id);
                continue;
            }

            if !self.retransmit_overdue(peer_id) {
                self.remove_peer(peer_id);
                removed.push(peer_id);
            }
        }

        removed
    }

    /// Resends every overdue window slot. Returns `false` when a slot has
    /// exhausted its retries and the peer must be dropped.
    fn retransmit_overdue(&mut self, peer_id: u32) -> bool {
        let now = self.current_time;
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return true;
        };
        let address = peer.address;
        let rtt = peer.round_trip_time;

        let mut slots = peer.window_mask;
        while slots != 0 {
            let slot = slots.trailing_zeros() as usize;
            slots &= !(1u32 << slot);

            let pending = &mut peer.window[slot];
            if now < pending.next_retransmit_time {
                continue;
            }
            if pending.retry_count >= MAX_RETRANSMIT_ATTEMPTS {
                return false;
            }

            let data = unsafe { self.shared.pool.buffer(pending.buffer_idx) };
            let _ = self
                .socket
                .send_to(&data[..pending.size as usize], address);
            pending.retry_count += 1;
            pending.next_retransmit_time = now + rtt * RETRANSMIT_RTT_SCALE;
        }

        true
    }

    /// Stops the receive thread and waits for it to observe the flag on
    /// its next timeout.
    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.recv_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
