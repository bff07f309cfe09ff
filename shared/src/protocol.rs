//! Wire message layouts for client/server communication.
//!
//! Every message is a packed little-endian struct encoded with `bincode`'s
//! legacy fixed-int encoding, which writes struct fields in declaration
//! order with no padding and no length prefixes for fixed arrays. That makes
//! the serialized form byte-for-byte the packed layout the protocol
//! requires; the tests below pin each size so a refactor can't silently
//! change the wire format.
//!
//! The message code travels in the packet header's `type` field (see
//! [`crate::net::transport::PacketHeader`]); payloads start immediately
//! after the 10-byte header.
//!
//! Snapshots always transmit the full player and shot arrays. The two count
//! fields say how many leading entries are valid; the rest is padding sent
//! on the wire, a deliberate trade of bandwidth for a fixed layout.

use crate::{MAX_PLAYERS, MAX_SHOTS};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Wire code for each message, carried in the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Unreliable, server -> clients, 20 Hz.
    ServerSnapshot = 1,
    /// Unreliable, client -> server, one per client tick.
    ClientInput = 2,
    /// Reliable, server -> clients.
    PlayerLeft = 3,
    /// Reliable, server -> clients.
    PlayerDied = 4,
    /// Reliable, client -> server.
    ConnectRequest = 5,
    /// Reliable, server -> client.
    ConnectAccept = 6,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ServerSnapshot),
            2 => Some(Self::ClientInput),
            3 => Some(Self::PlayerLeft),
            4 => Some(Self::PlayerDied),
            5 => Some(Self::ConnectRequest),
            6 => Some(Self::ConnectAccept),
            _ => None,
        }
    }
}

/// A payload that knows its own wire code. The transport stamps the code
/// into the header on send.
pub trait WireMessage: Serialize + DeserializeOwned {
    const TYPE: MessageType;
}

pub const PLAYER_NAME_LEN: usize = 32;

/// One frame of player intent, sent unreliably every client tick.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InputMessage {
    /// Monotonic per-client counter; the server uses it to drop stale or
    /// duplicated inputs and to tell the client what it has processed.
    pub sequence_num: u32,
    pub move_x: f32,
    pub move_z: f32,
    pub look_yaw: f32,
    pub look_pitch: f32,
    pub buttons: u8,
    /// The client's belief of server time at the instant the trigger was
    /// pulled; drives lag-compensated hit tests.
    pub shot_time: f32,
    pub time: f32,
}

impl WireMessage for InputMessage {
    const TYPE: MessageType = MessageType::ClientInput;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub player_name: [u8; PLAYER_NAME_LEN],
}

impl ConnectRequest {
    pub fn new(name: &str) -> Self {
        let mut player_name = [0u8; PLAYER_NAME_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(PLAYER_NAME_LEN - 1);
        player_name[..len].copy_from_slice(&bytes[..len]);
        Self { player_name }
    }

    /// Name up to the first NUL, lossily decoded.
    pub fn name(&self) -> String {
        let end = self
            .player_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PLAYER_NAME_LEN);
        String::from_utf8_lossy(&self.player_name[..end]).into_owned()
    }
}

impl WireMessage for ConnectRequest {
    const TYPE: MessageType = MessageType::ConnectRequest;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConnectAccept {
    pub server_time: f32,
    pub player_index: i8,
}

impl WireMessage for ConnectAccept {
    const TYPE: MessageType = MessageType::ConnectAccept;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlayerLeftMessage {
    pub player_idx: i8,
}

impl WireMessage for PlayerLeftMessage {
    const TYPE: MessageType = MessageType::PlayerLeft;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlayerDiedMessage {
    pub killer_idx: i8,
    pub killed_idx: i8,
}

impl WireMessage for PlayerDiedMessage {
    const TYPE: MessageType = MessageType::PlayerDied;
}

/// Compressed player state, 18 bytes on the wire. See [`crate::codec`] for
/// the scale factors.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QuantizedPlayer {
    pub player_idx: i8,
    pub pos_x: i16,
    pub pos_y: i16,
    pub pos_z: i16,
    pub vel_x: i8,
    pub vel_y: i8,
    pub vel_z: i8,
    pub yaw: u8,
    pub pitch: i8,
    pub health: u8,
    pub flags: u8,
    pub last_processed_seq: u32,
}

/// Compressed shot ray, 11 bytes on the wire.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QuantizedShot {
    pub shooter_idx: i8,
    pub origin_x: i16,
    pub origin_y: i16,
    pub origin_z: i16,
    pub dir_x: i8,
    pub dir_y: i8,
    pub dir_z: i8,
    pub length: u8,
}

/// The 20 Hz authoritative broadcast: every active player plus the shots
/// fired since the previous snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SnapshotMessage {
    pub server_time: f32,
    pub player_count: u8,
    pub shot_count: u8,
    pub players: [QuantizedPlayer; MAX_PLAYERS],
    pub shots: [QuantizedShot; MAX_SHOTS],
}

impl Default for SnapshotMessage {
    fn default() -> Self {
        Self {
            server_time: 0.0,
            player_count: 0,
            shot_count: 0,
            players: [QuantizedPlayer::default(); MAX_PLAYERS],
            shots: [QuantizedShot::default(); MAX_SHOTS],
        }
    }
}

impl WireMessage for SnapshotMessage {
    const TYPE: MessageType = MessageType::ServerSnapshot;
}

/// Decodes a payload slice into a message, tolerating trailing bytes.
pub fn decode<M: WireMessage>(payload: &[u8]) -> Result<M, bincode::Error> {
    bincode::deserialize(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_size<T: Serialize>(value: &T) -> u64 {
        bincode::serialized_size(value).unwrap()
    }

    #[test]
    fn wire_sizes_are_pinned() {
        assert_eq!(wire_size(&InputMessage::default()), 29);
        assert_eq!(wire_size(&ConnectRequest::new("x")), 32);
        assert_eq!(
            wire_size(&ConnectAccept {
                server_time: 0.0,
                player_index: 0
            }),
            5
        );
        assert_eq!(wire_size(&PlayerLeftMessage { player_idx: 0 }), 1);
        assert_eq!(
            wire_size(&PlayerDiedMessage {
                killer_idx: 0,
                killed_idx: 0
            }),
            2
        );
        assert_eq!(wire_size(&QuantizedPlayer::default()), 18);
        assert_eq!(wire_size(&QuantizedShot::default()), 11);
        assert_eq!(
            wire_size(&SnapshotMessage::default()),
            4 + 1 + 1 + 10 * 18 + 16 * 11
        );
    }

    #[test]
    fn encoding_is_little_endian_packed() {
        let input = InputMessage {
            sequence_num: 0x0403_0201,
            ..Default::default()
        };
        let bytes = bincode::serialize(&input).unwrap();
        assert_eq!(&bytes[..4], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn input_message_roundtrip() {
        let input = InputMessage {
            sequence_num: 77,
            move_x: -0.5,
            move_z: 1.0,
            look_yaw: 2.0,
            look_pitch: -0.25,
            buttons: crate::INPUT_BUTTON_SHOOT | crate::INPUT_BUTTON_JUMP,
            shot_time: 12.5,
            time: 13.0,
        };

        let bytes = bincode::serialize(&input).unwrap();
        let decoded: InputMessage = decode(&bytes).unwrap();
        assert_eq!(decoded.sequence_num, 77);
        assert_eq!(decoded.move_x, -0.5);
        assert_eq!(decoded.buttons, 0x03);
        assert_eq!(decoded.shot_time, 12.5);
    }

    #[test]
    fn connect_request_name_truncates() {
        let req = ConnectRequest::new("a_name_well_beyond_thirty_two_characters_long");
        assert_eq!(req.name().len(), PLAYER_NAME_LEN - 1);

        let short = ConnectRequest::new("bot_3");
        assert_eq!(short.name(), "bot_3");
    }

    #[test]
    fn truncated_payload_fails_to_decode() {
        let accept = ConnectAccept {
            server_time: 1.0,
            player_index: 2,
        };
        let bytes = bincode::serialize(&accept).unwrap();
        assert!(decode::<ConnectAccept>(&bytes[..3]).is_err());
    }

    #[test]
    fn message_codes_match_protocol_table() {
        assert_eq!(MessageType::ServerSnapshot as u8, 1);
        assert_eq!(MessageType::ClientInput as u8, 2);
        assert_eq!(MessageType::PlayerLeft as u8, 3);
        assert_eq!(MessageType::PlayerDied as u8, 4);
        assert_eq!(MessageType::ConnectRequest as u8, 5);
        assert_eq!(MessageType::ConnectAccept as u8, 6);
        assert_eq!(MessageType::from_u8(7), None);
        assert_eq!(MessageType::from_u8(0), None);
    }
}
