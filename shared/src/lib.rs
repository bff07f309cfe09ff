//! # Shared Game Library
//!
//! Everything that both the game client and the authoritative server need to
//! agree on lives in this crate:
//!
//! - **Game constants**: tick rates, player limits, combat tuning. These are
//!   normative; changing one side without the other desynchronizes the game.
//! - **Core entities** ([`Player`], [`Shot`], [`Snapshot`]): the state the
//!   server simulates and the client predicts.
//! - **Wire protocol** ([`protocol`]): packed little-endian message layouts
//!   encoded with `bincode`.
//! - **Reliable-UDP transport** ([`net`]): sequence/ack bookkeeping, the
//!   retransmit window and the two-thread packet pool.
//! - **Deterministic simulation** ([`physics`]): the input and integration
//!   step shared by server authority and client prediction. Identical inputs
//!   must produce bitwise-identical players on every host, which is what
//!   makes reconciliation converge.
//! - **Geometry and map** ([`geom`], [`map`]): the oriented-bounding-box
//!   primitives and the arena both sides generate from the same procedure.
//! - **Snapshot codec** ([`codec`]): lossy float-to-integer compression of
//!   player and shot state for the 20 Hz broadcast.

pub mod codec;
pub mod geom;
pub mod map;
pub mod net;
pub mod physics;
pub mod protocol;

use glam::Vec3;

/// UDP port the server binds; clients must not bind it.
pub const SERVER_PORT: u16 = 7777;

/// Fixed simulation rate for both client and server.
pub const TICK_RATE: f32 = 60.0;
pub const TICK_TIME: f32 = 1.0 / TICK_RATE;

/// Authoritative state broadcast rate. Lower than the tick rate, which is
/// why clients interpolate between snapshots instead of rendering them raw.
pub const SNAPSHOT_RATE: f32 = 20.0;
pub const SNAPSHOT_TIME: f32 = 1.0 / SNAPSHOT_RATE;

/// How often retransmits and peer timeouts are scanned.
pub const NETWORK_UPDATE_INTERVAL: f32 = 0.1;

/// Snapshots a client keeps for interpolation.
pub const SNAPSHOT_COUNT: usize = 32;
/// Frames the server keeps for lag-compensated hit tests.
pub const HISTORY_SIZE: usize = 64;

pub const MAX_PLAYERS: usize = 10;
pub const MAX_SHOTS: usize = 16;
pub const MAX_JUMPS: u8 = 2;

pub const MAX_SHOOT_RANGE: f32 = 100.0;
pub const PLAYER_RADIUS: f32 = 1.0;
pub const PLAYER_EYE_HEIGHT: f32 = 0.5;
pub const STARTING_HEALTH: u8 = 100;
pub const BULLET_DAMAGE: u8 = 10;

/// Button bitfield carried in [`protocol::InputMessage::buttons`].
pub const INPUT_BUTTON_SHOOT: u8 = 0x01;
pub const INPUT_BUTTON_JUMP: u8 = 0x02;

/// A player slot as simulated by the server and predicted by the client.
///
/// Slots are identified by `player_idx`; `-1` marks an inactive slot. The
/// struct is `Copy` so snapshot history frames are cheap deep copies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Player {
    /// Slot index in the player array, -1 when the slot is free.
    pub player_idx: i8,
    /// Sequence number of the last input the server applied to this player.
    pub last_processed_seq: u32,
    pub position: Vec3,
    pub velocity: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub on_ground: bool,
    pub health: u8,
    pub wall_running: bool,
    /// Outward normal of the wall currently being run on.
    pub wall_normal: Vec3,
    /// Index into the map geometry of that wall, -1 when not wall-running.
    pub wall_index: i16,
    /// Jumps left before the player must touch ground again.
    pub jumps_remaining: u8,
}

impl Default for Player {
    fn default() -> Self {
        Self {
            player_idx: -1,
            last_processed_seq: 0,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            yaw: 0.0,
            pitch: 0.0,
            on_ground: false,
            health: 0,
            wall_running: false,
            wall_normal: Vec3::ZERO,
            wall_index: -1,
            jumps_remaining: 0,
        }
    }
}

impl Player {
    pub fn active(&self) -> bool {
        self.player_idx != -1
    }

    pub fn alive(&self) -> bool {
        self.health > 0
    }

    /// Where shots originate: player center raised by the eye offset.
    pub fn eye_position(&self) -> Vec3 {
        self.position + Vec3::new(0.0, PLAYER_EYE_HEIGHT, 0.0)
    }

    /// Unit vector the player is looking along, built from yaw and pitch.
    pub fn look_direction(&self) -> Vec3 {
        Vec3::new(
            self.yaw.cos() * self.pitch.cos(),
            self.pitch.sin(),
            self.yaw.sin() * self.pitch.cos(),
        )
    }
}

/// A hitscan shot resolved on the server and echoed in snapshots so every
/// client can draw the tracer.
#[derive(Debug, Clone, Copy)]
pub struct Shot {
    pub shooter_idx: i8,
    pub ray: geom::Ray,
    pub spawn_time: f32,
}

/// The recorded state of every player slot at one instant. Only the server
/// creates these; both sides keep a rolling window of the most recent ones.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub timestamp: f32,
    pub players: [Player; MAX_PLAYERS],
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            timestamp: 0.0,
            players: [Player::default(); MAX_PLAYERS],
        }
    }
}

impl Snapshot {
    /// The player occupying `idx`, if that slot is active.
    pub fn player(&self, idx: i8) -> Option<&Player> {
        if !(0..MAX_PLAYERS as i8).contains(&idx) {
            return None;
        }
        let player = &self.players[idx as usize];
        player.active().then_some(player)
    }
}
