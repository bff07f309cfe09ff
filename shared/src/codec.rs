//! Snapshot compression via lossy integer encoding.
//!
//! Precision is traded for bandwidth where the loss is invisible next to
//! latency and jitter. Positions drop from a 4-byte float to an i16 scaled
//! by 500, which covers ±65 m at 2 mm precision. Velocities, angles and the
//! shot ray get the same treatment at coarser scales. Flags pack the three
//! movement bits the simulation needs into one byte.
//!
//! Delta encoding against the previous snapshot would cut far more, at the
//! cost of change tracking and stateful decoding on both ends; full-state
//! snapshots keep every packet self-contained.

use crate::geom::Ray;
use crate::protocol::{QuantizedPlayer, QuantizedShot};
use crate::{Player, Shot};
use glam::Vec3;
use std::f32::consts::PI;

const POSITION_SCALE: f32 = 500.0;
const POSITION_INV_SCALE: f32 = 0.002;
const VELOCITY_SCALE: f32 = 10.0;
const VELOCITY_INV_SCALE: f32 = 0.1;

const FLAG_ON_GROUND: u8 = 0x01;
const FLAG_WALL_RUNNING: u8 = 0x02;

fn quantize_position(v: f32) -> i16 {
    (v * POSITION_SCALE).clamp(-32768.0, 32767.0) as i16
}

fn quantize_velocity(v: f32) -> i8 {
    (v * VELOCITY_SCALE).clamp(-128.0, 127.0) as i8
}

pub fn quantize_player(player: &Player) -> QuantizedPlayer {
    // Yaw wraps, so normalize into [0, 1) before scaling; a u8 then covers
    // the full circle with no clamping artifacts at the seam.
    let normalized_yaw = player.yaw / (2.0 * PI);
    let normalized_yaw = normalized_yaw - normalized_yaw.floor();

    QuantizedPlayer {
        player_idx: player.player_idx,
        pos_x: quantize_position(player.position.x),
        pos_y: quantize_position(player.position.y),
        pos_z: quantize_position(player.position.z),
        vel_x: quantize_velocity(player.velocity.x),
        vel_y: quantize_velocity(player.velocity.y),
        vel_z: quantize_velocity(player.velocity.z),
        yaw: (normalized_yaw * 255.0) as u8,
        pitch: (player.pitch * (128.0 / PI)).clamp(-128.0, 127.0) as i8,
        health: player.health,
        flags: (if player.on_ground { FLAG_ON_GROUND } else { 0 })
            | (if player.wall_running { FLAG_WALL_RUNNING } else { 0 })
            | ((player.jumps_remaining & 0x03) << 2),
        last_processed_seq: player.last_processed_seq,
    }
}

pub fn dequantize_player(q: &QuantizedPlayer) -> Player {
    Player {
        player_idx: q.player_idx,
        last_processed_seq: q.last_processed_seq,
        position: Vec3::new(
            q.pos_x as f32 * POSITION_INV_SCALE,
            q.pos_y as f32 * POSITION_INV_SCALE,
            q.pos_z as f32 * POSITION_INV_SCALE,
        ),
        velocity: Vec3::new(
            q.vel_x as f32 * VELOCITY_INV_SCALE,
            q.vel_y as f32 * VELOCITY_INV_SCALE,
            q.vel_z as f32 * VELOCITY_INV_SCALE,
        ),
        yaw: q.yaw as f32 * (2.0 * PI / 255.0),
        pitch: q.pitch as f32 * (PI / 128.0),
        health: q.health,
        on_ground: q.flags & FLAG_ON_GROUND != 0,
        wall_running: q.flags & FLAG_WALL_RUNNING != 0,
        jumps_remaining: (q.flags >> 2) & 0x03,
        // Not transmitted; the owning side reconstructs these locally.
        wall_normal: Vec3::ZERO,
        wall_index: -1,
    }
}

pub fn quantize_shot(shot: &Shot) -> QuantizedShot {
    let dir = shot.ray.direction.normalize();
    QuantizedShot {
        shooter_idx: shot.shooter_idx,
        origin_x: quantize_position(shot.ray.origin.x),
        origin_y: quantize_position(shot.ray.origin.y),
        origin_z: quantize_position(shot.ray.origin.z),
        dir_x: (dir.x * 127.0) as i8,
        dir_y: (dir.y * 127.0) as i8,
        dir_z: (dir.z * 127.0) as i8,
        length: shot.ray.length.clamp(0.0, 255.0) as u8,
    }
}

pub fn dequantize_shot(q: &QuantizedShot) -> Shot {
    let dir = Vec3::new(
        q.dir_x as f32 / 127.0,
        q.dir_y as f32 / 127.0,
        q.dir_z as f32 / 127.0,
    );
    Shot {
        shooter_idx: q.shooter_idx,
        ray: Ray {
            origin: Vec3::new(
                q.origin_x as f32 * POSITION_INV_SCALE,
                q.origin_y as f32 * POSITION_INV_SCALE,
                q.origin_z as f32 * POSITION_INV_SCALE,
            ),
            direction: dir.normalize(),
            length: q.length as f32,
        },
        spawn_time: 0.0,
    }
}
