//! Snapshot interpolation and the adaptive render-time controller.
//!
//! Snapshots arrive at a third of the frame rate, so the client renders
//! some time in the past and blends between the two snapshots that bracket
//! that moment. How far in the past is a trade-off the [`Timeline`] tunes
//! continuously: the excess of buffered "future" snapshots is a proxy for
//! network quality, so a healthy connection pulls the render time closer
//! to the server's present and a jittery one pushes it back until a
//! bracketing pair is always available.

use shared::{Player, Snapshot, MAX_PLAYERS};
use std::collections::VecDeque;
use std::f32::consts::PI;

pub const MIN_DELAY: f32 = 0.02;
pub const MAX_DELAY: f32 = 0.15;

const TIME_SYNC_LARGE_CORRECTION: f32 = 0.1;
const DELAY_ADJUST_STEP: f32 = 0.01;
const INTERP_TRANSITION_SPEED: f32 = 2.0;
const TIME_CORRECTION_LARGE: f32 = 4.0;
const TIME_CORRECTION_MEDIUM: f32 = 1.0;
const RENDER_TIME_SNAP: f32 = 1.0;

/// A movement this large between adjacent snapshots is a death or a
/// teleport, not motion; interpolating through it would sweep the player
/// across the map.
const TELEPORT_THRESHOLD: f32 = 10.0;

/// The client's moving estimate of server time and the lagging render
/// time it derives from it.
#[derive(Debug, Clone, Copy)]
pub struct Timeline {
    /// Local estimate of the server clock; advanced by dt each tick and
    /// hard-snapped when a snapshot disagrees by too much. Sits roughly
    /// half the round trip behind the server's actual clock.
    pub server_time: f32,
    /// The moment in the past currently being rendered.
    pub render_time: f32,
    target_delay: f32,
    current_delay: f32,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Timeline {
    pub fn new() -> Self {
        let current_delay = 0.1;
        Self {
            server_time: 0.0,
            render_time: -current_delay,
            target_delay: 0.1,
            current_delay,
        }
    }

    pub fn current_delay(&self) -> f32 {
        self.current_delay
    }

    /// Adopts the server clock on connect.
    pub fn start(&mut self, server_time: f32) {
        self.server_time = server_time;
        self.render_time = server_time - self.current_delay;
    }

    /// Ideally zero drift, but the local estimate wanders; a large
    /// disagreement with an authoritative timestamp snaps the clock.
    pub fn sync_to_snapshot(&mut self, snapshot_time: f32) {
        if (snapshot_time - self.server_time).abs() > TIME_SYNC_LARGE_CORRECTION {
            self.server_time = snapshot_time;
        }
    }

    /// Adjusts the delay target from how much buffered future remains.
    /// Starved of future snapshots: back off. Swimming in them: close in.
    pub fn adjust_target_delay(&mut self, newest_snapshot_time: f32) {
        let future_buffer = newest_snapshot_time - self.render_time;

        if future_buffer < MIN_DELAY {
            self.target_delay += DELAY_ADJUST_STEP;
        } else if future_buffer > MAX_DELAY {
            self.target_delay -= DELAY_ADJUST_STEP;
        }

        self.target_delay = self.target_delay.clamp(MIN_DELAY, MAX_DELAY);
    }

    /// Advances render time by dt, slews the applied delay toward its
    /// target and corrects drift: snap when hopeless, hurry when large,
    /// nudge otherwise.
    pub fn advance(&mut self, dt: f32) {
        self.render_time += dt;

        let delay_diff = self.target_delay - self.current_delay;
        self.current_delay += delay_diff * INTERP_TRANSITION_SPEED * dt;

        let target_render_time = self.server_time - self.current_delay;
        let error = target_render_time - self.render_time;

        if error.abs() > RENDER_TIME_SNAP {
            self.render_time = target_render_time;
        } else if error.abs() > 0.001 {
            let correction_speed = if error.abs() > 0.1 {
                TIME_CORRECTION_LARGE
            } else {
                TIME_CORRECTION_MEDIUM
            };
            self.render_time += error * correction_speed * dt;
        }
    }
}

/// The bracketing pair for a render time and the blend factor between
/// them: before player 1 at (0,0,0), after at (0,0,1), t = 0.9 renders
/// player 1 at (0,0,0.9).
pub fn select_pair(
    snapshots: &VecDeque<Snapshot>,
    render_time: f32,
) -> Option<(&Snapshot, &Snapshot, f32)> {
    if snapshots.len() < 2 {
        return None;
    }

    for i in 0..snapshots.len() - 1 {
        let current = &snapshots[i];
        let next = &snapshots[i + 1];

        if current.timestamp <= render_time && next.timestamp >= render_time {
            // The selected pair stays the same across several frames with
            // t walking from 0 toward 1; when everything runs smoothly
            // `next` then becomes `current`.
            let duration = next.timestamp - current.timestamp;
            let t = if duration > 0.001 {
                ((render_time - current.timestamp) / duration).clamp(0.0, 1.0)
            } else {
                0.0
            };
            return Some((current, next, t));
        }
    }

    None
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

fn interpolate_pair(before: &Player, after: &Player, t: f32) -> Player {
    let mut result = Player {
        player_idx: before.player_idx,
        ..Player::default()
    };

    // Snapshots are frequent enough that blending between them doesn't
    // paint a false picture — what meaningful change of direction fits in
    // a twentieth of a second? Deaths and respawns are the exception.
    let position_delta = (after.position - before.position).length();
    let discontinuity = position_delta > TELEPORT_THRESHOLD
        || before.health == 0
        || after.health > before.health;

    if discontinuity {
        result.position = after.position;
        result.velocity = after.velocity;
        result.yaw = after.yaw;
        result.pitch = after.pitch;
    } else {
        result.position = before.position.lerp(after.position, t);
        result.velocity = before.velocity.lerp(after.velocity, t);

        // Yaw blends along the short way around the circle.
        let mut yaw_diff = after.yaw - before.yaw;
        if yaw_diff > PI {
            yaw_diff -= 2.0 * PI;
        }
        if yaw_diff < -PI {
            yaw_diff += 2.0 * PI;
        }
        result.yaw = before.yaw + yaw_diff * t;
        result.pitch = lerp(before.pitch, after.pitch, t);
    }

    result.health = after.health;
    result.on_ground = after.on_ground;
    result
}

/// Builds the frame of remote players to draw at `render_time`. Slots
/// missing from either bracketing snapshot are skipped; the local player
/// is drawn from prediction, not from this.
pub fn interpolated_frame(snapshots: &VecDeque<Snapshot>, render_time: f32) -> Vec<Player> {
    let Some((before, after, t)) = select_pair(snapshots, render_time) else {
        return Vec::new();
    };

    let mut frame = Vec::new();
    for idx in 0..MAX_PLAYERS {
        let b = &before.players[idx];
        let a = &after.players[idx];

        if !b.active() || !a.active() || b.player_idx != a.player_idx {
            continue;
        }

        frame.push(interpolate_pair(b, a, t));
    }

    frame
}
