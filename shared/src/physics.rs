//! Deterministic player movement shared by server authority and client
//! prediction.
//!
//! Movement is velocity integration plus sphere-vs-OBB collision response;
//! there are no higher derivatives to simulate. The split matches how the
//! netcode consumes it: [`apply_input`] turns one `InputMessage` into
//! velocity and look changes, [`apply_physics`] integrates and resolves
//! collisions. Both must be bit-identical across hosts — any divergence
//! shows up as permanent reconciliation error on the client — so nothing
//! in here may touch randomness or wall-clock time.

use crate::geom::{self, Sphere};
use crate::map::Map;
use crate::protocol::InputMessage;
use crate::{Player, INPUT_BUTTON_JUMP, MAX_JUMPS, PLAYER_RADIUS};
use glam::{Vec2, Vec3};

pub const GRAVITY: f32 = 20.0;
pub const JUMP_VELOCITY: f32 = 14.0;
pub const DOUBLE_JUMP_VELOCITY: f32 = 14.0;
pub const GROUND_SPEED: f32 = 25.0;
pub const GROUND_ACCEL: f32 = 35.0;

pub const WALLRUN_MIN_SPEED: f32 = 15.0;
pub const WALLRUN_SPEED: f32 = 22.0;
pub const WALLRUN_JUMP_OUT: f32 = 15.0;
pub const WALLRUN_JUMP_UP: f32 = 10.0;

/// Radius multiplier for the stay-attached test; without the slack the
/// collision response makes wall-running oscillate between attach and
/// detach every frame.
const WALLRUN_DETACH_RADIUS: f32 = 1.2;

fn is_wall_surface(normal: Vec3) -> bool {
    normal.y.abs() < 0.3
}

/// Applies one input message: look angles, desired movement and jumps.
pub fn apply_input(player: &mut Player, input: &InputMessage, dt: f32) {
    player.yaw = input.look_yaw;
    player.pitch = input.look_pitch;

    let forward = Vec3::new(player.yaw.cos(), 0.0, player.yaw.sin());
    let right = Vec3::new(-forward.z, 0.0, forward.x);
    let mut movement = forward * -input.move_z + right * input.move_x;

    if movement.length() > 0.001 {
        movement = movement.normalize();
    }

    if player.wall_running {
        // Lock horizontal speed to the wall-run speed along the current
        // direction; input only nudges, it doesn't steer freely.
        let current_dir = Vec3::new(player.velocity.x, 0.0, player.velocity.z);
        if current_dir.length() > 0.1 {
            let current_dir = current_dir.normalize();
            player.velocity.x = current_dir.x * WALLRUN_SPEED;
            player.velocity.z = current_dir.z * WALLRUN_SPEED;
        }

        player.velocity.x += movement.x * 2.0;
        player.velocity.z += movement.z * 2.0;
    } else {
        let target_vel = movement * GROUND_SPEED;
        let vel_diff = target_vel - Vec3::new(player.velocity.x, 0.0, player.velocity.z);

        player.velocity.x += vel_diff.x * GROUND_ACCEL * dt;
        player.velocity.z += vel_diff.z * GROUND_ACCEL * dt;
    }

    if input.buttons & INPUT_BUTTON_JUMP != 0 {
        if player.on_ground {
            player.velocity.y = JUMP_VELOCITY;
            player.jumps_remaining = MAX_JUMPS - 1;
        } else if player.wall_running {
            player.velocity = player.wall_normal * WALLRUN_JUMP_OUT;
            player.velocity.y = WALLRUN_JUMP_UP;
            player.wall_running = false;
            player.jumps_remaining = MAX_JUMPS - 1;
        } else if player.jumps_remaining > 0 {
            player.velocity.y = DOUBLE_JUMP_VELOCITY;
            player.jumps_remaining -= 1;
        }
    }
}

/// Integrates one step: gravity, wall-run bookkeeping, axis-swept collision
/// resolution against the map and depenetration against other players.
pub fn apply_physics(player: &mut Player, map: &Map, all_players: &[Player], dt: f32) {
    if player.position.y <= PLAYER_RADIUS {
        player.position.y = PLAYER_RADIUS;
        player.on_ground = true;
        player.jumps_remaining = MAX_JUMPS;
        player.wall_running = false;

        if player.velocity.y < 0.0 {
            player.velocity.y = 0.0;
        }
    } else if player.wall_running {
        player.on_ground = false;
        player.velocity.y = 0.0;
    } else {
        player.on_ground = false;
        player.velocity.y -= GRAVITY * dt;
    }

    let obstacles = &map.obstacles;

    if player.wall_running {
        // Still touching the wall we attached to? Test with a slightly
        // inflated radius so the resolved contact doesn't flicker us off.
        let current_sphere = Sphere {
            center: player.position,
            radius: PLAYER_RADIUS * WALLRUN_DETACH_RADIUS,
        };
        match obstacles.get(player.wall_index as usize) {
            Some(wall) if geom::sphere_vs_obb(&current_sphere, wall).is_some() => {}
            _ => player.wall_running = false,
        }
    }

    let movement = player.velocity * dt;
    let mut new_position = player.position;

    let axes = [
        Vec3::new(movement.x, 0.0, 0.0),
        Vec3::new(0.0, 0.0, movement.z),
        Vec3::new(0.0, movement.y, 0.0),
    ];
    let vel_indices = [0usize, 2, 1];

    for (i, axis) in axes.iter().enumerate() {
        let test_pos = new_position + *axis;
        let test_sphere = Sphere {
            center: test_pos,
            radius: PLAYER_RADIUS,
        };

        let mut collided = false;
        let mut collision_contact = geom::Contact::default();

        for (index, obb) in obstacles.iter().enumerate() {
            let Some(contact) = geom::sphere_vs_obb(&test_sphere, obb) else {
                continue;
            };

            collided = true;
            collision_contact = contact;

            if !player.on_ground && !player.wall_running && is_wall_surface(contact.normal) {
                let horiz_vel = Vec2::new(player.velocity.x, player.velocity.z);
                let horiz_speed = horiz_vel.length();

                if horiz_speed < WALLRUN_MIN_SPEED {
                    continue;
                }

                player.wall_running = true;
                player.wall_index = index as i16;
                player.wall_normal = contact.normal;
                player.velocity.y = 0.0;
                player.jumps_remaining = MAX_JUMPS;

                // Redirect the horizontal velocity along the wall. If the
                // approach was head-on there is no along-wall component, so
                // fall back to the wall's tangent on whichever side the
                // player was drifting toward.
                let wall_normal_2d = Vec2::new(player.wall_normal.x, player.wall_normal.z);
                let into_wall = horiz_vel.dot(wall_normal_2d);
                let mut along_wall = horiz_vel - wall_normal_2d * into_wall;

                if along_wall.length() > 0.1 {
                    along_wall = along_wall.normalize() * WALLRUN_SPEED;
                } else {
                    let mut wall_right = Vec3::Y.cross(player.wall_normal);
                    if Vec3::new(horiz_vel.x, 0.0, horiz_vel.y).dot(wall_right) < 0.0 {
                        wall_right = -wall_right;
                    }
                    along_wall = Vec2::new(wall_right.x, wall_right.z) * WALLRUN_SPEED;
                }

                player.velocity.x = along_wall.x;
                player.velocity.z = along_wall.y;
            }
        }

        if !collided {
            new_position = test_pos;
            continue;
        }

        let is_walkable = collision_contact.normal.y > 0.25;

        // Horizontal moves into a walkable slope get projected along the
        // surface instead of stopping dead.
        if is_walkable && i < 2 {
            let axis_length = axis.length();
            let move_dir = *axis / axis_length;
            let into_surface = move_dir.dot(collision_contact.normal);

            if into_surface < 0.0 {
                let projected =
                    (move_dir - collision_contact.normal * into_surface) * axis_length;
                let slope_test_pos = new_position + projected;
                let slope_sphere = Sphere {
                    center: slope_test_pos,
                    radius: PLAYER_RADIUS,
                };

                let slope_blocked = obstacles
                    .iter()
                    .any(|obb| geom::sphere_vs_obb(&slope_sphere, obb).is_some());

                if !slope_blocked {
                    new_position = slope_test_pos;
                    collided = false;
                }
            }
        }

        if collided {
            player.velocity[vel_indices[i]] = 0.0;

            if i == 2 && movement.y < 0.0 {
                player.on_ground = true;
                player.wall_running = false;
            }
        }
    }

    player.position = new_position;

    let own_sphere = Sphere {
        center: player.position,
        radius: PLAYER_RADIUS,
    };

    for other in all_players {
        if !other.active() || other.player_idx == player.player_idx {
            continue;
        }

        let other_sphere = Sphere {
            center: other.position,
            radius: PLAYER_RADIUS,
        };
        if let Some(contact) = geom::sphere_vs_sphere(&own_sphere, &other_sphere) {
            player.position -= contact.normal * contact.depth;
        }
    }
}
