//! Rule-driven bot clients.
//!
//! A bot talks to the server exactly like a human client does — its own
//! transport, a connect handshake, one input message per tick — but the
//! inputs come from a small state machine instead of a keyboard. From the
//! map geometry each bot derives a set of reachable waypoints to wander
//! between and uses line-of-sight checks to pick fights.

use crate::ClientError;
use glam::{Vec2, Vec3};
use log::{info, warn};
use rand::Rng;
use shared::codec;
use shared::map::{self, Map};
use shared::net::{Transport, UnknownSenderPolicy};
use shared::protocol::{ConnectAccept, ConnectRequest, InputMessage, MessageType, SnapshotMessage};
use shared::{
    Player, INPUT_BUTTON_SHOOT, MAX_PLAYERS, PLAYER_EYE_HEIGHT, PLAYER_RADIUS, SERVER_PORT,
    TICK_TIME,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::thread;
use std::time::{Duration, Instant};

const MAX_WAYPOINTS: usize = 64;
const WAYPOINT_SPACING: f32 = 3.0;

const MOVE_SPEED_SLOW: f32 = 0.5;
const MOVE_SPEED_NORMAL: f32 = 0.8;
const MOVE_SPEED_FAST: f32 = 1.0;

const DIST_WAYPOINT_REACHED: f32 = 3.0;
const DIST_WAYPOINT_MIN: f32 = 6.0;
const DIST_ENGAGE_CLOSE: f32 = 7.0;
const DIST_ENGAGE_FAR: f32 = 12.0;
const DIST_SEARCH_RADIUS: f32 = 30.0;

const TIME_WANDER_MAX: f32 = 12.0;
const TIME_SHOOT_BASE: f32 = 0.25;
const TIME_SHOOT_RETREAT: f32 = 0.3;
const TIME_SHOOT_VARIANCE: f32 = 0.4;

const HEALTH_RETREAT_THRESHOLD: u8 = 40;
const AIM_ERROR_ENGAGE: f32 = 0.25;
const AIM_ERROR_RETREAT: f32 = 0.3;

const MAX_COVER_POINTS: usize = 64;
const COVER_MIN_HEIGHT: f32 = 2.0;
const COVER_TANGENT_OFFSET: f32 = 0.3;
const COVER_STANDOFF_MULT: f32 = 1.5;
const COVER_PROTECTION_DOT: f32 = -0.3;
const DIST_COVER_REACHED: f32 = 2.0;

const CONNECT_WAIT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BotGoal {
    Wander,
    Engage,
    Retreat,
}

/// A standing spot beside an obstacle tall enough to hide behind, with
/// the direction it protects against.
#[derive(Debug, Clone, Copy)]
struct CoverPoint {
    position: Vec3,
    protected_direction: Vec3,
}

/// Spawns `count` bot threads (bounded to leave one slot for a human) and
/// blocks until they exit, which they only do when the server goes away.
pub fn run_npcs(server_ip: Ipv4Addr, count: usize) -> Result<(), ClientError> {
    let count = count.min(MAX_PLAYERS - 1);
    let mut handles = Vec::with_capacity(count);

    for i in 0..count {
        let name = format!("bot_{i}");
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Err(e) = run_npc(server_ip, &name) {
                    warn!("{name} exited: {e}");
                }
            })
            .map_err(ClientError::Thread)?;
        handles.push(handle);
    }

    info!("waiting for {} bot threads", handles.len());
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

/// Reachable standing positions sampled over the arena on a coarse grid.
fn generate_waypoints(map: &Map) -> Vec<Vec3> {
    let mut waypoints = Vec::new();
    let stand_height = PLAYER_RADIUS + PLAYER_EYE_HEIGHT;

    let mut x = map::MAP_BOUNDS_MIN;
    'grid: while x <= map::MAP_BOUNDS_MAX {
        let mut z = map::MAP_BOUNDS_MIN;
        while z <= map::MAP_BOUNDS_MAX {
            if waypoints.len() >= MAX_WAYPOINTS {
                break 'grid;
            }
            let pos = Vec3::new(x, stand_height, z);
            if map::is_clear(map, pos) {
                waypoints.push(pos);
            }
            z += WAYPOINT_SPACING;
        }
        x += WAYPOINT_SPACING;
    }

    waypoints
}

/// Samples standing positions along the faces of tall obstacles. Each
/// face yields up to three candidates offset along its tangent; a
/// candidate survives if a player can actually stand there.
fn generate_cover_points(map: &Map) -> Vec<CoverPoint> {
    let mut cover = Vec::new();
    let stand_height = PLAYER_RADIUS + PLAYER_EYE_HEIGHT;

    let faces: [(Vec3, Vec3); 4] = [
        (Vec3::X, Vec3::Z),
        (Vec3::NEG_X, Vec3::Z),
        (Vec3::Z, Vec3::X),
        (Vec3::NEG_Z, Vec3::X),
    ];

    'boxes: for obb in &map.obstacles {
        let size = obb.half_extents * 2.0;
        if size.y < COVER_MIN_HEIGHT {
            continue;
        }

        for (normal, tangent) in faces {
            for i in -1i32..=1 {
                if cover.len() >= MAX_COVER_POINTS {
                    break 'boxes;
                }

                let t = i as f32 * COVER_TANGENT_OFFSET;
                let offset = tangent * t * (size * tangent).length();
                let face_center = obb.center + normal * size * 0.5;
                let mut sample = face_center + offset;

                sample += normal * (PLAYER_RADIUS * COVER_STANDOFF_MULT);
                sample.y = stand_height;

                if map::is_clear(map, sample) {
                    cover.push(CoverPoint {
                        position: sample,
                        protected_direction: normal,
                    });
                }
            }
        }
    }

    cover
}

/// The nearest reachable cover point whose obstacle actually blocks the
/// threat direction.
fn find_best_cover(
    cover: &[CoverPoint],
    from: Vec3,
    threat_direction: Vec3,
    map: &Map,
) -> Option<Vec3> {
    let mut best: Option<(Vec3, f32)> = None;

    for point in cover {
        // Would this face block the threat?
        if point.protected_direction.dot(threat_direction) > COVER_PROTECTION_DOT {
            continue;
        }
        if !map::line_of_sight(map, from, point.position) {
            continue;
        }

        let dist = (point.position - from).length();
        if best.map_or(true, |(_, d)| dist < d) {
            best = Some((point.position, dist));
        }
    }

    best.map(|(position, _)| position)
}

fn aim_angles(from: Vec3, to: Vec3) -> (f32, f32) {
    let delta = to - from;
    let yaw = delta.z.atan2(delta.x);
    let pitch = delta.y.atan2(Vec2::new(delta.x, delta.z).length());
    (yaw, pitch)
}

fn jittered_aim_point(target: Vec3, error_radius: f32) -> Vec3 {
    let mut rng = rand::thread_rng();
    target
        + Vec3::new(
            rng.gen_range(-1.0..1.0) * error_radius,
            rng.gen_range(-1.0..1.0) * error_radius,
            rng.gen_range(-1.0..1.0) * error_radius,
        )
}

fn shoot_cooldown(retreating: bool) -> f32 {
    let base = if retreating {
        TIME_SHOOT_RETREAT
    } else {
        TIME_SHOOT_BASE
    };
    base + rand::thread_rng().gen_range(0.0..TIME_SHOOT_VARIANCE)
}

fn pick_waypoint(waypoints: &[Vec3], from: Vec3, map: &Map) -> Option<Vec3> {
    let mut rng = rand::thread_rng();

    let visible: Vec<Vec3> = waypoints
        .iter()
        .copied()
        .filter(|wp| {
            let dist = (*wp - from).length();
            dist > DIST_WAYPOINT_MIN
                && dist < DIST_SEARCH_RADIUS
                && map::line_of_sight(map, from, *wp)
        })
        .collect();

    if !visible.is_empty() {
        return Some(visible[rng.gen_range(0..visible.len())]);
    }

    // Nothing visible: head for the closest waypoint that isn't right
    // under our feet.
    waypoints
        .iter()
        .copied()
        .filter(|wp| (*wp - from).length() > DIST_WAYPOINT_MIN)
        .min_by(|a, b| {
            (*a - from)
                .length()
                .total_cmp(&(*b - from).length())
        })
}

fn closest_visible_enemy(
    players: &[Player],
    my_idx: i8,
    my_pos: Vec3,
    map: &Map,
) -> Option<(Vec3, f32)> {
    let mut best: Option<(Vec3, f32)> = None;

    for player in players {
        if !player.active() || player.player_idx == my_idx || !player.alive() {
            continue;
        }

        let dist = (player.position - my_pos).length();
        if dist >= best.map_or(DIST_SEARCH_RADIUS, |(_, d)| d) {
            continue;
        }

        let eye = my_pos + Vec3::new(0.0, PLAYER_EYE_HEIGHT, 0.0);
        if map::line_of_sight(map, eye, player.position) {
            best = Some((player.position, dist));
        }
    }

    best
}

fn run_npc(server_ip: Ipv4Addr, name: &str) -> Result<(), ClientError> {
    let mut net = Transport::bind(Ipv4Addr::UNSPECIFIED, 0)?;
    net.set_unknown_sender_policy(UnknownSenderPolicy::Discard);

    let server_addr = SocketAddr::from((server_ip, SERVER_PORT));
    let Some(server_peer) = net.add_peer(server_addr) else {
        return Err(ClientError::AddPeer);
    };
    net.send_reliable(server_peer, &ConnectRequest::new(name));

    let map = map::generate();
    let waypoints = generate_waypoints(&map);
    let cover_points = generate_cover_points(&map);

    let mut my_idx: i8 = -1;
    let mut my_pos = Vec3::ZERO;
    let mut my_health: u8 = shared::STARTING_HEALTH;
    let mut players: Vec<Player> = Vec::with_capacity(MAX_PLAYERS);
    let mut server_time = 0.0f32;
    let mut input_seq = 0u32;

    let mut goal = BotGoal::Wander;
    let mut goal_timer = 0.0f32;
    let mut target_position: Option<Vec3> = None;
    let mut cooldown = 0.0f32;
    let mut yaw = 0.0f32;
    let mut pitch = 0.0f32;

    loop {
        let frame_start = Instant::now();

        if net.update(TICK_TIME).contains(&server_peer) {
            return Err(ClientError::ConnectionLost);
        }

        while let Some(polled) = net.poll() {
            match MessageType::from_u8(polled.msg_type) {
                Some(MessageType::ConnectAccept) => {
                    if let Ok(accept) =
                        shared::protocol::decode::<ConnectAccept>(net.payload(&polled))
                    {
                        my_idx = accept.player_index;
                        server_time = accept.server_time;
                        info!("{name} connected as player index {my_idx}");
                    }
                }
                Some(MessageType::ServerSnapshot) => {
                    if let Ok(snap) =
                        shared::protocol::decode::<SnapshotMessage>(net.payload(&polled))
                    {
                        server_time = snap.server_time;
                        players.clear();
                        for q in &snap.players[..(snap.player_count as usize).min(MAX_PLAYERS)] {
                            let player = codec::dequantize_player(q);
                            if player.player_idx == my_idx {
                                my_pos = player.position;
                                my_health = player.health;
                            }
                            players.push(player);
                        }
                    }
                }
                _ => {}
            }
            net.release(&polled);
        }

        if my_idx < 0 {
            thread::sleep(CONNECT_WAIT);
            continue;
        }

        server_time += TICK_TIME;
        cooldown -= TICK_TIME;
        goal_timer += TICK_TIME;

        let enemy = closest_visible_enemy(&players, my_idx, my_pos, &map);

        let next_goal = match enemy {
            Some(_) if my_health < HEALTH_RETREAT_THRESHOLD => BotGoal::Retreat,
            Some(_) => BotGoal::Engage,
            None => BotGoal::Wander,
        };
        if next_goal != goal {
            goal = next_goal;
            goal_timer = 0.0;
            target_position = None;

            if goal == BotGoal::Retreat {
                if let Some((enemy_pos, _)) = enemy {
                    let threat_dir = (enemy_pos - my_pos).normalize_or_zero();
                    target_position = find_best_cover(&cover_points, my_pos, threat_dir, &map);
                    if target_position.is_some() {
                        info!("{name} retreating to cover");
                    }
                }
            }
        }

        let mut move_x = 0.0f32;
        let mut move_z = 0.0f32;
        let mut buttons = 0u8;

        match goal {
            BotGoal::Wander => {
                if target_position.is_none() || goal_timer > TIME_WANDER_MAX {
                    target_position = pick_waypoint(&waypoints, my_pos, &map);
                    goal_timer = 0.0;
                }

                if let Some(target) = target_position {
                    if (target - my_pos).length() < DIST_WAYPOINT_REACHED {
                        target_position = None;
                    } else {
                        (yaw, pitch) = aim_angles(my_pos, target);
                        move_z = -MOVE_SPEED_NORMAL;
                    }
                }
            }
            BotGoal::Engage => {
                if let Some((enemy_pos, dist)) = enemy {
                    let aim = jittered_aim_point(enemy_pos, AIM_ERROR_ENGAGE);
                    (yaw, pitch) = aim_angles(my_pos, aim);

                    if dist > DIST_ENGAGE_FAR {
                        move_z = -MOVE_SPEED_FAST;
                    } else if dist < DIST_ENGAGE_CLOSE {
                        move_z = MOVE_SPEED_FAST;
                    } else {
                        move_x = if rand::thread_rng().gen_bool(0.5) {
                            MOVE_SPEED_SLOW
                        } else {
                            -MOVE_SPEED_SLOW
                        };
                    }

                    if cooldown <= 0.0 {
                        buttons |= INPUT_BUTTON_SHOOT;
                        cooldown = shoot_cooldown(false);
                    }
                }
            }
            BotGoal::Retreat => {
                if let Some(target) = target_position {
                    if (target - my_pos).length() < DIST_COVER_REACHED {
                        move_z = 0.0;
                    } else {
                        (yaw, pitch) = aim_angles(my_pos, target);
                        move_z = -MOVE_SPEED_FAST;
                    }
                }

                if let Some((enemy_pos, _)) = enemy {
                    // Return fire on the way, badly.
                    let aim = jittered_aim_point(enemy_pos, AIM_ERROR_RETREAT);
                    (yaw, pitch) = aim_angles(my_pos, aim);

                    if target_position.is_none() {
                        move_z = MOVE_SPEED_FAST;
                    }
                    if cooldown <= 0.0 {
                        buttons |= INPUT_BUTTON_SHOOT;
                        cooldown = shoot_cooldown(true);
                    }
                }
            }
        }

        input_seq += 1;
        let input = InputMessage {
            sequence_num: input_seq,
            move_x,
            move_z,
            look_yaw: yaw,
            look_pitch: pitch,
            buttons,
            shot_time: if buttons & INPUT_BUTTON_SHOOT != 0 {
                server_time
            } else {
                0.0
            },
            time: server_time,
        };
        net.send_unreliable(server_peer, &input);

        let elapsed = frame_start.elapsed().as_secs_f32();
        let remaining = TICK_TIME - elapsed;
        if remaining > 0.001 {
            thread::sleep(Duration::from_secs_f32(remaining));
        }
    }
}
