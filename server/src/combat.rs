//! Shot construction and the two-phase hit trace.

use shared::geom::{self, Ray};
use shared::map::Map;
use shared::{Player, Shot, MAX_PLAYERS, MAX_SHOOT_RANGE, PLAYER_RADIUS};

/// Builds the hitscan ray for a shooter: eye origin, look direction, full
/// weapon range.
pub fn create_shot(shooter: &Player, spawn_time: f32) -> Shot {
    Shot {
        shooter_idx: shooter.player_idx,
        ray: Ray {
            origin: shooter.eye_position(),
            direction: shooter.look_direction().normalize(),
            length: MAX_SHOOT_RANGE,
        },
        spawn_time,
    }
}

/// Resolves a shot against world and players, shrinking the ray to the
/// nearest hit as it goes. Obstacles are tested first so a player behind a
/// wall can never be hit; among players the closest hit wins. Returns the
/// hit player's index and truncates `shot.ray.length` either way.
pub fn trace_shot(shot: &mut Shot, map: &Map, players: &[Player; MAX_PLAYERS]) -> Option<i8> {
    let mut closest_dist = shot.ray.length;

    for obb in &map.obstacles {
        if let Some(hit) = geom::raycast_obb(&shot.ray, obb) {
            if hit.distance < closest_dist {
                closest_dist = hit.distance;
                shot.ray.length = closest_dist;
            }
        }
    }

    let mut hit_player = None;
    for player in players {
        if !player.active() || player.player_idx == shot.shooter_idx {
            continue;
        }

        if let Some(hit) = geom::raycast_sphere(&shot.ray, player.position, PLAYER_RADIUS) {
            if hit.distance < closest_dist {
                closest_dist = hit.distance;
                hit_player = Some(player.player_idx);
                shot.ray.length = closest_dist;
            }
        }
    }

    hit_player
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use shared::map;

    fn shooter_at(pos: Vec3, yaw: f32, pitch: f32) -> Player {
        Player {
            player_idx: 0,
            position: pos,
            yaw,
            pitch,
            health: 100,
            ..Player::default()
        }
    }

    fn target_at(idx: i8, pos: Vec3) -> Player {
        Player {
            player_idx: idx,
            position: pos,
            health: 100,
            ..Player::default()
        }
    }

    #[test]
    fn shot_originates_at_eye_height() {
        let shooter = shooter_at(Vec3::new(2.0, 1.0, 3.0), 0.0, 0.0);
        let shot = create_shot(&shooter, 7.0);
        assert_eq!(shot.ray.origin, Vec3::new(2.0, 1.5, 3.0));
        assert_eq!(shot.ray.length, MAX_SHOOT_RANGE);
        assert_eq!(shot.spawn_time, 7.0);
    }

    #[test]
    fn direct_hit_on_exposed_target() {
        let map = map::generate();
        let mut players = [Player::default(); MAX_PLAYERS];
        players[0] = shooter_at(Vec3::new(0.0, 1.0, 0.0), 0.0, 0.0);
        players[1] = target_at(1, Vec3::new(5.0, 1.0, 0.0));

        let mut shot = create_shot(&players[0], 0.0);
        assert_eq!(trace_shot(&mut shot, &map, &players), Some(1));
        assert!(shot.ray.length < 6.0, "ray should shrink to the hit");
    }

    #[test]
    fn wall_blocks_the_shot() {
        let map = map::generate();
        let mut players = [Player::default(); MAX_PLAYERS];
        // The center lane wall at x = 12 stands between shooter and target.
        players[0] = shooter_at(Vec3::new(5.0, 1.0, 0.0), 0.0, 0.0);
        players[1] = target_at(1, Vec3::new(20.0, 1.0, 0.0));

        let mut shot = create_shot(&players[0], 0.0);
        assert_eq!(trace_shot(&mut shot, &map, &players), None);
        // Ray stops at the wall face, short of the target.
        assert!(shot.ray.length < 8.0);
    }

    #[test]
    fn closest_of_two_targets_wins() {
        let map = map::generate();
        let mut players = [Player::default(); MAX_PLAYERS];
        players[0] = shooter_at(Vec3::new(0.0, 1.0, 0.0), 0.0, 0.0);
        // Array order has the far target first; distance must decide.
        players[1] = target_at(1, Vec3::new(9.0, 1.0, 0.0));
        players[2] = target_at(2, Vec3::new(4.0, 1.0, 0.0));

        let mut shot = create_shot(&players[0], 0.0);
        assert_eq!(trace_shot(&mut shot, &map, &players), Some(2));
    }

    #[test]
    fn shooter_is_never_their_own_target() {
        let map = map::generate();
        let mut players = [Player::default(); MAX_PLAYERS];
        players[0] = shooter_at(Vec3::new(0.0, 1.0, 0.0), 0.0, 0.0);

        let mut shot = create_shot(&players[0], 0.0);
        assert_eq!(trace_shot(&mut shot, &map, &players), None);
    }

    #[test]
    fn inactive_slots_do_not_absorb_shots() {
        let map = map::generate();
        let mut players = [Player::default(); MAX_PLAYERS];
        players[0] = shooter_at(Vec3::new(-4.0, 1.0, 0.0), 0.0, 0.0);
        players[1] = target_at(1, Vec3::new(6.0, 1.0, 0.0));
        // Empty slots sit at the origin, directly on the ray path.

        let mut shot = create_shot(&players[0], 0.0);
        assert_eq!(trace_shot(&mut shot, &map, &players), Some(1));
    }
}
