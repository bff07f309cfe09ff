//! The arena every process generates for itself.
//!
//! Server, clients and bots all build the identical obstacle list from this
//! procedure, so geometry never travels over the wire. Spawn selection is the
//! one place randomness is allowed and it only ever runs on the server.

use crate::geom::{self, Obb, Ray, RayHit, Sphere};
use crate::PLAYER_RADIUS;
use glam::{Quat, Vec3};
use rand::Rng;

pub const MAP_BOUNDS_MIN: f32 = -60.0;
pub const MAP_BOUNDS_MAX: f32 = 60.0;

const SPAWN_ATTEMPT_COUNT: u32 = 50;
const SPAWN_RANDOM_RANGE: i32 = 60;
const SPAWN_RANDOM_OFFSET: i32 = 20;
const SPAWN_TEST_HEIGHT: f32 = 2.0;
const SPAWN_RAYCAST_DISTANCE: f32 = 20.0;
const SPAWN_GROUND_OFFSET: f32 = 1.0;
const SPAWN_DEFAULT_POSITION: Vec3 = Vec3::new(0.0, 2.0, 0.0);

/// Immutable arena geometry: floor, perimeter walls, and the obstacle
/// course in between. Order matters; players reference walls by index.
pub struct Map {
    pub obstacles: Vec<Obb>,
}

fn rotated_box(center: Vec3, half_extents: Vec3, axis: Vec3, angle_degrees: f32) -> Obb {
    let rotation = Quat::from_axis_angle(axis.normalize(), angle_degrees.to_radians());
    Obb::with_rotation(center, half_extents, rotation)
}

pub fn generate() -> Map {
    let mut obstacles = Vec::new();

    // Floor
    obstacles.push(Obb::new(Vec3::new(0.0, -1.0, 0.0), Vec3::new(60.0, 0.5, 60.0)));

    // Perimeter walls
    obstacles.push(Obb::new(Vec3::new(0.0, 4.0, -60.0), Vec3::new(60.0, 8.0, 0.5)));
    obstacles.push(Obb::new(Vec3::new(0.0, 4.0, 60.0), Vec3::new(60.0, 8.0, 0.5)));
    obstacles.push(Obb::new(Vec3::new(-60.0, 4.0, 0.0), Vec3::new(0.5, 8.0, 60.0)));
    obstacles.push(Obb::new(Vec3::new(60.0, 4.0, 0.0), Vec3::new(0.5, 8.0, 60.0)));

    // Long run walls
    obstacles.push(Obb::new(Vec3::new(-20.0, 3.0, 30.0), Vec3::new(15.0, 6.0, 0.5)));
    obstacles.push(Obb::new(Vec3::new(20.0, 3.0, 30.0), Vec3::new(15.0, 6.0, 0.5)));
    obstacles.push(Obb::new(Vec3::new(-20.0, 3.0, -30.0), Vec3::new(15.0, 6.0, 0.5)));
    obstacles.push(Obb::new(Vec3::new(20.0, 3.0, -30.0), Vec3::new(15.0, 6.0, 0.5)));
    obstacles.push(Obb::new(Vec3::new(-30.0, 3.0, 20.0), Vec3::new(0.5, 6.0, 15.0)));
    obstacles.push(Obb::new(Vec3::new(-30.0, 3.0, -20.0), Vec3::new(0.5, 6.0, 15.0)));
    obstacles.push(Obb::new(Vec3::new(30.0, 3.0, 20.0), Vec3::new(0.5, 6.0, 15.0)));
    obstacles.push(Obb::new(Vec3::new(30.0, 3.0, -20.0), Vec3::new(0.5, 6.0, 15.0)));

    // Corner pockets
    obstacles.push(Obb::new(Vec3::new(40.0, 3.0, 35.0), Vec3::new(8.0, 6.0, 0.5)));
    obstacles.push(Obb::new(Vec3::new(45.0, 3.0, 40.0), Vec3::new(0.5, 6.0, 8.0)));
    obstacles.push(Obb::new(Vec3::new(-40.0, 3.0, 35.0), Vec3::new(8.0, 6.0, 0.5)));
    obstacles.push(Obb::new(Vec3::new(-45.0, 3.0, 40.0), Vec3::new(0.5, 6.0, 8.0)));
    obstacles.push(Obb::new(Vec3::new(40.0, 3.0, -35.0), Vec3::new(8.0, 6.0, 0.5)));
    obstacles.push(Obb::new(Vec3::new(45.0, 3.0, -40.0), Vec3::new(0.5, 6.0, 8.0)));
    obstacles.push(Obb::new(Vec3::new(-40.0, 3.0, -35.0), Vec3::new(8.0, 6.0, 0.5)));
    obstacles.push(Obb::new(Vec3::new(-45.0, 3.0, -40.0), Vec3::new(0.5, 6.0, 8.0)));

    // Center lane
    obstacles.push(Obb::new(Vec3::new(-12.0, 2.5, 0.0), Vec3::new(0.5, 5.0, 18.0)));
    obstacles.push(Obb::new(Vec3::new(12.0, 2.5, 0.0), Vec3::new(0.5, 5.0, 18.0)));

    // Pillars
    obstacles.push(Obb::new(Vec3::new(25.0, 3.5, 15.0), Vec3::new(2.0, 7.0, 2.0)));
    obstacles.push(Obb::new(Vec3::new(-25.0, 3.5, 15.0), Vec3::new(2.0, 7.0, 2.0)));
    obstacles.push(Obb::new(Vec3::new(25.0, 3.5, -15.0), Vec3::new(2.0, 7.0, 2.0)));
    obstacles.push(Obb::new(Vec3::new(-25.0, 3.5, -15.0), Vec3::new(2.0, 7.0, 2.0)));

    // Low cover near the middle
    obstacles.push(Obb::new(Vec3::new(0.0, 1.5, 10.0), Vec3::new(6.0, 3.0, 0.5)));
    obstacles.push(Obb::new(Vec3::new(0.0, 1.5, -10.0), Vec3::new(6.0, 3.0, 0.5)));

    obstacles.push(Obb::new(Vec3::new(35.0, 2.0, 0.0), Vec3::new(0.5, 4.0, 8.0)));
    obstacles.push(Obb::new(Vec3::new(-35.0, 2.0, 0.0), Vec3::new(0.5, 4.0, 8.0)));
    obstacles.push(Obb::new(Vec3::new(0.0, 2.0, 40.0), Vec3::new(8.0, 4.0, 0.5)));
    obstacles.push(Obb::new(Vec3::new(0.0, 2.0, -40.0), Vec3::new(8.0, 4.0, 0.5)));

    // Jump blocks
    obstacles.push(Obb::new(Vec3::new(15.0, 1.0, 25.0), Vec3::new(2.0, 2.0, 2.0)));
    obstacles.push(Obb::new(Vec3::new(-15.0, 1.0, 25.0), Vec3::new(2.0, 2.0, 2.0)));
    obstacles.push(Obb::new(Vec3::new(15.0, 1.0, -25.0), Vec3::new(2.0, 2.0, 2.0)));
    obstacles.push(Obb::new(Vec3::new(-15.0, 1.0, -25.0), Vec3::new(2.0, 2.0, 2.0)));

    // Ramps
    obstacles.push(rotated_box(
        Vec3::new(0.0, 1.0, 20.0),
        Vec3::new(5.0, 0.5, 8.0),
        Vec3::X,
        30.0,
    ));
    obstacles.push(rotated_box(
        Vec3::new(0.0, 1.0, -20.0),
        Vec3::new(5.0, 0.5, 8.0),
        Vec3::X,
        -30.0,
    ));

    Map { obstacles }
}

/// True when nothing blocks the segment between `from` and `to`.
pub fn line_of_sight(map: &Map, from: Vec3, to: Vec3) -> bool {
    let delta = to - from;
    let dist = delta.length();
    if dist < 0.001 {
        return true;
    }

    let ray = Ray {
        origin: from,
        direction: delta / dist,
        length: dist,
    };

    for obb in &map.obstacles {
        if let Some(hit) = geom::raycast_obb(&ray, obb) {
            if hit.distance < dist - 0.5 {
                return false;
            }
        }
    }
    true
}

/// True when a player-sized sphere at `pos` touches no obstacle.
pub fn is_clear(map: &Map, pos: Vec3) -> bool {
    let test = Sphere {
        center: pos,
        radius: PLAYER_RADIUS,
    };
    map.obstacles
        .iter()
        .all(|obb| geom::sphere_vs_obb(&test, obb).is_none())
}

/// Picks a collision-free spawn position, dropped onto whatever ground a
/// downward ray finds. Falls back to the arena center when every attempt
/// lands inside geometry.
pub fn spawn_point(map: &Map) -> Vec3 {
    let mut rng = rand::thread_rng();

    for _ in 0..SPAWN_ATTEMPT_COUNT {
        let x = (rng.gen_range(0..SPAWN_RANDOM_RANGE) - SPAWN_RANDOM_OFFSET) as f32;
        let z = (rng.gen_range(0..SPAWN_RANDOM_RANGE) - SPAWN_RANDOM_OFFSET) as f32;
        let mut pos = Vec3::new(x, SPAWN_TEST_HEIGHT, z);

        if !is_clear(map, pos) {
            continue;
        }

        let down_ray = Ray {
            origin: pos,
            direction: Vec3::NEG_Y,
            length: SPAWN_RAYCAST_DISTANCE,
        };
        let mut closest_ground = SPAWN_RAYCAST_DISTANCE;
        for obb in &map.obstacles {
            if let Some(hit) = geom::raycast_obb(&down_ray, obb) {
                if hit.distance < closest_ground {
                    closest_ground = hit.distance;
                }
            }
        }

        pos.y -= closest_ground - PLAYER_RADIUS - SPAWN_GROUND_OFFSET;
        return pos;
    }

    SPAWN_DEFAULT_POSITION
}

/// Nearest obstacle intersection along `ray`, if any.
pub fn raycast(map: &Map, ray: &Ray) -> Option<RayHit> {
    let mut closest: Option<RayHit> = None;
    for obb in &map.obstacles {
        if let Some(hit) = geom::raycast_obb(ray, obb) {
            if closest.map_or(true, |c| hit.distance < c.distance) {
                closest = Some(hit);
            }
        }
    }
    closest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_is_deterministic() {
        let a = generate();
        let b = generate();
        assert_eq!(a.obstacles.len(), b.obstacles.len());
        for (x, y) in a.obstacles.iter().zip(&b.obstacles) {
            assert_eq!(x.center, y.center);
            assert_eq!(x.half_extents, y.half_extents);
            assert_eq!(x.rotation, y.rotation);
        }
    }

    #[test]
    fn floor_comes_first() {
        let map = generate();
        assert_eq!(map.obstacles[0].center.y, -1.0);
        assert!(map.obstacles.len() > 30);
    }

    #[test]
    fn walls_block_line_of_sight() {
        let map = generate();
        // The center lane wall at x = 12 sits between these two points.
        let a = Vec3::new(5.0, 2.0, 0.0);
        let b = Vec3::new(20.0, 2.0, 0.0);
        assert!(!line_of_sight(&map, a, b));

        // Nothing between two points hovering over the middle of a lane.
        let c = Vec3::new(0.0, 2.0, -5.0);
        let d = Vec3::new(0.0, 2.0, 5.0);
        assert!(line_of_sight(&map, c, d));
    }

    #[test]
    fn spawn_points_are_collision_free() {
        let map = generate();
        for _ in 0..20 {
            let pos = spawn_point(&map);
            assert!(pos.y > 0.0, "spawn {pos} sank below the floor");
            assert!(is_clear(&map, pos), "spawn {pos} intersects geometry");
        }
    }

    #[test]
    fn clear_check_rejects_wall_interior() {
        let map = generate();
        assert!(!is_clear(&map, Vec3::new(60.0, 4.0, 0.0)));
        assert!(is_clear(&map, Vec3::new(0.0, 2.0, 0.0)));
    }
}
