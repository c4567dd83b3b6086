//! The per-tick physics pipeline: integration, AABB contact resolution,
//! restitution impulses, contact side latching and overlap diffing.
//!
//! The contact loop is best-effort: when the iteration budget runs out,
//! residual penetration is tolerated and flagged rather than escalated.

use crate::actor::{Actor, ActorKind, ContactSides};
use shared::{Vec2, GRAVITY, KINDA_SMALL_NUMBER};
use std::collections::{HashMap, HashSet};

/// Upper bound on contact resolution passes per tick.
pub const CONTACT_ITERATIONS: usize = 8;

/// Value delivered to an actor on contact.
#[derive(Debug, Clone)]
pub struct CollisionData {
    /// Unit vector pointing away from the other actor.
    pub normal: Vec2,
    pub other_velocity: Vec2,
    pub other_restitution: f32,
    /// Infinite for non-rigidbodies.
    pub other_mass: f32,
    pub other: String,
}

/// Everything a physics step reports outward.
#[derive(Debug, Default)]
pub struct StepEvents {
    pub collisions: Vec<(String, CollisionData)>,
    pub overlap_begin: Vec<(String, String)>,
    pub overlap_end: Vec<(String, String)>,
    pub budget_exhausted: bool,
}

struct ContactAccum {
    normal_sum: Vec2,
    other: String,
    other_velocity: Vec2,
    other_restitution: f32,
    other_mass: f32,
}

/// Advances every actor by `dt` seconds.
pub fn step(actors: &mut HashMap<String, Actor>, dt: f32) -> StepEvents {
    let mut events = StepEvents::default();
    if dt <= 0.0 {
        return events;
    }

    // 1. Per-actor tick hooks: locomotion, velocity floor, gravity, drag,
    //    ground friction.
    for actor in actors.values_mut() {
        tick_body(actor, dt);
    }

    // 2. Integrate.
    for actor in actors.values_mut() {
        let velocity = match actor.body() {
            Some(body) => body.velocity,
            None => continue,
        };
        if velocity != Vec2::ZERO {
            let next = actor.position() + velocity * dt;
            actor.set_position(next);
        }
    }

    // 3. Contact resolution loop.
    let sim_names: Vec<String> = actors
        .values()
        .filter(|a| a.collidable && a.body().map(|b| b.simulate_physics).unwrap_or(false))
        .map(|a| a.name().to_string())
        .collect();

    let mut contacts: HashMap<String, ContactAccum> = HashMap::new();
    for iteration in 0..CONTACT_ITERATIONS {
        let mut corrections: HashMap<String, Vec2> = HashMap::new();

        for a_name in &sim_names {
            let a = match actors.get(a_name) {
                Some(a) => a,
                None => continue,
            };
            let (a_min, a_max) = a.bounds(0.0);
            for (b_name, b) in actors.iter() {
                if b_name == a_name || !b.collidable {
                    continue;
                }
                let (b_min, b_max) = b.bounds(0.0);
                if let Some(push) = min_push(a_min, a_max, b_min, b_max) {
                    *corrections.entry(a_name.clone()).or_default() += push;
                    note_contact(&mut contacts, push, a_name, b);
                    note_contact(&mut contacts, -push, b_name, a);
                }
            }
        }

        if corrections.is_empty() {
            break;
        }
        for (name, delta) in &corrections {
            if let Some(actor) = actors.get_mut(name) {
                let next = actor.position() + *delta;
                actor.set_position(next);
            }
        }
        if iteration == CONTACT_ITERATIONS - 1 {
            events.budget_exhausted = true;
        }
    }

    // 4. Collision events and the default bounce response.
    for (name, accum) in contacts {
        let normal = accum.normal_sum.normalized();
        if normal == Vec2::ZERO {
            continue;
        }
        let data = CollisionData {
            normal,
            other_velocity: accum.other_velocity,
            other_restitution: accum.other_restitution,
            other_mass: accum.other_mass,
            other: accum.other,
        };
        if let Some(actor) = actors.get_mut(&name) {
            apply_bounce(actor, &data);
        }
        events.collisions.push((name, data));
    }

    // 5. Contact side latch, with tolerance-expanded bounds.
    let body_names: Vec<String> = actors
        .values()
        .filter(|a| a.body().is_some())
        .map(|a| a.name().to_string())
        .collect();
    for name in &body_names {
        let mut sides = ContactSides::default();
        if let Some(a) = actors.get(name) {
            let (a_min, a_max) = a.bounds(KINDA_SMALL_NUMBER);
            for (b_name, b) in actors.iter() {
                if b_name == name || !b.collidable {
                    continue;
                }
                let (b_min, b_max) = b.bounds(0.0);
                if let Some(push) = min_push(a_min, a_max, b_min, b_max) {
                    // The push direction points away from the collider.
                    if push.x > 0.0 {
                        sides.left = true;
                    } else if push.x < 0.0 {
                        sides.right = true;
                    } else if push.y > 0.0 {
                        sides.bottom = true;
                    } else if push.y < 0.0 {
                        sides.top = true;
                    }
                }
            }
        }
        if let Some(actor) = actors.get_mut(name) {
            if let Some(body) = actor.body_mut() {
                body.contacts = sides;
            }
        }
    }

    // 6. Overlap begin/end events for sensors.
    let sensor_names: Vec<String> = actors
        .values()
        .filter(|a| a.generate_overlap_events)
        .map(|a| a.name().to_string())
        .collect();
    for name in &sensor_names {
        let mut now: HashSet<String> = HashSet::new();
        if let Some(a) = actors.get(name) {
            let (a_min, a_max) = a.bounds(KINDA_SMALL_NUMBER);
            for (b_name, b) in actors.iter() {
                if b_name == name {
                    continue;
                }
                let (b_min, b_max) = b.bounds(0.0);
                if min_push(a_min, a_max, b_min, b_max).is_some() {
                    now.insert(b_name.clone());
                }
            }
        }
        if let Some(a) = actors.get_mut(name) {
            for other in now.iter().filter(|o| !a.overlaps.contains(*o)) {
                events.overlap_begin.push((name.clone(), other.clone()));
            }
            for other in a.overlaps.iter().filter(|o| !now.contains(*o)) {
                events.overlap_end.push((name.clone(), other.clone()));
            }
            a.overlaps = now;
        }
    }

    events
}

fn tick_body(actor: &mut Actor, dt: f32) {
    // Character locomotion turns the transient move direction into velocity.
    if let ActorKind::Character(body, locomotion) = &mut actor.kind {
        if locomotion.move_direction != 0 {
            let target = locomotion.move_direction as f32 * locomotion.walk_speed;
            let control = if body.contacts.bottom {
                1.0
            } else {
                locomotion.air_control
            };
            let rate = locomotion.acceleration * control * dt;
            let delta = target - body.velocity.x;
            if delta.abs() <= rate {
                body.velocity.x = target;
            } else {
                body.velocity.x += rate * delta.signum();
            }
        }
        locomotion.move_direction = 0;
    }

    let body = match actor.body_mut() {
        Some(body) => body,
        None => return,
    };

    // Velocity floor.
    if body.velocity.x.abs() < body.min_velocity {
        body.velocity.x = 0.0;
    }
    if body.velocity.y.abs() < body.min_velocity {
        body.velocity.y = 0.0;
    }

    // Gravity, suppressed while standing on something.
    if !body.contacts.bottom {
        body.velocity.y += GRAVITY * body.gravity_scale * dt;
    }

    // Air drag.
    if body.air_resistance > 0.0 {
        let dv = body.velocity * (body.air_resistance * dt);
        if dv.length() > body.velocity.length() {
            body.velocity = Vec2::ZERO;
        } else {
            body.velocity -= dv;
        }
    }

    // Ground friction along x.
    if body.contacts.bottom && body.deceleration > 0.0 {
        let drop = body.deceleration * dt;
        if body.velocity.x.abs() <= drop {
            body.velocity.x = 0.0;
        } else {
            body.velocity.x -= drop * body.velocity.x.signum();
        }
    }
}

/// Minimum-penetration push moving box A out of box B, or None when the
/// boxes do not strictly overlap. Exact edge contact is not a collision.
/// Ties are broken in axis order right, left, down, up.
fn min_push(a_min: Vec2, a_max: Vec2, b_min: Vec2, b_max: Vec2) -> Option<Vec2> {
    let overlapping =
        a_min.x < b_max.x && b_min.x < a_max.x && a_min.y < b_max.y && b_min.y < a_max.y;
    if !overlapping {
        return None;
    }

    let push_right = b_max.x - a_min.x;
    let push_left = a_max.x - b_min.x;
    let push_up = b_max.y - a_min.y;
    let push_down = a_max.y - b_min.y;

    let mut best = Vec2::new(push_right, 0.0);
    let mut best_mag = push_right;
    if push_left < best_mag {
        best = Vec2::new(-push_left, 0.0);
        best_mag = push_left;
    }
    if push_down < best_mag {
        best = Vec2::new(0.0, -push_down);
        best_mag = push_down;
    }
    if push_up < best_mag {
        best = Vec2::new(0.0, push_up);
    }
    Some(best)
}

fn note_contact(
    contacts: &mut HashMap<String, ContactAccum>,
    push: Vec2,
    name: &str,
    other: &Actor,
) {
    let entry = contacts.entry(name.to_string()).or_insert_with(|| ContactAccum {
        normal_sum: Vec2::ZERO,
        other: other.name().to_string(),
        other_velocity: other.body().map(|b| b.velocity).unwrap_or(Vec2::ZERO),
        other_restitution: other.restitution,
        other_mass: other.body().map(|b| b.mass).unwrap_or(f32::INFINITY),
    });
    entry.normal_sum += push;
}

/// Standard inelastic-bounce impulse along the contact normal.
fn apply_bounce(actor: &mut Actor, data: &CollisionData) {
    let restitution = actor.restitution;
    let body = match actor.body_mut() {
        Some(body) if body.simulate_physics => body,
        _ => return,
    };
    let v_rel = (body.velocity - data.other_velocity).dot(data.normal);
    if v_rel >= 0.0 {
        return; // already separating
    }
    let e = restitution * data.other_restitution;
    let inv_mass = 1.0 / body.mass
        + if data.other_mass.is_finite() {
            1.0 / data.other_mass
        } else {
            0.0
        };
    let j = -(1.0 + e) * v_rel / inv_mass;
    body.velocity += data.normal * (j / body.mass);
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn world(actors: Vec<Actor>) -> HashMap<String, Actor> {
        actors
            .into_iter()
            .map(|a| (a.name().to_string(), a))
            .collect()
    }

    #[test]
    fn gravity_integration_order() {
        // Character at (0, 10), not grounded, gravity_scale 1, dt 0.1:
        // velocity first, then position with the new velocity.
        let actor = Actor::character("c", Vec2::new(0.0, 10.0), Vec2::new(0.5, 0.5));
        let mut actors = world(vec![actor]);

        let _ = step(&mut actors, 0.1);

        let c = &actors["c"];
        let v = c.body().unwrap().velocity;
        assert_approx_eq!(v.y, -0.980665, 1e-5);
        assert_approx_eq!(c.position().y, 10.0 + v.y * 0.1, 1e-5);
    }

    #[test]
    fn grounded_body_skips_gravity() {
        let mut actor = Actor::rigidbody("r", Vec2::new(0.0, 0.5), Vec2::new(0.5, 0.5));
        actor.body_mut().unwrap().contacts.bottom = true;
        let mut actors = world(vec![actor]);

        let _ = step(&mut actors, 0.1);
        assert_eq!(actors["r"].body().unwrap().velocity.y, 0.0);
    }

    #[test]
    fn velocity_floor_snaps_small_components() {
        let mut actor = Actor::rigidbody("r", Vec2::ZERO, Vec2::new(0.5, 0.5));
        {
            let body = actor.body_mut().unwrap();
            body.velocity = Vec2::new(0.005, 0.0);
            body.min_velocity = 0.01;
            body.gravity_scale = 0.0;
        }
        let mut actors = world(vec![actor]);
        let _ = step(&mut actors, 0.1);
        assert_eq!(actors["r"].body().unwrap().velocity.x, 0.0);
    }

    #[test]
    fn air_drag_cannot_reverse_velocity() {
        let mut actor = Actor::rigidbody("r", Vec2::ZERO, Vec2::new(0.5, 0.5));
        {
            let body = actor.body_mut().unwrap();
            body.velocity = Vec2::new(1.0, 0.0);
            body.gravity_scale = 0.0;
            body.air_resistance = 100.0;
        }
        let mut actors = world(vec![actor]);
        let _ = step(&mut actors, 1.0);
        // dv would exceed v, so velocity zeroes instead of flipping sign.
        assert_eq!(actors["r"].body().unwrap().velocity, Vec2::ZERO);
    }

    #[test]
    fn ground_friction_decelerates_along_x() {
        let mut actor = Actor::rigidbody("r", Vec2::ZERO, Vec2::new(0.5, 0.5));
        {
            let body = actor.body_mut().unwrap();
            body.velocity = Vec2::new(4.0, 0.0);
            body.gravity_scale = 0.0;
            body.deceleration = 10.0;
            body.contacts.bottom = true;
        }
        let mut actors = world(vec![actor]);
        let _ = step(&mut actors, 0.1);
        // No floor actor, so the latch clears afterwards; the decel applied
        // before integration: 4.0 - 10.0 * 0.1.
        assert_approx_eq!(actors["r"].body().unwrap().velocity.x, 3.0, 1e-5);
    }

    #[test]
    fn exact_edge_touch_is_not_a_collision() {
        let a = Actor::rigidbody("a", Vec2::new(0.0, 0.0), Vec2::new(0.5, 0.5));
        let b = Actor::fixed("b", Vec2::new(1.0, 0.0), Vec2::new(0.5, 0.5));
        let mut actors = world(vec![a, b]);

        let events = step(&mut actors, 0.0001);
        // Gravity moves "a" down a hair but the x faces only touch.
        assert!(events.collisions.is_empty());
    }

    #[test]
    fn equal_mass_elastic_collision_swaps_velocities() {
        let mut a = Actor::rigidbody("a", Vec2::new(-0.4, 0.0), Vec2::new(0.5, 0.5));
        let mut b = Actor::rigidbody("b", Vec2::new(0.4, 0.0), Vec2::new(0.5, 0.5));
        for actor in [&mut a, &mut b] {
            actor.restitution = 1.0;
            let body = actor.body_mut().unwrap();
            body.gravity_scale = 0.0;
        }
        a.body_mut().unwrap().velocity = Vec2::new(5.0, 0.0);
        b.body_mut().unwrap().velocity = Vec2::new(-5.0, 0.0);

        let mut actors = world(vec![a, b]);
        let events = step(&mut actors, 0.01);

        assert_approx_eq!(actors["a"].body().unwrap().velocity.x, -5.0, 1e-3);
        assert_approx_eq!(actors["b"].body().unwrap().velocity.x, 5.0, 1e-3);

        let normal_a = events
            .collisions
            .iter()
            .find(|(n, _)| n == "a")
            .map(|(_, d)| d.normal)
            .unwrap();
        let normal_b = events
            .collisions
            .iter()
            .find(|(n, _)| n == "b")
            .map(|(_, d)| d.normal)
            .unwrap();
        assert_approx_eq!(normal_a.x, -1.0, 1e-5);
        assert_approx_eq!(normal_a.y, 0.0, 1e-5);
        assert_approx_eq!(normal_b.x, 1.0, 1e-5);
    }

    #[test]
    fn resting_on_floor_latches_bottom_contact() {
        let mut body_actor = Actor::rigidbody("ball", Vec2::new(0.0, 1.05), Vec2::new(0.5, 0.5));
        body_actor.body_mut().unwrap().velocity = Vec2::new(0.0, -2.0);
        let floor = Actor::fixed("floor", Vec2::new(0.0, 0.0), Vec2::new(10.0, 0.5));
        let mut actors = world(vec![body_actor, floor]);

        // A few ticks: fall, hit, settle.
        for _ in 0..5 {
            let _ = step(&mut actors, 0.05);
        }

        let body = actors["ball"].body().unwrap();
        assert!(body.contacts.bottom);
        assert!(!body.contacts.top);
        assert_eq!(body.velocity.y, 0.0);
        // Sitting flush on top of the floor.
        assert_approx_eq!(actors["ball"].position().y, 1.0, 1e-2);
    }

    #[test]
    fn separated_bodies_stay_separated_or_flag_budget() {
        // Property: initially non-overlapping pair either ends the step
        // non-overlapping or the iteration budget was reached.
        let mut a = Actor::rigidbody("a", Vec2::new(-2.0, 0.0), Vec2::new(0.5, 0.5));
        let mut b = Actor::rigidbody("b", Vec2::new(2.0, 0.0), Vec2::new(0.5, 0.5));
        a.body_mut().unwrap().gravity_scale = 0.0;
        b.body_mut().unwrap().gravity_scale = 0.0;
        a.body_mut().unwrap().velocity = Vec2::new(3.0, 0.0);
        b.body_mut().unwrap().velocity = Vec2::new(-3.0, 0.0);

        let mut actors = world(vec![a, b]);
        let events = step(&mut actors, 0.1);

        let (a_min, a_max) = actors["a"].bounds(0.0);
        let (b_min, b_max) = actors["b"].bounds(0.0);
        let overlapping =
            a_min.x < b_max.x && b_min.x < a_max.x && a_min.y < b_max.y && b_min.y < a_max.y;
        assert!(!overlapping || events.budget_exhausted);
    }

    #[test]
    fn min_push_tie_order_prefers_right_then_left_then_down() {
        // Perfectly concentric unit boxes: all four pushes equal, the first
        // axis in the order wins.
        let push = min_push(
            Vec2::new(-0.5, -0.5),
            Vec2::new(0.5, 0.5),
            Vec2::new(-0.5, -0.5),
            Vec2::new(0.5, 0.5),
        )
        .unwrap();
        assert_eq!(push, Vec2::new(1.0, 0.0));
    }

    #[test]
    fn overlap_begin_and_end_events() {
        let mut sensor = Actor::fixed("zone", Vec2::new(0.0, 0.0), Vec2::new(1.0, 1.0));
        sensor.collidable = false;
        sensor.generate_overlap_events = true;

        let mut walker = Actor::rigidbody("walker", Vec2::new(5.0, 0.0), Vec2::new(0.5, 0.5));
        {
            let body = walker.body_mut().unwrap();
            body.gravity_scale = 0.0;
            body.velocity = Vec2::new(-40.0, 0.0);
        }

        let mut actors = world(vec![sensor, walker]);

        // First step carries the walker into the zone.
        let events = step(&mut actors, 0.1);
        assert!(events
            .overlap_begin
            .contains(&("zone".to_string(), "walker".to_string())));
        assert!(events.overlap_end.is_empty());

        // Second step carries it out the far side.
        let events = step(&mut actors, 0.1);
        assert!(events
            .overlap_end
            .contains(&("zone".to_string(), "walker".to_string())));
    }

    #[test]
    fn non_simulating_body_gets_no_corrections() {
        let mut ghost = Actor::rigidbody("ghost", Vec2::new(0.0, 0.0), Vec2::new(0.5, 0.5));
        {
            let body = ghost.body_mut().unwrap();
            body.simulate_physics = false;
            body.gravity_scale = 0.0;
        }
        let wall = Actor::fixed("wall", Vec2::new(0.2, 0.0), Vec2::new(0.5, 0.5));
        let mut actors = world(vec![ghost, wall]);

        let events = step(&mut actors, 0.01);
        assert!(events.collisions.is_empty());
        assert_eq!(actors["ghost"].position().x, 0.0);
    }
}
