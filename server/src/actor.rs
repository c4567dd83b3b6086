//! World entities: the tagged actor variant and its per-kind data.
//!
//! Actors hold no references back into the engine or level; physics and
//! replication receive the level as a parameter and actors communicate
//! outward through event values and the level's deferred sets.

use serde_json::{json, Value};
use shared::{chunk_of, ChunkCoord, Vec2};
use std::collections::HashSet;

/// Attribute tags tracked by the per-actor dirty set. Setters add tags; the
/// replication pass drains them when it produces an outbound sync payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirtyField {
    HalfSize,
    Position,
    Visible,
    Material,
}

impl DirtyField {
    /// Wire name of the field inside an `update_actor` payload.
    pub fn tag(self) -> &'static str {
        match self {
            DirtyField::HalfSize => "half_size",
            DirtyField::Position => "position",
            DirtyField::Visible => "visible",
            DirtyField::Material => "material",
        }
    }
}

/// Which sides of a rigidbody currently touch a collider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContactSides {
    pub right: bool,
    pub left: bool,
    pub top: bool,
    pub bottom: bool,
}

impl ContactSides {
    pub fn clear(&mut self) {
        *self = ContactSides::default();
    }
}

/// Physical state owned by rigidbodies and characters.
#[derive(Debug, Clone)]
pub struct Body {
    pub velocity: Vec2,
    /// Velocity components below this magnitude snap to zero.
    pub min_velocity: f32,
    /// Strictly positive.
    pub mass: f32,
    pub gravity_scale: f32,
    pub air_resistance: f32,
    /// Ground friction, applied along x when the bottom contact is latched.
    pub deceleration: f32,
    pub contacts: ContactSides,
    pub simulate_physics: bool,
}

impl Default for Body {
    fn default() -> Self {
        Body {
            velocity: Vec2::ZERO,
            min_velocity: 0.01,
            mass: 1.0,
            gravity_scale: 1.0,
            air_resistance: 0.0,
            deceleration: 0.0,
            contacts: ContactSides::default(),
            simulate_physics: true,
        }
    }
}

/// Character locomotion parameters on top of a rigidbody.
#[derive(Debug, Clone)]
pub struct Locomotion {
    pub jump_velocity: f32,
    pub walk_speed: f32,
    pub acceleration: f32,
    /// Fraction of acceleration available while airborne.
    pub air_control: f32,
    /// Transient, reset every tick: -1, 0 or 1.
    pub move_direction: i8,
}

impl Default for Locomotion {
    fn default() -> Self {
        Locomotion {
            jump_velocity: 8.0,
            walk_speed: 6.0,
            acceleration: 60.0,
            air_control: 0.2,
            move_direction: 0,
        }
    }
}

/// Per-kind payload of an actor.
#[derive(Debug, Clone)]
pub enum ActorKind {
    Fixed,
    Rigidbody(Body),
    Character(Body, Locomotion),
}

/// A named, replicable world entity owned by exactly one level.
#[derive(Debug, Clone)]
pub struct Actor {
    name: String,
    position: Vec2,
    half_size: Vec2,
    visible: bool,
    material: Option<String>,
    pub collidable: bool,
    pub generate_overlap_events: bool,
    /// Restitution in [0, 1].
    pub restitution: f32,
    pub layer: i32,
    pub kind: ActorKind,
    dirty: HashSet<DirtyField>,
    /// Chunk the level index currently files this actor under.
    pub(crate) chunk: ChunkCoord,
    /// Names this actor overlapped last tick, for begin/end diffing.
    pub(crate) overlaps: HashSet<String>,
}

impl Actor {
    pub fn new(name: impl Into<String>, position: Vec2, half_size: Vec2, kind: ActorKind) -> Self {
        let chunk = chunk_of(position);
        Actor {
            name: name.into(),
            position,
            half_size,
            visible: true,
            material: None,
            collidable: true,
            generate_overlap_events: false,
            restitution: 0.0,
            layer: 0,
            kind,
            dirty: HashSet::new(),
            chunk,
            overlaps: HashSet::new(),
        }
    }

    pub fn fixed(name: impl Into<String>, position: Vec2, half_size: Vec2) -> Self {
        Actor::new(name, position, half_size, ActorKind::Fixed)
    }

    pub fn rigidbody(name: impl Into<String>, position: Vec2, half_size: Vec2) -> Self {
        Actor::new(name, position, half_size, ActorKind::Rigidbody(Body::default()))
    }

    pub fn character(name: impl Into<String>, position: Vec2, half_size: Vec2) -> Self {
        Actor::new(
            name,
            position,
            half_size,
            ActorKind::Character(Body::default(), Locomotion::default()),
        )
    }

    pub fn with_material(mut self, material: impl Into<String>) -> Self {
        self.material = Some(material.into());
        self
    }

    /// Stable wire tag for client-side construction.
    pub fn kind_tag(&self) -> &'static str {
        match self.kind {
            ActorKind::Fixed => "actor",
            ActorKind::Rigidbody(_) => "rigidbody",
            ActorKind::Character(..) => "character",
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn position(&self) -> Vec2 {
        self.position
    }

    pub fn set_position(&mut self, position: Vec2) {
        if position != self.position {
            self.position = position;
            self.dirty.insert(DirtyField::Position);
        }
    }

    pub fn half_size(&self) -> Vec2 {
        self.half_size
    }

    pub fn set_half_size(&mut self, half_size: Vec2) {
        if half_size != self.half_size {
            self.half_size = half_size;
            self.dirty.insert(DirtyField::HalfSize);
        }
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        if visible != self.visible {
            self.visible = visible;
            self.dirty.insert(DirtyField::Visible);
        }
    }

    pub fn material(&self) -> Option<&str> {
        self.material.as_deref()
    }

    pub fn set_material(&mut self, material: Option<String>) {
        if material != self.material {
            self.material = material;
            self.dirty.insert(DirtyField::Material);
        }
    }

    pub fn body(&self) -> Option<&Body> {
        match &self.kind {
            ActorKind::Fixed => None,
            ActorKind::Rigidbody(body) => Some(body),
            ActorKind::Character(body, _) => Some(body),
        }
    }

    pub fn body_mut(&mut self) -> Option<&mut Body> {
        match &mut self.kind {
            ActorKind::Fixed => None,
            ActorKind::Rigidbody(body) => Some(body),
            ActorKind::Character(body, _) => Some(body),
        }
    }

    pub fn locomotion_mut(&mut self) -> Option<&mut Locomotion> {
        match &mut self.kind {
            ActorKind::Character(_, locomotion) => Some(locomotion),
            _ => None,
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Drains the dirty set into an `{field -> value}` wire object. Called
    /// only when the result is actually emitted, so a cleared tag always has
    /// a corresponding sync payload.
    pub fn take_dirty_fields(&mut self) -> serde_json::Map<String, Value> {
        let mut fields = serde_json::Map::new();
        for field in std::mem::take(&mut self.dirty) {
            fields.insert(field.tag().to_string(), self.field_value(field));
        }
        fields
    }

    fn field_value(&self, field: DirtyField) -> Value {
        match field {
            DirtyField::HalfSize => json!(self.half_size),
            DirtyField::Position => json!(self.position),
            DirtyField::Visible => json!(self.visible),
            DirtyField::Material => json!(self.material),
        }
    }

    /// Full-state payload sent with `register_actor`.
    pub fn register_payload(&self) -> Value {
        json!([
            self.kind_tag(),
            self.name,
            self.position,
            self.half_size,
            self.visible,
            self.material,
            self.layer,
        ])
    }

    /// Axis-aligned bounds, optionally expanded by a tolerance.
    pub fn bounds(&self, expand: f32) -> (Vec2, Vec2) {
        let half = self.half_size + Vec2::new(expand, expand);
        (self.position - half, self.position + half)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_mark_dirty_only_on_change() {
        let mut actor = Actor::rigidbody("crate", Vec2::ZERO, Vec2::new(0.5, 0.5));
        assert!(!actor.is_dirty());

        actor.set_position(Vec2::new(1.0, 0.0));
        actor.set_visible(true); // unchanged, stays clean
        assert!(actor.is_dirty());

        let fields = actor.take_dirty_fields();
        assert_eq!(fields.len(), 1);
        assert!(fields.contains_key("position"));
        assert!(!actor.is_dirty());
    }

    #[test]
    fn dirty_set_covers_all_replicated_fields() {
        let mut actor = Actor::fixed("sign", Vec2::ZERO, Vec2::new(1.0, 1.0));
        actor.set_position(Vec2::new(2.0, 3.0));
        actor.set_half_size(Vec2::new(2.0, 2.0));
        actor.set_visible(false);
        actor.set_material(Some("wood".into()));

        let fields = actor.take_dirty_fields();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields["visible"], json!(false));
        assert_eq!(fields["material"], json!("wood"));
        assert_eq!(fields["position"]["_type"], json!("Vector"));
    }

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(Actor::fixed("a", Vec2::ZERO, Vec2::ZERO).kind_tag(), "actor");
        assert_eq!(
            Actor::rigidbody("b", Vec2::ZERO, Vec2::ZERO).kind_tag(),
            "rigidbody"
        );
        assert_eq!(
            Actor::character("c", Vec2::ZERO, Vec2::ZERO).kind_tag(),
            "character"
        );
    }

    #[test]
    fn register_payload_shape() {
        let actor = Actor::character("__Player_1", Vec2::new(0.0, 0.0), Vec2::new(0.5, 1.0))
            .with_material("player");
        let payload = actor.register_payload();
        assert_eq!(payload[0], json!("character"));
        assert_eq!(payload[1], json!("__Player_1"));
        assert_eq!(payload[2]["_type"], json!("Vector"));
        assert_eq!(payload[4], json!(true));
        assert_eq!(payload[5], json!("player"));
    }
}
