//! Local mirror of the server's replicated state.

use log::{debug, warn};
use serde_json::Value;
use shared::protocol::{
    CMD_BACKGROUND, CMD_DESTROY_ACTOR, CMD_PLAY_SOUND, CMD_REGISTER_ACTOR, CMD_UPDATE_ACTOR,
};
use shared::Vec2;
use std::collections::HashMap;

/// A replicated actor as the client knows it.
#[derive(Debug, Clone)]
pub struct MirrorActor {
    pub kind: String,
    pub position: Vec2,
    pub half_size: Vec2,
    pub visible: bool,
    pub material: Option<String>,
    pub layer: i64,
}

/// Applies replication records in arrival order. The server owns the truth;
/// this never simulates on its own.
#[derive(Debug, Default)]
pub struct ClientWorld {
    actors: HashMap<String, MirrorActor>,
    pub background: Option<String>,
    /// Sounds requested since the last drain, for the audio layer.
    pending_sounds: Vec<String>,
}

impl ClientWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actor(&self, name: &str) -> Option<&MirrorActor> {
        self.actors.get(name)
    }

    pub fn actors(&self) -> impl Iterator<Item = (&String, &MirrorActor)> {
        self.actors.iter()
    }

    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    pub fn drain_sounds(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_sounds)
    }

    /// Routes one record into the mirror. Unknown commands are logged and
    /// dropped so protocol additions never wedge an older client.
    pub fn apply(&mut self, command: &str, data: &Value) {
        match command {
            CMD_REGISTER_ACTOR => self.apply_register(data),
            CMD_UPDATE_ACTOR => self.apply_update(data),
            CMD_DESTROY_ACTOR => {
                if let Some(name) = data.as_str() {
                    if self.actors.remove(name).is_none() {
                        debug!("destroy for unknown actor {:?}", name);
                    }
                }
            }
            CMD_BACKGROUND => {
                self.background = data.as_str().map(str::to_string);
            }
            // `[sound_path, position?, distance, volume]`; only the path
            // matters until an audio layer is attached.
            CMD_PLAY_SOUND => {
                if let Some(sound) = data.get(0).and_then(Value::as_str) {
                    self.pending_sounds.push(sound.to_string());
                }
            }
            other => warn!("unknown command {:?}, dropping", other),
        }
    }

    /// `[kind, name, position, half_size, visible, material, layer]`
    fn apply_register(&mut self, data: &Value) {
        let Some(items) = data.as_array() else {
            warn!("malformed register payload");
            return;
        };
        let fields = (
            items.first().and_then(Value::as_str),
            items.get(1).and_then(Value::as_str),
            items.get(2).map(parse_vector),
            items.get(3).map(parse_vector),
        );
        let (Some(kind), Some(name), Some(Some(position)), Some(Some(half_size))) = fields else {
            warn!("malformed register payload");
            return;
        };
        let actor = MirrorActor {
            kind: kind.to_string(),
            position,
            half_size,
            visible: items.get(4).and_then(Value::as_bool).unwrap_or(true),
            material: items
                .get(5)
                .and_then(Value::as_str)
                .map(str::to_string),
            layer: items.get(6).and_then(Value::as_i64).unwrap_or(0),
        };
        // A re-register replaces wholesale: the payload carries full state.
        self.actors.insert(name.to_string(), actor);
    }

    /// `[name, {field -> value}]`
    fn apply_update(&mut self, data: &Value) {
        let (Some(name), Some(fields)) = (
            data.get(0).and_then(Value::as_str),
            data.get(1).and_then(Value::as_object),
        ) else {
            warn!("malformed update payload");
            return;
        };
        let Some(actor) = self.actors.get_mut(name) else {
            // The server may already be updating something we tore down when
            // it left our interest region.
            debug!("update for unknown actor {:?}", name);
            return;
        };
        for (field, value) in fields {
            match field.as_str() {
                "position" => {
                    if let Some(v) = parse_vector(value) {
                        actor.position = v;
                    }
                }
                "half_size" => {
                    if let Some(v) = parse_vector(value) {
                        actor.half_size = v;
                    }
                }
                "visible" => {
                    if let Some(v) = value.as_bool() {
                        actor.visible = v;
                    }
                }
                "material" => {
                    actor.material = value.as_str().map(str::to_string);
                }
                other => debug!("unknown field {:?} for {:?}", other, name),
            }
        }
    }
}

fn parse_vector(value: &Value) -> Option<Vec2> {
    serde_json::from_value(value.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vector(x: f32, y: f32) -> Value {
        serde_json::to_value(Vec2::new(x, y)).unwrap()
    }

    #[test]
    fn register_then_update_then_destroy() {
        let mut world = ClientWorld::new();
        world.apply(
            CMD_REGISTER_ACTOR,
            &json!(["rigidbody", "crate", vector(1.0, 2.0), vector(0.5, 0.5), true, "wood", 0]),
        );
        assert_eq!(world.actor_count(), 1);
        let actor = world.actor("crate").unwrap();
        assert_eq!(actor.kind, "rigidbody");
        assert_eq!(actor.material.as_deref(), Some("wood"));

        world.apply(
            CMD_UPDATE_ACTOR,
            &json!(["crate", {"position": vector(3.0, 2.0), "visible": false}]),
        );
        let actor = world.actor("crate").unwrap();
        assert_eq!(actor.position, Vec2::new(3.0, 2.0));
        assert!(!actor.visible);

        world.apply(CMD_DESTROY_ACTOR, &json!("crate"));
        assert_eq!(world.actor_count(), 0);
    }

    #[test]
    fn update_for_unknown_actor_is_dropped() {
        let mut world = ClientWorld::new();
        world.apply(
            CMD_UPDATE_ACTOR,
            &json!(["ghost", {"position": vector(1.0, 1.0)}]),
        );
        assert_eq!(world.actor_count(), 0);
    }

    #[test]
    fn reregister_replaces_full_state() {
        let mut world = ClientWorld::new();
        world.apply(
            CMD_REGISTER_ACTOR,
            &json!(["actor", "sign", vector(0.0, 0.0), vector(1.0, 1.0), true, "wood", 0]),
        );
        world.apply(
            CMD_REGISTER_ACTOR,
            &json!(["actor", "sign", vector(5.0, 0.0), vector(1.0, 1.0), true, null, 2]),
        );
        let actor = world.actor("sign").unwrap();
        assert_eq!(actor.position, Vec2::new(5.0, 0.0));
        assert_eq!(actor.material, None);
        assert_eq!(actor.layer, 2);
    }

    #[test]
    fn background_and_sounds() {
        let mut world = ClientWorld::new();
        world.apply(CMD_BACKGROUND, &json!("sky"));
        world.apply(CMD_PLAY_SOUND, &json!(["thud", null, 100.0, 1.0]));
        world.apply(
            CMD_PLAY_SOUND,
            &json!(["ping", vector(3.0, 0.0), 50.0, 0.8]),
        );

        assert_eq!(world.background.as_deref(), Some("sky"));
        assert_eq!(world.drain_sounds(), vec!["thud", "ping"]);
        assert!(world.drain_sounds().is_empty());
    }

    #[test]
    fn unknown_commands_are_ignored() {
        let mut world = ClientWorld::new();
        world.apply("future_command", &json!(null));
        assert_eq!(world.actor_count(), 0);
    }
}
