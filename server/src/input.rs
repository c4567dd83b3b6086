//! Server-side key binding table. Clients send raw key transitions; gameplay
//! meaning is decided here, after physics has latched contact state.

use crate::level::Level;
use shared::protocol::keys;
use std::collections::HashMap;

/// How a binding fires relative to the key's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PressKind {
    /// Once, on the tick the key went down.
    Trigger,
    /// Every tick while the key is held.
    Hold,
    /// Once, on the tick the key went up.
    Release,
}

type Handler = Box<dyn Fn(&mut Level, &str, f32) + Send + Sync>;

/// Maps `(key, press kind)` to gameplay handlers. Handlers receive the level,
/// the player's actor name, and the tick's dt.
#[derive(Default)]
pub struct InputDispatcher {
    bindings: HashMap<(i64, PressKind), Vec<Handler>>,
}

impl InputDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(
        &mut self,
        key: i64,
        kind: PressKind,
        handler: impl Fn(&mut Level, &str, f32) + Send + Sync + 'static,
    ) {
        self.bindings
            .entry((key, kind))
            .or_default()
            .push(Box::new(handler));
    }

    /// Runs every binding matching this tick's key state for one player.
    pub fn dispatch(
        &self,
        level: &mut Level,
        actor_name: &str,
        triggered: &std::collections::HashSet<i64>,
        pressed: &std::collections::HashSet<i64>,
        released: &std::collections::HashSet<i64>,
        dt: f32,
    ) {
        for key in triggered {
            self.run(level, actor_name, *key, PressKind::Trigger, dt);
        }
        for key in pressed {
            self.run(level, actor_name, *key, PressKind::Hold, dt);
        }
        for key in released {
            self.run(level, actor_name, *key, PressKind::Release, dt);
        }
    }

    fn run(&self, level: &mut Level, actor_name: &str, key: i64, kind: PressKind, dt: f32) {
        if let Some(handlers) = self.bindings.get(&(key, kind)) {
            for handler in handlers {
                handler(level, actor_name, dt);
            }
        }
    }

    /// Platformer defaults: A/D walk, W or Space jumps when grounded.
    pub fn with_default_bindings() -> Self {
        let mut dispatcher = InputDispatcher::new();
        dispatcher.bind(keys::KEY_A, PressKind::Hold, |level, name, _dt| {
            walk(level, name, -1);
        });
        dispatcher.bind(keys::KEY_D, PressKind::Hold, |level, name, _dt| {
            walk(level, name, 1);
        });
        dispatcher.bind(keys::KEY_W, PressKind::Trigger, jump);
        dispatcher.bind(keys::KEY_SPACE, PressKind::Trigger, jump);
        dispatcher
    }
}

fn walk(level: &mut Level, name: &str, direction: i8) {
    if let Some(actor) = level.actor_mut(name) {
        if let Some(locomotion) = actor.locomotion_mut() {
            locomotion.move_direction = direction;
        }
    }
}

/// Jumping requires ground under the character's feet.
fn jump(level: &mut Level, name: &str, _dt: f32) {
    if let Some(actor) = level.actor_mut(name) {
        let jump_velocity = match &actor.kind {
            crate::actor::ActorKind::Character(body, locomotion) if body.contacts.bottom => {
                Some(locomotion.jump_velocity)
            }
            _ => None,
        };
        if let Some(v) = jump_velocity {
            if let Some(body) = actor.body_mut() {
                body.velocity.y = v;
            }
        }
    }
}
