//! The actor registry: owns actors, keeps the chunk index consistent, and
//! harvests the per-tick chunk-keyed maps the replication planner consumes.

use crate::actor::Actor;
use crate::chunk::ChunkIndex;
use crate::physics::{self, StepEvents};
use log::info;
use serde_json::Value;
use shared::{chunk_of, ChunkCoord, Vec2};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LevelError {
    #[error("an actor named \"{0}\" already exists")]
    NameConflict(String),
}

/// One simulated world. Actors are owned exclusively by their level; all
/// destruction is deferred to the tick boundary through the pending set.
pub struct Level {
    name: String,
    actors: HashMap<String, Actor>,
    index: ChunkIndex,
    pending_destroy: HashSet<String>,
    fresh: HashSet<String>,
    /// Multiplier applied to every tick's dt. Strictly positive.
    pub simulation_speed: f32,
    /// Set when the last step ran out of contact iterations.
    pub budget_exhausted: bool,
}

impl Level {
    pub fn new(name: impl Into<String>) -> Self {
        Level {
            name: name.into(),
            actors: HashMap::new(),
            index: ChunkIndex::new(),
            pending_destroy: HashSet::new(),
            fresh: HashSet::new(),
            simulation_speed: 1.0,
            budget_exhausted: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds an actor to the level and the chunk index. Fails when the name
    /// is taken; names are unique within a level.
    pub fn register_actor(&mut self, mut actor: Actor) -> Result<(), LevelError> {
        if self.actors.contains_key(actor.name()) {
            return Err(LevelError::NameConflict(actor.name().to_string()));
        }
        let coord = self.index.insert(actor.name(), actor.position());
        actor.chunk = coord;
        self.fresh.insert(actor.name().to_string());
        self.actors.insert(actor.name().to_string(), actor);
        Ok(())
    }

    /// Marks an actor for removal at the next tick boundary.
    pub fn destroy_actor(&mut self, name: &str) {
        if self.actors.contains_key(name) {
            self.pending_destroy.insert(name.to_string());
        }
    }

    /// Removes every pending actor and returns their names keyed by the
    /// chunk they occupied. Called exactly once per tick, before physics.
    pub fn drain_destroyed(&mut self) -> HashMap<ChunkCoord, Vec<String>> {
        let mut out: HashMap<ChunkCoord, Vec<String>> = HashMap::new();
        for name in std::mem::take(&mut self.pending_destroy) {
            if let Some(actor) = self.actors.remove(&name) {
                self.index.remove(&name, actor.chunk);
                self.fresh.remove(&name);
                out.entry(actor.chunk).or_default().push(name);
            }
        }
        out
    }

    /// Returns the names of actors registered since the last drain, keyed by
    /// chunk. Their dirty sets are cleared because the register payload the
    /// planner builds carries full state.
    pub fn drain_new(&mut self) -> HashMap<ChunkCoord, Vec<String>> {
        let mut out: HashMap<ChunkCoord, Vec<String>> = HashMap::new();
        for name in std::mem::take(&mut self.fresh) {
            if let Some(actor) = self.actors.get_mut(&name) {
                let _ = actor.take_dirty_fields();
                out.entry(actor.chunk).or_default().push(name);
            }
        }
        out
    }

    /// Runs the physics step at the level's simulation speed, then re-files
    /// actors that crossed a chunk boundary.
    pub fn tick(&mut self, raw_dt: f32) -> StepEvents {
        let dt = raw_dt * self.simulation_speed;
        let events = physics::step(&mut self.actors, dt);
        self.budget_exhausted = events.budget_exhausted;

        for actor in self.actors.values_mut() {
            let current = chunk_of(actor.position());
            if current != actor.chunk {
                let filed = self.index.relocate(actor.name(), actor.chunk, actor.position());
                actor.chunk = filed;
            }
        }
        events
    }

    /// Harvests `{field -> value}` payloads for every dirty actor inside any
    /// of the given chunk windows, keyed by the actor's chunk. Dirty sets are
    /// cleared only for actors that produced a payload. Fresh actors are
    /// skipped; they are replicated with a full register this tick.
    pub fn collect_updates(
        &mut self,
        windows: &[(ChunkCoord, ChunkCoord)],
    ) -> HashMap<ChunkCoord, Vec<(String, serde_json::Map<String, Value>)>> {
        let mut targets: Vec<String> = Vec::new();
        for (bl, tr) in windows {
            targets.extend(self.index.query_rect(*bl, *tr).cloned());
        }
        targets.sort();
        targets.dedup();

        let mut out: HashMap<ChunkCoord, Vec<(String, serde_json::Map<String, Value>)>> =
            HashMap::new();
        for name in targets {
            if self.fresh.contains(&name) {
                continue;
            }
            if let Some(actor) = self.actors.get_mut(&name) {
                if actor.is_dirty() {
                    let fields = actor.take_dirty_fields();
                    out.entry(actor.chunk).or_default().push((name, fields));
                }
            }
        }
        out
    }

    pub fn actor(&self, name: &str) -> Option<&Actor> {
        self.actors.get(name)
    }

    pub fn actor_mut(&mut self, name: &str) -> Option<&mut Actor> {
        self.actors.get_mut(name)
    }

    pub fn actors(&self) -> impl Iterator<Item = &Actor> {
        self.actors.values()
    }

    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    pub fn index(&self) -> &ChunkIndex {
        &self.index
    }

    /// Moves an actor and keeps the chunk index in sync immediately. Used by
    /// command handlers; physics movement is re-filed in `tick`.
    pub fn move_actor(&mut self, name: &str, position: Vec2) {
        if let Some(actor) = self.actors.get_mut(name) {
            actor.set_position(position);
            let current = chunk_of(position);
            if current != actor.chunk {
                let filed = self.index.relocate(actor.name(), actor.chunk, position);
                actor.chunk = filed;
            }
        }
    }

    /// Debug invariant: every actor is filed under exactly the chunk its
    /// position maps to, and the index holds no dangling names.
    #[cfg(test)]
    pub(crate) fn check_chunk_invariant(&self) -> bool {
        for actor in self.actors.values() {
            let expected = chunk_of(actor.position());
            if actor.chunk != expected {
                return false;
            }
            match self.index.chunk(expected) {
                Some(set) if set.contains(actor.name()) => {}
                _ => return false,
            }
        }
        // No dangling names: the index files each actor exactly once.
        self.index.total_entries() == self.actors.len()
    }
}

impl std::fmt::Debug for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Level")
            .field("name", &self.name)
            .field("actors", &self.actors.len())
            .field("chunks", &self.index.populated_chunks())
            .finish()
    }
}

/// Convenience used by the engine when a client joins a level that does not
/// exist yet.
pub fn create_default(name: &str) -> Level {
    info!("creating level \"{}\"", name);
    Level::new(name)
}
