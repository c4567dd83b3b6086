//! Per-client interest management: decides which registers, updates and
//! destroys each player receives every tick.
//!
//! Ordering contract: within one tick, for any actor name, a client observes
//! `register` before `update` before `destroy`, and destroys always precede
//! registers on the reliable channel.

use crate::level::Level;
use serde_json::{json, Value};
use shared::codec::encode_payload;
use shared::protocol::{CMD_DESTROY_ACTOR, CMD_REGISTER_ACTOR, CMD_UPDATE_ACTOR};
use shared::{chunk_of, ChunkCoord, Vec2};
use std::collections::{HashMap, HashSet};

/// Replication bookkeeping for one player.
#[derive(Debug, Clone)]
pub struct InterestState {
    /// Interest radius in chunks.
    pub update_distance: i32,
    pub last_position: Vec2,
    pub last_chunk: Option<ChunkCoord>,
    /// Previous tick's interest rectangle, unioned in so chunks leaving the
    /// region are still visited.
    pub prev_rect: Option<(ChunkCoord, ChunkCoord)>,
    /// Chunks the client currently has full state for.
    pub synced_chunks: HashSet<ChunkCoord>,
}

impl InterestState {
    pub fn new(update_distance: i32) -> Self {
        InterestState {
            update_distance,
            last_position: Vec2::ZERO,
            last_chunk: None,
            prev_rect: None,
            synced_chunks: HashSet::new(),
        }
    }

    /// Forgets everything synced, forcing a full resync on the next plan.
    pub fn reset(&mut self) {
        self.last_chunk = None;
        self.prev_rect = None;
        self.synced_chunks.clear();
    }
}

/// The chunk-keyed maps one level tick produced.
#[derive(Debug, Default)]
pub struct TickMaps {
    pub fresh: HashMap<ChunkCoord, Vec<String>>,
    pub destroyed: HashMap<ChunkCoord, Vec<String>>,
    pub updates: HashMap<ChunkCoord, Vec<(String, serde_json::Map<String, Value>)>>,
}

/// Encoded payload records planned for one client this tick.
#[derive(Debug, Default)]
pub struct PlannedTraffic {
    /// Destroys first, then registers.
    pub reliable: Vec<String>,
    pub unreliable: Vec<String>,
}

/// Plans one player's traffic for this tick and commits the new interest
/// state.
pub fn plan(
    interest: &mut InterestState,
    player_pos: Vec2,
    level: &Level,
    maps: &TickMaps,
) -> PlannedTraffic {
    let current = chunk_of(player_pos);
    let d = interest.update_distance.max(0);
    let rect = ((current.0 - d, current.1 - d), (current.0 + d, current.1 + d));
    let union_rect = match interest.prev_rect {
        Some((pbl, ptr)) => (
            (rect.0 .0.min(pbl.0), rect.0 .1.min(pbl.1)),
            (rect.1 .0.max(ptr.0), rect.1 .1.max(ptr.1)),
        ),
        None => rect,
    };
    let in_rect = |r: &(ChunkCoord, ChunkCoord), c: ChunkCoord| {
        c.0 >= r.0 .0 && c.0 <= r.1 .0 && c.1 >= r.0 .1 && c.1 <= r.1 .1
    };

    let mut target: HashSet<ChunkCoord> = HashSet::new();
    for cx in rect.0 .0..=rect.1 .0 {
        for cy in rect.0 .1..=rect.1 .1 {
            target.insert((cx, cy));
        }
    }

    let mut destroys: Vec<String> = Vec::new();
    let mut destroyed_names: HashSet<String> = HashSet::new();
    let mut registers: Vec<Value> = Vec::new();
    let mut registered_names: HashSet<String> = HashSet::new();
    let mut updates: Vec<Value> = Vec::new();

    // Actors destroyed this tick in any chunk the client knew about.
    for (coord, names) in &maps.destroyed {
        if !in_rect(&union_rect, *coord) || !interest.synced_chunks.contains(coord) {
            continue;
        }
        for name in names {
            if destroyed_names.insert(name.clone()) {
                destroys.push(name.clone());
            }
        }
    }

    // Chunks leaving the interest region: tear down everything the client
    // still holds there.
    for coord in interest.synced_chunks.difference(&target) {
        if let Some(names) = level.index().chunk(*coord) {
            for name in names {
                let known = level.actor(name).map(|a| a.visible()).unwrap_or(false);
                if known && destroyed_names.insert(name.clone()) {
                    destroys.push(name.clone());
                }
            }
        }
    }

    // Chunks entering the interest region: full state for their occupants.
    for coord in target.difference(&interest.synced_chunks) {
        if let Some(names) = level.index().chunk(*coord) {
            for name in names {
                if let Some(actor) = level.actor(name) {
                    if actor.visible() && registered_names.insert(name.clone()) {
                        registers.push(actor.register_payload());
                    }
                }
            }
        }
    }

    // Actors born this tick inside chunks that stay synced. Births inside
    // entering chunks were covered above; the name sets dedupe the overlap.
    for (coord, names) in &maps.fresh {
        if !target.contains(coord) {
            continue;
        }
        for name in names {
            if destroyed_names.contains(name) || registered_names.contains(name) {
                continue;
            }
            if let Some(actor) = level.actor(name) {
                if actor.visible() && registered_names.insert(name.clone()) {
                    registers.push(actor.register_payload());
                }
            }
        }
    }

    // Field updates inside chunks that remain synced. A visible toggle is
    // upgraded to a register or destroy.
    for (coord, entries) in &maps.updates {
        if !target.contains(coord) || !interest.synced_chunks.contains(coord) {
            continue;
        }
        for (name, fields) in entries {
            if destroyed_names.contains(name) || registered_names.contains(name) {
                continue;
            }
            match fields.get("visible").and_then(Value::as_bool) {
                Some(false) => {
                    if destroyed_names.insert(name.clone()) {
                        destroys.push(name.clone());
                    }
                }
                Some(true) => {
                    if let Some(actor) = level.actor(name) {
                        if registered_names.insert(name.clone()) {
                            registers.push(actor.register_payload());
                        }
                    }
                }
                None => {
                    updates.push(json!([name, fields]));
                }
            }
        }
    }

    interest.synced_chunks = target;
    interest.prev_rect = Some(rect);
    interest.last_chunk = Some(current);
    interest.last_position = player_pos;

    let mut traffic = PlannedTraffic::default();
    for name in destroys {
        traffic.reliable.push(encode_payload(CMD_DESTROY_ACTOR, &json!(name)));
    }
    for payload in registers {
        traffic.reliable.push(encode_payload(CMD_REGISTER_ACTOR, &payload));
    }
    for payload in updates {
        traffic.unreliable.push(encode_payload(CMD_UPDATE_ACTOR, &payload));
    }
    traffic
}
