//! Sparse chunk index mapping world positions to fixed-size chunks.

use shared::{chunk_of, ChunkCoord, Vec2};
use std::collections::{HashMap, HashSet};

/// Maps chunk coordinates to the names of the actors inside them. Empty
/// chunks are removed eagerly so iteration cost tracks populated area.
#[derive(Debug, Default)]
pub struct ChunkIndex {
    chunks: HashMap<ChunkCoord, HashSet<String>>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, pos: Vec2) -> ChunkCoord {
        let coord = chunk_of(pos);
        self.chunks.entry(coord).or_default().insert(name.to_string());
        coord
    }

    pub fn remove(&mut self, name: &str, coord: ChunkCoord) {
        if let Some(set) = self.chunks.get_mut(&coord) {
            set.remove(name);
            if set.is_empty() {
                self.chunks.remove(&coord);
            }
        }
    }

    /// Moves an actor between chunks if its position crossed a boundary.
    /// Returns the chunk it now occupies.
    pub fn relocate(&mut self, name: &str, old: ChunkCoord, new_pos: Vec2) -> ChunkCoord {
        let new = chunk_of(new_pos);
        if new != old {
            self.remove(name, old);
            self.chunks.entry(new).or_default().insert(name.to_string());
        }
        new
    }

    pub fn chunk(&self, coord: ChunkCoord) -> Option<&HashSet<String>> {
        self.chunks.get(&coord)
    }

    /// Yields every actor in chunks whose coordinates lie in the inclusive
    /// rectangle `[bl, tr]`. Order within a chunk is unspecified.
    pub fn query_rect(&self, bl: ChunkCoord, tr: ChunkCoord) -> impl Iterator<Item = &String> {
        self.chunks
            .iter()
            .filter(move |((cx, cy), _)| {
                *cx >= bl.0 && *cx <= tr.0 && *cy >= bl.1 && *cy <= tr.1
            })
            .flat_map(|(_, names)| names.iter())
    }

    pub fn populated_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Total number of filed names across all chunks.
    pub fn total_entries(&self) -> usize {
        self.chunks.values().map(|set| set.len()).sum()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, name: &str, coord: ChunkCoord) -> bool {
        self.chunks
            .get(&coord)
            .map(|set| set.contains(name))
            .unwrap_or(false)
    }
}
