//! Region availability oracle.
//!
//! The host reports which chunks are currently loaded. The attachment
//! protocol consults the oracle before every neighbor lookup so it never
//! forces a chunk load and never recurses into a chunk that is still being
//! constructed. An unloaded chunk is "not yet", never an error.

use rustc_hash::FxHashSet;

use crate::position::ChunkPos;

/// Reports whether a chunk's contents are currently safe to query.
pub trait ChunkOracle {
    fn is_chunk_loaded(&self, chunk: ChunkPos) -> bool;
}

/// Oracle for hosts without streaming: every chunk is always loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllLoaded;

impl ChunkOracle for AllLoaded {
    fn is_chunk_loaded(&self, _chunk: ChunkPos) -> bool {
        true
    }
}

/// Explicit loaded-chunk set, driven by the host's streaming layer.
#[derive(Debug, Clone, Default)]
pub struct LoadedSet {
    loaded: FxHashSet<ChunkPos>,
}

impl LoadedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&mut self, chunk: ChunkPos) {
        self.loaded.insert(chunk);
    }

    pub fn unload(&mut self, chunk: ChunkPos) {
        self.loaded.remove(&chunk);
    }
}

impl ChunkOracle for LoadedSet {
    fn is_chunk_loaded(&self, chunk: ChunkPos) -> bool {
        self.loaded.contains(&chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loaded_set_tracks_load_state() {
        let mut set = LoadedSet::new();
        let chunk = ChunkPos::new(0, 0, 0);
        assert!(!set.is_chunk_loaded(chunk));

        set.load(chunk);
        assert!(set.is_chunk_loaded(chunk));

        set.unload(chunk);
        assert!(!set.is_chunk_loaded(chunk));
    }
}
