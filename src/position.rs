//! Spatial position types.
//!
//! `BlockPos` is the per-block coordinate every spatial lookup is keyed on;
//! `ChunkPos` is the coarse bucket whose load state gates whether the blocks
//! inside it are safely queryable.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::core::CHUNK_SHIFT;

/// Integer block coordinate. Equality and hashing are by value; ordering is
/// lexicographic (x, then y, then z), which gives every set of positions a
/// single deterministic minimum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// The six axis-adjacent positions, in a fixed order. No diagonals.
    pub fn neighbors6(self) -> [BlockPos; 6] {
        [
            BlockPos::new(self.x - 1, self.y, self.z),
            BlockPos::new(self.x, self.y - 1, self.z),
            BlockPos::new(self.x, self.y, self.z - 1),
            BlockPos::new(self.x, self.y, self.z + 1),
            BlockPos::new(self.x, self.y + 1, self.z),
            BlockPos::new(self.x + 1, self.y, self.z),
        ]
    }

    /// The chunk containing this position. Arithmetic shift, so negative
    /// coordinates round toward negative infinity.
    pub fn chunk(self) -> ChunkPos {
        ChunkPos {
            x: self.x >> CHUNK_SHIFT,
            y: self.y >> CHUNK_SHIFT,
            z: self.z >> CHUNK_SHIFT,
        }
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Chunk coordinate in chunk units.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ChunkPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.x, self.y, self.z)
    }
}
