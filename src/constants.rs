//! Engine-wide constants.

/// Core spatial constants shared by every module.
pub mod core {
    /// Log2 of the chunk edge length; chunk coordinates are derived from
    /// block coordinates by an arithmetic shift of this many bits.
    pub const CHUNK_SHIFT: u32 = 4;

    /// Chunk edge length in blocks.
    pub const CHUNK_SIZE: i32 = 1 << CHUNK_SHIFT;
}
