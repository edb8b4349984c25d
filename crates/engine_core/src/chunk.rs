//! Chunk coordinates for the streamed world grid.

use glam::{Vec2, Vec3};
use std::fmt;

/// Integer chunk coordinate on the XZ plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChunkCoord {
    pub x: i32,
    pub z: i32,
}

impl ChunkCoord {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Chunk containing the given world position.
    pub fn from_world(position: Vec3, chunk_size: f32) -> Self {
        Self {
            x: (position.x / chunk_size).floor() as i32,
            z: (position.z / chunk_size).floor() as i32,
        }
    }

    /// World-space XZ of the chunk's minimum corner.
    pub fn min_corner(self, chunk_size: f32) -> Vec2 {
        Vec2::new(self.x as f32 * chunk_size, self.z as f32 * chunk_size)
    }

    /// World-space XZ of the chunk centre.
    pub fn center(self, chunk_size: f32) -> Vec2 {
        self.min_corner(chunk_size) + Vec2::splat(chunk_size * 0.5)
    }

    /// Chebyshev (ring) distance between two chunks.
    pub fn ring_distance(self, other: ChunkCoord) -> u32 {
        (self.x - other.x).unsigned_abs().max((self.z - other.z).unsigned_abs())
    }
}

impl fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

/// A chunk at a particular level of detail. Streaming events are keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub coord: ChunkCoord,
    pub lod: u32,
}

impl ChunkKey {
    pub const fn new(coord: ChunkCoord, lod: u32) -> Self {
        Self { coord, lod }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@lod{}", self.coord, self.lod)
    }
}
