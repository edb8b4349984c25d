//! Core engine types shared by the vegetation streaming crates.
//!
//! This crate provides the foundational types used across all engine systems:
//! - Chunk coordinates and keys for the streamed world grid
//! - Axis-aligned bounding volumes
//! - Rigid transforms packed for GPU attribute buffers
//! - Frame timing and tick throttling

pub mod bounds;
pub mod chunk;
pub mod time;
pub mod transform;

pub use bounds::*;
pub use chunk::*;
pub use time::*;
pub use transform::*;

// Re-export commonly used types
pub use glam::{IVec2, Mat4, Quat, Vec2, Vec3, Vec4};
