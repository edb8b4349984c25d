//! Physics for vegetation instances using Rapier3D.

pub mod collision;
pub mod physics_world;
pub mod raycast;

pub use collision::*;
pub use physics_world::*;
pub use raycast::*;

// Re-export Rapier for downstream crates
pub use rapier3d;

pub use rapier3d::prelude::ColliderHandle;
