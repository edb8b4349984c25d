//! Streamed, GPU-instanced vegetation.
//!
//! Chunk events from a [`streaming::ChunkTracker`] drive a [`batch::VegetationRenderer`],
//! which fetches placements, packs instances into draw-call slots of the shared
//! [`renderer::InstancedGeometryAllocator`] and gives each instance a collider.

pub mod batch;
pub mod collision;
pub mod config;
pub mod layer;
pub mod registry;
pub mod source;
pub mod streaming;

pub use batch::*;
pub use collision::*;
pub use config::*;
pub use layer::*;
pub use registry::*;
pub use source::*;
pub use streaming::*;
