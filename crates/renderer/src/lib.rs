//! Rendering for streamed instanced vegetation using wgpu.

pub mod atlas;
pub mod camera;
pub mod headless;
pub mod import;
pub mod instancing;
pub mod mesh;
pub mod vertex;

pub use atlas::*;
pub use camera::*;
pub use headless::*;
pub use import::*;
pub use instancing::*;
pub use mesh::*;
pub use vertex::*;
