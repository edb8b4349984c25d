//! Draw-call slot allocation and per-instance attribute textures for instanced vegetation.

pub mod allocator;
pub mod attribute;
pub mod gpu;

pub use allocator::*;
pub use attribute::*;
pub use gpu::*;
