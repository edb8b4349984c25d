//! Procedural placement of vegetation instances.

pub mod scatter;

pub use scatter::*;
