//! Per-instance collider lifecycle.

use engine_core::{Quat, Vec3};
use physics::{ColliderHandle, PhysicsError, PhysicsWorld, ShapeHandle};
use std::fmt::Debug;
use std::hash::Hash;

/// The physics side of the renderer: one cooked shape per variant, one collider per instance.
pub trait CollisionBackend {
    type Shape: Copy + Debug;
    type Handle: Copy + Eq + Hash + Debug;

    fn cook_convex_shape(&mut self, points: &[Vec3]) -> Result<Self::Shape, PhysicsError>;
    fn add_convex_instance(
        &mut self,
        shape: Self::Shape,
        position: Vec3,
        orientation: Quat,
    ) -> Result<Self::Handle, PhysicsError>;
    /// Returns false if the handle was unknown.
    fn remove_instance(&mut self, handle: Self::Handle) -> bool;
}

impl CollisionBackend for PhysicsWorld {
    type Shape = ShapeHandle;
    type Handle = ColliderHandle;

    fn cook_convex_shape(&mut self, points: &[Vec3]) -> Result<ShapeHandle, PhysicsError> {
        PhysicsWorld::cook_convex_shape(self, points)
    }

    fn add_convex_instance(
        &mut self,
        shape: ShapeHandle,
        position: Vec3,
        orientation: Quat,
    ) -> Result<ColliderHandle, PhysicsError> {
        PhysicsWorld::add_convex_instance(self, shape, position, orientation)
    }

    fn remove_instance(&mut self, handle: ColliderHandle) -> bool {
        PhysicsWorld::remove_instance(self, handle)
    }
}
