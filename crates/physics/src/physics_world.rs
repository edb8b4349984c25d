//! Physics world management with Rapier3D.

use crate::collision::CollisionGroup;
use engine_core::{Quat, Vec3};
use rapier3d::na::{Isometry3, Quaternion, Translation3, UnitQuaternion};
use rapier3d::prelude::*;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PhysicsError {
    #[error("convex hull needs at least 4 non-coplanar points, got {0}")]
    DegenerateHull(usize),
    #[error("unknown shape handle {0:?}")]
    UnknownShape(ShapeHandle),
}

/// Index of a cooked collision shape, shared by every instance of a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeHandle(pub u32);

fn isometry(position: Vec3, rotation: Quat) -> Isometry3<Real> {
    Isometry3::from_parts(
        Translation3::new(position.x, position.y, position.z),
        UnitQuaternion::from_quaternion(Quaternion::new(rotation.w, rotation.x, rotation.y, rotation.z)),
    )
}

/// Whether the points enclose a non-zero volume (at least four, not all coplanar).
fn spans_volume(points: &[Vec3]) -> bool {
    const EPS: f32 = 1e-5;
    let Some(&p0) = points.first() else {
        return false;
    };
    let Some(p1) = points
        .iter()
        .copied()
        .max_by(|a, b| a.distance_squared(p0).total_cmp(&b.distance_squared(p0)))
    else {
        return false;
    };
    let axis = p1 - p0;
    let normal = points
        .iter()
        .map(|&p| axis.cross(p - p0))
        .max_by(|a, b| a.length_squared().total_cmp(&b.length_squared()))
        .unwrap_or(Vec3::ZERO);
    if normal.length_squared() < EPS {
        return false;
    }
    let normal = normal.normalize();
    points.iter().any(|&p| normal.dot(p - p0).abs() > EPS)
}

/// Collider world for vegetation instances and the ground they stand on.
pub struct PhysicsWorld {
    pub rigid_body_set: RigidBodySet,
    pub collider_set: ColliderSet,
    pub island_manager: IslandManager,
    pub query_pipeline: QueryPipeline,
    shapes: Vec<SharedShape>,
}

impl Default for PhysicsWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicsWorld {
    pub fn new() -> Self {
        Self {
            rigid_body_set: RigidBodySet::new(),
            collider_set: ColliderSet::new(),
            island_manager: IslandManager::new(),
            query_pipeline: QueryPipeline::new(),
            shapes: Vec::new(),
        }
    }

    /// Update query pipeline for raycasting.
    pub fn update_query_pipeline(&mut self) {
        self.query_pipeline.update(&self.collider_set);
    }

    /// Cook a convex hull from mesh vertex positions.
    pub fn cook_convex_shape(&mut self, points: &[Vec3]) -> Result<ShapeHandle, PhysicsError> {
        if !spans_volume(points) {
            return Err(PhysicsError::DegenerateHull(points.len()));
        }
        let points: Vec<Point<Real>> = points.iter().map(|p| point![p.x, p.y, p.z]).collect();
        let shape = SharedShape::convex_hull(&points).ok_or(PhysicsError::DegenerateHull(points.len()))?;
        let handle = ShapeHandle(self.shapes.len() as u32);
        self.shapes.push(shape);
        log::debug!("Cooked convex shape {:?} from {} points", handle, points.len());
        Ok(handle)
    }

    pub fn shape_count(&self) -> usize {
        self.shapes.len()
    }

    /// Place one static instance of a cooked shape in the vegetation group.
    pub fn add_convex_instance(
        &mut self,
        shape: ShapeHandle,
        position: Vec3,
        rotation: Quat,
    ) -> Result<ColliderHandle, PhysicsError> {
        let shape = self
            .shapes
            .get(shape.0 as usize)
            .cloned()
            .ok_or(PhysicsError::UnknownShape(shape))?;
        let collider = ColliderBuilder::new(shape)
            .position(isometry(position, rotation))
            .collision_groups(CollisionGroup::vegetation())
            .build();
        Ok(self.collider_set.insert(collider))
    }

    /// Remove an instance collider. Returns false if the handle is unknown.
    pub fn remove_instance(&mut self, handle: ColliderHandle) -> bool {
        if !self.collider_set.contains(handle) {
            return false;
        }
        self.remove_collider(handle);
        true
    }

    /// Add a ground plane collider (flat Y=0 half-space).
    pub fn add_ground_plane(&mut self) -> ColliderHandle {
        let collider = ColliderBuilder::halfspace(Vector::y_axis())
            .collision_groups(CollisionGroup::environment())
            .build();
        self.collider_set.insert(collider)
    }

    /// Remove a collider by its handle.
    pub fn remove_collider(&mut self, handle: ColliderHandle) {
        self.collider_set.remove(
            handle,
            &mut self.island_manager,
            &mut self.rigid_body_set,
            true,
        );
    }

    pub fn collider_count(&self) -> usize {
        self.collider_set.len()
    }

    pub fn contains(&self, handle: ColliderHandle) -> bool {
        self.collider_set.contains(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_cube_points() -> Vec<Vec3> {
        let mut pts = Vec::new();
        for x in [-0.5, 0.5] {
            for y in [0.0, 1.0] {
                for z in [-0.5, 0.5] {
                    pts.push(Vec3::new(x, y, z));
                }
            }
        }
        pts
    }

    #[test]
    fn degenerate_hull_is_rejected() {
        let mut world = PhysicsWorld::new();
        let flat = [Vec3::ZERO, Vec3::X, Vec3::Z];
        assert!(matches!(world.cook_convex_shape(&flat), Err(PhysicsError::DegenerateHull(3))));
        assert_eq!(world.shape_count(), 0);
    }

    #[test]
    fn static_instances_add_and_remove() {
        let mut world = PhysicsWorld::new();
        let shape = world.cook_convex_shape(&unit_cube_points()).unwrap();
        let a = world.add_convex_instance(shape, Vec3::new(3.0, 0.0, 1.0), Quat::IDENTITY).unwrap();
        let b = world
            .add_convex_instance(shape, Vec3::new(-3.0, 0.0, 1.0), Quat::from_rotation_y(1.0))
            .unwrap();
        assert_eq!(world.collider_count(), 2);
        assert_eq!(world.rigid_body_set.len(), 0);
        let t = world.collider_set[a].translation();
        assert!((Vec3::new(t.x, t.y, t.z) - Vec3::new(3.0, 0.0, 1.0)).length() < 1e-5);

        assert!(world.remove_instance(a));
        assert!(!world.remove_instance(a));
        assert!(world.contains(b));
        assert_eq!(world.collider_count(), 1);
    }

    #[test]
    fn unknown_shape_errors() {
        let mut world = PhysicsWorld::new();
        let err = world
            .add_convex_instance(ShapeHandle(7), Vec3::ZERO, Quat::IDENTITY)
            .unwrap_err();
        assert_eq!(err, PhysicsError::UnknownShape(ShapeHandle(7)));
    }
}
