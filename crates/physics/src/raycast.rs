//! Raycasting for instance picking and queries.

use crate::collision::CollisionGroup;
use crate::PhysicsWorld;
use engine_core::Vec3;
use rapier3d::prelude::*;

/// Result of a raycast query.
#[derive(Debug, Clone, Copy)]
pub struct RaycastHit {
    /// The collider that was hit.
    pub collider: ColliderHandle,
    /// Distance along the ray to the hit point.
    pub distance: f32,
    /// World position of the hit.
    pub point: Vec3,
    /// Surface normal at the hit point.
    pub normal: Vec3,
}

impl PhysicsWorld {
    /// Cast a ray and return the first hit.
    pub fn raycast(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<RaycastHit> {
        self.raycast_filtered(origin, direction, max_distance, QueryFilter::default())
    }

    /// First vegetation instance along a ray, ignoring ground and other environment.
    pub fn pick_vegetation(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<RaycastHit> {
        let filter = QueryFilter::default().groups(CollisionGroup::vegetation_query());
        self.raycast_filtered(origin, direction, max_distance, filter)
    }

    fn raycast_filtered(
        &self,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
        filter: QueryFilter,
    ) -> Option<RaycastHit> {
        let ray = Ray::new(
            point![origin.x, origin.y, origin.z],
            vector![direction.x, direction.y, direction.z],
        );

        self.query_pipeline
            .cast_ray_and_get_normal(
                &self.rigid_body_set,
                &self.collider_set,
                &ray,
                max_distance,
                true,
                filter,
            )
            .map(|(collider, intersection)| {
                let point = ray.point_at(intersection.time_of_impact);
                RaycastHit {
                    collider,
                    distance: intersection.time_of_impact,
                    point: Vec3::new(point.x, point.y, point.z),
                    normal: Vec3::new(
                        intersection.normal.x,
                        intersection.normal.y,
                        intersection.normal.z,
                    ),
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_core::Quat;

    fn world_with_bush_at(x: f32) -> (PhysicsWorld, ColliderHandle) {
        let mut world = PhysicsWorld::new();
        world.add_ground_plane();
        let shape = world
            .cook_convex_shape(&[
                Vec3::new(-0.5, 0.0, -0.5),
                Vec3::new(0.5, 0.0, -0.5),
                Vec3::new(-0.5, 0.0, 0.5),
                Vec3::new(0.5, 0.0, 0.5),
                Vec3::new(0.0, 1.5, 0.0),
            ])
            .unwrap();
        let bush = world
            .add_convex_instance(shape, Vec3::new(x, 0.0, 0.0), Quat::IDENTITY)
            .unwrap();
        world.update_query_pipeline();
        (world, bush)
    }

    #[test]
    fn pick_hits_vegetation_not_ground() {
        let (world, bush) = world_with_bush_at(5.0);
        let hit = world
            .pick_vegetation(Vec3::new(0.0, 0.5, 0.0), Vec3::X, 100.0)
            .expect("ray should hit the bush");
        assert_eq!(hit.collider, bush);
        assert!(hit.distance > 4.0 && hit.distance < 5.0);

        assert!(world.pick_vegetation(Vec3::new(0.0, 5.0, 0.0), -Vec3::Y, 100.0).is_none());
        assert!(world.raycast(Vec3::new(0.0, 5.0, 0.0), -Vec3::Y, 100.0).is_some());
    }
}
