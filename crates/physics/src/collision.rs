//! Collision groups and filtering.

use rapier3d::prelude::*;

/// Collision groups for the kinds of colliders in a vegetation world.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionGroup {
    /// Static environment (ground, terrain)
    Environment = 1 << 0,
    /// Streamed vegetation instances
    Vegetation = 1 << 1,
    /// Picking rays and sensors
    Query = 1 << 2,
}

impl CollisionGroup {
    pub fn bits(self) -> Group {
        Group::from_bits_retain(self as u32)
    }

    /// Environment collides with everything.
    pub fn environment() -> InteractionGroups {
        InteractionGroups::new(Self::Environment.bits(), Group::ALL)
    }

    /// Vegetation only answers queries; instances never touch each other or the ground.
    pub fn vegetation() -> InteractionGroups {
        InteractionGroups::new(Self::Vegetation.bits(), Self::Query.bits())
    }

    /// Filter for rays that should only hit vegetation.
    pub fn vegetation_query() -> InteractionGroups {
        InteractionGroups::new(Self::Query.bits(), Self::Vegetation.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vegetation_ignores_itself_but_answers_queries() {
        let veg = CollisionGroup::vegetation();
        assert!(!veg.test(veg));
        assert!(veg.test(CollisionGroup::vegetation_query()));
        assert!(!CollisionGroup::environment().test(CollisionGroup::vegetation_query()));
    }

    #[test]
    fn vegetation_does_not_touch_ground() {
        assert!(!CollisionGroup::vegetation().test(CollisionGroup::environment()));
    }
}
