//! Rigid transforms for placed instances.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec3};

/// Rotation followed by translation. Instances never carry scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }
}

impl Transform {
    /// Create a new transform at the given position.
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Create a new transform with position and rotation.
    pub fn from_position_rotation(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    /// Rebuild from the packed attribute layout (xyz, xyzw).
    pub fn from_packed(position: [f32; 3], orientation: [f32; 4]) -> Self {
        Self {
            position: Vec3::from_array(position),
            rotation: Quat::from_array(orientation),
        }
    }

    /// Model matrix for this transform.
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.position)
    }

    /// Rotate then translate a local-space point; the vertex stage does the same.
    pub fn transform_point(&self, local: Vec3) -> Vec3 {
        self.rotation * local + self.position
    }

    /// Get the forward direction (negative Z in right-handed coordinates).
    pub fn forward(&self) -> Vec3 {
        self.rotation * -Vec3::Z
    }

    /// Get the right direction (positive X).
    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    /// Translate the transform by a delta.
    pub fn translate(&mut self, delta: Vec3) {
        self.position += delta;
    }

    /// Rotate around the Y axis (yaw).
    pub fn rotate_y(&mut self, angle: f32) {
        self.rotation = Quat::from_rotation_y(angle) * self.rotation;
    }

    pub fn packed(&self) -> PackedTransform {
        PackedTransform {
            position: self.position.to_array(),
            orientation: self.rotation.to_array(),
        }
    }
}

/// Transform split into the two attribute channels uploaded per instance.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PackedTransform {
    pub position: [f32; 3],
    pub orientation: [f32; 4],
}

impl From<PackedTransform> for Transform {
    fn from(p: PackedTransform) -> Self {
        Transform::from_packed(p.position, p.orientation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_point_rotates_before_translating() {
        let t = Transform::from_position_rotation(
            Vec3::new(10.0, 0.0, 0.0),
            Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
        );
        let p = t.transform_point(Vec3::X);
        assert!((p - Vec3::new(10.0, 0.0, -1.0)).length() < 1e-5);
        let m = t.to_matrix().transform_point3(Vec3::X);
        assert!((m - p).length() < 1e-5);
    }

    #[test]
    fn packed_transform_preserves_components() {
        let t = Transform::from_position_rotation(Vec3::new(1.0, 2.0, 3.0), Quat::from_rotation_x(0.3));
        let back: Transform = t.packed().into();
        assert_eq!(back, t);
    }
}
