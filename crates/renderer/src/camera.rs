//! Viewer camera, its GPU uniform, and frustum culling.

use bytemuck::{Pod, Zeroable};
use engine_core::{Aabb, Transform};
use glam::{Mat4, Vec3, Vec4};

/// Perspective camera with configurable FOV and clipping planes.
#[derive(Debug, Clone)]
pub struct Camera {
    /// Camera transform (position and rotation).
    pub transform: Transform,
    /// Field of view in degrees.
    pub fov_degrees: f32,
    pub near: f32,
    pub far: f32,
    /// Aspect ratio (width / height).
    pub aspect: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            transform: Transform::default(),
            fov_degrees: 70.0,
            near: 0.1,
            far: 1000.0,
            aspect: 16.0 / 9.0,
        }
    }
}

impl Camera {
    /// Create a new camera at the given position.
    pub fn new(position: Vec3) -> Self {
        Self {
            transform: Transform::from_position(position),
            ..Default::default()
        }
    }

    /// Update aspect ratio (call on resize).
    pub fn set_aspect(&mut self, width: u32, height: u32) {
        self.aspect = width as f32 / height.max(1) as f32;
    }

    /// Point the camera at `target`.
    pub fn look_at(&mut self, target: Vec3) {
        let dir = (target - self.transform.position).normalize_or_zero();
        if dir.length_squared() > 0.0 {
            let view = Mat4::look_to_rh(self.transform.position, dir, Vec3::Y);
            self.transform.rotation = glam::Quat::from_mat4(&view.inverse());
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        let eye = self.transform.position;
        Mat4::look_to_rh(eye, self.transform.forward(), Vec3::Y)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_degrees.to_radians(), self.aspect, self.near, self.far)
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    pub fn position(&self) -> Vec3 {
        self.transform.position
    }

    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(&self.view_projection_matrix())
    }
}

/// Camera uniform data for GPU (must match vegetation.wgsl `Camera`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CameraUniform {
    pub view_proj: [[f32; 4]; 4],
    pub position: [f32; 4], // w unused, padding
}

impl CameraUniform {
    pub fn new() -> Self {
        Self {
            view_proj: Mat4::IDENTITY.to_cols_array_2d(),
            position: [0.0; 4],
        }
    }

    pub fn update(&mut self, camera: &Camera) {
        self.view_proj = camera.view_projection_matrix().to_cols_array_2d();
        let pos = camera.position();
        self.position = [pos.x, pos.y, pos.z, 1.0];
    }
}

impl Default for CameraUniform {
    fn default() -> Self {
        Self::new()
    }
}

/// Six clip planes (xyz = normal pointing inside, w = distance).
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    /// Extract planes from a view-projection matrix with wgpu's 0..1 depth range.
    pub fn from_view_projection(m: &Mat4) -> Self {
        let (r0, r1, r2, r3) = (m.row(0), m.row(1), m.row(2), m.row(3));
        let planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2].map(|p| {
            let len = p.truncate().length();
            if len > 0.0 {
                p / len
            } else {
                p
            }
        });
        Self { planes }
    }

    /// Conservative box test: false only when the box is fully outside one plane.
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        if aabb.is_empty() {
            return false;
        }
        self.planes.iter().all(|plane| {
            let n = plane.truncate();
            let positive = Vec3::select(n.cmpge(Vec3::ZERO), aabb.max, aabb.min);
            n.dot(positive) + plane.w >= 0.0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera_looking_down_neg_z() -> Camera {
        Camera {
            aspect: 1.0,
            ..Camera::new(Vec3::ZERO)
        }
    }

    #[test]
    fn frustum_keeps_boxes_in_front() {
        let f = camera_looking_down_neg_z().frustum();
        let ahead = Aabb::new(Vec3::new(-1.0, -1.0, -12.0), Vec3::new(1.0, 1.0, -10.0));
        assert!(f.intersects_aabb(&ahead));
    }

    #[test]
    fn frustum_rejects_boxes_behind_or_beyond_far() {
        let f = camera_looking_down_neg_z().frustum();
        let behind = Aabb::new(Vec3::new(-1.0, -1.0, 10.0), Vec3::new(1.0, 1.0, 12.0));
        let far = Aabb::new(Vec3::new(-1.0, -1.0, -2000.0), Vec3::new(1.0, 1.0, -1500.0));
        assert!(!f.intersects_aabb(&behind));
        assert!(!f.intersects_aabb(&far));
        assert!(!f.intersects_aabb(&Aabb::EMPTY));
    }

    #[test]
    fn look_at_faces_target() {
        let mut cam = Camera::new(Vec3::new(0.0, 10.0, 0.0));
        cam.look_at(Vec3::new(10.0, 10.0, 0.0));
        assert!((cam.transform.forward() - Vec3::X).length() < 1e-4);
    }
}
