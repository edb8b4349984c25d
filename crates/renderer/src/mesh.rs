//! Mesh data structures and primitive generation.

use crate::vertex::Vertex;
use engine_core::Aabb;
use glam::Vec3;
use std::ops::Range;
use wgpu::util::DeviceExt;

/// A GPU mesh with vertex and index buffers.
pub struct Mesh {
    pub vertex_buffer: wgpu::Buffer,
    pub index_buffer: wgpu::Buffer,
    pub num_indices: u32,
}

impl Mesh {
    /// Create a mesh from vertex and index data.
    pub fn new(device: &wgpu::Device, vertices: &[Vertex], indices: &[u32]) -> Self {
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Vertex Buffer"),
            contents: bytemuck::cast_slice(vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Index Buffer"),
            contents: bytemuck::cast_slice(indices),
            usage: wgpu::BufferUsages::INDEX,
        });

        Self {
            vertex_buffer,
            index_buffer,
            num_indices: indices.len() as u32,
        }
    }
}

/// Where one sub-mesh lives inside a merged vertex/index buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshRange {
    pub vertices: Range<u32>,
    pub indices: Range<u32>,
}

impl MeshRange {
    pub fn index_count(&self) -> u32 {
        self.indices.end - self.indices.start
    }
}

/// Mesh data before GPU upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upload(&self, device: &wgpu::Device) -> Mesh {
        Mesh::new(device, &self.vertices, &self.indices)
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.indices.is_empty()
    }

    pub fn positions(&self) -> impl Iterator<Item = Vec3> + '_ {
        self.vertices.iter().map(|v| Vec3::from_array(v.position))
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::from_points(self.positions())
    }

    /// Append `other`, keeping its indices relative to its own first vertex.
    ///
    /// Returns the ranges it occupies; draws use `vertices.start` as base vertex.
    pub fn append(&mut self, other: &MeshData) -> MeshRange {
        let first_vertex = self.vertices.len() as u32;
        let first_index = self.indices.len() as u32;
        self.vertices.extend_from_slice(&other.vertices);
        self.indices.extend_from_slice(&other.indices);
        MeshRange {
            vertices: first_vertex..self.vertices.len() as u32,
            indices: first_index..self.indices.len() as u32,
        }
    }

    /// Two crossed vertical quads standing on the origin (grass / shrub card).
    pub fn cross_quads(width: f32, height: f32) -> Self {
        let h = width / 2.0;
        let mut mesh = MeshData::new();
        for (axis, normal) in [(Vec3::X, [0.0, 0.0, 1.0]), (Vec3::Z, [1.0, 0.0, 0.0])] {
            let base = mesh.vertices.len() as u32;
            let a = -axis * h;
            let b = axis * h;
            mesh.vertices.extend_from_slice(&[
                Vertex::new([a.x, 0.0, a.z], normal, [0.0, 1.0]),
                Vertex::new([b.x, 0.0, b.z], normal, [1.0, 1.0]),
                Vertex::new([b.x, height, b.z], normal, [1.0, 0.0]),
                Vertex::new([a.x, height, a.z], normal, [0.0, 0.0]),
            ]);
            mesh.indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
        }
        mesh
    }

    /// Box resting on the origin with the given half extents (rock / boulder).
    pub fn cube(half_extents: Vec3) -> Self {
        let Vec3 { x, y, z } = half_extents;
        let y0 = 0.0;
        let y1 = 2.0 * y;
        let vertices = vec![
            // Front face
            Vertex::new([-x, y0, z], [0.0, 0.0, 1.0], [0.0, 1.0]),
            Vertex::new([x, y0, z], [0.0, 0.0, 1.0], [1.0, 1.0]),
            Vertex::new([x, y1, z], [0.0, 0.0, 1.0], [1.0, 0.0]),
            Vertex::new([-x, y1, z], [0.0, 0.0, 1.0], [0.0, 0.0]),
            // Back face
            Vertex::new([x, y0, -z], [0.0, 0.0, -1.0], [0.0, 1.0]),
            Vertex::new([-x, y0, -z], [0.0, 0.0, -1.0], [1.0, 1.0]),
            Vertex::new([-x, y1, -z], [0.0, 0.0, -1.0], [1.0, 0.0]),
            Vertex::new([x, y1, -z], [0.0, 0.0, -1.0], [0.0, 0.0]),
            // Top face
            Vertex::new([-x, y1, z], [0.0, 1.0, 0.0], [0.0, 1.0]),
            Vertex::new([x, y1, z], [0.0, 1.0, 0.0], [1.0, 1.0]),
            Vertex::new([x, y1, -z], [0.0, 1.0, 0.0], [1.0, 0.0]),
            Vertex::new([-x, y1, -z], [0.0, 1.0, 0.0], [0.0, 0.0]),
            // Bottom face
            Vertex::new([-x, y0, -z], [0.0, -1.0, 0.0], [0.0, 1.0]),
            Vertex::new([x, y0, -z], [0.0, -1.0, 0.0], [1.0, 1.0]),
            Vertex::new([x, y0, z], [0.0, -1.0, 0.0], [1.0, 0.0]),
            Vertex::new([-x, y0, z], [0.0, -1.0, 0.0], [0.0, 0.0]),
            // Right face
            Vertex::new([x, y0, z], [1.0, 0.0, 0.0], [0.0, 1.0]),
            Vertex::new([x, y0, -z], [1.0, 0.0, 0.0], [1.0, 1.0]),
            Vertex::new([x, y1, -z], [1.0, 0.0, 0.0], [1.0, 0.0]),
            Vertex::new([x, y1, z], [1.0, 0.0, 0.0], [0.0, 0.0]),
            // Left face
            Vertex::new([-x, y0, -z], [-1.0, 0.0, 0.0], [0.0, 1.0]),
            Vertex::new([-x, y0, z], [-1.0, 0.0, 0.0], [1.0, 1.0]),
            Vertex::new([-x, y1, z], [-1.0, 0.0, 0.0], [1.0, 0.0]),
            Vertex::new([-x, y1, -z], [-1.0, 0.0, 0.0], [0.0, 0.0]),
        ];

        #[rustfmt::skip]
        let indices = vec![
            0, 1, 2, 2, 3, 0,       // Front
            4, 5, 6, 6, 7, 4,       // Back
            8, 9, 10, 10, 11, 8,    // Top
            12, 13, 14, 14, 15, 12, // Bottom
            16, 17, 18, 18, 19, 16, // Right
            20, 21, 22, 22, 23, 20, // Left
        ];

        Self { vertices, indices }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_reports_ranges_into_merged_buffer() {
        let mut merged = MeshData::new();
        let a = merged.append(&MeshData::cross_quads(1.0, 1.0));
        let b = merged.append(&MeshData::cube(Vec3::ONE));
        assert_eq!(a.vertices, 0..8);
        assert_eq!(a.indices, 0..12);
        assert_eq!(b.vertices, 8..32);
        assert_eq!(b.indices, 12..48);
        assert_eq!(b.index_count(), 36);
        // Indices stay local to each sub-mesh; the draw supplies the base vertex.
        assert!(merged.indices[b.indices.start as usize..].iter().all(|&i| i < 24));
    }

    #[test]
    fn cube_rests_on_origin() {
        let b = MeshData::cube(Vec3::new(1.0, 0.5, 2.0)).bounds();
        assert_eq!(b.min, Vec3::new(-1.0, 0.0, -2.0));
        assert_eq!(b.max, Vec3::new(1.0, 1.0, 2.0));
    }
}
