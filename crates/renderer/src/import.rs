//! glTF import of vegetation meshes and their material maps.
//!
//! Every mesh-carrying node becomes one named [`ImportedMesh`] with its world transform
//! baked into the vertices. Names follow the node name, falling back to the mesh name.

use crate::atlas::MaterialMaps;
use crate::mesh::MeshData;
use crate::vertex::Vertex;
use anyhow::{Context, Result};
use glam::{Mat3, Mat4, Vec3};
use image::RgbaImage;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ImportedMesh {
    pub name: String,
    pub mesh: MeshData,
    pub maps: MaterialMaps,
}

/// Load every named mesh node from a `.gltf` / `.glb` file.
pub fn import_meshes(path: impl AsRef<Path>) -> Result<Vec<ImportedMesh>> {
    let path = path.as_ref();
    let (document, buffers, images) =
        gltf::import(path).with_context(|| format!("Failed to import glTF {}", path.display()))?;
    let meshes = collect_meshes(&document, &buffers, &images);
    log::info!("Imported {} meshes from {}", meshes.len(), path.display());
    Ok(meshes)
}

/// Same as [`import_meshes`] for an in-memory `.glb`.
pub fn import_meshes_from_slice(bytes: &[u8]) -> Result<Vec<ImportedMesh>> {
    let (document, buffers, images) = gltf::import_slice(bytes).context("Failed to import glTF from memory")?;
    Ok(collect_meshes(&document, &buffers, &images))
}

fn collect_meshes(
    document: &gltf::Document,
    buffers: &[gltf::buffer::Data],
    images: &[gltf::image::Data],
) -> Vec<ImportedMesh> {
    let mut out = Vec::new();
    let roots: Vec<gltf::Node> = match document.default_scene().or_else(|| document.scenes().next()) {
        Some(scene) => scene.nodes().collect(),
        None => document.nodes().collect(),
    };
    for node in roots {
        visit_node(&node, Mat4::IDENTITY, buffers, images, &mut out);
    }
    out
}

fn visit_node(
    node: &gltf::Node,
    parent: Mat4,
    buffers: &[gltf::buffer::Data],
    images: &[gltf::image::Data],
    out: &mut Vec<ImportedMesh>,
) {
    let world = parent * Mat4::from_cols_array_2d(&node.transform().matrix());
    if let Some(mesh) = node.mesh() {
        let name = node
            .name()
            .or_else(|| mesh.name())
            .map(str::to_owned)
            .unwrap_or_else(|| format!("mesh_{}", mesh.index()));
        let normal_matrix = Mat3::from_mat4(world).inverse().transpose();
        let mut data = MeshData::new();
        let mut maps = MaterialMaps::default();

        for primitive in mesh.primitives() {
            let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|b| &b[..]));
            let Some(positions) = reader.read_positions() else {
                log::warn!("Primitive in mesh '{}' has no positions, skipping", name);
                continue;
            };
            let positions: Vec<[f32; 3]> = positions.collect();
            let normals: Vec<[f32; 3]> = reader
                .read_normals()
                .map(|n| n.collect())
                .unwrap_or_else(|| vec![[0.0, 1.0, 0.0]; positions.len()]);
            let uvs: Vec<[f32; 2]> = reader
                .read_tex_coords(0)
                .map(|t| t.into_f32().collect())
                .unwrap_or_else(|| vec![[0.0, 0.0]; positions.len()]);
            let indices: Vec<u32> = reader
                .read_indices()
                .map(|i| i.into_u32().collect())
                .unwrap_or_else(|| (0..positions.len() as u32).collect());

            let part = MeshData {
                vertices: positions
                    .iter()
                    .zip(normals.iter())
                    .zip(uvs.iter())
                    .map(|((p, n), uv)| {
                        let p = world.transform_point3(Vec3::from(*p));
                        let n = (normal_matrix * Vec3::from(*n)).normalize_or_zero();
                        Vertex::new(p.to_array(), n.to_array(), *uv)
                    })
                    .collect(),
                indices,
            };
            let range = data.append(&part);
            // `append` keeps indices local to each part; rebase them into the merged mesh.
            for index in &mut data.indices[range.indices.start as usize..range.indices.end as usize] {
                *index += range.vertices.start;
            }

            let material = primitive.material();
            if maps.color.is_none() {
                maps.color = material
                    .pbr_metallic_roughness()
                    .base_color_texture()
                    .and_then(|info| images.get(info.texture().source().index()))
                    .and_then(to_rgba);
            }
            if maps.normal.is_none() {
                maps.normal = material
                    .normal_texture()
                    .and_then(|info| images.get(info.texture().source().index()))
                    .and_then(to_rgba);
            }
        }

        if data.is_empty() {
            log::warn!("Mesh '{}' produced no geometry", name);
        } else {
            out.push(ImportedMesh { name, mesh: data, maps });
        }
    }
    for child in node.children() {
        visit_node(&child, world, buffers, images, out);
    }
}

fn to_rgba(data: &gltf::image::Data) -> Option<RgbaImage> {
    use gltf::image::Format;
    let pixels = match data.format {
        Format::R8G8B8A8 => data.pixels.clone(),
        Format::R8G8B8 => data
            .pixels
            .chunks_exact(3)
            .flat_map(|c| [c[0], c[1], c[2], 255])
            .collect(),
        Format::R8 => data.pixels.iter().flat_map(|&v| [v, v, v, 255]).collect(),
        other => {
            log::warn!("Unsupported glTF image format {:?}, using default material", other);
            return None;
        }
    };
    RgbaImage::from_raw(data.width, data.height, pixels)
}
