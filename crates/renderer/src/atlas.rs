//! Texture atlas packing for geometry variants.
//!
//! Every variant's material maps are packed into one shared image per channel so all
//! variants can be drawn with a single material. Each variant's UVs are remapped once,
//! at build time, into the sub-rectangle it was assigned.

use crate::mesh::MeshData;
use glam::Vec2;
use image::{imageops, Rgba, RgbaImage};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Fill for variants that lack a color map.
const DEFAULT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
/// Tangent-space "straight up" normal.
const DEFAULT_NORMAL: Rgba<u8> = Rgba([128, 128, 255, 255]);
/// Tile size used for a variant with no maps at all.
const FALLBACK_TILE: u32 = 4;

/// Image channel carried by the atlas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AtlasChannel {
    Color,
    Normal,
}

impl AtlasChannel {
    fn default_pixel(self) -> Rgba<u8> {
        match self {
            AtlasChannel::Color => DEFAULT_COLOR,
            AtlasChannel::Normal => DEFAULT_NORMAL,
        }
    }
}

/// Source images for one variant's material.
#[derive(Debug, Clone, Default)]
pub struct MaterialMaps {
    pub color: Option<RgbaImage>,
    pub normal: Option<RgbaImage>,
}

impl MaterialMaps {
    pub fn get(&self, channel: AtlasChannel) -> Option<&RgbaImage> {
        match channel {
            AtlasChannel::Color => self.color.as_ref(),
            AtlasChannel::Normal => self.normal.as_ref(),
        }
    }

    /// Native tile size: the largest of the maps present.
    fn tile_size(&self) -> (u32, u32) {
        [self.color.as_ref(), self.normal.as_ref()]
            .into_iter()
            .flatten()
            .map(|img| img.dimensions())
            .reduce(|a, b| (a.0.max(b.0), a.1.max(b.1)))
            .unwrap_or((FALLBACK_TILE, FALLBACK_TILE))
    }
}

/// Pixel rectangle inside the atlas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtlasRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl AtlasRect {
    fn overlaps(&self, other: &AtlasRect) -> bool {
        self.x < other.x + other.w
            && other.x < self.x + self.w
            && self.y < other.y + other.h
            && other.y < self.y + self.h
    }
}

/// Atlas packing parameters.
#[derive(Debug, Clone, Copy)]
pub struct AtlasConfig {
    /// Edge length of the square atlas in pixels.
    pub size: u32,
    /// Gap kept between neighbouring tiles to limit filtering bleed.
    pub padding: u32,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            size: 2048,
            padding: 2,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum AtlasError {
    #[error("no material maps to pack")]
    Empty,
    #[error("atlas of {size}px cannot hold {count} tiles even at minimum scale")]
    Overflow { size: u32, count: usize },
}

/// Packed atlas images plus where each variant landed.
#[derive(Debug, Clone)]
pub struct Atlas {
    pub size: u32,
    pub images: BTreeMap<AtlasChannel, RgbaImage>,
    /// Indexed like the input material list.
    pub rects: Vec<AtlasRect>,
    /// Uniform scale applied to every tile (1.0 when everything fit natively).
    pub scale: f32,
}

impl Atlas {
    /// Pack `materials` into one image per requested channel.
    ///
    /// If the tiles do not fit at native resolution they are all halved until they do,
    /// and a warning is logged. Only an atlas too small for even 1px tiles fails.
    pub fn build(
        materials: &[MaterialMaps],
        channels: &BTreeSet<AtlasChannel>,
        config: AtlasConfig,
    ) -> Result<Self, AtlasError> {
        if materials.is_empty() {
            return Err(AtlasError::Empty);
        }
        let native: Vec<(u32, u32)> = materials.iter().map(MaterialMaps::tile_size).collect();

        let mut scale = 1.0_f32;
        let rects = loop {
            let sizes: Vec<(u32, u32)> = native
                .iter()
                .map(|&(w, h)| (scaled(w, scale), scaled(h, scale)))
                .collect();
            if let Some(rects) = shelf_pack(&sizes, config.size, config.padding) {
                break rects;
            }
            if sizes.iter().all(|&(w, h)| w == 1 && h == 1) {
                return Err(AtlasError::Overflow {
                    size: config.size,
                    count: materials.len(),
                });
            }
            scale *= 0.5;
        };

        if scale < 1.0 {
            log::warn!(
                "Atlas: {} tiles exceed {}px budget, downscaled to {:.3}x",
                materials.len(),
                config.size,
                scale
            );
        }

        let images = channels
            .iter()
            .map(|&channel| (channel, compose_channel(materials, &rects, channel, config.size)))
            .collect();

        log::debug!(
            "Atlas: packed {} variants into {}px ({} channels)",
            materials.len(),
            config.size,
            channels.len()
        );

        Ok(Self {
            size: config.size,
            images,
            rects,
            scale,
        })
    }

    pub fn downscaled(&self) -> bool {
        self.scale < 1.0
    }

    pub fn image(&self, channel: AtlasChannel) -> Option<&RgbaImage> {
        self.images.get(&channel)
    }

    /// Rewrite a variant's UVs in place into its atlas rectangle.
    pub fn apply_to_mesh(&self, variant: usize, mesh: &mut MeshData) {
        let Some(&rect) = self.rects.get(variant) else {
            log::warn!("Atlas: no rect for variant {}, UVs left untouched", variant);
            return;
        };
        for v in &mut mesh.vertices {
            v.tex_coords = remap_uv(Vec2::from_array(v.tex_coords), rect, self.size).to_array();
        }
    }
}

/// Map a source UV into `rect` of a square atlas of `atlas_size` pixels.
pub fn remap_uv(uv: Vec2, rect: AtlasRect, atlas_size: u32) -> Vec2 {
    let size = atlas_size as f32;
    Vec2::new(
        (rect.x as f32 + uv.x * rect.w as f32) / size,
        (rect.y as f32 + uv.y * rect.h as f32) / size,
    )
}

/// Inverse of [`remap_uv`].
pub fn inverse_remap_uv(warped: Vec2, rect: AtlasRect, atlas_size: u32) -> Vec2 {
    let size = atlas_size as f32;
    Vec2::new(
        (warped.x * size - rect.x as f32) / rect.w as f32,
        (warped.y * size - rect.y as f32) / rect.h as f32,
    )
}

fn scaled(v: u32, scale: f32) -> u32 {
    ((v as f32 * scale).floor() as u32).max(1)
}

/// Shelf packing, tallest first. Returns rects in input order, or None if they overflow.
fn shelf_pack(sizes: &[(u32, u32)], atlas: u32, padding: u32) -> Option<Vec<AtlasRect>> {
    let mut order: Vec<usize> = (0..sizes.len()).collect();
    order.sort_by(|&a, &b| sizes[b].1.cmp(&sizes[a].1).then(a.cmp(&b)));

    let mut rects = vec![AtlasRect { x: 0, y: 0, w: 0, h: 0 }; sizes.len()];
    let (mut x, mut y, mut shelf_h) = (0u32, 0u32, 0u32);
    for i in order {
        let (w, h) = sizes[i];
        if w > atlas || h > atlas {
            return None;
        }
        if x + w > atlas {
            x = 0;
            y += shelf_h + padding;
            shelf_h = 0;
        }
        if y + h > atlas {
            return None;
        }
        rects[i] = AtlasRect { x, y, w, h };
        x += w + padding;
        shelf_h = shelf_h.max(h);
    }
    Some(rects)
}

fn compose_channel(
    materials: &[MaterialMaps],
    rects: &[AtlasRect],
    channel: AtlasChannel,
    size: u32,
) -> RgbaImage {
    let mut atlas = RgbaImage::from_pixel(size, size, Rgba([0, 0, 0, 0]));
    for (maps, rect) in materials.iter().zip(rects) {
        let tile = match maps.get(channel) {
            Some(src) if src.dimensions() == (rect.w, rect.h) => src.clone(),
            Some(src) => imageops::resize(src, rect.w, rect.h, imageops::FilterType::Triangle),
            None => RgbaImage::from_pixel(rect.w, rect.h, channel.default_pixel()),
        };
        imageops::replace(&mut atlas, &tile, rect.x as i64, rect.y as i64);
    }
    atlas
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vertex::Vertex;

    fn solid(w: u32, h: u32, rgba: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba(rgba))
    }

    fn color_only(w: u32, h: u32, rgba: [u8; 4]) -> MaterialMaps {
        MaterialMaps {
            color: Some(solid(w, h, rgba)),
            normal: None,
        }
    }

    fn channels() -> BTreeSet<AtlasChannel> {
        [AtlasChannel::Color, AtlasChannel::Normal].into_iter().collect()
    }

    #[test]
    fn packs_tiles_without_overlap_at_native_size() {
        let maps = vec![
            color_only(32, 32, [255, 0, 0, 255]),
            color_only(16, 16, [0, 255, 0, 255]),
            color_only(32, 8, [0, 0, 255, 255]),
        ];
        let atlas = Atlas::build(&maps, &channels(), AtlasConfig { size: 64, padding: 1 }).unwrap();
        assert!(!atlas.downscaled());
        assert_eq!(atlas.rects.len(), 3);
        for (i, a) in atlas.rects.iter().enumerate() {
            assert!(a.x + a.w <= 64 && a.y + a.h <= 64);
            for b in &atlas.rects[i + 1..] {
                assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
            }
        }
        let color = atlas.image(AtlasChannel::Color).unwrap();
        let r = atlas.rects[1];
        assert_eq!(*color.get_pixel(r.x, r.y), Rgba([0, 255, 0, 255]));
        // No normal map supplied: flat default normal fills the tile.
        let normal = atlas.image(AtlasChannel::Normal).unwrap();
        assert_eq!(*normal.get_pixel(r.x, r.y), DEFAULT_NORMAL);
    }

    #[test]
    fn overflow_downscales_instead_of_failing() {
        let maps: Vec<_> = (0..4).map(|_| color_only(64, 64, [9, 9, 9, 255])).collect();
        let atlas = Atlas::build(&maps, &channels(), AtlasConfig { size: 64, padding: 0 }).unwrap();
        assert!(atlas.downscaled());
        assert_eq!(atlas.scale, 0.5);
        assert!(atlas.rects.iter().all(|r| r.w == 32 && r.h == 32));
    }

    #[test]
    fn atlas_size_does_not_depend_on_input_count() {
        let one = Atlas::build(&[color_only(8, 8, [1, 1, 1, 255])], &channels(), AtlasConfig::default()).unwrap();
        let many: Vec<_> = (0..20).map(|_| color_only(8, 8, [1, 1, 1, 255])).collect();
        let many = Atlas::build(&many, &channels(), AtlasConfig::default()).unwrap();
        assert_eq!(one.image(AtlasChannel::Color).unwrap().dimensions(), (2048, 2048));
        assert_eq!(many.image(AtlasChannel::Color).unwrap().dimensions(), (2048, 2048));
    }

    #[test]
    fn empty_input_is_an_error() {
        assert_eq!(
            Atlas::build(&[], &channels(), AtlasConfig::default()).unwrap_err(),
            AtlasError::Empty
        );
    }

    #[test]
    fn uv_remap_is_invertible_affine() {
        let rect = AtlasRect { x: 100, y: 40, w: 256, h: 128 };
        for uv in [Vec2::ZERO, Vec2::ONE, Vec2::new(0.25, 0.8), Vec2::new(0.5, 0.1)] {
            let warped = remap_uv(uv, rect, 1024);
            assert!(warped.cmpge(Vec2::ZERO).all() && warped.cmple(Vec2::ONE).all());
            let back = inverse_remap_uv(warped, rect, 1024);
            assert!((back - uv).length() < 1e-5, "{:?} -> {:?}", uv, back);
        }
        // Corners land on the rect corners.
        assert_eq!(remap_uv(Vec2::ZERO, rect, 1024), Vec2::new(100.0 / 1024.0, 40.0 / 1024.0));
    }

    #[test]
    fn apply_to_mesh_rewrites_uvs_in_place() {
        let maps = vec![color_only(16, 16, [0; 4]), color_only(16, 16, [0; 4])];
        let atlas = Atlas::build(&maps, &channels(), AtlasConfig { size: 64, padding: 0 }).unwrap();
        let mut mesh = MeshData {
            vertices: vec![Vertex::new([0.0; 3], [0.0, 1.0, 0.0], [1.0, 1.0])],
            indices: vec![0],
        };
        atlas.apply_to_mesh(1, &mut mesh);
        let r = atlas.rects[1];
        let expected = remap_uv(Vec2::ONE, r, 64).to_array();
        assert_eq!(mesh.vertices[0].tex_coords, expected);
    }
}
