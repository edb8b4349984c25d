//! Deterministic vegetation scatter per chunk.
//!
//! Candidates are drawn from an RNG seeded by `(seed, chunk)` only, so a chunk produces the
//! same population regardless of load order. A Perlin mask carves clearings and coarser
//! LODs keep a subset of the finer LOD's instances.

use engine_core::{ChunkCoord, Quat, Vec3};
use noise::{NoiseFn, Perlin};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Placements for one chunk as flat arrays: 3 floats position, 4 floats orientation
/// (xyzw) and one variant selector in `[0, 1)` per instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstancePlacements {
    pub positions: Vec<f32>,
    pub orientations: Vec<f32>,
    pub variant_selectors: Vec<f32>,
}

impl InstancePlacements {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            positions: Vec::with_capacity(n * 3),
            orientations: Vec::with_capacity(n * 4),
            variant_selectors: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, position: Vec3, orientation: Quat, selector: f32) {
        self.positions.extend_from_slice(&position.to_array());
        self.orientations.extend_from_slice(&orientation.to_array());
        self.variant_selectors.push(selector);
    }

    /// Number of complete instances. Trailing partial entries are ignored.
    pub fn len(&self) -> usize {
        self.variant_selectors
            .len()
            .min(self.positions.len() / 3)
            .min(self.orientations.len() / 4)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every array describes the same number of instances.
    pub fn is_consistent(&self) -> bool {
        let n = self.variant_selectors.len();
        self.positions.len() == n * 3 && self.orientations.len() == n * 4
    }

    pub fn get(&self, i: usize) -> Option<(Vec3, Quat, f32)> {
        if i >= self.len() {
            return None;
        }
        let p = &self.positions[i * 3..i * 3 + 3];
        let o = &self.orientations[i * 4..i * 4 + 4];
        Some((
            Vec3::new(p[0], p[1], p[2]),
            Quat::from_xyzw(o[0], o[1], o[2], o[3]),
            self.variant_selectors[i],
        ))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Vec3, Quat, f32)> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }
}

/// Configuration for scatter generation.
#[derive(Debug, Clone)]
pub struct ScatterConfig {
    pub seed: u64,
    /// Chunk edge length in world units.
    pub chunk_size: f32,
    /// Candidate instances per square unit at LOD 0.
    pub density: f32,
    /// Mask noise frequency (lower = larger clearings).
    pub mask_frequency: f64,
    /// Mask values below this (0..1) are clearings.
    pub mask_threshold: f64,
    /// Fraction of instances each coarser LOD keeps.
    pub lod_falloff: f32,
    /// Amplitude of the rolling ground instances sit on.
    pub ground_height: f32,
    pub ground_frequency: f64,
}

impl Default for ScatterConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            chunk_size: 16.0,
            density: 0.5,
            mask_frequency: 0.03,
            mask_threshold: 0.35,
            lod_falloff: 0.5,
            ground_height: 1.5,
            ground_frequency: 0.01,
        }
    }
}

/// Mix a world seed with a chunk coordinate into an RNG seed.
#[inline]
fn chunk_seed(seed: u64, coord: ChunkCoord) -> u64 {
    let x = coord.x as i64 as u64;
    let z = coord.z as i64 as u64;
    seed.wrapping_mul(0x9e3779b97f4a7c15_u64)
        ^ x.wrapping_mul(0x6c078965_u64)
        ^ z.wrapping_mul(0xbf58476d1ce4e5b9_u64).rotate_left(17)
}

#[inline]
fn noise_seed(seed: u64, offset: u64) -> u32 {
    (seed.wrapping_add(offset).wrapping_mul(0x9e3779b97f4a7c15_u64) >> 32) as u32
}

pub struct ScatterGenerator {
    pub config: ScatterConfig,
    mask: Perlin,
    ground: Perlin,
}

impl ScatterGenerator {
    pub fn new(config: ScatterConfig) -> Self {
        Self {
            mask: Perlin::new(noise_seed(config.seed, 0)),
            ground: Perlin::new(noise_seed(config.seed, 1)),
            config,
        }
    }

    /// Ground height under a world position.
    pub fn ground_height(&self, x: f32, z: f32) -> f32 {
        let f = self.config.ground_frequency;
        self.ground.get([x as f64 * f, z as f64 * f]) as f32 * self.config.ground_height
    }

    fn mask(&self, x: f32, z: f32) -> f64 {
        let f = self.config.mask_frequency;
        (self.mask.get([x as f64 * f, z as f64 * f]) + 1.0) * 0.5
    }

    /// Fraction of LOD 0 candidates kept at `lod`.
    pub fn lod_keep(&self, lod: u32) -> f32 {
        self.config.lod_falloff.clamp(0.0, 1.0).powi(lod as i32)
    }

    /// Scatter one chunk. Same `(seed, coord)` always yields the same candidates.
    pub fn generate(&self, coord: ChunkCoord, lod: u32) -> InstancePlacements {
        let size = self.config.chunk_size;
        let candidates = (self.config.density.max(0.0) * size * size).round() as usize;
        let keep = self.lod_keep(lod);
        let origin = coord.min_corner(size);
        let mut rng = StdRng::seed_from_u64(chunk_seed(self.config.seed, coord));
        let mut out = InstancePlacements::with_capacity(candidates);

        for _ in 0..candidates {
            // Draw every value up front so thinning never shifts later candidates.
            let x = origin.x + rng.gen::<f32>() * size;
            let z = origin.y + rng.gen::<f32>() * size;
            let yaw = rng.gen_range(0.0..std::f32::consts::TAU);
            let selector: f32 = rng.gen();
            let thin: f32 = rng.gen();

            if thin >= keep || self.mask(x, z) < self.config.mask_threshold {
                continue;
            }
            let y = self.ground_height(x, z);
            out.push(Vec3::new(x, y, z), Quat::from_rotation_y(yaw), selector);
        }

        log::trace!("Scattered {} of {} candidates in chunk {} at LOD {}", out.len(), candidates, coord, lod);
        out
    }
}
