//! Variant registry: groups `<name>_LOD<n>` meshes into LOD-ed geometry variants.
//!
//! Registration is one ordered pass over the names, so the same input set always yields
//! the same variant and geometry indices.

use engine_core::Vec3;
use renderer::{
    AllocError, Atlas, AtlasChannel, AtlasConfig, AtlasError, InstancedGeometryAllocator, InstancingLimits,
    MaterialMaps, MeshData, VariantMesh,
};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// LOD levels a mesh name may carry.
pub const MAX_LODS: usize = 3;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no usable vegetation meshes ({rejected} rejected)")]
    Empty { rejected: usize },
    #[error(transparent)]
    Atlas(#[from] AtlasError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// A mesh offered for registration.
#[derive(Debug, Clone)]
pub struct SourceMesh {
    /// Full name including the `_LOD<n>` suffix.
    pub name: String,
    /// Category the mesh came from, e.g. the file it was loaded from.
    pub item_type: String,
    pub mesh: MeshData,
    pub maps: MaterialMaps,
}

impl SourceMesh {
    pub fn new(name: impl Into<String>, item_type: impl Into<String>, mesh: MeshData, maps: MaterialMaps) -> Self {
        Self {
            name: name.into(),
            item_type: item_type.into(),
            mesh,
            maps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantMetadata {
    pub name: String,
    pub item_type: String,
}

#[derive(Debug, Clone)]
pub struct VariantInfo {
    pub metadata: VariantMetadata,
    /// Geometry index per LOD level.
    pub lods: [Option<usize>; MAX_LODS],
    /// LOD 0 vertex positions, used to cook the collision hull.
    pub hull_points: Vec<Vec3>,
    /// Distance from the instance origin to the farthest LOD 0 vertex.
    pub radius: f32,
}

/// Split `rock_LOD1` into `("rock", 1)`.
pub fn parse_lod_name(name: &str) -> Option<(&str, usize)> {
    let (base, suffix) = name.rsplit_once("_LOD")?;
    if base.is_empty() || suffix.len() != 1 {
        return None;
    }
    let lod = suffix.parse::<usize>().ok()?;
    (lod < MAX_LODS).then_some((base, lod))
}

#[derive(Debug, Clone, Default)]
pub struct VariantRegistry {
    variants: Vec<VariantInfo>,
    rejected: Vec<String>,
}

impl VariantRegistry {
    /// Group meshes into variants. Returns the registry and the geometry list it indexes,
    /// ordered variant by variant, finest LOD first.
    pub fn register(sources: Vec<SourceMesh>) -> (Self, Vec<SourceMesh>) {
        let mut rejected = Vec::new();
        let mut grouped: BTreeMap<String, [Option<SourceMesh>; MAX_LODS]> = BTreeMap::new();

        for source in sources {
            let Some((base, lod)) = parse_lod_name(&source.name) else {
                log::warn!("Mesh '{}' does not match <name>_LOD<0-2>, skipping", source.name);
                rejected.push(source.name);
                continue;
            };
            let slot = &mut grouped.entry(base.to_owned()).or_default()[lod];
            if slot.is_some() {
                log::warn!("Duplicate mesh '{}', keeping the first one", source.name);
                rejected.push(source.name);
                continue;
            }
            *slot = Some(source);
        }

        let mut variants = Vec::new();
        let mut geometry = Vec::new();
        for (name, lods) in grouped {
            if lods[0].is_none() {
                log::warn!("Variant '{}' has no LOD0 mesh, skipping", name);
                rejected.extend(lods.into_iter().flatten().map(|s| s.name));
                continue;
            }
            let mut indices = [None; MAX_LODS];
            let mut item_type = String::new();
            let mut hull_points = Vec::new();
            for (lod, source) in lods.into_iter().enumerate() {
                let Some(source) = source else { continue };
                if lod == 0 {
                    item_type = source.item_type.clone();
                    hull_points = source.mesh.positions().collect();
                }
                indices[lod] = Some(geometry.len());
                geometry.push(source);
            }
            let radius = hull_points.iter().map(|p| p.length()).fold(0.0, f32::max);
            variants.push(VariantInfo {
                metadata: VariantMetadata { name, item_type },
                lods: indices,
                hull_points,
                radius,
            });
        }

        log::info!(
            "Registered {} vegetation variants ({} meshes, {} rejected)",
            variants.len(),
            geometry.len(),
            rejected.len()
        );
        (Self { variants, rejected }, geometry)
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    pub fn variants(&self) -> &[VariantInfo] {
        &self.variants
    }

    pub fn get(&self, variant: usize) -> Option<&VariantInfo> {
        self.variants.get(variant)
    }

    /// Names that were not registered.
    pub fn rejected(&self) -> &[String] {
        &self.rejected
    }

    /// Map a selector in `[0, 1)` to a variant index, clamping out-of-range values.
    pub fn variant_for_selector(&self, selector: f32) -> usize {
        let n = self.variants.len();
        if n == 0 {
            return 0;
        }
        let s = if selector.is_nan() { 0.0 } else { selector };
        ((s * n as f32).floor().max(0.0) as usize).min(n - 1)
    }

    /// Geometry to draw `variant` at `lod`, falling back to the nearest available level
    /// (coarser first).
    pub fn geometry_for(&self, variant: usize, lod: u32) -> Option<usize> {
        let lods = &self.variants.get(variant)?.lods;
        let want = (lod as usize).min(MAX_LODS - 1);
        (0..MAX_LODS).find_map(|d| {
            let coarser = (want + d < MAX_LODS).then(|| lods[want + d]).flatten();
            coarser.or_else(|| want.checked_sub(d).and_then(|l| lods[l]))
        })
    }

    /// Largest instance radius across variants.
    pub fn max_radius(&self) -> f32 {
        self.variants.iter().map(|v| v.radius).fold(0.0, f32::max)
    }
}

/// Everything built from the source meshes before streaming starts.
pub struct VegetationAssets {
    pub registry: VariantRegistry,
    pub allocator: InstancedGeometryAllocator,
    pub atlas: Atlas,
}

impl VegetationAssets {
    /// Register meshes, pack their materials and merge their geometry.
    pub fn build(
        sources: Vec<SourceMesh>,
        limits: InstancingLimits,
        atlas_config: AtlasConfig,
    ) -> Result<Self, RegistryError> {
        let (registry, geometry) = VariantRegistry::register(sources);
        if registry.is_empty() {
            return Err(RegistryError::Empty {
                rejected: registry.rejected().len(),
            });
        }

        let maps: Vec<MaterialMaps> = geometry.iter().map(|g| g.maps.clone()).collect();
        let channels = BTreeSet::from([AtlasChannel::Color, AtlasChannel::Normal]);
        let atlas = Atlas::build(&maps, &channels, atlas_config)?;

        let meshes: Vec<VariantMesh> = geometry
            .into_iter()
            .enumerate()
            .map(|(i, mut source)| {
                atlas.apply_to_mesh(i, &mut source.mesh);
                VariantMesh {
                    name: source.name,
                    mesh: source.mesh,
                }
            })
            .collect();
        let allocator = InstancedGeometryAllocator::new(&meshes, limits)?;

        Ok(Self {
            registry,
            allocator,
            atlas,
        })
    }
}
