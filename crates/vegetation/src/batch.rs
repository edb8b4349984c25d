//! Streams chunk placements into instanced draw-call slots and per-instance colliders.
//!
//! Each chunk moves through `Requested -> DataArrived -> Rendered` and is freed on
//! `Remove`. Fetches carry a [`ChunkTicket`]; when a fetch resolves for a generation that
//! is no longer current (the chunk was removed or re-requested meanwhile) the result is
//! dropped without touching any state.

use crate::collision::CollisionBackend;
use crate::registry::{VariantMetadata, VariantRegistry};
use crate::source::{PlacementFetch, PlacementSource};
use crate::streaming::{ChunkEvent, ChunkTicket};
use engine_core::{Aabb, ChunkKey, FrameThrottle, Quat, Transform, Vec3};
use futures_lite::future;
use procgen::InstancePlacements;
use renderer::{InstancedGeometryAllocator, SlotId};
use std::collections::{HashMap, HashSet};

/// Times a failed fetch is re-issued before the chunk is left empty.
pub const MAX_FETCH_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Requested,
    DataArrived,
    Rendered,
}

/// Renderer settings taken from the config at construction.
#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub chunk_size: f32,
    pub collide: bool,
    pub frame_skip: u32,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            chunk_size: 16.0,
            collide: true,
            frame_skip: 0,
        }
    }
}

struct ChunkRecord<H> {
    generation: u64,
    retries: u32,
    state: ChunkState,
    placements: Option<InstancePlacements>,
    slots: Vec<SlotId>,
    /// Slot currently being filled, per geometry.
    open_slots: HashMap<usize, SlotId>,
    handles: HashSet<H>,
}

impl<H> ChunkRecord<H> {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            retries: 0,
            state: ChunkState::Requested,
            placements: None,
            slots: Vec::new(),
            open_slots: HashMap::new(),
            handles: HashSet::new(),
        }
    }
}

struct PendingFetch {
    ticket: ChunkTicket,
    fetch: PlacementFetch,
}

#[derive(Debug, Clone, Copy)]
struct InstanceLocation {
    slot: SlotId,
    local: u32,
    variant: usize,
    chunk: ChunkKey,
}

/// Where a collider's instance lives.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedInstance<'a> {
    pub slot: SlotId,
    pub local: u32,
    /// Linear texel index in the attribute textures.
    pub instance_index: u32,
    pub chunk: ChunkKey,
    pub variant: usize,
    pub metadata: &'a VariantMetadata,
    pub transform: Transform,
}

/// Outcome of rendering one chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderSummary {
    pub rendered: usize,
    pub skipped: usize,
    pub colliders: usize,
}

pub struct VegetationRenderer<S: PlacementSource, C: CollisionBackend> {
    settings: BatchSettings,
    registry: VariantRegistry,
    allocator: InstancedGeometryAllocator,
    source: S,
    collision: C,
    /// Cooked hull per variant; `None` when cooking failed or collision is off.
    shapes: Vec<Option<C::Shape>>,
    chunks: HashMap<ChunkKey, ChunkRecord<C::Handle>>,
    pending: HashMap<ChunkKey, PendingFetch>,
    next_generation: u64,
    instances: HashMap<C::Handle, InstanceLocation>,
    /// Collider per local index, per live slot.
    slot_handles: HashMap<SlotId, Vec<Option<C::Handle>>>,
    throttle: FrameThrottle,
}

impl<S: PlacementSource, C: CollisionBackend> VegetationRenderer<S, C> {
    pub fn new(
        registry: VariantRegistry,
        allocator: InstancedGeometryAllocator,
        source: S,
        mut collision: C,
        settings: BatchSettings,
    ) -> Self {
        let shapes = registry
            .variants()
            .iter()
            .map(|variant| {
                if !settings.collide {
                    return None;
                }
                match collision.cook_convex_shape(&variant.hull_points) {
                    Ok(shape) => Some(shape),
                    Err(e) => {
                        log::warn!("No collider for variant '{}': {}", variant.metadata.name, e);
                        None
                    }
                }
            })
            .collect();

        Self {
            settings,
            registry,
            allocator,
            source,
            collision,
            shapes,
            chunks: HashMap::new(),
            pending: HashMap::new(),
            next_generation: 0,
            instances: HashMap::new(),
            slot_handles: HashMap::new(),
            throttle: FrameThrottle::new(settings.frame_skip),
        }
    }

    pub fn handle_event(&mut self, event: ChunkEvent) {
        match event {
            ChunkEvent::DataRequest(key) => self.request(key),
            ChunkEvent::Add(key) => {
                self.add(key);
            }
            ChunkEvent::Remove(key) => {
                self.remove(key);
            }
            ChunkEvent::CoordinateUpdate { viewer, chunk } => {
                log::debug!("Viewer at {:?} (chunk {})", viewer, chunk);
            }
        }
    }

    /// Start fetching placements for `key`. A chunk that already exists is released first.
    pub fn request(&mut self, key: ChunkKey) {
        if self.chunks.contains_key(&key) {
            log::debug!("Re-requesting chunk {}", key);
            self.remove(key);
        }
        let generation = self.issue_fetch(key);
        self.chunks.insert(key, ChunkRecord::new(generation));
        log::trace!("Requested chunk {} (generation {})", key, generation);
    }

    /// Start a fetch under a fresh generation and return it.
    fn issue_fetch(&mut self, key: ChunkKey) -> u64 {
        let ticket = ChunkTicket {
            key,
            generation: self.next_generation,
        };
        self.next_generation += 1;

        let corner = key.coord.min_corner(self.settings.chunk_size);
        let fetch = self.source.fetch_instances(corner.x, corner.y, key.lod);
        self.pending.insert(key, PendingFetch { ticket, fetch });
        ticket.generation
    }

    /// Poll outstanding fetches once. Returns the chunks whose data arrived this tick.
    pub fn tick(&mut self) -> Vec<ChunkKey> {
        if !self.throttle.advance() {
            return Vec::new();
        }

        let mut resolved = Vec::new();
        self.pending.retain(|_, pending| match future::block_on(future::poll_once(&mut pending.fetch)) {
            Some(result) => {
                resolved.push((pending.ticket, result));
                false
            }
            None => true,
        });

        let mut ready = Vec::new();
        let mut retry = Vec::new();
        for (ticket, result) in resolved {
            let Some(record) = self.chunks.get_mut(&ticket.key) else {
                log::trace!("Dropping fetch for removed chunk {}", ticket.key);
                continue;
            };
            if record.generation != ticket.generation {
                log::trace!("Dropping stale fetch for chunk {} (generation {})", ticket.key, ticket.generation);
                continue;
            }
            match result {
                Ok(placements) => {
                    if !placements.is_consistent() {
                        log::warn!(
                            "Chunk {}: placement arrays disagree in length, using {} complete instances",
                            ticket.key,
                            placements.len()
                        );
                    }
                    record.placements = Some(placements);
                    record.state = ChunkState::DataArrived;
                    ready.push(ticket.key);
                }
                Err(e) if record.retries < MAX_FETCH_RETRIES => {
                    record.retries += 1;
                    log::warn!(
                        "Fetching chunk {} failed (attempt {}): {:#}",
                        ticket.key,
                        record.retries,
                        e
                    );
                    retry.push(ticket.key);
                }
                Err(e) => log::error!("Fetching chunk {} failed, giving up: {:#}", ticket.key, e),
            }
        }
        for key in retry {
            let generation = self.issue_fetch(key);
            if let Some(record) = self.chunks.get_mut(&key) {
                record.generation = generation;
            }
        }
        ready.sort();
        ready
    }

    /// Draw a chunk whose data has arrived.
    pub fn add(&mut self, key: ChunkKey) -> Option<RenderSummary> {
        let Some(record) = self.chunks.get_mut(&key) else {
            log::debug!("Ignoring add for unknown chunk {}", key);
            return None;
        };
        if record.state != ChunkState::DataArrived {
            log::debug!("Ignoring add for chunk {} in state {:?}", key, record.state);
            return None;
        }
        let placements = record.placements.take().unwrap_or_default();
        let summary = self.render_chunk(key, &placements);
        if let Some(record) = self.chunks.get_mut(&key) {
            record.state = ChunkState::Rendered;
        }
        Some(summary)
    }

    fn chunk_bounds(&self, key: ChunkKey, placements: &InstancePlacements) -> Aabb {
        let radius = self.registry.max_radius();
        let (min_y, max_y) = placements
            .iter()
            .map(|(p, _, _)| p.y)
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), y| (lo.min(y), hi.max(y)));
        let (min_y, max_y) = if min_y <= max_y { (min_y, max_y) } else { (0.0, 0.0) };
        Aabb::from_chunk(key.coord, self.settings.chunk_size, min_y - radius, max_y + radius)
            .expanded(Vec3::new(radius, 0.0, radius))
    }

    fn render_chunk(&mut self, key: ChunkKey, placements: &InstancePlacements) -> RenderSummary {
        let bounds = self.chunk_bounds(key, placements);
        let mut summary = RenderSummary::default();

        for (position, orientation, selector) in placements.iter() {
            let variant = self.registry.variant_for_selector(selector);
            let Some(geometry) = self.registry.geometry_for(variant, key.lod) else {
                summary.skipped += 1;
                continue;
            };
            let Some(slot) = self.open_slot(key, geometry, bounds) else {
                summary.skipped += 1;
                continue;
            };
            let local = match self.allocator.increment_instance_count(slot) {
                Ok(local) => local,
                Err(e) => {
                    log::debug!("Chunk {}: {}", key, e);
                    summary.skipped += 1;
                    continue;
                }
            };

            let orientation = if orientation.length_squared() > 0.0 {
                orientation.normalize()
            } else {
                Quat::IDENTITY
            };
            let transform = Transform::from_position_rotation(position, orientation);
            if let Err(e) = self.allocator.write_instance(slot, local, &transform) {
                log::debug!("Chunk {}: {}", key, e);
            }

            let handle = self.shapes[variant].and_then(|shape| {
                match self.collision.add_convex_instance(shape, position, orientation) {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        log::warn!("Chunk {}: collider not created: {}", key, e);
                        None
                    }
                }
            });

            let locals = self.slot_handles.entry(slot).or_default();
            locals.resize(local as usize, None);
            locals.push(handle);

            if let Some(handle) = handle {
                self.instances.insert(
                    handle,
                    InstanceLocation {
                        slot,
                        local,
                        variant,
                        chunk: key,
                    },
                );
                if let Some(record) = self.chunks.get_mut(&key) {
                    record.handles.insert(handle);
                }
                summary.colliders += 1;
            }
            summary.rendered += 1;
        }

        if summary.skipped > 0 {
            log::warn!(
                "Chunk {}: skipped {} of {} instances (draw-call capacity)",
                key,
                summary.skipped,
                placements.len()
            );
        }
        log::debug!(
            "Rendered chunk {}: {} instances, {} colliders",
            key,
            summary.rendered,
            summary.colliders
        );
        summary
    }

    /// The chunk's non-full slot for `geometry`, allocating a new one if needed.
    fn open_slot(&mut self, key: ChunkKey, geometry: usize, bounds: Aabb) -> Option<SlotId> {
        let record = self.chunks.get_mut(&key)?;
        if let Some(&slot) = record.open_slots.get(&geometry) {
            if self.allocator.slot(slot).is_some_and(|s| !s.is_full()) {
                return Some(slot);
            }
        }
        match self.allocator.alloc_draw_call(geometry, bounds) {
            Ok(slot) => {
                record.open_slots.insert(geometry, slot);
                record.slots.push(slot);
                Some(slot)
            }
            Err(e) => {
                log::debug!("Chunk {}: {}", key, e);
                None
            }
        }
    }

    /// Release everything a chunk owns. Returns false for unknown chunks.
    pub fn remove(&mut self, key: ChunkKey) -> bool {
        self.pending.remove(&key);
        let Some(record) = self.chunks.remove(&key) else {
            log::debug!("Ignoring remove for unknown chunk {}", key);
            return false;
        };

        for slot in &record.slots {
            self.slot_handles.remove(slot);
            if let Err(e) = self.allocator.free_draw_call(*slot) {
                log::warn!("Chunk {}: {}", key, e);
            }
        }
        for handle in &record.handles {
            self.instances.remove(handle);
            self.release_collider(*handle);
        }
        log::debug!(
            "Freed chunk {}: {} slots, {} colliders",
            key,
            record.slots.len(),
            record.handles.len()
        );
        true
    }

    /// Look up the instance behind a collider.
    pub fn resolve_instance(&self, handle: C::Handle) -> Option<ResolvedInstance<'_>> {
        let loc = self.instances.get(&handle)?;
        let metadata = &self.registry.get(loc.variant)?.metadata;
        let transform = self.allocator.read_instance(loc.slot, loc.local)?;
        Some(ResolvedInstance {
            slot: loc.slot,
            local: loc.local,
            instance_index: self.allocator.instance_index(loc.slot, loc.local),
            chunk: loc.chunk,
            variant: loc.variant,
            metadata,
            transform,
        })
    }

    /// Remove one instance (picked up by the player, say). Its slot is compacted and the
    /// instance that filled the hole is re-pointed. Returns the variant's metadata.
    pub fn grab_instance(&mut self, handle: C::Handle) -> Option<VariantMetadata> {
        let loc = self.instances.remove(&handle)?;
        match self.allocator.swap_remove_instance(loc.slot, loc.local) {
            Ok(moved) => {
                if let Some(locals) = self.slot_handles.get_mut(&loc.slot) {
                    if (loc.local as usize) < locals.len() {
                        locals.swap_remove(loc.local as usize);
                    }
                    if moved.is_some() {
                        if let Some(Some(moved_handle)) = locals.get(loc.local as usize) {
                            if let Some(moved_loc) = self.instances.get_mut(moved_handle) {
                                moved_loc.local = loc.local;
                            }
                        }
                    }
                }
            }
            Err(e) => log::warn!("Grabbing {:?}: {}", handle, e),
        }
        if let Some(record) = self.chunks.get_mut(&loc.chunk) {
            record.handles.remove(&handle);
        }
        self.release_collider(handle);
        self.registry.get(loc.variant).map(|v| v.metadata.clone())
    }

    /// Every owned collider is released exactly once; a second release is a bookkeeping bug.
    fn release_collider(&mut self, handle: C::Handle) {
        let removed = self.collision.remove_instance(handle);
        debug_assert!(removed, "collider {:?} freed twice", handle);
        if !removed {
            log::warn!("Collider {:?} was already gone", handle);
        }
    }

    /// Every collider currently owned.
    pub fn physics_handles(&self) -> Vec<C::Handle> {
        self.instances.keys().copied().collect()
    }

    /// Release every chunk and cancel every fetch. Returns the number of chunks freed.
    pub fn shutdown(&mut self) -> usize {
        let mut keys: Vec<ChunkKey> = self.chunks.keys().copied().collect();
        keys.sort();
        let freed = keys.into_iter().filter(|&key| self.remove(key)).count();
        self.pending.clear();
        log::info!("Vegetation shut down: {} chunks released", freed);
        freed
    }

    /// Frame boundary: quarantined slots become reusable.
    pub fn end_frame(&mut self) -> usize {
        self.allocator.end_frame()
    }

    pub fn chunk_state(&self, key: ChunkKey) -> Option<ChunkState> {
        self.chunks.get(&key).map(|r| r.state)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn collider_count(&self) -> usize {
        self.instances.len()
    }

    /// Draw-call slots a chunk owns.
    pub fn chunk_slots(&self, key: ChunkKey) -> &[SlotId] {
        self.chunks.get(&key).map(|r| r.slots.as_slice()).unwrap_or(&[])
    }

    pub fn registry(&self) -> &VariantRegistry {
        &self.registry
    }

    pub fn allocator(&self) -> &InstancedGeometryAllocator {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut InstancedGeometryAllocator {
        &mut self.allocator
    }

    pub fn collision(&self) -> &C {
        &self.collision
    }

    pub fn collision_mut(&mut self) -> &mut C {
        &mut self.collision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{SourceMesh, VegetationAssets};
    use engine_core::ChunkCoord;
    use physics::PhysicsError;
    use renderer::{AtlasConfig, InstancingLimits, MaterialMaps, MeshData};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::rc::Rc;
    use std::task::{Context, Poll};

    type Slot = Rc<RefCell<Option<anyhow::Result<InstancePlacements>>>>;

    /// Resolves once the test fills its shared slot.
    struct ManualFetch(Slot);

    impl Future for ManualFetch {
        type Output = anyhow::Result<InstancePlacements>;

        fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
            match self.0.borrow_mut().take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Pending,
            }
        }
    }

    /// Hands out fetches in request order; the test resolves them by index.
    #[derive(Default, Clone)]
    struct ManualSource {
        issued: Rc<RefCell<VecDeque<(f32, f32, u32, Slot)>>>,
    }

    impl ManualSource {
        fn resolve_next(&self, result: anyhow::Result<InstancePlacements>) {
            let (_, _, _, slot) = self.issued.borrow_mut().pop_front().expect("a fetch was issued");
            *slot.borrow_mut() = Some(result);
        }
    }

    impl PlacementSource for ManualSource {
        fn fetch_instances(&mut self, world_x: f32, world_z: f32, lod: u32) -> PlacementFetch {
            let slot: Slot = Rc::new(RefCell::new(None));
            self.issued.borrow_mut().push_back((world_x, world_z, lod, Rc::clone(&slot)));
            Box::pin(ManualFetch(slot))
        }
    }

    #[derive(Default)]
    struct MockCollision {
        next: u32,
        live: HashSet<u32>,
        removed: Vec<u32>,
    }

    impl CollisionBackend for MockCollision {
        type Shape = usize;
        type Handle = u32;

        fn cook_convex_shape(&mut self, points: &[Vec3]) -> Result<usize, PhysicsError> {
            if points.len() < 4 {
                return Err(PhysicsError::DegenerateHull(points.len()));
            }
            Ok(0)
        }

        fn add_convex_instance(&mut self, _: usize, _: Vec3, _: Quat) -> Result<u32, PhysicsError> {
            self.next += 1;
            self.live.insert(self.next);
            Ok(self.next)
        }

        fn remove_instance(&mut self, handle: u32) -> bool {
            self.removed.push(handle);
            self.live.remove(&handle)
        }
    }

    fn renderer_with(
        variants: &[&str],
        max_instances: u32,
        max_slots: u32,
    ) -> (VegetationRenderer<ManualSource, MockCollision>, ManualSource) {
        let sources = variants
            .iter()
            .map(|name| {
                SourceMesh::new(
                    format!("{name}_LOD0"),
                    "plants",
                    MeshData::cube(Vec3::splat(0.5)),
                    MaterialMaps::default(),
                )
            })
            .collect();
        let limits = InstancingLimits {
            max_instances_per_draw_call: max_instances,
            max_draw_calls_per_geometry: max_slots,
            texture_width: 64,
        };
        let assets = VegetationAssets::build(sources, limits, AtlasConfig::default()).unwrap();
        let source = ManualSource::default();
        let renderer = VegetationRenderer::new(
            assets.registry,
            assets.allocator,
            source.clone(),
            MockCollision::default(),
            BatchSettings::default(),
        );
        (renderer, source)
    }

    /// `n` instances alternating between the lower and upper half of the selector range.
    fn placements(n: usize) -> InstancePlacements {
        let mut p = InstancePlacements::default();
        for i in 0..n {
            let selector = if i % 2 == 0 { 0.25 } else { 0.75 };
            p.push(Vec3::new(i as f32 * 0.1, 0.0, 1.0), Quat::from_rotation_y(i as f32), selector);
        }
        p
    }

    fn key(x: i32) -> ChunkKey {
        ChunkKey::new(ChunkCoord::new(x, 0), 0)
    }

    #[test]
    fn full_lifecycle_of_one_chunk() {
        let (mut r, source) = renderer_with(&["a", "b"], 128, 4);
        r.handle_event(ChunkEvent::DataRequest(key(0)));
        assert_eq!(r.chunk_state(key(0)), Some(ChunkState::Requested));
        assert!(r.tick().is_empty());

        source.resolve_next(Ok(placements(150)));
        assert_eq!(r.tick(), vec![key(0)]);
        assert_eq!(r.chunk_state(key(0)), Some(ChunkState::DataArrived));

        let summary = r.add(key(0)).unwrap();
        assert_eq!(summary, RenderSummary { rendered: 150, skipped: 0, colliders: 150 });
        assert_eq!(r.chunk_state(key(0)), Some(ChunkState::Rendered));
        assert_eq!(r.chunk_slots(key(0)).len(), 2);
        assert_eq!(r.allocator().live_instances(0), 75);
        assert_eq!(r.allocator().live_instances(1), 75);
        assert_eq!(r.collider_count(), 150);
        assert_eq!(r.collision().live.len(), 150);

        let handles = r.physics_handles();
        assert_eq!(handles.len(), 150);
        assert!(r.remove(key(0)));
        assert!(handles.iter().all(|&h| r.resolve_instance(h).is_none()));
        assert_eq!(r.chunk_count(), 0);
        assert_eq!(r.collider_count(), 0);
        assert!(r.collision().live.is_empty());
        assert_eq!(r.allocator().live_slots().count(), 0);
    }

    #[test]
    fn fetch_origin_is_chunk_corner() {
        let (mut r, source) = renderer_with(&["a"], 8, 2);
        r.request(ChunkKey::new(ChunkCoord::new(-2, 3), 1));
        let (x, z, lod, _) = source.issued.borrow()[0].clone();
        assert_eq!((x, z, lod), (-32.0, 48.0, 1));
    }

    #[test]
    fn remove_before_fetch_resolves_leaves_nothing() {
        let (mut r, source) = renderer_with(&["a", "b"], 128, 4);
        r.handle_event(ChunkEvent::DataRequest(key(0)));
        r.handle_event(ChunkEvent::Remove(key(0)));
        source.resolve_next(Ok(placements(150)));

        assert!(r.tick().is_empty());
        assert!(r.add(key(0)).is_none());
        assert_eq!(r.chunk_count(), 0);
        assert_eq!(r.pending_count(), 0);
        assert_eq!(r.allocator().live_slots().count(), 0);
        assert_eq!(r.collision().next, 0);
    }

    #[test]
    fn stale_generation_is_discarded() {
        let (mut r, source) = renderer_with(&["a"], 16, 4);
        r.request(key(0));
        r.request(key(0));
        // First fetch resolving first must not count for the second request.
        source.resolve_next(Ok(placements(3)));
        assert!(r.tick().is_empty());
        assert_eq!(r.chunk_state(key(0)), Some(ChunkState::Requested));
        source.resolve_next(Ok(placements(5)));
        assert_eq!(r.tick(), vec![key(0)]);
        assert_eq!(r.add(key(0)).unwrap().rendered, 5);
    }

    #[test]
    fn capacity_exhaustion_skips_exactly_the_overflow() {
        let (mut r, source) = renderer_with(&["a"], 4, 2);
        r.request(key(0));
        let mut p = InstancePlacements::default();
        for i in 0..9 {
            p.push(Vec3::new(i as f32, 0.0, 0.0), Quat::IDENTITY, 0.1);
        }
        source.resolve_next(Ok(p));
        r.tick();
        let summary = r.add(key(0)).unwrap();
        assert_eq!(summary.rendered, 8);
        assert_eq!(summary.skipped, 1);
        assert_eq!(r.collider_count(), 8);
        assert_eq!(r.allocator().live_instances(0), 8);
    }

    #[test]
    fn resolve_and_grab_keep_mapping_consistent() {
        let (mut r, source) = renderer_with(&["a"], 8, 2);
        r.request(key(0));
        let mut p = InstancePlacements::default();
        for i in 0..3 {
            p.push(Vec3::new(i as f32, 0.0, 0.0), Quat::IDENTITY, 0.0);
        }
        source.resolve_next(Ok(p));
        r.tick();
        r.add(key(0));

        let mut handles = r.physics_handles();
        handles.sort();
        assert_eq!(handles, vec![1, 2, 3]);
        let first = r.resolve_instance(1).unwrap();
        assert_eq!(first.local, 0);
        assert_eq!(first.metadata.name, "a");
        assert_eq!(first.metadata.item_type, "plants");
        assert_eq!(first.instance_index, first.slot.0 * 8);
        assert_eq!(first.transform.position, Vec3::ZERO);

        let grabbed = r.grab_instance(1).unwrap();
        assert_eq!(grabbed.name, "a");
        assert!(r.resolve_instance(1).is_none());
        assert_eq!(r.collision().removed, vec![1]);

        // The last instance filled the hole.
        let moved = r.resolve_instance(3).unwrap();
        assert_eq!(moved.local, 0);
        assert_eq!(moved.transform.position, Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(r.resolve_instance(2).unwrap().local, 1);
        assert_eq!(r.allocator().live_instances(0), 2);

        // Freeing the chunk releases only what remains.
        r.remove(key(0));
        assert!(r.resolve_instance(3).is_none());
        let mut removed = r.collision().removed.clone();
        removed.sort();
        assert_eq!(removed, vec![1, 2, 3]);
    }

    #[test]
    fn failed_fetch_is_retried() {
        let (mut r, source) = renderer_with(&["a"], 8, 2);
        r.request(key(0));
        source.resolve_next(Err(anyhow::anyhow!("disk on fire")));
        assert!(r.tick().is_empty());
        assert_eq!(r.chunk_state(key(0)), Some(ChunkState::Requested));
        assert_eq!(r.pending_count(), 1);
        assert_eq!(source.issued.borrow().len(), 1);

        source.resolve_next(Ok(placements(4)));
        assert_eq!(r.tick(), vec![key(0)]);
        assert_eq!(r.add(key(0)).unwrap().rendered, 4);
    }

    #[test]
    fn fetch_gives_up_after_retries() {
        let (mut r, source) = renderer_with(&["a"], 8, 2);
        r.request(key(0));
        for _ in 0..=MAX_FETCH_RETRIES {
            source.resolve_next(Err(anyhow::anyhow!("disk on fire")));
            assert!(r.tick().is_empty());
        }
        assert_eq!(r.chunk_state(key(0)), Some(ChunkState::Requested));
        assert_eq!(r.pending_count(), 0);
        assert!(source.issued.borrow().is_empty());
        assert!(r.add(key(0)).is_none());
        assert!(r.remove(key(0)));
    }

    #[test]
    fn unknown_remove_and_duplicate_add_are_ignored() {
        let (mut r, source) = renderer_with(&["a"], 8, 2);
        assert!(!r.remove(key(5)));
        r.request(key(0));
        source.resolve_next(Ok(placements(2)));
        r.tick();
        assert!(r.add(key(0)).is_some());
        assert!(r.add(key(0)).is_none());
        assert_eq!(r.collider_count(), 2);
    }

    #[test]
    fn freed_slots_are_reused_only_after_end_frame() {
        let (mut r, source) = renderer_with(&["a"], 4, 1);
        r.request(key(0));
        source.resolve_next(Ok(placements(2)));
        r.tick();
        r.add(key(0));
        r.remove(key(0));

        r.request(key(1));
        source.resolve_next(Ok(placements(2)));
        r.tick();
        assert_eq!(r.add(key(1)).unwrap().skipped, 2);
        r.remove(key(1));

        assert_eq!(r.end_frame(), 1);
        r.request(key(2));
        source.resolve_next(Ok(placements(2)));
        r.tick();
        assert_eq!(r.add(key(2)).unwrap().rendered, 2);
    }

    #[test]
    fn frame_skip_throttles_polling() {
        let (r, source) = renderer_with(&["a"], 8, 2);
        let mut r = VegetationRenderer::new(
            r.registry,
            r.allocator,
            source.clone(),
            MockCollision::default(),
            BatchSettings {
                frame_skip: 1,
                ..Default::default()
            },
        );
        r.request(key(0));
        source.resolve_next(Ok(placements(1)));
        assert_eq!(r.tick(), vec![key(0)]);
        r.request(key(1));
        source.resolve_next(Ok(placements(1)));
        assert!(r.tick().is_empty());
        assert_eq!(r.tick(), vec![key(1)]);
    }

    fn rendered_chunk(n: usize) -> VegetationRenderer<ManualSource, MockCollision> {
        let (mut r, source) = renderer_with(&["a"], 8, 2);
        r.request(key(0));
        source.resolve_next(Ok(placements(n)));
        r.tick();
        r.add(key(0));
        r
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "freed twice")]
    fn collider_freed_behind_the_renderers_back_panics_on_remove() {
        let mut r = rendered_chunk(3);
        assert!(r.collision_mut().remove_instance(2));
        r.remove(key(0));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "freed twice")]
    fn collider_freed_behind_the_renderers_back_panics_on_grab() {
        let mut r = rendered_chunk(3);
        assert!(r.collision_mut().remove_instance(1));
        r.grab_instance(1);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn collider_freed_twice_is_tolerated_in_release() {
        let mut r = rendered_chunk(3);
        assert!(r.collision_mut().remove_instance(2));
        assert!(r.remove(key(0)));
        assert!(r.collision().live.is_empty());
        assert_eq!(r.collider_count(), 0);
    }

    #[test]
    fn shutdown_releases_everything() {
        let (mut r, source) = renderer_with(&["a", "b"], 16, 4);
        for x in 0..3 {
            r.request(key(x));
            source.resolve_next(Ok(placements(10)));
        }
        for k in r.tick() {
            r.add(k);
        }
        r.request(key(9));
        assert_eq!(r.collider_count(), 30);
        assert_eq!(r.shutdown(), 4);
        assert!(r.physics_handles().is_empty());
        assert!(r.collision().live.is_empty());
        assert_eq!(r.pending_count(), 0);
    }
}
