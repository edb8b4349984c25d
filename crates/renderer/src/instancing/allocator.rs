//! Draw-call slot allocator for instanced geometry variants.
//!
//! All variants share one merged vertex/index buffer. Each variant owns a fixed row of
//! `max_draw_calls_per_geometry` slots; slot `s` owns instances
//! `s * max_instances_per_draw_call .. (s + 1) * max_instances_per_draw_call` of both
//! attribute buffers. The vertex stage recovers an instance's texel from that formula,
//! so a slot's region never moves while the slot is live.

use super::attribute::{AttributeBuffer, AttributeChannel};
use crate::mesh::{MeshData, MeshRange};
use engine_core::{Aabb, Transform};
use std::ops::Range;
use thiserror::Error;

/// Capacity parameters shared by the allocator and the vertex stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstancingLimits {
    pub max_instances_per_draw_call: u32,
    pub max_draw_calls_per_geometry: u32,
    /// Texel width of the attribute textures.
    pub texture_width: u32,
}

impl Default for InstancingLimits {
    fn default() -> Self {
        Self {
            max_instances_per_draw_call: 128,
            max_draw_calls_per_geometry: 64,
            texture_width: 1024,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("geometry {geometry} already has {max} draw calls in use")]
    Capacity { geometry: usize, max: u32 },
    #[error("unknown geometry index {0}")]
    UnknownGeometry(usize),
    #[error("slot {0} is not live")]
    NotLive(SlotId),
    #[error("slot {0} freed twice")]
    DoubleFree(SlotId),
    #[error("slot {slot} is full ({capacity} instances)")]
    SlotFull { slot: SlotId, capacity: u32 },
    #[error("slot {0} has no live instances")]
    SlotEmpty(SlotId),
    #[error("instance {local} out of range for slot {slot} ({live} live)")]
    OutOfRange { slot: SlotId, local: u32, live: u32 },
    #[error("invalid instancing limits: {0}")]
    InvalidLimits(&'static str),
}

/// Global slot index: `geometry * max_draw_calls_per_geometry + slot_in_variant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Source mesh for one variant, before merging.
#[derive(Debug, Clone)]
pub struct VariantMesh {
    pub name: String,
    pub mesh: MeshData,
}

/// One geometry variant inside the merged buffer. Immutable once built.
#[derive(Debug, Clone)]
pub struct GeometryVariant {
    pub index: usize,
    pub name: String,
    pub range: MeshRange,
    /// Local-space bounds of the source mesh.
    pub bounds: Aabb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Live,
    /// Freed this frame; its attribute region may still be read by in-flight draws.
    Quarantined,
}

/// A reserved run of instance storage drawn by one call.
#[derive(Debug, Clone)]
pub struct DrawCallSlot {
    pub id: SlotId,
    pub geometry: usize,
    pub capacity: u32,
    pub live: u32,
    pub bounds: Aabb,
    state: SlotState,
}

impl DrawCallSlot {
    pub fn is_live(&self) -> bool {
        self.state == SlotState::Live
    }

    pub fn is_full(&self) -> bool {
        self.live >= self.capacity
    }

    /// First attribute-buffer instance index owned by this slot.
    pub fn first_instance(&self) -> u32 {
        self.id.0 * self.capacity
    }
}

/// One indexed instanced draw for a live slot.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawCommand {
    pub slot: SlotId,
    pub geometry: usize,
    pub indices: Range<u32>,
    pub base_vertex: i32,
    /// Starts at `slot * max_instances_per_draw_call`; the shader relies on it.
    pub instances: Range<u32>,
    pub bounds: Aabb,
}

/// Owns merged geometry, the slot grid and both attribute buffers.
#[derive(Debug)]
pub struct InstancedGeometryAllocator {
    limits: InstancingLimits,
    geometry: MeshData,
    variants: Vec<GeometryVariant>,
    slots: Vec<DrawCallSlot>,
    live_per_variant: Vec<u32>,
    quarantined: Vec<SlotId>,
    positions: AttributeBuffer,
    orientations: AttributeBuffer,
}

impl InstancedGeometryAllocator {
    /// Merge `meshes` and reserve the slot grid and attribute storage.
    pub fn new(meshes: &[VariantMesh], limits: InstancingLimits) -> Result<Self, AllocError> {
        if limits.max_instances_per_draw_call == 0 {
            return Err(AllocError::InvalidLimits("max_instances_per_draw_call is zero"));
        }
        if limits.max_draw_calls_per_geometry == 0 {
            return Err(AllocError::InvalidLimits("max_draw_calls_per_geometry is zero"));
        }
        if limits.texture_width == 0 {
            return Err(AllocError::InvalidLimits("texture_width is zero"));
        }

        let mut geometry = MeshData::new();
        let variants: Vec<GeometryVariant> = meshes
            .iter()
            .enumerate()
            .map(|(index, vm)| GeometryVariant {
                index,
                name: vm.name.clone(),
                range: geometry.append(&vm.mesh),
                bounds: vm.mesh.bounds(),
            })
            .collect();

        let per_variant = limits.max_draw_calls_per_geometry;
        let slots = (0..variants.len() as u32 * per_variant)
            .map(|i| DrawCallSlot {
                id: SlotId(i),
                geometry: (i / per_variant) as usize,
                capacity: limits.max_instances_per_draw_call,
                live: 0,
                bounds: Aabb::EMPTY,
                state: SlotState::Free,
            })
            .collect::<Vec<_>>();

        let total = slots.len() as u32 * limits.max_instances_per_draw_call;
        log::info!(
            "Instancing: {} variants, {} slots x {} instances ({} vertices, {} indices)",
            variants.len(),
            slots.len(),
            limits.max_instances_per_draw_call,
            geometry.vertices.len(),
            geometry.indices.len()
        );

        Ok(Self {
            limits,
            live_per_variant: vec![0; variants.len()],
            geometry,
            variants,
            slots,
            quarantined: Vec::new(),
            positions: AttributeBuffer::new(AttributeChannel::Position, limits.texture_width, total),
            orientations: AttributeBuffer::new(AttributeChannel::Orientation, limits.texture_width, total),
        })
    }

    pub fn limits(&self) -> InstancingLimits {
        self.limits
    }

    pub fn geometry(&self) -> &MeshData {
        &self.geometry
    }

    pub fn variants(&self) -> &[GeometryVariant] {
        &self.variants
    }

    pub fn slot(&self, id: SlotId) -> Option<&DrawCallSlot> {
        self.slots.get(id.0 as usize)
    }

    /// Slots currently live (not free, not quarantined) for `geometry`.
    pub fn live_slot_count(&self, geometry: usize) -> u32 {
        self.live_per_variant.get(geometry).copied().unwrap_or(0)
    }

    /// Slots not yet returned to the pool for `geometry` (live plus quarantined).
    pub fn reserved_slot_count(&self, geometry: usize) -> usize {
        self.variant_slots(geometry)
            .iter()
            .filter(|s| s.state != SlotState::Free)
            .count()
    }

    pub fn live_slots(&self) -> impl Iterator<Item = &DrawCallSlot> {
        self.slots.iter().filter(|s| s.is_live())
    }

    /// Attribute index for instance `local` of `slot`.
    pub fn instance_index(&self, slot: SlotId, local: u32) -> u32 {
        slot.0 * self.limits.max_instances_per_draw_call + local
    }

    /// Reserve the lowest free slot of `geometry`.
    ///
    /// Fails with [`AllocError::Capacity`] when every slot of that variant is live or
    /// still quarantined; nothing changes in that case.
    pub fn alloc_draw_call(&mut self, geometry: usize, bounds: Aabb) -> Result<SlotId, AllocError> {
        if geometry >= self.variants.len() {
            return Err(AllocError::UnknownGeometry(geometry));
        }
        let max = self.limits.max_draw_calls_per_geometry;
        let slot = self
            .variant_slots_mut(geometry)
            .iter_mut()
            .find(|s| s.state == SlotState::Free)
            .ok_or(AllocError::Capacity { geometry, max })?;

        slot.state = SlotState::Live;
        slot.live = 0;
        slot.bounds = bounds;
        let id = slot.id;
        self.live_per_variant[geometry] += 1;
        log::trace!("Instancing: alloc slot {} for geometry {}", id, geometry);
        Ok(id)
    }

    /// Release a live slot. Its storage becomes reusable after the next [`end_frame`].
    ///
    /// Freeing a slot that is not live is an ownership bug: debug builds panic.
    ///
    /// [`end_frame`]: Self::end_frame
    pub fn free_draw_call(&mut self, id: SlotId) -> Result<(), AllocError> {
        let slot = self.slots.get_mut(id.0 as usize).ok_or(AllocError::NotLive(id))?;
        debug_assert!(slot.is_live(), "draw-call slot {} freed while not live", id);
        if !slot.is_live() {
            return Err(AllocError::DoubleFree(id));
        }
        slot.state = SlotState::Quarantined;
        slot.live = 0;
        slot.bounds = Aabb::EMPTY;
        let geometry = slot.geometry;
        self.live_per_variant[geometry] -= 1;
        self.quarantined.push(id);
        log::trace!("Instancing: free slot {}", id);
        Ok(())
    }

    /// Frame boundary: slots freed before this point become allocatable.
    pub fn end_frame(&mut self) -> usize {
        let released = self.quarantined.len();
        for id in self.quarantined.drain(..) {
            self.slots[id.0 as usize].state = SlotState::Free;
        }
        released
    }

    /// Backing store for `channel` and the first instance index `slot` owns in it.
    pub fn attribute_buffer(
        &mut self,
        slot: SlotId,
        channel: AttributeChannel,
    ) -> Result<(&mut AttributeBuffer, u32), AllocError> {
        let first = self.live_slot(slot)?.first_instance();
        let buffer = match channel {
            AttributeChannel::Position => &mut self.positions,
            AttributeChannel::Orientation => &mut self.orientations,
        };
        Ok((buffer, first))
    }

    pub fn buffer(&self, channel: AttributeChannel) -> &AttributeBuffer {
        match channel {
            AttributeChannel::Position => &self.positions,
            AttributeChannel::Orientation => &self.orientations,
        }
    }

    /// Mark one more instance of `slot` active. Returns its local index.
    pub fn increment_instance_count(&mut self, slot: SlotId) -> Result<u32, AllocError> {
        let s = self.live_slot_mut(slot)?;
        if s.is_full() {
            return Err(AllocError::SlotFull {
                slot,
                capacity: s.capacity,
            });
        }
        s.live += 1;
        Ok(s.live - 1)
    }

    /// Drop the last active instance of `slot`. Remaining instances do not move.
    pub fn decrement_instance_count(&mut self, slot: SlotId) -> Result<u32, AllocError> {
        let s = self.live_slot_mut(slot)?;
        if s.live == 0 {
            return Err(AllocError::SlotEmpty(slot));
        }
        s.live -= 1;
        Ok(s.live)
    }

    /// Write both channels of instance `local` in `slot`.
    pub fn write_instance(&mut self, slot: SlotId, local: u32, transform: &Transform) -> Result<(), AllocError> {
        let s = self.live_slot(slot)?;
        if local >= s.capacity {
            return Err(AllocError::OutOfRange {
                slot,
                local,
                live: s.live,
            });
        }
        let index = s.first_instance() + local;
        let packed = transform.packed();
        self.positions.write(index, &packed.position);
        self.orientations.write(index, &packed.orientation);
        Ok(())
    }

    /// Read back instance `local` of `slot`.
    pub fn read_instance(&self, slot: SlotId, local: u32) -> Option<Transform> {
        let s = self.slot(slot).filter(|s| s.is_live() && local < s.live)?;
        let index = s.first_instance() + local;
        let p = self.positions.read(index);
        let o = self.orientations.read(index);
        Some(Transform::from_packed([p[0], p[1], p[2]], [o[0], o[1], o[2], o[3]]))
    }

    /// Remove instance `local`, keeping the slot's active run contiguous.
    ///
    /// The last active instance is moved into the hole. Returns the local index that
    /// moved (so the caller can re-point whatever referenced it), or `None` when the
    /// removed instance was already last.
    pub fn swap_remove_instance(&mut self, slot: SlotId, local: u32) -> Result<Option<u32>, AllocError> {
        let s = self.live_slot(slot)?;
        if local >= s.live {
            return Err(AllocError::OutOfRange {
                slot,
                local,
                live: s.live,
            });
        }
        let first = s.first_instance();
        let last = s.live - 1;
        if local != last {
            self.positions.copy_instance(first + last, first + local);
            self.orientations.copy_instance(first + last, first + local);
        }
        self.live_slot_mut(slot)?.live -= 1;
        Ok((local != last).then_some(last))
    }

    /// One draw per live, non-empty slot.
    pub fn draw_commands(&self) -> Vec<DrawCommand> {
        self.live_slots()
            .filter(|s| s.live > 0)
            .map(|s| {
                let range = &self.variants[s.geometry].range;
                let first = s.first_instance();
                DrawCommand {
                    slot: s.id,
                    geometry: s.geometry,
                    indices: range.indices.clone(),
                    base_vertex: range.vertices.start as i32,
                    instances: first..first + s.live,
                    bounds: s.bounds,
                }
            })
            .collect()
    }

    /// Dirty row spans of both channels since the last upload.
    pub fn take_dirty_rows(&mut self) -> [(AttributeChannel, Option<Range<u32>>); 2] {
        [
            (AttributeChannel::Position, self.positions.take_dirty_rows()),
            (AttributeChannel::Orientation, self.orientations.take_dirty_rows()),
        ]
    }

    /// Total active instances across every live slot of `geometry`.
    pub fn live_instances(&self, geometry: usize) -> u32 {
        self.variant_slots(geometry)
            .iter()
            .filter(|s| s.is_live())
            .map(|s| s.live)
            .sum()
    }

    fn variant_slots(&self, geometry: usize) -> &[DrawCallSlot] {
        let per = self.limits.max_draw_calls_per_geometry as usize;
        let start = (geometry * per).min(self.slots.len());
        let end = (start + per).min(self.slots.len());
        &self.slots[start..end]
    }

    fn variant_slots_mut(&mut self, geometry: usize) -> &mut [DrawCallSlot] {
        let per = self.limits.max_draw_calls_per_geometry as usize;
        let start = (geometry * per).min(self.slots.len());
        let end = (start + per).min(self.slots.len());
        &mut self.slots[start..end]
    }

    fn live_slot(&self, id: SlotId) -> Result<&DrawCallSlot, AllocError> {
        self.slots
            .get(id.0 as usize)
            .filter(|s| s.is_live())
            .ok_or(AllocError::NotLive(id))
    }

    fn live_slot_mut(&mut self, id: SlotId) -> Result<&mut DrawCallSlot, AllocError> {
        self.slots
            .get_mut(id.0 as usize)
            .filter(|s| s.is_live())
            .ok_or(AllocError::NotLive(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_core::Vec3;
    use std::collections::HashSet;

    fn limits(instances: u32, draw_calls: u32) -> InstancingLimits {
        InstancingLimits {
            max_instances_per_draw_call: instances,
            max_draw_calls_per_geometry: draw_calls,
            texture_width: 64,
        }
    }

    fn allocator(variants: usize, instances: u32, draw_calls: u32) -> InstancedGeometryAllocator {
        let meshes: Vec<_> = (0..variants)
            .map(|i| VariantMesh {
                name: format!("plant{}", i),
                mesh: MeshData::cross_quads(1.0, 1.0 + i as f32),
            })
            .collect();
        InstancedGeometryAllocator::new(&meshes, limits(instances, draw_calls)).unwrap()
    }

    #[test]
    fn zero_limits_are_rejected() {
        let err = InstancedGeometryAllocator::new(&[], limits(0, 4)).unwrap_err();
        assert!(matches!(err, AllocError::InvalidLimits(_)));
    }

    #[test]
    fn slot_ids_are_global_per_variant_rows() {
        let mut a = allocator(3, 8, 4);
        let s0 = a.alloc_draw_call(0, Aabb::EMPTY).unwrap();
        let s2 = a.alloc_draw_call(2, Aabb::EMPTY).unwrap();
        assert_eq!(s0, SlotId(0));
        assert_eq!(s2, SlotId(8));
        assert_eq!(a.slot(s2).unwrap().first_instance(), 64);
        assert_eq!(a.instance_index(s2, 3), 67);
    }

    #[test]
    fn capacity_failure_leaves_state_unchanged() {
        let mut a = allocator(2, 4, 2);
        a.alloc_draw_call(0, Aabb::EMPTY).unwrap();
        a.alloc_draw_call(0, Aabb::EMPTY).unwrap();
        let before: Vec<_> = a.live_slots().map(|s| s.id).collect();
        let err = a.alloc_draw_call(0, Aabb::EMPTY).unwrap_err();
        assert_eq!(err, AllocError::Capacity { geometry: 0, max: 2 });
        let after: Vec<_> = a.live_slots().map(|s| s.id).collect();
        assert_eq!(before, after);
        assert_eq!(a.live_slot_count(0), 2);
        // The other variant is unaffected.
        assert!(a.alloc_draw_call(1, Aabb::EMPTY).is_ok());
    }

    #[test]
    fn live_slots_never_exceed_limit_under_churn() {
        let mut a = allocator(2, 4, 3);
        let mut live: Vec<SlotId> = Vec::new();
        // Deterministic pseudo-random alloc/free sequence.
        let mut state = 0x2545_f491_u32;
        for step in 0..500 {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let geometry = (state % 2) as usize;
            if state % 3 == 0 && !live.is_empty() {
                let victim = live.remove((state as usize / 3) % live.len());
                a.free_draw_call(victim).unwrap();
            } else if let Ok(id) = a.alloc_draw_call(geometry, Aabb::EMPTY) {
                live.push(id);
            }
            if step % 7 == 0 {
                a.end_frame();
            }
            for g in 0..2 {
                assert!(a.live_slot_count(g) <= 3);
                assert!(a.reserved_slot_count(g) <= 3);
            }
        }
        let unique: HashSet<_> = live.iter().collect();
        assert_eq!(unique.len(), live.len());
    }

    #[test]
    fn freed_slot_is_quarantined_until_frame_boundary() {
        let mut a = allocator(1, 4, 1);
        let s = a.alloc_draw_call(0, Aabb::EMPTY).unwrap();
        a.free_draw_call(s).unwrap();
        assert_eq!(a.live_slot_count(0), 0);
        assert!(matches!(
            a.alloc_draw_call(0, Aabb::EMPTY),
            Err(AllocError::Capacity { .. })
        ));
        assert_eq!(a.end_frame(), 1);
        assert_eq!(a.alloc_draw_call(0, Aabb::EMPTY).unwrap(), s);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "freed while not live")]
    fn double_free_panics_in_debug() {
        let mut a = allocator(1, 4, 1);
        let s = a.alloc_draw_call(0, Aabb::EMPTY).unwrap();
        a.free_draw_call(s).unwrap();
        let _ = a.free_draw_call(s);
    }

    #[test]
    fn instance_counts_respect_capacity() {
        let mut a = allocator(1, 2, 1);
        let s = a.alloc_draw_call(0, Aabb::EMPTY).unwrap();
        assert_eq!(a.increment_instance_count(s), Ok(0));
        assert_eq!(a.increment_instance_count(s), Ok(1));
        assert_eq!(
            a.increment_instance_count(s),
            Err(AllocError::SlotFull { slot: s, capacity: 2 })
        );
        assert_eq!(a.decrement_instance_count(s), Ok(1));
        assert_eq!(a.decrement_instance_count(s), Ok(0));
        assert_eq!(a.decrement_instance_count(s), Err(AllocError::SlotEmpty(s)));
    }

    #[test]
    fn attribute_buffer_offset_matches_slot_region() {
        let mut a = allocator(2, 16, 2);
        let _ = a.alloc_draw_call(1, Aabb::EMPTY).unwrap();
        let s = a.alloc_draw_call(1, Aabb::EMPTY).unwrap();
        let (buf, first) = a.attribute_buffer(s, AttributeChannel::Orientation).unwrap();
        assert_eq!(first, 3 * 16);
        assert_eq!(buf.channel(), AttributeChannel::Orientation);
        buf.write(first, &[0.0, 0.0, 0.0, 1.0]);
        assert!(a.buffer(AttributeChannel::Orientation).is_dirty());
    }

    #[test]
    fn instance_indices_unique_and_stable_until_free() {
        let mut a = allocator(2, 4, 2);
        let slots = [
            a.alloc_draw_call(0, Aabb::EMPTY).unwrap(),
            a.alloc_draw_call(0, Aabb::EMPTY).unwrap(),
            a.alloc_draw_call(1, Aabb::EMPTY).unwrap(),
        ];
        let mut seen = HashSet::new();
        for &s in &slots {
            for _ in 0..4 {
                let local = a.increment_instance_count(s).unwrap();
                assert!(seen.insert(a.instance_index(s, local)));
            }
        }
        let idx = a.instance_index(slots[2], 1);
        a.free_draw_call(slots[0]).unwrap();
        assert_eq!(a.instance_index(slots[2], 1), idx);
    }

    #[test]
    fn swap_remove_compacts_tail_into_hole() {
        let mut a = allocator(1, 8, 1);
        let s = a.alloc_draw_call(0, Aabb::EMPTY).unwrap();
        for i in 0..3 {
            let local = a.increment_instance_count(s).unwrap();
            let t = Transform::from_position(Vec3::new(i as f32, 0.0, 0.0));
            a.write_instance(s, local, &t).unwrap();
        }
        assert_eq!(a.swap_remove_instance(s, 0), Ok(Some(2)));
        assert_eq!(a.slot(s).unwrap().live, 2);
        assert_eq!(a.read_instance(s, 0).unwrap().position, Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(a.read_instance(s, 1).unwrap().position, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(a.swap_remove_instance(s, 1), Ok(None));
        assert!(a.read_instance(s, 1).is_none());
    }

    #[test]
    fn draw_commands_cover_live_nonempty_slots() {
        let mut a = allocator(2, 4, 2);
        let empty = a.alloc_draw_call(0, Aabb::EMPTY).unwrap();
        let s = a.alloc_draw_call(1, Aabb::EMPTY).unwrap();
        a.increment_instance_count(s).unwrap();
        a.increment_instance_count(s).unwrap();
        let cmds = a.draw_commands();
        assert_eq!(cmds.len(), 1);
        let cmd = &cmds[0];
        assert_ne!(cmd.slot, empty);
        assert_eq!(cmd.instances, 8..10);
        assert_eq!(cmd.indices, a.variants()[1].range.indices);
        assert_eq!(cmd.base_vertex, 8);
    }
}
