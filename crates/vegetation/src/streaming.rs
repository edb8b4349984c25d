//! Chunk streaming events and a grid tracker that produces them.
//!
//! The tracker keeps a square neighbourhood of chunks around the viewer. A chunk is first
//! announced with `DataRequest`; only once the consumer reports it ready is `Add` emitted.
//! Leaving the neighbourhood (or changing LOD ring) emits `Remove` for the old key.

use engine_core::{ChunkCoord, ChunkKey, Vec3};
use std::collections::HashMap;

/// Identifies one fetch of a chunk. A newer generation for the same key makes older
/// tickets stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkTicket {
    pub key: ChunkKey,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChunkEvent {
    /// Start producing placements for a chunk.
    DataRequest(ChunkKey),
    /// Data is ready and the chunk should be drawn.
    Add(ChunkKey),
    /// Release everything the chunk owns.
    Remove(ChunkKey),
    /// The viewer entered a different chunk.
    CoordinateUpdate { viewer: Vec3, chunk: ChunkCoord },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tracked {
    lod: u32,
    added: bool,
}

pub struct ChunkTracker {
    chunk_size: f32,
    range: u32,
    lod_count: u32,
    center: Option<ChunkCoord>,
    chunks: HashMap<ChunkCoord, Tracked>,
}

impl ChunkTracker {
    pub fn new(chunk_size: f32, range: u32, lod_count: u32) -> Self {
        Self {
            chunk_size,
            range,
            lod_count: lod_count.max(1),
            center: None,
            chunks: HashMap::new(),
        }
    }

    /// LOD ring for a chunk `distance` rings away from the viewer.
    pub fn lod_for_distance(&self, distance: u32) -> u32 {
        (distance * self.lod_count / (self.range + 1)).min(self.lod_count - 1)
    }

    /// Move the viewer. Emits nothing unless the viewer changed chunk.
    pub fn update(&mut self, viewer: Vec3) -> Vec<ChunkEvent> {
        let center = ChunkCoord::from_world(viewer, self.chunk_size);
        if self.center == Some(center) {
            return Vec::new();
        }
        self.center = Some(center);

        let mut events = vec![ChunkEvent::CoordinateUpdate { viewer, chunk: center }];
        let r = self.range as i32;

        let mut desired = HashMap::new();
        for dz in -r..=r {
            for dx in -r..=r {
                let coord = ChunkCoord::new(center.x + dx, center.z + dz);
                desired.insert(coord, self.lod_for_distance(coord.ring_distance(center)));
            }
        }

        let mut stale: Vec<ChunkKey> = self
            .chunks
            .iter()
            .filter(|(coord, t)| desired.get(coord) != Some(&t.lod))
            .map(|(&coord, t)| ChunkKey::new(coord, t.lod))
            .collect();
        stale.sort();
        for key in stale {
            self.chunks.remove(&key.coord);
            events.push(ChunkEvent::Remove(key));
        }

        let mut fresh: Vec<ChunkKey> = desired
            .into_iter()
            .filter(|(coord, _)| !self.chunks.contains_key(coord))
            .map(|(coord, lod)| ChunkKey::new(coord, lod))
            .collect();
        // Nearest first, then a stable order.
        fresh.sort_by_key(|k| (k.coord.ring_distance(center), *k));
        for key in fresh {
            self.chunks.insert(key.coord, Tracked { lod: key.lod, added: false });
            events.push(ChunkEvent::DataRequest(key));
        }

        log::debug!("Viewer entered chunk {}: {} events", center, events.len());
        events
    }

    /// The consumer finished fetching `key`. Returns the `Add` event if the chunk is still
    /// wanted at that LOD and was not already added.
    pub fn mark_ready(&mut self, key: ChunkKey) -> Option<ChunkEvent> {
        let tracked = self.chunks.get_mut(&key.coord)?;
        if tracked.lod != key.lod || tracked.added {
            return None;
        }
        tracked.added = true;
        Some(ChunkEvent::Add(key))
    }

    pub fn tracked_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_added(&self, key: ChunkKey) -> bool {
        self.chunks.get(&key.coord).is_some_and(|t| t.lod == key.lod && t.added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requests(events: &[ChunkEvent]) -> Vec<ChunkKey> {
        events
            .iter()
            .filter_map(|e| match e {
                ChunkEvent::DataRequest(k) => Some(*k),
                _ => None,
            })
            .collect()
    }

    fn removes(events: &[ChunkEvent]) -> Vec<ChunkKey> {
        events
            .iter()
            .filter_map(|e| match e {
                ChunkEvent::Remove(k) => Some(*k),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn first_update_requests_whole_neighbourhood() {
        let mut tracker = ChunkTracker::new(16.0, 1, 3);
        let events = tracker.update(Vec3::new(8.0, 0.0, 8.0));
        assert!(matches!(events[0], ChunkEvent::CoordinateUpdate { chunk, .. } if chunk == ChunkCoord::new(0, 0)));
        let req = requests(&events);
        assert_eq!(req.len(), 9);
        assert_eq!(req[0], ChunkKey::new(ChunkCoord::new(0, 0), 0));
        assert_eq!(tracker.tracked_count(), 9);
        assert!(tracker.update(Vec3::new(9.0, 0.0, 9.0)).is_empty());
    }

    #[test]
    fn lod_rings_grow_with_distance() {
        let tracker = ChunkTracker::new(16.0, 3, 3);
        assert_eq!(tracker.lod_for_distance(0), 0);
        assert_eq!(tracker.lod_for_distance(1), 0);
        assert_eq!(tracker.lod_for_distance(2), 1);
        assert_eq!(tracker.lod_for_distance(3), 2);
    }

    #[test]
    fn add_only_after_ready_and_only_once() {
        let mut tracker = ChunkTracker::new(16.0, 0, 1);
        let key = requests(&tracker.update(Vec3::ZERO))[0];
        assert!(!tracker.is_added(key));
        assert_eq!(tracker.mark_ready(key), Some(ChunkEvent::Add(key)));
        assert_eq!(tracker.mark_ready(key), None);
        assert!(tracker.is_added(key));
    }

    #[test]
    fn moving_removes_trailing_chunks_and_requests_leading_ones() {
        let mut tracker = ChunkTracker::new(16.0, 1, 1);
        tracker.update(Vec3::ZERO);
        let events = tracker.update(Vec3::new(20.0, 0.0, 0.0));
        let gone: Vec<i32> = removes(&events).iter().map(|k| k.coord.x).collect();
        assert_eq!(gone, [-1, -1, -1]);
        let new: Vec<i32> = requests(&events).iter().map(|k| k.coord.x).collect();
        assert_eq!(new, [2, 2, 2]);
        assert_eq!(tracker.tracked_count(), 9);
    }

    #[test]
    fn ready_for_stale_key_is_ignored() {
        let mut tracker = ChunkTracker::new(16.0, 0, 1);
        let key = requests(&tracker.update(Vec3::ZERO))[0];
        tracker.update(Vec3::new(100.0, 0.0, 0.0));
        assert_eq!(tracker.mark_ready(key), None);
    }

    #[test]
    fn lod_change_removes_then_rerequests() {
        let mut tracker = ChunkTracker::new(16.0, 2, 3);
        tracker.update(Vec3::ZERO);
        let events = tracker.update(Vec3::new(16.0 * 3.0 + 1.0, 0.0, 0.0));
        let moved = ChunkCoord::new(1, 0);
        assert!(removes(&events).contains(&ChunkKey::new(moved, 1)));
        assert!(requests(&events).contains(&ChunkKey::new(moved, 2)));
        assert!(requests(&events).iter().any(|k| k.coord == ChunkCoord::new(5, 0)));
    }
}
