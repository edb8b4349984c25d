//! Per-instance attribute pixel buffers.
//!
//! Each channel is a float texture stored row-major on the CPU. Instance `i` lives at
//! texel `(i % width, i / width)`. Writes mark their row dirty so the GPU copy can be
//! refreshed incrementally.

use std::ops::Range;

/// Attribute channel stored per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttributeChannel {
    /// World-space translation, xyz.
    Position,
    /// Rotation quaternion, xyzw.
    Orientation,
}

impl AttributeChannel {
    /// Floats stored per instance.
    pub const fn components(self) -> usize {
        match self {
            AttributeChannel::Position => 3,
            AttributeChannel::Orientation => 4,
        }
    }
}

/// CPU backing store for one attribute texture.
#[derive(Debug, Clone)]
pub struct AttributeBuffer {
    channel: AttributeChannel,
    width: u32,
    height: u32,
    data: Vec<f32>,
    dirty_rows: Option<Range<u32>>,
}

impl AttributeBuffer {
    /// Buffer able to hold `capacity` instances in rows of `width` texels.
    pub fn new(channel: AttributeChannel, width: u32, capacity: u32) -> Self {
        let width = width.max(1);
        let height = capacity.div_ceil(width).max(1);
        let len = (width * height) as usize * channel.components();
        Self {
            channel,
            width,
            height,
            data: vec![0.0; len],
            dirty_rows: None,
        }
    }

    pub fn channel(&self) -> AttributeChannel {
        self.channel
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of instances addressable.
    pub fn capacity(&self) -> u32 {
        self.width * self.height
    }

    /// Texel holding instance `index`.
    pub fn texel(&self, index: u32) -> (u32, u32) {
        (index % self.width, index / self.width)
    }

    /// Element offset of instance `index` in the backing store.
    pub fn element_offset(&self, index: u32) -> usize {
        index as usize * self.channel.components()
    }

    pub fn read(&self, index: u32) -> &[f32] {
        let start = self.element_offset(index);
        &self.data[start..start + self.channel.components()]
    }

    /// Overwrite one instance and flag its row for upload.
    pub fn write(&mut self, index: u32, values: &[f32]) {
        debug_assert_eq!(values.len(), self.channel.components());
        let start = self.element_offset(index);
        self.data[start..start + values.len()].copy_from_slice(values);
        self.mark_dirty(index);
    }

    /// Copy instance `src` over instance `dst`.
    pub fn copy_instance(&mut self, src: u32, dst: u32) {
        if src == dst {
            return;
        }
        let n = self.channel.components();
        let from = self.element_offset(src);
        let to = self.element_offset(dst);
        self.data.copy_within(from..from + n, to);
        self.mark_dirty(dst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_rows.is_some()
    }

    /// Rows written since the last call, clearing the dirty state.
    pub fn take_dirty_rows(&mut self) -> Option<Range<u32>> {
        self.dirty_rows.take()
    }

    /// Rows widened to four floats per texel, the layout of the GPU texture.
    pub fn rows_rgba(&self, rows: Range<u32>) -> Vec<f32> {
        let n = self.channel.components();
        let first = (rows.start * self.width) as usize;
        let last = (rows.end.min(self.height) * self.width) as usize;
        let mut out = Vec::with_capacity((last - first) * 4);
        for texel in first..last {
            let src = &self.data[texel * n..texel * n + n];
            out.extend_from_slice(src);
            out.extend(std::iter::repeat(1.0).take(4 - n));
        }
        out
    }

    fn mark_dirty(&mut self, index: u32) {
        let row = index / self.width;
        self.dirty_rows = Some(match self.dirty_rows.take() {
            Some(r) => r.start.min(row)..r.end.max(row + 1),
            None => row..row + 1,
        });
    }
}
