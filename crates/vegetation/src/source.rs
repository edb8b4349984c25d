//! Where chunk placements come from.

use engine_core::{ChunkCoord, Vec3};
use procgen::{InstancePlacements, ScatterGenerator};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// A pending placement fetch. Polled once per renderer tick, never blocked on.
pub type PlacementFetch = Pin<Box<dyn Future<Output = anyhow::Result<InstancePlacements>>>>;

pub trait PlacementSource {
    /// Start fetching placements for the chunk whose minimum corner is `(world_x, world_z)`.
    fn fetch_instances(&mut self, world_x: f32, world_z: f32, lod: u32) -> PlacementFetch;
}

/// Resolves after being polled `remaining` more times.
struct YieldTicks {
    remaining: u32,
}

impl Future for YieldTicks {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.remaining == 0 {
            return Poll::Ready(());
        }
        self.remaining -= 1;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Procedural placements from [`ScatterGenerator`], optionally delayed by a few ticks to
/// behave like a background job.
pub struct ScatterSource {
    generator: Rc<ScatterGenerator>,
    latency_ticks: u32,
}

impl ScatterSource {
    pub fn new(generator: ScatterGenerator, latency_ticks: u32) -> Self {
        Self {
            generator: Rc::new(generator),
            latency_ticks,
        }
    }

    pub fn generator(&self) -> &ScatterGenerator {
        &self.generator
    }
}

impl PlacementSource for ScatterSource {
    fn fetch_instances(&mut self, world_x: f32, world_z: f32, lod: u32) -> PlacementFetch {
        let generator = Rc::clone(&self.generator);
        let half = generator.config.chunk_size * 0.5;
        let coord = ChunkCoord::from_world(Vec3::new(world_x + half, 0.0, world_z + half), generator.config.chunk_size);
        let latency = self.latency_ticks;
        Box::pin(async move {
            YieldTicks { remaining: latency }.await;
            Ok(generator.generate(coord, lod))
        })
    }
}
