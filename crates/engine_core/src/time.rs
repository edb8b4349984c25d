//! Frame timing and per-tick throttling.

use std::time::{Duration, Instant};

/// Measures frame deltas for the update loop.
#[derive(Debug)]
pub struct Time {
    start_time: Instant,
    last_frame: Instant,
    delta: Duration,
    frame_count: u64,
}

impl Default for Time {
    fn default() -> Self {
        Self::new()
    }
}

impl Time {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_frame: now,
            delta: Duration::ZERO,
            frame_count: 0,
        }
    }

    /// Update timing at the start of a new frame.
    pub fn update(&mut self) {
        let now = Instant::now();
        self.delta = now - self.last_frame;
        self.last_frame = now;
        self.frame_count += 1;
    }

    /// Get the delta time in seconds.
    pub fn delta_seconds(&self) -> f32 {
        self.delta.as_secs_f32()
    }

    /// Total elapsed time since creation.
    pub fn elapsed(&self) -> Duration {
        self.last_frame - self.start_time
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

/// Runs work on one tick out of every `skip + 1`.
///
/// Owned by whichever component is throttled; advanced exactly once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameThrottle {
    skip: u32,
    counter: u32,
}

impl FrameThrottle {
    pub fn new(skip: u32) -> Self {
        Self { skip, counter: 0 }
    }

    /// Advance one tick. Returns true when this tick should do the work.
    pub fn advance(&mut self) -> bool {
        let run = self.counter == 0;
        self.counter = if self.counter >= self.skip { 0 } else { self.counter + 1 };
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_without_skip_runs_every_tick() {
        let mut t = FrameThrottle::new(0);
        assert!((0..5).all(|_| t.advance()));
    }

    #[test]
    fn throttle_skips_between_runs() {
        let mut t = FrameThrottle::new(2);
        let runs: Vec<bool> = (0..7).map(|_| t.advance()).collect();
        assert_eq!(runs, vec![true, false, false, true, false, false, true]);
    }
}
