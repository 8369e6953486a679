//! Frame timing for the render loop.

use std::time::{Duration, Instant};

/// Weight given to the newest frame when smoothing the frame rate.
const FPS_SMOOTHING: f32 = 0.1;

/// Measures per-frame delta time and a smoothed frame rate.
#[derive(Debug)]
pub struct FrameClock {
    start: Instant,
    last_tick: Instant,
    frames: u64,
    smoothed_fps: f32,
}

impl FrameClock {
    /// Create a new clock, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            frames: 0,
            smoothed_fps: 0.0,
        }
    }

    /// Total time since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Mark the end of a frame and return the time since the previous one.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;
        self.record(delta);
        delta
    }

    fn record(&mut self, delta: Duration) {
        self.frames += 1;
        let secs = delta.as_secs_f32();
        if secs <= f32::EPSILON {
            return;
        }
        let fps = 1.0 / secs;
        self.smoothed_fps = if self.frames == 1 {
            fps
        } else {
            self.smoothed_fps + (fps - self.smoothed_fps) * FPS_SMOOTHING
        };
    }

    /// Number of ticks so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Exponentially smoothed frames per second.
    pub fn fps(&self) -> f32 {
        self.smoothed_fps
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fps_smoothing() {
        let mut clock = FrameClock::new();
        clock.record(Duration::from_millis(10));
        assert!((clock.fps() - 100.0).abs() < 0.01);

        clock.record(Duration::from_millis(20));
        // 100 + (50 - 100) * 0.1
        assert!((clock.fps() - 95.0).abs() < 0.01);
        assert_eq!(clock.frames(), 2);
    }

    #[test]
    fn test_zero_delta_counts_frame_only() {
        let mut clock = FrameClock::new();
        clock.record(Duration::ZERO);
        assert_eq!(clock.frames(), 1);
        assert_eq!(clock.fps(), 0.0);
    }
}
