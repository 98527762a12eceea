use std::time::{Duration, Instant};

/// Frames-per-second counter driven by a periodic tick.
#[derive(Debug, Clone)]
pub struct RateCounter {
    frames_since_tick: u64,
    total_frames: u64,
    fps: f32,
    last_tick: Instant,
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateCounter {
    pub fn new() -> Self {
        Self {
            frames_since_tick: 0,
            total_frames: 0,
            fps: 0.0,
            last_tick: Instant::now(),
        }
    }

    pub fn record_frame(&mut self) {
        self.frames_since_tick += 1;
        self.total_frames += 1;
    }

    /// Close the current interval of length `elapsed` and return the new rate.
    pub fn tick(&mut self, elapsed: Duration) -> f32 {
        let secs = elapsed.as_secs_f64();
        self.fps = if secs > 0.0 {
            (self.frames_since_tick as f64 / secs) as f32
        } else {
            0.0
        };
        self.frames_since_tick = 0;
        self.last_tick = Instant::now();
        self.fps
    }

    /// Tick using the wall-clock time since the previous tick.
    pub fn tick_now(&mut self) -> f32 {
        self.tick(self.last_tick.elapsed())
    }

    /// Back to the stopped state: no rate, nothing counted.
    pub fn reset(&mut self) {
        self.frames_since_tick = 0;
        self.total_frames = 0;
        self.fps = 0.0;
        self.last_tick = Instant::now();
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thirty_frames_per_second() {
        let mut rate = RateCounter::new();
        for _ in 0..30 {
            rate.record_frame();
        }
        assert_eq!(rate.tick(Duration::from_secs(1)), 30.0);
        assert_eq!(rate.fps(), 30.0);

        assert_eq!(rate.tick(Duration::from_secs(1)), 0.0);
        assert_eq!(rate.total_frames(), 30);
    }

    #[test]
    fn test_fractional_interval() {
        let mut rate = RateCounter::new();
        for _ in 0..5 {
            rate.record_frame();
        }
        assert_eq!(rate.tick(Duration::from_millis(500)), 10.0);
    }

    #[test]
    fn test_zero_elapsed() {
        let mut rate = RateCounter::new();
        rate.record_frame();
        assert_eq!(rate.tick(Duration::ZERO), 0.0);
        // the interval closed even though no rate came out of it
        assert_eq!(rate.tick(Duration::from_secs(1)), 0.0);
    }

    #[test]
    fn test_reset() {
        let mut rate = RateCounter::new();
        rate.record_frame();
        rate.record_frame();
        rate.tick(Duration::from_secs(1));
        rate.record_frame();
        rate.reset();
        assert_eq!(rate.fps(), 0.0);
        assert_eq!(rate.total_frames(), 0);
        assert_eq!(rate.tick(Duration::from_secs(1)), 0.0);
    }

    #[test]
    fn test_tick_now_uses_wall_clock() {
        let mut rate = RateCounter::new();
        std::thread::sleep(Duration::from_millis(20));
        for _ in 0..4 {
            rate.record_frame();
        }
        let fps = rate.tick_now();
        // 4 frames over at least 20ms
        assert!(fps > 0.0 && fps <= 200.0, "fps = {fps}");
    }
}
