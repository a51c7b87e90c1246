//! Frame and GPU-wait timing

use super::rolling::RollingWindow;
use std::time::{Duration, Instant};

/// Tracks CPU frame time and the time spent blocked on frame fences.
pub struct FrameTimer {
    frame_start: Instant,
    frame_times: RollingWindow<Duration>,
    gpu_waits: RollingWindow<Duration>,
    frames: u64,
}

impl FrameTimer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frame_start: Instant::now(),
            frame_times: RollingWindow::new(capacity),
            gpu_waits: RollingWindow::new(capacity),
            frames: 0,
        }
    }

    pub fn begin(&mut self) {
        self.frame_start = Instant::now();
    }

    pub fn end(&mut self) {
        self.frame_times.push(self.frame_start.elapsed());
        self.frames += 1;
    }

    /// Record how long a fence wait blocked the submitting thread.
    pub fn record_gpu_wait(&mut self, waited: Duration) {
        self.gpu_waits.push(waited);
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn fps(&self) -> f64 {
        let avg = self.frame_times.average();
        if avg.as_secs_f64() > 0.0 {
            1.0 / avg.as_secs_f64()
        } else {
            0.0
        }
    }

    pub fn frame_time_ms(&self) -> f64 {
        self.frame_times.average().as_secs_f64() * 1000.0
    }

    /// Duration of the most recent frame.
    pub fn last_frame_ms(&self) -> f64 {
        self.frame_times
            .latest()
            .map_or(0.0, |last| last.as_secs_f64() * 1000.0)
    }

    /// Slowest frame still in the window.
    pub fn worst_frame_ms(&self) -> f64 {
        self.frame_times.worst().as_secs_f64() * 1000.0
    }

    pub fn gpu_wait_ms(&self) -> f64 {
        self.gpu_waits.average().as_secs_f64() * 1000.0
    }
}
