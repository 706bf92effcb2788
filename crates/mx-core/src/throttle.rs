//! Frame rate throttle for the grab path.
//!
//! Admission is decided against the previous admitted frame plus the frame
//! interval. When a frame arrives late, the overshoot is subtracted from
//! the new reference so the long-term admitted rate converges on the cap
//! instead of drifting below it.

use std::time::{Duration, Instant};

pub struct FrameRateThrottle {
    max_fps: Option<f32>,
    last_admitted: Option<Instant>,
}

impl FrameRateThrottle {
    pub fn new() -> Self {
        Self {
            max_fps: None,
            last_admitted: None,
        }
    }

    /// Set or clear the cap. Non-positive values clear it.
    pub fn set_limit(&mut self, max_fps: Option<f32>) {
        self.max_fps = max_fps.filter(|fps| *fps > 0.0);
        self.last_admitted = None;
    }

    pub fn limit(&self) -> Option<f32> {
        self.max_fps
    }

    pub fn admit(&mut self) -> bool {
        self.admit_at(Instant::now())
    }

    pub fn admit_at(&mut self, now: Instant) -> bool {
        let Some(fps) = self.max_fps else {
            self.last_admitted = Some(now);
            return true;
        };
        let interval = Duration::from_secs_f64(1.0 / f64::from(fps));
        match self.last_admitted {
            None => {
                self.last_admitted = Some(now);
                true
            }
            Some(prev) => {
                let elapsed = now.saturating_duration_since(prev);
                if elapsed > interval {
                    self.last_admitted = Some(now - (elapsed - interval));
                    true
                } else {
                    false
                }
            }
        }
    }
}

impl Default for FrameRateThrottle {
    fn default() -> Self {
        Self::new()
    }
}
