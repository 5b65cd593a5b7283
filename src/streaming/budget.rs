//! Adaptive per-tick load budget driven by frame-time smoothing
//!
//! Slow recent ticks throttle new load starts, trading freshness for
//! responsiveness.

use std::time::Instant;

/// Exponential moving average of wall-clock time between ticks.
#[derive(Clone, Debug)]
pub struct FrameTimer {
    alpha: f32,
    ema_ms: f32,
    last_tick: Option<Instant>,
}

impl FrameTimer {
    /// Default smoothing factor.
    pub const ALPHA: f32 = 0.12;

    pub fn new(target_frame_ms: f32) -> Self {
        Self {
            alpha: Self::ALPHA,
            // Seed at the target so a cold start is not throttled.
            ema_ms: target_frame_ms,
            last_tick: None,
        }
    }

    /// Record a tick at `now`; returns the updated average in ms.
    pub fn tick(&mut self, now: Instant) -> f32 {
        if let Some(last) = self.last_tick {
            let dt_ms = now.duration_since(last).as_secs_f32() * 1000.0;
            self.ema_ms = self.ema_ms + self.alpha * (dt_ms - self.ema_ms);
        }
        self.last_tick = Some(now);
        self.ema_ms
    }

    pub fn average_ms(&self) -> f32 {
        self.ema_ms
    }
}

/// Per-tick chunk load budget.
#[derive(Clone, Copy, Debug)]
pub struct LoadBudget {
    /// Load starts allowed per tick at the target frame time.
    pub base: usize,
    /// Target frame duration in ms.
    pub target_frame_ms: f32,
}

impl Default for LoadBudget {
    fn default() -> Self {
        Self {
            base: 4,
            target_frame_ms: 16.6,
        }
    }
}

impl LoadBudget {
    /// `base * clamp(target / average, 0.25, 1.0)`, never below one so
    /// progress cannot stall entirely.
    pub fn per_tick(&self, average_frame_ms: f32) -> usize {
        let ratio = (self.target_frame_ms / average_frame_ms.max(f32::EPSILON)).clamp(0.25, 1.0);
        (((self.base as f32) * ratio).floor() as usize).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timer_seeds_at_target() {
        let timer = FrameTimer::new(16.6);
        assert_eq!(timer.average_ms(), 16.6);
    }

    #[test]
    fn test_timer_converges_toward_observed_spacing() {
        let mut timer = FrameTimer::new(16.6);
        let mut t = Instant::now();
        timer.tick(t);
        for _ in 0..200 {
            t += Duration::from_millis(33);
            timer.tick(t);
        }
        assert!((timer.average_ms() - 33.0).abs() < 1.0);
    }

    #[test]
    fn test_timer_single_slow_tick_moves_average_a_little() {
        let mut timer = FrameTimer::new(16.0);
        let t = Instant::now();
        timer.tick(t);
        let avg = timer.tick(t + Duration::from_millis(116));
        // alpha 0.12: 16 + 0.12 * (116 - 16) = 28
        assert!((avg - 28.0).abs() < 0.5);
    }

    #[test]
    fn test_budget_full_at_target() {
        let budget = LoadBudget {
            base: 8,
            target_frame_ms: 16.0,
        };
        assert_eq!(budget.per_tick(16.0), 8);
        assert_eq!(budget.per_tick(8.0), 8); // fast frames don't exceed base
    }

    #[test]
    fn test_budget_throttles_on_slow_frames() {
        let budget = LoadBudget {
            base: 8,
            target_frame_ms: 16.0,
        };
        assert_eq!(budget.per_tick(32.0), 4);
        // Ratio clamps at 0.25 no matter how slow.
        assert_eq!(budget.per_tick(1000.0), 2);
    }

    #[test]
    fn test_budget_never_zero() {
        let budget = LoadBudget {
            base: 1,
            target_frame_ms: 16.0,
        };
        assert_eq!(budget.per_tick(1000.0), 1);
    }
}
