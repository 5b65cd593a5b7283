//! Two-lane concurrency limiter for fetch operations
//!
//! An explicit scheduler object with an explicit admission function;
//! no counters captured in callbacks. Permits are RAII: dropping one
//! frees the slot and drains the ready queues.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

/// Priority lane for a fetch operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lane {
    High,
    Low,
}

/// Scheduler tuning.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Maximum concurrent operations across both lanes.
    pub max_concurrent: usize,
    /// Fraction of capacity reserved for the high lane, in (0, 1].
    pub high_share: f32,
    /// Round-robin period used when capacity is 1 (weighted by high_share).
    pub rr_period: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            high_share: 0.5,
            rr_period: 10,
        }
    }
}

struct Waiter {
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct LaneState {
    active_high: usize,
    active_low: usize,
    queue_high: VecDeque<Waiter>,
    queue_low: VecDeque<Waiter>,
    rr_phase: u32,
}

/// Concurrency-limited two-lane scheduler.
///
/// Admission when capacity is free: high admits immediately; low admits
/// immediately only while no high backlog exists, otherwise low is capped
/// at `floor(capacity * (1 - high_share))` with at least one slot always
/// reserved for high.
pub struct TwoLaneScheduler {
    capacity: usize,
    low_cap: usize,
    high_reserved: usize,
    rr_period: u32,
    rr_high_slots: u32,
    state: Mutex<LaneState>,
}

impl TwoLaneScheduler {
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        let capacity = config.max_concurrent.max(1);
        let high_share = config.high_share.clamp(f32::EPSILON, 1.0);
        let low_cap = ((capacity as f32) * (1.0 - high_share)).floor() as usize;
        // Reserve at least one slot for high.
        let low_cap = low_cap.min(capacity.saturating_sub(1));
        let rr_period = config.rr_period.max(1);
        let rr_high_slots = ((rr_period as f32) * high_share).round().clamp(1.0, rr_period as f32) as u32;

        Arc::new(Self {
            capacity,
            low_cap,
            high_reserved: capacity - low_cap,
            rr_period,
            rr_high_slots,
            state: Mutex::new(LaneState::default()),
        })
    }

    /// Acquire a slot in the given lane, waiting if the lane is
    /// saturated. Takes an owned handle, tokio-Semaphore style, so the
    /// permit can outlive the caller's borrow.
    pub async fn acquire(self: Arc<Self>, lane: Lane) -> Permit {
        let waiter = {
            let mut state = self.state.lock().unwrap();
            if self.admit_now(&state, lane) {
                match lane {
                    Lane::High => state.active_high += 1,
                    Lane::Low => state.active_low += 1,
                }
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let queue = match lane {
                    Lane::High => &mut state.queue_high,
                    Lane::Low => &mut state.queue_low,
                };
                queue.push_back(Waiter { tx });
                Some(rx)
            }
        };

        if let Some(rx) = waiter {
            // The drain side increments the active count before signalling,
            // so a successful recv means the slot is already ours.
            let _ = rx.await;
        }

        Permit {
            scheduler: self,
            lane,
        }
    }

    /// Non-blocking acquire; None when the lane cannot admit right now.
    pub fn try_acquire(self: Arc<Self>, lane: Lane) -> Option<Permit> {
        {
            let mut state = self.state.lock().unwrap();
            if !self.admit_now(&state, lane) {
                return None;
            }
            match lane {
                Lane::High => state.active_high += 1,
                Lane::Low => state.active_low += 1,
            }
        }
        Some(Permit {
            scheduler: self,
            lane,
        })
    }

    /// Submit-time admission rule (capacity must be free).
    fn admit_now(&self, state: &LaneState, lane: Lane) -> bool {
        let active = state.active_high + state.active_low;
        if active >= self.capacity {
            return false;
        }
        match lane {
            Lane::High => state.queue_high.is_empty(),
            Lane::Low => {
                if !state.queue_low.is_empty() {
                    return false; // keep FIFO within the lane
                }
                if state.queue_high.is_empty() {
                    true
                } else {
                    state.active_low < self.low_cap
                }
            }
        }
    }

    /// Drain-on-completion: pick which queued lane gets the freed slot.
    fn pick_lane(&self, state: &mut LaneState) -> Option<Lane> {
        let has_high = !state.queue_high.is_empty();
        let has_low = !state.queue_low.is_empty();
        if !has_high && !has_low {
            return None;
        }

        if self.capacity <= 1 {
            // Greedy rules starve one lane at concurrency 1; use a
            // deterministic round-robin weighted by high_share instead.
            let want_high = (state.rr_phase % self.rr_period) < self.rr_high_slots;
            state.rr_phase = state.rr_phase.wrapping_add(1);
            return Some(match (want_high, has_high, has_low) {
                (true, true, _) => Lane::High,
                (true, false, _) => Lane::Low,
                (false, _, true) => Lane::Low,
                (false, _, false) => Lane::High,
            });
        }

        if has_high && state.active_high < self.high_reserved {
            return Some(Lane::High);
        }
        if has_low && (!has_high || state.active_low < self.low_cap) {
            return Some(Lane::Low);
        }
        if has_high {
            Some(Lane::High)
        } else {
            Some(Lane::Low)
        }
    }

    fn release(&self, lane: Lane) {
        let mut state = self.state.lock().unwrap();
        match lane {
            Lane::High => state.active_high = state.active_high.saturating_sub(1),
            Lane::Low => state.active_low = state.active_low.saturating_sub(1),
        }
        self.drain(&mut state);
    }

    fn drain(&self, state: &mut LaneState) {
        while state.active_high + state.active_low < self.capacity {
            let Some(lane) = self.pick_lane(state) else {
                break;
            };
            let waiter = match lane {
                Lane::High => state.queue_high.pop_front(),
                Lane::Low => state.queue_low.pop_front(),
            };
            let Some(waiter) = waiter else { break };

            match lane {
                Lane::High => state.active_high += 1,
                Lane::Low => state.active_low += 1,
            }
            if waiter.tx.send(()).is_err() {
                // Receiver gave up; the slot is still accounted to it and
                // will be released by its Permit drop, which never runs.
                // Undo the count here instead.
                match lane {
                    Lane::High => state.active_high -= 1,
                    Lane::Low => state.active_low -= 1,
                }
            }
        }
    }

    /// (active_high, active_low, queued_high, queued_low)
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let state = self.state.lock().unwrap();
        (
            state.active_high,
            state.active_low,
            state.queue_high.len(),
            state.queue_low.len(),
        )
    }
}

/// RAII slot held for the duration of one fetch operation.
pub struct Permit {
    scheduler: Arc<TwoLaneScheduler>,
    lane: Lane,
}

impl Permit {
    pub fn lane(&self) -> Lane {
        self.lane
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.scheduler.release(self.lane);
    }
}
