//! Backpressure on new task claims, driven by the recent failure rate.
//!
//! A rolling window of task attempt outcomes maps to a zone: green means
//! claims proceed normally, yellow stretches the claim poll interval so
//! effective concurrency drops, red rejects new claims until enough
//! successes wash the failures out of the window. The window needs a
//! minimum number of samples before leaving green, so a single early
//! failure cannot stall a fresh run.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

/// Failure rate at or above which the zone turns yellow.
pub const YELLOW_THRESHOLD: f64 = 0.50;
/// Failure rate at or above which the zone turns red.
pub const RED_THRESHOLD: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureZone {
    Green,
    Yellow,
    Red,
}

impl PressureZone {
    pub fn as_str(&self) -> &'static str {
        match self {
            PressureZone::Green => "green",
            PressureZone::Yellow => "yellow",
            PressureZone::Red => "red",
        }
    }
}

#[derive(Debug)]
pub struct BackpressureController {
    window_size: usize,
    min_samples: usize,
    /// true = success, oldest at the front.
    outcomes: VecDeque<bool>,
    failures: usize,
}

impl BackpressureController {
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window_size,
            min_samples: (window_size / 10).max(1),
            outcomes: VecDeque::with_capacity(window_size),
            failures: 0,
        }
    }

    /// Record one task attempt outcome, evicting the oldest once the
    /// window is full.
    pub fn record(&mut self, success: bool) {
        if self.outcomes.len() == self.window_size {
            if let Some(evicted) = self.outcomes.pop_front() {
                if !evicted {
                    self.failures -= 1;
                }
            }
        }
        self.outcomes.push_back(success);
        if !success {
            self.failures += 1;
        }
    }

    /// Failures over the current window contents, 0.0 when empty.
    pub fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.failures as f64 / self.outcomes.len() as f64
    }

    pub fn zone(&self) -> PressureZone {
        if self.outcomes.len() < self.min_samples {
            return PressureZone::Green;
        }
        let rate = self.failure_rate();
        if rate >= RED_THRESHOLD {
            PressureZone::Red
        } else if rate >= YELLOW_THRESHOLD {
            PressureZone::Yellow
        } else {
            PressureZone::Green
        }
    }

    /// Whether a worker may attempt a new claim right now.
    pub fn allows_claims(&self) -> bool {
        self.zone() != PressureZone::Red
    }

    /// Poll interval adjusted for the current zone. Yellow doubles the
    /// base interval; red quadruples it so workers back off while the
    /// window recovers.
    pub fn claim_delay(&self, base: Duration) -> Duration {
        match self.zone() {
            PressureZone::Green => base,
            PressureZone::Yellow => base.saturating_mul(2),
            PressureZone::Red => base.saturating_mul(4),
        }
    }

    pub fn samples(&self) -> usize {
        self.outcomes.len()
    }
}
