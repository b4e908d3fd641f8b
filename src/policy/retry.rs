//! Retry budget and backoff schedule for failed task verification.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Config;

/// How the delay between retry attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every attempt.
    Fixed,
    /// `base * attempt`.
    Linear,
    /// `base * 2^(attempt-1)`, capped.
    ExponentialCapped,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::ExponentialCapped
    }
}

/// Decides whether a failed task may run again and how long to wait first.
///
/// Only verification failures consume the budget; the supervisor's crash
/// recovery path never consults this policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    strategy: BackoffStrategy,
    base: Duration,
    cap: Duration,
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(strategy: BackoffStrategy, base: Duration, cap: Duration, max_retries: u32) -> Self {
        Self {
            strategy,
            base,
            cap,
            max_retries,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.backoff,
            config.backoff_base(),
            config.backoff_cap(),
            config.max_retries,
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether a task with this many spent retries gets another attempt.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before the given attempt re-enters the queue. `attempt` is the
    /// task's retry count after the failure, so the first retry passes 1.
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.strategy {
            BackoffStrategy::Fixed => self.base,
            BackoffStrategy::Linear => self.base.saturating_mul(attempt),
            BackoffStrategy::ExponentialCapped => {
                // Past 2^16 the cap has long since taken over.
                let factor = 1u32 << (attempt - 1).min(16);
                self.base.saturating_mul(factor)
            }
        };
        raw.min(self.cap)
    }
}
