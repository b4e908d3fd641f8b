//! Circuit breaker over one operation class.
//!
//! The run loop shares one breaker across every worker's verification
//! phase. Consecutive failures trip the breaker to `open`; while open,
//! calls are rejected without touching the underlying operation. After
//! the cooldown a single trial is admitted in `half_open`: success closes
//! the breaker, failure re-opens it and restarts the cooldown.
//!
//! Time is passed in by the caller so the state machine is testable
//! without sleeping.

use std::time::{Duration, Instant};

use crate::{mlog, mlog_warn};

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    /// Operation class this breaker guards, for log lines.
    name: &'static str,
    failure_threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    state: State,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name,
            failure_threshold: failure_threshold.max(1),
            cooldown,
            consecutive_failures: 0,
            state: State::Closed,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> BreakerState {
        match self.state {
            State::Closed => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen => BreakerState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Ask permission to run the operation. While open, permission is
    /// denied until the cooldown elapses; then exactly one trial call is
    /// admitted and the breaker sits in `half_open` until its outcome is
    /// recorded.
    pub fn allow_request(&mut self, now: Instant) -> bool {
        match self.state {
            State::Closed => true,
            State::Open { since } => {
                if now.duration_since(since) >= self.cooldown {
                    mlog!("Breaker '{}' half-open, admitting trial", self.name);
                    self.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
            // Trial already in flight.
            State::HalfOpen => false,
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            State::Closed => {
                self.consecutive_failures = 0;
            }
            State::HalfOpen => {
                mlog!("Breaker '{}' closed after successful trial", self.name);
                self.state = State::Closed;
                self.consecutive_failures = 0;
            }
            // No call was admitted while open; nothing to record.
            State::Open { .. } => {}
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            State::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    mlog_warn!(
                        "Breaker '{}' opened after {} consecutive failures",
                        self.name,
                        self.consecutive_failures
                    );
                    self.state = State::Open { since: now };
                }
            }
            State::HalfOpen => {
                mlog_warn!("Breaker '{}' re-opened after failed trial", self.name);
                self.consecutive_failures += 1;
                self.state = State::Open { since: now };
            }
            State::Open { .. } => {}
        }
    }
}
