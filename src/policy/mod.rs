//! Failure-handling policies consulted by the orchestrator.
//!
//! Three small, orthogonal policy objects instead of inlined conditionals:
//! [`RetryPolicy`] decides whether a failed task gets another attempt and
//! how long to wait, [`CircuitBreaker`] stops hammering an operation class
//! that keeps failing, and [`BackpressureController`] throttles new claims
//! when the recent failure rate climbs. Each is independently testable and
//! holds no reference to engine state.

pub mod backpressure;
pub mod breaker;
pub mod retry;

pub use backpressure::{BackpressureController, PressureZone};
pub use breaker::{BreakerState, CircuitBreaker};
pub use retry::{BackoffStrategy, RetryPolicy};
