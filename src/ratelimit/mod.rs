//! Admission control strategies and shared limiter state.
//!
//! Both strategies serialize all mutable state behind a single mutex per
//! limiter instance and release queued waiters strictly in FIFO order from a
//! timer-driven drain pass. `acquire` is the only suspending operation and
//! it never fails; a caller that stops waiting simply drops the future.

pub mod sliding_window;
pub mod token_bucket;

pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

/// Common contract shared by the rate-limiting strategies.
///
/// Callers depend only on this trait, so the strategy can be swapped through
/// configuration without touching caller or retry code.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Suspend until admission is granted. Never fails.
    async fn acquire(&self);

    /// Signal that an admitted call has completed (successfully or not).
    ///
    /// Clamps at zero if called without a matching `acquire`.
    fn release(&self);

    /// A fresh read-only snapshot of the limiter's occupancy.
    fn state(&self) -> RateLimitState;

    /// Re-derive capacity from a new sustained rate.
    ///
    /// Takes effect on the next admission decision; queued waiters are not
    /// re-evaluated until the next drain pass.
    fn set_limit(&self, requests_per_minute: u32);
}

/// Read-only snapshot of a limiter, returned by [`Limiter::state`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitState {
    /// Calls currently admitted and not yet released
    pub active_requests: u64,
    /// Concurrency ceiling (for the sliding window, the window capacity)
    pub max_concurrent: u64,
    /// Configured sustained rate
    pub requests_per_minute: u32,
    /// Time until the oldest tracked unit expires (window entry or next token)
    pub window_reset_in: Duration,
    /// Strategy-specific occupancy
    pub occupancy: Occupancy,
}

/// Strategy-specific occupancy figure in a [`RateLimitState`] snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Occupancy {
    /// Sliding window: admissions still inside the trailing window
    Window {
        /// Number of timestamps currently tracked
        requests_in_window: u64,
    },
    /// Token bucket: whole tokens available for immediate admission
    Bucket {
        /// Tokens available, floored
        tokens_available: u64,
    },
}

/// Reactivation state for a limiter's waiter queue.
///
/// Transitions: `Idle -> Waiting` when the first waiter is queued and a
/// drain timer is scheduled; `Waiting -> Draining` when the timer fires;
/// `Draining -> Waiting` if waiters remain and another timer is scheduled,
/// or `Draining -> Idle` once the queue is empty (or, for the token bucket,
/// once only the concurrency ceiling blocks progress and the next `release`
/// will continue the drain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeState {
    Idle,
    Waiting,
    Draining,
}
