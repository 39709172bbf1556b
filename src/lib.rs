//! Floodgate - Admission Control and Retry
//!
//! This crate throttles access to a rate-limited downstream service and
//! recovers from its transient failures. Two admission strategies (a sliding
//! window over individual request timestamps, and a token bucket with burst
//! capacity plus a concurrency ceiling) share a common [`ratelimit::Limiter`]
//! contract, and a [`retry::RetryPolicy`] decides whether and how long to
//! wait before re-attempting a failed call.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod retry;

pub use clock::{Clock, TokioClock};
pub use error::{Classify, ErrorKind};
pub use ratelimit::{Limiter, RateLimitState};
pub use retry::RetryPolicy;
