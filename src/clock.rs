//! Time abstraction used by the limiters.
//!
//! All time reads and sleeps go through [`Clock`] so that timing behavior is
//! testable. The default [`TokioClock`] delegates to `tokio::time`, which
//! means tests can run under a paused runtime and advance time
//! deterministically.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Monotonic time source and timer.
///
/// This is the only time dependency of the crate.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current monotonic time.
    fn now(&self) -> Instant;

    /// Suspend the current task for at least `duration`.
    async fn sleep(&self, duration: Duration);
}

/// [`Clock`] backed by the tokio runtime timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
