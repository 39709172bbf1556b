//! Sliding-window rate limiter.
//!
//! Tracks the timestamp of every admission in a trailing window and admits a
//! caller only while fewer than the derived maximum fall inside it. Unlike
//! fixed-window bucketing, individual event times are counted, so bursts
//! cannot double up across a window boundary.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::clock::{Clock, TokioClock};
use crate::config::SlidingWindowConfig;
use crate::error::Result;

use super::{Limiter, Occupancy, RateLimitState, WakeState};

/// Rate limiter admitting at most `ceil(requests_per_minute / 60000 *
/// window_ms)` calls per trailing window.
///
/// Thread-safe; one instance guards one downstream resource.
pub struct SlidingWindowLimiter {
    shared: Arc<Shared>,
}

struct Shared {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

struct Inner {
    /// Admission timestamps, oldest first. Entries persist for the full
    /// window duration regardless of when the call completes.
    timestamps: VecDeque<Instant>,
    /// Queued callers, FIFO.
    waiters: VecDeque<oneshot::Sender<()>>,
    /// Calls admitted and not yet released.
    active: u64,
    window: Duration,
    requests_per_minute: u32,
    max_requests: u64,
    wake: WakeState,
}

impl Inner {
    /// Drop timestamps older than `now - window`. Idempotent.
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn has_capacity(&self) -> bool {
        (self.timestamps.len() as u64) < self.max_requests
    }

    fn reset_in(&self, now: Instant) -> Duration {
        match self.timestamps.front() {
            Some(&oldest) => (oldest + self.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }
}

/// Window capacity derived from the sustained rate.
fn derive_max_requests(requests_per_minute: u32, window: Duration) -> u64 {
    let window_ms = window.as_millis() as u64;
    (requests_per_minute as u64)
        .saturating_mul(window_ms)
        .div_ceil(60_000)
        .max(1)
}

impl SlidingWindowLimiter {
    /// Create a limiter using the tokio runtime clock.
    pub fn new(config: SlidingWindowConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(TokioClock))
    }

    /// Create a limiter with an explicit time source.
    pub fn with_clock(config: SlidingWindowConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let window = Duration::from_millis(config.window_ms);
        let max_requests = derive_max_requests(config.requests_per_minute, window);

        debug!(
            requests_per_minute = config.requests_per_minute,
            window_ms = config.window_ms,
            max_requests = max_requests,
            "Creating sliding window limiter"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                clock,
                inner: Mutex::new(Inner {
                    timestamps: VecDeque::new(),
                    waiters: VecDeque::new(),
                    active: 0,
                    window,
                    requests_per_minute: config.requests_per_minute,
                    max_requests,
                    wake: WakeState::Idle,
                }),
            }),
        })
    }

    /// Spawn the timer-driven drain task. Called with the lock held and
    /// `wake` already moved to `Waiting`, so at most one task runs at a time.
    fn spawn_drain(&self) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                let sleep_for = {
                    let inner = shared.inner.lock();
                    inner.reset_in(shared.clock.now())
                };
                shared.clock.sleep(sleep_for).await;

                let mut inner = shared.inner.lock();
                inner.wake = WakeState::Draining;
                let now = shared.clock.now();
                inner.prune(now);

                while inner.has_capacity() {
                    match inner.waiters.pop_front() {
                        Some(waiter) => {
                            // A closed receiver means the caller stopped
                            // waiting; skip it without consuming a slot.
                            if waiter.send(()).is_ok() {
                                inner.timestamps.push_back(now);
                                inner.active += 1;
                                trace!(
                                    in_window = inner.timestamps.len(),
                                    active = inner.active,
                                    "Released queued caller"
                                );
                            }
                        }
                        None => break,
                    }
                }

                if inner.waiters.is_empty() {
                    inner.wake = WakeState::Idle;
                    return;
                }
                // Capacity exhausted again; wait for the next expiry.
                inner.wake = WakeState::Waiting;
            }
        });
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    async fn acquire(&self) {
        let queued = {
            let mut inner = self.shared.inner.lock();
            let now = self.shared.clock.now();
            inner.prune(now);

            // FIFO: never admit past queued waiters.
            if inner.waiters.is_empty() && inner.has_capacity() {
                inner.timestamps.push_back(now);
                inner.active += 1;
                trace!(
                    in_window = inner.timestamps.len(),
                    active = inner.active,
                    "Admission granted"
                );
                None
            } else {
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(tx);
                debug!(queued = inner.waiters.len(), "Window full, queueing caller");
                if inner.wake == WakeState::Idle {
                    inner.wake = WakeState::Waiting;
                    self.spawn_drain();
                }
                Some(rx)
            }
        };

        if let Some(rx) = queued {
            // The drain task records the timestamp and active count before
            // signalling, so admission is complete once this resolves.
            let _ = rx.await;
        }
    }

    fn release(&self) {
        let mut inner = self.shared.inner.lock();
        inner.active = inner.active.saturating_sub(1);
        trace!(active = inner.active, "Admission released");
    }

    fn state(&self) -> RateLimitState {
        let mut inner = self.shared.inner.lock();
        let now = self.shared.clock.now();
        inner.prune(now);
        RateLimitState {
            active_requests: inner.active,
            max_concurrent: inner.max_requests,
            requests_per_minute: inner.requests_per_minute,
            window_reset_in: inner.reset_in(now),
            occupancy: Occupancy::Window {
                requests_in_window: inner.timestamps.len() as u64,
            },
        }
    }

    fn set_limit(&self, requests_per_minute: u32) {
        let mut inner = self.shared.inner.lock();
        inner.requests_per_minute = requests_per_minute.max(1);
        inner.max_requests = derive_max_requests(inner.requests_per_minute, inner.window);
        debug!(
            requests_per_minute = inner.requests_per_minute,
            max_requests = inner.max_requests,
            "Updated sliding window limit"
        );
    }
}
