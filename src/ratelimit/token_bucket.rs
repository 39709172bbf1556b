//! Token-bucket rate limiter with burst capacity and a concurrency ceiling.
//!
//! Tokens represent *rate* and refill continuously up to the burst capacity;
//! the active-count ceiling caps how many calls may be in flight at once.
//! These are independent constraints: `release` frees a concurrency slot but
//! never returns a token.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::clock::{Clock, TokioClock};
use crate::config::TokenBucketConfig;
use crate::error::Result;

use super::{Limiter, Occupancy, RateLimitState, WakeState};

/// Rate limiter consuming one token per admission, refilled at
/// `requests_per_minute / 60` tokens per second up to `burst_size`.
///
/// Thread-safe; one instance guards one downstream resource.
pub struct TokenBucketLimiter {
    shared: Arc<Shared>,
}

struct Shared {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

struct Inner {
    tokens: f64,
    last_refill: Instant,
    refill_per_sec: f64,
    burst: u32,
    max_concurrent: u32,
    /// Calls admitted and not yet released.
    active: u64,
    requests_per_minute: u32,
    /// Queued callers, FIFO.
    waiters: VecDeque<oneshot::Sender<()>>,
    wake: WakeState,
}

impl Inner {
    /// Lazily accrue tokens for the time elapsed since the last refill.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.burst as f64);
        self.last_refill = now;
    }

    fn can_admit(&self) -> bool {
        self.tokens >= 1.0 && self.active < self.max_concurrent as u64
    }

    /// Time until a whole token is available. Zero if one already is.
    fn time_to_next_token(&self) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
        }
    }

    /// Grant queued waiters in FIFO order while both constraints allow.
    fn drain(&mut self) {
        while !self.waiters.is_empty() && self.can_admit() {
            if let Some(waiter) = self.waiters.pop_front() {
                // A closed receiver means the caller stopped waiting; skip
                // it without consuming a token or a slot.
                if waiter.send(()).is_ok() {
                    self.tokens -= 1.0;
                    self.active += 1;
                    trace!(
                        tokens = self.tokens,
                        active = self.active,
                        "Released queued caller"
                    );
                }
            }
        }
    }
}

impl TokenBucketLimiter {
    /// Create a limiter using the tokio runtime clock. The bucket starts
    /// full, so up to `burst_size` admissions succeed immediately.
    pub fn new(config: TokenBucketConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(TokioClock))
    }

    /// Create a limiter with an explicit time source.
    pub fn with_clock(config: TokenBucketConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let now = clock.now();

        debug!(
            requests_per_minute = config.requests_per_minute,
            max_concurrent = config.max_concurrent,
            burst_size = config.burst_size,
            "Creating token bucket limiter"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                clock,
                inner: Mutex::new(Inner {
                    tokens: config.burst_size as f64,
                    last_refill: now,
                    refill_per_sec: config.requests_per_minute as f64 / 60.0,
                    burst: config.burst_size,
                    max_concurrent: config.max_concurrent,
                    active: 0,
                    requests_per_minute: config.requests_per_minute,
                    waiters: VecDeque::new(),
                    wake: WakeState::Idle,
                }),
            }),
        })
    }

    /// Schedule the refill timer if the queue is blocked on tokens and no
    /// timer is pending. Called with the lock held.
    ///
    /// When the concurrency ceiling is the binding constraint instead, no
    /// timer can predict capacity; `release` continues the drain.
    fn wake_when_blocked(&self, inner: &mut Inner) {
        if !inner.waiters.is_empty() && inner.wake == WakeState::Idle && inner.tokens < 1.0 {
            inner.wake = WakeState::Waiting;
            self.spawn_drain();
        }
    }

    /// Spawn the timer-driven drain task. Called with the lock held and
    /// `wake` already moved to `Waiting`, so at most one task runs at a time.
    fn spawn_drain(&self) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                let sleep_for = {
                    let mut inner = shared.inner.lock();
                    inner.refill(shared.clock.now());
                    inner.time_to_next_token()
                };
                shared.clock.sleep(sleep_for).await;

                let mut inner = shared.inner.lock();
                inner.wake = WakeState::Draining;
                inner.refill(shared.clock.now());
                inner.drain();

                if inner.waiters.is_empty() || inner.tokens >= 1.0 {
                    // Queue empty, or blocked only on the concurrency
                    // ceiling; the next release continues the drain.
                    inner.wake = WakeState::Idle;
                    return;
                }
                inner.wake = WakeState::Waiting;
            }
        });
    }
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    async fn acquire(&self) {
        let queued = {
            let mut inner = self.shared.inner.lock();
            inner.refill(self.shared.clock.now());

            // FIFO: never admit past queued waiters.
            if inner.waiters.is_empty() && inner.can_admit() {
                inner.tokens -= 1.0;
                inner.active += 1;
                trace!(
                    tokens = inner.tokens,
                    active = inner.active,
                    "Admission granted"
                );
                None
            } else {
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(tx);
                debug!(queued = inner.waiters.len(), "Bucket empty, queueing caller");
                self.wake_when_blocked(&mut inner);
                Some(rx)
            }
        };

        if let Some(rx) = queued {
            // The drain pass consumes the token and increments the active
            // count before signalling, so admission is complete once this
            // resolves.
            let _ = rx.await;
        }
    }

    fn release(&self) {
        let mut inner = self.shared.inner.lock();
        inner.active = inner.active.saturating_sub(1);
        trace!(active = inner.active, "Admission released");

        // Freeing a concurrency slot may unblock the queue; tokens are not
        // returned.
        inner.refill(self.shared.clock.now());
        inner.drain();
        self.wake_when_blocked(&mut inner);
    }

    fn state(&self) -> RateLimitState {
        let mut inner = self.shared.inner.lock();
        inner.refill(self.shared.clock.now());
        let window_reset_in = if inner.tokens >= inner.burst as f64 {
            Duration::ZERO
        } else {
            let next_whole = inner.tokens.floor() + 1.0;
            Duration::from_secs_f64((next_whole - inner.tokens) / inner.refill_per_sec)
        };
        RateLimitState {
            active_requests: inner.active,
            max_concurrent: inner.max_concurrent as u64,
            requests_per_minute: inner.requests_per_minute,
            window_reset_in,
            occupancy: Occupancy::Bucket {
                tokens_available: inner.tokens.floor() as u64,
            },
        }
    }

    fn set_limit(&self, requests_per_minute: u32) {
        let mut inner = self.shared.inner.lock();
        // Accrue at the old rate up to now before switching.
        inner.refill(self.shared.clock.now());
        inner.requests_per_minute = requests_per_minute.max(1);
        inner.refill_per_sec = inner.requests_per_minute as f64 / 60.0;
        debug!(
            requests_per_minute = inner.requests_per_minute,
            "Updated token bucket refill rate"
        );
    }
}
