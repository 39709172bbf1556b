//! Retry policy with exponential backoff and jitter.
//!
//! [`RetryPolicy`] is a pure decision function over (error kind, attempt
//! index): it never performs the call, never sleeps, and holds no per-call
//! state. [`execute`] is the caller loop that ties a policy to a limiter:
//! acquire admission, perform the call, release, and consult the policy on
//! failure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::clock::Clock;
use crate::config::RetryConfig;
use crate::error::{Classify, ErrorKind, Result};
use crate::ratelimit::Limiter;

/// Callback invoked when the policy decides to retry, with the error kind,
/// the attempt index, and the computed delay.
pub type RetryObserver = Arc<dyn Fn(ErrorKind, u32, Duration) + Send + Sync>;

/// Decides whether a failed call should be re-attempted and how long to
/// back off first. Immutable after construction.
pub struct RetryPolicy {
    config: RetryConfig,
    on_retry: Option<RetryObserver>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Create a policy from validated configuration.
    pub fn new(config: RetryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            on_retry: None,
        })
    }

    /// Attach an observer invoked on every positive retry decision, so the
    /// caller can log or trace the decision as a side effect of the query.
    ///
    /// With jitter enabled, every [`delay`](Self::delay) call draws a fresh
    /// sample, so the observed figure is a sample of the backoff
    /// distribution rather than the exact duration the caller ends up
    /// sleeping. With jitter disabled the two always agree.
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(ErrorKind, u32, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    /// Configured attempt ceiling, for callers that bound their own loop.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether a failure of `kind` on attempt `attempt` (zero-based) should
    /// be retried.
    ///
    /// Non-transient kinds fail fast regardless of remaining attempts.
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> bool {
        if attempt >= self.config.max_attempts {
            debug!(%kind, attempt, "Attempts exhausted");
            return false;
        }
        if !self.config.retryable_kinds.contains(&kind) {
            debug!(%kind, attempt, "Non-transient error, failing fast");
            return false;
        }

        let delay = self.delay(attempt);
        if let Some(ref observer) = self.on_retry {
            observer(kind, attempt, delay);
        }
        debug!(
            %kind,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Transient error, will retry"
        );
        true
    }

    /// Backoff delay for the given attempt index:
    /// `min(initial * multiplier^attempt, max)`, scaled by a uniform factor
    /// in `[0.5, 1.0)` when jitter is enabled.
    ///
    /// With jitter disabled the delay is a pure function of `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base =
            self.config.initial_delay_ms as f64 * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.config.max_delay_ms as f64);
        let millis = if self.config.jitter {
            let factor: f64 = rand::thread_rng().gen_range(0.5..1.0);
            (capped * factor).floor() as u64
        } else {
            capped.floor() as u64
        };
        Duration::from_millis(millis)
    }
}

/// Perform a gated downstream call with retries: the reference caller loop.
///
/// Every attempt re-acquires admission and releases it when the call
/// completes, so backoff sleeps never hold a slot. A non-transient error
/// surfaces immediately; exhausting the policy surfaces the last underlying
/// error unchanged.
pub async fn execute<T, E, F, Fut>(
    limiter: &dyn Limiter,
    policy: &RetryPolicy,
    clock: &dyn Clock,
    mut operation: F,
) -> std::result::Result<T, E>
where
    E: Classify,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        limiter.acquire().await;
        let result = operation().await;
        limiter.release();

        match result {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !policy.should_retry(error.error_kind(), attempt) {
                    return Err(error);
                }
                clock.sleep(policy.delay(attempt)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::config::TokenBucketConfig;
    use crate::ratelimit::TokenBucketLimiter;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        kind: ErrorKind,
        message: String,
    }

    impl TestError {
        fn new(kind: ErrorKind, message: &str) -> Self {
            Self {
                kind,
                message: message.to_string(),
            }
        }
    }

    impl Classify for TestError {
        fn error_kind(&self) -> ErrorKind {
            self.kind
        }
    }

    fn policy(config: RetryConfig) -> RetryPolicy {
        RetryPolicy::new(config).unwrap()
    }

    fn no_jitter(max_attempts: u32) -> RetryPolicy {
        policy(RetryConfig {
            max_attempts,
            initial_delay_ms: 1_000,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: false,
            ..RetryConfig::default()
        })
    }

    fn wide_open_limiter() -> TokenBucketLimiter {
        TokenBucketLimiter::new(TokenBucketConfig {
            requests_per_minute: 60_000,
            max_concurrent: 100,
            burst_size: 100,
        })
        .unwrap()
    }

    #[test]
    fn delay_without_jitter_is_deterministic() {
        let policy = no_jitter(3);
        assert_eq!(policy.delay(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay(2), Duration::from_millis(4_000));
        // Capped at max_delay_ms well before attempt 10.
        assert_eq!(policy.delay(10), Duration::from_millis(5_000));
    }

    #[test]
    fn delay_with_jitter_stays_in_range() {
        let policy = policy(RetryConfig {
            initial_delay_ms: 1_000,
            jitter: true,
            ..RetryConfig::default()
        });
        for _ in 0..100 {
            let delay = policy.delay(0);
            assert!(
                delay >= Duration::from_millis(500) && delay <= Duration::from_millis(1_000),
                "jittered delay {:?} out of range",
                delay
            );
        }
    }

    #[test]
    fn attempt_ceiling_wins_over_kind() {
        let policy = no_jitter(3);
        assert!(policy.should_retry(ErrorKind::Timeout, 0));
        assert!(policy.should_retry(ErrorKind::Timeout, 2));
        assert!(!policy.should_retry(ErrorKind::Timeout, 3));
        assert!(!policy.should_retry(ErrorKind::Timeout, 10));
    }

    #[test]
    fn non_transient_kinds_fail_fast() {
        let policy = no_jitter(3);
        assert!(!policy.should_retry(ErrorKind::Authentication, 0));
        assert!(!policy.should_retry(ErrorKind::InvalidRequest, 0));
        assert!(!policy.should_retry(ErrorKind::NotFound, 0));
        assert!(!policy.should_retry(ErrorKind::Unknown, 0));
    }

    #[test]
    fn configured_kinds_override_defaults() {
        let policy = policy(RetryConfig {
            jitter: false,
            retryable_kinds: [ErrorKind::NotFound].into_iter().collect(),
            ..RetryConfig::default()
        });
        assert!(policy.should_retry(ErrorKind::NotFound, 0));
        assert!(!policy.should_retry(ErrorKind::Timeout, 0));
    }

    #[test]
    fn observer_sees_positive_decisions_only() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observed = Arc::clone(&seen);
        let policy = no_jitter(3).with_observer(move |kind, attempt, delay| {
            observed.lock().push((kind, attempt, delay));
        });

        assert!(policy.should_retry(ErrorKind::Network, 1));
        assert!(!policy.should_retry(ErrorKind::Authentication, 0));
        assert!(!policy.should_retry(ErrorKind::Network, 3));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, ErrorKind::Network);
        assert_eq!(seen[0].1, 1);
        assert_eq!(seen[0].2, Duration::from_millis(2_000));
    }

    #[test]
    fn invalid_config_rejected() {
        let result = RetryPolicy::new(RetryConfig {
            backoff_multiplier: 0.5,
            ..RetryConfig::default()
        });
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn execute_recovers_from_transient_failures() {
        let limiter = wide_open_limiter();
        let policy = no_jitter(3);
        let calls = Arc::new(AtomicU32::new(0));

        let result: std::result::Result<&str, TestError> = execute(&limiter, &policy, &TokioClock, || {
            let calls = Arc::clone(&calls);
            async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(TestError::new(ErrorKind::Timeout, "slow")),
                    _ => Ok("done"),
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.state().active_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_fails_fast_on_non_transient_error() {
        let limiter = wide_open_limiter();
        let policy = no_jitter(3);
        let calls = Arc::new(AtomicU32::new(0));

        let result: std::result::Result<(), TestError> = execute(&limiter, &policy, &TokioClock, || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::new(ErrorKind::Authentication, "bad key"))
            }
        })
        .await;

        let error = result.unwrap_err();
        assert_eq!(error.error_kind(), ErrorKind::Authentication);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_surfaces_last_error_on_exhaustion() {
        let limiter = wide_open_limiter();
        let policy = no_jitter(2);
        let calls = Arc::new(AtomicU32::new(0));

        let result: std::result::Result<(), TestError> = execute(&limiter, &policy, &TokioClock, || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::new(
                    ErrorKind::ServiceUnavailable,
                    &format!("outage {}", n),
                ))
            }
        })
        .await;

        let error = result.unwrap_err();
        // Initial call plus two retries; the last failure comes back as-is.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(error.message, "outage 2");
        assert_eq!(limiter.state().active_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_backs_off_between_attempts() {
        let limiter = wide_open_limiter();
        let policy = no_jitter(3);
        let calls = Arc::new(AtomicU32::new(0));

        let start = tokio::time::Instant::now();
        let result: std::result::Result<(), TestError> = execute(&limiter, &policy, &TokioClock, || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::new(ErrorKind::Network, "down"))
            }
        })
        .await;

        assert!(result.is_err());
        // Backoff sleeps of 1s, 2s, and 4s between the four attempts.
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn observer_matches_slept_delays_without_jitter() {
        let limiter = wide_open_limiter();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observed = Arc::clone(&seen);
        let policy = no_jitter(3).with_observer(move |_, _, delay| {
            observed.lock().push(delay);
        });

        let start = tokio::time::Instant::now();
        let result: std::result::Result<(), TestError> = execute(&limiter, &policy, &TokioClock, || async {
            Err(TestError::new(ErrorKind::Timeout, "slow"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(
            *seen.lock(),
            vec![
                Duration::from_millis(1_000),
                Duration::from_millis(2_000),
                Duration::from_millis(4_000),
            ]
        );
        // Without jitter the observed figures are exactly what was slept.
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }
}
