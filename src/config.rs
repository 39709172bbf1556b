//! Configuration for limiters and the retry policy.
//!
//! Configuration is immutable after construction; the only runtime knob is
//! `Limiter::set_limit`, which re-derives capacity from a new
//! requests-per-minute figure. Malformed values (zero rates, multipliers not
//! above 1) are rejected at construction time, never at admission time.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ErrorKind, FloodgateError, Result};
use crate::ratelimit::sliding_window::SlidingWindowLimiter;
use crate::ratelimit::token_bucket::TokenBucketLimiter;
use crate::ratelimit::Limiter;

/// Top-level configuration: one limiter guarding one downstream resource,
/// plus the retry policy consulted on its failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Admission strategy for the protected resource
    pub limiter: LimiterConfig,

    /// Retry/backoff policy
    #[serde(default)]
    pub retry: RetryConfig,
}

impl GateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading gate configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse gate config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all nested sections.
    pub fn validate(&self) -> Result<()> {
        self.limiter.validate()?;
        self.retry.validate()
    }
}

/// Admission strategy selection.
///
/// Both strategies implement the same `Limiter` contract, so callers can be
/// switched between them through configuration alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum LimiterConfig {
    /// Rolling window over individual admission timestamps
    SlidingWindow(SlidingWindowConfig),
    /// Refilling token pool with burst capacity and a concurrency ceiling
    TokenBucket(TokenBucketConfig),
}

impl LimiterConfig {
    /// Validate the selected strategy's parameters.
    pub fn validate(&self) -> Result<()> {
        match self {
            LimiterConfig::SlidingWindow(c) => c.validate(),
            LimiterConfig::TokenBucket(c) => c.validate(),
        }
    }

    /// Construct the configured limiter.
    pub fn build(&self) -> Result<Box<dyn Limiter>> {
        match self {
            LimiterConfig::SlidingWindow(c) => {
                Ok(Box::new(SlidingWindowLimiter::new(c.clone())?))
            }
            LimiterConfig::TokenBucket(c) => Ok(Box::new(TokenBucketLimiter::new(c.clone())?)),
        }
    }
}

/// Configuration for the sliding-window limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlidingWindowConfig {
    /// Sustained request rate
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Width of the rolling window in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            window_ms: default_window_ms(),
        }
    }
}

impl SlidingWindowConfig {
    /// Reject zero rates and zero-width windows.
    pub fn validate(&self) -> Result<()> {
        if self.requests_per_minute == 0 {
            return Err(FloodgateError::Config(
                "requests_per_minute must be greater than zero".to_string(),
            ));
        }
        if self.window_ms == 0 {
            return Err(FloodgateError::Config(
                "window_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the token-bucket limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Sustained request rate, which determines the token refill rate
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Ceiling on calls in flight at once, independent of the token pool
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,

    /// Maximum tokens the bucket can hold, bounding immediate admissions
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            max_concurrent: default_max_concurrent(),
            burst_size: default_burst_size(),
        }
    }
}

impl TokenBucketConfig {
    /// Reject zero rates, ceilings, and burst sizes.
    pub fn validate(&self) -> Result<()> {
        if self.requests_per_minute == 0 {
            return Err(FloodgateError::Config(
                "requests_per_minute must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(FloodgateError::Config(
                "max_concurrent must be greater than zero".to_string(),
            ));
        }
        if self.burst_size == 0 {
            return Err(FloodgateError::Config(
                "burst_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of re-attempts after the initial call
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Cap on the computed delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Exponential growth factor applied per attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Randomize delays into `[delay/2, delay)` to avoid retry storms
    #[serde(default = "default_jitter")]
    pub jitter: bool,

    /// Error kinds considered transient and therefore retryable
    #[serde(default = "default_retryable_kinds")]
    pub retryable_kinds: HashSet<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            retryable_kinds: default_retryable_kinds(),
        }
    }
}

impl RetryConfig {
    /// Reject zero delays and multipliers at or below 1.
    ///
    /// `max_attempts == 0` is allowed: it disables retries entirely.
    pub fn validate(&self) -> Result<()> {
        if self.initial_delay_ms == 0 {
            return Err(FloodgateError::Config(
                "initial_delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_delay_ms == 0 {
            return Err(FloodgateError::Config(
                "max_delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.backoff_multiplier <= 1.0 {
            return Err(FloodgateError::Config(
                "backoff_multiplier must be greater than 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_concurrent() -> u32 {
    10
}

fn default_burst_size() -> u32 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

fn default_retryable_kinds() -> HashSet<ErrorKind> {
    [
        ErrorKind::RateLimit,
        ErrorKind::Network,
        ErrorKind::Timeout,
        ErrorKind::ServiceUnavailable,
    ]
    .into_iter()
    .collect()
}
