//! Retry Policy
//!
//! Exponential backoff with jitter, shared by REST fetch retries and feed
//! reconnection.
//!
//! # Retryable Errors
//!
//! | Retryable | Rate limited | Non-retryable |
//! |-----------|--------------|---------------|
//! | Timeouts, transport errors | HTTP 429 | Other 4xx |
//! | HTTP 408, 5xx | | Rejected request, expired session |

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::application::ports::{ErrorCategory, FetchError};

/// Backoff curve parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

/// Stateful backoff calculator.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    max_attempts: u32,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a calculator; `max_attempts == 0` means unlimited.
    #[must_use]
    pub const fn new(config: BackoffConfig, max_attempts: u32) -> Self {
        Self {
            config,
            max_attempts,
            attempt: 0,
        }
    }

    /// Next delay, or `None` once the attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts > 0 && self.attempt >= self.max_attempts {
            return None;
        }
        let base = self.base_delay();
        self.attempt += 1;
        Some(self.apply_jitter(base))
    }

    /// Start over after a success.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delays handed out since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt
    }

    fn base_delay(&self) -> Duration {
        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let scaled =
            self.config.initial_delay.as_millis() as f64 * self.config.multiplier.powi(exponent);
        let max_millis = self.config.max_delay.as_millis() as f64;
        if scaled.is_finite() && scaled >= 0.0 {
            Duration::from_millis(scaled.min(max_millis).round() as u64)
        } else {
            self.config.max_delay
        }
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return delay;
        }
        let base_millis = delay.as_millis() as f64;
        let range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-range..=range);
        Duration::from_millis((base_millis + jitter).max(1.0) as u64)
    }
}

/// Retry wrapper for one outbound call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retry).
    pub max_attempts: u32,
    /// Delay curve between attempts.
    pub backoff: BackoffConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails permanently, or the attempts run out.
    ///
    /// Rate limited errors wait for the server's `Retry-After` when given,
    /// capped at the backoff ceiling.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut backoff = ExponentialBackoff::new(self.backoff, 0);
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let category = err.category();
            if category == ErrorCategory::NonRetryable || attempt >= self.max_attempts.max(1) {
                return Err(err);
            }

            let backoff_delay = backoff.next_delay().unwrap_or(self.backoff.max_delay);
            let delay = match (category, err.retry_after()) {
                (ErrorCategory::RateLimited, Some(after)) => after.min(self.backoff.max_delay),
                _ => backoff_delay,
            };
            tracing::debug!(
                attempt,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "Retrying request"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
