//! Bounded retry with exponential backoff, jitter and per-attempt timeouts.

use crate::error::{SyncError, SyncResult};
use crate::metrics;
use rand::{Rng, thread_rng};
use std::future::Future;
use std::time::Duration;
use twinstore_core::config::SyncConfig;

/// Retry policy for a single store operation.
///
/// Each attempt runs under its own timeout; an attempt that times out counts
/// as a failed attempt. Permanent errors are returned at once without using
/// up the remaining attempts.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_fraction: f64,
    attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: base_delay,
            jitter_fraction: 0.0,
            attempt_timeout,
        }
    }

    /// Policy for in-line copies, built from the sync configuration.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.copy_attempts,
            config.retry_base_delay(),
            config.operation_timeout(),
        )
        .with_max_delay(config.retry_max_delay())
        .with_jitter(0.2)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay.max(self.base_delay);
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Backoff before attempt `attempt + 1`, for `attempt >= 1`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(31);
        let scaled = self.base_delay.as_millis().saturating_mul(1u128 << shift);
        let bounded = Duration::from_millis(scaled.min(u128::from(u64::MAX)) as u64)
            .min(self.max_delay);
        if bounded.is_zero() || self.jitter_fraction <= 0.0 {
            return bounded;
        }
        let factor = thread_rng().gen_range((1.0 - self.jitter_fraction)..=(1.0 + self.jitter_fraction));
        let jittered = (bounded.as_millis() as f64 * factor).round().max(0.0);
        Duration::from_millis(jittered as u64)
    }

    /// Run `f` until it succeeds, fails permanently, or runs out of attempts.
    pub async fn run<T, F, Fut>(&self, op: &'static str, mut f: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.attempt_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout {
                    op,
                    timeout: self.attempt_timeout,
                }),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_permanent() => return Err(err),
                Err(err) => err,
            };

            if attempt >= self.max_attempts {
                return Err(SyncError::RetriesExhausted {
                    op,
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.delay_for_attempt(attempt);
            tracing::warn!(
                op,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after transient failure"
            );
            metrics::RETRIES.with_label_values(&[op]).inc();
            tokio::time::sleep(delay).await;
        }
    }
}
