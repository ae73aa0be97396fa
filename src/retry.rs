//! Retry utilities with exponential backoff, cap, and jitter.
//!
//! The kernel never auto-retries RPCs; callers opt in with the `retry`
//! wrapper, and the saga coordinator drives its per-step retries from a
//! `RetryConfig`.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay for first retry (before jitter).
    pub base_delay: Duration,
    /// Maximum delay cap (before jitter).
    pub max_delay: Duration,
    /// Maximum number of retry attempts (0 = no retries, just initial attempt).
    pub max_retries: u32,
    /// Jitter factor: delay is multiplied by random value in [1-jitter, 1+jitter].
    /// Set to 0.0 for no jitter.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            max_retries: 3,
            jitter: 0.25, // ±25% jitter
        }
    }
}

impl RetryConfig {
    /// Retry config for saga compensations: a small bounded budget.
    pub fn for_compensation() -> Self {
        Self {
            max_retries: 2,
            ..Self::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    ///
    /// Uses exponential backoff: delay = base * 2^attempt, capped at max_delay.
    /// Jitter is applied using a simple hash-based approach to avoid thundering herd.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exponential_ms = base_ms.saturating_mul(1u64 << attempt.min(20));

        let capped_ms = exponential_ms.min(self.max_delay.as_millis() as u64);

        // Deterministic jitter from time and attempt; no RNG dependency.
        let jittered_ms = if self.jitter > 0.0 {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0) as u64;
            let hash = now.wrapping_mul(31).wrapping_add(attempt as u64 * 17);
            let jitter_pct = ((hash % 1000) as f64 / 1000.0) * 2.0 - 1.0; // -1.0 to 1.0
            let jitter_factor = 1.0 + (jitter_pct * self.jitter);
            (capped_ms as f64 * jitter_factor) as u64
        } else {
            capped_ms
        };

        Duration::from_millis(jittered_ms)
    }

    /// Check if another retry attempt should be made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Run an operation with retries under the given config.
///
/// Retries on every error; wrap the operation if only some errors are
/// transient. This is the caller-side wrapper for RPCs the kernel itself
/// never retries.
pub async fn retry<T, E, F, Fut>(config: &RetryConfig, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    op.retry(
        ExponentialBuilder::default()
            .with_min_delay(config.base_delay)
            .with_max_delay(config.max_delay)
            .with_max_times(config.max_retries as usize),
    )
    .await
}
