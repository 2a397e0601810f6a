// Retry strategies with exponential backoff and jitter
//
// Used both for re-running whole job store operations while the document
// store is unreachable and for pacing lock claim attempts.

use crate::config::RetryConfig;
use crate::errors::JobStoreError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Default number of retries for store operations
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Delay before retry number `attempt` (0-based); `None` once retries are exhausted
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    fn max_retries(&self) -> u32;

    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries()
    }
}

/// Exponential backoff with jitter
/// Sequence: base, 2*base, 4*base, ... capped at `max_delay_ms`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay_ms: u64,
    max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    jitter_factor: f64,
    max_retries: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 50,
            max_delay_ms: 5_000,
            jitter_factor: 0.2,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(
        base_delay_ms: u64,
        max_delay_ms: u64,
        jitter_factor: f64,
        max_retries: u32,
    ) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            max_retries,
        }
    }

    /// Backoff without a retry budget; the caller bounds it by time instead
    pub fn unbounded(base_delay_ms: u64, max_delay_ms: u64, jitter_factor: f64) -> Self {
        Self::with_config(base_delay_ms, max_delay_ms, jitter_factor, u32::MAX)
    }

    fn calculate_base_delay(&self, attempt: u32) -> u64 {
        let factor = 2_u64.checked_pow(attempt).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    fn add_jitter_ms(&self, base_delay_ms: u64) -> u64 {
        let jitter_range_ms = (base_delay_ms as f64 * self.jitter_factor) as u64;
        if jitter_range_ms == 0 {
            return base_delay_ms;
        }
        base_delay_ms + rand::thread_rng().gen_range(0..=jitter_range_ms)
    }
}

impl From<&RetryConfig> for ExponentialBackoff {
    fn from(config: &RetryConfig) -> Self {
        Self::with_config(
            config.base_delay_ms,
            config.max_delay_ms,
            config.jitter_factor,
            config.max_attempts,
        )
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }
        let delay_ms = self.add_jitter_ms(self.calculate_base_delay(attempt));
        Some(Duration::from_millis(delay_ms))
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Fixed delay retry strategy (for testing or simple cases)
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_retries: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        self.should_retry(attempt).then_some(self.delay)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Re-run `op` while it fails with `StoreUnavailable`, backing off between
/// attempts. Any other outcome is returned as is.
pub async fn retry_on_unavailable<T, F, Fut>(
    strategy: &dyn RetryStrategy,
    operation: &str,
    mut op: F,
) -> Result<T, JobStoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, JobStoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(JobStoreError::StoreUnavailable(reason)) => match strategy.next_delay(attempt) {
                Some(delay) => {
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Document store unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    warn!(operation, attempts = attempt + 1, "Giving up on unavailable document store");
                    return Err(JobStoreError::StoreUnavailable(reason));
                }
            },
            other => return other,
        }
    }
}
