//! Bounded retry with capped exponential backoff.
//!
//! Wraps a single outbound call. Failures classified as client errors
//! (anything [`GatewayError::is_retryable`] says no to) propagate
//! immediately — retrying a malformed request cannot succeed. Transient
//! failures are retried up to `max_attempts`; the delay before attempt `n`
//! is `min(60s, 2^n * base_delay)`. The sleep is a timed suspension, never a
//! blocking wait, so concurrent requests keep flowing.
//!
//! After exhaustion exactly one terminal error surfaces: individual attempts
//! are never visible to the caller.

use std::future::Future;
use std::time::Duration;

use crate::core::config::RetryConfig;
use crate::core::error::GatewayResult;

/// Upper bound on any single backoff delay.
const MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(3),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
        }
    }
}

impl RetryPolicy {
    /// Delay before making attempt `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(31)));
        exp.min(MAX_DELAY)
    }
}

/// Run `op` with bounded retries. `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    route: &str,
    mut op: F,
) -> GatewayResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) if attempt >= policy.max_attempts => {
                tracing::warn!(
                    route,
                    attempts = attempt,
                    error = %err,
                    "retries exhausted"
                );
                return Err(err.into_terminal());
            }
            Err(err) => {
                let delay = policy.backoff_delay(attempt + 1);
                tracing::debug!(
                    route,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
