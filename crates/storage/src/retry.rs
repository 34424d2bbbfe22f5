//! Bounded exponential-backoff retries for transient storage failures

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;
use trainer_core::config::RetryConfig;
use trainer_core::{Error, Result};

/// Execute an async operation, retrying retryable errors with backoff
///
/// Non-retryable errors are returned immediately. After `max_retries`
/// attempts the last error is returned to the caller.
pub async fn with_retry<T, F, Fut>(policy: &RetryConfig, operation: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_retries.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt + 1 == attempts {
                    last_error = Some(e);
                    break;
                }

                let delay = backoff(policy, attempt);
                warn!(
                    %operation,
                    attempt = attempt + 1,
                    max_retries = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after transient error"
                );

                tokio::time::sleep(delay).await;
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::Remote {
        message: format!("{} failed after {} attempts", operation, attempts),
    }))
}

/// Delay before the next attempt, with up to 50% random jitter subtracted
fn backoff(policy: &RetryConfig, attempt: u32) -> Duration {
    let delay = policy.delay_for(attempt);
    if !policy.jitter || delay.is_zero() {
        return delay;
    }
    let millis = delay.as_millis() as u64;
    let jitter = rand::thread_rng().gen_range(0..=millis / 2);
    Duration::from_millis(millis - jitter)
}
