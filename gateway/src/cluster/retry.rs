//! Retrying of cluster writes that lost an optimistic-concurrency race.
//!
//! Backoff is exponential with jitter so concurrent writers on the same object
//! spread out instead of colliding again.

use core::{fmt::Display, future::Future, time::Duration};

use tracing::{error, warn};

/// Backoff settings for retried operations.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

/// Runs `operation` until it succeeds, fails with an error `retryable` rejects,
/// or `config.max_attempts` attempts have been made.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once attempts are
/// exhausted.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0_u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !retryable(&e) => return Err(e),
            Err(e) => {
                if attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "operation failed after max retries"
                    );
                    return Err(e);
                }

                // 0.5x to 1.5x of the nominal delay
                let jitter = rand::random_range(0.5..1.5);
                let jittered_delay = delay.mul_f64(jitter);

                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = delay.mul_f64(config.backoff_multiplier).min(config.max_delay);
            }
        }
    }
}

/// Whether a Kubernetes API error is a `409 Conflict`.
pub fn is_conflict(error: &kube::Error) -> bool {
    matches!(*error, kube::Error::Api(ref response) if response.code == 409)
}
