//! Retry utilities with exponential backoff and jitter.
//!
//! Two shapes of waiting:
//! - [`retry_with_backoff`] retries a fallible operation until it succeeds
//! - [`poll_with_backoff`] polls a condition a bounded number of times and
//!   fails with [`Error::Timeout`] when the budget runs out
//!
//! # Example
//!
//! ```ignore
//! use mesh_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let result = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(3),
//!     "api_discovery",
//!     || async { kube::discovery::pinned_kind(&client, &gvk).await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, warn};

use crate::config::BackoffConfig;
use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries indefinitely (or up to max_attempts if set) until success.
///
/// # Returns
/// The result of the operation, or the last error if max_attempts is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Poll `check` until it returns `Ok(true)`, at most `backoff.steps` times.
///
/// Sleeps `initial_delay * factor^n` between attempts (no jitter, so the
/// total budget is predictable). Errors from `check` abort immediately.
pub async fn poll_with_backoff<F, Fut>(
    backoff: &BackoffConfig,
    operation_name: &str,
    mut check: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let mut delay = backoff.initial_delay;
    for step in 1..=backoff.steps.max(1) {
        if check().await? {
            return Ok(());
        }
        if step == backoff.steps.max(1) {
            break;
        }
        debug!(
            operation = %operation_name,
            step,
            delay_ms = delay.as_millis(),
            "condition not met yet"
        );
        tokio::time::sleep(delay).await;
        delay = Duration::from_secs_f64(delay.as_secs_f64() * backoff.factor);
    }
    Err(Error::Timeout {
        operation: operation_name.to_string(),
        message: format!("condition not met after {} attempts", backoff.steps.max(1)),
    })
}
