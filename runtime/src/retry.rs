//! Retry with exponential backoff for fallible outbound calls.
//!
//! The executor knows nothing about buckets: it re-invokes an operation
//! according to a [`RetryPolicy`] and reports a single outcome. Intermediate
//! failures are logged, never returned.
//!
//! # Example
//!
//! ```rust
//! use toolgate_core::config::RetryPolicy;
//! use toolgate_runtime::retry::run_with_retry;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .backoff_factor(2.0)
//!     .retryable_error("RATE_LIMIT")
//!     .build();
//!
//! let result = run_with_retry(&policy, || async {
//!     // Your fallible operation here
//!     Ok::<_, String>(42)
//! })
//! .await
//! .map_err(|err| err.to_string())?;
//! assert_eq!(result, 42);
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use std::fmt::Display;
use std::future::Future;
use tokio::time::sleep;
use toolgate_core::config::RetryPolicy;
use toolgate_core::error::RetryError;

/// Run `operation`, retrying failures according to `policy`.
///
/// 1. Call the operation; on success return at once.
/// 2. A failure whose message matches none of the policy's matchers (when it
///    has any) is returned as [`RetryError::NonRetryable`] without retrying.
/// 3. After `max_attempts` failures return [`RetryError::Exhausted`] with the
///    last error.
/// 4. Otherwise sleep `policy.delay_for_attempt(attempt)` and try again.
///
/// There is no overall timeout; each invocation should bound itself and
/// report a timeout as an ordinary error.
///
/// # Errors
///
/// Returns [`RetryError`] carrying the final attempt's error.
pub async fn run_with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    run_with_retry_if(policy, operation, |_: &E| true).await
}

/// Like [`run_with_retry`], with an extra predicate on the error value.
///
/// A failure is retried only when it passes both the policy's matchers and
/// `is_retryable`. Useful when the error type carries a status code that is
/// better inspected directly than through its message.
///
/// # Example
///
/// ```rust
/// use toolgate_core::config::RetryPolicy;
/// use toolgate_runtime::retry::run_with_retry_if;
///
/// # async fn example() -> Result<(), String> {
/// let policy = RetryPolicy::default();
///
/// let result = run_with_retry_if(
///     &policy,
///     || async { Ok::<_, String>(42) },
///     |err: &String| err.contains("transient"),
/// )
/// .await
/// .map_err(|err| err.to_string())?;
/// assert_eq!(result, 42);
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns [`RetryError`] carrying the final attempt's error.
pub async fn run_with_retry_if<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                    RetryMetrics::record_success();
                }
                return Ok(result);
            }
            Err(err) => {
                if !(policy.is_retryable(&err) && is_retryable(&err)) {
                    tracing::warn!(
                        attempt,
                        error = %err,
                        "Error is not retryable, failing immediately"
                    );
                    RetryMetrics::record_non_retryable();
                    return Err(RetryError::NonRetryable {
                        attempts: attempt,
                        error: err,
                    });
                }

                if attempt >= max_attempts {
                    tracing::error!(
                        attempt,
                        error = %err,
                        "Operation failed after max attempts"
                    );
                    RetryMetrics::record_exhausted();
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last_error: err,
                    });
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, retrying..."
                );
                RetryMetrics::record_attempt();

                if !delay.is_zero() {
                    sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}
