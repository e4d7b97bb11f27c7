//! Admit-then-retry composition for provider adapters.
//!
//! Most call sites do the same two steps: acquire tokens for the resource,
//! then run the request with retries. [`call_guarded`] does both. Tokens are
//! acquired once, before the first attempt; retries within the policy do not
//! spend more.

use crate::registry::BucketRegistry;
use crate::retry::run_with_retry;
use std::fmt;
use std::future::Future;
use toolgate_core::config::RetryPolicy;
use toolgate_core::error::{AdmissionError, RetryError};

/// Failure of a guarded call.
#[derive(Debug)]
pub enum GuardedError<E> {
    /// The bucket refused the request; the operation never ran.
    Admission(AdmissionError),
    /// The operation ran and failed terminally.
    Retry(RetryError<E>),
}

impl<E> GuardedError<E> {
    /// Whether the call may succeed if tried again later.
    #[must_use]
    pub const fn is_retry_later(&self) -> bool {
        match self {
            Self::Admission(err) => err.is_retry_later(),
            Self::Retry(_) => false,
        }
    }
}

impl<E> From<AdmissionError> for GuardedError<E> {
    fn from(err: AdmissionError) -> Self {
        Self::Admission(err)
    }
}

impl<E> From<RetryError<E>> for GuardedError<E> {
    fn from(err: RetryError<E>) -> Self {
        Self::Retry(err)
    }
}

impl<E: fmt::Display> fmt::Display for GuardedError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admission(err) => write!(f, "{err}"),
            Self::Retry(err) => write!(f, "{err}"),
        }
    }
}

impl<E> std::error::Error for GuardedError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Admission(err) => Some(err),
            Self::Retry(err) => Some(err),
        }
    }
}

/// Acquire `cost` tokens on `resource`, then run `operation` with retries.
///
/// # Example
///
/// ```rust
/// use toolgate_core::config::RetryPolicy;
/// use toolgate_runtime::guarded::call_guarded;
/// use toolgate_runtime::registry::BucketRegistry;
///
/// # async fn example() {
/// let registry = BucketRegistry::default();
/// let hits = call_guarded(&registry, "search", 1, &RetryPolicy::default(), || async {
///     Ok::<_, String>(vec!["result"])
/// })
/// .await;
/// assert!(hits.is_ok());
/// # }
/// ```
///
/// # Errors
///
/// Returns [`GuardedError::Admission`] if the bucket refuses, otherwise
/// [`GuardedError::Retry`] if the operation fails terminally.
pub async fn call_guarded<F, Fut, T, E>(
    registry: &BucketRegistry,
    resource: &str,
    cost: u32,
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, GuardedError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    registry.acquire(resource, cost).await?;
    Ok(run_with_retry(policy, operation).await?)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::float_cmp)]

    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use toolgate_core::config::BucketConfig;
    use toolgate_testing::{ManualClock, ScriptedOperation};

    fn registry() -> BucketRegistry {
        BucketRegistry::new(
            BucketConfig::builder("defaults")
                .max_tokens(1.0)
                .wait_for_tokens(false)
                .build(),
        )
        .unwrap()
        .with_clock(Arc::new(ManualClock::new()))
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(3)
            .initial_delay(Duration::ZERO)
            .build()
    }

    #[tokio::test]
    async fn test_retries_spend_tokens_once() {
        let registry = registry();
        let op = ScriptedOperation::failing_times(2, "503 Service Unavailable", "ok");

        let result = call_guarded(&registry, "search", 1, &policy(), || op.call()).await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(op.calls(), 3);
        assert_eq!(registry.available_tokens("search"), 0.0);
    }

    #[tokio::test]
    async fn test_refused_admission_skips_operation() {
        let registry = registry();
        assert!(registry.try_acquire("search", 1));
        let op = ScriptedOperation::failing_times(0, "unused", "ok");

        let err = call_guarded(&registry, "search", 1, &policy(), || op.call())
            .await
            .unwrap_err();

        assert!(matches!(err, GuardedError::Admission(AdmissionError::InsufficientTokens { .. })));
        assert!(err.is_retry_later());
        assert_eq!(op.calls(), 0);
    }

    #[tokio::test]
    async fn test_terminal_failure_is_wrapped() {
        let registry = registry();
        let op = ScriptedOperation::failing_times(5, "boom", "ok");

        let err = call_guarded(&registry, "browser", 1, &policy(), || op.call())
            .await
            .unwrap_err();

        match err {
            GuardedError::Retry(retry) => {
                assert_eq!(retry.attempts(), 3);
                assert_eq!(retry.error().to_string(), "boom");
            }
            GuardedError::Admission(other) => panic!("unexpected admission error: {other}"),
        }
    }
}
