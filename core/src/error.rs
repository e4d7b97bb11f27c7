//! Error taxonomy for admission control, retries and configuration.
//!
//! - [`AdmissionError`]: a bucket refused to grant tokens. `InsufficientTokens`
//!   and `WaitTimeout` mean "try later"; `CostExceedsCapacity` never resolves.
//! - [`RetryError`]: the terminal outcome of a retried operation. Both variants
//!   carry the caller's original error untouched.
//! - [`ConfigError`]: invalid bucket or retry settings.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned when a bucket does not admit a request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdmissionError {
    /// The bucket is empty and configured not to wait.
    #[error(
        "insufficient tokens for resource '{resource}': requested {requested}, available {available:.2}"
    )]
    InsufficientTokens {
        /// Resource the bucket meters
        resource: String,
        /// Tokens requested
        requested: u32,
        /// Tokens available at the time of the request
        available: f64,
    },

    /// Waiting for enough tokens would exceed, or did exceed, the wait bound.
    ///
    /// `waited_ms` is zero when the request was refused up front because the
    /// computed wait was already over `max_wait_ms`.
    #[error(
        "timed out waiting for {requested} token(s) on resource '{resource}' \
         (required wait {required_wait_ms}ms, waited {waited_ms}ms, limit {max_wait_ms}ms)"
    )]
    WaitTimeout {
        /// Resource the bucket meters
        resource: String,
        /// Tokens requested
        requested: u32,
        /// Wait computed from the deficit and refill rate
        required_wait_ms: u64,
        /// Time actually spent suspended
        waited_ms: u64,
        /// Configured wait bound
        max_wait_ms: u64,
    },

    /// The request is larger than the bucket can ever hold.
    #[error("cost {requested} exceeds capacity {capacity} of resource '{resource}'")]
    CostExceedsCapacity {
        /// Resource the bucket meters
        resource: String,
        /// Tokens requested
        requested: u32,
        /// Bucket capacity
        capacity: f64,
    },
}

impl AdmissionError {
    /// Name of the resource that refused the request.
    #[must_use]
    pub fn resource(&self) -> &str {
        match self {
            Self::InsufficientTokens { resource, .. }
            | Self::WaitTimeout { resource, .. }
            | Self::CostExceedsCapacity { resource, .. } => resource,
        }
    }

    /// Whether the caller may succeed by trying again later.
    #[must_use]
    pub const fn is_retry_later(&self) -> bool {
        matches!(
            self,
            Self::InsufficientTokens { .. } | Self::WaitTimeout { .. }
        )
    }

    /// Short, stable label used for metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::InsufficientTokens { .. } => "insufficient_tokens",
            Self::WaitTimeout { .. } => "wait_timeout",
            Self::CostExceedsCapacity { .. } => "cost_exceeds_capacity",
        }
    }
}

/// Terminal failure of an operation run with retries.
///
/// Intermediate failures are never surfaced. Whichever variant is returned
/// holds the error produced by the final attempt, unchanged, so callers can
/// still match on it.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every permitted attempt failed with a retryable error.
    Exhausted {
        /// Attempts made, including the first
        attempts: u32,
        /// Error from the last attempt
        last_error: E,
    },

    /// The operation failed with an error that the policy does not retry.
    NonRetryable {
        /// Attempt on which the error occurred
        attempts: u32,
        /// The original error
        error: E,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::NonRetryable { attempts, .. } => *attempts,
        }
    }

    /// Borrow the error from the final attempt.
    #[must_use]
    pub const fn error(&self) -> &E {
        match self {
            Self::Exhausted { last_error, .. } => last_error,
            Self::NonRetryable { error, .. } => error,
        }
    }

    /// Take the error from the final attempt.
    #[must_use]
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last_error, .. } => last_error,
            Self::NonRetryable { error, .. } => error,
        }
    }

    /// Whether all attempts were used up.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted {
                attempts,
                last_error,
            } => write!(f, "{last_error} (gave up after {attempts} attempts)"),
            // Non-retryable failures read exactly like the original error.
            Self::NonRetryable { error, .. } => write!(f, "{error}"),
        }
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error())
    }
}

/// Errors from building or loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A field holds a value outside its allowed range.
    #[error("invalid value for '{field}': {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// A retryable-error pattern is not a valid regular expression.
    #[error("invalid retryable error pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// The configuration file is not valid TOML for the expected schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration file could not be read.
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        /// File that was being read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors from the process-wide bucket registry.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// The global registry was already created, explicitly or by first use.
    #[error("global bucket registry is already initialized")]
    AlreadyInitialized,
}
