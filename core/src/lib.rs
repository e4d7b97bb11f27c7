//! # Toolgate Core
//!
//! Configuration, error taxonomy and time abstraction shared by the Toolgate
//! admission and retry runtime.
//!
//! Provider adapters (search, code analysis, browser automation) reach metered
//! third-party APIs through two narrow calls:
//!
//! - **Admission**: "may I spend `cost` units against resource `name`?"
//!   answered by a token bucket.
//! - **Resilience**: "run this fallible operation, retrying transient failures
//!   with bounded exponential backoff".
//!
//! This crate holds the data those calls are configured with and the errors
//! they report. The behaviour lives in `toolgate-runtime`.
//!
//! ## Example
//!
//! ```
//! use toolgate_core::config::{BucketConfig, RetryPolicy};
//!
//! let bucket = BucketConfig::builder("search")
//!     .max_tokens(5.0)
//!     .refill_rate(0.5)
//!     .wait_for_tokens(false)
//!     .build();
//! assert!(bucket.validate().is_ok());
//!
//! let policy = RetryPolicy::builder()
//!     .max_attempts(4)
//!     .retryable_error("RATE_LIMIT")
//!     .build();
//! assert_eq!(policy.max_attempts, 4);
//! ```

/// Bucket, retry and file-level configuration
pub mod config;

/// Error types reported by admission, retry and configuration
pub mod error;

pub use config::{BucketConfig, LimitsConfig, RetryMatcher, RetryPolicy};
pub use error::{AdmissionError, ConfigError, RegistryError, RetryError};

/// Environment module - injected dependencies
///
/// Time is the only external input of the admission core. Refill is a pure
/// function of elapsed monotonic time, so tests substitute a controllable
/// clock instead of sleeping.
pub mod environment {
    use std::fmt::Debug;
    use tokio::time::Instant;

    /// Clock trait - abstracts monotonic time for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Production - tokio's monotonic clock
    /// let clock = SystemClock;
    ///
    /// // Test - manually advanced
    /// let clock = ManualClock::new();
    /// clock.advance(Duration::from_secs(1));
    /// ```
    pub trait Clock: Send + Sync + Debug {
        /// Get the current monotonic instant
        fn now(&self) -> Instant;
    }

    /// Monotonic clock backed by `tokio::time::Instant`.
    ///
    /// Honours `tokio::time::pause`, so paused-time tests can drive it by
    /// sleeping.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> Instant {
            Instant::now()
        }
    }
}
