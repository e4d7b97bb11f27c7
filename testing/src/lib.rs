//! # Toolgate Testing
//!
//! Testing utilities and helpers for the Toolgate admission and retry core.
//!
//! This crate provides:
//! - [`ManualClock`]: a monotonic clock that only moves when told to
//! - [`ScriptedOperation`]: a fallible operation that fails a set number of
//!   times before succeeding, counting every call
//! - [`init_test_tracing`]: log output for tests, filtered by `RUST_LOG`
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use toolgate_core::environment::Clock;
//! use toolgate_testing::ManualClock;
//!
//! let clock = Arc::new(ManualClock::new());
//! let start = clock.now();
//! clock.advance(Duration::from_secs(2));
//! assert_eq!(clock.now() - start, Duration::from_secs(2));
//! ```

use toolgate_core::environment::Clock;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::Clock;
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;
    use tokio::time::Instant;

    /// Manually advanced clock for deterministic tests
    ///
    /// Starts at the instant it was created and only moves on
    /// [`ManualClock::advance`]. Independent of tokio's paused time, so a
    /// bucket driven by it sees no refill while the test sleeps.
    ///
    /// # Example
    ///
    /// ```
    /// use toolgate_testing::mocks::ManualClock;
    /// use toolgate_core::environment::Clock;
    ///
    /// let clock = ManualClock::new();
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Frozen until advanced
    /// ```
    #[derive(Debug)]
    pub struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        /// Create a clock frozen at the current instant
        #[must_use]
        pub fn new() -> Self {
            Self::starting_at(Instant::now())
        }

        /// Create a clock frozen at `start`
        #[must_use]
        pub const fn starting_at(start: Instant) -> Self {
            Self {
                now: Mutex::new(start),
            }
        }

        /// Move the clock forward by `by`
        pub fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
            *now += by;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default manual clock for tests
    #[must_use]
    pub fn test_clock() -> ManualClock {
        ManualClock::new()
    }
}

/// Scripted fallible operations for exercising retry paths
pub mod operations {
    use std::future::{Ready, ready};
    use std::sync::atomic::{AtomicU32, Ordering};
    use thiserror::Error;

    /// Error produced by a [`ScriptedOperation`]; displays as its message.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    #[error("{message}")]
    pub struct ScriptedError {
        /// Message the retry matchers see
        pub message: String,
    }

    /// Operation that fails `failures` times, then succeeds with `value`.
    ///
    /// # Example
    ///
    /// ```
    /// use toolgate_testing::ScriptedOperation;
    ///
    /// # async fn example() {
    /// let op = ScriptedOperation::failing_times(1, "RATE_LIMIT", 7);
    /// assert!(op.call().await.is_err());
    /// assert_eq!(op.call().await, Ok(7));
    /// assert_eq!(op.calls(), 2);
    /// # }
    /// ```
    #[derive(Debug)]
    pub struct ScriptedOperation<T> {
        failures: u32,
        message: String,
        value: T,
        calls: AtomicU32,
    }

    impl<T: Clone> ScriptedOperation<T> {
        /// Fail the first `failures` calls with `message`, then return `value`
        #[must_use]
        pub fn failing_times(failures: u32, message: impl Into<String>, value: T) -> Self {
            Self {
                failures,
                message: message.into(),
                value,
                calls: AtomicU32::new(0),
            }
        }

        /// Operation that never succeeds
        #[must_use]
        pub fn always_failing(message: impl Into<String>, value: T) -> Self {
            Self::failing_times(u32::MAX, message, value)
        }

        /// Run one attempt
        pub fn call(&self) -> Ready<Result<T, ScriptedError>> {
            let previous = self.calls.fetch_add(1, Ordering::SeqCst);
            if previous < self.failures {
                ready(Err(ScriptedError {
                    message: self.message.clone(),
                }))
            } else {
                ready(Ok(self.value.clone()))
            }
        }

        /// Number of attempts made so far
        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }
}

/// Install a `tracing` subscriber for test output.
///
/// Honours `RUST_LOG` and defaults to `debug` for the Toolgate crates. Safe to
/// call from every test; only the first call installs anything.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("toolgate_runtime=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{ManualClock, test_clock};
pub use operations::{ScriptedError, ScriptedOperation};
