//! Token bucket admission control for a single metered resource.
//!
//! ## Algorithm: Token Bucket
//!
//! ```text
//! Bucket (capacity: 10 tokens, refill: 1/s)
//! ├─ Tokens accrue continuously with elapsed time, capped at capacity
//! ├─ Each request consumes `cost` tokens
//! └─ Not enough tokens → wait (bounded) or reject
//!
//! Time:   0s    1s    2s    3s
//! Tokens: 10 →  9.0 → 10 →  7.0
//!         ↓2    ↓0    ↓4
//! ```
//!
//! Refill is computed lazily whenever the bucket is touched. There is no
//! background task, so an idle bucket costs nothing and refill is a pure
//! function of the injected [`Clock`].
//!
//! ## Usage
//!
//! ```
//! use toolgate_core::config::BucketConfig;
//! use toolgate_runtime::bucket::TokenBucket;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bucket = TokenBucket::new(
//!     BucketConfig::builder("search")
//!         .max_tokens(5.0)
//!         .refill_rate(0.5)
//!         .build(),
//! )?;
//!
//! bucket.acquire(2).await?;
//! assert!(bucket.try_acquire(1));
//! # Ok(())
//! # }
//! ```

use crate::metrics::AdmissionMetrics;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use toolgate_core::config::BucketConfig;
use toolgate_core::environment::{Clock, SystemClock};
use toolgate_core::error::{AdmissionError, ConfigError};
use tracing::{debug, warn};

/// Slack for float rounding when comparing accrued tokens against a cost.
const TOKEN_EPSILON: f64 = 1e-9;

/// Mutable part of a bucket. Only touched while holding the bucket's lock.
#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant, capacity: f64, refill_rate: f64) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = elapsed.mul_add(refill_rate, self.tokens).min(capacity);
        self.last_refill = now;
    }

    fn take(&mut self, cost: f64) -> bool {
        if self.tokens + TOKEN_EPSILON >= cost {
            self.tokens = (self.tokens - cost).max(0.0);
            true
        } else {
            false
        }
    }
}

/// Token bucket rate limiter for one named resource.
///
/// Long-run throughput never exceeds `refill_rate` tokens per second, while
/// bursts of up to `max_tokens` are admitted at once.
///
/// Every refill-then-deduct sequence runs inside one critical section, so two
/// concurrent callers can never both spend the same tokens. The lock is never
/// held across an `.await`.
#[derive(Debug)]
pub struct TokenBucket {
    config: BucketConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket driven by the system monotonic clock.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn new(config: BucketConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a bucket driven by `clock`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn with_clock(config: BucketConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_validated(config, clock))
    }

    pub(crate) fn from_validated(config: BucketConfig, clock: Arc<dyn Clock>) -> Self {
        let state = BucketState {
            tokens: config.starting_tokens(),
            last_refill: clock.now(),
        };
        Self {
            config,
            clock,
            state: Mutex::new(state),
        }
    }

    /// Acquire `cost` tokens, waiting for them if the bucket allows it.
    ///
    /// - `cost` above capacity fails at once with
    ///   [`AdmissionError::CostExceedsCapacity`], whatever the wait policy.
    /// - Enough tokens: deducted without suspending.
    /// - Not enough and `wait_for_tokens` is false:
    ///   [`AdmissionError::InsufficientTokens`].
    /// - Otherwise the caller sleeps for the time the deficit takes to refill.
    ///   If that exceeds `max_wait_time_ms` the call fails at once with
    ///   [`AdmissionError::WaitTimeout`]; if tokens are still short after the
    ///   sleep (another caller took them) it fails with `WaitTimeout` too,
    ///   rather than looping.
    ///
    /// Waiters are not queued. Each one re-checks on its own schedule, so a
    /// later caller with a smaller cost can be admitted before an earlier,
    /// larger one whose wait has not yet elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError`] as described above.
    pub async fn acquire(&self, cost: u32) -> Result<(), AdmissionError> {
        let requested = f64::from(cost);
        if requested > self.config.max_tokens {
            return Err(self.reject(AdmissionError::CostExceedsCapacity {
                resource: self.config.name.clone(),
                requested: cost,
                capacity: self.config.max_tokens,
            }));
        }

        let available = match self.take(requested) {
            Ok(remaining) => {
                self.granted(cost, remaining, Duration::ZERO);
                return Ok(());
            }
            Err(available) => available,
        };

        if !self.config.wait_for_tokens {
            return Err(self.reject(AdmissionError::InsufficientTokens {
                resource: self.config.name.clone(),
                requested: cost,
                available,
            }));
        }

        let wait = self.time_to_accrue(requested - available);
        let required_wait_ms = duration_millis(wait);
        if wait > self.config.max_wait() {
            return Err(self.reject(AdmissionError::WaitTimeout {
                resource: self.config.name.clone(),
                requested: cost,
                required_wait_ms,
                waited_ms: 0,
                max_wait_ms: self.config.max_wait_time_ms,
            }));
        }

        debug!(
            resource = %self.config.name,
            cost,
            available,
            wait_ms = required_wait_ms,
            "Waiting for tokens"
        );
        tokio::time::sleep(wait).await;

        match self.take(requested) {
            Ok(remaining) => {
                self.granted(cost, remaining, wait);
                Ok(())
            }
            Err(_) => Err(self.reject(AdmissionError::WaitTimeout {
                resource: self.config.name.clone(),
                requested: cost,
                required_wait_ms,
                waited_ms: required_wait_ms,
                max_wait_ms: self.config.max_wait_time_ms,
            })),
        }
    }

    /// Acquire a single token. See [`TokenBucket::acquire`].
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError`] as [`TokenBucket::acquire`] does.
    pub async fn acquire_one(&self) -> Result<(), AdmissionError> {
        self.acquire(1).await
    }

    /// Take `cost` tokens if they are available right now.
    ///
    /// Never suspends and never fails; `false` means nothing was deducted.
    pub fn try_acquire(&self, cost: u32) -> bool {
        let requested = f64::from(cost);
        if requested > self.config.max_tokens {
            AdmissionMetrics::record_rejected(&self.config.name, "cost_exceeds_capacity");
            return false;
        }

        match self.take(requested) {
            Ok(remaining) => {
                self.granted(cost, remaining, Duration::ZERO);
                true
            }
            Err(_) => {
                AdmissionMetrics::record_rejected(&self.config.name, "insufficient_tokens");
                false
            }
        }
    }

    /// Tokens available as of now.
    ///
    /// Reading performs the same refill bookkeeping as an acquisition, but
    /// never changes the result: refill is a function of elapsed time only.
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.lock();
        state.refill(self.clock.now(), self.config.max_tokens, self.config.refill_rate);
        state.tokens
    }

    /// Resource this bucket meters.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Burst capacity.
    #[must_use]
    pub const fn capacity(&self) -> f64 {
        self.config.max_tokens
    }

    /// Tokens refilled per second.
    #[must_use]
    pub const fn refill_rate(&self) -> f64 {
        self.config.refill_rate
    }

    /// Configuration the bucket was built from.
    #[must_use]
    pub const fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Refill, then deduct `cost` if possible.
    ///
    /// Returns the remaining tokens on success, or the available tokens when
    /// short.
    fn take(&self, cost: f64) -> Result<f64, f64> {
        let mut state = self.lock();
        state.refill(self.clock.now(), self.config.max_tokens, self.config.refill_rate);
        if state.take(cost) {
            Ok(state.tokens)
        } else {
            Err(state.tokens)
        }
    }

    /// Time for `deficit` tokens to accrue, rounded up to whole milliseconds.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn time_to_accrue(&self, deficit: f64) -> Duration {
        let millis = (deficit * 1000.0 / self.config.refill_rate).ceil();
        if millis.is_finite() {
            Duration::from_millis(millis.max(0.0) as u64)
        } else {
            Duration::MAX
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        // The state is two plain numbers that are always consistent between
        // statements, so a panic elsewhere cannot leave it half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn granted(&self, cost: u32, remaining: f64, waited: Duration) {
        debug!(
            resource = %self.config.name,
            cost,
            remaining,
            waited_ms = duration_millis(waited),
            "Tokens granted"
        );
        AdmissionMetrics::record_granted(&self.config.name, waited);
    }

    fn reject(&self, error: AdmissionError) -> AdmissionError {
        warn!(resource = %self.config.name, reason = error.reason(), "{error}");
        AdmissionMetrics::record_rejected(&self.config.name, error.reason());
        error
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

    use super::*;
    use toolgate_testing::ManualClock;

    fn bucket(config: BucketConfig) -> (TokenBucket, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::with_clock(config, clock.clone()).unwrap();
        (bucket, clock)
    }

    #[test]
    fn test_try_acquire_labels_rejections_by_reason() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let (bucket, _clock) = bucket(
            BucketConfig::builder("search")
                .max_tokens(2.0)
                .initial_tokens(1.0)
                .build(),
        );

        ::metrics::with_local_recorder(&recorder, || {
            assert!(!bucket.try_acquire(3));
            assert!(!bucket.try_acquire(2));
        });

        let rendered = handle.render();
        assert!(rendered.contains(r#"reason="cost_exceeds_capacity""#));
        assert!(rendered.contains(r#"reason="insufficient_tokens""#));
        assert_eq!(bucket.available_tokens(), 1.0);
    }

    #[test]
    fn test_try_acquire_within_capacity() {
        let (bucket, _clock) = bucket(
            BucketConfig::builder("search")
                .max_tokens(2.0)
                .refill_rate(10.0)
                .initial_tokens(2.0)
                .build(),
        );

        assert!(bucket.try_acquire(1));
        assert!(bucket.try_acquire(1));
        assert!(!bucket.try_acquire(1));
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let (bucket, clock) = bucket(
            BucketConfig::builder("search")
                .max_tokens(5.0)
                .refill_rate(10.0)
                .initial_tokens(0.0)
                .build(),
        );

        clock.advance(Duration::from_millis(200));
        assert!((bucket.available_tokens() - 2.0).abs() < 1e-9);

        clock.advance(Duration::from_secs(10));
        assert_eq!(bucket.available_tokens(), 5.0);
    }

    #[test]
    fn test_fractional_tokens_are_kept() {
        let (bucket, clock) = bucket(
            BucketConfig::builder("trickle")
                .max_tokens(1.0)
                .refill_rate(1.0)
                .initial_tokens(0.0)
                .build(),
        );

        for _ in 0..4 {
            clock.advance(Duration::from_millis(250));
            let _ = bucket.available_tokens();
        }
        assert!(bucket.try_acquire(1));
    }

    #[test]
    fn test_available_tokens_is_idempotent() {
        let (bucket, clock) = bucket(
            BucketConfig::builder("search")
                .max_tokens(10.0)
                .refill_rate(3.0)
                .initial_tokens(1.0)
                .build(),
        );
        clock.advance(Duration::from_millis(500));

        let first = bucket.available_tokens();
        assert_eq!(bucket.available_tokens(), first);
        assert_eq!(bucket.available_tokens(), first);
    }

    #[test]
    fn test_try_acquire_cost_above_capacity() {
        let (bucket, _clock) = bucket(BucketConfig::builder("search").max_tokens(3.0).build());
        assert!(!bucket.try_acquire(4));
        assert_eq!(bucket.available_tokens(), 3.0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = TokenBucket::new(BucketConfig::builder("search").refill_rate(0.0).build());
        assert!(matches!(result, Err(ConfigError::Invalid { field: "refill_rate", .. })));
    }

    #[test]
    fn test_getters() {
        let (bucket, _clock) = bucket(
            BucketConfig::builder("browser")
                .max_tokens(50.0)
                .refill_rate(5.0)
                .build(),
        );

        assert_eq!(bucket.name(), "browser");
        assert_eq!(bucket.capacity(), 50.0);
        assert_eq!(bucket.refill_rate(), 5.0);
        assert!(bucket.config().wait_for_tokens);
    }

    #[tokio::test]
    async fn test_acquire_without_waiting_fails_fast() {
        let (bucket, _clock) = bucket(
            BucketConfig::builder("search")
                .max_tokens(1.0)
                .wait_for_tokens(false)
                .build(),
        );

        bucket.acquire_one().await.unwrap();
        let err = bucket.acquire_one().await.unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::InsufficientTokens { ref resource, requested: 1, .. } if resource == "search"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up_when_clock_does_not_advance() {
        // The manual clock ignores tokio's paused time, so after the computed
        // sleep the bucket is still empty.
        let (bucket, _clock) = bucket(
            BucketConfig::builder("search")
                .max_tokens(1.0)
                .refill_rate(10.0)
                .initial_tokens(0.0)
                .build(),
        );

        let err = bucket.acquire(1).await.unwrap_err();
        assert_eq!(
            err,
            AdmissionError::WaitTimeout {
                resource: "search".to_string(),
                requested: 1,
                required_wait_ms: 100,
                waited_ms: 100,
                max_wait_ms: 30_000,
            }
        );
    }
}
