//! Configuration for buckets and retry policies.
//!
//! Both can be built in code through builders or loaded from a TOML file via
//! [`LimitsConfig`]:
//!
//! ```toml
//! [defaults]
//! max_tokens = 10
//! refill_rate = 1.0
//!
//! [buckets.search]
//! max_tokens = 5
//! refill_rate = 0.5
//! wait_for_tokens = false
//!
//! [retry]
//! max_attempts = 4
//! retryable_errors = ["RATE_LIMIT", "503"]
//! ```

use crate::error::ConfigError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const DEFAULT_MAX_TOKENS: f64 = 10.0;
const DEFAULT_REFILL_RATE: f64 = 1.0;
const DEFAULT_MAX_WAIT_MS: u64 = 30_000;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

// ============================================================================
// Buckets
// ============================================================================

/// Token bucket configuration for one named resource.
///
/// # Default Values
///
/// - `max_tokens`: 10
/// - `refill_rate`: 1 token per second
/// - `initial_tokens`: `None` (start full)
/// - `wait_for_tokens`: true
/// - `max_wait_time_ms`: 30 seconds
///
/// The default has an empty `name`; [`BucketConfig::builder`] and
/// [`BucketConfig::for_resource`] bind it to a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BucketConfig {
    /// Resource the bucket meters (e.g. "search", "browser")
    pub name: String,
    /// Maximum number of tokens (burst capacity)
    pub max_tokens: f64,
    /// Tokens refilled per second
    pub refill_rate: f64,
    /// Tokens at creation; `None` means a full bucket
    pub initial_tokens: Option<f64>,
    /// Suspend callers until tokens are available instead of failing
    pub wait_for_tokens: bool,
    /// Longest a caller may be suspended, in milliseconds
    pub max_wait_time_ms: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_tokens: DEFAULT_MAX_TOKENS,
            refill_rate: DEFAULT_REFILL_RATE,
            initial_tokens: None,
            wait_for_tokens: true,
            max_wait_time_ms: DEFAULT_MAX_WAIT_MS,
        }
    }
}

impl BucketConfig {
    /// Create a new configuration builder for `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> BucketConfigBuilder {
        BucketConfigBuilder {
            config: Self {
                name: name.into(),
                ..Self::default()
            },
        }
    }

    /// Copy of this configuration bound to another resource name.
    #[must_use]
    pub fn for_resource(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Tokens the bucket holds when created.
    #[must_use]
    pub fn starting_tokens(&self) -> f64 {
        self.initial_tokens
            .unwrap_or(self.max_tokens)
            .max(0.0)
            .min(self.max_tokens)
    }

    /// Wait bound as a [`Duration`].
    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_ms)
    }

    /// Check that the configuration describes a usable bucket.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the name is empty, the capacity or
    /// refill rate is not a positive finite number, or the initial token
    /// count lies outside `0..=max_tokens`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "resource name must not be empty"));
        }
        if !self.max_tokens.is_finite() || self.max_tokens <= 0.0 {
            return Err(ConfigError::invalid(
                "max_tokens",
                format!("must be a positive number, got {}", self.max_tokens),
            ));
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(ConfigError::invalid(
                "refill_rate",
                format!("must be a positive number, got {}", self.refill_rate),
            ));
        }
        if let Some(initial) = self.initial_tokens {
            if !initial.is_finite() || initial < 0.0 || initial > self.max_tokens {
                return Err(ConfigError::invalid(
                    "initial_tokens",
                    format!("must be between 0 and {}, got {initial}", self.max_tokens),
                ));
            }
        }
        Ok(())
    }
}

/// Builder for [`BucketConfig`].
#[derive(Debug, Clone)]
pub struct BucketConfigBuilder {
    config: BucketConfig,
}

impl BucketConfigBuilder {
    /// Set burst capacity.
    #[must_use]
    pub const fn max_tokens(mut self, max_tokens: f64) -> Self {
        self.config.max_tokens = max_tokens;
        self
    }

    /// Set tokens regenerated per second.
    #[must_use]
    pub const fn refill_rate(mut self, refill_rate: f64) -> Self {
        self.config.refill_rate = refill_rate;
        self
    }

    /// Set tokens held at creation.
    #[must_use]
    pub const fn initial_tokens(mut self, initial_tokens: f64) -> Self {
        self.config.initial_tokens = Some(initial_tokens);
        self
    }

    /// Choose between waiting for tokens and failing immediately.
    #[must_use]
    pub const fn wait_for_tokens(mut self, wait: bool) -> Self {
        self.config.wait_for_tokens = wait;
        self
    }

    /// Set the longest a caller may be suspended.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn max_wait(mut self, max_wait: Duration) -> Self {
        self.config.max_wait_time_ms = max_wait.as_millis() as u64;
        self
    }

    /// Build the [`BucketConfig`].
    #[must_use]
    pub fn build(self) -> BucketConfig {
        self.config
    }
}

/// Per-resource settings from a configuration file.
///
/// Unset fields fall back to the file's `[defaults]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BucketOverrides {
    /// Burst capacity
    pub max_tokens: Option<f64>,
    /// Tokens refilled per second
    pub refill_rate: Option<f64>,
    /// Tokens at creation
    pub initial_tokens: Option<f64>,
    /// Wait for tokens instead of failing
    pub wait_for_tokens: Option<bool>,
    /// Wait bound in milliseconds
    pub max_wait_time_ms: Option<u64>,
}

impl BucketOverrides {
    fn apply(&self, base: &BucketConfig, name: &str) -> BucketConfig {
        let max_tokens = self.max_tokens.unwrap_or(base.max_tokens);
        // An inherited starting level is fitted to this bucket's capacity;
        // only a level set for this resource is held to the range check.
        let initial_tokens = self
            .initial_tokens
            .or_else(|| base.initial_tokens.map(|tokens| tokens.min(max_tokens)));
        BucketConfig {
            name: name.to_string(),
            max_tokens,
            refill_rate: self.refill_rate.unwrap_or(base.refill_rate),
            initial_tokens,
            wait_for_tokens: self.wait_for_tokens.unwrap_or(base.wait_for_tokens),
            max_wait_time_ms: self.max_wait_time_ms.unwrap_or(base.max_wait_time_ms),
        }
    }
}

// ============================================================================
// Retry
// ============================================================================

/// Decides whether a failure message is retryable.
#[derive(Debug, Clone)]
pub enum RetryMatcher {
    /// Matches when the message contains this text
    Substring(String),
    /// Matches when the regular expression finds a match in the message
    Pattern(Regex),
}

impl RetryMatcher {
    /// Whether `message` is matched.
    #[must_use]
    pub fn matches(&self, message: &str) -> bool {
        match self {
            Self::Substring(needle) => message.contains(needle.as_str()),
            Self::Pattern(regex) => regex.is_match(message),
        }
    }
}

impl From<&str> for RetryMatcher {
    fn from(value: &str) -> Self {
        Self::Substring(value.to_string())
    }
}

impl From<String> for RetryMatcher {
    fn from(value: String) -> Self {
        Self::Substring(value)
    }
}

impl From<Regex> for RetryMatcher {
    fn from(value: Regex) -> Self {
        Self::Pattern(value)
    }
}

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 3 (including the first)
/// - `initial_delay`: 1 second
/// - `max_delay`: 10 seconds
/// - `backoff_factor`: 2.0 (delay doubles each retry)
/// - `retryable`: empty (every failure is retryable)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt
    pub backoff_factor: f64,
    /// Failures whose message matches none of these are not retried.
    /// Empty means every failure is retryable.
    pub retryable: Vec<RetryMatcher>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            retryable: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            initial_delay: None,
            max_delay: None,
            backoff_factor: None,
            retryable: Vec::new(),
        }
    }

    /// Policy that makes a single attempt.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to sleep after failed attempt number `attempt` (1-based).
    ///
    /// `initial_delay * backoff_factor^(attempt - 1)`, capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(exponent);
        let max_ms = self.max_delay.as_millis() as f64;

        if delay_ms.is_nan() || delay_ms >= max_ms {
            self.max_delay
        } else {
            Duration::from_millis(delay_ms.round() as u64)
        }
    }

    /// Whether a failure with this message should be retried.
    #[must_use]
    pub fn is_retryable_message(&self, message: &str) -> bool {
        self.retryable.is_empty() || self.retryable.iter().any(|m| m.matches(message))
    }

    /// Whether `error` should be retried, judged by its `Display` output.
    #[must_use]
    pub fn is_retryable<E: std::fmt::Display + ?Sized>(&self, error: &E) -> bool {
        self.retryable.is_empty() || self.is_retryable_message(&error.to_string())
    }

    /// Check that the policy can be executed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `max_attempts` is zero or the
    /// backoff factor is below 1 or not finite.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::invalid(
                "backoff_factor",
                format!("must be a finite number >= 1, got {}", self.backoff_factor),
            ));
        }
        Ok(())
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    backoff_factor: Option<f64>,
    retryable: Vec<RetryMatcher>,
}

impl RetryPolicyBuilder {
    /// Set total attempts, including the first.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set delay before the second attempt.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = Some(factor);
        self
    }

    /// Retry failures whose message contains `needle`.
    #[must_use]
    pub fn retryable_error(mut self, needle: impl Into<String>) -> Self {
        self.retryable.push(RetryMatcher::Substring(needle.into()));
        self
    }

    /// Retry failures whose message matches `pattern`.
    #[must_use]
    pub fn retryable_pattern(mut self, pattern: Regex) -> Self {
        self.retryable.push(RetryMatcher::Pattern(pattern));
        self
    }

    /// Add several matchers at once.
    #[must_use]
    pub fn retryable<I, M>(mut self, matchers: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<RetryMatcher>,
    {
        self.retryable.extend(matchers.into_iter().map(Into::into));
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            initial_delay: self
                .initial_delay
                .unwrap_or(Duration::from_millis(DEFAULT_INITIAL_DELAY_MS)),
            max_delay: self
                .max_delay
                .unwrap_or(Duration::from_millis(DEFAULT_MAX_DELAY_MS)),
            backoff_factor: self.backoff_factor.unwrap_or(DEFAULT_BACKOFF_FACTOR),
            retryable: self.retryable,
        }
    }
}

/// Retry settings as written in a configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier applied after each failed attempt
    pub backoff_factor: f64,
    /// Substrings marking a failure as retryable
    pub retryable_errors: Vec<String>,
    /// Regular expressions marking a failure as retryable
    pub retryable_patterns: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            retryable_errors: Vec::new(),
            retryable_patterns: Vec::new(),
        }
    }
}

impl TryFrom<&RetryConfig> for RetryPolicy {
    type Error = ConfigError;

    fn try_from(config: &RetryConfig) -> Result<Self, Self::Error> {
        let patterns = config
            .retryable_patterns
            .iter()
            .map(|p| Regex::new(p).map(RetryMatcher::Pattern))
            .collect::<Result<Vec<_>, _>>()?;

        let policy = Self::builder()
            .max_attempts(config.max_attempts)
            .initial_delay(Duration::from_millis(config.initial_delay_ms))
            .max_delay(Duration::from_millis(config.max_delay_ms))
            .backoff_factor(config.backoff_factor)
            .retryable(config.retryable_errors.iter().map(String::as_str))
            .retryable(patterns)
            .build();

        policy.validate()?;
        Ok(policy)
    }
}

// ============================================================================
// File-level configuration
// ============================================================================

/// Limits for every metered resource plus the default retry policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Settings for resources without an entry in `buckets`
    pub defaults: BucketConfig,
    /// Per-resource settings keyed by resource name
    pub buckets: HashMap<String, BucketOverrides>,
    /// Default retry policy for call sites that do not supply one
    pub retry: RetryConfig,
}

impl LimitsConfig {
    /// Parse and validate configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys and
    /// any error from [`LimitsConfig::validate`].
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`LimitsConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Effective bucket configuration for `name`.
    #[must_use]
    pub fn bucket_config(&self, name: &str) -> BucketConfig {
        self.buckets.get(name).map_or_else(
            || self.defaults.for_resource(name),
            |overrides| overrides.apply(&self.defaults, name),
        )
    }

    /// Resource names with explicit settings.
    pub fn configured_resources(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(String::as_str)
    }

    /// Default retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a pattern does not compile or the policy
    /// fails validation.
    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        RetryPolicy::try_from(&self.retry)
    }

    /// Check every bucket and the retry policy.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.defaults.for_resource("defaults").validate()?;
        for name in self.buckets.keys() {
            self.bucket_config(name).validate()?;
        }
        self.retry_policy()?;
        Ok(())
    }
}
