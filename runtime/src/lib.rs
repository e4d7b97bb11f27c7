//! # Toolgate Runtime
//!
//! Admission control and retry for calls to metered third-party APIs.
//!
//! ## Core Components
//!
//! - **[`TokenBucket`]**: grants, delays or refuses `cost` units of work on
//!   one resource
//! - **[`BucketRegistry`]**: one bucket per resource name, created on first use
//! - **[`run_with_retry`]**: re-invokes a failing operation with bounded
//!   exponential backoff
//! - **[`call_guarded`]**: admission followed by retry, for adapters that
//!   want both
//!
//! The bucket and the retry executor are independent; neither knows about
//! the other.
//!
//! ## Example
//!
//! ```rust
//! use toolgate_core::config::{BucketConfig, RetryPolicy};
//! use toolgate_runtime::{BucketRegistry, run_with_retry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = BucketRegistry::default();
//! registry.configure(BucketConfig::builder("search").max_tokens(5.0).build())?;
//!
//! registry.acquire("search", 1).await?;
//! let _body = run_with_retry(&RetryPolicy::default(), || async {
//!     Ok::<_, std::io::Error>("results")
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

/// Token bucket for a single resource
pub mod bucket;

/// Admit-then-retry composition
pub mod guarded;

/// Prometheus metrics for observability
pub mod metrics;

/// Resource name → bucket registry
pub mod registry;

/// Retry logic with exponential backoff
pub mod retry;

pub use bucket::TokenBucket;
pub use guarded::{GuardedError, call_guarded};
pub use registry::BucketRegistry;
pub use retry::{run_with_retry, run_with_retry_if};
pub use toolgate_core::error::{AdmissionError, RetryError};
