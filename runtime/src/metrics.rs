//! Prometheus metrics for admission control and retries.
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed, so library users who do not care about metrics pay
//! nothing.
//!
//! # Example
//!
//! ```rust,no_run
//! use toolgate_runtime::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut exporter = MetricsExporter::new();
//! exporter.install()?;
//!
//! // ... serve `exporter.render()` from the host's HTTP layer
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder whose output the host process exposes.
///
/// Serving the text exposition over HTTP belongs to the transport layer;
/// this type only installs the recorder and renders it.
#[derive(Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsExporter")
            .field("installed", &self.handle.is_some())
            .finish()
    }
}

impl MetricsExporter {
    /// Create an exporter that has not installed a recorder yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// Only one recorder can be installed per process. If one already is
    /// (e.g., in tests), this logs a warning and leaves `render` returning
    /// `None`.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("wait_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this exporter did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "toolgate_admission_granted_total",
        "Total number of token acquisitions granted"
    );
    describe_counter!(
        "toolgate_admission_rejected_total",
        "Total number of token acquisitions refused, by reason"
    );
    describe_histogram!(
        "toolgate_admission_wait_seconds",
        "Time callers spent suspended waiting for tokens"
    );

    describe_counter!(
        "toolgate_retry_attempts_total",
        "Total number of retries scheduled after a failed attempt"
    );
    describe_counter!(
        "toolgate_retry_successes_total",
        "Total number of operations that succeeded after at least one retry"
    );
    describe_counter!(
        "toolgate_retry_exhausted_total",
        "Total number of operations that used up every attempt"
    );
    describe_counter!(
        "toolgate_retry_non_retryable_total",
        "Total number of operations stopped by a non-retryable error"
    );
}

/// Admission metrics recorder.
#[derive(Debug)]
pub struct AdmissionMetrics;

impl AdmissionMetrics {
    /// Record a granted acquisition and how long it waited.
    pub fn record_granted(resource: &str, waited: Duration) {
        counter!("toolgate_admission_granted_total", "resource" => resource.to_string())
            .increment(1);
        if !waited.is_zero() {
            histogram!("toolgate_admission_wait_seconds", "resource" => resource.to_string())
                .record(waited.as_secs_f64());
        }
    }

    /// Record a refused acquisition.
    pub fn record_rejected(resource: &str, reason: &'static str) {
        counter!(
            "toolgate_admission_rejected_total",
            "resource" => resource.to_string(),
            "reason" => reason
        )
        .increment(1);
    }
}

/// Retry metrics recorder.
#[derive(Debug)]
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry being scheduled.
    pub fn record_attempt() {
        counter!("toolgate_retry_attempts_total").increment(1);
    }

    /// Record success after one or more retries.
    pub fn record_success() {
        counter!("toolgate_retry_successes_total").increment(1);
    }

    /// Record an operation that used up its attempts.
    pub fn record_exhausted() {
        counter!("toolgate_retry_exhausted_total").increment(1);
    }

    /// Record an operation stopped by a non-retryable error.
    pub fn record_non_retryable() {
        counter!("toolgate_retry_non_retryable_total").increment(1);
    }
}
