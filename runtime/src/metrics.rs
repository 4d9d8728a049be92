//! Prometheus metrics for the orchestration runtime.
//!
//! Components record through the small recorder types below; nothing is
//! collected until a recorder is installed, e.g. with [`MetricsRecorder`].
//! The runtime opens no sockets: an embedding application serves
//! [`MetricsRecorder::render`] on whatever transport it already runs.
//!
//! | Metric | Kind |
//! |--------|------|
//! | `flowbus_commands_submitted_total` | counter |
//! | `flowbus_command_duration_seconds` | histogram |
//! | `flowbus_events_processed_total` | counter |
//! | `flowbus_fold_errors_total` | counter |
//! | `flowbus_reaction_errors_total` | counter |
//! | `flowbus_joins_fired_total` | counter |
//! | `flowbus_join_handler_errors_total` | counter |
//! | `flowbus_join_instances_live` | gauge |
//!
//! # Example
//!
//! ```rust,no_run
//! use flowbus_runtime::metrics::MetricsRecorder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut recorder = MetricsRecorder::new();
//! recorder.install()?;
//!
//! let exposition = recorder.render();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Commands accepted for submission.
pub const COMMANDS_SUBMITTED: &str = "flowbus_commands_submitted_total";
/// Command handler latency.
pub const COMMAND_DURATION: &str = "flowbus_command_duration_seconds";
/// Events seen by the processor.
pub const EVENTS_PROCESSED: &str = "flowbus_events_processed_total";
/// Failed or panicking folds.
pub const FOLD_ERRORS: &str = "flowbus_fold_errors_total";
/// Failed or panicking reaction rules.
pub const REACTION_ERRORS: &str = "flowbus_reaction_errors_total";
/// Join handler invocations.
pub const JOINS_FIRED: &str = "flowbus_joins_fired_total";
/// Failed or panicking join handlers.
pub const JOIN_HANDLER_ERRORS: &str = "flowbus_join_handler_errors_total";
/// Join instances currently tracked.
pub const JOIN_INSTANCES_LIVE: &str = "flowbus_join_instances_live";

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

/// Global Prometheus recorder for the runtime's metrics.
///
/// Installs the recorder and keeps its handle; the exposition is rendered on
/// demand.
#[derive(Default)]
pub struct MetricsRecorder {
    handle: Option<PrometheusHandle>,
}

impl MetricsRecorder {
    /// Create a recorder that is not installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe the runtime's metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests) this logs a
    /// warning and succeeds without a handle.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Metrics recorder installed");
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

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this instance did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder")
            .field("installed", &self.handle.is_some())
            .finish()
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(COMMANDS_SUBMITTED, "Total number of commands accepted for submission");
    describe_histogram!(COMMAND_DURATION, "Time taken by command handlers");

    describe_counter!(EVENTS_PROCESSED, "Total number of events processed");
    describe_counter!(FOLD_ERRORS, "Total number of folds that failed or panicked");
    describe_counter!(
        REACTION_ERRORS,
        "Total number of reaction rules that failed or panicked"
    );

    describe_counter!(JOINS_FIRED, "Total number of join handler invocations");
    describe_counter!(
        JOIN_HANDLER_ERRORS,
        "Total number of join handlers that failed or panicked"
    );
    describe_gauge!(JOIN_INSTANCES_LIVE, "Join instances currently tracked");
}

/// Command submission metrics recorder.
pub struct CommandMetrics;

impl CommandMetrics {
    /// Record a command accepted for submission.
    pub fn record_submitted() {
        counter!(COMMANDS_SUBMITTED).increment(1);
    }

    /// Record how long a handler took.
    pub fn record_duration(duration: Duration) {
        histogram!(COMMAND_DURATION).record(duration.as_secs_f64());
    }
}

/// Event processor metrics recorder.
pub struct ProcessorMetrics;

impl ProcessorMetrics {
    /// Record an event processed.
    pub fn record_event() {
        counter!(EVENTS_PROCESSED).increment(1);
    }

    /// Record a fold failure.
    pub fn record_fold_error() {
        counter!(FOLD_ERRORS).increment(1);
    }

    /// Record a reaction failure.
    pub fn record_reaction_error() {
        counter!(REACTION_ERRORS).increment(1);
    }
}

/// Join synchronizer metrics recorder.
pub struct JoinMetrics;

impl JoinMetrics {
    /// Record a join handler invocation.
    pub fn record_fired() {
        counter!(JOINS_FIRED).increment(1);
    }

    /// Record a join handler failure.
    pub fn record_handler_error() {
        counter!(JOIN_HANDLER_ERRORS).increment(1);
    }

    /// Record the number of live instances.
    ///
    /// Precision loss is acceptable for instance counts below 2^52.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_live(count: usize) {
        gauge!(JOIN_INSTANCES_LIVE).set(count as f64);
    }
}
