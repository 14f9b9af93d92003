//! Prometheus metrics for the counter runtime.
//!
//! Metric families:
//! - Authoritative store operations (`persistence_*`)
//! - Propagation channels (`propagation_*`)
//! - Client sessions (`session_*`)
//! - The reducer store runtime (`store.*`, recorded inline by [`crate::Store`])
//!
//! # Example
//!
//! ```rust,no_run
//! use ticket_sync_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! println!("{}", server.render().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

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

/// Prometheus recorder plus the address it is advertised on.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server for `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed. An already
    /// installed recorder is tolerated.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// The advertised address
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this instance did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Authoritative store
    describe_counter!(
        "persistence_operations_total",
        "Store operations by kind (read, write, append, delete, list, clear)"
    );
    describe_counter!(
        "persistence_errors_total",
        "Store operations that failed, by kind"
    );
    describe_histogram!(
        "persistence_operation_duration_seconds",
        "Time taken by store operations"
    );

    // Propagation
    describe_counter!(
        "propagation_broadcasts_published_total",
        "Counter values published on the broadcast topic"
    );
    describe_counter!(
        "propagation_publish_errors_total",
        "Broadcast publishes that failed (logged, not surfaced)"
    );
    describe_histogram!(
        "propagation_publish_duration_seconds",
        "Time taken to publish a broadcast"
    );
    describe_counter!(
        "propagation_tab_signals_total",
        "Values written to the device tab key"
    );
    describe_counter!(
        "propagation_tab_signal_errors_total",
        "Tab key writes that failed"
    );
    describe_counter!(
        "propagation_observations_total",
        "Inbound observations by channel"
    );
    describe_counter!(
        "propagation_decode_errors_total",
        "Inbound payloads that could not be decoded"
    );
    describe_counter!(
        "propagation_poll_errors_total",
        "Authoritative re-reads that failed"
    );

    // Sessions
    describe_counter!(
        "session_mutations_total",
        "Mutations admitted by the busy gate, by kind"
    );
    describe_counter!(
        "session_mutations_ignored_total",
        "Mutation intents dropped, by reason (busy, invalid, uninitialized)"
    );
    describe_counter!(
        "session_commit_failures_total",
        "Commits that failed, by stage"
    );
    describe_counter!(
        "session_undo_total",
        "Undo attempts by outcome"
    );

    // Store runtime
    describe_counter!("store.commands.total", "Actions sent to a store");
    describe_histogram!(
        "store.reducer.duration_seconds",
        "Time spent inside the reducer"
    );
}

/// Authoritative store metrics recorder.
pub struct PersistenceMetrics;

impl PersistenceMetrics {
    /// Record a completed store operation.
    pub fn record_operation(operation: &'static str, duration: Duration) {
        counter!("persistence_operations_total", "operation" => operation).increment(1);
        histogram!("persistence_operation_duration_seconds", "operation" => operation)
            .record(duration.as_secs_f64());
    }

    /// Record a failed store operation.
    pub fn record_error(operation: &'static str) {
        counter!("persistence_errors_total", "operation" => operation).increment(1);
    }
}

/// Propagation channel metrics recorder.
pub struct PropagationMetrics;

impl PropagationMetrics {
    /// Record a broadcast publish.
    pub fn record_publish(duration: Duration) {
        counter!("propagation_broadcasts_published_total").increment(1);
        histogram!("propagation_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed broadcast publish.
    pub fn record_publish_error() {
        counter!("propagation_publish_errors_total").increment(1);
    }

    /// Record a tab key write.
    pub fn record_tab_signal() {
        counter!("propagation_tab_signals_total").increment(1);
    }

    /// Record a failed tab key write.
    pub fn record_tab_signal_error() {
        counter!("propagation_tab_signal_errors_total").increment(1);
    }

    /// Record an observation delivered by `channel`.
    pub fn record_observation(channel: &'static str) {
        counter!("propagation_observations_total", "channel" => channel).increment(1);
    }

    /// Record an undecodable inbound payload.
    pub fn record_decode_error(channel: &'static str) {
        counter!("propagation_decode_errors_total", "channel" => channel).increment(1);
    }

    /// Record a failed authoritative re-read.
    pub fn record_poll_error() {
        counter!("propagation_poll_errors_total").increment(1);
    }
}

/// Client session metrics recorder.
pub struct SessionMetrics;

impl SessionMetrics {
    /// Record a mutation admitted by the busy gate.
    pub fn record_mutation(kind: &'static str) {
        counter!("session_mutations_total", "kind" => kind).increment(1);
    }

    /// Record a dropped mutation intent.
    pub fn record_ignored(reason: &'static str) {
        counter!("session_mutations_ignored_total", "reason" => reason).increment(1);
    }

    /// Record a failed commit.
    pub fn record_commit_failure(stage: &'static str) {
        counter!("session_commit_failures_total", "stage" => stage).increment(1);
    }

    /// Record an undo outcome.
    pub fn record_undo(outcome: &'static str) {
        counter!("session_undo_total", "outcome" => outcome).increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn new_server_has_no_handle() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn start_then_record() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();

        PropagationMetrics::record_publish(Duration::from_millis(3));
        PropagationMetrics::record_observation("poll");
        PersistenceMetrics::record_operation("write", Duration::from_millis(1));
        SessionMetrics::record_mutation("increment");

        // Another test may already own the global recorder.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("propagation_broadcasts_published_total"));
            assert!(rendered.contains("session_mutations_total"));
        }
    }
}
