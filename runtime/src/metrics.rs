//! Prometheus metrics.
//!
//! Every component records through the `metrics` facade; nothing is exported
//! until an application installs a recorder, for example with
//! [`MetricsServer`]:
//!
//! - `shardlink_requests_total{kind,outcome}`
//! - `shardlink_request_duration_seconds{kind}`
//! - `shardlink_late_replies_total`
//! - `shardlink_events_received_total`
//! - `shardlink_event_decode_failures_total`
//! - `shardlink_channel_recoveries_total`
//!
//! # Example
//!
//! ```rust,no_run
//! use shardlink_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Later, from your HTTP handler:
//! let body = server.render().unwrap_or_default();
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

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

/// Installs the Prometheus recorder and renders scrapes.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server that will be advertised at `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe every metric and install the recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// A recorder that is already installed is not an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let message = e.to_string();
                if message.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping");
                    Ok(())
                } else {
                    Err(MetricsError::Install(message))
                }
            },
        }
    }

    /// The installed handle, if this server installed the recorder.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in the Prometheus text format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "shardlink_requests_total",
        "Requests dispatched, by kind and outcome"
    );
    describe_histogram!(
        "shardlink_request_duration_seconds",
        "Time from publish to classified outcome"
    );
    describe_counter!(
        "shardlink_late_replies_total",
        "Replies that arrived after their request was abandoned"
    );
    describe_counter!(
        "shardlink_events_received_total",
        "Broadcast events decoded and forwarded"
    );
    describe_counter!(
        "shardlink_event_decode_failures_total",
        "Broadcast deliveries dropped because they could not be decoded"
    );
    describe_counter!(
        "shardlink_channel_recoveries_total",
        "Explicit channel recoveries"
    );
}

/// Request path metrics.
pub struct RequestMetrics;

impl RequestMetrics {
    /// Record one finished request.
    pub fn record(kind: &'static str, outcome: &'static str, elapsed: Duration) {
        counter!("shardlink_requests_total", "kind" => kind, "outcome" => outcome).increment(1);
        histogram!("shardlink_request_duration_seconds", "kind" => kind)
            .record(elapsed.as_secs_f64());
    }
}

/// Consumer metrics.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// A reply found no waiting request.
    pub fn record_late_reply() {
        counter!("shardlink_late_replies_total").increment(1);
    }

    /// An event was forwarded.
    pub fn record_event() {
        counter!("shardlink_events_received_total").increment(1);
    }

    /// An event delivery could not be decoded.
    pub fn record_event_decode_failure() {
        counter!("shardlink_event_decode_failures_total").increment(1);
    }
}

/// Connection metrics.
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    /// The channel was recreated on request.
    pub fn record_recovery() {
        counter!("shardlink_channel_recoveries_total").increment(1);
    }
}
