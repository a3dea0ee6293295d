//! Metrics collection and export for Relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use bytes::Bytes;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::{HubStats, PublishError, Publisher};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const CONNECTIONS_CLOSED: &str = "relay_connections_closed_total";
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const MESSAGES_BYTES: &str = "relay_messages_bytes";
    pub const PUBLISH_FAILURES: &str = "relay_publish_failures_total";
    pub const PUBLISH_SECONDS: &str = "relay_publish_seconds";
    pub const HUB_CLIENTS: &str = "relay_hub_clients";
    pub const HUB_SLOW_CLIENTS: &str = "relay_hub_slow_clients_total";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_CLOSED,
        "Closed connections by reason"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages by direction");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages by direction");
    metrics::describe_counter!(names::PUBLISH_FAILURES, "Failed broker publishes by kind");
    metrics::describe_histogram!(names::PUBLISH_SECONDS, "Broker publish latency in seconds");
    metrics::describe_gauge!(names::HUB_CLIENTS, "Clients registered with the hub");
    metrics::describe_counter!(
        names::HUB_SLOW_CLIENTS,
        "Clients disconnected for a full outbound queue"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record why a connection closed.
pub fn record_close(reason: &'static str) {
    counter!(names::CONNECTIONS_CLOSED, "reason" => reason).increment(1);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a failed publish.
pub fn record_publish_failure(error: &PublishError) {
    let kind = if error.is_retryable() { "retryable" } else { "fatal" };
    counter!(names::PUBLISH_FAILURES, "kind" => kind).increment(1);
}

/// Mirror hub counters.
pub fn record_hub_stats(stats: &HubStats) {
    gauge!(names::HUB_CLIENTS).set(stats.client_count as f64);
    counter!(names::MESSAGES_TOTAL, "direction" => "delivered").absolute(stats.delivered);
    counter!(names::HUB_SLOW_CLIENTS).absolute(stats.slow_clients_dropped);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

/// Publisher decorator recording latency, volume and failures.
pub struct MeteredPublisher<P> {
    inner: P,
}

impl<P: Publisher> MeteredPublisher<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<P: Publisher> Publisher for MeteredPublisher<P> {
    async fn publish(&self, payload: Bytes) -> Result<(), PublishError> {
        let size = payload.len();
        let start = Instant::now();
        let result = self.inner.publish(payload).await;
        histogram!(names::PUBLISH_SECONDS).record(start.elapsed().as_secs_f64());

        match &result {
            Ok(()) => record_message(size, "published"),
            Err(e) => record_publish_failure(e),
        }
        result
    }
}
