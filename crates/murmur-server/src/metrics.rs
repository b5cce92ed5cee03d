//! Prometheus metrics for the Murmur server.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "murmur_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "murmur_sessions_active";
    pub const MESSAGES_TOTAL: &str = "murmur_messages_total";
    pub const POLLS_TOTAL: &str = "murmur_polls_total";
    pub const POLL_SECONDS: &str = "murmur_poll_seconds";
    pub const UPLOAD_BYTES: &str = "murmur_upload_bytes";
    pub const ROOMS_ACTIVE: &str = "murmur_rooms_active";
    pub const ERRORS_TOTAL: &str = "murmur_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SESSIONS_TOTAL,
        "Total number of sessions opened since server start"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of live sessions");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Client messages processed, by type");
    metrics::describe_counter!(names::POLLS_TOTAL, "Completed long polls, by outcome");
    metrics::describe_histogram!(names::POLL_SECONDS, "Time a long poll was held open");
    metrics::describe_counter!(
        names::UPLOAD_BYTES,
        "Uploaded bytes, split by whether they were written or deduplicated"
    );
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of public rooms");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of request errors");

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

/// Record a client message.
pub fn record_message(kind: &str) {
    counter!(names::MESSAGES_TOTAL, "type" => kind.to_string()).increment(1);
}

/// Record a completed poll and how long it was held.
pub fn record_poll(outcome: &str, seconds: f64) {
    counter!(names::POLLS_TOTAL, "outcome" => outcome.to_string()).increment(1);
    histogram!(names::POLL_SECONDS).record(seconds);
}

/// Record uploaded bytes.
pub fn record_upload(bytes: u64, cached: bool) {
    let state = if cached { "cached" } else { "stored" };
    counter!(names::UPLOAD_BYTES, "state" => state).increment(bytes);
}

/// Update the public room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Counts a session as live until dropped.
pub struct SessionMetricsGuard;

impl SessionMetricsGuard {
    /// Create a new metrics guard, recording a session.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::SESSIONS_TOTAL).increment(1);
        gauge!(names::SESSIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for SessionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; the calls are no-ops
        let _guard = SessionMetricsGuard::new();
    }

    #[test]
    fn test_record_helpers() {
        record_message("room.message");
        record_poll("messages", 0.25);
        record_upload(1024, false);
        record_upload(1024, true);
        set_active_rooms(3);
        record_error("session_not_found");
    }
}
