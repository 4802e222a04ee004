//! Prometheus Metrics Module
//!
//! Exposes multiplexer metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Routing**: payloads routed to subscriptions, by feed
//! - **Pool**: live connection and subscription gauges
//! - **Failures**: transport errors and lost connections
//!
//! # Integration
//!
//! Metrics are rendered at `/metrics` on the health server port.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "hl_mux_messages_routed_total",
        "Payloads routed to subscriptions, by feed"
    );
    describe_counter!(
        "hl_mux_transport_errors_total",
        "Transport errors reported by connections"
    );
    describe_counter!(
        "hl_mux_connections_lost_total",
        "Connections that terminated while serving subscriptions"
    );

    describe_gauge!("hl_mux_connections", "Live connections in the pool");
    describe_gauge!("hl_mux_subscriptions", "Active subscriptions");
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record one payload routed to a subscription of `feed`.
pub fn record_message_routed(feed: &'static str) {
    counter!("hl_mux_messages_routed_total", "feed" => feed).increment(1);
}

/// Record a transport error.
pub fn record_transport_error() {
    counter!("hl_mux_transport_errors_total").increment(1);
}

/// Record a terminated connection.
pub fn record_connection_lost() {
    counter!("hl_mux_connections_lost_total").increment(1);
}

/// Update the live connection gauge.
pub fn set_connections(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("hl_mux_connections").set(count as f64);
}

/// Update the active subscription gauge.
pub fn set_subscriptions(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("hl_mux_subscriptions").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        // The metrics crate drops samples when no recorder is installed;
        // these must not panic in library users that skip init_metrics.
        record_message_routed("trades");
        record_transport_error();
        record_connection_lost();
        set_connections(3);
        set_subscriptions(7);
    }
}
