//! Prometheus Metrics Module
//!
//! Exposes bridge metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Upstream**: Deribit connection state and inbound frame counts
//! - **Broker**: Live local sessions
//! - **Routing**: Events delivered to sessions and subscription entries
//! - **Pipeline**: Trading request outcomes, latency and queue depth
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if another global recorder is already installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
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
    // Upstream
    describe_gauge!(
        "deribit_bridge_upstream_connected",
        "1 while the Deribit WebSocket is open"
    );
    describe_counter!(
        "deribit_bridge_upstream_frames_total",
        "Total frames received from Deribit"
    );

    // Broker
    describe_gauge!(
        "deribit_bridge_live_sessions",
        "Number of connected local clients"
    );

    describe_counter!(
        "deribit_bridge_session_messages_dropped_total",
        "Total payloads dropped because a session's send queue was full"
    );

    // Routing
    describe_counter!(
        "deribit_bridge_events_routed_total",
        "Total event payloads delivered to local sessions"
    );
    describe_gauge!(
        "deribit_bridge_subscription_entries",
        "Number of subscription entries held by the router"
    );

    // Pipeline
    describe_counter!(
        "deribit_bridge_pipeline_requests_total",
        "Total trading API requests by outcome"
    );
    describe_counter!(
        "deribit_bridge_pipeline_reauthentications_total",
        "Total token refreshes performed by the pipeline"
    );
    describe_gauge!(
        "deribit_bridge_pipeline_queue_depth",
        "Requests waiting in the pipeline queue"
    );
    describe_histogram!(
        "deribit_bridge_pipeline_request_seconds",
        "Time from enqueue to completion of a trading API request"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for pipeline requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Deribit returned a result.
    Success,
    /// Deribit returned a JSON-RPC error.
    Rejected,
    /// Transport, authentication or encoding failure.
    Failed,
}

impl RequestOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

/// Update the upstream connection gauge.
pub fn set_upstream_connected(connected: bool) {
    gauge!("deribit_bridge_upstream_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record a frame received from Deribit.
pub fn record_upstream_frame() {
    counter!("deribit_bridge_upstream_frames_total").increment(1);
}

/// Update the live session gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_live_sessions(count: usize) {
    gauge!("deribit_bridge_live_sessions").set(count as f64);
}

/// Record a payload dropped on a full session queue.
pub fn record_session_message_dropped() {
    counter!("deribit_bridge_session_messages_dropped_total").increment(1);
}

/// Record event payloads delivered to sessions.
pub fn record_events_routed(count: u64) {
    counter!("deribit_bridge_events_routed_total").increment(count);
}

/// Update the subscription entry gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscription_entries(count: usize) {
    gauge!("deribit_bridge_subscription_entries").set(count as f64);
}

/// Record a completed pipeline request.
pub fn record_pipeline_request(outcome: RequestOutcome, elapsed: Duration) {
    counter!(
        "deribit_bridge_pipeline_requests_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
    histogram!(
        "deribit_bridge_pipeline_request_seconds",
        "outcome" => outcome.as_str()
    )
    .record(elapsed.as_secs_f64());
}

/// Record a token refresh.
pub fn record_reauthentication() {
    counter!("deribit_bridge_pipeline_reauthentications_total").increment(1);
}

/// Update the pipeline queue depth gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_pipeline_queue_depth(depth: usize) {
    gauge!("deribit_bridge_pipeline_queue_depth").set(depth as f64);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_outcome_as_str() {
        assert_eq!(RequestOutcome::Success.as_str(), "success");
        assert_eq!(RequestOutcome::Rejected.as_str(), "rejected");
        assert_eq!(RequestOutcome::Failed.as_str(), "failed");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        set_upstream_connected(true);
        record_upstream_frame();
        set_live_sessions(3);
        record_pipeline_request(RequestOutcome::Success, Duration::from_millis(5));
    }
}
