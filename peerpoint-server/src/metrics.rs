//! Prometheus metrics for the relay.
//!
//! Provides metrics collection and a Prometheus-compatible `/metrics` endpoint.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// Metric names as constants for consistency
const SESSIONS_ACTIVE: &str = "peerpoint_sessions_active";
const CONTROL_MESSAGES_TOTAL: &str = "peerpoint_control_messages_total";
const SIGNALING_MESSAGES_TOTAL: &str = "peerpoint_signaling_messages_total";
const MALFORMED_PAYLOADS_TOTAL: &str = "peerpoint_malformed_payloads_total";
const VALIDATION_FAILURES_TOTAL: &str = "peerpoint_validation_failures_total";
const RATE_LIMITED_TOTAL: &str = "peerpoint_rate_limited_total";
const DATA_MESSAGES_TOTAL: &str = "peerpoint_data_messages_total";
const SESSION_TEARDOWNS_TOTAL: &str = "peerpoint_session_teardowns_total";
const NEGOTIATION_OUTCOMES_TOTAL: &str = "peerpoint_negotiation_outcomes_total";

/// Initialize metrics and return the Prometheus handle.
///
/// # Errors
///
/// Returns an error if the Prometheus recorder cannot be installed
/// (e.g., if another recorder is already installed).
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Increment active sessions.
pub fn inc_sessions() {
    gauge!(SESSIONS_ACTIVE).increment(1.0);
}

/// Decrement active sessions.
pub fn dec_sessions() {
    gauge!(SESSIONS_ACTIVE).decrement(1.0);
}

/// Record a control-socket frame.
///
/// # Arguments
///
/// * `direction` - "inbound" or "outbound"
/// * `msg_type` - Frame type (signal, welcome, peer_joined, ...)
pub fn record_control_message(direction: &str, msg_type: &str) {
    counter!(
        CONTROL_MESSAGES_TOTAL,
        "direction" => direction.to_string(),
        "type" => msg_type.to_string()
    )
    .increment(1);
}

/// Record a signaling payload handled by the relay.
///
/// # Arguments
///
/// * `msg_type` - candidate, end_of_candidates or description
/// * `route` - "negotiator", "addressed" or "broadcast"
pub fn record_signaling_message(msg_type: &str, route: &str) {
    counter!(
        SIGNALING_MESSAGES_TOTAL,
        "type" => msg_type.to_string(),
        "route" => route.to_string()
    )
    .increment(1);
}

/// Record a payload that could not be decoded and was ignored.
///
/// # Arguments
///
/// * `channel` - "control" or "data"
pub fn record_malformed_payload(channel: &str) {
    counter!(
        MALFORMED_PAYLOADS_TOTAL,
        "channel" => channel.to_string()
    )
    .increment(1);
}

/// Record an input validation failure.
///
/// # Arguments
///
/// * `validation_type` - Type of validation that failed (client_id, sdp, ...)
pub fn record_validation_failure(validation_type: &str) {
    counter!(
        VALIDATION_FAILURES_TOTAL,
        "type" => validation_type.to_string()
    )
    .increment(1);
}

/// Record a rate-limited control message.
pub fn record_rate_limited(source: &str) {
    counter!(
        RATE_LIMITED_TOTAL,
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record a relayed data-channel message.
///
/// # Arguments
///
/// * `kind` - patches, snapshot, resync or opaque
/// * `recipients` - Channels the message was delivered to
pub fn record_data_message(kind: &str, recipients: usize) {
    counter!(
        DATA_MESSAGES_TOTAL,
        "kind" => kind.to_string()
    )
    .increment(1);
    counter!(DATA_MESSAGES_TOTAL, "kind" => "delivered").increment(recipients as u64);
}

/// Record why a session ended.
pub fn record_session_teardown(reason: &str) {
    counter!(
        SESSION_TEARDOWNS_TOTAL,
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record the outcome of an inbound signaling message in hub mode.
pub fn record_negotiation_outcome(outcome: &str) {
    counter!(
        NEGOTIATION_OUTCOMES_TOTAL,
        "outcome" => outcome.to_string()
    )
    .increment(1);
}
