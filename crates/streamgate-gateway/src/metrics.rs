//! Prometheus Metrics for Streamgate Gateway
//!
//! Exports metrics for:
//! - WebSocket session lifecycle
//! - Streamed query outcomes and throughput
//! - Protocol errors from clients
//! - Synchronous HTTP queries and bulk transfers

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, register_int_gauge,
    CounterVec, Encoder, HistogramVec, IntCounter, IntGauge, TextEncoder,
};

// ═══════════════════════════════════════════════════════════════════════════
// SESSION METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Open WebSocket sessions
pub static ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "streamgate_active_sessions",
        "Number of open WebSocket streaming sessions"
    )
    .unwrap()
});

/// Inbound frames rejected as malformed or of unknown type
pub static PROTOCOL_ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "streamgate_protocol_errors_total",
        "Inbound messages rejected by the protocol dispatcher",
        &["kind"]
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════
// STREAMED QUERY METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Streamed queries by terminal status (completed, cancelled, errored)
pub static STREAMED_QUERIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "streamgate_streamed_queries_total",
        "Streamed queries by terminal status",
        &["status"]
    )
    .unwrap()
});

/// Data rows pushed to WebSocket clients
pub static ROWS_STREAMED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "streamgate_rows_streamed_total",
        "Total data rows streamed to WebSocket clients"
    )
    .unwrap()
});

/// Query duration by surface and status
pub static QUERY_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "streamgate_query_duration_seconds",
        "Query duration in seconds",
        &["surface", "status"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════
// HTTP METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Synchronous HTTP queries by status
pub static HTTP_QUERIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "streamgate_http_queries_total",
        "Synchronous HTTP queries by status",
        &["status"]
    )
    .unwrap()
});

/// Bulk CSV transfers by direction and status
pub static TRANSFERS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "streamgate_transfers_total",
        "Bulk CSV transfers by direction and status",
        &["direction", "status"]
    )
    .unwrap()
});

pub fn init_metrics() {
    // Touch all lazy statics to register them
    let _ = &*ACTIVE_SESSIONS;
    let _ = &*PROTOCOL_ERRORS_TOTAL;
    let _ = &*STREAMED_QUERIES_TOTAL;
    let _ = &*ROWS_STREAMED_TOTAL;
    let _ = &*QUERY_DURATION_SECONDS;
    let _ = &*HTTP_QUERIES_TOTAL;
    let _ = &*TRANSFERS_TOTAL;

    ACTIVE_SESSIONS.set(0);
    for status in ["completed", "cancelled", "errored"] {
        STREAMED_QUERIES_TOTAL.with_label_values(&[status]).inc_by(0.0);
    }
}

pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn session_opened() {
    ACTIVE_SESSIONS.inc();
}

pub fn session_closed() {
    ACTIVE_SESSIONS.dec();
}

pub fn record_protocol_error(kind: &str) {
    PROTOCOL_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_rows_streamed(rows: u64) {
    ROWS_STREAMED_TOTAL.inc_by(rows);
}

pub fn record_streamed_query(status: &str, duration_secs: f64) {
    STREAMED_QUERIES_TOTAL.with_label_values(&[status]).inc();
    QUERY_DURATION_SECONDS
        .with_label_values(&["websocket", status])
        .observe(duration_secs);
}

pub fn record_http_query(status: &str, duration_secs: f64) {
    HTTP_QUERIES_TOTAL.with_label_values(&[status]).inc();
    QUERY_DURATION_SECONDS
        .with_label_values(&["http", status])
        .observe(duration_secs);
}

pub fn record_transfer(direction: &str, status: &str) {
    TRANSFERS_TOTAL.with_label_values(&[direction, status]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_registered_metrics() {
        init_metrics();
        record_streamed_query("completed", 0.02);
        let text = encode_metrics();
        assert!(text.contains("streamgate_streamed_queries_total"));
        assert!(text.contains("streamgate_active_sessions"));
    }
}
