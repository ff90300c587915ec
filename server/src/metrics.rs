//! Prometheus metrics for the speedtest server

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};

// ── Data plane ───────────────────────────────────────────────────────────────

pub static HTTP_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "speedtest_http_requests_total",
        "HTTP requests received by route",
        &["route"]
    )
    .unwrap()
});

pub static DOWNLOAD_BYTES: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "speedtest_download_bytes_total",
        "Payload bytes handed to download clients"
    )
    .unwrap()
});

pub static UPLOAD_BYTES: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "speedtest_upload_bytes_total",
        "Upload bytes received and discarded"
    )
    .unwrap()
});

pub static TRANSFERS_INTERRUPTED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "speedtest_transfers_interrupted_total",
        "Transfers cut short by the client",
        &["direction"]
    )
    .unwrap()
});

// ── Telemetry storage ────────────────────────────────────────────────────────

pub static TELEMETRY_INSERT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "speedtest_telemetry_insert_total",
        "Telemetry insert attempts",
        &["status"]
    )
    .unwrap()
});

pub static STORE_OP_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "speedtest_store_operation_duration_seconds",
        "Telemetry store operation latency",
        &["op"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5]
    )
    .unwrap()
});

pub static MEMORY_STORE_RECORDS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "speedtest_memory_store_records",
        "Records currently held by the in-memory store"
    )
    .unwrap()
});

pub static MEMORY_STORE_EVICTIONS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "speedtest_memory_store_evictions_total",
        "Records dropped from the in-memory store due to capacity"
    )
    .unwrap()
});

// ── IP lookups ───────────────────────────────────────────────────────────────

pub static IP_LOOKUPS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "speedtest_ip_lookups_total",
        "External IP lookups by outcome",
        &["result"]
    )
    .unwrap()
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
