//! Prometheus metrics for the basket engine.
//!
//! Tracks request capture, forwarding and script execution activity.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

lazy_static! {
    /// Total number of requests captured into baskets
    pub static ref REQUESTS_CAPTURED_TOTAL: CounterVec = register_counter_vec!(
        "hamper_requests_captured_total",
        "Total number of requests captured into baskets",
        &["method"]
    )
    .unwrap();

    /// Forward attempts by outcome
    pub static ref FORWARDS_TOTAL: CounterVec = register_counter_vec!(
        "hamper_forwards_total",
        "Total number of forward attempts",
        &["result"]  // result: ok|error|skipped
    )
    .unwrap();

    /// Upstream request duration (successful forwards only)
    pub static ref UPSTREAM_REQUEST_DURATION_MS: HistogramVec = register_histogram_vec!(
        "hamper_upstream_request_duration_ms",
        "Duration of forwarded upstream requests in milliseconds",
        &["method", "status"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]
    )
    .unwrap();

    /// Script evaluations by outcome
    pub static ref SCRIPT_EVALUATIONS_TOTAL: CounterVec = register_counter_vec!(
        "hamper_script_evaluations_total",
        "Total number of response script evaluations",
        &["result"]  // result: ok|error|timeout
    )
    .unwrap();

    /// Ring evictions caused by capacity overflow
    pub static ref EVICTIONS_TOTAL: CounterVec = register_counter_vec!(
        "hamper_evictions_total",
        "Total number of requests evicted from basket rings",
        &["reason"]  // reason: overflow|shrink
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Helper to record a captured request
pub fn record_capture(method: &str) {
    REQUESTS_CAPTURED_TOTAL.with_label_values(&[method]).inc();
}

/// Helper to record a forward attempt outcome
pub fn record_forward(result: &str) {
    FORWARDS_TOTAL.with_label_values(&[result]).inc();
}

/// Helper to record upstream request duration
pub fn observe_upstream_duration(method: &str, status: u16, duration_ms: f64) {
    UPSTREAM_REQUEST_DURATION_MS
        .with_label_values(&[method, &status.to_string()])
        .observe(duration_ms);
}

/// Helper to record a script evaluation outcome
pub fn record_script_evaluation(result: &str) {
    SCRIPT_EVALUATIONS_TOTAL.with_label_values(&[result]).inc();
}

/// Helper to record a ring eviction
pub fn record_eviction(reason: &str) {
    EVICTIONS_TOTAL.with_label_values(&[reason]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collection() {
        record_capture("GET");
        record_forward("ok");
        record_forward("skipped");
        observe_upstream_duration("GET", 200, 12.5);

        let metrics = collect_metrics();
        assert!(metrics.contains("hamper_requests_captured_total"));
        assert!(metrics.contains("hamper_forwards_total"));
        assert!(metrics.contains("hamper_upstream_request_duration_ms"));
    }

    #[test]
    fn test_script_and_eviction_metrics() {
        record_script_evaluation("ok");
        record_script_evaluation("timeout");
        record_eviction("overflow");
        record_eviction("shrink");

        let metrics = collect_metrics();
        assert!(metrics.contains("hamper_script_evaluations_total"));
        assert!(metrics.contains("hamper_evictions_total"));
    }
}
