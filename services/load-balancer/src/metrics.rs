//! Prometheus metrics exposition
//!
//! - `balancer_requests_total` (counter): labels `status`, `method`
//! - `balancer_request_duration_seconds` (histogram): label `status`
//! - `balancer_backend_errors_total` (counter): label `backend`
//! - `balancer_healthy_backends` (gauge)

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "balancer_request_duration_seconds";

/// 5ms to 60s
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Request durations render as a histogram with `_bucket` lines rather than
/// the exporter's default summary.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("balancer_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "status" => status_str).record(duration_secs);
}

/// Record a transport-level failure against one backend.
pub fn record_backend_error(backend: &str) {
    metrics::counter!("balancer_backend_errors_total", "backend" => backend.to_string())
        .increment(1);
}

/// Publish the size of the current healthy set.
pub fn set_healthy_backends(count: usize) {
    metrics::gauge!("balancer_healthy_backends").set(count as f64);
}
