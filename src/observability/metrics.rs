//! Metrics collection and exposition.
//!
//! # Metrics
//! - `router_requests_total` (counter): dispatched requests by status
//! - `router_request_duration_seconds` (histogram): time to response headers
//! - `router_cold_starts_total` (counter): bootstrap invocations by outcome
//! - `router_frames_total` (counter): worker frames received by type
//! - `router_frames_dropped_total` (counter): frames dropped by reason
//! - `router_workers` (gauge): workers known to the registry

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(status: u16, start: Instant) {
    metrics::counter!("router_requests_total", "status" => status.to_string()).increment(1);
    metrics::histogram!("router_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_cold_start(outcome: &'static str) {
    metrics::counter!("router_cold_starts_total", "outcome" => outcome).increment(1);
}

pub fn record_frame(kind: &'static str) {
    metrics::counter!("router_frames_total", "type" => kind).increment(1);
}

pub fn record_frame_dropped(reason: &'static str) {
    metrics::counter!("router_frames_dropped_total", "reason" => reason).increment(1);
}

pub fn record_workers(count: usize) {
    metrics::gauge!("router_workers").set(count as f64);
}
