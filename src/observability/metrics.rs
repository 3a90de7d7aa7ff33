//! Metrics collection and exposition.
//!
//! # Metrics
//! - `webhost_connections_accepted_total` (counter)
//! - `webhost_connections_active` (gauge)
//! - `webhost_handshake_failures_total` (counter)
//! - `webhost_connection_errors_total` (counter): by error kind
//! - `webhost_requests_total` (counter): by method, status
//! - `webhost_request_duration_seconds` (histogram): by method
//! - `webhost_response_bytes_total` (counter)
//! - `webhost_streamed_bytes_total` (counter)
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;
use std::time::Duration;

use hyper::{Method, StatusCode};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::ErrorKind;

/// Install the Prometheus recorder and its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn connection_accepted() {
    counter!("webhost_connections_accepted_total").increment(1);
}

pub fn connection_opened() {
    gauge!("webhost_connections_active").increment(1.0);
}

pub fn connection_closed() {
    gauge!("webhost_connections_active").decrement(1.0);
}

pub fn handshake_failed() {
    counter!("webhost_handshake_failures_total").increment(1);
}

pub fn connection_error(kind: ErrorKind) {
    counter!("webhost_connection_errors_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_request(method: &Method, status: StatusCode, elapsed: Duration) {
    let method = method.as_str().to_owned();
    counter!(
        "webhost_requests_total",
        "method" => method.clone(),
        "status" => status.as_u16().to_string()
    )
    .increment(1);
    histogram!("webhost_request_duration_seconds", "method" => method).record(elapsed.as_secs_f64());
}

pub fn bytes_sent(bytes: usize) {
    counter!("webhost_response_bytes_total").increment(bytes as u64);
}

pub fn streamed_bytes(bytes: u64) {
    counter!("webhost_streamed_bytes_total").increment(bytes);
}
