//! Metrics collection and exposition.
//!
//! # Metrics
//! - `tunnel_sessions_active` (gauge): live client sessions
//! - `tunnel_proxies_registered_total` (counter): registrations by kind
//! - `tunnel_vhost_requests_total` (counter): vhost requests by method,
//!   status, proxy
//! - `tunnel_vhost_request_duration_seconds` (histogram): vhost latency
//! - `tunnel_tcp_splices_total` (counter): tcp proxy connections by outcome

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on `addr` and describe every metric.
/// Call once per process, from inside the runtime.
pub fn init_metrics(addr: SocketAddr) {
    if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
        tracing::error!(address = %addr, error = %e, "failed to install metrics exporter");
        return;
    }
    tracing::info!(address = %addr, "metrics endpoint started");

    describe_gauge!("tunnel_sessions_active", "Live client sessions");
    describe_counter!(
        "tunnel_proxies_registered_total",
        "Proxy registrations by kind"
    );
    describe_counter!(
        "tunnel_vhost_requests_total",
        "Vhost requests by method, status, and proxy"
    );
    describe_histogram!(
        "tunnel_vhost_request_duration_seconds",
        "Vhost request latency"
    );
    describe_counter!("tunnel_tcp_splices_total", "TCP proxy connections by outcome");
}

pub fn record_session_opened() {
    gauge!("tunnel_sessions_active").increment(1.0);
}

pub fn record_session_closed() {
    gauge!("tunnel_sessions_active").decrement(1.0);
}

pub fn record_proxy_registered(kind: &str) {
    counter!("tunnel_proxies_registered_total", "kind" => kind.to_string()).increment(1);
}

pub fn record_vhost_request(method: &str, status: u16, proxy: &str, started: Instant) {
    counter!(
        "tunnel_vhost_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string(),
        "proxy" => proxy.to_string(),
    )
    .increment(1);
    histogram!("tunnel_vhost_request_duration_seconds").record(started.elapsed().as_secs_f64());
}

pub fn record_tcp_splice(proxy: &str, ok: bool) {
    counter!(
        "tunnel_tcp_splices_total",
        "proxy" => proxy.to_string(),
        "outcome" => if ok { "ok" } else { "error" },
    )
    .increment(1);
}
