//! Metrics collection and exposition.
//!
//! # Metrics
//! - `client_hello_captures_total` (counter): capture outcomes by `outcome`
//! - `client_hello_cache_entries` (gauge): entries currently cached
//! - `client_hello_cache_evictions_total` (counter): capacity evictions
//! - `client_hello_lookups_total` (counter): lookups by `result` (hit/miss)
//! - `client_hello_active_connections` (gauge): open client connections
//!
//! Recording is a no-op until [`init_metrics`] installs the exporter.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with an HTTP scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_capture(outcome: &'static str) {
    metrics::counter!("client_hello_captures_total", "outcome" => outcome).increment(1);
}

pub fn record_cache_size(entries: usize) {
    metrics::gauge!("client_hello_cache_entries").set(entries as f64);
}

pub fn record_cache_eviction() {
    metrics::counter!("client_hello_cache_evictions_total").increment(1);
}

pub fn record_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    metrics::counter!("client_hello_lookups_total", "result" => result).increment(1);
}

pub fn record_active_connections(count: u64) {
    metrics::gauge!("client_hello_active_connections").set(count as f64);
}
