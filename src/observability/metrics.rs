//! Metrics collection and exposition.
//!
//! # Metrics
//! - `deferred_tasks_registered_total` (counter)
//! - `deferred_tasks_settled_total` (counter): by outcome (ok, failed, abandoned)
//! - `deferred_tasks_outstanding` (gauge)
//! - `shutdown_signals_total` (counter): by signal and receipt
//! - `shutdown_drain_duration_seconds` (histogram): by drain outcome
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - The Prometheus exporter is optional and off by default

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_task_registered() {
    counter!("deferred_tasks_registered_total").increment(1);
}

pub fn record_task_settled(outcome: &'static str) {
    counter!("deferred_tasks_settled_total", "outcome" => outcome).increment(1);
}

pub fn set_outstanding_tasks(count: usize) {
    gauge!("deferred_tasks_outstanding").set(count as f64);
}

pub fn record_signal(signal: &'static str, receipt: &'static str) {
    counter!("shutdown_signals_total", "signal" => signal, "receipt" => receipt).increment(1);
}

pub fn record_drain(outcome: &'static str, elapsed: Duration) {
    histogram!("shutdown_drain_duration_seconds", "outcome" => outcome).record(elapsed.as_secs_f64());
}
