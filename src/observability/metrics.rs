//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define agent metrics (queries, provider failures, buffers, sessions)
//! - Expose a Prometheus-compatible scrape endpoint when enabled
//!
//! # Metrics
//! - `agent_queries_total` (counter): executed queries by outcome
//! - `agent_provider_errors_total` (counter): failed snapshot/poll calls by table
//! - `agent_buffered_rows` (gauge): rows held per event table
//! - `agent_session_transitions_total` (counter): session state changes by state
//! - `agent_established_sessions` (gauge): sessions currently established
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - The exporter runs on the background runtime, never on the control loop

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
///
/// Must be called from within a tokio runtime context.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Count one executed query. `outcome` is `ok` or a short error kind.
pub fn record_query(outcome: &'static str) {
    metrics::counter!("agent_queries_total", "outcome" => outcome).increment(1);
}

pub fn record_provider_error(table: &str) {
    metrics::counter!("agent_provider_errors_total", "table" => table.to_string()).increment(1);
}

pub fn record_buffered_rows(table: &str, rows: usize) {
    metrics::gauge!("agent_buffered_rows", "table" => table.to_string()).set(rows as f64);
}

pub fn record_session_transition(state: &'static str) {
    metrics::counter!("agent_session_transitions_total", "state" => state).increment(1);
}

pub fn record_established_sessions(count: usize) {
    metrics::gauge!("agent_established_sessions").set(count as f64);
}
