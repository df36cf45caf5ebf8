#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

// Connection lifecycle
pub static CONNECTIONS_ACTIVE: AtomicU64 = AtomicU64::new(0);
pub static CONNECTIONS_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static ACTIVE_CONNECTS: AtomicU64 = AtomicU64::new(0);
pub static PASSIVE_CONNECTS: AtomicU64 = AtomicU64::new(0);
pub static GRACEFUL_DISCONNECTS: AtomicU64 = AtomicU64::new(0);
pub static ABNORMAL_DISCONNECTS: AtomicU64 = AtomicU64::new(0);
pub static WRITER_ABORTS: AtomicU64 = AtomicU64::new(0);

// Request path
pub static REQUESTS_DISPATCHED: AtomicU64 = AtomicU64::new(0);
pub static RESPONSES_SENT: AtomicU64 = AtomicU64::new(0);
pub static PUSHES_SENT: AtomicU64 = AtomicU64::new(0);
pub static PROTOCOL_ERRORS: AtomicU64 = AtomicU64::new(0);
pub static CRC_FAILURES: AtomicU64 = AtomicU64::new(0);
pub static UPSTREAM_ERRORS: AtomicU64 = AtomicU64::new(0);
pub static RESPONDER_IN_FLIGHT: AtomicU64 = AtomicU64::new(0);

// Log-prior fan-out
pub static LOG_PRIOR_LISTS_RECEIVED: AtomicU64 = AtomicU64::new(0);
pub static LOG_PRIOR_BYTES_RECEIVED: AtomicU64 = AtomicU64::new(0);
pub static SINKS_REGISTERED: AtomicU64 = AtomicU64::new(0);
pub static BROADCASTS: AtomicU64 = AtomicU64::new(0);
pub static SINK_DELIVERIES: AtomicU64 = AtomicU64::new(0);
pub static SINK_FAILURES: AtomicU64 = AtomicU64::new(0);

// Replication
pub static REPLICATED_ENTRIES: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn increment_connections() {
    CONNECTIONS_ACTIVE.fetch_add(1, Ordering::Relaxed);
    CONNECTIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn decrement_connections() {
    CONNECTIONS_ACTIVE.fetch_sub(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_active_connects() {
    ACTIVE_CONNECTS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_passive_connects() {
    PASSIVE_CONNECTS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_graceful_disconnects() {
    GRACEFUL_DISCONNECTS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_abnormal_disconnects() {
    ABNORMAL_DISCONNECTS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_writer_aborts() {
    WRITER_ABORTS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_requests_dispatched() {
    REQUESTS_DISPATCHED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_responses_sent() {
    RESPONSES_SENT.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_pushes_sent() {
    PUSHES_SENT.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_protocol_errors() {
    PROTOCOL_ERRORS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_crc_failures() {
    CRC_FAILURES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_upstream_errors() {
    UPSTREAM_ERRORS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_responder_in_flight() {
    RESPONDER_IN_FLIGHT.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn decrement_responder_in_flight() {
    RESPONDER_IN_FLIGHT.fetch_sub(1, Ordering::Relaxed);
}

/// Record one log-prior list received from the active transaction server.
#[inline]
pub fn record_log_prior_received(bytes: u64) {
    LOG_PRIOR_LISTS_RECEIVED.fetch_add(1, Ordering::Relaxed);
    LOG_PRIOR_BYTES_RECEIVED.fetch_add(bytes, Ordering::Relaxed);
}

#[inline]
pub fn increment_sinks_registered() {
    SINKS_REGISTERED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn decrement_sinks_registered() {
    SINKS_REGISTERED.fetch_sub(1, Ordering::Relaxed);
}

/// Record a completed broadcast and how many sinks it reached.
#[inline]
pub fn record_broadcast(delivered: u64, failed: u64) {
    BROADCASTS.fetch_add(1, Ordering::Relaxed);
    SINK_DELIVERIES.fetch_add(delivered, Ordering::Relaxed);
    SINK_FAILURES.fetch_add(failed, Ordering::Relaxed);
}

#[inline]
pub fn increment_replicated_entries(count: u64) {
    REPLICATED_ENTRIES.fetch_add(count, Ordering::Relaxed);
}

pub struct MetricsSnapshot {
    pub connections_active: u64,
    pub connections_total: u64,
    pub active_connects: u64,
    pub passive_connects: u64,
    pub graceful_disconnects: u64,
    pub abnormal_disconnects: u64,
    pub writer_aborts: u64,
    // Request path
    pub requests_dispatched: u64,
    pub responses_sent: u64,
    pub pushes_sent: u64,
    pub protocol_errors: u64,
    pub crc_failures: u64,
    pub upstream_errors: u64,
    pub responder_in_flight: u64,
    // Fan-out
    pub log_prior_lists_received: u64,
    pub log_prior_bytes_received: u64,
    pub sinks_registered: u64,
    pub broadcasts: u64,
    pub sink_deliveries: u64,
    pub sink_failures: u64,
    // Replication
    pub replicated_entries: u64,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn capture() -> Self {
        Self {
            connections_active: CONNECTIONS_ACTIVE.load(Ordering::Relaxed),
            connections_total: CONNECTIONS_TOTAL.load(Ordering::Relaxed),
            active_connects: ACTIVE_CONNECTS.load(Ordering::Relaxed),
            passive_connects: PASSIVE_CONNECTS.load(Ordering::Relaxed),
            graceful_disconnects: GRACEFUL_DISCONNECTS.load(Ordering::Relaxed),
            abnormal_disconnects: ABNORMAL_DISCONNECTS.load(Ordering::Relaxed),
            writer_aborts: WRITER_ABORTS.load(Ordering::Relaxed),
            requests_dispatched: REQUESTS_DISPATCHED.load(Ordering::Relaxed),
            responses_sent: RESPONSES_SENT.load(Ordering::Relaxed),
            pushes_sent: PUSHES_SENT.load(Ordering::Relaxed),
            protocol_errors: PROTOCOL_ERRORS.load(Ordering::Relaxed),
            crc_failures: CRC_FAILURES.load(Ordering::Relaxed),
            upstream_errors: UPSTREAM_ERRORS.load(Ordering::Relaxed),
            responder_in_flight: RESPONDER_IN_FLIGHT.load(Ordering::Relaxed),
            log_prior_lists_received: LOG_PRIOR_LISTS_RECEIVED.load(Ordering::Relaxed),
            log_prior_bytes_received: LOG_PRIOR_BYTES_RECEIVED.load(Ordering::Relaxed),
            sinks_registered: SINKS_REGISTERED.load(Ordering::Relaxed),
            broadcasts: BROADCASTS.load(Ordering::Relaxed),
            sink_deliveries: SINK_DELIVERIES.load(Ordering::Relaxed),
            sink_failures: SINK_FAILURES.load(Ordering::Relaxed),
            replicated_entries: REPLICATED_ENTRIES.load(Ordering::Relaxed),
        }
    }
}

pub fn init_prometheus_exporter(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    builder.with_http_listener(addr).install()?;

    metrics::describe_gauge!(
        "pageserver_connections_active",
        "Current number of transaction server connections"
    );
    metrics::describe_counter!(
        "pageserver_connections_total",
        "Total transaction server connections ever established"
    );
    metrics::describe_counter!(
        "pageserver_active_connects_total",
        "Active transaction server connections established"
    );
    metrics::describe_counter!(
        "pageserver_passive_connects_total",
        "Passive transaction server connections established"
    );
    metrics::describe_counter!(
        "pageserver_graceful_disconnects_total",
        "Disconnects requested by the transaction server"
    );
    metrics::describe_counter!(
        "pageserver_abnormal_disconnects_total",
        "Disconnects caused by transport failures"
    );
    metrics::describe_counter!(
        "pageserver_writer_aborts_total",
        "Channel writers aborted while flushing to a peer that stopped reading"
    );

    // Request path
    metrics::describe_counter!(
        "pageserver_requests_dispatched_total",
        "Requests routed through a dispatch table"
    );
    metrics::describe_counter!("pageserver_responses_sent_total", "Responses sent");
    metrics::describe_counter!(
        "pageserver_pushes_sent_total",
        "Unsolicited messages pushed to transaction servers"
    );
    metrics::describe_counter!(
        "pageserver_protocol_errors_total",
        "Unknown or role-mismatched requests"
    );
    metrics::describe_counter!("pageserver_crc_failures_total", "Frame CRC failures");
    metrics::describe_counter!(
        "pageserver_upstream_errors_total",
        "Storage collaborator failures reported to requesters"
    );
    metrics::describe_gauge!(
        "pageserver_responder_in_flight",
        "Requests currently executing on the async responder"
    );

    // Fan-out
    metrics::describe_counter!(
        "pageserver_log_prior_lists_received_total",
        "Log-prior lists received from the active transaction server"
    );
    metrics::describe_counter!(
        "pageserver_log_prior_bytes_received_total",
        "Log-prior bytes received from the active transaction server"
    );
    metrics::describe_gauge!(
        "pageserver_sinks_registered",
        "Passive transaction servers subscribed to log-prior fan-out"
    );
    metrics::describe_counter!("pageserver_broadcasts_total", "Log-prior broadcasts");
    metrics::describe_counter!(
        "pageserver_sink_deliveries_total",
        "Log-prior chunks delivered to sinks"
    );
    metrics::describe_counter!(
        "pageserver_sink_failures_total",
        "Failed log-prior deliveries"
    );

    metrics::describe_counter!(
        "pageserver_replicated_entries_total",
        "Log-prior chunks applied by the replicator"
    );

    Ok(())
}

pub fn export_to_prometheus() {
    let snapshot = MetricsSnapshot::capture();

    metrics::gauge!("pageserver_connections_active").set(snapshot.connections_active as f64);
    metrics::counter!("pageserver_connections_total").absolute(snapshot.connections_total);
    metrics::counter!("pageserver_active_connects_total").absolute(snapshot.active_connects);
    metrics::counter!("pageserver_passive_connects_total").absolute(snapshot.passive_connects);
    metrics::counter!("pageserver_graceful_disconnects_total")
        .absolute(snapshot.graceful_disconnects);
    metrics::counter!("pageserver_abnormal_disconnects_total")
        .absolute(snapshot.abnormal_disconnects);
    metrics::counter!("pageserver_writer_aborts_total").absolute(snapshot.writer_aborts);

    metrics::counter!("pageserver_requests_dispatched_total")
        .absolute(snapshot.requests_dispatched);
    metrics::counter!("pageserver_responses_sent_total").absolute(snapshot.responses_sent);
    metrics::counter!("pageserver_pushes_sent_total").absolute(snapshot.pushes_sent);
    metrics::counter!("pageserver_protocol_errors_total").absolute(snapshot.protocol_errors);
    metrics::counter!("pageserver_crc_failures_total").absolute(snapshot.crc_failures);
    metrics::counter!("pageserver_upstream_errors_total").absolute(snapshot.upstream_errors);
    metrics::gauge!("pageserver_responder_in_flight").set(snapshot.responder_in_flight as f64);

    metrics::counter!("pageserver_log_prior_lists_received_total")
        .absolute(snapshot.log_prior_lists_received);
    metrics::counter!("pageserver_log_prior_bytes_received_total")
        .absolute(snapshot.log_prior_bytes_received);
    metrics::gauge!("pageserver_sinks_registered").set(snapshot.sinks_registered as f64);
    metrics::counter!("pageserver_broadcasts_total").absolute(snapshot.broadcasts);
    metrics::counter!("pageserver_sink_deliveries_total").absolute(snapshot.sink_deliveries);
    metrics::counter!("pageserver_sink_failures_total").absolute(snapshot.sink_failures);

    metrics::counter!("pageserver_replicated_entries_total")
        .absolute(snapshot.replicated_entries);
}
