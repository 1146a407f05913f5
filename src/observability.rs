use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total HTTP requests handled. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "turfbook_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "turfbook_http_request_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: reservations committed.
pub const RESERVATIONS_COMMITTED_TOTAL: &str = "turfbook_reservations_committed_total";

/// Counter: proposals rejected because the range was already taken.
pub const SLOT_CONFLICTS_TOTAL: &str = "turfbook_slot_conflicts_total";

/// Counter: payment proofs that failed verification.
pub const SIGNATURE_MISMATCHES_TOTAL: &str = "turfbook_signature_mismatches_total";

/// Counter: commit attempts aborted by the store and retried.
pub const COMMIT_RETRIES_TOTAL: &str = "turfbook_commit_retries_total";

/// Counter: bookings cancelled.
pub const CANCELLATIONS_TOTAL: &str = "turfbook_cancellations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "turfbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "turfbook_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "turfbook_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus metrics exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
