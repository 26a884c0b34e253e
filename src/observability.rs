use std::net::SocketAddr;

// ── Sync / ingest metrics ───────────────────────────────────────

/// Counter: feed sync passes started.
pub const SYNC_RUNS_TOTAL: &str = "roomsync_sync_runs_total";

/// Counter: whole-feed failures (fetch error, timeout, unparsable document).
pub const FEED_FAILURES_TOTAL: &str = "roomsync_feed_failures_total";

/// Counter: normalized events handed to the reconciler.
pub const EVENTS_INGESTED_TOTAL: &str = "roomsync_events_ingested_total";

/// Counter: malformed single events skipped by the parser.
pub const EVENTS_SKIPPED_TOTAL: &str = "roomsync_events_skipped_total";

/// Counter: reservations created from channel events.
pub const RESERVATIONS_CREATED_TOTAL: &str = "roomsync_reservations_created_total";

/// Counter: events routed to the unassigned inbox.
pub const INBOX_ROUTED_TOTAL: &str = "roomsync_inbox_routed_total";

/// Counter: writes rejected by the conflict guard.
pub const CONFLICTS_REJECTED_TOTAL: &str = "roomsync_conflicts_rejected_total";

// ── Hold lifecycle metrics ──────────────────────────────────────

/// Counter: placeholders promoted by a confirming channel event.
pub const HOLDS_PROMOTED_TOTAL: &str = "roomsync_holds_promoted_total";

/// Counter: placeholders expired by the sweep.
pub const HOLDS_EXPIRED_TOTAL: &str = "roomsync_holds_expired_total";

/// Counter: placeholder/confirmed pairs merged.
pub const MERGES_TOTAL: &str = "roomsync_merges_total";

// ── Journal metrics ─────────────────────────────────────────────

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "roomsync_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "roomsync_journal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
