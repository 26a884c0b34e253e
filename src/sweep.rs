use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::documents::DocumentStore;
use crate::engine::Engine;
use crate::observability;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub merged: usize,
    pub ambiguous_merges: usize,
    pub inbox_resolved: usize,
}

/// Idempotent entry point for the soft-hold lifecycle job: expire overdue
/// placeholders, fold placeholders into confirmed stays, and retry inbox
/// entries whose ambiguity has cleared. Safe to run at any frequency; a pass
/// over an already-settled board changes nothing.
pub async fn sweep_once(
    engine: &Engine,
    documents: &dyn DocumentStore,
    clock: &dyn Clock,
) -> SweepReport {
    let now = clock.now();
    let mut report = SweepReport::default();

    for (property_id, reservation_id) in engine.collect_expired_holds(now) {
        match engine.expire_hold(property_id, reservation_id, now).await {
            Ok(true) => {
                info!("expired hold {reservation_id} on property {property_id}");
                metrics::counter!(observability::HOLDS_EXPIRED_TOTAL).increment(1);
                report.expired += 1;
            }
            // Another overlapping run got there first — that's fine.
            Ok(false) => {}
            Err(e) => debug!("expiry skip {reservation_id}: {e}"),
        }
    }

    for spec in &engine.registry.properties {
        match engine.auto_merge_scan(spec.id, now).await {
            Ok(scan) => {
                report.ambiguous_merges += scan.ambiguous;
                for (placeholder, target) in scan.merged {
                    info!("merged placeholder {placeholder} into {target}");
                    metrics::counter!(observability::MERGES_TOTAL).increment(1);
                    report.merged += 1;
                    // Post-commit side effect: a document-store failure is
                    // logged, never reported as a reconciliation failure.
                    match documents.transfer(placeholder, target).await {
                        Ok(moved) if moved > 0 => {
                            debug!("moved {moved} documents {placeholder} -> {target}");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("document move {placeholder} -> {target} failed: {e}");
                        }
                    }
                }
            }
            Err(e) => warn!("merge scan failed for property {}: {e}", spec.id),
        }

        match engine.retry_inbox(spec.id, now).await {
            Ok(resolutions) => {
                for (entry_id, outcome) in &resolutions {
                    info!("inbox entry {entry_id} resolved: {outcome:?}");
                }
                report.inbox_resolved += resolutions.len();
            }
            Err(e) => warn!("inbox retry failed for property {}: {e}", spec.id),
        }
    }

    report
}

/// Periodic driver for `sweep_once`.
pub async fn run_sweep_job(
    engine: Arc<Engine>,
    documents: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let report = sweep_once(&engine, documents.as_ref(), clock.as_ref()).await;
        if report != SweepReport::default() {
            info!(
                "sweep: {} expired, {} merged, {} ambiguous, {} inbox resolved",
                report.expired, report.merged, report.ambiguous_merges, report.inbox_resolved
            );
        }
    }
}

/// Rewrite the journal once enough appends have accumulated.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if engine.journal_appends_since_compact().await >= threshold {
            match engine.compact_journal().await {
                Ok(()) => info!("journal compacted"),
                Err(e) => warn!("journal compaction failed: {e}"),
            }
        }
    }
}
