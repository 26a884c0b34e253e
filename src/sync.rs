use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::IntegrationSpec;
use crate::engine::{Engine, IngestOutcome};
use crate::ics::{self, FeedError};
use crate::observability;

/// Source of raw calendar documents. Production uses HTTP; tests substitute
/// canned documents.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FeedError>;
}

pub struct HttpFeedSource {
    client: reqwest::Client,
}

impl HttpFeedSource {
    /// The timeout bounds the whole fetch; an overrunning feed is abandoned
    /// and retried next cycle.
    pub fn new(timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .user_agent("roomsync/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| FeedError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(&self, url: &str) -> Result<String, FeedError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FeedError::Timeout
            } else {
                FeedError::Http(e.to_string())
            }
        })?;
        if !response.status().is_success() {
            return Err(FeedError::Http(format!("status {}", response.status())));
        }
        response.text().await.map_err(|e| {
            if e.is_timeout() {
                FeedError::Timeout
            } else {
                FeedError::Http(e.to_string())
            }
        })
    }
}

/// Per-event tallies for one feed pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub parsed: usize,
    pub skipped: usize,
    pub created: usize,
    pub refreshed: usize,
    pub matched: usize,
    pub promoted: usize,
    pub unchanged: usize,
    pub inboxed: usize,
    pub errors: usize,
}

#[derive(Debug)]
pub enum FeedOutcome {
    /// Whole-feed failure: nothing was ingested, retry next cycle. Not an
    /// empty feed — an empty feed would look like mass cancellation.
    Failed(FeedError),
    Ingested(IngestStats),
}

#[derive(Debug)]
pub struct SyncReport {
    pub integration_id: ulid::Ulid,
    pub outcome: FeedOutcome,
}

/// Idempotent entry point for the feed-sync job: one pass over every
/// configured integration. Feeds are fetched and reconciled independently and
/// concurrently; one unreachable feed never stalls the rest.
pub async fn sync_once(
    engine: &Engine,
    source: &dyn FeedSource,
    clock: &dyn Clock,
) -> Vec<SyncReport> {
    metrics::counter!(observability::SYNC_RUNS_TOTAL).increment(1);
    let passes = engine
        .registry
        .integrations
        .iter()
        .map(|integration| sync_feed(engine, source, clock, integration));
    join_all(passes).await
}

async fn sync_feed(
    engine: &Engine,
    source: &dyn FeedSource,
    clock: &dyn Clock,
    integration: &IntegrationSpec,
) -> SyncReport {
    let report = |outcome| SyncReport {
        integration_id: integration.id,
        outcome,
    };

    // Fetch and parse before touching any board lock; no lock is ever held
    // across network I/O.
    let text = match source.fetch(&integration.url).await {
        Ok(text) => text,
        Err(e) => {
            warn!(
                "feed {} ({}) fetch failed: {e}",
                integration.id, integration.url
            );
            metrics::counter!(observability::FEED_FAILURES_TOTAL).increment(1);
            return report(FeedOutcome::Failed(e));
        }
    };
    let parsed = match ics::parse_calendar(&text) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("feed {} unparsable: {e}", integration.id);
            metrics::counter!(observability::FEED_FAILURES_TOTAL).increment(1);
            return report(FeedOutcome::Failed(e));
        }
    };

    let spec = match engine.registry.property(integration.property_id) {
        Some(spec) => spec,
        None => {
            warn!(
                "feed {} references unregistered property {}",
                integration.id, integration.property_id
            );
            return report(FeedOutcome::Failed(FeedError::Http(
                "unregistered property".into(),
            )));
        }
    };

    let mut stats = IngestStats {
        parsed: parsed.events.len(),
        skipped: parsed.skipped,
        ..Default::default()
    };
    metrics::counter!(observability::EVENTS_SKIPPED_TOTAL).increment(parsed.skipped as u64);

    for event in &parsed.events {
        let normalized = match crate::engine::normalize_event(spec, integration, event) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(
                    "feed {} event {:?} rejected: {e}",
                    integration.id, event.uid
                );
                stats.errors += 1;
                continue;
            }
        };
        metrics::counter!(observability::EVENTS_INGESTED_TOTAL).increment(1);
        match engine
            .ingest_channel_event(integration, normalized, clock.now())
            .await
        {
            Ok(IngestOutcome::Created(_)) => {
                stats.created += 1;
                metrics::counter!(observability::RESERVATIONS_CREATED_TOTAL).increment(1);
            }
            Ok(IngestOutcome::Refreshed(_)) => stats.refreshed += 1,
            Ok(IngestOutcome::Matched(_)) => stats.matched += 1,
            Ok(IngestOutcome::Promoted(_)) => {
                stats.promoted += 1;
                metrics::counter!(observability::HOLDS_PROMOTED_TOTAL).increment(1);
            }
            Ok(IngestOutcome::Unchanged(_)) => stats.unchanged += 1,
            Ok(IngestOutcome::Inboxed(_)) => {
                stats.inboxed += 1;
                metrics::counter!(observability::INBOX_ROUTED_TOTAL).increment(1);
            }
            // One bad event never blocks the rest of the batch.
            Err(e) => {
                if matches!(e, crate::engine::EngineError::Conflict { .. }) {
                    metrics::counter!(observability::CONFLICTS_REJECTED_TOTAL).increment(1);
                }
                warn!(
                    "feed {} event {:?} not reconciled: {e}",
                    integration.id, event.uid
                );
                stats.errors += 1;
            }
        }
    }

    report(FeedOutcome::Ingested(stats))
}

/// Periodic driver for `sync_once`. Optionally exports the outbound
/// calendars after each pass.
pub async fn run_sync_job(
    engine: Arc<Engine>,
    source: Arc<dyn FeedSource>,
    clock: Arc<dyn Clock>,
    period: Duration,
    export_dir: Option<std::path::PathBuf>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let reports = sync_once(&engine, source.as_ref(), clock.as_ref()).await;
        for r in &reports {
            match &r.outcome {
                FeedOutcome::Failed(e) => {
                    warn!("feed {}: transient failure, will retry: {e}", r.integration_id);
                }
                FeedOutcome::Ingested(stats) => {
                    info!(
                        "feed {}: {} events ({} skipped) -> {} created, {} refreshed, {} matched, {} promoted, {} unchanged, {} inboxed, {} errors",
                        r.integration_id,
                        stats.parsed,
                        stats.skipped,
                        stats.created,
                        stats.refreshed,
                        stats.matched,
                        stats.promoted,
                        stats.unchanged,
                        stats.inboxed,
                        stats.errors,
                    );
                }
            }
        }
        if let Some(dir) = &export_dir
            && let Err(e) = export_calendars(&engine, clock.as_ref(), dir).await
        {
            warn!("calendar export failed: {e}");
        }
    }
}

/// Write the outbound per-room and per-category calendars under `dir`,
/// one subdirectory per property.
pub async fn export_calendars(
    engine: &Engine,
    clock: &dyn Clock,
    dir: &Path,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let now = clock.now();
    for spec in &engine.registry.properties {
        let property_dir = dir.join(spec.id.to_string());
        std::fs::create_dir_all(&property_dir)?;
        for room in &spec.rooms {
            let occupancy = engine.room_occupancy(spec.id, room.id, now).await?;
            let doc = ics::room_calendar(&room.name, &occupancy);
            std::fs::write(property_dir.join(format!("room-{}.ics", room.id)), doc)?;
        }
        for category in &spec.categories {
            let busy = engine
                .category_saturated_spans(spec.id, category.id, now)
                .await?;
            let doc = ics::category_calendar(&category.name, category.id, &busy);
            std::fs::write(
                property_dir.join(format!("category-{}.ics", category.id)),
                doc,
            )?;
        }
    }
    Ok(())
}
