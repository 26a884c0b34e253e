use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use roomsync::clock::SystemClock;
use roomsync::config::Registry;
use roomsync::documents::NullDocumentStore;
use roomsync::engine::Engine;
use roomsync::notify::NotifyHub;
use roomsync::sync::HttpFeedSource;
use roomsync::{sweep, sync};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("ROOMSYNC_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    roomsync::observability::init(metrics_port);

    let config_path = std::env::var("ROOMSYNC_CONFIG").unwrap_or_else(|_| "./registry.json".into());
    let data_dir = std::env::var("ROOMSYNC_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let sync_interval: u64 = std::env::var("ROOMSYNC_SYNC_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(300);
    let sweep_interval: u64 = std::env::var("ROOMSYNC_SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(60);
    let feed_timeout: u64 = std::env::var("ROOMSYNC_FEED_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30);
    let compact_threshold: u64 = std::env::var("ROOMSYNC_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);
    let export_dir: Option<PathBuf> = std::env::var("ROOMSYNC_EXPORT_DIR").ok().map(PathBuf::from);

    std::fs::create_dir_all(&data_dir)?;

    let registry = Arc::new(Registry::load(std::path::Path::new(&config_path))?);
    let notify = Arc::new(NotifyHub::new());
    let journal_path = PathBuf::from(&data_dir).join("roomsync.journal");
    let engine = Arc::new(Engine::new(registry.clone(), journal_path, notify)?);

    let source = Arc::new(HttpFeedSource::new(Duration::from_secs(feed_timeout))?);
    let clock = Arc::new(SystemClock);
    let documents = Arc::new(NullDocumentStore);

    info!("roomsync starting");
    info!("  registry: {config_path} ({} properties, {} integrations)",
        registry.properties.len(),
        registry.integrations.len());
    info!("  data_dir: {data_dir}");
    info!("  sync every {sync_interval}s, sweep every {sweep_interval}s");
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let sync_handle = tokio::spawn(sync::run_sync_job(
        engine.clone(),
        source,
        clock.clone(),
        Duration::from_secs(sync_interval),
        export_dir,
    ));
    let sweep_handle = tokio::spawn(sweep::run_sweep_job(
        engine.clone(),
        documents,
        clock,
        Duration::from_secs(sweep_interval),
    ));
    let compact_handle = tokio::spawn(sweep::run_compactor(engine.clone(), compact_threshold));

    // Graceful shutdown: stop the periodic jobs on SIGTERM/ctrl-c.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    shutdown.await;

    info!("shutdown signal received, stopping jobs");
    sync_handle.abort();
    sweep_handle.abort();
    compact_handle.abort();

    // One final compaction keeps restart replay short.
    if let Err(e) = engine.compact_journal().await {
        tracing::warn!("final compaction failed: {e}");
    }

    info!("roomsync stopped");
    Ok(())
}
