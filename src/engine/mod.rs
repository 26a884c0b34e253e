mod conflict;
mod error;
mod ingest;
mod mutations;
mod queries;
mod store;

pub use conflict::overlaps;
pub use error::EngineError;
pub use ingest::{ChannelEvent, IngestOutcome, normalize_event};
pub use mutations::MergeScanReport;
pub use queries::saturated_date_spans;
pub use store::PropertyBoard;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::warn;

use crate::config::{PropertySpec, Registry};
use crate::journal::Journal;
use crate::model::*;
use crate::notify::NotifyHub;

pub type SharedBoard = Arc<RwLock<PropertyBoard>>;

// ── Group-commit journal channel ─────────────────────────

pub(super) enum JournalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the journal and batches appends for group
/// commit: buffer everything immediately available, one fsync per batch,
/// then answer all waiting senders.
async fn journal_writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            JournalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(JournalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut journal, &mut batch);
                metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(&mut batch, &result);

                if let Some(cmd) = deferred {
                    handle_non_append(&mut journal, cmd);
                }
            }
            other => handle_non_append(&mut journal, other),
        }
    }
}

fn flush_batch(
    journal: &mut Journal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = journal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch
    // (callers were told this batch failed).
    let flush_err = journal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(
    batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>,
    result: &io::Result<()>,
) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { events, response } => {
            let result = Journal::write_compact_file(journal.path(), &events)
                .and_then(|()| journal.swap_compact_file());
            let _ = response.send(result);
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(journal.appends_since_compact());
        }
        JournalCommand::Append { .. } => unreachable!(),
    }
}

/// The reconciliation engine: one board per registry property, a durable
/// journal behind a group-commit writer, and a post-commit notify hub.
pub struct Engine {
    pub registry: Arc<Registry>,
    boards: DashMap<PropertyId, SharedBoard>,
    journal_tx: mpsc::Sender<JournalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    /// Boot: create a board per registry property, replay the journal into
    /// them, spawn the journal writer. Events for properties no longer in the
    /// registry are skipped with a warning.
    pub fn new(
        registry: Arc<Registry>,
        journal_path: PathBuf,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let events = Journal::replay(&journal_path)?;
        let journal = Journal::open(&journal_path)?;
        let (journal_tx, journal_rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(journal, journal_rx));

        let engine = Self {
            registry,
            boards: DashMap::new(),
            journal_tx,
            notify,
        };

        for spec in &engine.registry.properties {
            engine
                .boards
                .insert(spec.id, Arc::new(RwLock::new(PropertyBoard::new(spec.id))));
        }

        // Replay — sole owner of the board Arcs, so try_write always succeeds.
        for event in &events {
            let property_id = event.property_id();
            match engine.boards.get(&property_id) {
                Some(entry) => {
                    let board = entry.value().clone();
                    let mut guard = board.try_write().expect("replay: uncontended write");
                    guard.apply(event);
                }
                None => {
                    warn!("replay: skipping event for unregistered property {property_id}");
                }
            }
        }

        Ok(engine)
    }

    pub fn board(&self, id: &PropertyId) -> Option<SharedBoard> {
        self.boards.get(id).map(|e| e.value().clone())
    }

    pub(super) fn property_spec(&self, id: &PropertyId) -> Result<&PropertySpec, EngineError> {
        self.registry
            .property(*id)
            .ok_or(EngineError::PropertyNotFound(*id))
    }

    pub(super) fn board_or_err(&self, id: &PropertyId) -> Result<SharedBoard, EngineError> {
        self.board(id).ok_or(EngineError::PropertyNotFound(*id))
    }

    /// Write an event through the group-commit writer.
    pub(super) async fn journal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::JournalError("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::JournalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::JournalError(e.to_string()))
    }

    /// Journal-append + apply + notify in one call, under the caller's board
    /// write lock. The append happens first: an event is only ever applied
    /// after it is durable, and only ever broadcast after it is applied.
    pub(super) async fn persist_and_apply(
        &self,
        board: &mut PropertyBoard,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.journal_append(event).await?;
        board.apply(event);
        self.notify.send(board.id, event);
        Ok(())
    }

    pub(super) async fn journal_compact(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::JournalError("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::JournalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::JournalError(e.to_string()))
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .journal_tx
            .send(JournalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
