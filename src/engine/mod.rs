mod conflict;
mod error;
mod ledger;
mod mutations;
mod queries;
mod store;

pub use conflict::{conflicts, find_conflict};
pub use error::EngineError;
pub use ledger::{check_releasable, check_reservable};
pub use queries::page_from;
pub use store::{SharedOwnerSchedule, SharedSlotState, Store};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use store::{compact_events, Snapshot};

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Rewrite the log as its minimal equivalent. Responds with the number
    /// of events kept.
    Compact {
        response: oneshot::Sender<io::Result<usize>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch; roll the batch back on failure.
/// 5. Respond to all senders with the batch outcome.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        tracing::error!("WAL batch of {} events failed: {e}", batch.len());
        // Every caller in this batch is told it failed, so none of it may survive.
        if let Err(rb) = wal.rollback() {
            tracing::error!("WAL rollback failed: {rb}");
        }
    }
    result
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            let _ = response.send(compact_in_place(wal));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed to non-append handler")));
        }
    }
}

/// Fold the log into its minimal form and swap it in. Runs inside the writer
/// task, between batches, so every committed event is on disk and no append
/// can interleave.
fn compact_in_place(wal: &mut Wal) -> io::Result<usize> {
    let events = Wal::replay(wal.path())?;
    let compacted = compact_events(&events);
    Wal::write_compact_file(wal.path(), &compacted)?;
    wal.swap_compact_file()?;
    tracing::info!("WAL compacted: {} events -> {}", events.len(), compacted.len());
    metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
    Ok(compacted.len())
}

/// Send one event to the writer task and wait for its group commit.
async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::WalError(e.to_string()))
}

pub struct Engine {
    pub store: Arc<Store>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    policy: RebookPolicy,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called from within a tokio runtime.
    pub fn new(wal_path: PathBuf, policy: RebookPolicy) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Store::from_snapshot(Snapshot::from_events(&events));
        tracing::info!(
            "replayed {} WAL events from {} ({} slots)",
            events.len(),
            wal_path.display(),
            store.slot_count()
        );
        metrics::gauge!(crate::observability::SLOTS_ACTIVE).set(store.slot_count() as f64);

        Ok(Self {
            store: Arc::new(store),
            wal_tx,
            policy,
        })
    }

    pub fn rebook_policy(&self) -> RebookPolicy {
        self.policy
    }

    pub fn get_slot_state(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.store.get_slot(id)
    }

    /// Durably commit `event`, then hand it to `apply`.
    ///
    /// The WAL append and the apply run in a task of their own, which owns
    /// whatever lock guards `apply` captured. Dropping the caller after the
    /// commit started leaves it running to completion; dropping it before
    /// writes nothing. A failed append never reaches `apply`.
    pub(super) async fn commit<T, F>(&self, event: Event, apply: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Store, &Event) -> T + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let wal_tx = self.wal_tx.clone();
        tokio::spawn(async move {
            wal_append(&wal_tx, &event).await?;
            Ok::<T, EngineError>(apply(&store, &event))
        })
        .await
        .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
