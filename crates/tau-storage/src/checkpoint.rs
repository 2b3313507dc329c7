use std::sync::Weak;
use std::time::Duration;

use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::store::StoreInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    /// Copies what it can without waiting on readers or writers.
    Passive,
    Full,
    Restart,
    /// Like `Restart`, then truncates the WAL file to zero bytes.
    Truncate,
}

impl CheckpointMode {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Passive => "PASSIVE",
            Self::Full => "FULL",
            Self::Restart => "RESTART",
            Self::Truncate => "TRUNCATE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointOutcome {
    pub mode: CheckpointMode,
    /// True when the checkpoint could not finish because of a concurrent lock.
    pub busy: bool,
    /// Frames in the WAL, or -1 when the database is not in WAL mode.
    pub log_frames: i64,
    pub checkpointed_frames: i64,
    pub duration_ms: u64,
}

pub(crate) fn run_checkpoint(
    connection: &Connection,
    mode: CheckpointMode,
) -> rusqlite::Result<CheckpointOutcome> {
    let started = std::time::Instant::now();
    let (busy, log_frames, checkpointed_frames) = connection.query_row(
        &format!("PRAGMA wal_checkpoint({})", mode.as_sql()),
        [],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
    )?;
    Ok(CheckpointOutcome {
        mode,
        busy: busy != 0,
        log_frames,
        checkpointed_frames,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    })
}

/// Background PASSIVE checkpoint loop owned by one store.
pub(crate) struct CheckpointScheduler {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CheckpointScheduler {
    /// Returns `None` outside a tokio runtime; the store still works, just unscheduled.
    pub(crate) fn start(store: Weak<StoreInner>, interval: Duration) -> Option<Self> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = handle.spawn(run_checkpoint_loop(store, interval, shutdown_rx));
        Some(Self {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub(crate) async fn shutdown(mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn run_checkpoint_loop(
    store: Weak<StoreInner>,
    interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = store.upgrade() else {
                    break;
                };
                let outcome = tokio::task::spawn_blocking(move || {
                    inner.checkpoint(CheckpointMode::Passive)
                })
                .await;
                match outcome {
                    Ok(Ok(outcome)) => tracing::debug!(
                        log_frames = outcome.log_frames,
                        checkpointed_frames = outcome.checkpointed_frames,
                        busy = outcome.busy,
                        "scheduled wal checkpoint"
                    ),
                    // Failures are logged by the store; closed stores end the loop.
                    Ok(Err(crate::StorageError::Closed { .. })) => break,
                    Ok(Err(_)) => {}
                    Err(error) => tracing::warn!(%error, "wal checkpoint task failed"),
                }
            }
            _ = &mut shutdown_rx => break,
        }
    }
}
