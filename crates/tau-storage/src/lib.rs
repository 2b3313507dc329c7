//! Tuned SQLite storage for gateway state.
//!
//! Wraps a single `rusqlite` connection with WAL pragmas, IMMEDIATE
//! transactions, prepared batch inserts and a periodic PASSIVE checkpoint.

use std::path::PathBuf;

use thiserror::Error;

mod checkpoint;
mod store;
mod tuning;

pub use checkpoint::{CheckpointMode, CheckpointOutcome};
pub use store::{StorageMetrics, TunedSqliteStore};
pub use tuning::{
    StorageTuning, DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_CACHE_SIZE_KIB,
    DEFAULT_CHECKPOINT_INTERVAL_MS, DEFAULT_JOURNAL_SIZE_LIMIT_BYTES,
    DEFAULT_WAL_AUTOCHECKPOINT_PAGES,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("storage at '{}' is closed", path.display())]
    Closed { path: PathBuf },
    #[error("transaction failed: {0}")]
    Transaction(String),
}

pub type StorageResult<T> = Result<T, StorageError>;
