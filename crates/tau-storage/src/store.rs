use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, Params, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use tau_core::{current_unix_timestamp_ms, lock_or_recover_mutex};
use tau_io_telemetry::{IoMetricsCollector, IoResourceKind};

use crate::checkpoint::{run_checkpoint, CheckpointMode, CheckpointOutcome, CheckpointScheduler};
use crate::tuning::StorageTuning;
use crate::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StorageMetrics {
    pub queries_total: u64,
    pub transactions_total: u64,
    pub rollbacks_total: u64,
    pub batch_inserts_total: u64,
    pub batch_insert_rows_total: u64,
    pub checkpoints_total: u64,
    pub checkpoint_failures_total: u64,
    pub checkpoint_duration_ms_total: u64,
    pub last_checkpoint_duration_ms: Option<u64>,
    pub last_checkpoint_unix_ms: Option<u64>,
}

pub(crate) struct StoreInner {
    path: PathBuf,
    tuning: StorageTuning,
    connection: Mutex<Option<Connection>>,
    metrics: Mutex<StorageMetrics>,
    telemetry: Option<Arc<IoMetricsCollector>>,
    scheduler: Mutex<Option<CheckpointScheduler>>,
}

/// One tuned SQLite connection per database file.
///
/// Opening applies WAL journaling, `synchronous = NORMAL`, a bounded page
/// cache and a capped WAL, then starts a PASSIVE checkpoint task when a tokio
/// runtime is available. Calls are serialized on the single connection.
#[derive(Clone)]
pub struct TunedSqliteStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for TunedSqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunedSqliteStore")
            .field("path", &self.inner.path)
            .field("tuning", &self.inner.tuning)
            .finish_non_exhaustive()
    }
}

impl TunedSqliteStore {
    pub fn open(path: impl AsRef<Path>, tuning: StorageTuning) -> StorageResult<Self> {
        Self::open_with_telemetry(path, tuning, None)
    }

    #[tracing::instrument(
        name = "storage.open",
        skip_all,
        fields(path = %path.as_ref().display())
    )]
    pub fn open_with_telemetry(
        path: impl AsRef<Path>,
        tuning: StorageTuning,
        telemetry: Option<Arc<IoMetricsCollector>>,
    ) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let connection = Connection::open(&path)?;
        connection.busy_timeout(Duration::from_millis(tuning.busy_timeout_ms))?;
        connection.execute_batch(&tuning.pragma_batch())?;

        let inner = Arc::new(StoreInner {
            path,
            tuning,
            connection: Mutex::new(Some(connection)),
            metrics: Mutex::new(StorageMetrics::default()),
            telemetry,
            scheduler: Mutex::new(None),
        });
        if let Some(interval) = tuning.checkpoint_interval() {
            let scheduler = CheckpointScheduler::start(Arc::downgrade(&inner), interval);
            if scheduler.is_none() {
                tracing::debug!("no tokio runtime; wal checkpoint scheduler not started");
            }
            *lock_or_recover_mutex(&inner.scheduler) = scheduler;
        }
        Ok(Self { inner })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn tuning(&self) -> StorageTuning {
        self.inner.tuning
    }

    /// Runs `operation` inside an IMMEDIATE transaction.
    ///
    /// Commits on `Ok`; rolls back and returns the error on `Err`. Nested
    /// calls from inside `operation` deadlock and are not supported.
    pub fn transaction<T, F>(&self, operation: F) -> StorageResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StorageResult<T>,
    {
        let result = self.inner.with_connection(|connection| {
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            match operation(&transaction) {
                Ok(value) => {
                    transaction
                        .commit()
                        .map_err(|error| StorageError::Transaction(format!("commit failed: {error}")))?;
                    Ok(value)
                }
                Err(error) => {
                    if let Err(rollback_error) = transaction.rollback() {
                        tracing::warn!(%rollback_error, "transaction rollback failed");
                    }
                    Err(error)
                }
            }
        });
        self.inner.update_metrics(|metrics| {
            metrics.transactions_total = metrics.transactions_total.saturating_add(1);
            if result.is_err() {
                metrics.rollbacks_total = metrics.rollbacks_total.saturating_add(1);
            }
        });
        match &result {
            Ok(_) => self.inner.record_write(1),
            Err(StorageError::Closed { .. }) => {}
            Err(_) => self.inner.record_failure(),
        }
        result
    }

    /// Inserts every item with one prepared statement inside one transaction.
    ///
    /// Returns the total rows affected. Any failure rolls the whole batch back.
    pub fn batch_insert<T, P, F>(&self, sql: &str, items: &[T], to_params: F) -> StorageResult<usize>
    where
        P: Params,
        F: Fn(&T) -> P,
    {
        if items.is_empty() {
            return Ok(0);
        }
        let result = self.inner.with_connection(|connection| {
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut affected = 0_usize;
            {
                let mut statement = transaction.prepare_cached(sql)?;
                for item in items {
                    affected = affected.saturating_add(statement.execute(to_params(item))?);
                }
            }
            transaction
                .commit()
                .map_err(|error| StorageError::Transaction(format!("commit failed: {error}")))?;
            Ok(affected)
        });
        let rows = items.len() as u64;
        self.inner.update_metrics(|metrics| {
            metrics.transactions_total = metrics.transactions_total.saturating_add(1);
            match &result {
                Ok(_) => {
                    metrics.batch_inserts_total = metrics.batch_inserts_total.saturating_add(1);
                    metrics.batch_insert_rows_total =
                        metrics.batch_insert_rows_total.saturating_add(rows);
                }
                Err(_) => metrics.rollbacks_total = metrics.rollbacks_total.saturating_add(1),
            }
        });
        match &result {
            Ok(_) => self.inner.record_write(rows),
            Err(StorageError::Closed { .. }) => {}
            Err(_) => self.inner.record_failure(),
        }
        result
    }

    pub fn execute<P: Params>(&self, sql: &str, params: P) -> StorageResult<usize> {
        let result = self
            .inner
            .with_connection(|connection| Ok(connection.execute(sql, params)?));
        self.inner.count_query();
        match &result {
            Ok(_) => self.inner.record_write(1),
            Err(StorageError::Closed { .. }) => {}
            Err(_) => self.inner.record_failure(),
        }
        result
    }

    /// Runs a multi-statement script such as schema setup.
    pub fn execute_batch(&self, sql: &str) -> StorageResult<()> {
        let result = self
            .inner
            .with_connection(|connection| Ok(connection.execute_batch(sql)?));
        self.inner.count_query();
        result
    }

    pub fn query_row<T, P, F>(&self, sql: &str, params: P, map: F) -> StorageResult<T>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let result = self
            .inner
            .with_connection(|connection| Ok(connection.query_row(sql, params, map)?));
        self.inner.count_query();
        if result.is_ok() {
            self.inner.record_read();
        }
        result
    }

    pub fn query_map<T, P, F>(&self, sql: &str, params: P, map: F) -> StorageResult<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let result = self.inner.with_connection(|connection| {
            let mut statement = connection.prepare_cached(sql)?;
            let rows = statement.query_map(params, map)?;
            let mut values = Vec::new();
            for row in rows {
                values.push(row?);
            }
            Ok(values)
        });
        self.inner.count_query();
        if result.is_ok() {
            self.inner.record_read();
        }
        result
    }

    pub fn journal_mode(&self) -> StorageResult<String> {
        self.inner.with_connection(|connection| {
            Ok(connection.query_row("PRAGMA journal_mode", [], |row| row.get(0))?)
        })
    }

    /// Reads an integer-valued pragma such as `cache_size` or `synchronous`.
    pub fn pragma_i64(&self, name: &str) -> StorageResult<i64> {
        self.inner.with_connection(|connection| {
            Ok(connection.query_row(&format!("PRAGMA {name}"), [], |row| row.get(0))?)
        })
    }

    pub fn checkpoint(&self, mode: CheckpointMode) -> StorageResult<CheckpointOutcome> {
        self.inner.checkpoint(mode)
    }

    pub fn metrics(&self) -> StorageMetrics {
        *lock_or_recover_mutex(&self.inner.metrics)
    }

    pub fn is_closed(&self) -> bool {
        lock_or_recover_mutex(&self.inner.connection).is_none()
    }

    /// Stops the scheduler, runs a final TRUNCATE checkpoint and releases the
    /// connection. Idempotent; later operations fail with `StorageError::Closed`.
    #[tracing::instrument(
        name = "storage.close",
        skip_all,
        fields(path = %self.inner.path.display())
    )]
    pub async fn close(&self) -> StorageResult<()> {
        let scheduler = lock_or_recover_mutex(&self.inner.scheduler).take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
        let connection = lock_or_recover_mutex(&self.inner.connection).take();
        let Some(connection) = connection else {
            return Ok(());
        };
        match run_checkpoint(&connection, CheckpointMode::Truncate) {
            Ok(outcome) => {
                self.inner.note_checkpoint(&outcome);
                tracing::debug!(
                    checkpointed_frames = outcome.checkpointed_frames,
                    "final wal checkpoint complete"
                );
            }
            Err(error) => {
                self.inner.note_checkpoint_failure();
                tracing::warn!(%error, "final wal checkpoint failed");
            }
        }
        connection.close().map_err(|(_, error)| StorageError::Sqlite(error))
    }
}

impl StoreInner {
    fn with_connection<T>(
        &self,
        operation: impl FnOnce(&mut Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut guard = lock_or_recover_mutex(&self.connection);
        let Some(connection) = guard.as_mut() else {
            return Err(StorageError::Closed {
                path: self.path.clone(),
            });
        };
        operation(connection)
    }

    pub(crate) fn checkpoint(&self, mode: CheckpointMode) -> StorageResult<CheckpointOutcome> {
        let result =
            self.with_connection(|connection| Ok(run_checkpoint(connection, mode)?));
        match &result {
            Ok(outcome) => {
                self.note_checkpoint(outcome);
                if outcome.busy {
                    tracing::debug!(
                        path = %self.path.display(),
                        mode = mode.as_sql(),
                        "wal checkpoint could not complete; database busy"
                    );
                }
            }
            Err(StorageError::Closed { .. }) => {}
            Err(error) => {
                self.note_checkpoint_failure();
                tracing::warn!(
                    path = %self.path.display(),
                    mode = mode.as_sql(),
                    %error,
                    "wal checkpoint failed"
                );
            }
        }
        result
    }

    fn note_checkpoint(&self, outcome: &CheckpointOutcome) {
        self.update_metrics(|metrics| {
            metrics.checkpoints_total = metrics.checkpoints_total.saturating_add(1);
            metrics.checkpoint_duration_ms_total = metrics
                .checkpoint_duration_ms_total
                .saturating_add(outcome.duration_ms);
            metrics.last_checkpoint_duration_ms = Some(outcome.duration_ms);
            metrics.last_checkpoint_unix_ms = Some(current_unix_timestamp_ms());
        });
    }

    fn note_checkpoint_failure(&self) {
        self.update_metrics(|metrics| {
            metrics.checkpoint_failures_total = metrics.checkpoint_failures_total.saturating_add(1);
        });
    }

    fn count_query(&self) {
        self.update_metrics(|metrics| {
            metrics.queries_total = metrics.queries_total.saturating_add(1);
        });
    }

    fn update_metrics(&self, update: impl FnOnce(&mut StorageMetrics)) {
        update(&mut lock_or_recover_mutex(&self.metrics));
    }

    fn record_write(&self, logical_ops: u64) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_write(IoResourceKind::Database, 0, logical_ops);
        }
    }

    fn record_read(&self) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_read(IoResourceKind::Database, 0);
        }
    }

    fn record_failure(&self) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_failure(IoResourceKind::Database);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rusqlite::params;
    use tau_core::ManualClock;
    use tau_io_telemetry::IoMetricsCollector;
    use tempfile::tempdir;

    use super::TunedSqliteStore;
    use crate::checkpoint::CheckpointMode;
    use crate::tuning::StorageTuning;
    use crate::StorageError;

    fn unscheduled() -> StorageTuning {
        StorageTuning {
            checkpoint_interval_ms: 0,
            ..StorageTuning::default()
        }
    }

    fn open_with_schema(path: &std::path::Path) -> TunedSqliteStore {
        let store = TunedSqliteStore::open(path, unscheduled()).expect("open store");
        store
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS messages (id INTEGER PRIMARY KEY, channel TEXT NOT NULL, body TEXT NOT NULL);",
            )
            .expect("schema");
        store
    }

    fn count_messages(store: &TunedSqliteStore) -> i64 {
        store
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .expect("count")
    }

    #[test]
    fn unit_open_applies_tuned_pragmas() {
        let temp = tempdir().expect("tempdir");
        let store = TunedSqliteStore::open(temp.path().join("db/gateway.sqlite"), unscheduled())
            .expect("open");
        assert_eq!(store.journal_mode().expect("journal_mode"), "wal");
        assert_eq!(store.pragma_i64("synchronous").expect("synchronous"), 1);
        assert_eq!(store.pragma_i64("foreign_keys").expect("foreign_keys"), 1);
        assert_eq!(store.pragma_i64("temp_store").expect("temp_store"), 2);
        assert_eq!(store.pragma_i64("cache_size").expect("cache_size"), -8_192);
        assert_eq!(
            store.pragma_i64("journal_size_limit").expect("journal_size_limit"),
            67_108_864
        );
        assert_eq!(store.pragma_i64("wal_autocheckpoint").expect("autocheckpoint"), 1_000);
        assert_eq!(store.pragma_i64("busy_timeout").expect("busy_timeout"), 5_000);
    }

    #[test]
    fn functional_transaction_rollback_leaves_no_rows() {
        let temp = tempdir().expect("tempdir");
        let store = open_with_schema(&temp.path().join("gateway.sqlite"));
        let result: Result<(), StorageError> = store.transaction(|transaction| {
            transaction.execute(
                "INSERT INTO messages (channel, body) VALUES (?1, ?2)",
                params!["telegram", "hello"],
            )?;
            Err(StorageError::Transaction("handler rejected message".to_string()))
        });
        assert!(matches!(result, Err(StorageError::Transaction(_))));
        assert_eq!(count_messages(&store), 0);
        let metrics = store.metrics();
        assert_eq!(metrics.transactions_total, 1);
        assert_eq!(metrics.rollbacks_total, 1);

        store
            .transaction(|transaction| {
                transaction.execute(
                    "INSERT INTO messages (channel, body) VALUES (?1, ?2)",
                    params!["discord", "hi"],
                )?;
                Ok(())
            })
            .expect("commit");
        assert_eq!(count_messages(&store), 1);
    }

    #[test]
    fn functional_batch_insert_writes_all_rows_in_one_transaction() {
        let temp = tempdir().expect("tempdir");
        let telemetry = Arc::new(IoMetricsCollector::new(60_000, ManualClock::new(0).as_clock()));
        let store = TunedSqliteStore::open_with_telemetry(
            temp.path().join("gateway.sqlite"),
            unscheduled(),
            Some(telemetry.clone()),
        )
        .expect("open");
        store
            .execute_batch(
                "CREATE TABLE messages (id INTEGER PRIMARY KEY, channel TEXT NOT NULL, body TEXT NOT NULL);",
            )
            .expect("schema");
        let rows: Vec<(String, String)> = (0..100)
            .map(|index| ("slack".to_string(), format!("message {index}")))
            .collect();
        let inserted = store
            .batch_insert(
                "INSERT INTO messages (channel, body) VALUES (?1, ?2)",
                &rows,
                |(channel, body)| [channel.clone(), body.clone()],
            )
            .expect("batch insert");
        assert_eq!(inserted, 100);
        assert_eq!(count_messages(&store), 100);

        let metrics = store.metrics();
        assert_eq!(metrics.transactions_total, 1);
        assert_eq!(metrics.batch_inserts_total, 1);
        assert_eq!(metrics.batch_insert_rows_total, 100);
        let database = &telemetry.snapshot().resources["database"];
        assert_eq!(database.physical_ops_total, 2);
        assert_eq!(database.logical_ops_total, 101);
    }

    #[test]
    fn regression_failed_batch_insert_rolls_back_every_row() {
        let temp = tempdir().expect("tempdir");
        let store = open_with_schema(&temp.path().join("gateway.sqlite"));
        let rows = vec![Some("ok"), None, Some("never")];
        let result = store.batch_insert(
            "INSERT INTO messages (channel, body) VALUES ('matrix', ?1)",
            &rows,
            |body| [*body],
        );
        assert!(matches!(result, Err(StorageError::Sqlite(_))));
        assert_eq!(count_messages(&store), 0);
        assert_eq!(store.metrics().rollbacks_total, 1);
    }

    #[test]
    fn functional_manual_checkpoint_reports_frames() {
        let temp = tempdir().expect("tempdir");
        let store = open_with_schema(&temp.path().join("gateway.sqlite"));
        store
            .execute(
                "INSERT INTO messages (channel, body) VALUES (?1, ?2)",
                params!["irc", "ping"],
            )
            .expect("insert");
        let outcome = store.checkpoint(CheckpointMode::Truncate).expect("checkpoint");
        assert!(!outcome.busy);
        assert!(outcome.log_frames >= 0);
        assert_eq!(store.metrics().checkpoints_total, 1);
    }

    #[tokio::test]
    async fn integration_close_truncates_wal_and_rejects_later_calls() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("gateway.sqlite");
        let store = open_with_schema(&path);
        store
            .execute(
                "INSERT INTO messages (channel, body) VALUES (?1, ?2)",
                params!["signal", "bye"],
            )
            .expect("insert");
        store.close().await.expect("close");
        assert!(store.is_closed());
        assert_eq!(store.metrics().checkpoints_total, 1);

        let wal = temp.path().join("gateway.sqlite-wal");
        assert!(!wal.exists() || std::fs::metadata(&wal).expect("wal metadata").len() == 0);
        assert!(matches!(
            store.execute("DELETE FROM messages", []),
            Err(StorageError::Closed { .. })
        ));
        store.close().await.expect("second close is a no-op");

        let reopened = TunedSqliteStore::open(&path, unscheduled()).expect("reopen");
        assert_eq!(count_messages(&reopened), 1);
    }

    #[tokio::test]
    async fn functional_scheduler_runs_passive_checkpoints() {
        let temp = tempdir().expect("tempdir");
        let store = TunedSqliteStore::open(
            temp.path().join("gateway.sqlite"),
            StorageTuning {
                checkpoint_interval_ms: 20,
                ..StorageTuning::default()
            },
        )
        .expect("open");
        store
            .execute_batch("CREATE TABLE events (id INTEGER PRIMARY KEY);")
            .expect("schema");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.metrics().checkpoints_total >= 1);
        store.close().await.expect("close");
    }
}
