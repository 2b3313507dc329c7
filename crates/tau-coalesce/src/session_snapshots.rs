use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tau_core::{current_unix_timestamp_ms, write_text_atomic};

use crate::coalescer::{
    BatchWriter, CoalescerError, CoalescerOptions, CoalescerStats, WriteCoalescer,
};
use crate::config::CoalescerConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub payload: Value,
    pub queued_unix_ms: u64,
}

impl SessionSnapshot {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            queued_unix_ms: current_unix_timestamp_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleWriteOptions {
    /// Flush the store path before returning and surface the write result.
    pub immediate: bool,
}

/// Replaces a store file with the newest snapshot of a batch.
///
/// Older snapshots in the same batch are superseded and never hit the disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionSnapshotWriter;

#[async_trait]
impl BatchWriter for SessionSnapshotWriter {
    type Entry = SessionSnapshot;

    async fn write_batch(&self, destination: &Path, entries: &[SessionSnapshot]) -> Result<u64> {
        let Some(latest) = entries.last() else {
            return Ok(0);
        };
        let mut encoded =
            serde_json::to_string_pretty(&latest.payload).context("failed to encode snapshot")?;
        encoded.push('\n');
        let bytes = u64::try_from(encoded.len()).unwrap_or(u64::MAX);
        let path = destination.to_path_buf();
        tokio::task::spawn_blocking(move || write_text_atomic(&path, &encoded))
            .await
            .context("snapshot write task failed")??;
        Ok(bytes)
    }
}

/// Debounced session persistence keyed by store path.
#[derive(Debug, Clone)]
pub struct SessionWriteCoalescer {
    coalescer: WriteCoalescer<SessionSnapshotWriter>,
}

impl SessionWriteCoalescer {
    pub fn new(config: CoalescerConfig) -> Result<Self> {
        Self::new_with_options(config, CoalescerOptions::default())
    }

    pub fn new_with_options(config: CoalescerConfig, options: CoalescerOptions) -> Result<Self> {
        Ok(Self {
            coalescer: WriteCoalescer::new_with_options(
                "session-snapshots",
                config,
                SessionSnapshotWriter,
                options,
            )?,
        })
    }

    pub fn from_env(options: CoalescerOptions) -> Result<Self> {
        Self::new_with_options(CoalescerConfig::session_snapshots_from_env(), options)
    }

    /// Queues `snapshot` for `path`; with `immediate`, writes it before returning.
    #[tracing::instrument(
        name = "session.schedule_write",
        skip_all,
        fields(path = %path.as_ref().display(), immediate = options.immediate)
    )]
    pub async fn schedule_write(
        &self,
        path: impl AsRef<Path>,
        snapshot: Value,
        options: ScheduleWriteOptions,
    ) -> Result<(), CoalescerError> {
        let path = path.as_ref();
        self.coalescer.append(path, SessionSnapshot::new(snapshot))?;
        if options.immediate {
            self.coalescer.flush(path).await?;
        }
        Ok(())
    }

    pub async fn flush_all(&self) -> Result<usize, CoalescerError> {
        self.coalescer.flush_all().await
    }

    pub async fn close(&self) {
        self.coalescer.close().await;
    }

    pub fn stats(&self) -> CoalescerStats {
        self.coalescer.stats()
    }
}
