use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tau_core::{append_lines_with_rotation, current_unix_timestamp_ms, LogRotationPolicy};

use crate::coalescer::{
    BatchWriter, CoalescerError, CoalescerOptions, CoalescerStats, WriteCoalescer,
};
use crate::config::CoalescerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub line: String,
    pub arrived_unix_ms: u64,
}

impl LogEntry {
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            arrived_unix_ms: current_unix_timestamp_ms(),
        }
    }
}

/// Appends a batch of lines in one open/write/flush with size-based rotation.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogLineWriter {
    rotation: LogRotationPolicy,
}

impl LogLineWriter {
    pub fn new(rotation: LogRotationPolicy) -> Self {
        Self { rotation }
    }
}

#[async_trait]
impl BatchWriter for LogLineWriter {
    type Entry = LogEntry;

    async fn write_batch(&self, destination: &Path, entries: &[LogEntry]) -> Result<u64> {
        let path = destination.to_path_buf();
        let lines: Vec<String> = entries.iter().map(|entry| entry.line.clone()).collect();
        let rotation = self.rotation;
        tokio::task::spawn_blocking(move || append_lines_with_rotation(&path, &lines, rotation))
            .await
            .context("log append task failed")?
    }
}

/// Line-oriented front end over a [`WriteCoalescer`] for log files.
#[derive(Debug, Clone)]
pub struct LogCoalescer {
    coalescer: WriteCoalescer<LogLineWriter>,
}

impl LogCoalescer {
    pub fn new(config: CoalescerConfig, rotation: LogRotationPolicy) -> Result<Self> {
        Self::new_with_options(config, rotation, CoalescerOptions::default())
    }

    pub fn new_with_options(
        config: CoalescerConfig,
        rotation: LogRotationPolicy,
        options: CoalescerOptions,
    ) -> Result<Self> {
        Ok(Self {
            coalescer: WriteCoalescer::new_with_options(
                "log-lines",
                config,
                LogLineWriter::new(rotation),
                options,
            )?,
        })
    }

    pub fn from_env(options: CoalescerOptions) -> Result<Self> {
        Self::new_with_options(
            CoalescerConfig::log_lines_from_env(),
            LogRotationPolicy::from_env(),
            options,
        )
    }

    pub fn append_line(
        &self,
        path: impl AsRef<Path>,
        line: impl Into<String>,
    ) -> Result<(), CoalescerError> {
        self.coalescer.append(path.as_ref(), LogEntry::new(line))
    }

    pub async fn flush(&self, path: impl AsRef<Path>) -> Result<usize, CoalescerError> {
        self.coalescer.flush(path.as_ref()).await
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

    pub fn inner(&self) -> &WriteCoalescer<LogLineWriter> {
        &self.coalescer
    }
}

/// Convenience for callers that keep one log file per channel.
pub fn channel_log_path(root: &Path, channel: &str) -> PathBuf {
    root.join(format!("{channel}.log"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tau_core::{rotated_backup_path, LogRotationPolicy, ManualClock};
    use tau_io_telemetry::IoMetricsCollector;
    use tempfile::tempdir;

    use super::{channel_log_path, BatchWriter, LogCoalescer, LogEntry, LogLineWriter};
    use crate::coalescer::CoalescerOptions;
    use crate::config::CoalescerConfig;

    #[tokio::test]
    async fn unit_log_line_writer_appends_batch_in_order() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("nested/gateway.log");
        let writer = LogLineWriter::new(LogRotationPolicy::disabled());
        let bytes = writer
            .write_batch(&path, &[LogEntry::new("one"), LogEntry::new("two")])
            .await
            .expect("write");
        assert_eq!(bytes, 8);
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "one\ntwo\n");
    }

    #[tokio::test]
    async fn functional_log_coalescer_writes_one_physical_append_per_batch() {
        let temp = tempdir().expect("tempdir");
        let path = channel_log_path(temp.path(), "telegram");
        let telemetry = Arc::new(IoMetricsCollector::new(60_000, ManualClock::new(0).as_clock()));
        let coalescer = LogCoalescer::new_with_options(
            CoalescerConfig::log_lines(),
            LogRotationPolicy::disabled(),
            CoalescerOptions {
                telemetry: Some(telemetry.clone()),
                failure_sink: None,
            },
        )
        .expect("coalescer");
        for index in 0..40 {
            coalescer
                .append_line(&path, format!("{{\"seq\":{index}}}"))
                .expect("append");
        }
        assert_eq!(coalescer.flush(&path).await.expect("flush"), 40);

        let raw = std::fs::read_to_string(&path).expect("read log");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 40);
        assert_eq!(lines[0], "{\"seq\":0}");
        assert_eq!(lines[39], "{\"seq\":39}");

        let disk = &telemetry.snapshot().resources["disk"];
        assert_eq!(disk.physical_ops_total, 1);
        assert_eq!(disk.logical_ops_total, 40);
        coalescer.close().await;
    }

    #[tokio::test]
    async fn integration_batched_append_rotates_once_per_batch() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("gateway.log");
        std::fs::write(&path, "x".repeat(30)).expect("seed");
        let coalescer = LogCoalescer::new(
            CoalescerConfig::log_lines(),
            LogRotationPolicy {
                max_bytes: 32,
                max_files: 2,
            },
        )
        .expect("coalescer");
        coalescer.append_line(&path, "alpha").expect("append");
        coalescer.append_line(&path, "beta").expect("append");
        coalescer.close().await;

        assert_eq!(
            std::fs::read_to_string(&path).expect("current"),
            "alpha\nbeta\n"
        );
        assert_eq!(
            std::fs::read_to_string(rotated_backup_path(&path, 1)).expect("backup"),
            "x".repeat(30)
        );
        assert!(!rotated_backup_path(&path, 2).exists());
    }
}
