use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::env_config::env_positive_u64;

const DEFAULT_LOG_ROTATION_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_LOG_ROTATION_MAX_FILES: usize = 5;

/// Configuration for size-based log rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for LogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_LOG_ROTATION_MAX_BYTES,
            max_files: DEFAULT_LOG_ROTATION_MAX_FILES,
        }
    }
}

impl LogRotationPolicy {
    /// Build policy from env vars with safe defaults.
    pub fn from_env() -> Self {
        let max_files = env_positive_u64("TAU_LOG_ROTATION_MAX_FILES")
            .and_then(|value| usize::try_from(value).ok())
            .unwrap_or(DEFAULT_LOG_ROTATION_MAX_FILES);
        Self {
            max_bytes: env_positive_u64("TAU_LOG_ROTATION_MAX_BYTES")
                .unwrap_or(DEFAULT_LOG_ROTATION_MAX_BYTES),
            max_files,
        }
    }

    /// Rotation that never triggers.
    pub fn disabled() -> Self {
        Self {
            max_bytes: 0,
            max_files: 0,
        }
    }

    /// Returns true when size-based rotation is enabled.
    pub fn is_enabled(self) -> bool {
        self.max_bytes > 0 && self.max_files > 0
    }
}

/// Appends a batch of lines to `path` with one open, one write and one flush.
///
/// Rotation is decided once for the whole batch so a batch never straddles two
/// files. Returns the number of bytes written.
pub fn append_lines_with_rotation<S: AsRef<str>>(
    path: &Path,
    lines: &[S],
    policy: LogRotationPolicy,
) -> Result<u64> {
    if lines.is_empty() {
        return Ok(0);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let mut buffer = String::with_capacity(
        lines
            .iter()
            .map(|line| line.as_ref().len().saturating_add(1))
            .sum(),
    );
    for line in lines {
        buffer.push_str(line.as_ref());
        buffer.push('\n');
    }
    let incoming_size = u64::try_from(buffer.len()).unwrap_or(u64::MAX);

    if policy.is_enabled() && path.exists() {
        let current_size = std::fs::metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        if current_size > 0 && current_size.saturating_add(incoming_size) > policy.max_bytes {
            rotate_log_file(path, policy)?;
        }
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(buffer.as_bytes())
        .with_context(|| format!("failed to append {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(incoming_size)
}

/// Path of the `index`-th rotated backup of `path`.
pub fn rotated_backup_path(path: &Path, index: usize) -> PathBuf {
    PathBuf::from(format!("{}.{}", path.display(), index))
}

fn rotate_log_file(path: &Path, policy: LogRotationPolicy) -> Result<()> {
    if !path.exists() || !policy.is_enabled() {
        return Ok(());
    }

    if policy.max_files <= 1 {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to rotate {}", path.display()))?;
        return Ok(());
    }

    let max_backup_index = policy.max_files.saturating_sub(1);
    for index in (1..=max_backup_index).rev() {
        let source = if index == 1 {
            path.to_path_buf()
        } else {
            rotated_backup_path(path, index.saturating_sub(1))
        };
        if !source.exists() {
            continue;
        }
        let destination = rotated_backup_path(path, index);
        if destination.exists() {
            std::fs::remove_file(&destination).with_context(|| {
                format!("failed to replace rotated log {}", destination.display())
            })?;
        }
        std::fs::rename(&source, &destination).with_context(|| {
            format!(
                "failed to rotate {} to {}",
                source.display(),
                destination.display()
            )
        })?;
    }
    Ok(())
}
