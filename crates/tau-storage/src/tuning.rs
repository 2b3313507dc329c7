use std::time::Duration;

use tau_core::env_positive_u64;

pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 5 * 60 * 1_000;
pub const DEFAULT_CACHE_SIZE_KIB: u64 = 8 * 1_024;
pub const DEFAULT_JOURNAL_SIZE_LIMIT_BYTES: u64 = 64 * 1_024 * 1_024;
pub const DEFAULT_WAL_AUTOCHECKPOINT_PAGES: u64 = 1_000;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Pragmas and checkpoint cadence applied when a store is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageTuning {
    pub cache_size_kib: u64,
    pub journal_size_limit_bytes: u64,
    pub wal_autocheckpoint_pages: u64,
    pub busy_timeout_ms: u64,
    /// Zero disables the background PASSIVE checkpoint task.
    pub checkpoint_interval_ms: u64,
}

impl Default for StorageTuning {
    fn default() -> Self {
        Self {
            cache_size_kib: DEFAULT_CACHE_SIZE_KIB,
            journal_size_limit_bytes: DEFAULT_JOURNAL_SIZE_LIMIT_BYTES,
            wal_autocheckpoint_pages: DEFAULT_WAL_AUTOCHECKPOINT_PAGES,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            checkpoint_interval_ms: DEFAULT_CHECKPOINT_INTERVAL_MS,
        }
    }
}

impl StorageTuning {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache_size_kib: env_positive_u64("TAU_SQLITE_CACHE_SIZE_KIB")
                .unwrap_or(defaults.cache_size_kib),
            journal_size_limit_bytes: env_positive_u64("TAU_SQLITE_JOURNAL_SIZE_LIMIT_BYTES")
                .unwrap_or(defaults.journal_size_limit_bytes),
            checkpoint_interval_ms: env_positive_u64("TAU_SQLITE_CHECKPOINT_INTERVAL_MS")
                .unwrap_or(defaults.checkpoint_interval_ms),
            ..defaults
        }
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.checkpoint_interval_ms > 0).then(|| Duration::from_millis(self.checkpoint_interval_ms))
    }

    pub(crate) fn pragma_batch(&self) -> String {
        format!(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            PRAGMA cache_size = -{cache_size_kib};
            PRAGMA journal_size_limit = {journal_size_limit_bytes};
            PRAGMA wal_autocheckpoint = {wal_autocheckpoint_pages};
            "#,
            cache_size_kib = self.cache_size_kib.max(1),
            journal_size_limit_bytes = self.journal_size_limit_bytes,
            wal_autocheckpoint_pages = self.wal_autocheckpoint_pages,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::StorageTuning;

    #[test]
    fn unit_defaults_bound_cache_and_wal_growth() {
        let tuning = StorageTuning::default();
        assert_eq!(tuning.cache_size_kib, 8_192);
        assert_eq!(tuning.journal_size_limit_bytes, 67_108_864);
        assert_eq!(tuning.checkpoint_interval_ms, 300_000);
        assert!(tuning.pragma_batch().contains("PRAGMA cache_size = -8192;"));
    }

    #[test]
    fn unit_from_env_reads_overrides_and_ignores_invalid() {
        std::env::set_var("TAU_SQLITE_CACHE_SIZE_KIB", "2048");
        std::env::set_var("TAU_SQLITE_CHECKPOINT_INTERVAL_MS", "-5");
        let tuning = StorageTuning::from_env();
        assert_eq!(tuning.cache_size_kib, 2_048);
        assert_eq!(tuning.checkpoint_interval_ms, 300_000);
        std::env::remove_var("TAU_SQLITE_CACHE_SIZE_KIB");
        std::env::remove_var("TAU_SQLITE_CHECKPOINT_INTERVAL_MS");
    }

    #[test]
    fn unit_zero_interval_disables_scheduler() {
        let tuning = StorageTuning {
            checkpoint_interval_ms: 0,
            ..StorageTuning::default()
        };
        assert!(tuning.checkpoint_interval().is_none());
    }
}
