use tau_core::{env_flag, env_positive_u64, env_positive_usize};

pub const DEFAULT_LOG_MAX_BATCH_ENTRIES: usize = 100;
pub const DEFAULT_LOG_DEBOUNCE_MS: u64 = 5_000;
pub const DEFAULT_SESSION_MAX_BATCH_ENTRIES: usize = 10;
pub const DEFAULT_SESSION_DEBOUNCE_MS: u64 = 2_000;
pub const DEFAULT_MAX_FLUSH_RETRIES: usize = 3;
pub const DEFAULT_MAX_RETRY_BACKOFF_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Flush triggers and retry bounds for one coalescer.
pub struct CoalescerConfig {
    /// Queue length that triggers a flush; also the largest batch handed to the writer.
    pub max_batch_entries: usize,
    pub debounce_ms: u64,
    /// Consecutive failures after which a batch is dropped.
    pub max_flush_retries: usize,
    pub max_retry_backoff_ms: u64,
    /// Writes every append on its own, without waiting for a debounce window.
    pub debounce_disabled: bool,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self::log_lines()
    }
}

impl CoalescerConfig {
    pub fn log_lines() -> Self {
        Self {
            max_batch_entries: DEFAULT_LOG_MAX_BATCH_ENTRIES,
            debounce_ms: DEFAULT_LOG_DEBOUNCE_MS,
            max_flush_retries: DEFAULT_MAX_FLUSH_RETRIES,
            max_retry_backoff_ms: DEFAULT_MAX_RETRY_BACKOFF_MS,
            debounce_disabled: false,
        }
    }

    pub fn session_snapshots() -> Self {
        Self {
            max_batch_entries: DEFAULT_SESSION_MAX_BATCH_ENTRIES,
            debounce_ms: DEFAULT_SESSION_DEBOUNCE_MS,
            ..Self::log_lines()
        }
    }

    pub fn log_lines_from_env() -> Self {
        Self::from_env_with_prefix("TAU_LOG_COALESCE", Self::log_lines())
    }

    pub fn session_snapshots_from_env() -> Self {
        Self::from_env_with_prefix("TAU_SESSION_COALESCE", Self::session_snapshots())
    }

    fn from_env_with_prefix(prefix: &str, defaults: Self) -> Self {
        Self {
            max_batch_entries: env_positive_usize(&format!("{prefix}_MAX_ENTRIES"))
                .unwrap_or(defaults.max_batch_entries),
            debounce_ms: env_positive_u64(&format!("{prefix}_DEBOUNCE_MS"))
                .unwrap_or(defaults.debounce_ms),
            max_flush_retries: env_positive_usize("TAU_COALESCE_MAX_FLUSH_RETRIES")
                .unwrap_or(defaults.max_flush_retries),
            max_retry_backoff_ms: defaults.max_retry_backoff_ms,
            debounce_disabled: env_flag("TAU_IO_DEBOUNCE_DISABLED")
                .unwrap_or(defaults.debounce_disabled),
        }
    }

    /// Batch ceiling actually applied; disabling debounce writes one entry at a time.
    pub(crate) fn effective_max_batch(&self) -> usize {
        if self.debounce_disabled {
            1
        } else {
            self.max_batch_entries.max(1)
        }
    }

    /// Backoff before retry number `failures` (1-based), doubling from the debounce interval.
    pub(crate) fn retry_backoff_ms(&self, failures: usize) -> u64 {
        let exponent = u32::try_from(failures.saturating_sub(1)).unwrap_or(u32::MAX).min(20);
        self.debounce_ms
            .max(1)
            .saturating_mul(1_u64 << exponent)
            .min(self.max_retry_backoff_ms.max(1))
    }
}
