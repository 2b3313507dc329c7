use std::path::{Path, PathBuf};

use tau_coalesce::CoalescerConfig;
use tau_core::{env_flag, env_positive_u64, LogRotationPolicy};
use tau_io_telemetry::TelemetryConfig;
use tau_netbatch::{BatcherConfig, ReadCacheConfig};
use tau_resilience::{CircuitBreakerConfig, RateLimitConfig};
use tau_storage::StorageTuning;

pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;
pub const DATABASE_FILE_NAME: &str = "gateway.sqlite";

/// Settings for every component of an [`IoLayer`](crate::IoLayer).
///
/// `state_dir` roots the log files, session snapshots and database.
#[derive(Debug, Clone, PartialEq)]
pub struct IoLayerConfig {
    pub state_dir: PathBuf,
    pub telemetry: TelemetryConfig,
    pub breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub log_coalescer: CoalescerConfig,
    pub session_coalescer: CoalescerConfig,
    pub log_rotation: LogRotationPolicy,
    /// `None` runs without the embedded database.
    pub storage: Option<StorageTuning>,
    pub batcher: BatcherConfig,
    pub read_cache: ReadCacheConfig,
    pub http_timeout_ms: u64,
}

impl IoLayerConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            telemetry: TelemetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            log_coalescer: CoalescerConfig::log_lines(),
            session_coalescer: CoalescerConfig::session_snapshots(),
            log_rotation: LogRotationPolicy::default(),
            storage: Some(StorageTuning::default()),
            batcher: BatcherConfig::default(),
            read_cache: ReadCacheConfig::default(),
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
        }
    }

    pub fn from_env(state_dir: impl Into<PathBuf>) -> Self {
        let storage_disabled = env_flag("TAU_IO_STORAGE_DISABLED").unwrap_or(false);
        Self {
            state_dir: state_dir.into(),
            telemetry: TelemetryConfig::from_env(),
            breaker: CircuitBreakerConfig::from_env(),
            rate_limit: RateLimitConfig::from_env(),
            log_coalescer: CoalescerConfig::log_lines_from_env(),
            session_coalescer: CoalescerConfig::session_snapshots_from_env(),
            log_rotation: LogRotationPolicy::from_env(),
            storage: (!storage_disabled).then(StorageTuning::from_env),
            batcher: BatcherConfig::from_env(),
            read_cache: ReadCacheConfig::from_env(),
            http_timeout_ms: env_positive_u64("TAU_IO_HTTP_TIMEOUT_MS")
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_MS),
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join(DATABASE_FILE_NAME)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}

#[cfg(test)]
mod tests {
    use super::IoLayerConfig;

    #[test]
    fn unit_defaults_wire_component_presets() {
        let config = IoLayerConfig::new("/var/lib/tau");
        assert_eq!(config.log_coalescer.max_batch_entries, 100);
        assert_eq!(config.session_coalescer.max_batch_entries, 10);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert!(config.storage.is_some());
        assert_eq!(
            config.database_path(),
            std::path::Path::new("/var/lib/tau/gateway.sqlite")
        );
    }

    #[test]
    fn unit_from_env_can_disable_storage() {
        std::env::set_var("TAU_IO_STORAGE_DISABLED", "1");
        let config = IoLayerConfig::from_env("/tmp/tau-io");
        assert!(config.storage.is_none());
        std::env::remove_var("TAU_IO_STORAGE_DISABLED");
        assert!(IoLayerConfig::from_env("/tmp/tau-io").storage.is_some());
    }
}
