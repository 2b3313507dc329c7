use tau_core::{env_flag, env_positive_u64, env_positive_usize};

pub const DEFAULT_BATCH_INTERVAL_MS: u64 = 250;
pub const MIN_BATCH_INTERVAL_MS: u64 = 100;
pub const MAX_BATCH_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_BATCH_MAX_MESSAGES: usize = 16;
pub const MIN_BATCH_MAX_MESSAGES: usize = 10;
pub const MAX_BATCH_MAX_MESSAGES: usize = 20;

pub const DEFAULT_READ_CACHE_MAX_ENTRIES: usize = 256;
pub const DEFAULT_READ_CACHE_TTL_MS: u64 = 5 * 60 * 1_000;

/// Outbound frame batching. Interval and ceiling are clamped to the
/// supported ranges when the batcher is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatcherConfig {
    pub batch_interval_ms: u64,
    pub max_batch_messages: usize,
    /// Sends every frame directly regardless of priority.
    pub disabled: bool,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: DEFAULT_BATCH_INTERVAL_MS,
            max_batch_messages: DEFAULT_BATCH_MAX_MESSAGES,
            disabled: false,
        }
    }
}

impl BatcherConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_interval_ms: env_positive_u64("TAU_NET_BATCH_INTERVAL_MS")
                .unwrap_or(defaults.batch_interval_ms),
            max_batch_messages: env_positive_usize("TAU_NET_BATCH_MAX_MESSAGES")
                .unwrap_or(defaults.max_batch_messages),
            disabled: env_flag("TAU_NET_BATCHING_DISABLED").unwrap_or(defaults.disabled),
        }
        .clamped()
    }

    pub fn clamped(self) -> Self {
        Self {
            batch_interval_ms: self
                .batch_interval_ms
                .clamp(MIN_BATCH_INTERVAL_MS, MAX_BATCH_INTERVAL_MS),
            max_batch_messages: self
                .max_batch_messages
                .clamp(MIN_BATCH_MAX_MESSAGES, MAX_BATCH_MAX_MESSAGES),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCacheConfig {
    pub max_entries: usize,
    pub ttl_ms: u64,
    /// Request headers that take part in the cache key. Compared lowercased.
    pub vary_headers: Vec<String>,
}

impl Default for ReadCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_READ_CACHE_MAX_ENTRIES,
            ttl_ms: DEFAULT_READ_CACHE_TTL_MS,
            vary_headers: ["accept", "accept-language", "authorization"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

impl ReadCacheConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_entries: env_positive_usize("TAU_READ_CACHE_MAX_ENTRIES")
                .unwrap_or(defaults.max_entries),
            ttl_ms: env_positive_u64("TAU_READ_CACHE_TTL_MS").unwrap_or(defaults.ttl_ms),
            ..defaults
        }
    }
}
