//! Outbound frame batching and an idempotent read cache for gateway sockets.

mod batcher;
mod cached_fetch;
mod config;
mod read_cache;

pub use batcher::{BatcherError, BatcherStats, MessagePriority, OutboundBatcher, OutboundTransport};
pub use cached_fetch::{
    fetch_cached, CachedFetch, CachedHttpClient, CachedHttpResponse, FetchOutcome, FetchSource,
};
pub use config::{
    BatcherConfig, ReadCacheConfig, DEFAULT_BATCH_INTERVAL_MS, DEFAULT_BATCH_MAX_MESSAGES,
    DEFAULT_READ_CACHE_MAX_ENTRIES, DEFAULT_READ_CACHE_TTL_MS, MAX_BATCH_INTERVAL_MS,
    MAX_BATCH_MAX_MESSAGES, MIN_BATCH_INTERVAL_MS, MIN_BATCH_MAX_MESSAGES,
};
pub use read_cache::{cache_key, CacheRequest, CachedValue, ReadCache, ReadCacheStats};
