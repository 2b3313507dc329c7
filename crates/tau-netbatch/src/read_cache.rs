use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tau_core::{is_expired_unix_ms, lock_or_recover_mutex, system_clock, ClockFn};
use tau_io_telemetry::IoMetricsCollector;

use crate::config::ReadCacheConfig;

/// Identity of an idempotent read: the URL plus the headers it was sent with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl CacheRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Hex SHA-256 over the URL and the vary headers, names lowercased and sorted.
pub fn cache_key(request: &CacheRequest, vary_headers: &[String]) -> String {
    let mut relevant: Vec<(String, &str)> = request
        .headers
        .iter()
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.as_str()))
        .filter(|(name, _)| vary_headers.iter().any(|vary| vary.eq_ignore_ascii_case(name)))
        .collect();
    relevant.sort();

    let mut hasher = Sha256::new();
    hasher.update(request.url.as_bytes());
    for (name, value) in relevant {
        hasher.update(b"\n");
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue<V> {
    pub payload: V,
    pub validator: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ReadCacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub hits_total: u64,
    pub misses_total: u64,
    pub evictions_total: u64,
    pub expirations_total: u64,
    pub revalidations_total: u64,
}

struct CacheEntry<V> {
    payload: V,
    validator: Option<String>,
    stored_unix_ms: u64,
    last_access_unix_ms: u64,
    hits: u64,
    insertion_seq: u64,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    next_seq: u64,
    stats: ReadCacheStats,
}

/// Bounded TTL cache for idempotent reads with validator revalidation.
///
/// At the ceiling the least recently accessed entry is evicted; equal access
/// times evict the entry with fewer hits, then the older insertion.
pub struct ReadCache<V> {
    config: ReadCacheConfig,
    clock: ClockFn,
    telemetry: Option<Arc<IoMetricsCollector>>,
    state: Mutex<CacheState<V>>,
}

impl<V> std::fmt::Debug for ReadCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<V: Clone> ReadCache<V> {
    pub fn new(config: ReadCacheConfig) -> Self {
        Self::new_with_clock(config, system_clock(), None)
    }

    pub fn with_telemetry(config: ReadCacheConfig, telemetry: Arc<IoMetricsCollector>) -> Self {
        Self::new_with_clock(config, system_clock(), Some(telemetry))
    }

    pub fn new_with_clock(
        config: ReadCacheConfig,
        clock: ClockFn,
        telemetry: Option<Arc<IoMetricsCollector>>,
    ) -> Self {
        let config = ReadCacheConfig {
            max_entries: config.max_entries.max(1),
            ..config
        };
        Self {
            config,
            clock,
            telemetry,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                next_seq: 0,
                stats: ReadCacheStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &ReadCacheConfig {
        &self.config
    }

    pub fn key_for(&self, request: &CacheRequest) -> String {
        cache_key(request, &self.config.vary_headers)
    }

    /// Returns the payload and validator unless missing or past its TTL.
    /// Expired entries are removed and count as misses.
    pub fn get(&self, request: &CacheRequest) -> Option<CachedValue<V>> {
        let key = self.key_for(request);
        let now_unix_ms = (self.clock)();
        let result = {
            let mut state = lock_or_recover_mutex(&self.state);
            let expired = state
                .entries
                .get(&key)
                .map(|entry| self.is_expired(entry, now_unix_ms));
            match expired {
                None => {
                    state.stats.misses_total = state.stats.misses_total.saturating_add(1);
                    None
                }
                Some(true) => {
                    state.entries.remove(&key);
                    state.stats.expirations_total = state.stats.expirations_total.saturating_add(1);
                    state.stats.misses_total = state.stats.misses_total.saturating_add(1);
                    None
                }
                Some(false) => {
                    state.stats.hits_total = state.stats.hits_total.saturating_add(1);
                    state.entries.get_mut(&key).map(|entry| {
                        entry.hits = entry.hits.saturating_add(1);
                        entry.last_access_unix_ms = now_unix_ms;
                        CachedValue {
                            payload: entry.payload.clone(),
                            validator: entry.validator.clone(),
                        }
                    })
                }
            }
        };
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_cache_lookup(result.is_some());
        }
        result
    }

    /// Returns the stored entry regardless of TTL without touching stats or recency.
    pub fn peek(&self, request: &CacheRequest) -> Option<CachedValue<V>> {
        let key = self.key_for(request);
        lock_or_recover_mutex(&self.state)
            .entries
            .get(&key)
            .map(|entry| CachedValue {
                payload: entry.payload.clone(),
                validator: entry.validator.clone(),
            })
    }

    pub fn set(&self, request: &CacheRequest, payload: V, validator: Option<String>) {
        let key = self.key_for(request);
        let now_unix_ms = (self.clock)();
        let mut state = lock_or_recover_mutex(&self.state);
        if !state.entries.contains_key(&key) {
            while state.entries.len() >= self.config.max_entries {
                let Some(victim) = eviction_candidate(&state.entries) else {
                    break;
                };
                state.entries.remove(&victim);
                state.stats.evictions_total = state.stats.evictions_total.saturating_add(1);
            }
        }
        let insertion_seq = state.next_seq;
        state.next_seq = state.next_seq.wrapping_add(1);
        let hits = state.entries.get(&key).map(|entry| entry.hits).unwrap_or(0);
        state.entries.insert(
            key,
            CacheEntry {
                payload,
                validator,
                stored_unix_ms: now_unix_ms,
                last_access_unix_ms: now_unix_ms,
                hits,
                insertion_seq,
            },
        );
    }

    /// True when the entry's validator equals `validator`, regardless of TTL.
    /// A match renews the entry's TTL.
    pub fn is_valid(&self, request: &CacheRequest, validator: &str) -> bool {
        let key = self.key_for(request);
        let now_unix_ms = (self.clock)();
        let mut state = lock_or_recover_mutex(&self.state);
        let matched = match state.entries.get_mut(&key) {
            Some(entry) if entry.validator.as_deref() == Some(validator) => {
                entry.stored_unix_ms = now_unix_ms;
                entry.last_access_unix_ms = now_unix_ms;
                true
            }
            _ => false,
        };
        if matched {
            state.stats.revalidations_total = state.stats.revalidations_total.saturating_add(1);
        }
        matched
    }

    pub fn invalidate(&self, request: &CacheRequest) -> bool {
        let key = self.key_for(request);
        lock_or_recover_mutex(&self.state)
            .entries
            .remove(&key)
            .is_some()
    }

    pub fn clear(&self) {
        lock_or_recover_mutex(&self.state).entries.clear();
    }

    pub fn len(&self) -> usize {
        lock_or_recover_mutex(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ReadCacheStats {
        let state = lock_or_recover_mutex(&self.state);
        ReadCacheStats {
            entries: state.entries.len(),
            max_entries: self.config.max_entries,
            ..state.stats
        }
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now_unix_ms: u64) -> bool {
        is_expired_unix_ms(
            Some(entry.stored_unix_ms.saturating_add(self.config.ttl_ms)),
            now_unix_ms,
        )
    }
}

fn eviction_candidate<V>(entries: &HashMap<String, CacheEntry<V>>) -> Option<String> {
    entries
        .iter()
        .min_by_key(|(_, entry)| (entry.last_access_unix_ms, entry.hits, entry.insertion_seq))
        .map(|(key, _)| key.clone())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tau_core::ManualClock;
    use tau_io_telemetry::IoMetricsCollector;

    use super::{cache_key, CacheRequest, CachedValue, ReadCache};
    use crate::config::ReadCacheConfig;

    fn cache(clock: &ManualClock, max_entries: usize) -> ReadCache<String> {
        ReadCache::new_with_clock(
            ReadCacheConfig {
                max_entries,
                ttl_ms: 1_000,
                ..ReadCacheConfig::default()
            },
            clock.as_clock(),
            None,
        )
    }

    fn request(path: &str) -> CacheRequest {
        CacheRequest::new(format!("https://api.example.test{path}"))
    }

    #[test]
    fn unit_cache_key_ignores_header_case_order_and_unrelated_headers() {
        let vary = ReadCacheConfig::default().vary_headers;
        let left = request("/users")
            .with_header("Accept", "application/json")
            .with_header("Authorization", "Bearer a")
            .with_header("X-Request-Id", "1");
        let right = request("/users")
            .with_header("authorization", "Bearer a")
            .with_header("ACCEPT", "application/json")
            .with_header("x-request-id", "2");
        assert_eq!(cache_key(&left, &vary), cache_key(&right, &vary));
        assert_eq!(cache_key(&left, &vary).len(), 64);

        let other_token = request("/users").with_header("Authorization", "Bearer b");
        assert_ne!(cache_key(&left, &vary), cache_key(&other_token, &vary));
    }

    #[test]
    fn functional_get_returns_payload_until_ttl_elapses() {
        let clock = ManualClock::new(10_000);
        let cache = cache(&clock, 8);
        cache.set(&request("/a"), "alpha".to_string(), Some("v1".to_string()));
        assert_eq!(
            cache.get(&request("/a")),
            Some(CachedValue {
                payload: "alpha".to_string(),
                validator: Some("v1".to_string()),
            })
        );
        clock.advance_ms(999);
        assert!(cache.get(&request("/a")).is_some());
        clock.advance_ms(1);
        assert_eq!(cache.get(&request("/a")), None);
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hits_total, 2);
        assert_eq!(stats.misses_total, 1);
        assert_eq!(stats.expirations_total, 1);
    }

    #[test]
    fn functional_filling_past_ceiling_evicts_least_recently_used() {
        let clock = ManualClock::new(0);
        let cache = cache(&clock, 3);
        for path in ["/a", "/b", "/c"] {
            cache.set(&request(path), path.to_string(), None);
            clock.advance_ms(10);
        }
        assert!(cache.get(&request("/a")).is_some());
        clock.advance_ms(10);
        cache.set(&request("/d"), "/d".to_string(), None);

        assert_eq!(cache.len(), 3);
        assert!(cache.peek(&request("/b")).is_none());
        assert!(cache.peek(&request("/a")).is_some());
        assert!(cache.peek(&request("/c")).is_some());
        assert_eq!(cache.stats().evictions_total, 1);
    }

    #[test]
    fn regression_equal_recency_evicts_entry_with_fewer_hits() {
        let clock = ManualClock::new(0);
        let cache = cache(&clock, 2);
        cache.set(&request("/a"), "a".to_string(), None);
        cache.set(&request("/b"), "b".to_string(), None);
        assert!(cache.get(&request("/a")).is_some());
        cache.set(&request("/c"), "c".to_string(), None);
        assert!(cache.peek(&request("/a")).is_some());
        assert!(cache.peek(&request("/b")).is_none());
    }

    #[test]
    fn functional_is_valid_matches_validator_and_renews_ttl() {
        let clock = ManualClock::new(0);
        let cache = cache(&clock, 4);
        cache.set(&request("/feed"), "items".to_string(), Some("\"etag-1\"".to_string()));
        clock.advance_ms(5_000);
        assert!(!cache.is_valid(&request("/feed"), "\"etag-0\""));
        assert!(cache.is_valid(&request("/feed"), "\"etag-1\""));
        assert_eq!(
            cache.get(&request("/feed")).map(|value| value.payload),
            Some("items".to_string())
        );
        assert!(!cache.is_valid(&request("/missing"), "\"etag-1\""));
        assert_eq!(cache.stats().revalidations_total, 1);
    }

    #[test]
    fn integration_lookups_feed_cache_hit_rate() {
        let clock = ManualClock::new(0);
        let telemetry = Arc::new(IoMetricsCollector::new(60_000, clock.as_clock()));
        let cache: ReadCache<String> = ReadCache::new_with_clock(
            ReadCacheConfig::default(),
            clock.as_clock(),
            Some(telemetry.clone()),
        );
        assert!(cache.get(&request("/a")).is_none());
        cache.set(&request("/a"), "a".to_string(), None);
        assert!(cache.get(&request("/a")).is_some());
        assert!(cache.get(&request("/a")).is_some());
        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.cache.hits_total, 2);
        assert_eq!(snapshot.cache.misses_total, 1);
    }
}
