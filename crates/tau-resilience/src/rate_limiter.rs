use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tau_core::{
    env_positive_u64, env_positive_usize, lock_or_recover_mutex, system_clock, ClockFn,
};
use tau_io_telemetry::RateLimitMetricsCollector;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 120,
            window_ms: 60_000,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_requests: env_positive_usize("TAU_RATE_LIMIT_MAX_REQUESTS")
                .unwrap_or(defaults.max_requests),
            window_ms: env_positive_u64("TAU_RATE_LIMIT_WINDOW_MS").unwrap_or(defaults.window_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit exceeded for '{key}': max {limit} requests per {window_ms}ms")]
pub struct RateLimitError {
    pub key: String,
    pub limit: usize,
    pub window_ms: u64,
    pub retry_after_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct RateLimitBucket {
    window_started_unix_ms: Option<u64>,
    accepted_requests: usize,
}

impl RateLimitBucket {
    fn is_current(&self, now_unix_ms: u64, window_ms: u64) -> bool {
        self.window_started_unix_ms
            .is_some_and(|started| now_unix_ms.saturating_sub(started) < window_ms)
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    buckets: HashMap<String, RateLimitBucket>,
    last_pruned_unix_ms: Option<u64>,
}

impl LimiterState {
    /// Drops buckets whose window ended more than one window ago. Runs at most
    /// once per window.
    fn prune_stale(&mut self, now_unix_ms: u64, window_ms: u64) {
        if self
            .last_pruned_unix_ms
            .is_some_and(|pruned| now_unix_ms.saturating_sub(pruned) < window_ms)
        {
            return;
        }
        self.last_pruned_unix_ms = Some(now_unix_ms);
        let stale_after_ms = window_ms.saturating_mul(2);
        self.buckets.retain(|_, bucket| {
            bucket
                .window_started_unix_ms
                .is_some_and(|started| now_unix_ms.saturating_sub(started) < stale_after_ms)
        });
    }
}

/// Per-key fixed-window request limiter.
pub struct FixedWindowRateLimiter {
    config: RateLimitConfig,
    clock: ClockFn,
    telemetry: Option<Arc<RateLimitMetricsCollector>>,
    state: Mutex<LimiterState>,
}

impl std::fmt::Debug for FixedWindowRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindowRateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FixedWindowRateLimiter {
    pub fn new(config: RateLimitConfig, telemetry: Option<Arc<RateLimitMetricsCollector>>) -> Self {
        Self::new_with_clock(config, system_clock(), telemetry)
    }

    pub fn new_with_clock(
        config: RateLimitConfig,
        clock: ClockFn,
        telemetry: Option<Arc<RateLimitMetricsCollector>>,
    ) -> Self {
        Self {
            config: RateLimitConfig {
                max_requests: config.max_requests.max(1),
                window_ms: config.window_ms.max(1),
            },
            clock,
            telemetry,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Admits one request for `key`, or rejects it until the window rolls over.
    pub fn check(&self, key: &str) -> Result<(), RateLimitError> {
        let now_unix_ms = (self.clock)();
        let window_ms = self.config.window_ms;
        let max_requests = self.config.max_requests;
        let decision = {
            let mut state = lock_or_recover_mutex(&self.state);
            state.prune_stale(now_unix_ms, window_ms);
            let bucket = state.buckets.entry(key.to_string()).or_default();
            if !bucket.is_current(now_unix_ms, window_ms) {
                bucket.window_started_unix_ms = Some(now_unix_ms);
                bucket.accepted_requests = 0;
            }
            if bucket.accepted_requests >= max_requests {
                let window_started_unix_ms = bucket.window_started_unix_ms.unwrap_or(now_unix_ms);
                Err(RateLimitError {
                    key: key.to_string(),
                    limit: max_requests,
                    window_ms,
                    retry_after_ms: window_started_unix_ms
                        .saturating_add(window_ms)
                        .saturating_sub(now_unix_ms),
                })
            } else {
                bucket.accepted_requests = bucket.accepted_requests.saturating_add(1);
                Ok(())
            }
        };
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_decision(key, decision.is_ok());
        }
        if decision.is_err() {
            tracing::debug!(key, max_requests, window_ms, "rate limit rejected request");
        }
        decision
    }

    /// Requests still admissible for `key` in its current window.
    pub fn remaining(&self, key: &str) -> usize {
        let now_unix_ms = (self.clock)();
        let state = lock_or_recover_mutex(&self.state);
        match state.buckets.get(key) {
            Some(bucket) if bucket.is_current(now_unix_ms, self.config.window_ms) => self
                .config
                .max_requests
                .saturating_sub(bucket.accepted_requests),
            _ => self.config.max_requests,
        }
    }

    /// Keys currently holding a bucket.
    pub fn tracked_keys(&self) -> usize {
        lock_or_recover_mutex(&self.state).buckets.len()
    }
}
