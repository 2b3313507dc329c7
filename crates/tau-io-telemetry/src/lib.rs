//! Rolling-window telemetry counters for the Tau I/O layer.
//!
//! Three collectors share one design: lifetime totals plus a lazily pruned
//! timestamp window. `snapshot()` returns plain values; pruning expired
//! window entries is its only side effect.

mod circuit_metrics;
mod io_metrics;
mod metric_window;
mod rate_limit_metrics;

use std::sync::Arc;

use serde::Serialize;
use tau_core::{env_positive_u64, system_clock, ClockFn};

pub use circuit_metrics::{
    CircuitMetricsCollector, CircuitMetricsSnapshot, CircuitState, CircuitTransitionRecord,
    CircuitTransitionSnapshot,
};
pub use io_metrics::{
    CacheLookupSnapshot, IoMetricsCollector, IoMetricsSnapshot, IoResourceKind,
    IoResourceSnapshot,
};
pub use metric_window::MetricWindow;
pub use rate_limit_metrics::{
    EndpointRateLimitSnapshot, RateLimitMetricsCollector, RateLimitMetricsSnapshot,
};

pub const DEFAULT_TELEMETRY_WINDOW_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub window_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_TELEMETRY_WINDOW_MS,
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self {
            window_ms: env_positive_u64("TAU_IO_TELEMETRY_WINDOW_MS")
                .unwrap_or(DEFAULT_TELEMETRY_WINDOW_MS),
        }
    }
}

/// The three collectors sharing one clock and window length.
#[derive(Debug, Clone)]
pub struct TelemetryHub {
    pub io: Arc<IoMetricsCollector>,
    pub rate_limits: Arc<RateLimitMetricsCollector>,
    pub circuits: Arc<CircuitMetricsCollector>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TelemetrySnapshot {
    pub io: IoMetricsSnapshot,
    pub rate_limits: RateLimitMetricsSnapshot,
    pub circuits: CircuitMetricsSnapshot,
}

impl TelemetryHub {
    pub fn new(config: TelemetryConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: TelemetryConfig, clock: ClockFn) -> Self {
        Self {
            io: Arc::new(IoMetricsCollector::new(config.window_ms, clock.clone())),
            rate_limits: Arc::new(RateLimitMetricsCollector::new(
                config.window_ms,
                clock.clone(),
            )),
            circuits: Arc::new(CircuitMetricsCollector::new(config.window_ms, clock)),
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            io: self.io.snapshot(),
            rate_limits: self.rate_limits.snapshot(),
            circuits: self.circuits.snapshot(),
        }
    }
}
