use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;
use tau_core::{lock_or_recover_mutex, ClockFn};

use crate::metric_window::{percent, MetricWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
/// Kind of resource an I/O operation touched.
pub enum IoResourceKind {
    Disk,
    Database,
    Network,
    Cache,
}

impl IoResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disk => "disk",
            Self::Database => "database",
            Self::Network => "network",
            Self::Cache => "cache",
        }
    }
}

impl std::fmt::Display for IoResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct ResourceCounters {
    physical_ops_total: u64,
    logical_ops_total: u64,
    bytes_total: u64,
    failures_total: u64,
    window: MetricWindow,
}

impl ResourceCounters {
    fn new(window_ms: u64) -> Self {
        Self {
            physical_ops_total: 0,
            logical_ops_total: 0,
            bytes_total: 0,
            failures_total: 0,
            window: MetricWindow::new(window_ms),
        }
    }
}

#[derive(Debug)]
struct IoMetricsState {
    resources: BTreeMap<IoResourceKind, ResourceCounters>,
    all_ops: MetricWindow,
    cache_hits_total: u64,
    cache_misses_total: u64,
    cache_lookups: MetricWindow,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
/// Point-in-time view of one resource kind.
pub struct IoResourceSnapshot {
    pub physical_ops_total: u64,
    pub logical_ops_total: u64,
    pub bytes_total: u64,
    pub failures_total: u64,
    pub ops_in_window: u64,
    pub ops_per_second: f64,
    /// Share of logical operations absorbed by batching/coalescing.
    pub coalescing_saved_percent: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheLookupSnapshot {
    pub hits_total: u64,
    pub misses_total: u64,
    pub lookups_in_window: u64,
    pub hit_rate_percent: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IoMetricsSnapshot {
    pub window_ms: u64,
    pub captured_unix_ms: u64,
    pub physical_ops_total: u64,
    pub bytes_total: u64,
    pub ops_in_window: u64,
    pub ops_per_second: f64,
    pub resources: BTreeMap<String, IoResourceSnapshot>,
    pub cache: CacheLookupSnapshot,
}

/// Lifetime and trailing-window I/O volume per resource kind.
pub struct IoMetricsCollector {
    clock: ClockFn,
    window_ms: u64,
    state: Mutex<IoMetricsState>,
}

impl std::fmt::Debug for IoMetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoMetricsCollector")
            .field("window_ms", &self.window_ms)
            .finish_non_exhaustive()
    }
}

impl IoMetricsCollector {
    pub fn new(window_ms: u64, clock: ClockFn) -> Self {
        let window_ms = window_ms.max(1);
        Self {
            clock,
            window_ms,
            state: Mutex::new(IoMetricsState {
                resources: BTreeMap::new(),
                all_ops: MetricWindow::new(window_ms),
                cache_hits_total: 0,
                cache_misses_total: 0,
                cache_lookups: MetricWindow::new(window_ms),
            }),
        }
    }

    /// Records one physical write that carried `logical_ops` coalesced entries.
    pub fn record_write(&self, kind: IoResourceKind, bytes: u64, logical_ops: u64) {
        self.record_operation(kind, bytes, logical_ops.max(1));
    }

    pub fn record_read(&self, kind: IoResourceKind, bytes: u64) {
        self.record_operation(kind, bytes, 1);
    }

    pub fn record_failure(&self, kind: IoResourceKind) {
        let window_ms = self.window_ms;
        let mut state = lock_or_recover_mutex(&self.state);
        let counters = state
            .resources
            .entry(kind)
            .or_insert_with(|| ResourceCounters::new(window_ms));
        counters.failures_total = counters.failures_total.saturating_add(1);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        let now_unix_ms = (self.clock)();
        let mut state = lock_or_recover_mutex(&self.state);
        if hit {
            state.cache_hits_total = state.cache_hits_total.saturating_add(1);
        } else {
            state.cache_misses_total = state.cache_misses_total.saturating_add(1);
        }
        state.cache_lookups.record(now_unix_ms);
    }

    fn record_operation(&self, kind: IoResourceKind, bytes: u64, logical_ops: u64) {
        let now_unix_ms = (self.clock)();
        let window_ms = self.window_ms;
        let mut state = lock_or_recover_mutex(&self.state);
        state.all_ops.record(now_unix_ms);
        let counters = state
            .resources
            .entry(kind)
            .or_insert_with(|| ResourceCounters::new(window_ms));
        counters.physical_ops_total = counters.physical_ops_total.saturating_add(1);
        counters.logical_ops_total = counters.logical_ops_total.saturating_add(logical_ops);
        counters.bytes_total = counters.bytes_total.saturating_add(bytes);
        counters.window.record(now_unix_ms);
    }

    /// Builds a snapshot. Prunes expired window entries as a side effect.
    pub fn snapshot(&self) -> IoMetricsSnapshot {
        let now_unix_ms = (self.clock)();
        let mut state = lock_or_recover_mutex(&self.state);

        let mut resources = BTreeMap::new();
        let mut physical_ops_total = 0_u64;
        let mut bytes_total = 0_u64;
        for (kind, counters) in state.resources.iter_mut() {
            physical_ops_total = physical_ops_total.saturating_add(counters.physical_ops_total);
            bytes_total = bytes_total.saturating_add(counters.bytes_total);
            let saved = counters
                .logical_ops_total
                .saturating_sub(counters.physical_ops_total);
            resources.insert(
                kind.as_str().to_string(),
                IoResourceSnapshot {
                    physical_ops_total: counters.physical_ops_total,
                    logical_ops_total: counters.logical_ops_total,
                    bytes_total: counters.bytes_total,
                    failures_total: counters.failures_total,
                    ops_in_window: counters.window.count(now_unix_ms),
                    ops_per_second: counters.window.rate_per_second(now_unix_ms),
                    coalescing_saved_percent: percent(saved, counters.logical_ops_total),
                },
            );
        }

        let hits_total = state.cache_hits_total;
        let misses_total = state.cache_misses_total;
        IoMetricsSnapshot {
            window_ms: self.window_ms,
            captured_unix_ms: now_unix_ms,
            physical_ops_total,
            bytes_total,
            ops_in_window: state.all_ops.count(now_unix_ms),
            ops_per_second: state.all_ops.rate_per_second(now_unix_ms),
            resources,
            cache: CacheLookupSnapshot {
                hits_total,
                misses_total,
                lookups_in_window: state.cache_lookups.count(now_unix_ms),
                hit_rate_percent: percent(hits_total, hits_total.saturating_add(misses_total)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use tau_core::ManualClock;

    use super::{IoMetricsCollector, IoResourceKind};

    #[test]
    fn unit_record_write_tracks_coalescing_savings() {
        let clock = ManualClock::new(1_000);
        let collector = IoMetricsCollector::new(10_000, clock.as_clock());
        collector.record_write(IoResourceKind::Disk, 400, 100);
        collector.record_write(IoResourceKind::Disk, 200, 50);

        let snapshot = collector.snapshot();
        let disk = &snapshot.resources["disk"];
        assert_eq!(disk.physical_ops_total, 2);
        assert_eq!(disk.logical_ops_total, 150);
        assert_eq!(disk.bytes_total, 600);
        assert!((disk.coalescing_saved_percent - (148.0 * 100.0 / 150.0)).abs() < 1e-9);
        assert_eq!(snapshot.physical_ops_total, 2);
        assert_eq!(snapshot.bytes_total, 600);
    }

    #[test]
    fn functional_snapshot_prunes_window_but_keeps_lifetime_totals() {
        let clock = ManualClock::new(50_000);
        let collector = IoMetricsCollector::new(1_000, clock.as_clock());
        collector.record_read(IoResourceKind::Network, 10);
        clock.advance_ms(500);
        collector.record_read(IoResourceKind::Network, 10);

        clock.advance_ms(500);
        let snapshot = collector.snapshot();
        let network = &snapshot.resources["network"];
        assert_eq!(network.ops_in_window, 1, "first read sits exactly on the boundary");
        assert_eq!(network.physical_ops_total, 2);
        assert_eq!(snapshot.ops_in_window, 1);

        clock.advance_ms(10_000);
        let later = collector.snapshot();
        assert_eq!(later.resources["network"].ops_in_window, 0);
        assert_eq!(later.resources["network"].physical_ops_total, 2);
    }

    #[test]
    fn unit_cache_lookup_hit_rate() {
        let clock = ManualClock::new(0);
        let collector = IoMetricsCollector::new(60_000, clock.as_clock());
        collector.record_cache_lookup(true);
        collector.record_cache_lookup(true);
        collector.record_cache_lookup(true);
        collector.record_cache_lookup(false);
        let cache = collector.snapshot().cache;
        assert_eq!(cache.hits_total, 3);
        assert_eq!(cache.misses_total, 1);
        assert!((cache.hit_rate_percent - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unit_failures_do_not_count_as_operations() {
        let clock = ManualClock::new(0);
        let collector = IoMetricsCollector::new(60_000, clock.as_clock());
        collector.record_failure(IoResourceKind::Database);
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.resources["database"].failures_total, 1);
        assert_eq!(snapshot.physical_ops_total, 0);
    }
}
