use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;
use tau_core::{lock_or_recover_mutex, ClockFn};

use crate::metric_window::{percent, MetricWindow};

#[derive(Debug, Clone)]
struct EndpointCounters {
    allowed_total: u64,
    rejected_total: u64,
    last_rejection_unix_ms: Option<u64>,
    rejections: MetricWindow,
}

#[derive(Debug)]
struct RateLimitMetricsState {
    allowed_total: u64,
    rejected_total: u64,
    rejections: MetricWindow,
    endpoints: BTreeMap<String, EndpointCounters>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EndpointRateLimitSnapshot {
    pub allowed_total: u64,
    pub rejected_total: u64,
    pub rejections_in_window: u64,
    pub rejection_percent: f64,
    pub last_rejection_unix_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RateLimitMetricsSnapshot {
    pub window_ms: u64,
    pub captured_unix_ms: u64,
    pub requests_total: u64,
    pub rejections_total: u64,
    pub rejections_in_window: u64,
    pub rejections_per_second: f64,
    pub rejection_percent: f64,
    pub endpoints: BTreeMap<String, EndpointRateLimitSnapshot>,
}

/// Rate-limit decisions per endpoint with a trailing rejection rate.
pub struct RateLimitMetricsCollector {
    clock: ClockFn,
    window_ms: u64,
    state: Mutex<RateLimitMetricsState>,
}

impl std::fmt::Debug for RateLimitMetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitMetricsCollector")
            .field("window_ms", &self.window_ms)
            .finish_non_exhaustive()
    }
}

impl RateLimitMetricsCollector {
    pub fn new(window_ms: u64, clock: ClockFn) -> Self {
        let window_ms = window_ms.max(1);
        Self {
            clock,
            window_ms,
            state: Mutex::new(RateLimitMetricsState {
                allowed_total: 0,
                rejected_total: 0,
                rejections: MetricWindow::new(window_ms),
                endpoints: BTreeMap::new(),
            }),
        }
    }

    pub fn record_allowed(&self, endpoint: &str) {
        self.record_decision(endpoint, true);
    }

    pub fn record_rejection(&self, endpoint: &str) {
        self.record_decision(endpoint, false);
    }

    pub fn record_decision(&self, endpoint: &str, allowed: bool) {
        let now_unix_ms = (self.clock)();
        let window_ms = self.window_ms;
        let mut state = lock_or_recover_mutex(&self.state);
        if allowed {
            state.allowed_total = state.allowed_total.saturating_add(1);
        } else {
            state.rejected_total = state.rejected_total.saturating_add(1);
            state.rejections.record(now_unix_ms);
        }
        let counters = state
            .endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointCounters {
                allowed_total: 0,
                rejected_total: 0,
                last_rejection_unix_ms: None,
                rejections: MetricWindow::new(window_ms),
            });
        if allowed {
            counters.allowed_total = counters.allowed_total.saturating_add(1);
        } else {
            counters.rejected_total = counters.rejected_total.saturating_add(1);
            counters.last_rejection_unix_ms = Some(now_unix_ms);
            counters.rejections.record(now_unix_ms);
        }
    }

    /// Builds a snapshot. Prunes expired window entries as a side effect.
    pub fn snapshot(&self) -> RateLimitMetricsSnapshot {
        let now_unix_ms = (self.clock)();
        let mut state = lock_or_recover_mutex(&self.state);

        let endpoints: BTreeMap<String, EndpointRateLimitSnapshot> = state
            .endpoints
            .iter_mut()
            .map(|(endpoint, counters)| {
                let requests = counters.allowed_total.saturating_add(counters.rejected_total);
                (
                    endpoint.clone(),
                    EndpointRateLimitSnapshot {
                        allowed_total: counters.allowed_total,
                        rejected_total: counters.rejected_total,
                        rejections_in_window: counters.rejections.count(now_unix_ms),
                        rejection_percent: percent(counters.rejected_total, requests),
                        last_rejection_unix_ms: counters.last_rejection_unix_ms,
                    },
                )
            })
            .collect();

        let requests_total = state.allowed_total.saturating_add(state.rejected_total);
        RateLimitMetricsSnapshot {
            window_ms: self.window_ms,
            captured_unix_ms: now_unix_ms,
            requests_total,
            rejections_total: state.rejected_total,
            rejections_in_window: state.rejections.count(now_unix_ms),
            rejections_per_second: state.rejections.rate_per_second(now_unix_ms),
            rejection_percent: percent(state.rejected_total, requests_total),
            endpoints,
        }
    }
}

#[cfg(test)]
mod tests {
    use tau_core::ManualClock;

    use super::RateLimitMetricsCollector;

    #[test]
    fn unit_rate_limit_snapshot_breaks_down_by_endpoint() {
        let clock = ManualClock::new(10_000);
        let collector = RateLimitMetricsCollector::new(60_000, clock.as_clock());
        collector.record_allowed("telegram/send");
        collector.record_allowed("telegram/send");
        collector.record_rejection("telegram/send");
        collector.record_rejection("discord/send");

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.requests_total, 4);
        assert_eq!(snapshot.rejections_total, 2);
        assert!((snapshot.rejection_percent - 50.0).abs() < f64::EPSILON);

        let telegram = &snapshot.endpoints["telegram/send"];
        assert_eq!(telegram.allowed_total, 2);
        assert_eq!(telegram.rejected_total, 1);
        assert_eq!(telegram.last_rejection_unix_ms, Some(10_000));
        assert!((telegram.rejection_percent - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(snapshot.endpoints["discord/send"].rejections_in_window, 1);
    }

    #[test]
    fn functional_rejections_leave_window_but_stay_in_lifetime_totals() {
        let clock = ManualClock::new(0);
        let collector = RateLimitMetricsCollector::new(5_000, clock.as_clock());
        collector.record_rejection("slack/post");
        clock.advance_ms(4_999);
        assert_eq!(collector.snapshot().rejections_in_window, 1);
        clock.advance_ms(1);
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.rejections_in_window, 0);
        assert_eq!(snapshot.rejections_per_second, 0.0);
        assert_eq!(snapshot.rejections_total, 1);
        assert_eq!(snapshot.endpoints["slack/post"].rejections_in_window, 0);
    }
}
