use std::collections::VecDeque;

/// Trailing-window event timestamps (Unix ms) with lazy pruning.
///
/// An event recorded at `t` is inside the window at `now` while
/// `now - t < window_ms`; an event exactly `window_ms` old is excluded.
#[derive(Debug, Clone)]
pub struct MetricWindow {
    window_ms: u64,
    timestamps: VecDeque<u64>,
}

impl MetricWindow {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms: window_ms.max(1),
            timestamps: VecDeque::new(),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn record(&mut self, now_unix_ms: u64) {
        self.prune(now_unix_ms);
        self.timestamps.push_back(now_unix_ms);
    }

    pub fn prune(&mut self, now_unix_ms: u64) {
        while let Some(oldest) = self.timestamps.front() {
            if now_unix_ms.saturating_sub(*oldest) < self.window_ms {
                break;
            }
            self.timestamps.pop_front();
        }
    }

    pub fn count(&mut self, now_unix_ms: u64) -> u64 {
        self.prune(now_unix_ms);
        u64::try_from(self.timestamps.len()).unwrap_or(u64::MAX)
    }

    /// Events per second across the full window length.
    pub fn rate_per_second(&mut self, now_unix_ms: u64) -> f64 {
        let count = self.count(now_unix_ms);
        count as f64 * 1_000.0 / self.window_ms as f64
    }

    pub fn oldest(&self) -> Option<u64> {
        self.timestamps.front().copied()
    }
}

pub(crate) fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / whole as f64
}

#[cfg(test)]
mod tests {
    use super::{percent, MetricWindow};

    #[test]
    fn unit_window_excludes_event_exactly_at_boundary() {
        let mut window = MetricWindow::new(1_000);
        window.record(10_000);
        assert_eq!(window.count(10_999), 1);
        assert_eq!(window.count(11_000), 0);
    }

    #[test]
    fn unit_window_keeps_early_events_when_clock_is_below_window_length() {
        let mut window = MetricWindow::new(60_000);
        window.record(0);
        window.record(10);
        assert_eq!(window.count(59_999), 2);
        assert_eq!(window.count(60_005), 1);
    }

    #[test]
    fn unit_rate_per_second_divides_by_window_length() {
        let mut window = MetricWindow::new(2_000);
        for offset in 0..10 {
            window.record(5_000 + offset);
        }
        let rate = window.rate_per_second(5_500);
        assert!((rate - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unit_zero_window_is_clamped() {
        let window = MetricWindow::new(0);
        assert_eq!(window.window_ms(), 1);
    }

    #[test]
    fn unit_percent_handles_empty_denominator() {
        assert_eq!(percent(3, 0), 0.0);
        assert!((percent(1, 4) - 25.0).abs() < f64::EPSILON);
    }
}
