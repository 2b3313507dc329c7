use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;
use tau_core::{lock_or_recover_mutex, ClockFn};

use crate::metric_window::MetricWindow;

const RECENT_TRANSITIONS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
/// Circuit breaker state.
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CircuitTransitionRecord {
    pub circuit: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at_unix_ms: u64,
}

#[derive(Debug, Clone, Default)]
struct RecoveryStats {
    count: u64,
    total_ms: u64,
    max_ms: u64,
}

#[derive(Debug, Clone)]
struct CircuitCounters {
    current_state: CircuitState,
    transitions_total: u64,
    opens_total: u64,
    last_transition_unix_ms: u64,
    last_opened_unix_ms: Option<u64>,
    recovery: RecoveryStats,
    window: MetricWindow,
}

#[derive(Debug)]
struct CircuitMetricsState {
    transitions_total: u64,
    window: MetricWindow,
    circuits: BTreeMap<String, CircuitCounters>,
    recent: VecDeque<CircuitTransitionRecord>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CircuitTransitionSnapshot {
    pub current_state: CircuitState,
    pub transitions_total: u64,
    pub transitions_in_window: u64,
    pub opens_total: u64,
    pub last_transition_unix_ms: u64,
    pub recovery_count: u64,
    pub average_recovery_ms: Option<f64>,
    pub max_recovery_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CircuitMetricsSnapshot {
    pub window_ms: u64,
    pub captured_unix_ms: u64,
    pub transitions_total: u64,
    pub transitions_in_window: u64,
    pub transitions_per_second: f64,
    pub open_circuits: Vec<String>,
    pub circuits: BTreeMap<String, CircuitTransitionSnapshot>,
    /// Most recent transitions still inside the window, oldest first.
    pub recent_transitions: Vec<CircuitTransitionRecord>,
}

/// Breaker state transitions per circuit, with recovery-time statistics.
///
/// Recovery time is measured from the most recent transition into `Open`
/// to the next transition into `Closed`.
pub struct CircuitMetricsCollector {
    clock: ClockFn,
    window_ms: u64,
    state: Mutex<CircuitMetricsState>,
}

impl std::fmt::Debug for CircuitMetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitMetricsCollector")
            .field("window_ms", &self.window_ms)
            .finish_non_exhaustive()
    }
}

impl CircuitMetricsCollector {
    pub fn new(window_ms: u64, clock: ClockFn) -> Self {
        let window_ms = window_ms.max(1);
        Self {
            clock,
            window_ms,
            state: Mutex::new(CircuitMetricsState {
                transitions_total: 0,
                window: MetricWindow::new(window_ms),
                circuits: BTreeMap::new(),
                recent: VecDeque::with_capacity(RECENT_TRANSITIONS_CAPACITY),
            }),
        }
    }

    pub fn record_transition(&self, circuit: &str, from: CircuitState, to: CircuitState) {
        let now_unix_ms = (self.clock)();
        self.record_transition_at(circuit, from, to, now_unix_ms);
    }

    /// Records a transition observed at `at_unix_ms` (the breaker's own clock).
    pub fn record_transition_at(
        &self,
        circuit: &str,
        from: CircuitState,
        to: CircuitState,
        at_unix_ms: u64,
    ) {
        let window_ms = self.window_ms;
        let mut state = lock_or_recover_mutex(&self.state);
        state.transitions_total = state.transitions_total.saturating_add(1);
        state.window.record(at_unix_ms);

        let counters = state
            .circuits
            .entry(circuit.to_string())
            .or_insert_with(|| CircuitCounters {
                current_state: from,
                transitions_total: 0,
                opens_total: 0,
                last_transition_unix_ms: 0,
                last_opened_unix_ms: None,
                recovery: RecoveryStats::default(),
                window: MetricWindow::new(window_ms),
            });
        counters.current_state = to;
        counters.transitions_total = counters.transitions_total.saturating_add(1);
        counters.last_transition_unix_ms = at_unix_ms;
        counters.window.record(at_unix_ms);
        match to {
            CircuitState::Open => {
                counters.opens_total = counters.opens_total.saturating_add(1);
                counters.last_opened_unix_ms = Some(at_unix_ms);
            }
            CircuitState::Closed => {
                if let Some(opened_at) = counters.last_opened_unix_ms.take() {
                    let recovery_ms = at_unix_ms.saturating_sub(opened_at);
                    let recovery = &mut counters.recovery;
                    recovery.count = recovery.count.saturating_add(1);
                    recovery.total_ms = recovery.total_ms.saturating_add(recovery_ms);
                    recovery.max_ms = recovery.max_ms.max(recovery_ms);
                }
            }
            CircuitState::HalfOpen => {}
        }

        if state.recent.len() >= RECENT_TRANSITIONS_CAPACITY {
            state.recent.pop_front();
        }
        state.recent.push_back(CircuitTransitionRecord {
            circuit: circuit.to_string(),
            from,
            to,
            at_unix_ms,
        });
    }

    /// Builds a snapshot. Prunes expired window entries as a side effect.
    pub fn snapshot(&self) -> CircuitMetricsSnapshot {
        let now_unix_ms = (self.clock)();
        let window_ms = self.window_ms;
        let mut state = lock_or_recover_mutex(&self.state);

        while let Some(oldest) = state.recent.front() {
            if now_unix_ms.saturating_sub(oldest.at_unix_ms) < window_ms {
                break;
            }
            state.recent.pop_front();
        }

        let mut open_circuits = Vec::new();
        let mut circuits = BTreeMap::new();
        for (name, counters) in state.circuits.iter_mut() {
            if counters.current_state != CircuitState::Closed {
                open_circuits.push(name.clone());
            }
            let recovery = &counters.recovery;
            let (average_recovery_ms, max_recovery_ms) = if recovery.count == 0 {
                (None, None)
            } else {
                (
                    Some(recovery.total_ms as f64 / recovery.count as f64),
                    Some(recovery.max_ms),
                )
            };
            circuits.insert(
                name.clone(),
                CircuitTransitionSnapshot {
                    current_state: counters.current_state,
                    transitions_total: counters.transitions_total,
                    transitions_in_window: counters.window.count(now_unix_ms),
                    opens_total: counters.opens_total,
                    last_transition_unix_ms: counters.last_transition_unix_ms,
                    recovery_count: recovery.count,
                    average_recovery_ms,
                    max_recovery_ms,
                },
            );
        }

        CircuitMetricsSnapshot {
            window_ms,
            captured_unix_ms: now_unix_ms,
            transitions_total: state.transitions_total,
            transitions_in_window: state.window.count(now_unix_ms),
            transitions_per_second: state.window.rate_per_second(now_unix_ms),
            open_circuits,
            circuits,
            recent_transitions: state.recent.iter().cloned().collect(),
        }
    }
}
