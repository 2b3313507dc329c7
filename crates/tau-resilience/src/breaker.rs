use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tau_core::{
    env_positive_u64, env_positive_usize, lock_or_recover_mutex, system_clock, ClockFn,
};
use tau_io_telemetry::{CircuitMetricsCollector, CircuitState};
use thiserror::Error;
use tokio::task::JoinHandle;

pub const DEFAULT_FAILURE_THRESHOLD: usize = 5;
pub const DEFAULT_RESET_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HALF_OPEN_MAX_ATTEMPTS: usize = 3;
pub const HALF_OPEN_RETRY_AFTER_MAX_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Thresholds for one circuit breaker.
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub reset_timeout_ms: u64,
    pub half_open_max_attempts: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout_ms: DEFAULT_RESET_TIMEOUT_MS,
            half_open_max_attempts: DEFAULT_HALF_OPEN_MAX_ATTEMPTS,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            failure_threshold: env_positive_usize("TAU_CIRCUIT_FAILURE_THRESHOLD")
                .unwrap_or(defaults.failure_threshold),
            reset_timeout_ms: env_positive_u64("TAU_CIRCUIT_RESET_TIMEOUT_MS")
                .unwrap_or(defaults.reset_timeout_ms),
            half_open_max_attempts: env_positive_usize("TAU_CIRCUIT_HALF_OPEN_MAX_ATTEMPTS")
                .unwrap_or(defaults.half_open_max_attempts),
        }
    }
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit '{name}' is open; retry after {retry_after_ms}ms")]
    Open { name: String, retry_after_ms: u64 },
    #[error("circuit breaker has been disposed")]
    Disposed,
    #[error("{0}")]
    Operation(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Returns the wrapped operation error, if the operation ran.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation(error) => Some(error),
            Self::Open { .. } | Self::Disposed => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: usize,
    pub success_count: usize,
    pub in_flight_probes: usize,
    pub last_failure_unix_ms: Option<u64>,
    pub opened_unix_ms: Option<u64>,
    pub disposed: bool,
    pub failure_threshold: usize,
    pub reset_timeout_ms: u64,
    pub half_open_max_attempts: usize,
}

#[derive(Debug, Clone)]
struct BreakerState {
    state: CircuitState,
    failure_count: usize,
    success_count: usize,
    in_flight_probes: usize,
    last_failure_unix_ms: Option<u64>,
    opened_unix_ms: Option<u64>,
    disposed: bool,
    /// Bumped on every transition; outcomes from an older epoch are ignored.
    epoch: u64,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            in_flight_probes: 0,
            last_failure_unix_ms: None,
            opened_unix_ms: None,
            disposed: false,
            epoch: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal { epoch: u64 },
    Probe { epoch: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    CountedFailure,
    IgnoredFailure,
}

type Transition = (CircuitState, CircuitState, u64);

struct BreakerInner {
    name: String,
    config: CircuitBreakerConfig,
    clock: ClockFn,
    telemetry: Option<Arc<CircuitMetricsCollector>>,
    state: Mutex<BreakerState>,
    reset_timer: Mutex<Option<JoinHandle<()>>>,
}

/// Closed / Open / HalfOpen circuit breaker around fallible async operations.
///
/// Cloning shares the same circuit. The Open to HalfOpen transition is
/// evaluated lazily on every call; the reset timer only nudges it.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::new_with_clock(name, config, system_clock(), None)
    }

    pub fn with_telemetry(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        telemetry: Arc<CircuitMetricsCollector>,
    ) -> Self {
        Self::new_with_clock(name, config, system_clock(), Some(telemetry))
    }

    pub fn new_with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: ClockFn,
        telemetry: Option<Arc<CircuitMetricsCollector>>,
    ) -> Self {
        let config = CircuitBreakerConfig {
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout_ms: config.reset_timeout_ms,
            half_open_max_attempts: config.half_open_max_attempts.max(1),
        };
        Self {
            inner: Arc::new(BreakerInner {
                name: name.into(),
                config,
                clock,
                telemetry,
                state: Mutex::new(BreakerState::closed()),
                reset_timer: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.inner.config
    }

    /// Current state, applying a due Open to HalfOpen transition first.
    pub fn state(&self) -> CircuitState {
        self.inner.poll_reset_timeout();
        lock_or_recover_mutex(&self.inner.state).state
    }

    /// Runs `operation` under breaker protection; every error counts as a failure.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_classified(operation, |_| true).await
    }

    /// Like [`execute`](Self::execute), but only errors for which `is_failure`
    /// returns true count toward opening the circuit. All errors are returned.
    pub async fn execute_classified<T, E, F, Fut, C>(
        &self,
        operation: F,
        is_failure: C,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        let admission = self.inner.admit()?;
        let mut guard = AdmissionGuard {
            inner: &self.inner,
            admission,
            completed: false,
        };
        let result = operation().await;
        guard.completed = true;
        match result {
            Ok(value) => {
                self.inner.complete(admission, Outcome::Success);
                Ok(value)
            }
            Err(error) => {
                let outcome = if is_failure(&error) {
                    Outcome::CountedFailure
                } else {
                    Outcome::IgnoredFailure
                };
                self.inner.complete(admission, outcome);
                Err(CircuitBreakerError::Operation(error))
            }
        }
    }

    /// Forces the circuit Closed and clears all counters.
    pub fn reset(&self) {
        let now_unix_ms = (self.inner.clock)();
        let transition = {
            let mut state = lock_or_recover_mutex(&self.inner.state);
            if state.disposed {
                return;
            }
            let from = state.state;
            let epoch = state.epoch.wrapping_add(1);
            *state = BreakerState::closed();
            state.epoch = epoch;
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed, now_unix_ms))
        };
        self.inner.abort_reset_timer();
        self.inner.report(transition);
    }

    /// Stops the reset timer and rejects every later call. Idempotent.
    pub fn dispose(&self) {
        {
            let mut state = lock_or_recover_mutex(&self.inner.state);
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.in_flight_probes = 0;
        }
        self.inner.abort_reset_timer();
        tracing::debug!(circuit = %self.inner.name, "circuit breaker disposed");
    }

    pub fn is_disposed(&self) -> bool {
        lock_or_recover_mutex(&self.inner.state).disposed
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        self.inner.poll_reset_timeout();
        let state = lock_or_recover_mutex(&self.inner.state);
        CircuitBreakerSnapshot {
            name: self.inner.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            in_flight_probes: state.in_flight_probes,
            last_failure_unix_ms: state.last_failure_unix_ms,
            opened_unix_ms: state.opened_unix_ms,
            disposed: state.disposed,
            failure_threshold: self.inner.config.failure_threshold,
            reset_timeout_ms: self.inner.config.reset_timeout_ms,
            half_open_max_attempts: self.inner.config.half_open_max_attempts,
        }
    }
}

struct AdmissionGuard<'a> {
    inner: &'a BreakerInner,
    admission: Admission,
    completed: bool,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        // Cancelled or panicked probes must give their slot back.
        if !self.completed {
            if let Admission::Probe { epoch } = self.admission {
                let mut state = lock_or_recover_mutex(&self.inner.state);
                if state.epoch == epoch {
                    state.in_flight_probes = state.in_flight_probes.saturating_sub(1);
                }
            }
        }
    }
}

impl BreakerInner {
    fn admit<E>(&self) -> Result<Admission, CircuitBreakerError<E>> {
        let now_unix_ms = (self.clock)();
        let mut transition = None;
        let decision = {
            let mut state = lock_or_recover_mutex(&self.state);
            if state.disposed {
                return Err(CircuitBreakerError::Disposed);
            }
            if state.state == CircuitState::Open {
                transition = self.half_open_if_due(&mut state, now_unix_ms);
            }
            match state.state {
                CircuitState::Closed => Ok(Admission::Normal { epoch: state.epoch }),
                CircuitState::Open => Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                    retry_after_ms: self.retry_after_ms(&state, now_unix_ms),
                }),
                CircuitState::HalfOpen => {
                    let admitted = state.in_flight_probes.saturating_add(state.success_count);
                    if admitted < self.config.half_open_max_attempts {
                        state.in_flight_probes = state.in_flight_probes.saturating_add(1);
                        Ok(Admission::Probe { epoch: state.epoch })
                    } else {
                        Err(CircuitBreakerError::Open {
                            name: self.name.clone(),
                            retry_after_ms: self.half_open_retry_after_ms(),
                        })
                    }
                }
            }
        };
        self.report(transition);
        decision
    }

    fn complete(self: &Arc<Self>, admission: Admission, outcome: Outcome) {
        let now_unix_ms = (self.clock)();
        let transition = {
            let mut state = lock_or_recover_mutex(&self.state);
            if state.disposed {
                return;
            }
            match admission {
                Admission::Normal { epoch } => {
                    if state.epoch != epoch || state.state != CircuitState::Closed {
                        return;
                    }
                    match outcome {
                        Outcome::Success => {
                            state.failure_count = 0;
                            None
                        }
                        Outcome::IgnoredFailure => None,
                        Outcome::CountedFailure => {
                            state.failure_count = state.failure_count.saturating_add(1);
                            state.last_failure_unix_ms = Some(now_unix_ms);
                            if state.failure_count >= self.config.failure_threshold {
                                Some(self.open(&mut state, now_unix_ms))
                            } else {
                                None
                            }
                        }
                    }
                }
                Admission::Probe { epoch } => {
                    if state.epoch != epoch || state.state != CircuitState::HalfOpen {
                        return;
                    }
                    state.in_flight_probes = state.in_flight_probes.saturating_sub(1);
                    match outcome {
                        Outcome::Success => {
                            state.success_count = state.success_count.saturating_add(1);
                            if state.success_count >= self.config.half_open_max_attempts {
                                let epoch = state.epoch.wrapping_add(1);
                                *state = BreakerState::closed();
                                state.epoch = epoch;
                                Some((CircuitState::HalfOpen, CircuitState::Closed, now_unix_ms))
                            } else {
                                None
                            }
                        }
                        Outcome::IgnoredFailure => None,
                        Outcome::CountedFailure => {
                            state.last_failure_unix_ms = Some(now_unix_ms);
                            Some(self.open(&mut state, now_unix_ms))
                        }
                    }
                }
            }
        };
        if let Some((_, CircuitState::Open, _)) = transition {
            self.arm_reset_timer();
        } else if let Some((_, CircuitState::Closed, _)) = transition {
            self.abort_reset_timer();
        }
        self.report(transition);
    }

    fn open(&self, state: &mut BreakerState, now_unix_ms: u64) -> Transition {
        let from = state.state;
        state.state = CircuitState::Open;
        state.opened_unix_ms = Some(now_unix_ms);
        state.failure_count = 0;
        state.success_count = 0;
        state.in_flight_probes = 0;
        state.epoch = state.epoch.wrapping_add(1);
        (from, CircuitState::Open, now_unix_ms)
    }

    fn half_open_if_due(&self, state: &mut BreakerState, now_unix_ms: u64) -> Option<Transition> {
        let opened_unix_ms = state.opened_unix_ms.unwrap_or(0);
        if now_unix_ms.saturating_sub(opened_unix_ms) < self.config.reset_timeout_ms {
            return None;
        }
        state.state = CircuitState::HalfOpen;
        state.success_count = 0;
        state.in_flight_probes = 0;
        state.epoch = state.epoch.wrapping_add(1);
        Some((CircuitState::Open, CircuitState::HalfOpen, now_unix_ms))
    }

    /// Probes are still in flight, so the wait is unknown; suggest a short
    /// pause bounded by the reset timeout.
    fn half_open_retry_after_ms(&self) -> u64 {
        self.config
            .reset_timeout_ms
            .clamp(1, HALF_OPEN_RETRY_AFTER_MAX_MS)
    }

    fn retry_after_ms(&self, state: &BreakerState, now_unix_ms: u64) -> u64 {
        let opened_unix_ms = state.opened_unix_ms.unwrap_or(now_unix_ms);
        opened_unix_ms
            .saturating_add(self.config.reset_timeout_ms)
            .saturating_sub(now_unix_ms)
    }

    fn poll_reset_timeout(&self) {
        let now_unix_ms = (self.clock)();
        let transition = {
            let mut state = lock_or_recover_mutex(&self.state);
            if state.disposed || state.state != CircuitState::Open {
                return;
            }
            self.half_open_if_due(&mut state, now_unix_ms)
        };
        self.report(transition);
    }

    fn report(&self, transition: Option<Transition>) {
        let Some((from, to, at_unix_ms)) = transition else {
            return;
        };
        match to {
            CircuitState::Open => tracing::warn!(
                circuit = %self.name,
                from = %from,
                reset_timeout_ms = self.config.reset_timeout_ms,
                "circuit opened"
            ),
            CircuitState::HalfOpen => {
                tracing::debug!(circuit = %self.name, "circuit half-open; admitting probes")
            }
            CircuitState::Closed => {
                tracing::info!(circuit = %self.name, from = %from, "circuit closed")
            }
        }
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_transition_at(&self.name, from, to, at_unix_ms);
        }
    }

    fn arm_reset_timer(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let delay = Duration::from_millis(self.config.reset_timeout_ms);
        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.poll_reset_timeout();
            }
        });
        let previous = lock_or_recover_mutex(&self.reset_timer).replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn abort_reset_timer(&self) {
        if let Some(task) = lock_or_recover_mutex(&self.reset_timer).take() {
            task.abort();
        }
    }
}

impl Drop for BreakerInner {
    fn drop(&mut self) {
        self.abort_reset_timer();
    }
}
