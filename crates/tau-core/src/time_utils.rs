use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Injectable wall clock returning Unix milliseconds.
pub type ClockFn = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns true when `expires_unix_ms` is present and no longer in the future.
pub fn is_expired_unix_ms(expires_unix_ms: Option<u64>, now_unix_ms: u64) -> bool {
    matches!(expires_unix_ms, Some(value) if value <= now_unix_ms)
}

/// Clock backed by the system time.
pub fn system_clock() -> ClockFn {
    Arc::new(current_unix_timestamp_ms)
}

/// Manually driven clock for deterministic tests and simulations.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_unix_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_unix_ms: u64) -> Self {
        Self {
            now_unix_ms: Arc::new(AtomicU64::new(start_unix_ms)),
        }
    }

    pub fn now_unix_ms(&self) -> u64 {
        self.now_unix_ms.load(Ordering::SeqCst)
    }

    pub fn set(&self, unix_ms: u64) {
        self.now_unix_ms.store(unix_ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: u64) -> u64 {
        self.now_unix_ms
            .fetch_add(delta_ms, Ordering::SeqCst)
            .saturating_add(delta_ms)
    }

    pub fn as_clock(&self) -> ClockFn {
        let now_unix_ms = self.now_unix_ms.clone();
        Arc::new(move || now_unix_ms.load(Ordering::SeqCst))
    }
}
