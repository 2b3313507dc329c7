//! Foundational low-level utilities shared across Tau I/O crates.
//!
//! Provides the injectable clock, atomic file-write and batched log-append
//! helpers, env parsing for `from_env` configs, and a poison-tolerant mutex
//! accessor.

pub mod atomic_io;
pub mod env_config;
pub mod log_rotation;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use env_config::{env_flag, env_positive_u64, env_positive_usize};
pub use log_rotation::{append_lines_with_rotation, rotated_backup_path, LogRotationPolicy};
pub use time_utils::{
    current_unix_timestamp_ms, is_expired_unix_ms, system_clock, ClockFn,
    ManualClock,
};

use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, recovering the guard when a previous holder panicked.
pub fn lock_or_recover_mutex<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
