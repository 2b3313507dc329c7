//! Debounced write coalescing for logs and session snapshots.
//!
//! Many small appends per destination turn into few physical writes. A
//! destination's queue flushes when it reaches its ceiling, when the debounce
//! window since its first unflushed entry elapses, or on explicit request.

mod coalescer;
mod config;
mod log_lines;
mod session_snapshots;

pub use coalescer::{
    BatchWriter, CoalescerError, CoalescerOptions, CoalescerStats, FlushFailure,
    FlushFailureSink, WriteCoalescer,
};
pub use config::{
    CoalescerConfig, DEFAULT_LOG_DEBOUNCE_MS, DEFAULT_LOG_MAX_BATCH_ENTRIES,
    DEFAULT_MAX_FLUSH_RETRIES, DEFAULT_MAX_RETRY_BACKOFF_MS, DEFAULT_SESSION_DEBOUNCE_MS,
    DEFAULT_SESSION_MAX_BATCH_ENTRIES,
};
pub use log_lines::{channel_log_path, LogCoalescer, LogEntry, LogLineWriter};
pub use session_snapshots::{
    ScheduleWriteOptions, SessionSnapshot, SessionSnapshotWriter, SessionWriteCoalescer,
};
