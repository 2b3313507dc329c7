use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tau_core::lock_or_recover_mutex;
use tau_io_telemetry::{IoMetricsCollector, IoResourceKind};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::CoalescerConfig;

/// Performs one physical write for a whole batch of coalesced entries.
#[async_trait]
pub trait BatchWriter: Send + Sync + 'static {
    type Entry: Send + Sync + 'static;

    /// Writes `entries` to `destination` all-or-nothing. Returns bytes written.
    async fn write_batch(&self, destination: &Path, entries: &[Self::Entry]) -> Result<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoalescerError {
    #[error("write coalescer '{name}' is closed")]
    Closed { name: String },
    #[error(
        "flush of {} failed (attempt {attempts}, dropped={dropped}): {message}",
        .destination.display()
    )]
    Flush {
        destination: PathBuf,
        attempts: usize,
        dropped: bool,
        message: String,
    },
}

/// A batch dropped after exhausting its retries.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FlushFailure {
    pub coalescer: String,
    pub destination: PathBuf,
    pub dropped_entries: usize,
    pub attempts: usize,
    pub error: String,
}

pub type FlushFailureSink = Arc<dyn Fn(&FlushFailure) + Send + Sync>;

#[derive(Clone, Default)]
pub struct CoalescerOptions {
    pub telemetry: Option<Arc<IoMetricsCollector>>,
    pub failure_sink: Option<FlushFailureSink>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CoalescerStats {
    pub pending_entries: usize,
    pub destinations: usize,
    pub appended_total: u64,
    pub flushed_entries_total: u64,
    pub flush_batches_total: u64,
    pub flush_failures_total: u64,
    pub dropped_entries_total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushMode {
    /// Ceiling or debounce timer; honors retry backoff and stops below a full batch.
    Background,
    /// Caller-requested; drains the destination and reports failures.
    Explicit,
    /// Shutdown drain; one immediate retry per failing batch, then drop.
    Closing,
}

struct DestinationQueue<E> {
    entries: VecDeque<E>,
    flushing: bool,
    flush_scheduled: bool,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    consecutive_failures: usize,
    retry_not_before: Option<Instant>,
}

impl<E> DestinationQueue<E> {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            flushing: false,
            flush_scheduled: false,
            timer: None,
            timer_generation: 0,
            consecutive_failures: 0,
            retry_not_before: None,
        }
    }

    /// Nothing queued, in flight, scheduled or awaiting a retry.
    fn is_idle(&self) -> bool {
        self.entries.is_empty()
            && !self.flushing
            && !self.flush_scheduled
            && self.timer.is_none()
            && self.consecutive_failures == 0
            && self.retry_not_before.is_none()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.timer_generation = self.timer_generation.wrapping_add(1);
    }
}

struct CoalescerState<E> {
    closed: bool,
    queues: BTreeMap<PathBuf, DestinationQueue<E>>,
    totals: CoalescerStats,
}

enum AfterWrite {
    Loop,
    Return(Result<usize, CoalescerError>),
}

struct CoalescerInner<W: BatchWriter> {
    name: String,
    config: CoalescerConfig,
    writer: W,
    runtime: Handle,
    options: CoalescerOptions,
    state: Mutex<CoalescerState<W::Entry>>,
    flush_done: Notify,
}

/// Debounced, size-capped write batching keyed by destination path.
///
/// `append` never blocks on I/O. Each destination flushes when its queue
/// reaches `max_batch_entries`, when the debounce timer fires, or on an
/// explicit `flush`/`flush_all`/`close`. Order is FIFO per destination.
pub struct WriteCoalescer<W: BatchWriter> {
    inner: Arc<CoalescerInner<W>>,
}

impl<W: BatchWriter> Clone for WriteCoalescer<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W: BatchWriter> std::fmt::Debug for WriteCoalescer<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCoalescer")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<W: BatchWriter> WriteCoalescer<W> {
    pub fn new(name: impl Into<String>, config: CoalescerConfig, writer: W) -> Result<Self> {
        Self::new_with_options(name, config, writer, CoalescerOptions::default())
    }

    pub fn new_with_options(
        name: impl Into<String>,
        config: CoalescerConfig,
        writer: W,
        options: CoalescerOptions,
    ) -> Result<Self> {
        let runtime =
            Handle::try_current().context("write coalescer requires an active tokio runtime")?;
        Ok(Self {
            inner: Arc::new(CoalescerInner {
                name: name.into(),
                config,
                writer,
                runtime,
                options,
                state: Mutex::new(CoalescerState {
                    closed: false,
                    queues: BTreeMap::new(),
                    totals: CoalescerStats::default(),
                }),
                flush_done: Notify::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> CoalescerConfig {
        self.inner.config
    }

    pub fn writer(&self) -> &W {
        &self.inner.writer
    }

    /// Queues `entry` for `destination` and returns without waiting for I/O.
    pub fn append(&self, destination: &Path, entry: W::Entry) -> Result<(), CoalescerError> {
        let inner = &self.inner;
        let max_batch = inner.config.effective_max_batch();
        let mut guard = lock_or_recover_mutex(&inner.state);
        let state = &mut *guard;
        if state.closed {
            return Err(CoalescerError::Closed {
                name: inner.name.clone(),
            });
        }
        state.totals.appended_total = state.totals.appended_total.saturating_add(1);
        let queue = state
            .queues
            .entry(destination.to_path_buf())
            .or_insert_with(DestinationQueue::new);
        queue.entries.push_back(entry);
        if queue.flushing || queue.flush_scheduled {
            return Ok(());
        }
        if queue.entries.len() >= max_batch && queue.retry_not_before.is_none() {
            queue.flush_scheduled = true;
            inner.spawn_background_flush(destination);
        } else if queue.timer.is_none() {
            let delay = inner.initial_delay(queue);
            inner.arm_timer(destination, queue, delay);
        }
        Ok(())
    }

    /// Flushes everything queued for `destination`, waiting for an in-flight flush first.
    #[tracing::instrument(
        name = "coalescer.flush",
        skip_all,
        fields(coalescer = %self.inner.name, destination = %destination.display())
    )]
    pub async fn flush(&self, destination: &Path) -> Result<usize, CoalescerError> {
        self.inner
            .flush_destination(destination, FlushMode::Explicit)
            .await
    }

    /// Flushes every destination; returns the first failure after attempting all.
    pub async fn flush_all(&self) -> Result<usize, CoalescerError> {
        let destinations = self.inner.destinations();
        let mut flushed = 0_usize;
        let mut first_error = None;
        for destination in destinations {
            match self
                .inner
                .flush_destination(&destination, FlushMode::Explicit)
                .await
            {
                Ok(count) => flushed = flushed.saturating_add(count),
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(flushed),
        }
    }

    /// Drains every destination and rejects later appends. Idempotent.
    pub async fn close(&self) {
        let destinations = {
            let mut state = lock_or_recover_mutex(&self.inner.state);
            state.closed = true;
            for queue in state.queues.values_mut() {
                queue.cancel_timer();
            }
            state.queues.keys().cloned().collect::<Vec<_>>()
        };
        for destination in &destinations {
            let _ = self
                .inner
                .flush_destination(destination, FlushMode::Closing)
                .await;
        }
        tracing::debug!(
            coalescer = %self.inner.name,
            destinations = destinations.len(),
            "write coalescer closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        lock_or_recover_mutex(&self.inner.state).closed
    }

    pub fn pending_entries(&self, destination: &Path) -> usize {
        lock_or_recover_mutex(&self.inner.state)
            .queues
            .get(destination)
            .map(|queue| queue.entries.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CoalescerStats {
        let state = lock_or_recover_mutex(&self.inner.state);
        let mut stats = state.totals;
        stats.pending_entries = state
            .queues
            .values()
            .map(|queue| queue.entries.len())
            .sum();
        stats.destinations = state
            .queues
            .values()
            .filter(|queue| !queue.entries.is_empty())
            .count();
        stats
    }
}

impl<W: BatchWriter> CoalescerInner<W> {
    fn destinations(&self) -> Vec<PathBuf> {
        lock_or_recover_mutex(&self.state)
            .queues
            .keys()
            .cloned()
            .collect()
    }

    fn initial_delay(&self, queue: &DestinationQueue<W::Entry>) -> Duration {
        match queue.retry_not_before {
            Some(not_before) => not_before.saturating_duration_since(Instant::now()),
            None => Duration::from_millis(self.config.debounce_ms),
        }
    }

    fn spawn_background_flush(self: &Arc<Self>, destination: &Path) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let destination = destination.to_path_buf();
        self.runtime.spawn(async move {
            if let Some(inner) = weak.upgrade() {
                let _ = inner
                    .flush_destination(&destination, FlushMode::Background)
                    .await;
            }
        });
    }

    fn arm_timer(
        self: &Arc<Self>,
        destination: &Path,
        queue: &mut DestinationQueue<W::Entry>,
        delay: Duration,
    ) {
        queue.cancel_timer();
        let generation = queue.timer_generation;
        let weak: Weak<Self> = Arc::downgrade(self);
        let destination = destination.to_path_buf();
        queue.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.on_timer(&destination, generation).await;
        }));
    }

    async fn on_timer(self: &Arc<Self>, destination: &Path, generation: u64) {
        {
            let mut state = lock_or_recover_mutex(&self.state);
            let Some(queue) = state.queues.get_mut(destination) else {
                return;
            };
            if queue.timer_generation != generation {
                return;
            }
            // Drop our own handle without aborting the running task.
            queue.timer = None;
        }
        let _ = self
            .flush_destination(destination, FlushMode::Background)
            .await;
    }

    async fn flush_destination(
        self: &Arc<Self>,
        destination: &Path,
        mode: FlushMode,
    ) -> Result<usize, CoalescerError> {
        let max_batch = self.config.effective_max_batch();
        let mut flushed = 0_usize;
        let mut close_retry_used = false;
        loop {
            let notified = self.flush_done.notified();
            tokio::pin!(notified);
            let batch = {
                let mut guard = lock_or_recover_mutex(&self.state);
                let Some(queue) = guard.queues.get_mut(destination) else {
                    return Ok(flushed);
                };
                if mode == FlushMode::Background {
                    queue.flush_scheduled = false;
                }
                if queue.flushing {
                    if mode == FlushMode::Background {
                        return Ok(flushed);
                    }
                    notified.as_mut().enable();
                    None
                } else if queue.entries.is_empty() {
                    if queue.is_idle() {
                        guard.queues.remove(destination);
                    }
                    return Ok(flushed);
                } else if mode == FlushMode::Background
                    && queue
                        .retry_not_before
                        .is_some_and(|not_before| Instant::now() < not_before)
                {
                    if queue.timer.is_none() {
                        let delay = self.initial_delay(queue);
                        self.arm_timer(destination, queue, delay);
                    }
                    return Ok(flushed);
                } else {
                    let take = queue.entries.len().min(max_batch);
                    let batch: Vec<W::Entry> = queue.entries.drain(..take).collect();
                    queue.flushing = true;
                    queue.cancel_timer();
                    Some(batch)
                }
            };
            let Some(batch) = batch else {
                notified.await;
                continue;
            };

            let batch_len = batch.len();
            let result = self.writer.write_batch(destination, &batch).await;
            let mut dropped_report = None;
            let after = {
                let mut guard = lock_or_recover_mutex(&self.state);
                let state = &mut *guard;
                let closed = state.closed;
                match state.queues.get_mut(destination) {
                    None => AfterWrite::Return(Ok(flushed)),
                    Some(queue) => {
                        queue.flushing = false;
                        match result {
                            Ok(bytes) => {
                                queue.consecutive_failures = 0;
                                queue.retry_not_before = None;
                                let totals = &mut state.totals;
                                totals.flush_batches_total =
                                    totals.flush_batches_total.saturating_add(1);
                                totals.flushed_entries_total = totals
                                    .flushed_entries_total
                                    .saturating_add(batch_len as u64);
                                if let Some(telemetry) = &self.options.telemetry {
                                    telemetry.record_write(
                                        IoResourceKind::Disk,
                                        bytes,
                                        batch_len as u64,
                                    );
                                }
                                flushed = flushed.saturating_add(batch_len);
                                close_retry_used = false;
                                self.next_step(destination, queue, mode, closed, max_batch, flushed)
                            }
                            Err(error) => {
                                state.totals.flush_failures_total =
                                    state.totals.flush_failures_total.saturating_add(1);
                                if let Some(telemetry) = &self.options.telemetry {
                                    telemetry.record_failure(IoResourceKind::Disk);
                                }
                                queue.consecutive_failures =
                                    queue.consecutive_failures.saturating_add(1);
                                let attempts = queue.consecutive_failures;
                                let message = format!("{error:#}");
                                let exhausted = attempts >= self.config.max_flush_retries.max(1)
                                    || (mode == FlushMode::Closing && close_retry_used);
                                if exhausted {
                                    queue.consecutive_failures = 0;
                                    queue.retry_not_before = None;
                                    state.totals.dropped_entries_total = state
                                        .totals
                                        .dropped_entries_total
                                        .saturating_add(batch_len as u64);
                                    close_retry_used = false;
                                    dropped_report = Some(FlushFailure {
                                        coalescer: self.name.clone(),
                                        destination: destination.to_path_buf(),
                                        dropped_entries: batch_len,
                                        attempts,
                                        error: message.clone(),
                                    });
                                    match mode {
                                        FlushMode::Explicit => {
                                            self.rearm_after_failure(destination, queue, closed);
                                            AfterWrite::Return(Err(CoalescerError::Flush {
                                                destination: destination.to_path_buf(),
                                                attempts,
                                                dropped: true,
                                                message,
                                            }))
                                        }
                                        FlushMode::Background | FlushMode::Closing => self
                                            .next_step(
                                                destination,
                                                queue,
                                                mode,
                                                closed,
                                                max_batch,
                                                flushed,
                                            ),
                                    }
                                } else {
                                    for entry in batch.into_iter().rev() {
                                        queue.entries.push_front(entry);
                                    }
                                    let backoff_ms = self.config.retry_backoff_ms(attempts);
                                    queue.retry_not_before =
                                        Some(Instant::now() + Duration::from_millis(backoff_ms));
                                    tracing::warn!(
                                        coalescer = %self.name,
                                        destination = %destination.display(),
                                        attempts,
                                        backoff_ms,
                                        error = %message,
                                        "batch write failed; entries re-queued"
                                    );
                                    match mode {
                                        FlushMode::Closing => {
                                            close_retry_used = true;
                                            AfterWrite::Loop
                                        }
                                        FlushMode::Background => {
                                            self.rearm_after_failure(destination, queue, closed);
                                            AfterWrite::Return(Ok(flushed))
                                        }
                                        FlushMode::Explicit => {
                                            self.rearm_after_failure(destination, queue, closed);
                                            AfterWrite::Return(Err(CoalescerError::Flush {
                                                destination: destination.to_path_buf(),
                                                attempts,
                                                dropped: false,
                                                message,
                                            }))
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            };
            self.remove_idle_queue(destination);
            self.flush_done.notify_waiters();
            if let Some(report) = dropped_report {
                tracing::error!(
                    coalescer = %report.coalescer,
                    destination = %report.destination.display(),
                    dropped_entries = report.dropped_entries,
                    attempts = report.attempts,
                    error = %report.error,
                    "dropping batch after exhausting flush retries"
                );
                if let Some(sink) = &self.options.failure_sink {
                    sink(&report);
                }
            }
            match after {
                AfterWrite::Loop => continue,
                AfterWrite::Return(result) => return result,
            }
        }
    }

    fn remove_idle_queue(&self, destination: &Path) {
        let mut state = lock_or_recover_mutex(&self.state);
        if state
            .queues
            .get(destination)
            .is_some_and(DestinationQueue::is_idle)
        {
            state.queues.remove(destination);
        }
    }

    /// Decides what follows a completed (or dropped) batch.
    fn next_step(
        self: &Arc<Self>,
        destination: &Path,
        queue: &mut DestinationQueue<W::Entry>,
        mode: FlushMode,
        closed: bool,
        max_batch: usize,
        flushed: usize,
    ) -> AfterWrite {
        let remaining = queue.entries.len();
        if remaining == 0 {
            return AfterWrite::Return(Ok(flushed));
        }
        match mode {
            FlushMode::Explicit | FlushMode::Closing => AfterWrite::Loop,
            FlushMode::Background if closed => AfterWrite::Return(Ok(flushed)),
            FlushMode::Background if remaining >= max_batch => AfterWrite::Loop,
            FlushMode::Background => {
                if queue.timer.is_none() {
                    let delay = self.initial_delay(queue);
                    self.arm_timer(destination, queue, delay);
                }
                AfterWrite::Return(Ok(flushed))
            }
        }
    }

    fn rearm_after_failure(
        self: &Arc<Self>,
        destination: &Path,
        queue: &mut DestinationQueue<W::Entry>,
        closed: bool,
    ) {
        if closed || queue.entries.is_empty() {
            return;
        }
        let delay = self.initial_delay(queue);
        self.arm_timer(destination, queue, delay);
    }
}

impl<W: BatchWriter> Drop for CoalescerInner<W> {
    fn drop(&mut self) {
        let mut state = lock_or_recover_mutex(&self.state);
        let pending: usize = state
            .queues
            .values_mut()
            .map(|queue| {
                queue.cancel_timer();
                queue.entries.len()
            })
            .sum();
        if pending > 0 {
            tracing::warn!(
                coalescer = %self.name,
                pending,
                "write coalescer dropped without close; pending entries lost"
            );
        }
    }
}
