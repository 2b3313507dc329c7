use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tau_core::lock_or_recover_mutex;
use tau_io_telemetry::{IoMetricsCollector, IoResourceKind};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::BatcherConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Immediate,
    High,
    Normal,
    Low,
}

impl MessagePriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    pub fn bypasses_batching(self) -> bool {
        matches!(self, Self::Immediate | Self::High)
    }
}

/// Socket-level sender for one gateway transport.
#[async_trait]
pub trait OutboundTransport: Send + Sync + 'static {
    async fn send(&self, connection: &str, frame: &[u8]) -> Result<()>;

    /// Sends `frames` in order as one logical unit.
    async fn send_batch(&self, connection: &str, frames: &[Vec<u8>]) -> Result<()>;
}

#[async_trait]
impl<T: OutboundTransport + ?Sized> OutboundTransport for Arc<T> {
    async fn send(&self, connection: &str, frame: &[u8]) -> Result<()> {
        (**self).send(connection, frame).await
    }

    async fn send_batch(&self, connection: &str, frames: &[Vec<u8>]) -> Result<()> {
        (**self).send_batch(connection, frames).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatcherError {
    #[error("outbound batcher is shut down")]
    Closed,
    #[error("direct send to connection '{connection}' failed: {message}")]
    Send { connection: String, message: String },
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct BatcherStats {
    pub queued_messages: usize,
    pub connections: usize,
    pub direct_sends_total: u64,
    pub batches_sent_total: u64,
    pub batched_messages_total: u64,
    pub send_failures_total: u64,
    pub dropped_messages_total: u64,
}

struct ConnectionQueue {
    normal: VecDeque<Vec<u8>>,
    low: VecDeque<Vec<u8>>,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    flush_scheduled: bool,
    /// Serializes batch sends so batches leave in the order they were taken.
    lane: Arc<tokio::sync::Mutex<()>>,
}

impl ConnectionQueue {
    fn new() -> Self {
        Self {
            normal: VecDeque::new(),
            low: VecDeque::new(),
            timer: None,
            timer_generation: 0,
            flush_scheduled: false,
            lane: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn len(&self) -> usize {
        self.normal.len() + self.low.len()
    }

    fn take_batch(&mut self, max: usize) -> Vec<Vec<u8>> {
        let from_normal = self.normal.len().min(max);
        let mut batch: Vec<Vec<u8>> = self.normal.drain(..from_normal).collect();
        let from_low = self.low.len().min(max - batch.len());
        batch.extend(self.low.drain(..from_low));
        batch
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct BatcherState {
    connections: HashMap<String, ConnectionQueue>,
    closed: bool,
    stats: BatcherStats,
}

struct BatcherInner<T: OutboundTransport> {
    config: BatcherConfig,
    transport: T,
    telemetry: Option<Arc<IoMetricsCollector>>,
    handle: Handle,
    state: Mutex<BatcherState>,
}

/// Priority-aware outbound frame batcher.
///
/// Immediate and High frames go straight to the transport and the caller sees
/// the result. Normal and Low frames queue per connection and leave as one
/// batch when the ceiling is reached or the batch interval elapses. Batch
/// delivery is best-effort: failures are logged and the frames dropped.
pub struct OutboundBatcher<T: OutboundTransport> {
    inner: Arc<BatcherInner<T>>,
}

impl<T: OutboundTransport> Clone for OutboundBatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: OutboundTransport> std::fmt::Debug for OutboundBatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundBatcher")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<T: OutboundTransport> OutboundBatcher<T> {
    pub fn new(config: BatcherConfig, transport: T) -> Result<Self> {
        Self::new_with_telemetry(config, transport, None)
    }

    pub fn new_with_telemetry(
        config: BatcherConfig,
        transport: T,
        telemetry: Option<Arc<IoMetricsCollector>>,
    ) -> Result<Self> {
        let handle =
            Handle::try_current().context("outbound batcher requires an active tokio runtime")?;
        Ok(Self {
            inner: Arc::new(BatcherInner {
                config: config.clamped(),
                transport,
                telemetry,
                handle,
                state: Mutex::new(BatcherState::default()),
            }),
        })
    }

    pub fn config(&self) -> BatcherConfig {
        self.inner.config
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    #[tracing::instrument(
        name = "netbatch.send",
        skip_all,
        fields(connection = connection, priority = priority.as_str(), bytes = data.len())
    )]
    pub async fn send(
        &self,
        connection: &str,
        data: Vec<u8>,
        priority: MessagePriority,
    ) -> Result<(), BatcherError> {
        if self.inner.config.disabled || priority.bypasses_batching() {
            if lock_or_recover_mutex(&self.inner.state).closed {
                return Err(BatcherError::Closed);
            }
            return self.inner.send_direct(connection, &data).await;
        }

        let ceiling_reached = {
            let mut state = lock_or_recover_mutex(&self.inner.state);
            if state.closed {
                return Err(BatcherError::Closed);
            }
            let queue = state
                .connections
                .entry(connection.to_string())
                .or_insert_with(ConnectionQueue::new);
            match priority {
                MessagePriority::Low => queue.low.push_back(data),
                _ => queue.normal.push_back(data),
            }
            if queue.timer.is_none() {
                arm_timer(&self.inner, connection, queue);
            }
            let full = queue.len() >= self.inner.config.max_batch_messages;
            if full && !queue.flush_scheduled {
                queue.flush_scheduled = true;
                true
            } else {
                false
            }
        };
        if ceiling_reached {
            spawn_ceiling_flush(&self.inner, connection);
        }
        Ok(())
    }

    /// Sends whatever is queued for `connection` now. Returns frames still queued.
    pub async fn flush(&self, connection: &str) -> usize {
        self.inner.flush_connection(connection).await
    }

    /// Drops the connection's queue and timer. Returns the number of frames dropped.
    pub fn close_connection(&self, connection: &str) -> usize {
        let removed = {
            let mut state = lock_or_recover_mutex(&self.inner.state);
            let removed = state.connections.remove(connection);
            if let Some(queue) = &removed {
                state.stats.dropped_messages_total = state
                    .stats
                    .dropped_messages_total
                    .saturating_add(queue.len() as u64);
            }
            removed
        };
        let Some(mut queue) = removed else {
            return 0;
        };
        queue.cancel_timer();
        let dropped = queue.len();
        if dropped > 0 {
            tracing::warn!(
                connection = connection,
                dropped,
                "connection closed with pending outbound frames; dropping"
            );
        }
        dropped
    }

    /// Flushes every connection best-effort, then rejects further sends.
    /// Idempotent.
    #[tracing::instrument(name = "netbatch.shutdown", skip_all)]
    pub async fn shutdown(&self) {
        let connections: Vec<String> = {
            let mut state = lock_or_recover_mutex(&self.inner.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.connections.keys().cloned().collect()
        };
        for connection in &connections {
            while self.inner.flush_connection(connection).await > 0 {}
        }
        let mut state = lock_or_recover_mutex(&self.inner.state);
        for (_, mut queue) in state.connections.drain() {
            queue.cancel_timer();
        }
    }

    pub fn is_closed(&self) -> bool {
        lock_or_recover_mutex(&self.inner.state).closed
    }

    pub fn queued_messages(&self, connection: &str) -> usize {
        lock_or_recover_mutex(&self.inner.state)
            .connections
            .get(connection)
            .map(ConnectionQueue::len)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BatcherStats {
        let state = lock_or_recover_mutex(&self.inner.state);
        BatcherStats {
            queued_messages: state.connections.values().map(ConnectionQueue::len).sum(),
            connections: state.connections.len(),
            ..state.stats
        }
    }
}

fn arm_timer<T: OutboundTransport>(
    inner: &Arc<BatcherInner<T>>,
    connection: &str,
    queue: &mut ConnectionQueue,
) {
    queue.timer_generation = queue.timer_generation.wrapping_add(1);
    let generation = queue.timer_generation;
    let delay = Duration::from_millis(inner.config.batch_interval_ms);
    let weak = Arc::downgrade(inner);
    let connection = connection.to_string();
    queue.timer = Some(inner.handle.spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.on_timer(&connection, generation).await;
    }));
}

/// Sends full batches off the caller's task so a queued `send` never waits on
/// the socket.
fn spawn_ceiling_flush<T: OutboundTransport>(inner: &Arc<BatcherInner<T>>, connection: &str) {
    let weak = Arc::downgrade(inner);
    let connection = connection.to_string();
    inner.handle.spawn(async move {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if let Some(queue) = lock_or_recover_mutex(&inner.state)
            .connections
            .get_mut(&connection)
        {
            queue.flush_scheduled = false;
        }
        while inner.flush_connection(&connection).await >= inner.config.max_batch_messages {}
    });
}

impl<T: OutboundTransport> BatcherInner<T> {
    async fn send_direct(&self, connection: &str, data: &[u8]) -> Result<(), BatcherError> {
        let result = self.transport.send(connection, data).await;
        let mut state = lock_or_recover_mutex(&self.state);
        match result {
            Ok(()) => {
                state.stats.direct_sends_total = state.stats.direct_sends_total.saturating_add(1);
                drop(state);
                if let Some(telemetry) = &self.telemetry {
                    telemetry.record_write(IoResourceKind::Network, data.len() as u64, 1);
                }
                Ok(())
            }
            Err(error) => {
                state.stats.send_failures_total = state.stats.send_failures_total.saturating_add(1);
                drop(state);
                if let Some(telemetry) = &self.telemetry {
                    telemetry.record_failure(IoResourceKind::Network);
                }
                tracing::debug!(connection = connection, error = %error, "direct send failed");
                Err(BatcherError::Send {
                    connection: connection.to_string(),
                    message: format!("{error:#}"),
                })
            }
        }
    }

    async fn on_timer(self: &Arc<Self>, connection: &str, generation: u64) {
        {
            let mut state = lock_or_recover_mutex(&self.state);
            let Some(queue) = state.connections.get_mut(connection) else {
                return;
            };
            if queue.timer_generation != generation {
                return;
            }
            queue.timer = None;
        }
        self.flush_connection(connection).await;
    }

    /// Sends one batch from the connection's queue and returns how many frames remain.
    async fn flush_connection(self: &Arc<Self>, connection: &str) -> usize {
        let lane = {
            let state = lock_or_recover_mutex(&self.state);
            match state.connections.get(connection) {
                Some(queue) => Arc::clone(&queue.lane),
                None => return 0,
            }
        };
        let _lane_guard = lane.lock().await;

        let (batch, remaining) = {
            let mut state = lock_or_recover_mutex(&self.state);
            let Some(queue) = state.connections.get_mut(connection) else {
                return 0;
            };
            let batch = queue.take_batch(self.config.max_batch_messages);
            let remaining = queue.len();
            if remaining == 0 {
                queue.cancel_timer();
            } else if queue.timer.is_none() {
                arm_timer(self, connection, queue);
            }
            (batch, remaining)
        };
        if batch.is_empty() {
            return remaining;
        }

        let bytes: u64 = batch.iter().map(|frame| frame.len() as u64).sum();
        let frames = batch.len() as u64;
        let result = self.transport.send_batch(connection, &batch).await;
        {
            let mut state = lock_or_recover_mutex(&self.state);
            let stats = &mut state.stats;
            match &result {
                Ok(()) => {
                    stats.batches_sent_total = stats.batches_sent_total.saturating_add(1);
                    stats.batched_messages_total =
                        stats.batched_messages_total.saturating_add(frames);
                }
                Err(_) => {
                    stats.send_failures_total = stats.send_failures_total.saturating_add(1);
                    stats.dropped_messages_total =
                        stats.dropped_messages_total.saturating_add(frames);
                }
            }
        }
        match result {
            Ok(()) => {
                if let Some(telemetry) = &self.telemetry {
                    telemetry.record_write(IoResourceKind::Network, bytes, frames);
                }
                tracing::debug!(connection = connection, frames, bytes, "sent outbound batch");
            }
            Err(error) => {
                if let Some(telemetry) = &self.telemetry {
                    telemetry.record_failure(IoResourceKind::Network);
                }
                tracing::warn!(
                    connection = connection,
                    frames,
                    error = %error,
                    "outbound batch send failed; dropping frames"
                );
            }
        }
        remaining
    }
}

impl<T: OutboundTransport> Drop for BatcherInner<T> {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut pending = 0_usize;
        for queue in state.connections.values_mut() {
            queue.cancel_timer();
            pending += queue.len();
        }
        if pending > 0 {
            tracing::warn!(pending, "outbound batcher dropped with queued frames");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use tau_core::ManualClock;
    use tokio::sync::Notify;
    use tau_io_telemetry::IoMetricsCollector;

    use super::{BatcherError, MessagePriority, OutboundBatcher, OutboundTransport};
    use crate::config::BatcherConfig;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Delivery {
        connection: String,
        frames: Vec<String>,
        batched: bool,
    }

    #[derive(Default)]
    struct RecordingTransport {
        deliveries: Mutex<Vec<Delivery>>,
        fail_batches: AtomicBool,
        fail_direct: AtomicBool,
        hold_batches: AtomicBool,
        release_batches: Notify,
    }

    impl RecordingTransport {
        fn deliveries(&self) -> Vec<Delivery> {
            self.deliveries.lock().expect("deliveries lock").clone()
        }

        fn record(&self, connection: &str, frames: &[Vec<u8>], batched: bool) {
            self.deliveries.lock().expect("deliveries lock").push(Delivery {
                connection: connection.to_string(),
                frames: frames
                    .iter()
                    .map(|frame| String::from_utf8_lossy(frame).to_string())
                    .collect(),
                batched,
            });
        }
    }

    #[async_trait]
    impl OutboundTransport for RecordingTransport {
        async fn send(&self, connection: &str, frame: &[u8]) -> Result<()> {
            if self.fail_direct.load(Ordering::SeqCst) {
                bail!("socket reset");
            }
            self.record(connection, &[frame.to_vec()], false);
            Ok(())
        }

        async fn send_batch(&self, connection: &str, frames: &[Vec<u8>]) -> Result<()> {
            if self.hold_batches.load(Ordering::SeqCst) {
                self.release_batches.notified().await;
            }
            if self.fail_batches.load(Ordering::SeqCst) {
                bail!("socket reset");
            }
            self.record(connection, frames, true);
            Ok(())
        }
    }

    fn batcher() -> OutboundBatcher<RecordingTransport> {
        OutboundBatcher::new(BatcherConfig::default(), RecordingTransport::default())
            .expect("batcher")
    }

    fn frame(text: &str) -> Vec<u8> {
        text.as_bytes().to_vec()
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unit_immediate_and_high_priority_bypass_batching() {
        let batcher = batcher();
        batcher
            .send("conn-a", frame("typing"), MessagePriority::Immediate)
            .await
            .expect("immediate");
        batcher
            .send("conn-a", frame("reply"), MessagePriority::High)
            .await
            .expect("high");
        let deliveries = batcher.transport().deliveries();
        assert_eq!(deliveries.len(), 2);
        assert!(deliveries.iter().all(|delivery| !delivery.batched));
        assert_eq!(batcher.stats().direct_sends_total, 2);
        assert_eq!(batcher.queued_messages("conn-a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_interval_flush_sends_normal_before_low_in_fifo_order() {
        let batcher = batcher();
        for (text, priority) in [
            ("l1", MessagePriority::Low),
            ("n1", MessagePriority::Normal),
            ("n2", MessagePriority::Normal),
            ("l2", MessagePriority::Low),
        ] {
            batcher
                .send("conn-a", frame(text), priority)
                .await
                .expect("queue");
        }
        tokio::time::advance(Duration::from_millis(249)).await;
        settle().await;
        assert!(batcher.transport().deliveries().is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(
            batcher.transport().deliveries(),
            vec![Delivery {
                connection: "conn-a".to_string(),
                frames: vec!["n1".into(), "n2".into(), "l1".into(), "l2".into()],
                batched: true,
            }]
        );
        assert_eq!(batcher.queued_messages("conn-a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_size_ceiling_flushes_without_waiting_for_timer() {
        let telemetry = Arc::new(IoMetricsCollector::new(60_000, ManualClock::new(0).as_clock()));
        let batcher = OutboundBatcher::new_with_telemetry(
            BatcherConfig::default(),
            RecordingTransport::default(),
            Some(telemetry.clone()),
        )
        .expect("batcher");
        for index in 0..16 {
            batcher
                .send("conn-a", frame(&format!("m{index}")), MessagePriority::Normal)
                .await
                .expect("queue");
        }
        settle().await;
        let deliveries = batcher.transport().deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].frames.len(), 16);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(batcher.transport().deliveries().len(), 1);

        let network = &telemetry.snapshot().resources["network"];
        assert_eq!(network.physical_ops_total, 1);
        assert_eq!(network.logical_ops_total, 16);
    }

    #[tokio::test(start_paused = true)]
    async fn regression_send_filling_batch_does_not_wait_on_transport() {
        let batcher = batcher();
        batcher.transport().hold_batches.store(true, Ordering::SeqCst);
        for index in 0..16 {
            tokio::time::timeout(
                Duration::from_millis(1),
                batcher.send("conn-a", frame(&format!("m{index}")), MessagePriority::Normal),
            )
            .await
            .expect("queued send returns without awaiting the socket")
            .expect("queue");
        }
        settle().await;
        assert_eq!(batcher.queued_messages("conn-a"), 0);
        assert!(batcher.transport().deliveries().is_empty());

        batcher.transport().release_batches.notify_waiters();
        settle().await;
        let deliveries = batcher.transport().deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].frames.len(), 16);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_close_connection_drops_pending_frames_quietly() {
        let batcher = batcher();
        for text in ["a", "b", "c"] {
            batcher
                .send("conn-a", frame(text), MessagePriority::Normal)
                .await
                .expect("queue");
        }
        assert_eq!(batcher.close_connection("conn-a"), 3);
        assert_eq!(batcher.close_connection("conn-a"), 0);
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert!(batcher.transport().deliveries().is_empty());
        assert_eq!(batcher.stats().dropped_messages_total, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn integration_shutdown_flushes_every_connection_then_rejects() {
        let batcher = batcher();
        batcher
            .send("conn-a", frame("a1"), MessagePriority::Normal)
            .await
            .expect("queue");
        batcher
            .send("conn-a", frame("a2"), MessagePriority::Low)
            .await
            .expect("queue");
        batcher
            .send("conn-b", frame("b1"), MessagePriority::Normal)
            .await
            .expect("queue");

        batcher.shutdown().await;
        let mut deliveries = batcher.transport().deliveries();
        deliveries.sort_by(|left, right| left.connection.cmp(&right.connection));
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].frames, vec!["a1".to_string(), "a2".to_string()]);
        assert_eq!(deliveries[1].frames, vec!["b1".to_string()]);

        assert_eq!(
            batcher
                .send("conn-a", frame("late"), MessagePriority::Normal)
                .await,
            Err(BatcherError::Closed)
        );
        assert_eq!(
            batcher
                .send("conn-a", frame("late"), MessagePriority::Immediate)
                .await,
            Err(BatcherError::Closed)
        );
        batcher.shutdown().await;
        assert_eq!(batcher.stats().connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_disabled_batching_sends_every_frame_directly() {
        let batcher = OutboundBatcher::new(
            BatcherConfig {
                disabled: true,
                ..BatcherConfig::default()
            },
            RecordingTransport::default(),
        )
        .expect("batcher");
        batcher
            .send("conn-a", frame("n1"), MessagePriority::Normal)
            .await
            .expect("send");
        batcher
            .send("conn-a", frame("l1"), MessagePriority::Low)
            .await
            .expect("send");
        let deliveries = batcher.transport().deliveries();
        assert_eq!(deliveries.len(), 2);
        assert!(deliveries.iter().all(|delivery| !delivery.batched));
    }

    #[tokio::test(start_paused = true)]
    async fn regression_failed_batch_is_logged_and_dropped() {
        let batcher = batcher();
        batcher.transport().fail_batches.store(true, Ordering::SeqCst);
        batcher
            .send("conn-a", frame("a"), MessagePriority::Normal)
            .await
            .expect("queue never fails");
        batcher
            .send("conn-a", frame("b"), MessagePriority::Low)
            .await
            .expect("queue never fails");
        tokio::time::advance(Duration::from_millis(250)).await;
        settle().await;
        let stats = batcher.stats();
        assert_eq!(stats.send_failures_total, 1);
        assert_eq!(stats.dropped_messages_total, 2);
        assert_eq!(stats.queued_messages, 0);

        batcher.transport().fail_batches.store(false, Ordering::SeqCst);
        batcher
            .send("conn-a", frame("c"), MessagePriority::Normal)
            .await
            .expect("queue");
        tokio::time::advance(Duration::from_millis(250)).await;
        settle().await;
        assert_eq!(batcher.transport().deliveries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn regression_direct_send_failure_is_returned_to_caller() {
        let batcher = batcher();
        batcher.transport().fail_direct.store(true, Ordering::SeqCst);
        let error = batcher
            .send("conn-a", frame("urgent"), MessagePriority::Immediate)
            .await
            .expect_err("direct failure");
        assert!(matches!(
            error,
            BatcherError::Send { ref connection, .. } if connection == "conn-a"
        ));
        assert_eq!(batcher.stats().send_failures_total, 1);
    }

    #[test]
    fn regression_constructor_requires_runtime() {
        let result = OutboundBatcher::new(BatcherConfig::default(), RecordingTransport::default());
        assert!(result.is_err());
    }
}
