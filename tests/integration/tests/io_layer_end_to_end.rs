use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use tau_coalesce::{CoalescerConfig, ScheduleWriteOptions};
use tau_core::ManualClock;
use tau_io_layer::{IoHealthStatus, IoLayer, IoLayerConfig};
use tau_netbatch::{MessagePriority, OutboundTransport};
use tau_resilience::{CircuitBreakerConfig, CircuitBreakerError, CircuitState, RateLimitConfig};
use tau_storage::StorageError;
use tempfile::tempdir;

#[derive(Default)]
struct RecordingTransport {
    batches: Mutex<Vec<(String, Vec<String>)>>,
}

#[async_trait]
impl OutboundTransport for RecordingTransport {
    async fn send(&self, connection: &str, frame: &[u8]) -> Result<()> {
        self.batches.lock().expect("batches lock").push((
            connection.to_string(),
            vec![String::from_utf8_lossy(frame).to_string()],
        ));
        Ok(())
    }

    async fn send_batch(&self, connection: &str, frames: &[Vec<u8>]) -> Result<()> {
        self.batches.lock().expect("batches lock").push((
            connection.to_string(),
            frames
                .iter()
                .map(|frame| String::from_utf8_lossy(frame).to_string())
                .collect(),
        ));
        Ok(())
    }
}

fn base_config(root: &std::path::Path) -> IoLayerConfig {
    let mut config = IoLayerConfig::new(root);
    if let Some(storage) = config.storage.as_mut() {
        storage.checkpoint_interval_ms = 0;
    }
    config
}

#[tokio::test]
async fn integration_log_burst_coalesces_into_two_disk_writes() {
    let temp = tempdir().expect("tempdir");
    let layer = IoLayer::start(base_config(temp.path()), None).expect("start");
    let path = layer.channel_log_path("discord");

    for index in 0..150 {
        layer
            .logs()
            .append_line(&path, format!("event {index}"))
            .expect("append");
    }
    layer.shutdown().await;

    let contents = std::fs::read_to_string(&path).expect("log file");
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 150);
    assert_eq!(lines.first(), Some(&"event 0"));
    assert_eq!(lines.last(), Some(&"event 149"));

    let disk = &layer.telemetry().io.snapshot().resources["disk"];
    assert_eq!(disk.physical_ops_total, 2);
    assert_eq!(disk.logical_ops_total, 150);
    assert!(disk.coalescing_saved_percent > 98.0);
}

#[tokio::test]
async fn integration_breaker_guards_storage_writes_and_recovers_with_clock() {
    let temp = tempdir().expect("tempdir");
    let clock = ManualClock::new(1_700_000_000_000);
    let mut config = base_config(temp.path());
    config.breaker = CircuitBreakerConfig {
        failure_threshold: 2,
        reset_timeout_ms: 10_000,
        half_open_max_attempts: 1,
    };
    let layer = IoLayer::start_with_clock(config, None, clock.as_clock()).expect("start");
    let storage = layer.storage().expect("storage").clone();
    storage
        .execute_batch("CREATE TABLE deliveries (id INTEGER PRIMARY KEY, body TEXT NOT NULL);")
        .expect("schema");

    let breaker = layer.breaker("sqlite-writes");
    for _ in 0..2 {
        let store = storage.clone();
        let result = breaker
            .execute(|| async move {
                store.execute("INSERT INTO missing_table (body) VALUES ('x')", [])
            })
            .await;
        assert!(matches!(
            result,
            Err(CircuitBreakerError::Operation(StorageError::Sqlite(_)))
        ));
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(layer.health_report().status, IoHealthStatus::Degraded);

    let store = storage.clone();
    let rejected = breaker
        .execute(|| async move {
            store.execute("INSERT INTO deliveries (body) VALUES ('never')", [])
        })
        .await;
    assert!(rejected.as_ref().err().is_some_and(CircuitBreakerError::is_open));

    clock.advance_ms(10_000);
    let store = storage.clone();
    breaker
        .execute(|| async move {
            store.execute("INSERT INTO deliveries (body) VALUES ('probe')", [])
        })
        .await
        .expect("probe succeeds");
    assert_eq!(breaker.state(), CircuitState::Closed);

    let report = layer.health_report();
    assert_eq!(report.status, IoHealthStatus::Healthy);
    let circuit = &report.telemetry.circuits.circuits["sqlite-writes"];
    assert_eq!(circuit.recovery_count, 1);
    assert_eq!(circuit.max_recovery_ms, Some(10_000));

    let rows: i64 = storage
        .query_row("SELECT COUNT(*) FROM deliveries", [], |row| row.get(0))
        .expect("count");
    assert_eq!(rows, 1);
    layer.shutdown().await;
}

#[tokio::test]
async fn integration_immediate_session_write_is_durable_before_return() {
    let temp = tempdir().expect("tempdir");
    let mut config = base_config(temp.path());
    config.session_coalescer = CoalescerConfig {
        debounce_ms: 60_000,
        ..CoalescerConfig::session_snapshots()
    };
    let layer = IoLayer::start(config, None).expect("start");
    let path = layer.session_path("whatsapp-42");

    layer
        .sessions()
        .schedule_write(&path, json!({"turn": 1}), ScheduleWriteOptions::default())
        .await
        .expect("queued");
    assert!(!path.exists());

    layer
        .sessions()
        .schedule_write(&path, json!({"turn": 2}), ScheduleWriteOptions { immediate: true })
        .await
        .expect("immediate");
    let stored: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("snapshot")).expect("json");
    assert_eq!(stored, json!({"turn": 2}));
    layer.shutdown().await;
}

#[tokio::test]
async fn integration_rate_limiter_rejections_surface_in_health_report() {
    let temp = tempdir().expect("tempdir");
    let clock = ManualClock::new(5_000);
    let mut config = base_config(temp.path());
    config.storage = None;
    config.rate_limit = RateLimitConfig {
        max_requests: 2,
        window_ms: 1_000,
    };
    let layer = IoLayer::start_with_clock(config, None, clock.as_clock()).expect("start");

    let decisions: Vec<bool> = (0..5)
        .map(|_| layer.rate_limiter().check("telegram").is_ok())
        .collect();
    assert_eq!(decisions, vec![true, true, false, false, false]);

    let limits = layer.health_report().telemetry.rate_limits;
    assert_eq!(limits.requests_total, 5);
    assert_eq!(limits.rejections_total, 3);
    assert_eq!(limits.endpoints["telegram"].rejected_total, 3);

    clock.advance_ms(1_000);
    assert!(layer.rate_limiter().check("telegram").is_ok());
    layer.shutdown().await;
}

#[tokio::test]
async fn integration_outbound_frames_batch_until_shutdown() {
    let temp = tempdir().expect("tempdir");
    let mut config = base_config(temp.path());
    config.storage = None;
    let transport = Arc::new(RecordingTransport::default());
    let layer = IoLayer::start(config, Some(transport.clone())).expect("start");
    let outbound = layer.outbound().expect("outbound");

    outbound
        .send("matrix-1", b"low".to_vec(), MessagePriority::Low)
        .await
        .expect("queue");
    outbound
        .send("matrix-1", b"normal".to_vec(), MessagePriority::Normal)
        .await
        .expect("queue");
    outbound
        .send("matrix-1", b"urgent".to_vec(), MessagePriority::Immediate)
        .await
        .expect("direct");

    layer.shutdown().await;
    let batches = transport.batches.lock().expect("batches lock").clone();
    assert_eq!(
        batches,
        vec![
            ("matrix-1".to_string(), vec!["urgent".to_string()]),
            (
                "matrix-1".to_string(),
                vec!["normal".to_string(), "low".to_string()]
            ),
        ]
    );
    let network = &layer.health_report().telemetry.io.resources["network"];
    assert_eq!(network.physical_ops_total, 2);
    assert_eq!(network.logical_ops_total, 3);
}

#[tokio::test]
async fn regression_failing_writer_never_blocks_other_destinations() -> Result<()> {
    let temp = tempdir()?;
    let layer = IoLayer::start(base_config(temp.path()), None)?;
    let blocked_dir = temp.path().join("blocked.log");
    std::fs::create_dir_all(&blocked_dir)?;
    let healthy = layer.channel_log_path("irc");

    layer.logs().append_line(&blocked_dir, "cannot land")?;
    layer.logs().append_line(&healthy, "lands")?;
    if layer.logs().flush(&blocked_dir).await.is_ok() {
        bail!("writing into a directory must fail");
    }
    layer.logs().flush(&healthy).await?;
    assert_eq!(std::fs::read_to_string(&healthy)?, "lands\n");

    layer.shutdown().await;
    let disk = &layer.telemetry().io.snapshot().resources["disk"];
    assert!(disk.failures_total >= 1);
    Ok(())
}
