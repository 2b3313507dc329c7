//! Drives a synthetic multi-channel gateway workload through the I/O layer
//! and prints the resulting health report.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use serde_json::json;
use tau_coalesce::ScheduleWriteOptions;
use tau_io_layer::{install_global_io_layer, IoHealthReport, IoLayer, IoLayerConfig};
use tau_netbatch::{fetch_cached, CacheRequest, FetchOutcome, MessagePriority, OutboundTransport};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "tau-io-soak",
    about = "Run a synthetic gateway workload through the Tau I/O layer",
    version
)]
struct Cli {
    #[arg(
        long = "state-dir",
        env = "TAU_IO_SOAK_STATE_DIR",
        default_value = ".tau/io-soak",
        help = "Directory for logs, session snapshots and the SQLite database"
    )]
    state_dir: PathBuf,

    #[arg(
        long,
        env = "TAU_IO_SOAK_CHANNELS",
        value_delimiter = ',',
        default_value = "telegram,discord,slack"
    )]
    channels: Vec<String>,

    #[arg(long = "log-lines", env = "TAU_IO_SOAK_LOG_LINES", default_value_t = 500)]
    log_lines: usize,

    #[arg(long, env = "TAU_IO_SOAK_SESSIONS", default_value_t = 40)]
    sessions: usize,

    #[arg(long, env = "TAU_IO_SOAK_ROWS", default_value_t = 1_000)]
    rows: usize,

    #[arg(
        long = "outbound-frames",
        env = "TAU_IO_SOAK_OUTBOUND_FRAMES",
        default_value_t = 200
    )]
    outbound_frames: usize,

    #[arg(
        long = "dependency-calls",
        env = "TAU_IO_SOAK_DEPENDENCY_CALLS",
        default_value_t = 50
    )]
    dependency_calls: usize,

    #[arg(
        long = "fail-every",
        env = "TAU_IO_SOAK_FAIL_EVERY",
        default_value_t = 0,
        help = "Fail every Nth breaker-protected call (0 never fails)"
    )]
    fail_every: usize,

    #[arg(long, default_value_t = false, help = "Print the full health report as JSON")]
    json: bool,
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

/// Counts frames instead of writing to real sockets.
#[derive(Debug, Default)]
struct CountingTransport {
    direct_frames: AtomicU64,
    batched_frames: AtomicU64,
    batches: AtomicU64,
}

#[async_trait]
impl OutboundTransport for CountingTransport {
    async fn send(&self, _connection: &str, _frame: &[u8]) -> Result<()> {
        self.direct_frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn send_batch(&self, _connection: &str, frames: &[Vec<u8>]) -> Result<()> {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.batched_frames
            .fetch_add(frames.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let channels: Vec<String> = cli
        .channels
        .iter()
        .map(|channel| channel.trim().to_string())
        .filter(|channel| !channel.is_empty())
        .collect();
    if channels.is_empty() {
        return Err(anyhow!("--channels must name at least one channel"));
    }

    let transport = Arc::new(CountingTransport::default());
    let layer = Arc::new(IoLayer::start(
        IoLayerConfig::from_env(&cli.state_dir),
        Some(transport.clone()),
    )?);
    let layer = install_global_io_layer(layer)?;

    drive_storage(&layer, cli.rows)?;
    drive_logs(&layer, &channels, cli.log_lines);
    drive_sessions(&layer, &channels, cli.sessions).await?;
    drive_outbound(&layer, &channels, cli.outbound_frames).await?;
    drive_dependency(&layer, cli.dependency_calls, cli.fail_every).await;
    drive_read_cache(&layer, &channels).await?;

    let before_shutdown = layer.health_report();
    layer.shutdown().await;
    let report = layer.health_report();

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to render health report")?
        );
    } else {
        print_summary(&before_shutdown, &report, &transport);
    }
    Ok(())
}

fn drive_storage(layer: &IoLayer, rows: usize) -> Result<()> {
    let Some(storage) = layer.storage() else {
        return Ok(());
    };
    storage.execute_batch(
        "CREATE TABLE IF NOT EXISTS soak_messages (
            id INTEGER PRIMARY KEY,
            channel TEXT NOT NULL,
            body TEXT NOT NULL
        );",
    )?;
    let items: Vec<(String, String)> = (0..rows)
        .map(|index| (format!("channel-{}", index % 8), format!("message {index}")))
        .collect();
    for chunk in items.chunks(250) {
        storage.batch_insert(
            "INSERT INTO soak_messages (channel, body) VALUES (?1, ?2)",
            chunk,
            |(channel, body)| [channel.clone(), body.clone()],
        )?;
    }
    Ok(())
}

fn drive_logs(layer: &IoLayer, channels: &[String], lines: usize) {
    for index in 0..lines {
        let channel = &channels[index % channels.len()];
        if let Err(error) = layer.rate_limiter().check(channel) {
            tracing::debug!(%error, "soak log line rate limited");
            continue;
        }
        let path = layer.channel_log_path(channel);
        if let Err(error) = layer
            .logs()
            .append_line(&path, format!("{{\"channel\":\"{channel}\",\"seq\":{index}}}"))
        {
            tracing::warn!(%error, "soak log append rejected");
        }
    }
}

async fn drive_sessions(layer: &IoLayer, channels: &[String], writes: usize) -> Result<()> {
    for index in 0..writes {
        let channel = &channels[index % channels.len()];
        let path = layer.session_path(&format!("{channel}-session"));
        layer
            .sessions()
            .schedule_write(
                &path,
                json!({ "channel": channel, "turn": index }),
                ScheduleWriteOptions::default(),
            )
            .await?;
    }
    Ok(())
}

async fn drive_outbound(layer: &IoLayer, channels: &[String], frames: usize) -> Result<()> {
    let Some(outbound) = layer.outbound() else {
        return Ok(());
    };
    for index in 0..frames {
        let connection = &channels[index % channels.len()];
        let priority = match index % 10 {
            0 => MessagePriority::Immediate,
            1 => MessagePriority::High,
            2..=6 => MessagePriority::Normal,
            _ => MessagePriority::Low,
        };
        outbound
            .send(connection, format!("frame {index}").into_bytes(), priority)
            .await?;
    }
    Ok(())
}

async fn drive_dependency(layer: &IoLayer, calls: usize, fail_every: usize) {
    let breaker = layer.breaker("soak-dependency");
    for index in 1..=calls {
        let should_fail = fail_every > 0 && index % fail_every == 0;
        let result = breaker
            .execute(|| async move {
                if should_fail {
                    Err(anyhow!("synthetic dependency failure"))
                } else {
                    Ok(index)
                }
            })
            .await;
        if let Err(error) = result {
            tracing::debug!(%error, call = index, "soak dependency call failed");
        }
    }
}

async fn drive_read_cache(layer: &IoLayer, channels: &[String]) -> Result<()> {
    let cache = layer.read_cache();
    for round in 0..3 {
        for channel in channels {
            let request = CacheRequest::new(format!("https://gateway.invalid/{channel}/profile"));
            fetch_cached(cache, &request, |_validator| async move {
                Ok(FetchOutcome::Fresh {
                    payload: tau_netbatch::CachedHttpResponse {
                        status: 200,
                        content_type: Some("application/json".to_string()),
                        body: format!("{{\"channel\":\"{channel}\",\"round\":{round}}}"),
                    },
                    validator: Some(format!("\"{channel}-v1\"")),
                })
            })
            .await?;
        }
    }
    Ok(())
}

fn print_summary(before: &IoHealthReport, after: &IoHealthReport, transport: &CountingTransport) {
    println!("status: {:?}", before.status);
    for (resource, stats) in &after.telemetry.io.resources {
        println!(
            "{resource}: physical_ops={} logical_ops={} saved={:.1}% failures={}",
            stats.physical_ops_total,
            stats.logical_ops_total,
            stats.coalescing_saved_percent,
            stats.failures_total
        );
    }
    println!(
        "cache: hits={} misses={} hit_rate={:.1}%",
        after.telemetry.io.cache.hits_total,
        after.telemetry.io.cache.misses_total,
        after.telemetry.io.cache.hit_rate_percent
    );
    println!(
        "outbound: direct_frames={} batches={} batched_frames={}",
        transport.direct_frames.load(Ordering::Relaxed),
        transport.batches.load(Ordering::Relaxed),
        transport.batched_frames.load(Ordering::Relaxed)
    );
    for circuit in &before.circuits {
        println!(
            "circuit {}: state={} failures={}",
            circuit.name, circuit.state, circuit.failure_count
        );
    }
    println!(
        "rate limits: requests={} rejections={}",
        after.telemetry.rate_limits.requests_total, after.telemetry.rate_limits.rejections_total
    );
}
