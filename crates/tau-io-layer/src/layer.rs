use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tau_coalesce::{CoalescerOptions, LogCoalescer, SessionWriteCoalescer};
use tau_core::{system_clock, ClockFn};
use tau_io_telemetry::TelemetryHub;
use tau_netbatch::{
    CachedHttpClient, CachedHttpResponse, OutboundBatcher, OutboundTransport, ReadCache,
};
use tau_resilience::{CircuitBreaker, CircuitBreakerRegistry, FixedWindowRateLimiter};
use tau_storage::TunedSqliteStore;

use crate::config::IoLayerConfig;
use crate::health::{classify_circuits, IoHealthReport};

pub type SharedTransport = Arc<dyn OutboundTransport>;

/// Every I/O component of one gateway process, wired to one telemetry hub.
pub struct IoLayer {
    config: IoLayerConfig,
    clock: ClockFn,
    telemetry: TelemetryHub,
    breakers: CircuitBreakerRegistry,
    rate_limiter: FixedWindowRateLimiter,
    logs: LogCoalescer,
    sessions: SessionWriteCoalescer,
    storage: Option<TunedSqliteStore>,
    outbound: Option<OutboundBatcher<SharedTransport>>,
    read_cache: Arc<ReadCache<CachedHttpResponse>>,
    http: CachedHttpClient,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for IoLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoLayer")
            .field("state_dir", &self.config.state_dir)
            .field("storage", &self.storage.is_some())
            .field("outbound", &self.outbound.is_some())
            .finish_non_exhaustive()
    }
}

impl IoLayer {
    /// Builds every component. Must run inside a tokio runtime.
    pub fn start(config: IoLayerConfig, transport: Option<SharedTransport>) -> Result<Self> {
        Self::start_with_clock(config, transport, system_clock())
    }

    #[tracing::instrument(
        name = "io_layer.start",
        skip_all,
        fields(state_dir = %config.state_dir.display())
    )]
    pub fn start_with_clock(
        config: IoLayerConfig,
        transport: Option<SharedTransport>,
        clock: ClockFn,
    ) -> Result<Self> {
        std::fs::create_dir_all(config.logs_dir()).with_context(|| {
            format!("failed to create {}", config.logs_dir().display())
        })?;
        std::fs::create_dir_all(config.sessions_dir()).with_context(|| {
            format!("failed to create {}", config.sessions_dir().display())
        })?;

        let telemetry = TelemetryHub::with_clock(config.telemetry, clock.clone());
        let breakers = CircuitBreakerRegistry::new_with_clock(
            config.breaker,
            clock.clone(),
            Some(telemetry.circuits.clone()),
        );
        let rate_limiter = FixedWindowRateLimiter::new_with_clock(
            config.rate_limit,
            clock.clone(),
            Some(telemetry.rate_limits.clone()),
        );
        let coalescer_options = CoalescerOptions {
            telemetry: Some(telemetry.io.clone()),
            failure_sink: None,
        };
        let logs = LogCoalescer::new_with_options(
            config.log_coalescer,
            config.log_rotation,
            coalescer_options.clone(),
        )
        .context("failed to start log coalescer")?;
        let sessions =
            SessionWriteCoalescer::new_with_options(config.session_coalescer, coalescer_options)
                .context("failed to start session coalescer")?;
        let storage = match config.storage {
            Some(tuning) => Some(
                TunedSqliteStore::open_with_telemetry(
                    config.database_path(),
                    tuning,
                    Some(telemetry.io.clone()),
                )
                .with_context(|| {
                    format!("failed to open {}", config.database_path().display())
                })?,
            ),
            None => None,
        };
        let outbound = match transport {
            Some(transport) => Some(
                OutboundBatcher::new_with_telemetry(
                    config.batcher,
                    transport,
                    Some(telemetry.io.clone()),
                )
                .context("failed to start outbound batcher")?,
            ),
            None => None,
        };
        let read_cache = Arc::new(ReadCache::new_with_clock(
            config.read_cache.clone(),
            clock.clone(),
            Some(telemetry.io.clone()),
        ));
        let http = CachedHttpClient::new(read_cache.clone(), config.http_timeout_ms)?;

        tracing::debug!(
            storage = storage.is_some(),
            outbound = outbound.is_some(),
            "io layer started"
        );
        Ok(Self {
            config,
            clock,
            telemetry,
            breakers,
            rate_limiter,
            logs,
            sessions,
            storage,
            outbound,
            read_cache,
            http,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &IoLayerConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &TelemetryHub {
        &self.telemetry
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Shared breaker for the named dependency, created on first use.
    pub fn breaker(&self, name: &str) -> CircuitBreaker {
        self.breakers.get_or_create(name)
    }

    pub fn rate_limiter(&self) -> &FixedWindowRateLimiter {
        &self.rate_limiter
    }

    pub fn logs(&self) -> &LogCoalescer {
        &self.logs
    }

    pub fn sessions(&self) -> &SessionWriteCoalescer {
        &self.sessions
    }

    pub fn storage(&self) -> Option<&TunedSqliteStore> {
        self.storage.as_ref()
    }

    pub fn outbound(&self) -> Option<&OutboundBatcher<SharedTransport>> {
        self.outbound.as_ref()
    }

    pub fn read_cache(&self) -> &Arc<ReadCache<CachedHttpResponse>> {
        &self.read_cache
    }

    pub fn http(&self) -> &CachedHttpClient {
        &self.http
    }

    pub fn channel_log_path(&self, channel: &str) -> PathBuf {
        tau_coalesce::channel_log_path(&self.config.logs_dir(), channel)
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.config.sessions_dir().join(format!("{session_id}.json"))
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn health_report(&self) -> IoHealthReport {
        let circuits = self.breakers.snapshots();
        let (status, degraded_circuits) = classify_circuits(&circuits);
        IoHealthReport {
            status,
            generated_unix_ms: (self.clock)(),
            degraded_circuits,
            telemetry: self.telemetry.snapshot(),
            circuits,
            log_coalescer: self.logs.stats(),
            session_coalescer: self.sessions.stats(),
            storage: self.storage.as_ref().map(TunedSqliteStore::metrics),
            outbound: self.outbound.as_ref().map(OutboundBatcher::stats),
            read_cache: self.read_cache.stats(),
        }
    }

    /// Drains and closes every component, outbound first and storage last.
    /// Idempotent.
    #[tracing::instrument(name = "io_layer.shutdown", skip_all)]
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(outbound) = &self.outbound {
            outbound.shutdown().await;
        }
        self.sessions.close().await;
        self.logs.close().await;
        if let Some(storage) = &self.storage {
            if let Err(error) = storage.close().await {
                tracing::warn!(%error, "storage close failed");
            }
        }
        self.breakers.dispose_all();
        tracing::debug!("io layer shut down");
    }
}
