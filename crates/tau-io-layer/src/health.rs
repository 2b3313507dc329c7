use serde::Serialize;
use tau_coalesce::CoalescerStats;
use tau_io_telemetry::TelemetrySnapshot;
use tau_netbatch::{BatcherStats, ReadCacheStats};
use tau_resilience::{CircuitBreakerSnapshot, CircuitState};
use tau_storage::StorageMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IoHealthStatus {
    Healthy,
    /// At least one circuit is Open or HalfOpen.
    Degraded,
}

/// Payload served by the gateway diagnostics endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IoHealthReport {
    pub status: IoHealthStatus,
    pub generated_unix_ms: u64,
    pub degraded_circuits: Vec<String>,
    pub telemetry: TelemetrySnapshot,
    pub circuits: Vec<CircuitBreakerSnapshot>,
    pub log_coalescer: CoalescerStats,
    pub session_coalescer: CoalescerStats,
    pub storage: Option<StorageMetrics>,
    pub outbound: Option<BatcherStats>,
    pub read_cache: ReadCacheStats,
}

impl IoHealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == IoHealthStatus::Healthy
    }
}

pub(crate) fn classify_circuits(circuits: &[CircuitBreakerSnapshot]) -> (IoHealthStatus, Vec<String>) {
    let degraded: Vec<String> = circuits
        .iter()
        .filter(|circuit| circuit.state != CircuitState::Closed)
        .map(|circuit| circuit.name.clone())
        .collect();
    let status = if degraded.is_empty() {
        IoHealthStatus::Healthy
    } else {
        IoHealthStatus::Degraded
    };
    (status, degraded)
}
