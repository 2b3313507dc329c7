//! Gateway-facing facade over the I/O efficiency and resilience components.
//!
//! [`IoLayer`] builds the telemetry hub, circuit breakers, rate limiter, write
//! coalescers, tuned SQLite store, outbound batcher and read cache from one
//! [`IoLayerConfig`], produces the diagnostics [`IoHealthReport`], and shuts
//! everything down in dependency order.

use std::sync::{Arc, OnceLock};

use anyhow::{bail, Result};

mod config;
mod health;
mod layer;

pub use config::{IoLayerConfig, DATABASE_FILE_NAME, DEFAULT_HTTP_TIMEOUT_MS};
pub use health::{IoHealthReport, IoHealthStatus};
pub use layer::{IoLayer, SharedTransport};

static GLOBAL_IO_LAYER: OnceLock<Arc<IoLayer>> = OnceLock::new();

/// Installs the process-wide layer. Fails if one is already installed.
pub fn install_global_io_layer(layer: Arc<IoLayer>) -> Result<Arc<IoLayer>> {
    let installed = GLOBAL_IO_LAYER.get_or_init(|| layer.clone());
    if !Arc::ptr_eq(installed, &layer) {
        bail!("a global io layer is already installed");
    }
    Ok(layer)
}

pub fn global_io_layer() -> Option<Arc<IoLayer>> {
    GLOBAL_IO_LAYER.get().cloned()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::{global_io_layer, install_global_io_layer, IoLayer, IoLayerConfig};

    #[tokio::test]
    async fn integration_global_layer_installs_once() {
        let temp = tempdir().expect("tempdir");
        let mut config = IoLayerConfig::new(temp.path().join("first"));
        config.storage = None;
        let first = Arc::new(IoLayer::start(config.clone(), None).expect("start"));
        config.state_dir = temp.path().join("second");
        let second = Arc::new(IoLayer::start(config, None).expect("start"));

        install_global_io_layer(first.clone()).expect("first install");
        assert!(install_global_io_layer(second.clone()).is_err());
        let global = global_io_layer().expect("installed");
        assert!(Arc::ptr_eq(&global, &first));

        first.shutdown().await;
        second.shutdown().await;
    }
}
