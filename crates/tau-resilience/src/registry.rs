use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tau_core::{lock_or_recover_mutex, system_clock, ClockFn};
use tau_io_telemetry::CircuitMetricsCollector;

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot};

/// Named breakers shared across callers, one per protected dependency.
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    clock: ClockFn,
    telemetry: Option<Arc<CircuitMetricsCollector>>,
    breakers: Mutex<BTreeMap<String, CircuitBreaker>>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("default_config", &self.default_config)
            .field("breakers", &lock_or_recover_mutex(&self.breakers).len())
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerRegistry {
    pub fn new(
        default_config: CircuitBreakerConfig,
        telemetry: Option<Arc<CircuitMetricsCollector>>,
    ) -> Self {
        Self::new_with_clock(default_config, system_clock(), telemetry)
    }

    pub fn new_with_clock(
        default_config: CircuitBreakerConfig,
        clock: ClockFn,
        telemetry: Option<Arc<CircuitMetricsCollector>>,
    ) -> Self {
        Self {
            default_config,
            clock,
            telemetry,
            breakers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get_or_create(&self, name: &str) -> CircuitBreaker {
        self.get_or_create_with_config(name, self.default_config)
    }

    /// `config` only applies when the breaker does not exist yet.
    pub fn get_or_create_with_config(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> CircuitBreaker {
        let mut breakers = lock_or_recover_mutex(&self.breakers);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(circuit = name, "registering circuit breaker");
                CircuitBreaker::new_with_clock(
                    name,
                    config,
                    self.clock.clone(),
                    self.telemetry.clone(),
                )
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        lock_or_recover_mutex(&self.breakers).get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        lock_or_recover_mutex(&self.breakers).keys().cloned().collect()
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let breakers: Vec<CircuitBreaker> =
            lock_or_recover_mutex(&self.breakers).values().cloned().collect();
        breakers.iter().map(CircuitBreaker::snapshot).collect()
    }

    pub fn dispose_all(&self) {
        let breakers: Vec<CircuitBreaker> =
            lock_or_recover_mutex(&self.breakers).values().cloned().collect();
        for breaker in breakers {
            breaker.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use tau_core::ManualClock;
    use tau_io_telemetry::CircuitState;

    use super::CircuitBreakerRegistry;
    use crate::breaker::{CircuitBreakerConfig, CircuitBreakerError};

    #[tokio::test]
    async fn functional_registry_shares_breaker_state_by_name() {
        let clock = ManualClock::new(0);
        let registry = CircuitBreakerRegistry::new_with_clock(
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            },
            clock.as_clock(),
            None,
        );
        let first = registry.get_or_create("telegram");
        let _ = first
            .execute(|| async { Err::<(), _>("timeout") })
            .await;
        let second = registry.get_or_create("telegram");
        assert_eq!(second.state(), CircuitState::Open);
        assert_eq!(registry.get_or_create("discord").state(), CircuitState::Closed);
        assert_eq!(registry.names(), vec!["discord".to_string(), "telegram".to_string()]);
    }

    #[tokio::test]
    async fn functional_dispose_all_rejects_every_breaker() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), None);
        let slack = registry.get_or_create("slack");
        registry.get_or_create("matrix");
        registry.dispose_all();

        let result = slack.execute(|| async { Ok::<_, String>(1) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Disposed)));
        assert!(registry.snapshots().iter().all(|snapshot| snapshot.disposed));
    }

    #[test]
    fn unit_config_applies_only_on_first_registration() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), None);
        let custom = CircuitBreakerConfig {
            failure_threshold: 9,
            ..CircuitBreakerConfig::default()
        };
        registry.get_or_create_with_config("db", custom);
        let again = registry.get_or_create("db");
        assert_eq!(again.config().failure_threshold, 9);
        assert!(registry.get("missing").is_none());
    }
}
