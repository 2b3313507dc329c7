//! Failure isolation for calls out of the Tau gateway.
//!
//! A [`CircuitBreaker`] stops hammering a dependency that keeps failing and
//! probes it again after a cooldown; [`FixedWindowRateLimiter`] bounds request
//! rates per key. Both report to the shared telemetry collectors.

mod breaker;
mod rate_limiter;
mod registry;

pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerSnapshot,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_HALF_OPEN_MAX_ATTEMPTS, DEFAULT_RESET_TIMEOUT_MS,
    HALF_OPEN_RETRY_AFTER_MAX_MS,
};
pub use rate_limiter::{FixedWindowRateLimiter, RateLimitConfig, RateLimitError};
pub use registry::CircuitBreakerRegistry;
pub use tau_io_telemetry::CircuitState;
