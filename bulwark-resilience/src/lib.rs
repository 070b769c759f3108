//! Resilience patterns for bulwark
//!
//! This crate provides per-service circuit breakers, exponential backoff
//! with jitter, retry policies and shutdown coordination for background
//! loops.

pub mod backoff;
pub mod circuit_breaker;
pub mod retry;
pub mod shutdown;

// Re-export commonly used types
pub use backoff::BackoffCalculator;
pub use circuit_breaker::{
    CallPermission, CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerConfig,
    CircuitBreakerManager, CircuitBreakerSnapshot, CircuitMetrics, CircuitState,
};
pub use retry::RetryPolicy;
pub use shutdown::{ShutdownCoordinator, ShutdownError, ShutdownListener, ShutdownReport, ShutdownSignal};
