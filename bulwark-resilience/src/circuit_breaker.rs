//! Circuit breaker pattern implementation
//!
//! A breaker counts consecutive failures. Once the count reaches the
//! configured threshold it opens and rejects calls until the cooldown has
//! elapsed, after which exactly one trial call is let through. The
//! half-open state is never stored: it is derived from `is_open` and the
//! time of the next permitted attempt.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests are blocked
    Open,
    /// Cooldown elapsed, a single trial request is allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Time to wait before a half-open trial is permitted
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Answer to "may this call proceed?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPermission {
    /// Breaker closed
    Allowed,
    /// Breaker half-open, this caller owns the single trial
    Trial,
    /// Breaker open; `retry_in` is the remaining cooldown
    Rejected { retry_in: Duration },
}

impl CallPermission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, CallPermission::Rejected { .. })
    }
}

/// Circuit breaker metrics
#[derive(Debug, Clone, Default)]
pub struct CircuitMetrics {
    /// Total number of recorded outcomes
    pub total_requests: u64,
    /// Number of successful requests
    pub total_successes: u64,
    /// Number of failed requests
    pub total_failures: u64,
    /// Number of requests rejected due to open circuit
    pub total_rejected: u64,
    /// Number of times the breaker has opened
    pub times_opened: u64,
    /// Last failure time
    pub last_failure_time: Option<Instant>,
    /// Last success time
    pub last_success_time: Option<Instant>,
    /// Last state change time
    pub last_state_change: Option<Instant>,
}

/// Point-in-time view of a breaker, suitable for status endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub is_open: bool,
    pub failure_count: u32,
    /// Remaining cooldown while open
    #[serde(with = "humantime_serde", default)]
    pub retry_in: Option<Duration>,
}

/// Thread-safe circuit breaker implementation
#[derive(Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
}

#[derive(Default)]
struct CircuitBreakerState {
    is_open: bool,
    failure_count: u32,
    next_attempt_time: Option<Instant>,
    trial_in_flight: bool,
    metrics: CircuitMetrics,
}

impl CircuitBreakerState {
    fn current(&self, now: Instant) -> CircuitState {
        match (self.is_open, self.next_attempt_time) {
            (false, _) => CircuitState::Closed,
            (true, Some(next)) if now >= next => CircuitState::HalfOpen,
            (true, _) => CircuitState::Open,
        }
    }

    fn remaining_cooldown(&self, now: Instant) -> Option<Duration> {
        if !self.is_open {
            return None;
        }
        self.next_attempt_time
            .map(|next| next.saturating_duration_since(now))
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CircuitBreakerState::default())),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask whether a call may proceed. Claims the half-open trial when the
    /// cooldown has elapsed and nobody else holds it.
    pub fn check(&self) -> CallPermission {
        let mut state = self.state.lock();
        let now = Instant::now();

        match state.current(now) {
            CircuitState::Closed => CallPermission::Allowed,
            CircuitState::Open => {
                state.metrics.total_rejected += 1;
                CallPermission::Rejected {
                    retry_in: state.remaining_cooldown(now).unwrap_or_default(),
                }
            }
            CircuitState::HalfOpen if state.trial_in_flight => {
                state.metrics.total_rejected += 1;
                CallPermission::Rejected {
                    retry_in: Duration::ZERO,
                }
            }
            CircuitState::HalfOpen => {
                state.trial_in_flight = true;
                state.metrics.last_state_change = Some(now);
                log::info!("Circuit breaker half-open, allowing trial request");
                CallPermission::Trial
            }
        }
    }

    /// Whether the breaker is open (including the half-open window)
    pub fn is_open(&self) -> bool {
        self.state.lock().is_open
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        self.state.lock().current(Instant::now())
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Remaining cooldown, if open
    pub fn retry_in(&self) -> Option<Duration> {
        self.state.lock().remaining_cooldown(Instant::now())
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.metrics.total_requests += 1;
        state.metrics.total_successes += 1;
        state.metrics.last_success_time = Some(now);

        if state.is_open {
            if state.trial_in_flight {
                self.transition_to_closed(&mut state, now);
            }
        } else {
            state.failure_count = 0;
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.metrics.total_requests += 1;
        state.metrics.total_failures += 1;
        state.metrics.last_failure_time = Some(now);
        state.failure_count = state.failure_count.saturating_add(1);

        if state.is_open {
            if state.trial_in_flight {
                state.trial_in_flight = false;
                self.transition_to_open(&mut state, now);
            }
        } else if state.failure_count >= self.config.failure_threshold {
            self.transition_to_open(&mut state, now);
        }
    }

    /// Record a call that was rejected without consulting `check`
    pub fn record_rejection(&self) {
        self.state.lock().metrics.total_rejected += 1;
    }

    /// Get current metrics
    pub fn metrics(&self) -> CircuitMetrics {
        self.state.lock().metrics.clone()
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let opened = state.metrics.times_opened;
        *state = CircuitBreakerState::default();
        state.metrics.times_opened = opened;
        state.metrics.last_state_change = Some(Instant::now());
    }

    pub fn snapshot(&self, service: &str) -> CircuitBreakerSnapshot {
        let state = self.state.lock();
        let now = Instant::now();
        CircuitBreakerSnapshot {
            service: service.to_string(),
            state: state.current(now),
            is_open: state.is_open,
            failure_count: state.failure_count,
            retry_in: state.remaining_cooldown(now),
        }
    }

    fn transition_to_open(&self, state: &mut CircuitBreakerState, now: Instant) {
        state.is_open = true;
        state.next_attempt_time = Some(now + self.config.timeout);
        state.metrics.times_opened += 1;
        state.metrics.last_state_change = Some(now);
        log::warn!(
            "Circuit breaker opened after {} consecutive failures, next attempt in {:?}",
            state.failure_count,
            self.config.timeout
        );
    }

    fn transition_to_closed(&self, state: &mut CircuitBreakerState, now: Instant) {
        state.is_open = false;
        state.failure_count = 0;
        state.next_attempt_time = None;
        state.trial_in_flight = false;
        state.metrics.last_state_change = Some(now);
        log::info!("Circuit breaker closed after successful trial");
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CircuitBreaker")
            .field("config", &*self.config)
            .field("is_open", &state.is_open)
            .field("failure_count", &state.failure_count)
            .finish()
    }
}

/// Builder for circuit breaker configuration
pub struct CircuitBreakerBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerBuilder {
    /// Create a new builder with default config
    pub fn new() -> Self {
        Self {
            config: CircuitBreakerConfig::default(),
        }
    }

    /// Set failure threshold
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Set cooldown before attempting recovery
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Build the circuit breaker
    pub fn build(self) -> CircuitBreaker {
        CircuitBreaker::new(self.config)
    }
}

impl Default for CircuitBreakerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One breaker per registered service.
///
/// Unknown services are treated as closed.
#[derive(Debug, Default)]
pub struct CircuitBreakerManager {
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, replacing any existing breaker for it
    pub fn register(&self, service: impl Into<String>, config: CircuitBreakerConfig) {
        let service = service.into();
        log::debug!(
            "Registering circuit breaker for {} (threshold {}, cooldown {:?})",
            service,
            config.failure_threshold,
            config.timeout
        );
        self.breakers
            .write()
            .insert(service, CircuitBreaker::new(config));
    }

    pub fn remove(&self, service: &str) -> bool {
        self.breakers.write().remove(service).is_some()
    }

    pub fn breaker(&self, service: &str) -> Option<CircuitBreaker> {
        self.breakers.read().get(service).cloned()
    }

    pub fn check_state(&self, service: &str) -> CallPermission {
        match self.breaker(service) {
            Some(breaker) => breaker.check(),
            None => CallPermission::Allowed,
        }
    }

    pub fn record(&self, service: &str, success: bool) {
        if let Some(breaker) = self.breaker(service) {
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
    }

    pub fn record_success(&self, service: &str) {
        self.record(service, true);
    }

    pub fn record_failure(&self, service: &str) {
        self.record(service, false);
    }

    /// `!is_open` for the service's breaker
    pub fn is_available(&self, service: &str) -> bool {
        self.breaker(service).map_or(true, |b| !b.is_open())
    }

    pub fn state(&self, service: &str) -> Option<CircuitState> {
        self.breaker(service).map(|b| b.state())
    }

    /// Manually reset a breaker. Returns false for unknown services.
    pub fn reset(&self, service: &str) -> bool {
        match self.breaker(service) {
            Some(breaker) => {
                breaker.reset();
                log::info!("Circuit breaker for {} manually reset", service);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, service: &str) -> Option<CircuitBreakerSnapshot> {
        self.breaker(service).map(|b| b.snapshot(service))
    }

    /// Snapshots of every breaker, sorted by service name
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let breakers = self.breakers.read();
        let mut snapshots: Vec<_> = breakers
            .iter()
            .map(|(service, breaker)| breaker.snapshot(service))
            .collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreakerBuilder::new()
            .failure_threshold(threshold)
            .timeout(cooldown)
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_basic_flow() {
        let breaker = breaker(3, Duration::from_secs(10));

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.is_open());

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.is_open());
        assert!(!breaker.check().is_allowed());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.check(), CallPermission::Trial);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.check(), CallPermission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_restarts_cooldown() {
        let breaker = breaker(2, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.check(), CallPermission::Trial);
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.retry_in(), Some(Duration::from_secs(30)));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!breaker.check().is_allowed());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.check(), CallPermission::Trial);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_trial_in_half_open() {
        let breaker = breaker(1, Duration::from_secs(5));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(breaker.check(), CallPermission::Trial);
        assert_eq!(
            breaker.check(),
            CallPermission::Rejected {
                retry_in: Duration::ZERO
            }
        );
    }

    #[test]
    fn test_success_resets_failure_count_when_closed() {
        let breaker = breaker(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 2);
    }

    #[test]
    fn test_circuit_breaker_metrics() {
        let breaker = CircuitBreaker::with_defaults();

        breaker.record_success();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_rejection();

        let metrics = breaker.metrics();
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.total_successes, 2);
        assert_eq!(metrics.total_failures, 1);
        assert_eq!(metrics.total_rejected, 1);
        assert_eq!(metrics.times_opened, 0);
    }

    #[test]
    fn test_reset_clears_state() {
        let breaker = breaker(1, Duration::from_secs(600));
        breaker.record_failure();
        assert!(breaker.is_open());

        breaker.reset();
        assert!(!breaker.is_open());
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.check(), CallPermission::Allowed);
        assert_eq!(breaker.metrics().times_opened, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manager_short_circuits_during_cooldown() {
        let manager = CircuitBreakerManager::new();
        manager.register(
            "storage",
            CircuitBreakerConfig {
                failure_threshold: 5,
                timeout: Duration::from_secs(60),
            },
        );

        for _ in 0..5 {
            assert!(manager.check_state("storage").is_allowed());
            manager.record_failure("storage");
        }
        assert!(!manager.is_available("storage"));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            manager.check_state("storage"),
            CallPermission::Rejected {
                retry_in: Duration::from_secs(50)
            }
        );

        tokio::time::advance(Duration::from_secs(51)).await;
        assert_eq!(manager.check_state("storage"), CallPermission::Trial);
        manager.record_success("storage");
        assert!(manager.is_available("storage"));
    }

    #[test]
    fn test_manager_unknown_service() {
        let manager = CircuitBreakerManager::new();
        assert_eq!(manager.check_state("ghost"), CallPermission::Allowed);
        assert!(manager.is_available("ghost"));
        assert!(!manager.reset("ghost"));
        assert!(manager.snapshot("ghost").is_none());
    }

    #[test]
    fn test_manager_snapshots_sorted() {
        let manager = CircuitBreakerManager::new();
        manager.register("storage", CircuitBreakerConfig::default());
        manager.register("cache", CircuitBreakerConfig::default());
        manager.record_failure("cache");

        let snapshots = manager.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].service, "cache");
        assert_eq!(snapshots[0].failure_count, 1);
        assert_eq!(snapshots[0].state, CircuitState::Closed);
        assert_eq!(snapshots[1].service, "storage");
    }

    #[test]
    fn test_config_serde_humantime() {
        let config: CircuitBreakerConfig =
            serde_json::from_str(r#"{"failure_threshold": 4, "timeout": "90s"}"#).unwrap();
        assert_eq!(config.failure_threshold, 4);
        assert_eq!(config.timeout, Duration::from_secs(90));
    }
}
