//! Service availability interface
//!
//! The health manager implements [`ServiceAvailability`]; the recovery engine
//! consults it before executing an operation and its monitor loop samples it
//! to detect services coming back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use parking_lot::RwLock;

/// Read-only view of which services can currently take traffic
pub trait ServiceAvailability: Send + Sync {
    /// Whether calls to `service` should be attempted.
    ///
    /// Services the implementation does not know about are reported available.
    fn is_available(&self, service: &str) -> bool;

    /// Names of all registered services
    fn registered_services(&self) -> Vec<String>;

    /// Last-known health of every registered service
    fn health_snapshot(&self) -> Vec<ServiceHealthSnapshot>;
}

/// Last-known health of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealthSnapshot {
    pub service: String,
    pub available: bool,
    pub circuit_breaker_open: bool,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub last_checked: Option<DateTime<Utc>>,
}

impl ServiceHealthSnapshot {
    pub fn new(service: impl Into<String>, available: bool) -> Self {
        Self {
            service: service.into(),
            available,
            circuit_breaker_open: !available,
            consecutive_failures: 0,
            success_rate: if available { 100.0 } else { 0.0 },
            last_checked: None,
        }
    }
}

/// Fixed availability table, for embedding the recovery engine without a
/// health manager and for tests.
#[derive(Debug, Default)]
pub struct StaticAvailability {
    services: RwLock<HashMap<String, bool>>,
}

impl StaticAvailability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the availability of a service, registering it if needed
    pub fn set(&self, service: impl Into<String>, available: bool) {
        self.services.write().insert(service.into(), available);
    }
}

impl ServiceAvailability for StaticAvailability {
    fn is_available(&self, service: &str) -> bool {
        self.services.read().get(service).copied().unwrap_or(true)
    }

    fn registered_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn health_snapshot(&self) -> Vec<ServiceHealthSnapshot> {
        let mut snapshots: Vec<ServiceHealthSnapshot> = self
            .services
            .read()
            .iter()
            .map(|(name, available)| ServiceHealthSnapshot::new(name.clone(), *available))
            .collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }
}
