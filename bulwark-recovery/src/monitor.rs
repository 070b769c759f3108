//! Detects services coming back and fires recovery callbacks

use bulwark_interfaces::ServiceAvailability;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Invoked with the service name when it becomes available again
pub type RecoveryCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Remembers the last sampled availability of each service
pub struct RecoveryMonitor {
    availability: Arc<dyn ServiceAvailability>,
    callbacks: RwLock<HashMap<String, Vec<RecoveryCallback>>>,
    previous: Mutex<HashMap<String, bool>>,
}

impl RecoveryMonitor {
    pub fn new(availability: Arc<dyn ServiceAvailability>) -> Self {
        Self {
            availability,
            callbacks: RwLock::new(HashMap::new()),
            previous: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, service: impl Into<String>, callback: RecoveryCallback) {
        self.callbacks
            .write()
            .entry(service.into())
            .or_default()
            .push(callback);
    }

    pub fn callback_count(&self, service: &str) -> usize {
        self.callbacks.read().get(service).map_or(0, Vec::len)
    }

    /// Sample every known service once, firing callbacks for each
    /// unavailable-to-available transition. Returns the recovered services.
    pub fn sample(&self) -> Vec<String> {
        let mut services = self.availability.registered_services();
        for service in self.callbacks.read().keys() {
            if !services.contains(service) {
                services.push(service.clone());
            }
        }
        services.sort();

        let mut recovered = Vec::new();
        {
            let mut previous = self.previous.lock();
            for service in services {
                let available = self.availability.is_available(&service);
                if let Some(was_available) = previous.insert(service.clone(), available) {
                    if !was_available && available {
                        recovered.push(service);
                    }
                }
            }
        }

        for service in &recovered {
            let callbacks = self.callbacks.read().get(service).cloned().unwrap_or_default();
            info!(
                service = %service,
                callbacks = callbacks.len(),
                "Service recovered, running recovery callbacks"
            );
            for callback in callbacks {
                callback(service);
            }
        }

        if recovered.is_empty() {
            debug!("Recovery monitor sample found no transitions");
        }
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_interfaces::StaticAvailability;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fires_on_down_to_up_only() {
        let availability = Arc::new(StaticAvailability::new());
        availability.set("storage", false);
        let monitor = RecoveryMonitor::new(availability.clone());

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        monitor.register(
            "storage",
            Arc::new(move |service: &str| {
                assert_eq!(service, "storage");
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // First sample only establishes the baseline
        assert!(monitor.sample().is_empty());

        availability.set("storage", true);
        assert_eq!(monitor.sample(), vec!["storage".to_string()]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Staying up does not fire again
        assert!(monitor.sample().is_empty());

        availability.set("storage", false);
        assert!(monitor.sample().is_empty());
        availability.set("storage", true);
        monitor.sample();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_first_sample_of_available_service_does_not_fire() {
        let availability = Arc::new(StaticAvailability::new());
        availability.set("cache", true);
        let monitor = RecoveryMonitor::new(availability);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        monitor.register("cache", Arc::new(move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        monitor.sample();
        monitor.sample();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.callback_count("cache"), 1);
    }

    #[test]
    fn test_every_callback_for_service_runs() {
        let availability = Arc::new(StaticAvailability::new());
        availability.set("search", false);
        let monitor = RecoveryMonitor::new(availability.clone());

        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = fired.clone();
            monitor.register("search", Arc::new(move |_: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        monitor.sample();
        availability.set("search", true);
        monitor.sample();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }
}
