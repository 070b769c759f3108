//! Service recovery transitions driving resync jobs through the full context

use async_trait::async_trait;
use bulwark_config::{BulwarkConfig, ServiceConfig};
use bulwark_health::{HealthProbe, ProbeExtra, ProbeTarget};
use bulwark_interfaces::ServiceAvailability;
use bulwark_recovery::{
    command, Priority, RecoveryOperation, RecoveryType, SyncBackend, SyncJob, SyncJobStatus,
    SyncType,
};
use bulwark_runtime::ResilienceContext;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Toggle(AtomicBool);

#[async_trait]
impl HealthProbe for Toggle {
    async fn check(&self) -> anyhow::Result<ProbeExtra> {
        if self.0.load(Ordering::SeqCst) {
            Ok(ProbeExtra::new())
        } else {
            anyhow::bail!("connection refused")
        }
    }
}

/// Target store that records what was written back
#[derive(Default)]
struct RecordingStore {
    written: Mutex<Vec<String>>,
    stale: Mutex<HashSet<String>>,
}

#[async_trait]
impl SyncBackend for RecordingStore {
    async fn sync_key(&self, key: &str) -> anyhow::Result<()> {
        self.written.lock().push(key.to_string());
        self.stale.lock().remove(key);
        Ok(())
    }

    async fn sync_item(&self, item: &Value) -> anyhow::Result<()> {
        self.written.lock().push(item.to_string());
        Ok(())
    }

    async fn verify_key(&self, key: &str) -> anyhow::Result<bool> {
        Ok(!self.stale.lock().contains(key))
    }
}

fn config() -> BulwarkConfig {
    let mut config = BulwarkConfig::default();
    config.health.services = vec![ServiceConfig::new("storage")
        .critical()
        .with_interval(Duration::from_secs(1))
        .with_thresholds(2, 2)
        .with_circuit_breaker(10, Duration::from_secs(30))];
    config.recovery.worker_interval = Duration::from_millis(500);
    config.recovery.monitor_interval = Duration::from_secs(1);
    config.recovery.consistency_check_sample_rate = 0.0;
    config.recovery.retry.base_delay = Duration::from_millis(500);
    config.recovery.retry.jitter_enabled = false;
    config.sync.sync_interval = Duration::from_millis(500);
    config
}

#[tokio::test(start_paused = true)]
async fn test_outage_and_recovery_end_to_end() {
    let context = ResilienceContext::new(config());
    let toggle = Arc::new(Toggle(AtomicBool::new(true)));
    context
        .register_service("storage", ProbeTarget::Custom(toggle.clone()))
        .unwrap();

    let store = Arc::new(RecordingStore::default());
    store.stale.lock().insert("user:2".to_string());
    context.sync_jobs().register_backend("storage", store.clone());
    context.resync_on_recovery("storage", |service| {
        SyncJob::new(service, SyncType::Repair)
            .with_source_keys(["user:1", "user:2", "user:3"])
            .with_priority(Priority::High)
    });

    let recovered = Arc::new(AtomicU32::new(0));
    let counter = recovered.clone();
    context
        .recovery()
        .register_recovery_callback("storage", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    context.start().unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(context.health().is_available("storage"));

    // Outage: the write-back waits while the service is down
    toggle.0.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!context.health().is_available("storage"));

    let executed = Arc::new(AtomicU32::new(0));
    let runs = executed.clone();
    context
        .recovery()
        .schedule(
            RecoveryOperation::new(
                "profile_write",
                "storage",
                command(move || {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                }),
            )
            .with_recovery_type(RecoveryType::ImmediateRetry)
            .with_priority(Priority::Critical),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(executed.load(Ordering::SeqCst), 0);

    // Recovery: callbacks fire once and the repair job rewrites the stale key
    toggle.0.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert!(context.health().is_available("storage"));
    assert_eq!(recovered.load(Ordering::SeqCst), 1);
    assert_eq!(executed.load(Ordering::SeqCst), 1);

    let jobs = context.sync_jobs().list_jobs(Some(SyncJobStatus::Completed), 10);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].repaired, 1);
    assert_eq!(jobs[0].progress, 100.0);
    assert_eq!(*store.written.lock(), vec!["user:2".to_string()]);

    let status = context.recovery().get_recovery_status();
    assert_eq!(status.sync_stats.completed, 1);
    assert_eq!(status.type_stats[&RecoveryType::ImmediateRetry].successes, 1);

    let report = context.shutdown().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(context.health().active_loops(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_no_callback_without_prior_outage() {
    let context = ResilienceContext::new(config());
    context
        .register_service_on_demand("storage", ProbeTarget::Custom(Arc::new(Toggle(AtomicBool::new(true)))))
        .unwrap();

    let fired = Arc::new(AtomicU32::new(0));
    let counter = fired.clone();
    context
        .recovery()
        .register_recovery_callback("storage", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    for _ in 0..5 {
        context.health().force_check("storage").await.unwrap();
        assert!(context.recovery().check_service_recoveries().is_empty());
    }
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}
