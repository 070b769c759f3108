//! Background data resynchronisation jobs
//!
//! Jobs are queued by priority and drained by a worker loop, at most
//! `sync_batch_size` per tick. Each job dispatches to the [`SyncBackend`]
//! registered for its service.

use async_trait::async_trait;
use bulwark_config::SyncConfig;
use bulwark_resilience::{ShutdownCoordinator, ShutdownError, ShutdownReport};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ScheduleError, SyncError};
use crate::operation::Priority;
use crate::queue::{PriorityQueues, Queued};

/// Kind of synchronisation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// Every source key and data item
    Full,
    /// Source keys missing from the target, plus data items
    Incremental,
    /// Verify each source key and re-sync the ones that differ
    Repair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Service-specific synchronisation primitives
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Copy one key from source to target
    async fn sync_key(&self, key: &str) -> anyhow::Result<()>;

    /// Write one data item to the target
    async fn sync_item(&self, item: &Value) -> anyhow::Result<()>;

    /// Whether the target's copy of `key` matches the source
    async fn verify_key(&self, key: &str) -> anyhow::Result<bool>;
}

/// One synchronisation job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub service: String,
    pub sync_type: SyncType,
    pub source_keys: Vec<String>,
    pub target_keys: Vec<String>,
    pub data_items: Vec<Value>,
    pub priority: Priority,
    pub status: SyncJobStatus,
    /// 0 to 100
    pub progress: f64,
    pub processed: usize,
    pub repaired: usize,
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl SyncJob {
    pub fn new(service: impl Into<String>, sync_type: SyncType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            service: service.into(),
            sync_type,
            source_keys: Vec::new(),
            target_keys: Vec::new(),
            data_items: Vec::new(),
            priority: Priority::Normal,
            status: SyncJobStatus::Pending,
            progress: 0.0,
            processed: 0,
            repaired: 0,
            delay: Duration::ZERO,
            created_at: now,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn with_source_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_target_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_data_items(mut self, items: Vec<Value>) -> Self {
        self.data_items = items;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Run no earlier than `delay` after scheduling
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, SyncJobStatus::Completed | SyncJobStatus::Failed)
    }

    /// Keys this job will push, in source order
    fn keys_to_sync(&self) -> Vec<&str> {
        match self.sync_type {
            SyncType::Full | SyncType::Repair => self.source_keys.iter().map(String::as_str).collect(),
            SyncType::Incremental => {
                let present: HashSet<&str> = self.target_keys.iter().map(String::as_str).collect();
                self.source_keys
                    .iter()
                    .map(String::as_str)
                    .filter(|k| !present.contains(k))
                    .collect()
            }
        }
    }
}

/// Aggregate sync job statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub total_jobs: u64,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: u64,
    pub failed: u64,
    pub success_rate: f64,
}

struct QueuedJob {
    id: Uuid,
    priority: Priority,
    due_at: Instant,
    enqueued_at: Instant,
}

impl Queued for QueuedJob {
    fn priority(&self) -> Priority {
        self.priority
    }

    fn due_at(&self) -> Instant {
        self.due_at
    }

    fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }
}

#[derive(Default)]
struct SyncState {
    jobs: HashMap<Uuid, SyncJob>,
    finished: VecDeque<Uuid>,
    total_jobs: u64,
    completed: u64,
    failed: u64,
}

/// Queues and runs [`SyncJob`]s
pub struct SyncJobManager {
    config: SyncConfig,
    backends: RwLock<HashMap<String, Arc<dyn SyncBackend>>>,
    queue: Mutex<PriorityQueues<QueuedJob>>,
    state: Mutex<SyncState>,
    shutdown: ShutdownCoordinator,
    started: AtomicBool,
}

impl SyncJobManager {
    /// `queue_capacity` applies to each priority tier
    pub fn new(config: SyncConfig, queue_capacity: usize) -> Self {
        Self {
            config,
            backends: RwLock::new(HashMap::new()),
            queue: Mutex::new(PriorityQueues::new(queue_capacity)),
            state: Mutex::new(SyncState::default()),
            shutdown: ShutdownCoordinator::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn register_backend(&self, service: impl Into<String>, backend: Arc<dyn SyncBackend>) {
        self.backends.write().insert(service.into(), backend);
    }

    /// Enqueue a job, returning its id
    pub fn schedule(&self, mut job: SyncJob) -> Result<Uuid, SyncError> {
        if self.shutdown.is_shutting_down() {
            return Err(ScheduleError::Disabled.into());
        }

        let now = Instant::now();
        job.status = SyncJobStatus::Pending;
        job.scheduled_at = Utc::now()
            + chrono::Duration::from_std(job.delay).unwrap_or_else(|_| chrono::Duration::zero());

        let queued = QueuedJob {
            id: job.id,
            priority: job.priority,
            due_at: now + job.delay,
            enqueued_at: now,
        };

        let mut queue = self.queue.lock();
        if queue.push(queued).is_err() {
            warn!(
                service = %job.service,
                priority = %job.priority,
                "Sync queue at capacity, rejecting job"
            );
            return Err(ScheduleError::QueueFull {
                priority: job.priority,
                capacity: queue.capacity(),
            }
            .into());
        }

        let id = job.id;
        debug!(job_id = %id, service = %job.service, sync_type = ?job.sync_type, "Scheduled sync job");
        let mut state = self.state.lock();
        state.total_jobs += 1;
        state.jobs.insert(id, job);
        Ok(id)
    }

    /// Run up to `sync_batch_size` due jobs. Returns how many ran.
    pub async fn run_tick(&self) -> usize {
        let due = self
            .queue
            .lock()
            .take_due(Instant::now(), self.config.sync_batch_size);

        let count = due.len();
        for queued in due {
            self.run_job(queued.id).await;
        }
        count
    }

    async fn run_job(&self, id: Uuid) {
        let job = {
            let mut state = self.state.lock();
            let Some(job) = state.jobs.get_mut(&id) else {
                return;
            };
            job.status = SyncJobStatus::Running;
            job.started_at = Some(Utc::now());
            job.clone()
        };

        info!(job_id = %id, service = %job.service, sync_type = ?job.sync_type, "Starting sync job");

        let backend = self.backends.read().get(&job.service).cloned();
        let outcome = match backend {
            Some(backend) => self.execute(&job, backend.as_ref()).await,
            None => Err(anyhow::anyhow!(
                "no sync backend registered for service {}",
                job.service
            )),
        };

        let mut state = self.state.lock();
        let succeeded = outcome.is_ok();
        if let Some(job) = state.jobs.get_mut(&id) {
            job.completed_at = Some(Utc::now());
            match outcome {
                Ok((processed, repaired)) => {
                    job.status = SyncJobStatus::Completed;
                    job.progress = 100.0;
                    job.processed = processed;
                    job.repaired = repaired;
                    info!(job_id = %id, processed, repaired, "Sync job completed");
                }
                Err(e) => {
                    job.status = SyncJobStatus::Failed;
                    job.error_message = Some(format!("{:#}", e));
                    warn!(job_id = %id, error = %e, "Sync job failed");
                }
            }
        }

        if succeeded {
            state.completed += 1;
        } else {
            state.failed += 1;
        }
        self.retire(&mut state, id);
    }

    /// Remember a finished job, pruning the oldest beyond the history limit
    fn retire(&self, state: &mut SyncState, id: Uuid) {
        state.finished.push_back(id);
        while state.finished.len() > self.config.job_history_limit {
            if let Some(old) = state.finished.pop_front() {
                state.jobs.remove(&old);
            }
        }
    }

    /// Returns (units processed, keys repaired)
    async fn execute(&self, job: &SyncJob, backend: &dyn SyncBackend) -> anyhow::Result<(usize, usize)> {
        let keys = job.keys_to_sync();
        let total = keys.len() + job.data_items.len();
        let mut done = 0;
        let mut repaired = 0;

        for key in keys {
            match job.sync_type {
                SyncType::Repair => {
                    if !backend.verify_key(key).await? {
                        backend.sync_key(key).await?;
                        repaired += 1;
                    }
                }
                SyncType::Full | SyncType::Incremental => backend.sync_key(key).await?,
            }
            done += 1;
            self.set_progress(job.id, done, total);
        }

        for item in &job.data_items {
            backend.sync_item(item).await?;
            done += 1;
            self.set_progress(job.id, done, total);
        }

        Ok((done, repaired))
    }

    fn set_progress(&self, id: Uuid, done: usize, total: usize) {
        if total == 0 {
            return;
        }
        if let Some(job) = self.state.lock().jobs.get_mut(&id) {
            job.progress = done as f64 * 100.0 / total as f64;
            job.processed = done;
        }
    }

    /// Withdraw a job that has not started yet. It is kept as failed.
    pub fn cancel(&self, id: Uuid) -> Result<(), SyncError> {
        self.queue
            .lock()
            .remove_first(|queued| queued.id == id)
            .ok_or(SyncError::NotFound(id))?;

        let mut state = self.state.lock();
        if let Some(job) = state.jobs.get_mut(&id) {
            job.status = SyncJobStatus::Failed;
            job.error_message = Some("cancelled".to_string());
            job.completed_at = Some(Utc::now());
        }
        state.failed += 1;
        self.retire(&mut state, id);
        info!(job_id = %id, "Cancelled sync job");
        Ok(())
    }

    pub fn get_job(&self, id: Uuid) -> Option<SyncJob> {
        self.state.lock().jobs.get(&id).cloned()
    }

    /// Newest first, optionally filtered by status
    pub fn list_jobs(&self, status: Option<SyncJobStatus>, limit: usize) -> Vec<SyncJob> {
        let state = self.state.lock();
        let mut jobs: Vec<SyncJob> = state
            .jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        jobs
    }

    pub fn stats(&self) -> SyncStats {
        let state = self.state.lock();
        let count = |status: SyncJobStatus| state.jobs.values().filter(|j| j.status == status).count();
        let finished = state.completed + state.failed;

        SyncStats {
            total_jobs: state.total_jobs,
            pending: count(SyncJobStatus::Pending),
            in_progress: count(SyncJobStatus::Running),
            completed: state.completed,
            failed: state.failed,
            success_rate: if finished == 0 {
                100.0
            } else {
                state.completed as f64 * 100.0 / finished as f64
            },
        }
    }

    /// Spawn the sync worker loop
    pub fn start(self: &Arc<Self>) -> Result<(), ShutdownError> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Sync job worker is already running");
            return Ok(());
        }

        let manager = self.clone();
        let interval = self.config.sync_interval;
        info!(interval_ms = interval.as_millis() as u64, "Starting sync job worker");

        self.shutdown.spawn("sync-worker", move |mut listener| async move {
            loop {
                manager.run_tick().await;
                if listener.sleep_or_shutdown(interval).await {
                    break;
                }
            }
            info!("Sync job worker stopped");
        })
    }

    pub async fn shutdown(&self) -> Result<ShutdownReport, ShutdownError> {
        self.shutdown.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingBackend {
        synced: Mutex<Vec<String>>,
        items: Mutex<Vec<Value>>,
        stale: HashSet<String>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl SyncBackend for RecordingBackend {
        async fn sync_key(&self, key: &str) -> anyhow::Result<()> {
            if self.fail_on.as_deref() == Some(key) {
                bail!("write to target failed for {}", key);
            }
            self.synced.lock().push(key.to_string());
            Ok(())
        }

        async fn sync_item(&self, item: &Value) -> anyhow::Result<()> {
            self.items.lock().push(item.clone());
            Ok(())
        }

        async fn verify_key(&self, key: &str) -> anyhow::Result<bool> {
            Ok(!self.stale.contains(key))
        }
    }

    fn manager() -> SyncJobManager {
        SyncJobManager::new(SyncConfig::default(), 100)
    }

    #[tokio::test]
    async fn test_full_sync() {
        let manager = manager();
        let backend = Arc::new(RecordingBackend::default());
        manager.register_backend("cache", backend.clone());

        let id = manager
            .schedule(
                SyncJob::new("cache", SyncType::Full)
                    .with_source_keys(["a", "b"])
                    .with_data_items(vec![json!({"k": 1})]),
            )
            .unwrap();
        assert_eq!(manager.get_job(id).unwrap().status, SyncJobStatus::Pending);

        assert_eq!(manager.run_tick().await, 1);
        let job = manager.get_job(id).unwrap();
        assert_eq!(job.status, SyncJobStatus::Completed);
        assert_eq!(job.progress, 100.0);
        assert_eq!(job.processed, 3);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
        assert_eq!(*backend.synced.lock(), vec!["a", "b"]);
        assert_eq!(backend.items.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_incremental_skips_present_keys() {
        let manager = manager();
        let backend = Arc::new(RecordingBackend::default());
        manager.register_backend("storage", backend.clone());

        manager
            .schedule(
                SyncJob::new("storage", SyncType::Incremental)
                    .with_source_keys(["a", "b", "c"])
                    .with_target_keys(["b"]),
            )
            .unwrap();
        manager.run_tick().await;
        assert_eq!(*backend.synced.lock(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_repair_resyncs_mismatches_only() {
        let manager = manager();
        let backend = Arc::new(RecordingBackend {
            stale: HashSet::from(["b".to_string()]),
            ..Default::default()
        });
        manager.register_backend("storage", backend.clone());

        let id = manager
            .schedule(SyncJob::new("storage", SyncType::Repair).with_source_keys(["a", "b", "c"]))
            .unwrap();
        manager.run_tick().await;

        let job = manager.get_job(id).unwrap();
        assert_eq!(job.repaired, 1);
        assert_eq!(job.processed, 3);
        assert_eq!(*backend.synced.lock(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_failure_records_error_and_completion_time() {
        let manager = manager();
        manager.register_backend(
            "storage",
            Arc::new(RecordingBackend {
                fail_on: Some("b".to_string()),
                ..Default::default()
            }),
        );

        let failing = manager
            .schedule(SyncJob::new("storage", SyncType::Full).with_source_keys(["a", "b", "c", "d"]))
            .unwrap();
        let orphan = manager
            .schedule(SyncJob::new("search", SyncType::Full).with_source_keys(["x"]))
            .unwrap();
        assert_eq!(manager.run_tick().await, 2);

        let job = manager.get_job(failing).unwrap();
        assert_eq!(job.status, SyncJobStatus::Failed);
        assert_eq!(job.progress, 25.0);
        assert!(job.completed_at.is_some());
        assert!(job.error_message.unwrap().contains("write to target failed for b"));

        let job = manager.get_job(orphan).unwrap();
        assert_eq!(
            job.error_message.as_deref(),
            Some("no sync backend registered for service search")
        );

        let stats = manager.stats();
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_batch_and_delay() {
        let config = SyncConfig {
            sync_batch_size: 2,
            ..Default::default()
        };
        let manager = SyncJobManager::new(config, 100);
        let backend = Arc::new(RecordingBackend::default());
        manager.register_backend("cache", backend.clone());

        manager
            .schedule(SyncJob::new("cache", SyncType::Full).with_source_keys(["low"]).with_priority(Priority::Low))
            .unwrap();
        manager
            .schedule(SyncJob::new("cache", SyncType::Full).with_source_keys(["normal"]))
            .unwrap();
        manager
            .schedule(SyncJob::new("cache", SyncType::Full).with_source_keys(["high"]).with_priority(Priority::High))
            .unwrap();
        let delayed = manager
            .schedule(
                SyncJob::new("cache", SyncType::Full)
                    .with_source_keys(["delayed"])
                    .with_priority(Priority::Critical)
                    .with_delay(Duration::from_secs(30)),
            )
            .unwrap();

        assert_eq!(manager.run_tick().await, 2);
        assert_eq!(*backend.synced.lock(), vec!["high", "normal"]);
        assert_eq!(manager.stats().pending, 2);

        assert_eq!(manager.run_tick().await, 1);
        assert_eq!(manager.get_job(delayed).unwrap().status, SyncJobStatus::Pending);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(manager.run_tick().await, 1);
        assert_eq!(manager.get_job(delayed).unwrap().status, SyncJobStatus::Completed);
    }

    #[tokio::test]
    async fn test_history_is_pruned() {
        let config = SyncConfig {
            job_history_limit: 2,
            ..Default::default()
        };
        let manager = SyncJobManager::new(config, 100);
        manager.register_backend("cache", Arc::new(RecordingBackend::default()));

        let first = manager.schedule(SyncJob::new("cache", SyncType::Full)).unwrap();
        manager.run_tick().await;
        for _ in 0..2 {
            manager.schedule(SyncJob::new("cache", SyncType::Full)).unwrap();
            manager.run_tick().await;
        }

        assert!(manager.get_job(first).is_none());
        assert_eq!(manager.list_jobs(Some(SyncJobStatus::Completed), 10).len(), 2);
        assert_eq!(manager.stats().completed, 3);
    }

    #[tokio::test]
    async fn test_queue_capacity_rejects() {
        let manager = SyncJobManager::new(SyncConfig::default(), 1);
        manager.schedule(SyncJob::new("cache", SyncType::Full)).unwrap();
        let err = manager.schedule(SyncJob::new("cache", SyncType::Full)).unwrap_err();
        assert_eq!(
            err,
            SyncError::Schedule(ScheduleError::QueueFull {
                priority: Priority::Normal,
                capacity: 1
            })
        );
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let manager = manager();
        let id = manager.schedule(SyncJob::new("cache", SyncType::Full)).unwrap();

        manager.cancel(id).unwrap();
        assert_eq!(manager.cancel(id), Err(SyncError::NotFound(id)));
        assert_eq!(manager.run_tick().await, 0);

        let job = manager.get_job(id).unwrap();
        assert_eq!(job.status, SyncJobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_loop_runs_jobs() {
        let manager = Arc::new(manager());
        let backend = Arc::new(RecordingBackend::default());
        manager.register_backend("cache", backend.clone());
        manager.start().unwrap();

        let id = manager
            .schedule(SyncJob::new("cache", SyncType::Full).with_source_keys(["k"]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(manager.get_job(id).unwrap().status, SyncJobStatus::Completed);

        let report = manager.shutdown().await.unwrap();
        assert!(report.is_clean());
        assert!(manager.schedule(SyncJob::new("cache", SyncType::Full)).is_err());
    }
}
