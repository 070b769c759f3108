//! The error recovery engine
//!
//! Operations wait in per-priority FIFO queues. A worker loop pulls due
//! operations critical-first, checks that the target service is available,
//! runs the command under a timeout and routes failures either back to the
//! tail of their queue with exponential backoff or to the dead-letter queue.
//! A second loop samples service availability and fires recovery callbacks.

use bulwark_config::{RecoveryConfig, RetryDefaults, SyncConfig};
use bulwark_interfaces::{ServiceAvailability, ServiceHealthSnapshot};
use bulwark_resilience::{RetryPolicy, ShutdownCoordinator, ShutdownReport};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::consistency::{ConsistencyChecker, ConsistencyValidator};
use crate::dead_letter::{DeadLetterItem, DeadLetterQueue, DeadLetterStats};
use crate::error::{DeadLetterError, RecoveryError, ScheduleError};
use crate::monitor::{RecoveryCallback, RecoveryMonitor};
use crate::operation::{FailureCategory, OperationSnapshot, Priority, RecoveryOperation, RecoveryType};
use crate::queue::PriorityQueues;
use crate::stats::{RecoveryStats, TypeStats};
use crate::sync_jobs::{SyncJobManager, SyncStats};

/// Build the retry policy applied to operations scheduled without one
pub fn retry_policy_from_config(defaults: &RetryDefaults) -> RetryPolicy {
    RetryPolicy::new(defaults.max_retry_attempts, defaults.base_delay)
        .with_max_delay(defaults.max_delay)
        .with_multiplier(defaults.backoff_multiplier)
        .with_jitter(defaults.jitter_enabled)
}

/// What one worker tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerTickReport {
    pub processed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

/// Read-only view of the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryStatus {
    pub enabled: bool,
    pub queue_depths: BTreeMap<Priority, usize>,
    /// Milliseconds the oldest item of each tier has been waiting
    pub oldest_item_age_ms: BTreeMap<Priority, Option<u64>>,
    pub type_stats: BTreeMap<RecoveryType, TypeStats>,
    pub sync_stats: SyncStats,
    pub dead_letter: DeadLetterStats,
    pub service_health: Vec<ServiceHealthSnapshot>,
}

/// Result of [`ErrorRecoverySystem::shutdown`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryShutdownReport {
    /// Recovery worker and monitor loops
    pub loops: ShutdownReport,
    /// Sync worker loop
    pub sync_loops: ShutdownReport,
    /// Critical operations executed during the drain
    pub drained: usize,
    /// Drained operations that failed and were dead-lettered
    pub drain_failures: usize,
    /// Operations still queued after the drain
    pub remaining: usize,
}

enum Outcome {
    Succeeded,
    Retrying,
    DeadLettered,
}

struct Failure {
    error: String,
    category: FailureCategory,
}

impl Failure {
    fn new(error: impl Into<String>, category: FailureCategory) -> Self {
        Self {
            error: error.into(),
            category,
        }
    }
}

/// Priority-queued recovery of failed operations
pub struct ErrorRecoverySystem {
    config: RecoveryConfig,
    default_policy: RetryPolicy,
    enabled: AtomicBool,
    started: AtomicBool,
    queues: Mutex<PriorityQueues<RecoveryOperation>>,
    /// Operations taken off a queue whose execution has not finished
    in_flight: Mutex<HashMap<Uuid, RecoveryOperation>>,
    dead_letter: DeadLetterQueue,
    stats: Mutex<RecoveryStats>,
    consistency: ConsistencyChecker,
    availability: Arc<dyn ServiceAvailability>,
    monitor: RecoveryMonitor,
    sync_jobs: Arc<SyncJobManager>,
    shutdown: ShutdownCoordinator,
}

impl ErrorRecoverySystem {
    pub fn new(
        config: RecoveryConfig,
        sync_config: SyncConfig,
        availability: Arc<dyn ServiceAvailability>,
    ) -> Self {
        Self {
            default_policy: retry_policy_from_config(&config.retry),
            enabled: AtomicBool::new(config.enabled),
            started: AtomicBool::new(false),
            queues: Mutex::new(PriorityQueues::new(config.queue_capacity)),
            in_flight: Mutex::new(HashMap::new()),
            dead_letter: DeadLetterQueue::new(config.dead_letter_capacity),
            stats: Mutex::new(RecoveryStats::default()),
            consistency: ConsistencyChecker::with_defaults(config.consistency_check_sample_rate),
            monitor: RecoveryMonitor::new(availability.clone()),
            sync_jobs: Arc::new(SyncJobManager::new(sync_config, config.queue_capacity)),
            shutdown: ShutdownCoordinator::with_grace_period(config.shutdown_grace_period),
            availability,
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn dead_letter(&self) -> &DeadLetterQueue {
        &self.dead_letter
    }

    pub fn sync_jobs(&self) -> &Arc<SyncJobManager> {
        &self.sync_jobs
    }

    /// Enqueue an operation and return its id
    ///
    /// Never executes the command; failures surface later through callbacks
    /// and the dead-letter queue.
    pub fn schedule(&self, mut operation: RecoveryOperation) -> Result<Uuid, ScheduleError> {
        if !self.is_enabled() {
            warn!(
                operation_type = %operation.operation_type,
                service = %operation.service,
                "Recovery disabled, rejecting operation"
            );
            return Err(ScheduleError::Disabled);
        }

        let policy = operation
            .policy
            .get_or_insert_with(|| self.default_policy.clone())
            .clone();

        let now = Instant::now();
        let id = operation.id;
        operation.enqueued_at = now;
        operation.next_retry_at = if operation.recovery_type.starts_delayed() {
            now + policy.base_delay
        } else {
            now
        };

        if operation.recovery_type == RecoveryType::DeadLetter {
            info!(operation_id = %id, operation_type = %operation.operation_type, "Parking operation in dead-letter queue");
            self.stats.lock().record_dead_letter(RecoveryType::DeadLetter);
            self.dead_letter.add(operation, "scheduled for dead-letter handling");
            return Ok(id);
        }

        let priority = operation.priority;
        let recovery_type = operation.recovery_type;
        let mut queues = self.queues.lock();
        if let Err(rejected) = queues.push(operation) {
            warn!(
                operation_id = %id,
                operation_type = %rejected.operation_type,
                priority = %priority,
                capacity = queues.capacity(),
                "Recovery queue at capacity, rejecting operation"
            );
            return Err(ScheduleError::QueueFull {
                priority,
                capacity: queues.capacity(),
            });
        }

        debug!(
            operation_id = %id,
            priority = %priority,
            recovery_type = %recovery_type,
            max_attempts = policy.max_retry_attempts,
            "Scheduled recovery operation"
        );
        Ok(id)
    }

    /// Process up to `worker_batch_size` due operations, critical first
    pub async fn run_worker_tick(&self) -> WorkerTickReport {
        let mut report = WorkerTickReport::default();
        if !self.is_enabled() {
            return report;
        }

        let mut due = self
            .queues
            .lock()
            .take_due(Instant::now(), self.config.worker_batch_size)
            .into_iter();
        while let Some(operation) = due.next() {
            if !self.is_enabled() {
                let mut unstarted = vec![operation];
                unstarted.extend(due.by_ref());
                debug!(count = unstarted.len(), "Recovery disabled mid-tick, returning operations to their queues");
                self.queues.lock().requeue_front(unstarted);
                break;
            }

            report.processed += 1;
            let id = operation.id;
            self.in_flight.lock().insert(id, operation.clone());
            let outcome = self.process(operation, true).await;
            self.in_flight.lock().remove(&id);

            match outcome {
                Outcome::Succeeded => report.succeeded += 1,
                Outcome::Retrying => report.retried += 1,
                Outcome::DeadLettered => report.dead_lettered += 1,
            }
        }

        if report.processed > 0 {
            debug!(
                processed = report.processed,
                succeeded = report.succeeded,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                "Recovery worker tick finished"
            );
        }
        report
    }

    async fn process(&self, operation: RecoveryOperation, allow_retry: bool) -> Outcome {
        self.stats.lock().record_attempt(operation.recovery_type);

        if !self.availability.is_available(&operation.service) {
            let failure = Failure::new(
                format!("service {} is unavailable", operation.service),
                FailureCategory::Transient,
            );
            return self.handle_failure(operation, failure, None, allow_retry);
        }

        let started = Instant::now();
        let result = tokio::time::timeout(self.config.execution_timeout, operation.command.execute()).await;
        let elapsed = started.elapsed();

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let error = format!("{:#}", e);
                let category = FailureCategory::infer(&error);
                return self.handle_failure(operation, Failure::new(error, category), Some(elapsed), allow_retry);
            }
            Err(_) => {
                let failure = Failure::new("timeout", FailureCategory::Transient);
                return self.handle_failure(operation, failure, Some(elapsed), allow_retry);
            }
        };

        if let Some(Err(reason)) = self.consistency.check(&operation.operation_type, &output) {
            warn!(
                operation_id = %operation.id,
                operation_type = %operation.operation_type,
                reason = %reason,
                "Consistency check failed"
            );
            self.stats.lock().record_consistency_failure(operation.recovery_type);
            let failure = Failure::new(
                format!("consistency check failed: {}", reason),
                FailureCategory::DataCorruption,
            );
            return self.handle_failure(operation, failure, Some(elapsed), allow_retry);
        }

        self.succeed(operation, output, elapsed)
    }

    fn succeed(&self, operation: RecoveryOperation, output: Value, elapsed: Duration) -> Outcome {
        self.stats.lock().record_success(operation.recovery_type, elapsed);
        info!(
            operation_id = %operation.id,
            operation_type = %operation.operation_type,
            service = %operation.service,
            attempts = operation.retry_count + 1,
            "Recovery operation succeeded"
        );

        if let Some(callback) = &operation.on_success {
            callback(&operation.report(Some(output), None));
        }
        Outcome::Succeeded
    }

    fn handle_failure(
        &self,
        mut operation: RecoveryOperation,
        failure: Failure,
        elapsed: Option<Duration>,
        allow_retry: bool,
    ) -> Outcome {
        operation.record_failure(&failure.error, failure.category);
        self.stats.lock().record_failure(operation.recovery_type, elapsed);

        let policy = operation.retry_policy();
        if allow_retry && policy.should_retry(operation.retry_count) {
            let delay = policy.delay_for_attempt(operation.retry_count);
            operation.next_retry_at = Instant::now() + delay;

            warn!(
                operation_id = %operation.id,
                operation_type = %operation.operation_type,
                attempt = operation.retry_count,
                max_attempts = policy.max_retry_attempts,
                category = %failure.category,
                retry_in_ms = delay.as_millis() as u64,
                error = %failure.error,
                "Recovery operation failed, will retry"
            );

            // Already admitted once, so capacity does not apply
            self.queues.lock().push_unbounded(operation);
            return Outcome::Retrying;
        }

        self.move_to_dead_letter(operation, failure);
        Outcome::DeadLettered
    }

    fn move_to_dead_letter(&self, operation: RecoveryOperation, failure: Failure) {
        error!(
            operation_id = %operation.id,
            operation_type = %operation.operation_type,
            service = %operation.service,
            attempts = operation.retry_count,
            category = %failure.category,
            severity = ?failure.category.severity(),
            error = %failure.error,
            "Recovery operation exhausted its retries, moving to dead-letter queue"
        );

        self.stats.lock().record_dead_letter(operation.recovery_type);
        if let Some(callback) = &operation.on_failure {
            callback(&operation.report(None, Some(failure.error.clone())));
        }
        self.dead_letter.add(operation, failure.error);
    }

    /// Move a dead-lettered operation back onto its queue with a fresh retry
    /// budget. The id and failure history are kept.
    pub fn resubmit_dead_letter(&self, id: Uuid) -> Result<(), DeadLetterError> {
        if !self.is_enabled() {
            return Err(ScheduleError::Disabled.into());
        }

        let mut queues = self.queues.lock();
        let priority = self
            .dead_letter
            .get(id)
            .map(|item| item.operation.priority)
            .ok_or(DeadLetterError::NotFound(id))?;

        if !queues.has_capacity(priority) {
            warn!(operation_id = %id, priority = %priority, "Queue full, dead-letter resubmission rejected");
            return Err(ScheduleError::QueueFull {
                priority,
                capacity: queues.capacity(),
            }
            .into());
        }

        let mut operation = self.dead_letter.take(id).ok_or(DeadLetterError::NotFound(id))?;
        let now = Instant::now();
        operation.retry_count = 0;
        operation.next_retry_at = now;
        operation.enqueued_at = now;
        if operation.recovery_type == RecoveryType::DeadLetter {
            operation.recovery_type = RecoveryType::Manual;
        }

        info!(
            operation_id = %id,
            operation_type = %operation.operation_type,
            previous_failures = operation.failure_history.len(),
            "Resubmitted dead-letter operation"
        );
        queues.push_unbounded(operation);
        Ok(())
    }

    /// Oldest first
    pub fn get_dead_letter_items(&self, limit: usize) -> Vec<DeadLetterItem> {
        self.dead_letter.list(limit)
    }

    /// Snapshots of queued operations in processing order
    pub fn queued_operations(&self) -> Vec<OperationSnapshot> {
        self.queues.lock().iter().map(RecoveryOperation::snapshot).collect()
    }

    pub fn get_recovery_status(&self) -> RecoveryStatus {
        let (queue_depths, oldest_item_age_ms) = {
            let queues = self.queues.lock();
            let ages = queues
                .oldest_ages(Instant::now())
                .into_iter()
                .map(|(priority, age)| (priority, age.map(|a| a.as_millis() as u64)))
                .collect();
            (queues.depths(), ages)
        };

        RecoveryStatus {
            enabled: self.is_enabled(),
            queue_depths,
            oldest_item_age_ms,
            type_stats: self.stats.lock().snapshot(),
            sync_stats: self.sync_jobs.stats(),
            dead_letter: self.dead_letter.stats(),
            service_health: self.availability.health_snapshot(),
        }
    }

    /// Run `callback` whenever `service` goes from unavailable to available
    pub fn register_recovery_callback(
        &self,
        service: impl Into<String>,
        callback: impl Fn(&str) + Send + Sync + 'static,
    ) {
        let callback: RecoveryCallback = Arc::new(callback);
        self.monitor.register(service, callback);
    }

    /// One monitor sample. Returns the services that just recovered.
    pub fn check_service_recoveries(&self) -> Vec<String> {
        self.monitor.sample()
    }

    pub fn register_validator(
        &self,
        operation_type: impl Into<String>,
        validator: Arc<dyn ConsistencyValidator>,
    ) {
        self.consistency.register(operation_type, validator);
    }

    /// Spawn the recovery worker, the recovery monitor and the sync worker
    pub fn start(self: &Arc<Self>) -> Result<(), RecoveryError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RecoveryError::AlreadyStarted);
        }
        if !self.is_enabled() {
            info!("Recovery disabled, background loops not started");
            return Ok(());
        }

        let worker = self.clone();
        let interval = self.config.worker_interval;
        self.shutdown.spawn("recovery-worker", move |mut listener| async move {
            loop {
                worker.run_worker_tick().await;
                if listener.sleep_or_shutdown(interval).await {
                    break;
                }
            }
            info!("Recovery worker stopped");
        })?;

        let monitor = self.clone();
        let interval = self.config.monitor_interval;
        self.shutdown.spawn("recovery-monitor", move |mut listener| async move {
            loop {
                monitor.check_service_recoveries();
                if listener.sleep_or_shutdown(interval).await {
                    break;
                }
            }
            info!("Recovery monitor stopped");
        })?;

        self.sync_jobs.start()?;

        info!(
            worker_interval_ms = self.config.worker_interval.as_millis() as u64,
            batch_size = self.config.worker_batch_size,
            "Error recovery system started"
        );
        Ok(())
    }

    /// Put operations whose execution was cut off by an aborted worker back
    /// at the head of their queues
    fn restore_interrupted(&self) {
        let mut interrupted: Vec<RecoveryOperation> =
            self.in_flight.lock().drain().map(|(_, operation)| operation).collect();
        if interrupted.is_empty() {
            return;
        }
        interrupted.sort_by_key(|operation| operation.enqueued_at);

        for operation in &interrupted {
            warn!(
                operation_id = %operation.id,
                operation_type = %operation.operation_type,
                priority = %operation.priority,
                "Recovery operation interrupted by shutdown, returning it to its queue"
            );
        }
        self.queues.lock().requeue_front(interrupted);
    }

    /// Stop accepting work, stop the loops, then run a bounded number of
    /// critical operations one last time
    pub async fn shutdown(&self) -> Result<RecoveryShutdownReport, RecoveryError> {
        self.enabled.store(false, Ordering::SeqCst);
        info!("Shutting down error recovery system");

        let loops = self.shutdown.shutdown().await?;
        let sync_loops = self.sync_jobs.shutdown().await?;
        self.restore_interrupted();

        let critical = self
            .queues
            .lock()
            .drain(Priority::Critical, self.config.shutdown_drain_limit);

        let mut report = RecoveryShutdownReport {
            loops,
            sync_loops,
            ..Default::default()
        };
        for operation in critical {
            report.drained += 1;
            if let Outcome::DeadLettered = self.process(operation, false).await {
                report.drain_failures += 1;
            }
        }
        report.remaining = self.queues.lock().len();

        info!(
            drained = report.drained,
            drain_failures = report.drain_failures,
            remaining = report.remaining,
            "Error recovery system stopped"
        );
        Ok(report)
    }
}
