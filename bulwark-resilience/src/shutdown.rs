//! Graceful shutdown coordination
//!
//! Background loops are spawned through a [`ShutdownCoordinator`], which
//! hands each one a [`ShutdownListener`]. Shutdown clears the shared
//! enabled flag, broadcasts a signal, awaits the loops within a grace
//! window and aborts whatever is still running afterwards.

use log::{info, warn};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Shutdown signal types with escalating urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Finish the current iteration, then stop
    Graceful,
    /// Grace window elapsed; remaining tasks are being aborted
    Forced,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Forced => write!(f, "forced"),
        }
    }
}

/// Shutdown error types
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    /// Shutdown already in progress
    #[error("Shutdown already in progress")]
    AlreadyShuttingDown,

    /// New tasks cannot be spawned once shutdown has begun
    #[error("Cannot spawn task '{0}' after shutdown has begun")]
    NotAccepting(String),
}

/// Outcome of a shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that stopped within the grace window
    pub completed: Vec<String>,
    /// Tasks that panicked before or during shutdown
    pub panicked: Vec<String>,
    /// Tasks aborted after the grace window
    pub aborted: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.panicked.is_empty() && self.aborted.is_empty()
    }
}

struct ManagedTask {
    name: String,
    handle: JoinHandle<()>,
}

/// Coordinates the lifetime of named background loops
pub struct ShutdownCoordinator {
    sender: broadcast::Sender<ShutdownSignal>,
    enabled: Arc<AtomicBool>,
    tasks: Mutex<Vec<ManagedTask>>,
    grace_period: Duration,
}

impl ShutdownCoordinator {
    /// Create a new coordinator with a 10s grace window
    pub fn new() -> Self {
        Self::with_grace_period(Duration::from_secs(10))
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        let (sender, _) = broadcast::channel(16);

        Self {
            sender,
            enabled: Arc::new(AtomicBool::new(true)),
            tasks: Mutex::new(Vec::new()),
            grace_period,
        }
    }

    /// Whether shutdown has not yet begun
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        !self.is_enabled()
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Listener for code that is not spawned through the coordinator
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.sender.subscribe(),
            enabled: self.enabled.clone(),
        }
    }

    /// Spawn a named task that receives a listener for cooperative shutdown
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, task: F) -> Result<(), ShutdownError>
    where
        F: FnOnce(ShutdownListener) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if self.is_shutting_down() {
            return Err(ShutdownError::NotAccepting(name));
        }

        let handle = tokio::spawn(task(self.listener()));
        log::debug!("Spawned background task {}", name);
        self.tasks.lock().push(ManagedTask { name, handle });
        Ok(())
    }

    /// Number of spawned tasks that have not finished yet
    pub fn active_task_count(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|task| !task.handle.is_finished())
            .count()
    }

    /// Clear the enabled flag, signal every task and wait for them.
    ///
    /// Tasks still running once the grace window has elapsed are aborted.
    pub async fn shutdown(&self) -> Result<ShutdownReport, ShutdownError> {
        if self
            .enabled
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ShutdownError::AlreadyShuttingDown);
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        info!(
            "Starting graceful shutdown of {} background task(s)",
            tasks.len()
        );

        // No receivers simply means no task is listening any more
        let _ = self.sender.send(ShutdownSignal::Graceful);

        let deadline = Instant::now() + self.grace_period;
        let mut report = ShutdownReport::default();

        for ManagedTask { name, mut handle } in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => report.completed.push(name),
                Ok(Err(e)) if e.is_panic() => {
                    warn!("Background task {} panicked: {}", name, e);
                    report.panicked.push(name);
                }
                Ok(Err(_)) => report.aborted.push(name),
                Err(_) => {
                    warn!(
                        "Background task {} did not stop within {:?}, aborting",
                        name, self.grace_period
                    );
                    handle.abort();
                    // The task's future is dropped once the handle resolves
                    match handle.await {
                        Ok(()) => report.completed.push(name),
                        Err(e) if e.is_panic() => report.panicked.push(name),
                        Err(_) => report.aborted.push(name),
                    }
                }
            }
        }

        if !report.aborted.is_empty() {
            let _ = self.sender.send(ShutdownSignal::Forced);
        }

        info!(
            "Shutdown finished: {} completed, {} aborted",
            report.completed.len(),
            report.aborted.len()
        );
        Ok(report)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle given to background loops to observe shutdown
pub struct ShutdownListener {
    receiver: broadcast::Receiver<ShutdownSignal>,
    enabled: Arc<AtomicBool>,
}

impl ShutdownListener {
    pub fn is_shutting_down(&self) -> bool {
        !self.enabled.load(Ordering::SeqCst)
    }

    /// Wait until a shutdown signal arrives
    pub async fn recv(&mut self) -> ShutdownSignal {
        if self.is_shutting_down() {
            return ShutdownSignal::Graceful;
        }
        match self.receiver.recv().await {
            Ok(signal) => signal,
            Err(broadcast::error::RecvError::Lagged(_)) => ShutdownSignal::Graceful,
            Err(broadcast::error::RecvError::Closed) => ShutdownSignal::Forced,
        }
    }

    /// Sleep for `duration` unless shutdown begins first.
    ///
    /// Returns `true` when the caller should stop.
    pub async fn sleep_or_shutdown(&mut self, duration: Duration) -> bool {
        if self.is_shutting_down() {
            return true;
        }
        let signalled = tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.recv() => true,
        };
        signalled || self.is_shutting_down()
    }
}
