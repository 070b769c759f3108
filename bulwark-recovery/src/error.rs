//! Error types for the recovery engine
//!
//! Failures of the operations themselves are never reported through these
//! types; they end up in failure history, callbacks and the dead-letter queue.

use bulwark_resilience::ShutdownError;
use thiserror::Error;
use uuid::Uuid;

use crate::operation::Priority;

/// Why an operation or job was not enqueued
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("recovery is disabled")]
    Disabled,

    #[error("{priority} queue is at capacity ({capacity})")]
    QueueFull { priority: Priority, capacity: usize },
}

/// Dead-letter management errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeadLetterError {
    #[error("operation {0} is not in the dead-letter queue")]
    NotFound(Uuid),

    #[error("resubmission rejected: {0}")]
    Resubmit(#[from] ScheduleError),
}

/// Sync job errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("sync job {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Lifecycle errors of the recovery system
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("recovery system already started")]
    AlreadyStarted,

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}
