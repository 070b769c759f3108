//! Error recovery for bulwark
//!
//! Failed operations are handed to the [`ErrorRecoverySystem`] as
//! [`RecoveryOperation`]s. They are retried with exponential backoff in
//! strict priority order and parked in the [`DeadLetterQueue`] once their
//! retry budget is spent. The [`SyncJobManager`] runs background
//! resynchronisation jobs, typically scheduled from recovery callbacks when
//! a service comes back.

pub mod consistency;
pub mod dead_letter;
pub mod error;
pub mod monitor;
pub mod operation;
pub mod queue;
pub mod stats;
pub mod sync_jobs;
pub mod system;

pub use consistency::{ConsistencyChecker, ConsistencyValidator, RequiredFieldsValidator};
pub use dead_letter::{DeadLetterItem, DeadLetterQueue, DeadLetterStats};
pub use error::{DeadLetterError, RecoveryError, ScheduleError, SyncError};
pub use monitor::{RecoveryCallback, RecoveryMonitor};
pub use operation::{
    command, FailureCategory, FailureRecord, FnCommand, OperationCallback, OperationReport,
    OperationSnapshot, Priority, RecoveryCommand, RecoveryOperation, RecoveryType,
};
pub use queue::{PriorityQueues, Queued};
pub use stats::{RecoveryStats, TypeStats};
pub use sync_jobs::{SyncBackend, SyncJob, SyncJobManager, SyncJobStatus, SyncStats, SyncType};
pub use system::{
    retry_policy_from_config, ErrorRecoverySystem, RecoveryShutdownReport, RecoveryStatus,
    WorkerTickReport,
};
