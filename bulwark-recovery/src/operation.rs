//! Recoverable operations
//!
//! A [`RecoveryOperation`] binds a [`RecoveryCommand`] to routing tags
//! (operation type and service), a priority and retry bookkeeping. The
//! engine never looks inside the command; the tags alone select metrics,
//! availability checks and consistency validators.

use async_trait::async_trait;
use bulwark_logging::ErrorSeverity;
use bulwark_resilience::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

/// How an operation is recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryType {
    ImmediateRetry,
    DelayedRetry,
    BackgroundSync,
    DataRepair,
    /// Parked straight away without executing
    DeadLetter,
    Manual,
}

impl RecoveryType {
    /// Whether the first execution waits for the base delay
    pub fn starts_delayed(&self) -> bool {
        matches!(
            self,
            RecoveryType::DelayedRetry | RecoveryType::BackgroundSync | RecoveryType::DataRepair
        )
    }
}

impl std::fmt::Display for RecoveryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecoveryType::ImmediateRetry => "immediate_retry",
            RecoveryType::DelayedRetry => "delayed_retry",
            RecoveryType::BackgroundSync => "background_sync",
            RecoveryType::DataRepair => "data_repair",
            RecoveryType::DeadLetter => "dead_letter",
            RecoveryType::Manual => "manual",
        };
        write!(f, "{}", s)
    }
}

/// Broad cause of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    Transient,
    Persistent,
    DataCorruption,
    Authentication,
    ResourceExhaustion,
    #[default]
    Unknown,
}

impl FailureCategory {
    /// Guess the category from error text
    pub fn infer(error: &str) -> Self {
        let text = error.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

        if has(&["timeout", "timed out", "connection", "temporarily", "unavailable", "reset"]) {
            FailureCategory::Transient
        } else if has(&["corrupt", "checksum", "integrity", "inconsistent"]) {
            FailureCategory::DataCorruption
        } else if has(&["auth", "unauthorized", "forbidden", "credential", "token"]) {
            FailureCategory::Authentication
        } else if has(&["quota", "rate limit", "exhausted", "out of memory", "too many"]) {
            FailureCategory::ResourceExhaustion
        } else if has(&["not found", "invalid", "constraint"]) {
            FailureCategory::Persistent
        } else {
            FailureCategory::Unknown
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            FailureCategory::Transient => ErrorSeverity::Low,
            FailureCategory::Persistent => ErrorSeverity::Medium,
            FailureCategory::Unknown => ErrorSeverity::Medium,
            FailureCategory::ResourceExhaustion => ErrorSeverity::High,
            FailureCategory::Authentication => ErrorSeverity::High,
            FailureCategory::DataCorruption => ErrorSeverity::Critical,
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureCategory::Transient => "TRANSIENT",
            FailureCategory::Persistent => "PERSISTENT",
            FailureCategory::DataCorruption => "DATA_CORRUPTION",
            FailureCategory::Authentication => "AUTHENTICATION",
            FailureCategory::ResourceExhaustion => "RESOURCE_EXHAUSTION",
            FailureCategory::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// Queue tier; lower variants are drained first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All tiers in processing order
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        write!(f, "{}", s)
    }
}

/// The executable part of an operation
#[async_trait]
pub trait RecoveryCommand: Send + Sync {
    async fn execute(&self) -> anyhow::Result<Value>;
}

/// Adapts an async closure into a [`RecoveryCommand`]
pub struct FnCommand<F> {
    f: F,
}

impl<F, Fut> FnCommand<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> RecoveryCommand for FnCommand<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn execute(&self) -> anyhow::Result<Value> {
        (self.f)().await
    }
}

/// Wrap an async closure as a shareable command
pub fn command<F, Fut>(f: F) -> Arc<dyn RecoveryCommand>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnCommand::new(f))
}

/// One failed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// 1-based attempt number
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub error: String,
    pub category: FailureCategory,
}

/// What callbacks are told about an operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationReport {
    pub id: Uuid,
    pub operation_type: String,
    pub service: String,
    pub recovery_type: RecoveryType,
    pub priority: Priority,
    pub retry_count: u32,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub failure_history: Vec<FailureRecord>,
}

pub type OperationCallback = Arc<dyn Fn(&OperationReport) + Send + Sync>;

/// A unit of work the recovery engine retries until it succeeds or is
/// dead-lettered
#[derive(Clone)]
pub struct RecoveryOperation {
    pub(crate) id: Uuid,
    pub(crate) recovery_type: RecoveryType,
    pub(crate) category: FailureCategory,
    pub(crate) priority: Priority,
    pub(crate) operation_type: String,
    pub(crate) service: String,
    pub(crate) command: Arc<dyn RecoveryCommand>,
    pub(crate) payload: Value,
    pub(crate) policy: Option<RetryPolicy>,
    pub(crate) retry_count: u32,
    pub(crate) next_retry_at: Instant,
    pub(crate) enqueued_at: Instant,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) failure_history: Vec<FailureRecord>,
    pub(crate) on_success: Option<OperationCallback>,
    pub(crate) on_failure: Option<OperationCallback>,
}

impl RecoveryOperation {
    pub fn new(
        operation_type: impl Into<String>,
        service: impl Into<String>,
        command: Arc<dyn RecoveryCommand>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            recovery_type: RecoveryType::DelayedRetry,
            category: FailureCategory::Unknown,
            priority: Priority::Normal,
            operation_type: operation_type.into(),
            service: service.into(),
            command,
            payload: Value::Null,
            policy: None,
            retry_count: 0,
            next_retry_at: now,
            enqueued_at: now,
            created_at: Utc::now(),
            failure_history: Vec::new(),
            on_success: None,
            on_failure: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_recovery_type(mut self, recovery_type: RecoveryType) -> Self {
        self.recovery_type = recovery_type;
        self
    }

    pub fn with_category(mut self, category: FailureCategory) -> Self {
        self.category = category;
        self
    }

    /// Categorise from the error that made recovery necessary
    pub fn with_initial_error(mut self, error: &str) -> Self {
        self.category = FailureCategory::infer(error);
        self
    }

    /// Arguments the command was bound with, kept for inspection
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn on_success(mut self, callback: impl Fn(&OperationReport) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_failure(mut self, callback: impl Fn(&OperationReport) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Arc::new(callback));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn recovery_type(&self) -> RecoveryType {
        self.recovery_type
    }

    pub fn operation_type(&self) -> &str {
        &self.operation_type
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn failure_history(&self) -> &[FailureRecord] {
        &self.failure_history
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy.clone().unwrap_or_default()
    }

    /// Append a failed attempt and bump the retry count
    pub(crate) fn record_failure(&mut self, error: &str, category: FailureCategory) {
        self.failure_history.push(FailureRecord {
            attempt: self.retry_count + 1,
            timestamp: Utc::now(),
            error: error.to_string(),
            category,
        });
        self.retry_count += 1;
        if self.category == FailureCategory::Unknown {
            self.category = category;
        }
    }

    pub(crate) fn report(&self, output: Option<Value>, error: Option<String>) -> OperationReport {
        OperationReport {
            id: self.id,
            operation_type: self.operation_type.clone(),
            service: self.service.clone(),
            recovery_type: self.recovery_type,
            priority: self.priority,
            retry_count: self.retry_count,
            output,
            error,
            failure_history: self.failure_history.clone(),
        }
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        let now = Instant::now();
        let policy = self.retry_policy();
        OperationSnapshot {
            id: self.id,
            recovery_type: self.recovery_type,
            category: self.category,
            priority: self.priority,
            operation_type: self.operation_type.clone(),
            service: self.service.clone(),
            payload: self.payload.clone(),
            retry_count: self.retry_count,
            max_retry_attempts: policy.max_retry_attempts,
            retry_policy: policy,
            next_retry_in: self.next_retry_at.saturating_duration_since(now),
            created_at: self.created_at,
            failure_history: self.failure_history.clone(),
        }
    }
}

impl std::fmt::Debug for RecoveryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryOperation")
            .field("id", &self.id)
            .field("recovery_type", &self.recovery_type)
            .field("priority", &self.priority)
            .field("operation_type", &self.operation_type)
            .field("service", &self.service)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

/// Serialisable view of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSnapshot {
    pub id: Uuid,
    pub recovery_type: RecoveryType,
    pub category: FailureCategory,
    pub priority: Priority,
    pub operation_type: String,
    pub service: String,
    pub payload: Value,
    pub retry_count: u32,
    pub max_retry_attempts: u32,
    pub retry_policy: RetryPolicy,
    #[serde(with = "humantime_serde")]
    pub next_retry_in: std::time::Duration,
    pub created_at: DateTime<Utc>,
    pub failure_history: Vec<FailureRecord>,
}
