//! Bounded store for operations that exhausted their retries
//!
//! When full, adding evicts the oldest entry. This is the only place the
//! engine drops work on purpose, so every eviction is logged.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::operation::{OperationSnapshot, RecoveryOperation};

/// Listing view of a dead-lettered operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterItem {
    pub operation: OperationSnapshot,
    pub final_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Dead-letter queue statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub size: usize,
    pub capacity: usize,
    pub total_added: u64,
    pub total_evicted: u64,
    #[serde(with = "humantime_serde", default)]
    pub oldest_age: Option<Duration>,
}

struct DeadLetterEntry {
    operation: RecoveryOperation,
    final_error: String,
    dead_lettered_at: DateTime<Utc>,
    inserted: Instant,
}

impl DeadLetterEntry {
    fn item(&self) -> DeadLetterItem {
        DeadLetterItem {
            operation: self.operation.snapshot(),
            final_error: self.final_error.clone(),
            dead_lettered_at: self.dead_lettered_at,
        }
    }
}

#[derive(Default)]
struct DeadLetterState {
    entries: VecDeque<DeadLetterEntry>,
    total_added: u64,
    total_evicted: u64,
}

/// Ring buffer of dead-lettered operations keyed by operation id
pub struct DeadLetterQueue {
    capacity: usize,
    state: Mutex<DeadLetterState>,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(DeadLetterState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Park an operation. Returns the id of the entry evicted to make room.
    pub fn add(&self, operation: RecoveryOperation, final_error: impl Into<String>) -> Option<Uuid> {
        let mut state = self.state.lock();

        // An id is stored at most once
        state.entries.retain(|e| e.operation.id != operation.id);

        let mut evicted = None;
        if state.entries.len() >= self.capacity {
            if let Some(oldest) = state.entries.pop_front() {
                warn!(
                    operation_id = %oldest.operation.id,
                    operation_type = %oldest.operation.operation_type,
                    capacity = self.capacity,
                    "Dead-letter queue full, evicting oldest entry"
                );
                state.total_evicted += 1;
                evicted = Some(oldest.operation.id);
            }
        }

        state.entries.push_back(DeadLetterEntry {
            operation,
            final_error: final_error.into(),
            dead_lettered_at: Utc::now(),
            inserted: Instant::now(),
        });
        state.total_added += 1;
        evicted
    }

    /// Oldest first, at most `limit` items
    pub fn list(&self, limit: usize) -> Vec<DeadLetterItem> {
        self.state
            .lock()
            .entries
            .iter()
            .take(limit)
            .map(DeadLetterEntry::item)
            .collect()
    }

    pub fn get(&self, id: Uuid) -> Option<DeadLetterItem> {
        self.state
            .lock()
            .entries
            .iter()
            .find(|e| e.operation.id == id)
            .map(DeadLetterEntry::item)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.state.lock().entries.iter().any(|e| e.operation.id == id)
    }

    /// Drop an entry without resubmitting it
    pub fn remove(&self, id: Uuid) -> Option<DeadLetterItem> {
        self.take_entry(id).map(|entry| entry.item())
    }

    /// Remove an entry and hand back the live operation
    pub(crate) fn take(&self, id: Uuid) -> Option<RecoveryOperation> {
        self.take_entry(id).map(|entry| entry.operation)
    }

    fn take_entry(&self, id: Uuid) -> Option<DeadLetterEntry> {
        let mut state = self.state.lock();
        let index = state.entries.iter().position(|e| e.operation.id == id)?;
        state.entries.remove(index)
    }

    /// Remove everything, returning how many entries were dropped
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.entries.len();
        state.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> DeadLetterStats {
        let state = self.state.lock();
        DeadLetterStats {
            size: state.entries.len(),
            capacity: self.capacity,
            total_added: state.total_added,
            total_evicted: state.total_evicted,
            oldest_age: state
                .entries
                .front()
                .map(|e| Instant::now().saturating_duration_since(e.inserted)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::command;
    use serde_json::Value;

    fn op(kind: &str) -> RecoveryOperation {
        RecoveryOperation::new(kind, "storage", command(|| async { Ok(Value::Null) }))
    }

    #[test]
    fn test_add_list_remove() {
        let dlq = DeadLetterQueue::new(10);
        let first = op("session");
        let first_id = first.id();
        dlq.add(first, "connection refused");
        dlq.add(op("profile"), "not found");

        let items = dlq.list(10);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].operation.id, first_id);
        assert_eq!(items[0].final_error, "connection refused");
        assert_eq!(dlq.list(1).len(), 1);

        let removed = dlq.remove(first_id).unwrap();
        assert_eq!(removed.operation.operation_type, "session");
        assert!(!dlq.contains(first_id));
        assert!(dlq.remove(first_id).is_none());
    }

    #[test]
    fn test_eviction_at_capacity() {
        let dlq = DeadLetterQueue::new(2);
        let oldest = op("a");
        let oldest_id = oldest.id();
        assert!(dlq.add(oldest, "e").is_none());
        assert!(dlq.add(op("b"), "e").is_none());

        assert_eq!(dlq.add(op("c"), "e"), Some(oldest_id));
        let stats = dlq.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.total_added, 3);
        assert_eq!(stats.total_evicted, 1);
    }

    #[test]
    fn test_same_id_stored_once() {
        let dlq = DeadLetterQueue::new(5);
        let operation = op("a");
        dlq.add(operation.clone(), "first");
        dlq.add(operation, "second");

        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq.list(5)[0].final_error, "second");
    }

    #[test]
    fn test_take_returns_live_operation_and_clear() {
        let dlq = DeadLetterQueue::new(5);
        let operation = op("a");
        let id = operation.id();
        dlq.add(operation, "boom");
        dlq.add(op("b"), "boom");

        let live = dlq.take(id).unwrap();
        assert_eq!(live.operation_type(), "a");
        assert_eq!(dlq.clear(), 1);
        assert!(dlq.is_empty());
        assert!(dlq.stats().oldest_age.is_none());
    }

    #[test]
    fn test_listing_is_read_only() {
        let dlq = DeadLetterQueue::new(5);
        dlq.add(op("a"), "boom");
        let first = dlq.list(10);
        let second = dlq.list(10);
        assert_eq!(first, second);
        assert_eq!(dlq.stats().total_added, 1);
    }
}
