//! FIFO queues, one per priority tier

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::operation::{Priority, RecoveryOperation};

/// Something that can wait in a [`PriorityQueues`]
pub trait Queued {
    fn priority(&self) -> Priority;
    /// Earliest time the item may be processed
    fn due_at(&self) -> Instant;
    /// When the item entered its queue
    fn enqueued_at(&self) -> Instant;
}

impl Queued for RecoveryOperation {
    fn priority(&self) -> Priority {
        self.priority
    }

    fn due_at(&self) -> Instant {
        self.next_retry_at
    }

    fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }
}

/// Strict FIFO within a tier; tiers drained critical to low
#[derive(Debug)]
pub struct PriorityQueues<T> {
    capacity: usize,
    queues: BTreeMap<Priority, VecDeque<T>>,
}

impl<T: Queued> PriorityQueues<T> {
    /// `capacity` applies to each tier separately
    pub fn new(capacity: usize) -> Self {
        let queues = Priority::ALL
            .iter()
            .map(|p| (*p, VecDeque::new()))
            .collect();
        Self { capacity, queues }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn queue_mut(&mut self, priority: Priority) -> &mut VecDeque<T> {
        self.queues.entry(priority).or_default()
    }

    pub fn has_capacity(&self, priority: Priority) -> bool {
        self.queues.get(&priority).map_or(0, VecDeque::len) < self.capacity
    }

    /// Append to the tail of the item's tier. A full tier hands the item back.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if !self.has_capacity(item.priority()) {
            return Err(item);
        }
        self.push_unbounded(item);
        Ok(())
    }

    /// Append ignoring capacity; used for items already admitted once
    pub fn push_unbounded(&mut self, item: T) {
        let priority = item.priority();
        self.queue_mut(priority).push_back(item);
    }

    /// Put items back at the head of their tiers, keeping their relative order
    pub fn requeue_front(&mut self, items: Vec<T>) {
        for item in items.into_iter().rev() {
            let priority = item.priority();
            self.queue_mut(priority).push_front(item);
        }
    }

    /// Remove up to `limit` items whose due time has passed, scanning tiers
    /// in priority order. Items that are not due keep their position.
    pub fn take_due(&mut self, now: Instant, limit: usize) -> Vec<T> {
        let mut taken = Vec::new();

        for priority in Priority::ALL {
            if taken.len() >= limit {
                break;
            }
            let queue = self.queue_mut(priority);
            let mut kept = VecDeque::with_capacity(queue.len());
            while let Some(item) = queue.pop_front() {
                if taken.len() < limit && item.due_at() <= now {
                    taken.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            *queue = kept;
        }

        taken
    }

    /// Remove up to `limit` items from one tier regardless of due time
    pub fn drain(&mut self, priority: Priority, limit: usize) -> Vec<T> {
        let queue = self.queue_mut(priority);
        let count = limit.min(queue.len());
        queue.drain(..count).collect()
    }

    /// Remove the first item matching `predicate`, in processing order
    pub fn remove_first(&mut self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        for priority in Priority::ALL {
            let queue = self.queue_mut(priority);
            if let Some(index) = queue.iter().position(&predicate) {
                return queue.remove(index);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Item count per tier
    pub fn depths(&self) -> BTreeMap<Priority, usize> {
        Priority::ALL
            .iter()
            .map(|p| (*p, self.queues.get(p).map_or(0, VecDeque::len)))
            .collect()
    }

    /// Age of the longest-waiting item per tier
    pub fn oldest_ages(&self, now: Instant) -> BTreeMap<Priority, Option<Duration>> {
        Priority::ALL
            .iter()
            .map(|p| {
                let age = self
                    .queues
                    .get(p)
                    .and_then(|q| q.iter().map(Queued::enqueued_at).min())
                    .map(|oldest| now.saturating_duration_since(oldest));
                (*p, age)
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        Priority::ALL
            .iter()
            .filter_map(|p| self.queues.get(p))
            .flat_map(|q| q.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        name: &'static str,
        priority: Priority,
        due_at: Instant,
        enqueued_at: Instant,
    }

    impl Queued for Item {
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

    fn item(name: &'static str, priority: Priority, due_in: u64) -> Item {
        let now = Instant::now();
        Item {
            name,
            priority,
            due_at: now + Duration::from_secs(due_in),
            enqueued_at: now,
        }
    }

    fn names(items: &[Item]) -> Vec<&'static str> {
        items.iter().map(|i| i.name).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_then_fifo() {
        let mut queues = PriorityQueues::new(10);
        for name in ["n1", "n2", "n3", "n4", "n5"] {
            queues.push(item(name, Priority::Normal, 0)).unwrap();
        }
        queues.push(item("low", Priority::Low, 0)).unwrap();
        queues.push(item("crit", Priority::Critical, 0)).unwrap();

        let taken = queues.take_due(Instant::now(), 3);
        assert_eq!(names(&taken), vec!["crit", "n1", "n2"]);
        assert_eq!(queues.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_due_items_keep_position() {
        let mut queues = PriorityQueues::new(10);
        queues.push(item("later", Priority::High, 30)).unwrap();
        queues.push(item("now-a", Priority::High, 0)).unwrap();
        queues.push(item("now-b", Priority::High, 0)).unwrap();

        let taken = queues.take_due(Instant::now(), 10);
        assert_eq!(names(&taken), vec!["now-a", "now-b"]);

        queues.push(item("next", Priority::High, 0)).unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        let taken = queues.take_due(Instant::now(), 10);
        assert_eq!(names(&taken), vec!["later", "next"]);
    }

    #[test]
    fn test_capacity_per_tier() {
        let mut queues = PriorityQueues::new(1);
        queues.push(item("a", Priority::Low, 0)).unwrap();
        let rejected = queues.push(item("b", Priority::Low, 0)).unwrap_err();
        assert_eq!(rejected.name, "b");
        queues.push(item("c", Priority::High, 0)).unwrap();

        queues.push_unbounded(item("d", Priority::Low, 0));
        assert_eq!(queues.depths()[&Priority::Low], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_and_oldest_age() {
        let mut queues = PriorityQueues::new(10);
        queues.push(item("c1", Priority::Critical, 60)).unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        queues.push(item("c2", Priority::Critical, 60)).unwrap();

        let ages = queues.oldest_ages(Instant::now());
        assert_eq!(ages[&Priority::Critical], Some(Duration::from_secs(5)));
        assert_eq!(ages[&Priority::Low], None);

        let drained = queues.drain(Priority::Critical, 1);
        assert_eq!(names(&drained), vec!["c1"]);
        assert_eq!(queues.iter().count(), 1);

        assert_eq!(queues.remove_first(|i| i.name == "c2").map(|i| i.name), Some("c2"));
        assert!(queues.remove_first(|i| i.name == "c2").is_none());
        assert!(queues.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_front_keeps_order() {
        let mut queues = PriorityQueues::new(10);
        for name in ["n1", "n2", "n3"] {
            queues.push(item(name, Priority::Normal, 0)).unwrap();
        }
        queues.push(item("c1", Priority::Critical, 0)).unwrap();

        let taken = queues.take_due(Instant::now(), 3);
        assert_eq!(names(&taken), vec!["c1", "n1", "n2"]);

        queues.requeue_front(taken);
        let order: Vec<&str> = queues.iter().map(|i| i.name).collect();
        assert_eq!(order, vec!["c1", "n1", "n2", "n3"]);
    }
}
