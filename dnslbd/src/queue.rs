//! Cross-worker task queue with a counted wake.
//!
//! The reply queues are written by peers (a sibling worker's obtain stage,
//! or a predecessor context during reload) and read by the owning worker.
//! Push makes the task visible first, then produces one wake permit; pop
//! consumes one permit, then takes one task. One task per wake keeps the
//! owning event loop fair across its sources.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Semaphore;

use crate::task::Task;

pub struct SharedQueue {
    items: Mutex<VecDeque<Task>>,
    wake: Semaphore,
}

impl SharedQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            wake: Semaphore::new(0),
        }
    }

    pub fn push(&self, task: Task) {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(task);
        self.wake.add_permits(1);
    }

    /// Wait for one wake, then take one task. The permit is consumed and
    /// the task taken without an intervening await, so cancelling the
    /// future never strands a wake.
    pub async fn pop(&self) -> Option<Task> {
        let Ok(permit) = self.wake.acquire().await else {
            return None;
        };
        permit.forget();
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SharedQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn pops_in_push_order() {
        let counter = Arc::new(AtomicI64::new(0));
        let queue = SharedQueue::new();
        for fp in [1u64, 2, 3] {
            queue.push(Task::synthetic(fp, 0, Arc::clone(&counter)));
        }
        assert_eq!(queue.len(), 3);
        for expected in [1u64, 2, 3] {
            let task = queue.pop().await.unwrap();
            assert_eq!(task.fingerprint, expected);
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn pop_waits_for_a_push() {
        let queue = Arc::new(SharedQueue::new());
        let waiter = Arc::clone(&queue);
        let pending = tokio::time::timeout(Duration::from_millis(20), waiter.pop()).await;
        assert!(pending.is_err(), "pop should block on an empty queue");

        let counter = Arc::new(AtomicI64::new(0));
        queue.push(Task::synthetic(5, 0, counter));
        let task = tokio::time::timeout(Duration::from_millis(100), queue.pop())
            .await
            .expect("woken by push")
            .unwrap();
        assert_eq!(task.fingerprint, 5);
    }

    #[tokio::test]
    async fn one_wake_per_task() {
        let counter = Arc::new(AtomicI64::new(0));
        let queue = SharedQueue::new();
        queue.push(Task::synthetic(1, 0, Arc::clone(&counter)));
        queue.push(Task::synthetic(2, 0, Arc::clone(&counter)));

        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_some());
        // both wakes consumed; a third pop must block
        let third = tokio::time::timeout(Duration::from_millis(20), queue.pop()).await;
        assert!(third.is_err());
    }
}
