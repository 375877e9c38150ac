//! Outstanding queries awaiting replies, keyed by fingerprint.

use std::collections::BTreeMap;

use crate::task::Task;

/// Ordered map of in-flight queries. Single-threaded: each worker owns one.
#[derive(Default)]
pub struct TrackingTable {
    entries: BTreeMap<u64, Task>,
}

impl TrackingTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Insert a task, replacing (and handing back) an entry with an equal
    /// fingerprint. Replies cannot tell two such queries apart, so only
    /// the later one is worth keeping.
    pub fn insert(&mut self, task: Task) -> Option<Task> {
        self.entries.insert(task.fingerprint, task)
    }

    pub fn lookup(&self, fingerprint: u64) -> Option<&Task> {
        self.entries.get(&fingerprint)
    }

    pub fn remove(&mut self, fingerprint: u64) -> Option<Task> {
        self.entries.remove(&fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys of entries whose age meets or exceeds the TTL. First pass of
    /// the expiry scan; the caller removes them in a second pass so the
    /// traversal never observes its own deletions.
    pub fn expired_keys(&self, now_epoch: u64, epoch_size_ns: u64, ttl_ns: u64) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|(_, task)| {
                now_epoch
                    .saturating_sub(task.epoch)
                    .saturating_mul(epoch_size_ns)
                    >= ttl_ns
            })
            .map(|(key, _)| *key)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    #[test]
    fn duplicate_fingerprint_replaces() {
        let counter = Arc::new(AtomicI64::new(0));
        let mut table = TrackingTable::new();

        assert!(table
            .insert(Task::synthetic(42, 1, Arc::clone(&counter)))
            .is_none());
        let evicted = table
            .insert(Task::synthetic(42, 2, Arc::clone(&counter)))
            .expect("first entry evicted");
        assert_eq!(evicted.epoch, 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(42).unwrap().epoch, 2);

        drop(evicted);
        drop(table);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[test]
    fn remove_by_fingerprint() {
        let counter = Arc::new(AtomicI64::new(0));
        let mut table = TrackingTable::new();
        table.insert(Task::synthetic(7, 0, Arc::clone(&counter)));

        assert!(table.remove(8).is_none());
        assert!(table.remove(7).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn expiry_boundary() {
        let counter = Arc::new(AtomicI64::new(0));
        let mut table = TrackingTable::new();
        // epoch size 1ms, ttl 5ms
        let epoch_size = 1_000_000;
        let ttl = 5_000_000;

        table.insert(Task::synthetic(1, 10, Arc::clone(&counter))); // age 5 at epoch 15
        table.insert(Task::synthetic(2, 11, Arc::clone(&counter))); // age 4 at epoch 15

        let expired = table.expired_keys(15, epoch_size, ttl);
        assert_eq!(expired, vec![1]);

        for key in expired {
            assert!(table.remove(key).is_some());
        }
        assert_eq!(table.len(), 1);
        assert!(table.lookup(2).is_some());
    }

    #[test]
    fn expiry_scan_is_ordered() {
        let counter = Arc::new(AtomicI64::new(0));
        let mut table = TrackingTable::new();
        for key in [9u64, 3, 7] {
            table.insert(Task::synthetic(key, 0, Arc::clone(&counter)));
        }
        assert_eq!(table.expired_keys(1, 1, 0), vec![3, 7, 9]);
    }
}
