//! Center statistics collection.
//!
//! Counters are updated from the mutation path, the dispatch tasks and the
//! persistence worker without locking:
//! - Mutations and remote changes applied to the registry
//! - Notifications delivered, dropped, or failed
//! - Persistence successes, retries, failures and queue depth
//!
//! A snapshot combines them with registry and watch sizes.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Point-in-time statistics for one center.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CenterStatistics {
    pub available: bool,
    pub entries: usize,
    pub subscriptions: usize,
    pub mutations: u64,
    pub remote_changes: u64,
    pub notifications: u64,
    pub dropped_notifications: u64,
    pub dispatch_failures: u64,
    pub persisted: u64,
    pub persistence_retries: u64,
    pub persistence_failures: u64,
    pub pending_persistence: usize,
    /// Seconds since the center connected
    pub uptime: u64,
}

/// Collects and tracks center statistics.
pub struct StatisticsCollector {
    start_time: Instant,
    mutations: AtomicU64,
    remote_changes: AtomicU64,
    notifications: AtomicU64,
    dropped_notifications: AtomicU64,
    dispatch_failures: AtomicU64,
    persisted: AtomicU64,
    persistence_retries: AtomicU64,
    persistence_failures: AtomicU64,
    pending_persistence: AtomicUsize,
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mutations: AtomicU64::new(0),
            remote_changes: AtomicU64::new(0),
            notifications: AtomicU64::new(0),
            dropped_notifications: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            persistence_retries: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            pending_persistence: AtomicUsize::new(0),
        }
    }

    pub fn record_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_change(&self) {
        self.remote_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notification(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_notification(&self) {
        self.dropped_notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_failure(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A persistence operation was queued.
    pub fn persistence_queued(&self) {
        self.pending_persistence.fetch_add(1, Ordering::Relaxed);
    }

    /// A queued persistence operation completed.
    pub fn record_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
        self.pending_persistence.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_persistence_retry(&self) {
        self.persistence_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// A queued persistence operation was given up.
    pub fn record_persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
        self.pending_persistence.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn pending_persistence(&self) -> usize {
        self.pending_persistence.load(Ordering::Relaxed)
    }

    /// Get a statistics snapshot.
    pub fn snapshot(&self, available: bool, entries: usize, subscriptions: usize) -> CenterStatistics {
        CenterStatistics {
            available,
            entries,
            subscriptions,
            mutations: self.mutations.load(Ordering::Relaxed),
            remote_changes: self.remote_changes.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            dropped_notifications: self.dropped_notifications.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            persistence_retries: self.persistence_retries.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            pending_persistence: self.pending_persistence.load(Ordering::Relaxed),
            uptime: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_tracking() {
        let stats = StatisticsCollector::new();

        stats.persistence_queued();
        stats.persistence_queued();
        stats.persistence_queued();
        assert_eq!(stats.pending_persistence(), 3);

        stats.record_persisted();
        stats.record_persistence_retry();
        stats.record_persistence_failure();

        let snapshot = stats.snapshot(true, 0, 0);
        assert_eq!(snapshot.pending_persistence, 1);
        assert_eq!(snapshot.persisted, 1);
        assert_eq!(snapshot.persistence_retries, 1);
        assert_eq!(snapshot.persistence_failures, 1);
    }

    #[test]
    fn test_snapshot_sizes() {
        let stats = StatisticsCollector::new();
        stats.record_mutation();
        stats.record_notification();
        stats.record_notification();

        let snapshot = stats.snapshot(false, 7, 2);
        assert!(!snapshot.available);
        assert_eq!(snapshot.entries, 7);
        assert_eq!(snapshot.subscriptions, 2);
        assert_eq!(snapshot.mutations, 1);
        assert_eq!(snapshot.notifications, 2);
    }
}
