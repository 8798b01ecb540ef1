//! Error sink for failures that happen after the caller has returned.
//!
//! Persistence and dispatch run in background tasks, so their failures
//! cannot be returned from `add_conf` or `push`. They are logged, counted,
//! kept in a bounded history and broadcast to anyone listening.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, warn};

use mconf_core::Cmd;

use crate::adapter::StoreError;
use crate::stats::StatisticsCollector;
use crate::watch::SubscriptionId;

/// A background failure.
#[derive(Debug, Clone, Error)]
pub enum CenterError {
    /// A write or delete could not be persisted after all retries.
    #[error("Persisting {operation} failed after {attempts} attempt(s): {source}")]
    Persistence {
        operation: String,
        attempts: u32,
        source: StoreError,
    },

    /// A notify callback returned an error or panicked.
    #[error("Notify callback of subscription {subscription} failed for {cmd}: {message}")]
    Dispatch {
        subscription: SubscriptionId,
        cmd: Cmd,
        message: String,
    },

    /// A subscriber queue was full; deltas are skipped until it is resynchronized.
    #[error("Subscription {subscription} queue is full at {cmd}, resynchronizing from snapshot")]
    Overflow { subscription: SubscriptionId, cmd: Cmd },

    /// A change observed on the backing store could not be applied.
    #[error("Remote change could not be applied: {0}")]
    RemoteSync(String),
}

/// A recorded background failure.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub error: CenterError,
}

/// Bounded history of background failures.
pub struct ErrorSink {
    history: Mutex<VecDeque<ErrorRecord>>,
    capacity: usize,
    events: broadcast::Sender<ErrorRecord>,
    stats: Arc<StatisticsCollector>,
}

impl ErrorSink {
    pub fn new(capacity: usize, stats: Arc<StatisticsCollector>) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            events,
            stats,
        }
    }

    /// Record a failure: log it, count it, keep it and broadcast it.
    pub fn record(&self, err: CenterError) {
        match &err {
            CenterError::Persistence { .. } => {
                error!("{}", err);
                self.stats.record_persistence_failure();
            }
            CenterError::Dispatch { .. } => {
                error!("{}", err);
                self.stats.record_dispatch_failure();
            }
            CenterError::Overflow { .. } => {
                warn!("{}", err);
                self.stats.record_dropped_notification();
            }
            CenterError::RemoteSync(_) => warn!("{}", err),
        }

        let record = ErrorRecord {
            at: Utc::now(),
            error: err,
        };

        if self.capacity > 0 {
            let mut history = self.history.lock();
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(record.clone());
        }

        let _ = self.events.send(record);
    }

    /// Recorded failures, oldest first.
    pub fn recent(&self) -> Vec<ErrorRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Receive failures as they are recorded.
    pub fn subscribe(&self) -> broadcast::Receiver<ErrorRecord> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(n: usize) -> CenterError {
        CenterError::RemoteSync(format!("event {n}"))
    }

    #[test]
    fn test_history_is_bounded() {
        let sink = ErrorSink::new(2, Arc::new(StatisticsCollector::new()));
        for n in 0..3 {
            sink.record(remote(n));
        }

        let recent = sink.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].error.to_string(), "Remote change could not be applied: event 1");
    }

    #[test]
    fn test_persistence_failure_is_counted() {
        let stats = Arc::new(StatisticsCollector::new());
        let sink = ErrorSink::new(8, stats.clone());
        stats.persistence_queued();

        sink.record(CenterError::Persistence {
            operation: "write /mconf/a/n/e/c/g/v/d".to_string(),
            attempts: 3,
            source: StoreError::Timeout,
        });

        let snapshot = stats.snapshot(true, 0, 0);
        assert_eq!(snapshot.persistence_failures, 1);
        assert_eq!(snapshot.pending_persistence, 0);
    }

    #[tokio::test]
    async fn test_broadcast() {
        let sink = ErrorSink::new(0, Arc::new(StatisticsCollector::new()));
        let mut rx = sink.subscribe();

        sink.record(remote(1));

        let record = rx.recv().await.unwrap();
        assert!(matches!(record.error, CenterError::RemoteSync(_)));
        assert!(sink.recent().is_empty());
    }
}
