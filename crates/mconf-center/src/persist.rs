//! Asynchronous persistence to the backing store.
//!
//! Mutations commit in memory first and queue their store operations here.
//! A single worker applies them in queue order, retrying transient failures
//! with exponential backoff. Operations that still fail are reported to the
//! error sink; the in-memory registry is never rolled back.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use mconf_core::{PrefixKey, RetrySettings, SuffixKey};

use crate::adapter::{BackingStore, StoreError};
use crate::sink::{CenterError, ErrorSink};
use crate::stats::StatisticsCollector;

/// A queued store operation.
#[derive(Debug)]
pub enum PersistOp {
    Write {
        prefix: PrefixKey,
        suffix: SuffixKey,
        value: Value,
    },
    Delete {
        prefix: PrefixKey,
        suffix: Option<SuffixKey>,
    },
    /// Completes once every operation queued before it has finished.
    Flush(oneshot::Sender<()>),
    Stop,
}

impl PersistOp {
    fn describe(&self) -> String {
        match self {
            PersistOp::Write { prefix, suffix, .. } => format!("write {}{}", prefix, suffix),
            PersistOp::Delete {
                prefix,
                suffix: Some(suffix),
            } => format!("delete {}{}", prefix, suffix),
            PersistOp::Delete { prefix, suffix: None } => format!("delete {}", prefix),
            PersistOp::Flush(_) => "flush".to_string(),
            PersistOp::Stop => "stop".to_string(),
        }
    }
}

type EchoKey = (PrefixKey, Option<SuffixKey>);

/// Store events this center is about to cause itself.
///
/// The remote follower consults it so that a center does not re-apply its
/// own writes when they come back through the store watch.
#[derive(Default)]
pub struct EchoTracker {
    pending: Mutex<HashMap<EchoKey, usize>>,
}

impl EchoTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect one event for this key.
    pub fn expect(&self, prefix: &PrefixKey, suffix: Option<&SuffixKey>) {
        *self
            .pending
            .lock()
            .entry((prefix.clone(), suffix.cloned()))
            .or_insert(0) += 1;
    }

    /// Withdraw an expectation after the store call failed.
    pub fn forget(&self, prefix: &PrefixKey, suffix: Option<&SuffixKey>) {
        self.take(prefix, suffix);
    }

    /// Consume one expectation. Returns true if the event was our own.
    pub fn take(&self, prefix: &PrefixKey, suffix: Option<&SuffixKey>) -> bool {
        let mut pending = self.pending.lock();
        let key = (prefix.clone(), suffix.cloned());
        match pending.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                pending.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Drop every expectation, after the store has been reread.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.pending.lock().values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Handle to the persistence worker.
pub struct Persister {
    tx: mpsc::UnboundedSender<PersistOp>,
    stats: Arc<StatisticsCollector>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Persister {
    /// Start the worker. Must be called inside a tokio runtime.
    ///
    /// Pass `echoes` only when a remote follower consumes them.
    pub fn spawn(
        store: Arc<dyn BackingStore>,
        retry: RetrySettings,
        sink: Arc<ErrorSink>,
        stats: Arc<StatisticsCollector>,
        echoes: Option<Arc<EchoTracker>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = PersistWorker {
            store,
            retry,
            sink,
            stats: stats.clone(),
            echoes,
        };
        let handle = tokio::spawn(worker.run(rx));

        Self {
            tx,
            stats,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Queue a write or delete. Returns false once the worker has stopped.
    pub fn submit(&self, op: PersistOp) -> bool {
        let counted = matches!(op, PersistOp::Write { .. } | PersistOp::Delete { .. });
        if counted {
            self.stats.persistence_queued();
        }
        match self.tx.send(op) {
            Ok(()) => true,
            Err(_) => {
                if counted {
                    self.stats.record_persistence_failure();
                }
                false
            }
        }
    }

    /// Wait until every operation queued so far has been applied or given up.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(PersistOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Drain the queue and stop the worker.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(PersistOp::Stop);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct PersistWorker {
    store: Arc<dyn BackingStore>,
    retry: RetrySettings,
    sink: Arc<ErrorSink>,
    stats: Arc<StatisticsCollector>,
    echoes: Option<Arc<EchoTracker>>,
}

impl PersistWorker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<PersistOp>) {
        while let Some(op) = rx.recv().await {
            match op {
                PersistOp::Flush(done) => {
                    let _ = done.send(());
                }
                PersistOp::Stop => break,
                op => self.apply(op).await,
            }
        }
        debug!("Persistence worker stopped");
    }

    async fn apply(&self, op: PersistOp) {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = self.attempt(&op).await;

            let err = match result {
                Ok(()) => {
                    self.stats.record_persisted();
                    return;
                }
                Err(err) => err,
            };

            if !err.is_transient() || attempt >= max_attempts {
                self.sink.record(CenterError::Persistence {
                    operation: op.describe(),
                    attempts: attempt,
                    source: err,
                });
                return;
            }

            let delay = self.retry.backoff(attempt);
            warn!(
                "Persisting {} failed (attempt {}/{}), retrying in {:?}: {}",
                op.describe(),
                attempt,
                max_attempts,
                delay,
                err
            );
            self.stats.record_persistence_retry();
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&self, op: &PersistOp) -> Result<(), StoreError> {
        match op {
            PersistOp::Write { prefix, suffix, value } => {
                self.expect_echo(prefix, Some(suffix));
                let result = self.store.write(prefix, suffix, value).await;
                if result.is_err() {
                    self.forget_echo(prefix, Some(suffix));
                }
                result
            }
            PersistOp::Delete { prefix, suffix } => {
                self.expect_echo(prefix, suffix.as_ref());
                let result = self.store.delete(prefix, suffix.as_ref()).await;
                if result.is_err() {
                    self.forget_echo(prefix, suffix.as_ref());
                }
                result
            }
            PersistOp::Flush(_) | PersistOp::Stop => Ok(()),
        }
    }

    fn expect_echo(&self, prefix: &PrefixKey, suffix: Option<&SuffixKey>) {
        if let Some(echoes) = &self.echoes {
            echoes.expect(prefix, suffix);
        }
    }

    fn forget_echo(&self, prefix: &PrefixKey, suffix: Option<&SuffixKey>) {
        if let Some(echoes) = &self.echoes {
            echoes.forget(prefix, suffix);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryMapStore;
    use mconf_core::key::{encode_prefix, encode_suffix};
    use mconf_core::{Cmd, CmdBuilder};
    use serde_json::json;

    fn cmd(data: &str) -> Cmd {
        CmdBuilder::new()
            .node("n1")
            .app("a1")
            .env("e1")
            .conf("c1")
            .group("g1")
            .version("v1")
            .data(data)
            .build()
            .unwrap()
    }

    fn write_op(data: &str, value: Value) -> PersistOp {
        let cmd = cmd(data);
        PersistOp::Write {
            prefix: encode_prefix(&cmd),
            suffix: encode_suffix(&cmd),
            value,
        }
    }

    fn fast_retry(max_attempts: u32) -> RetrySettings {
        RetrySettings {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
        }
    }

    fn setup(
        store: &MemoryMapStore,
        max_attempts: u32,
    ) -> (Persister, Arc<ErrorSink>, Arc<StatisticsCollector>, Arc<EchoTracker>) {
        let stats = Arc::new(StatisticsCollector::new());
        let sink = Arc::new(ErrorSink::new(16, stats.clone()));
        let echoes = Arc::new(EchoTracker::new());
        let persister = Persister::spawn(
            Arc::new(store.clone()),
            fast_retry(max_attempts),
            sink.clone(),
            stats.clone(),
            Some(echoes.clone()),
        );
        (persister, sink, stats, echoes)
    }

    #[test]
    fn test_echo_tracker_counts() {
        let tracker = EchoTracker::new();
        let prefix = PrefixKey::from_raw("/mconf/a1?node=n1/c1?env=e1");
        let suffix = SuffixKey::from_raw("/d1?group=g1&version=v1");

        tracker.expect(&prefix, Some(&suffix));
        tracker.expect(&prefix, Some(&suffix));
        assert_eq!(tracker.len(), 2);

        assert!(tracker.take(&prefix, Some(&suffix)));
        assert!(!tracker.take(&prefix, None));
        assert!(tracker.take(&prefix, Some(&suffix)));
        assert!(!tracker.take(&prefix, Some(&suffix)));
        assert!(tracker.is_empty());

        tracker.expect(&prefix, None);
        tracker.expect(&prefix, Some(&suffix));
        tracker.clear();
        assert!(tracker.is_empty());
        assert!(!tracker.take(&prefix, None));
    }

    #[tokio::test]
    async fn test_writes_without_echo_tracking() {
        let store = MemoryMapStore::new();
        let stats = Arc::new(StatisticsCollector::new());
        let sink = Arc::new(ErrorSink::new(16, stats.clone()));
        let persister = Persister::spawn(
            Arc::new(store.clone()),
            fast_retry(1),
            sink.clone(),
            stats.clone(),
            None,
        );

        for n in 0..100 {
            persister.submit(write_op("d1", json!(n)));
        }
        persister.flush().await;

        let hash = store.hash(&encode_prefix(&cmd("d1"))).unwrap();
        assert_eq!(hash.get(&encode_suffix(&cmd("d1"))), Some(&json!(99)));
        assert_eq!(stats.snapshot(true, 0, 0).persisted, 100);
        assert!(sink.recent().is_empty());
    }

    #[tokio::test]
    async fn test_writes_in_order() {
        let store = MemoryMapStore::new();
        let (persister, sink, stats, echoes) = setup(&store, 3);

        persister.submit(write_op("d1", json!(1)));
        persister.submit(write_op("d1", json!(2)));
        persister.flush().await;

        let prefix = encode_prefix(&cmd("d1"));
        let hash = store.hash(&prefix).unwrap();
        assert_eq!(hash.get(&encode_suffix(&cmd("d1"))), Some(&json!(2)));
        assert!(sink.recent().is_empty());
        assert_eq!(stats.snapshot(true, 0, 0).persisted, 2);
        assert_eq!(echoes.len(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = MemoryMapStore::new();
        let (persister, sink, stats, echoes) = setup(&store, 5);
        store.fail_next_writes(2);

        persister.submit(write_op("d1", json!("x")));
        persister.flush().await;

        let snapshot = stats.snapshot(true, 0, 0);
        assert_eq!(snapshot.persisted, 1);
        assert_eq!(snapshot.persistence_retries, 2);
        assert_eq!(snapshot.pending_persistence, 0);
        assert!(sink.recent().is_empty());
        assert_eq!(echoes.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_reported() {
        let store = MemoryMapStore::new();
        let (persister, sink, stats, echoes) = setup(&store, 2);
        store.set_available(false);

        persister.submit(write_op("d1", json!("x")));
        persister.flush().await;

        let recent = sink.recent();
        assert_eq!(recent.len(), 1);
        match &recent[0].error {
            CenterError::Persistence { attempts, source, .. } => {
                assert_eq!(*attempts, 2);
                assert!(source.is_transient());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(stats.snapshot(false, 0, 0).persistence_failures, 1);
        assert!(echoes.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let store = MemoryMapStore::new();
        let (persister, _, _, _) = setup(&store, 1);

        persister.submit(write_op("d1", json!(1)));
        persister.shutdown().await;

        assert!(store.hash(&encode_prefix(&cmd("d1"))).is_some());
        assert!(!persister.submit(write_op("d2", json!(2))));
    }
}
