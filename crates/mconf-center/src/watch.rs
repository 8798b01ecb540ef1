//! Subscription management and notification dispatch.
//!
//! Each subscription owns a queue and a dispatch task. Publishing only
//! enqueues, so a slow callback never delays the mutation that produced the
//! change. Events for one subscription are delivered in the order they were
//! published; the center publishes under the registry write lock, which
//! makes that the registry mutation order.
//!
//! Lifecycle: a subscription is Active from `subscribe` until it is
//! cancelled; cancelled subscriptions receive nothing further.
//!
//! Queues are unbounded unless a capacity is configured. A subscriber that
//! reaches the bound stops receiving deltas; once the notifications already
//! queued have been handled it gets a `Resync` marker followed by a fresh
//! `Sync` snapshot of its pattern.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::debug;
use uuid::Uuid;

use mconf_core::{ChangeEvent, ChangeKind, Cmd, ConfStore, Entry, MemoryRegistry};

use crate::sink::{CenterError, ErrorSink};
use crate::stats::StatisticsCollector;

/// Error type returned by notify callbacks.
pub type NotifyError = Box<dyn std::error::Error + Send + Sync>;

/// Receiver of change notifications.
///
/// Called on a background dispatch task. Returned errors and panics are
/// recorded in the error sink; the subscription stays active.
pub trait Notify: Send + Sync + 'static {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

impl<F> Notify for F
where
    F: Fn(&Notification) -> Result<(), NotifyError> + Send + Sync + 'static,
{
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self(notification)
    }
}

/// Identifier of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    /// Current value delivered when the subscription starts
    Sync,
    Created,
    Updated,
    Deleted,
    /// A whole scope was removed
    SubtreeDeleted,
    /// Deltas were skipped; discard the local view, a `Sync` snapshot follows
    Resync,
}

impl From<ChangeKind> for NotificationKind {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Created => Self::Created,
            ChangeKind::Updated => Self::Updated,
            ChangeKind::Deleted => Self::Deleted,
            ChangeKind::SubtreeDeleted => Self::SubtreeDeleted,
        }
    }
}

/// A single delivery to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub kind: NotificationKind,
    pub cmd: Cmd,
    /// New value; `None` for deletions and `Resync`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub revision: u64,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    /// Initial-sync notification for an existing entry.
    pub fn sync(entry: &Entry) -> Self {
        Self {
            kind: NotificationKind::Sync,
            cmd: entry.cmd.clone(),
            value: Some(entry.value.clone()),
            revision: entry.revision,
            timestamp: entry.updated_at,
        }
    }

    fn resync(pattern: &Cmd, revision: u64) -> Self {
        Self {
            kind: NotificationKind::Resync,
            cmd: pattern.clone(),
            value: None,
            revision,
            timestamp: Utc::now(),
        }
    }

    pub fn is_deletion(&self) -> bool {
        matches!(
            self.kind,
            NotificationKind::Deleted | NotificationKind::SubtreeDeleted
        )
    }

    /// Decode the value into a typed payload. `None` for deletions.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.value.clone().map(serde_json::from_value).transpose()
    }
}

impl From<&ChangeEvent> for Notification {
    fn from(event: &ChangeEvent) -> Self {
        Self {
            kind: event.kind.into(),
            cmd: event.cmd.clone(),
            value: event.value.clone(),
            revision: event.revision,
            timestamp: event.timestamp,
        }
    }
}

enum Envelope {
    Deliver(Notification),
    /// Completes once every envelope queued before it has been handled.
    Barrier(oneshot::Sender<()>),
    /// Queued on overflow; replaces the skipped deltas with a snapshot.
    Resync,
}

struct Subscriber {
    pattern: Cmd,
    notify: Arc<dyn Notify>,
    tx: mpsc::UnboundedSender<Envelope>,
    depth: Arc<AtomicUsize>,
    active: Arc<AtomicBool>,
    /// Set on overflow, cleared once the snapshot has been taken
    resync: Arc<AtomicBool>,
}

impl Subscriber {
    fn wants(&self, event: &ChangeEvent) -> bool {
        match event.kind {
            ChangeKind::SubtreeDeleted => self.pattern.overlaps(&event.cmd),
            _ => self.pattern.covers(&event.cmd),
        }
    }
}

/// Registry of active subscriptions.
pub struct WatchManager {
    subscribers: DashMap<SubscriptionId, Subscriber>,
    /// Queued notifications per subscriber; zero means unbounded.
    capacity: usize,
    /// Snapshot source for resynchronizing overflowed subscribers
    registry: Arc<RwLock<MemoryRegistry>>,
    sink: Arc<ErrorSink>,
    stats: Arc<StatisticsCollector>,
}

impl WatchManager {
    pub fn new(
        capacity: usize,
        registry: Arc<RwLock<MemoryRegistry>>,
        sink: Arc<ErrorSink>,
        stats: Arc<StatisticsCollector>,
    ) -> Self {
        Self {
            subscribers: DashMap::new(),
            capacity,
            registry,
            sink,
            stats,
        }
    }

    /// Register a subscription and queue its initial sync.
    ///
    /// The returned receiver completes once the initial notifications have
    /// been handed to `notify`. Must be called inside a tokio runtime.
    /// Callers must hold off publishing between taking the snapshot for
    /// `initial` and this call, or deltas may be missed or duplicated.
    pub fn subscribe(
        &self,
        pattern: Cmd,
        notify: Arc<dyn Notify>,
        initial: Vec<Notification>,
    ) -> (SubscriptionId, oneshot::Receiver<()>) {
        let id = SubscriptionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicBool::new(true));
        let resync = Arc::new(AtomicBool::new(false));

        // Initial sync is never subject to the queue bound
        for notification in initial {
            depth.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(Envelope::Deliver(notification));
        }
        let (done_tx, done_rx) = oneshot::channel();
        let _ = tx.send(Envelope::Barrier(done_tx));

        tokio::spawn(
            Dispatcher {
                id,
                pattern: pattern.clone(),
                notify: notify.clone(),
                depth: depth.clone(),
                active: active.clone(),
                resync: resync.clone(),
                registry: self.registry.clone(),
                sink: self.sink.clone(),
                stats: self.stats.clone(),
            }
            .run(rx),
        );

        debug!("Subscription {} registered for {}", id, pattern);
        self.subscribers.insert(
            id,
            Subscriber {
                pattern,
                notify,
                tx,
                depth,
                active,
                resync,
            },
        );

        (id, done_rx)
    }

    /// Queue change events for every matching subscription.
    pub fn publish(&self, events: &[ChangeEvent]) {
        for event in events {
            for entry in self.subscribers.iter() {
                let subscriber = entry.value();
                if !subscriber.wants(event) {
                    continue;
                }

                // Skipped deltas are covered by the pending snapshot
                if subscriber.resync.load(Ordering::SeqCst) {
                    self.stats.record_dropped_notification();
                    continue;
                }

                if self.capacity > 0 && subscriber.depth.load(Ordering::SeqCst) >= self.capacity {
                    subscriber.resync.store(true, Ordering::SeqCst);
                    let _ = subscriber.tx.send(Envelope::Resync);
                    self.sink.record(CenterError::Overflow {
                        subscription: *entry.key(),
                        cmd: event.cmd.clone(),
                    });
                    continue;
                }

                subscriber.depth.fetch_add(1, Ordering::SeqCst);
                if subscriber
                    .tx
                    .send(Envelope::Deliver(Notification::from(event)))
                    .is_err()
                {
                    subscriber.depth.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }

    /// Cancel one subscription. Returns false if it was not active.
    pub fn cancel(&self, id: SubscriptionId) -> bool {
        match self.subscribers.remove(&id) {
            Some((_, subscriber)) => {
                subscriber.active.store(false, Ordering::SeqCst);
                debug!("Subscription {} cancelled", id);
                true
            }
            None => false,
        }
    }

    /// Cancel every subscription whose pattern equals `pattern`.
    pub fn cancel_pattern(&self, pattern: &Cmd) -> usize {
        self.cancel_where(|subscriber| subscriber.pattern == *pattern)
    }

    /// Cancel subscriptions with this pattern and this exact callback.
    pub fn cancel_notify(&self, pattern: &Cmd, notify: &Arc<dyn Notify>) -> usize {
        self.cancel_where(|subscriber| {
            subscriber.pattern == *pattern && Arc::ptr_eq(&subscriber.notify, notify)
        })
    }

    pub fn cancel_all(&self) -> usize {
        self.cancel_where(|_| true)
    }

    fn cancel_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Subscriber) -> bool,
    {
        let ids: Vec<SubscriptionId> = self
            .subscribers
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| *entry.key())
            .collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    pub fn is_active(&self, id: SubscriptionId) -> bool {
        self.subscribers.contains_key(&id)
    }

    /// Wait until every notification queued so far for `id` has been handled.
    pub async fn drain(&self, id: SubscriptionId) {
        let barrier = self.subscribers.get(&id).map(|subscriber| {
            let (done_tx, done_rx) = oneshot::channel();
            let _ = subscriber.tx.send(Envelope::Barrier(done_tx));
            done_rx
        });
        if let Some(done) = barrier {
            let _ = done.await;
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

struct Dispatcher {
    id: SubscriptionId,
    pattern: Cmd,
    notify: Arc<dyn Notify>,
    depth: Arc<AtomicUsize>,
    active: Arc<AtomicBool>,
    resync: Arc<AtomicBool>,
    registry: Arc<RwLock<MemoryRegistry>>,
    sink: Arc<ErrorSink>,
    stats: Arc<StatisticsCollector>,
}

impl Dispatcher {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            match envelope {
                Envelope::Barrier(done) => {
                    let _ = done.send(());
                }
                Envelope::Deliver(notification) => {
                    self.depth.fetch_sub(1, Ordering::SeqCst);
                    self.deliver(&notification);
                }
                Envelope::Resync => self.resynchronize().await,
            }
        }
        debug!("Dispatch task for subscription {} stopped", self.id);
    }

    /// Deliver a snapshot taken under the registry read lock.
    ///
    /// Publishing happens under the write lock, so clearing the flag while
    /// holding the read lock means every later delta is queued and none is
    /// already part of the snapshot.
    async fn resynchronize(&self) {
        let snapshot: Vec<Notification> = {
            let registry = self.registry.read().await;
            let mut snapshot = vec![Notification::resync(&self.pattern, registry.revision())];
            snapshot.extend(registry.pulls(&self.pattern).into_iter().map(Notification::sync));
            self.resync.store(false, Ordering::SeqCst);
            snapshot
        };
        debug!(
            "Subscription {} resynchronized with {} entries",
            self.id,
            snapshot.len() - 1
        );
        for notification in &snapshot {
            self.deliver(notification);
        }
    }

    fn deliver(&self, notification: &Notification) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }

        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| self.notify.notify(notification)));
        let message = match outcome {
            Ok(Ok(())) => {
                self.stats.record_notification();
                return;
            }
            Ok(Err(err)) => err.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };
        self.sink.record(CenterError::Dispatch {
            subscription: self.id,
            cmd: notification.cmd.clone(),
            message,
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("callback panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("callback panicked: {message}")
    } else {
        "callback panicked".to_string()
    }
}
