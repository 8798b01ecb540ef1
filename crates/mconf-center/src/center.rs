//! The configuration center handle.
//!
//! `Mconf` ties the registry, the watch manager and the persistence worker
//! to one backing store connection. Mutations take the registry write lock,
//! publish their change events and queue persistence before the lock is
//! released, so every observer sees the same order for a given key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mconf_core::key::{self, encode_prefix, encode_suffix};
use mconf_core::structure;
use mconf_core::{
    ChangeEvent, ChangeKind, Cmd, CmdBuilder, ConfStore, ConnectUrl, DataConf, Entry, MconfError,
    MconfSettings, MemoryRegistry, Result, Structures,
};

use crate::adapter::{BackingStore, StoreError, StoreEvent, StoreWatcher};
use crate::memory;
use crate::persist::{EchoTracker, PersistOp, Persister};
use crate::sink::{CenterError, ErrorRecord, ErrorSink};
use crate::stats::{CenterStatistics, StatisticsCollector};
use crate::watch::{Notification, Notify, SubscriptionId, WatchManager};

/// A connected configuration center.
pub struct Mconf {
    id: Uuid,
    url: ConnectUrl,
    settings: MconfSettings,
    store: Arc<dyn BackingStore>,
    registry: Arc<RwLock<MemoryRegistry>>,
    watch: Arc<WatchManager>,
    persister: Arc<Persister>,
    /// Present only while remote changes are followed
    echoes: Option<Arc<EchoTracker>>,
    sink: Arc<ErrorSink>,
    stats: Arc<StatisticsCollector>,
    follower: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Mconf {
    /// Connect to a backing store.
    ///
    /// `url` selects the layout and carries the connection defaults; its
    /// `allowOverwrite` and `timeout` parameters override `settings`. Waits
    /// for the store to become ready, then loads every entry whose prefix
    /// agrees with the defaults. Must be called inside a tokio runtime.
    pub async fn connect(
        url: &str,
        store: Arc<dyn BackingStore>,
        mut settings: MconfSettings,
    ) -> Result<Self> {
        let url = ConnectUrl::parse(url)?;
        url.apply_to(&mut settings)?;

        if store.layout() != url.layout {
            return Err(MconfError::Connection(format!(
                "scheme {} needs a {:?} store, got {:?}",
                url.scheme,
                url.layout,
                store.layout()
            )));
        }

        let timeout = settings.connect_timeout();
        match tokio::time::timeout(timeout, store.ready()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(MconfError::Connection(e.to_string())),
            Err(_) => {
                return Err(MconfError::Connection(format!(
                    "{} not ready after {:?}",
                    url.address(),
                    timeout
                )))
            }
        }

        // Subscribe before reading so nothing written meanwhile is missed
        let watcher = settings.follow_remote.then(|| store.watch(None));

        let mut registry = MemoryRegistry::new();
        let loaded = registry.load(hydrate(store.as_ref(), &url.defaults).await?);

        let registry = Arc::new(RwLock::new(registry));

        let stats = Arc::new(StatisticsCollector::new());
        let sink = Arc::new(ErrorSink::new(settings.error_history, stats.clone()));
        let watch = Arc::new(WatchManager::new(
            settings.subscriber_queue_capacity,
            registry.clone(),
            sink.clone(),
            stats.clone(),
        ));
        let echoes = watcher.as_ref().map(|_| Arc::new(EchoTracker::new()));
        let persister = Arc::new(Persister::spawn(
            store.clone(),
            settings.retry.clone(),
            sink.clone(),
            stats.clone(),
            echoes.clone(),
        ));

        let follower = watcher.zip(echoes.clone()).map(|(watcher, echoes)| {
            let follower = RemoteFollower {
                defaults: url.defaults.clone(),
                store: store.clone(),
                registry: registry.clone(),
                watch: watch.clone(),
                persister: persister.clone(),
                echoes,
                sink: sink.clone(),
                stats: stats.clone(),
            };
            tokio::spawn(follower.run(watcher))
        });

        let id = Uuid::new_v4();
        info!(
            "Center {} connected to {} ({:?} layout, {} entries loaded)",
            id,
            url.address(),
            url.layout,
            loaded
        );

        Ok(Self {
            id,
            url,
            settings,
            store,
            registry,
            watch,
            persister,
            echoes,
            sink,
            stats,
            follower: Mutex::new(follower),
            closed: AtomicBool::new(false),
        })
    }

    /// Connect to a fresh in-memory store of the layout named by `url`.
    pub async fn connect_in_memory(url: &str, settings: MconfSettings) -> Result<Self> {
        let layout = ConnectUrl::parse(url)?.layout;
        Self::connect(url, memory::open(layout), settings).await
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn url(&self) -> &ConnectUrl {
        &self.url
    }

    pub fn settings(&self) -> &MconfSettings {
        &self.settings
    }

    /// A key builder pre-filled with the connection defaults.
    pub fn cmd(&self) -> CmdBuilder {
        self.url.defaults.clone()
    }

    /// Whether the backing store is reachable. Never fails.
    pub fn available(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.store.is_available()
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Add a new entry.
    pub async fn add_conf<T: Serialize + ?Sized>(&self, cmd: &Cmd, data: &T) -> Result<()> {
        self.ensure_open()?;
        let value = serde_json::to_value(data)?;

        let mut registry = self.registry.write().await;
        let events = registry.add_conf(cmd, value, self.settings.allow_overwrite)?;
        self.commit(&events);
        debug!("Added {}", cmd);
        Ok(())
    }

    /// Replace an existing entry.
    pub async fn up_conf<T: Serialize + ?Sized>(&self, cmd: &Cmd, data: &T) -> Result<()> {
        self.ensure_open()?;
        let value = serde_json::to_value(data)?;

        let mut registry = self.registry.write().await;
        let events = registry.up_conf(cmd, value)?;
        self.commit(&events);
        debug!("Updated {}", cmd);
        Ok(())
    }

    /// Delete one entry, or every entry within a scope.
    ///
    /// Returns the number of entries removed. Deleting a scope that holds no
    /// entries returns `Ok(0)` and notifies nobody; no `SubtreeDeleted` is
    /// sent for it. Deleting a missing single entry is `NotFound`.
    pub async fn del_conf(&self, cmd: &Cmd) -> Result<usize> {
        self.ensure_open()?;

        let mut registry = self.registry.write().await;
        let events = registry.del_conf(cmd)?;
        self.commit(&events);

        let removed = events
            .iter()
            .filter(|e| e.kind == ChangeKind::Deleted)
            .count();
        debug!("Deleted {} ({} entries)", cmd, removed);
        Ok(removed)
    }

    /// Publish and persist the events of one mutation. Called with the
    /// registry write lock held.
    fn commit(&self, events: &[ChangeEvent]) {
        if events.is_empty() {
            return;
        }
        self.stats.record_mutation();
        self.watch.publish(events);

        for op in persist_ops(events) {
            if !self.persister.submit(op) {
                warn!("Persistence worker is gone, change not persisted");
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Exact lookup, decoded into `T`.
    pub async fn pull<T: DeserializeOwned>(&self, cmd: &Cmd) -> Result<T> {
        let value = self.pull_value(cmd).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn pull_value(&self, cmd: &Cmd) -> Result<Value> {
        Ok(self.pull_entry(cmd).await?.value)
    }

    pub async fn pull_entry(&self, cmd: &Cmd) -> Result<Entry> {
        self.ensure_open()?;
        let registry = self.registry.read().await;
        registry.pull(cmd).cloned()
    }

    /// Every value within the scope of `cmd`, in key order, decoded into `T`.
    pub async fn pulls<T: DeserializeOwned>(&self, cmd: &Cmd) -> Result<Vec<T>> {
        self.pulls_entries(cmd)
            .await?
            .into_iter()
            .map(|entry| serde_json::from_value(entry.value).map_err(MconfError::from))
            .collect()
    }

    pub async fn pulls_entries(&self, cmd: &Cmd) -> Result<Vec<Entry>> {
        self.ensure_open()?;
        let registry = self.registry.read().await;
        Ok(registry.pulls(cmd).into_iter().cloned().collect())
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe `notify` to every change within the scope of `cmd`.
    ///
    /// Returns once a `Sync` notification for every entry currently in scope
    /// has been delivered; deltas follow in mutation order.
    pub async fn push(&self, cmd: &Cmd, notify: Arc<dyn Notify>) -> Result<Subscription> {
        self.ensure_open()?;

        let (id, synced) = {
            // Holding the read lock keeps mutations out between snapshot and registration
            let registry = self.registry.read().await;
            let initial = registry
                .pulls(cmd)
                .into_iter()
                .map(Notification::sync)
                .collect();
            self.watch.subscribe(cmd.clone(), notify, initial)
        };

        // A close that raced with registration has already run cancel_all
        if self.is_closed() {
            self.watch.cancel(id);
            return Err(MconfError::Closed);
        }
        let _ = synced.await;

        Ok(Subscription {
            id,
            pattern: cmd.clone(),
            watch: Arc::downgrade(&self.watch),
        })
    }

    /// Cancel every subscription registered with exactly this pattern.
    pub fn unpush(&self, cmd: &Cmd) -> usize {
        self.watch.cancel_pattern(cmd)
    }

    /// Cancel only the subscriptions of this pattern that use `notify`.
    pub fn unpush_notify(&self, cmd: &Cmd, notify: &Arc<dyn Notify>) -> usize {
        self.watch.cancel_notify(cmd, notify)
    }

    // ========================================================================
    // Structure
    // ========================================================================

    pub async fn apps(&self) -> Result<Vec<DataConf>> {
        self.ensure_open()?;
        let registry = self.registry.read().await;
        Ok(structure::apps(registry.entries()))
    }

    pub async fn confs(&self) -> Result<Vec<DataConf>> {
        self.ensure_open()?;
        let registry = self.registry.read().await;
        Ok(structure::confs(registry.entries()))
    }

    pub async fn kv_datas(&self) -> Result<Vec<DataConf>> {
        self.ensure_open()?;
        let registry = self.registry.read().await;
        Ok(structure::kv_datas(registry.entries()))
    }

    pub async fn structures(&self) -> Result<Structures> {
        self.ensure_open()?;
        let registry = self.registry.read().await;
        Ok(structure::structures(registry.entries()))
    }

    // ========================================================================
    // Diagnostics and lifecycle
    // ========================================================================

    pub async fn statistics(&self) -> CenterStatistics {
        let entries = self.registry.read().await.len();
        self.stats
            .snapshot(self.available(), entries, self.watch.len())
    }

    /// Background failures recorded so far, oldest first.
    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.sink.recent()
    }

    /// Receive background failures as they happen.
    pub fn error_events(&self) -> broadcast::Receiver<ErrorRecord> {
        self.sink.subscribe()
    }

    /// Wait until every change made so far has been persisted or given up.
    pub async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.persister.flush().await;
        Ok(())
    }

    /// Flush pending persistence, cancel all subscriptions and stop the
    /// background tasks. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.persister.shutdown().await;
        let cancelled = self.watch.cancel_all();
        if let Some(follower) = self.follower.lock().take() {
            follower.abort();
        }

        info!(
            "Center {} closed ({} subscriptions cancelled)",
            self.id, cancelled
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(MconfError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Mconf {
    fn drop(&mut self) {
        if let Some(follower) = self.follower.get_mut().take() {
            follower.abort();
        }
        self.watch.cancel_all();
    }
}

/// Handle to one subscription.
///
/// Dropping the handle does not cancel the subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: SubscriptionId,
    pattern: Cmd,
    watch: Weak<WatchManager>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn pattern(&self) -> &Cmd {
        &self.pattern
    }

    /// Cancel this subscription. Returns false if it was already cancelled.
    pub fn cancel(&self) -> bool {
        self.watch
            .upgrade()
            .map_or(false, |watch| watch.cancel(self.id))
    }

    pub fn is_active(&self) -> bool {
        self.watch
            .upgrade()
            .map_or(false, |watch| watch.is_active(self.id))
    }
}

/// Map registry events to store operations.
///
/// A conf-level subtree delete becomes one prefix-wide delete instead of one
/// delete per entry; narrower subtree deletes rely on the per-entry deletes.
fn persist_ops(events: &[ChangeEvent]) -> Vec<PersistOp> {
    let whole_prefix = events
        .iter()
        .any(|e| e.kind == ChangeKind::SubtreeDeleted && e.cmd.group().is_none());

    let mut ops = Vec::new();
    for event in events {
        let prefix = encode_prefix(&event.cmd);
        match event.kind {
            ChangeKind::Created | ChangeKind::Updated => {
                if let Some(value) = &event.value {
                    ops.push(PersistOp::Write {
                        prefix,
                        suffix: encode_suffix(&event.cmd),
                        value: value.clone(),
                    });
                }
            }
            ChangeKind::Deleted if !whole_prefix => ops.push(PersistOp::Delete {
                prefix,
                suffix: Some(encode_suffix(&event.cmd)),
            }),
            ChangeKind::SubtreeDeleted if whole_prefix => {
                ops.push(PersistOp::Delete { prefix, suffix: None })
            }
            _ => {}
        }
    }
    ops
}

/// Read every entry under prefixes that agree with the connection defaults.
async fn hydrate(store: &dyn BackingStore, defaults: &CmdBuilder) -> Result<Vec<(Cmd, Value)>> {
    let prefixes = store
        .list_prefixes()
        .await
        .map_err(|e| MconfError::Connection(e.to_string()))?;

    let mut entries = Vec::new();
    for prefix in prefixes {
        match key::decode_prefix(&prefix) {
            Ok(scope) if defaults.admits_prefix(&scope) => {}
            Ok(_) => continue,
            Err(e) => {
                warn!("Skipping unreadable prefix {}: {}", prefix, e);
                continue;
            }
        }

        let values = store
            .read_all(&prefix)
            .await
            .map_err(|e| MconfError::Connection(e.to_string()))?;
        for (suffix, value) in values {
            match key::decode(&prefix, &suffix) {
                Ok(cmd) => entries.push((cmd, value)),
                Err(e) => warn!("Skipping unreadable key {}{}: {}", prefix, suffix, e),
            }
        }
    }
    Ok(entries)
}

/// Applies changes made by other centers sharing the backing store.
struct RemoteFollower {
    defaults: CmdBuilder,
    store: Arc<dyn BackingStore>,
    registry: Arc<RwLock<MemoryRegistry>>,
    watch: Arc<WatchManager>,
    persister: Arc<Persister>,
    echoes: Arc<EchoTracker>,
    sink: Arc<ErrorSink>,
    stats: Arc<StatisticsCollector>,
}

impl RemoteFollower {
    async fn run(self, mut watcher: StoreWatcher) {
        while let Some(next) = watcher.next().await {
            match next {
                Ok(event) => self.apply(event).await,
                Err(err) => self.recover(err).await,
            }
        }
        debug!("Store watch closed, remote follow stopped");
    }

    /// Catch up after missed store events by rereading the store.
    ///
    /// Runs under the registry write lock so no local mutation slips in
    /// between the flush and the reread. Pending echoes are stale once the
    /// flushed writes are part of the reread, so they are dropped.
    async fn recover(&self, err: StoreError) {
        self.sink.record(CenterError::RemoteSync(format!(
            "{err}, rereading the store"
        )));

        let mut registry = self.registry.write().await;
        self.persister.flush().await;
        self.echoes.clear();

        let stored = match hydrate(self.store.as_ref(), &self.defaults).await {
            Ok(stored) => stored,
            Err(e) => {
                self.sink.record(CenterError::RemoteSync(format!("reread failed: {e}")));
                return;
            }
        };

        let events = registry.resync(|cmd| self.defaults.admits_prefix(cmd), stored);
        if events.is_empty() {
            return;
        }
        self.stats.record_remote_change();
        self.watch.publish(&events);
        info!("Resynchronized {} entries from the store", events.len());
    }

    async fn apply(&self, event: StoreEvent) {
        let (decoded, value) = match event {
            StoreEvent::Written { prefix, suffix, value } => {
                if self.echoes.take(&prefix, Some(&suffix)) {
                    return;
                }
                (key::decode(&prefix, &suffix), Some(value))
            }
            StoreEvent::Removed { prefix, suffix } => {
                if self.echoes.take(&prefix, suffix.as_ref()) {
                    return;
                }
                let decoded = match &suffix {
                    Some(suffix) => key::decode(&prefix, suffix),
                    None => key::decode_prefix(&prefix),
                };
                (decoded, None)
            }
        };

        let cmd = match decoded {
            Ok(cmd) => cmd,
            Err(e) => {
                self.sink.record(CenterError::RemoteSync(e.to_string()));
                return;
            }
        };
        if !self.defaults.admits_prefix(&cmd) {
            return;
        }

        let mut registry = self.registry.write().await;
        let events = match value {
            Some(value) => registry.apply_remote_put(&cmd, value),
            None => registry.apply_remote_delete(&cmd),
        };
        if events.is_empty() {
            return;
        }

        self.stats.record_remote_change();
        self.watch.publish(&events);
        debug!("Applied remote change to {}", cmd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(group: &str, data: &str) -> Cmd {
        CmdBuilder::new()
            .node("n1")
            .app("a1")
            .env("e1")
            .conf("c1")
            .group(group)
            .version("v1")
            .data(data)
            .build()
            .unwrap()
    }

    fn event(kind: ChangeKind, cmd: Cmd) -> ChangeEvent {
        ChangeEvent {
            kind,
            value: (!matches!(kind, ChangeKind::Deleted | ChangeKind::SubtreeDeleted)).then(|| json!(1)),
            cmd,
            revision: 1,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_conf_scope_delete_is_one_prefix_delete() {
        let scope = key("g1", "d1").conf_scope();
        let ops = persist_ops(&[
            event(ChangeKind::Deleted, key("g1", "d1")),
            event(ChangeKind::Deleted, key("g2", "d1")),
            event(ChangeKind::SubtreeDeleted, scope.clone()),
        ]);

        assert_eq!(ops.len(), 1);
        match &ops[0] {
            PersistOp::Delete { prefix, suffix } => {
                assert_eq!(*prefix, encode_prefix(&scope));
                assert!(suffix.is_none());
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn test_group_scope_delete_is_per_entry() {
        let scope = key("g1", "d1").to_builder().clear_data().clear_version().build().unwrap();
        let ops = persist_ops(&[
            event(ChangeKind::Deleted, key("g1", "d1")),
            event(ChangeKind::Deleted, key("g1", "d2")),
            event(ChangeKind::SubtreeDeleted, scope),
        ]);

        assert_eq!(ops.len(), 2);
        assert!(ops
            .iter()
            .all(|op| matches!(op, PersistOp::Delete { suffix: Some(_), .. })));
    }

    #[test]
    fn test_writes_carry_value() {
        let ops = persist_ops(&[event(ChangeKind::Created, key("g1", "d1"))]);
        match &ops[0] {
            PersistOp::Write { suffix, value, .. } => {
                assert_eq!(*suffix, encode_suffix(&key("g1", "d1")));
                assert_eq!(*value, json!(1));
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }

    const URL: &str = "zookeeper://127.0.0.1:2181/mconf?node=n1&app=a1&env=e1&conf=c1";

    fn settings(follow_remote: bool) -> MconfSettings {
        MconfSettings {
            follow_remote,
            ..MconfSettings::default()
        }
    }

    #[tokio::test]
    async fn test_no_echo_tracking_without_follow() {
        let center = Mconf::connect_in_memory(URL, settings(false)).await.unwrap();
        assert!(center.echoes.is_none());

        for n in 0..50 {
            center.add_conf(&key("g1", &format!("d{n}")), &n).await.unwrap();
        }
        center.flush().await.unwrap();

        assert!(center.echoes.is_none());
        assert_eq!(center.statistics().await.persisted, 50);
    }

    #[tokio::test]
    async fn test_echoes_consumed_when_following() {
        let center = Mconf::connect_in_memory(URL, settings(true)).await.unwrap();
        let echoes = center.echoes.clone().unwrap();

        for n in 0..50 {
            center.add_conf(&key("g1", &format!("d{n}")), &n).await.unwrap();
        }
        center.del_conf(&key("g1", "d0")).await.unwrap();
        center.flush().await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !echoes.is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(center.statistics().await.remote_changes, 0);
    }
}
