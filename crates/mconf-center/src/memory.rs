//! In-memory backing stores.
//!
//! `MemoryTreeStore` keeps one entry per tree path, `MemoryMapStore` keeps
//! one hash per prefix key. Both are cheap to clone and clones share state,
//! so several centers can be connected to the same store. Availability can
//! be toggled and write failures injected to exercise retry handling.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{broadcast, Notify};

use mconf_core::key;
use mconf_core::{PrefixKey, StoreLayout, SuffixKey};

use crate::adapter::{BackingStore, StoreError, StoreEvent, StoreWatcher};

/// Change events buffered per watcher before it starts lagging.
pub const EVENT_CAPACITY: usize = 1024;

/// Availability switch and failure injection shared by both stores.
struct Health {
    available: AtomicBool,
    failing_writes: AtomicU32,
    online: Notify,
    events: broadcast::Sender<StoreEvent>,
}

impl Health {
    fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            available: AtomicBool::new(true),
            failing_writes: AtomicU32::new(0),
            online: Notify::new(),
            events,
        }
    }

    fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if available {
            self.online.notify_waiters();
        }
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn ready(&self) {
        loop {
            let online = self.online.notified();
            if self.is_available() {
                return;
            }
            online.await;
        }
    }

    /// Gate for mutating calls: fails while offline or while injected failures remain.
    fn check_write(&self) -> Result<(), StoreError> {
        if !self.is_available() {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store is offline".to_string()))
        }
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

/// Open an in-memory store for the given layout.
pub fn open(layout: StoreLayout) -> Arc<dyn BackingStore> {
    match layout {
        StoreLayout::Tree => Arc::new(MemoryTreeStore::new()),
        StoreLayout::Map => Arc::new(MemoryMapStore::new()),
    }
}

// ============================================================================
// Tree layout
// ============================================================================

/// ZooKeeper-like store: full tree path → value.
#[derive(Clone)]
pub struct MemoryTreeStore {
    paths: Arc<RwLock<BTreeMap<String, Value>>>,
    health: Arc<Health>,
}

impl MemoryTreeStore {
    pub fn new() -> Self {
        Self::with_event_capacity(EVENT_CAPACITY)
    }

    /// A store whose watchers buffer at most `capacity` events.
    pub fn with_event_capacity(capacity: usize) -> Self {
        Self {
            paths: Arc::new(RwLock::new(BTreeMap::new())),
            health: Arc::new(Health::new(capacity)),
        }
    }

    /// Take the store offline or bring it back.
    pub fn set_available(&self, available: bool) {
        self.health.set_available(available);
    }

    /// Make the next `count` writes or deletes fail with a transient error.
    pub fn fail_next_writes(&self, count: u32) {
        self.health.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Value stored at a tree path.
    pub fn get(&self, path: &str) -> Option<Value> {
        self.paths.read().get(path).cloned()
    }

    /// All stored paths, in order.
    pub fn paths(&self) -> Vec<String> {
        self.paths.read().keys().cloned().collect()
    }

    fn scope_path(prefix: &PrefixKey) -> Result<String, StoreError> {
        Ok(key::tree_path(prefix, &SuffixKey::from_raw(""))?)
    }
}

impl Default for MemoryTreeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackingStore for MemoryTreeStore {
    fn layout(&self) -> StoreLayout {
        StoreLayout::Tree
    }

    async fn ready(&self) -> Result<(), StoreError> {
        self.health.ready().await;
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.health.is_available()
    }

    async fn write(&self, prefix: &PrefixKey, suffix: &SuffixKey, value: &Value) -> Result<(), StoreError> {
        let path = key::tree_path(prefix, suffix)?;
        self.health.check_write()?;
        self.paths.write().insert(path, value.clone());
        self.health.emit(StoreEvent::Written {
            prefix: prefix.clone(),
            suffix: suffix.clone(),
            value: value.clone(),
        });
        Ok(())
    }

    async fn delete(&self, prefix: &PrefixKey, suffix: Option<&SuffixKey>) -> Result<(), StoreError> {
        let target = match suffix {
            Some(suffix) => key::tree_path(prefix, suffix)?,
            None => Self::scope_path(prefix)?,
        };
        self.health.check_write()?;
        {
            let mut paths = self.paths.write();
            let children = format!("{target}/");
            paths.retain(|path, _| path != &target && !path.starts_with(&children));
        }
        self.health.emit(StoreEvent::Removed {
            prefix: prefix.clone(),
            suffix: suffix.cloned(),
        });
        Ok(())
    }

    async fn read_all(&self, prefix: &PrefixKey) -> Result<Vec<(SuffixKey, Value)>, StoreError> {
        self.health.check_read()?;
        let children = format!("{}/", Self::scope_path(prefix)?);
        let paths = self.paths.read();
        paths
            .range(children.clone()..)
            .take_while(|(path, _)| path.starts_with(&children))
            .map(|(path, value)| -> Result<(SuffixKey, Value), StoreError> {
                let (_, suffix) = key::split_tree_path(path)?;
                Ok((suffix, value.clone()))
            })
            .collect()
    }

    async fn list_prefixes(&self) -> Result<Vec<PrefixKey>, StoreError> {
        self.health.check_read()?;
        let paths = self.paths.read();
        let mut prefixes = BTreeSet::new();
        for path in paths.keys() {
            let (prefix, _) = key::split_tree_path(path)?;
            prefixes.insert(prefix);
        }
        Ok(prefixes.into_iter().collect())
    }

    fn watch(&self, prefix: Option<&PrefixKey>) -> StoreWatcher {
        StoreWatcher::new(self.health.events.subscribe(), prefix.cloned())
    }
}

// ============================================================================
// Map layout
// ============================================================================

/// Redis-like store: prefix key → (suffix key → value).
#[derive(Clone)]
pub struct MemoryMapStore {
    hashes: Arc<RwLock<BTreeMap<PrefixKey, BTreeMap<SuffixKey, Value>>>>,
    health: Arc<Health>,
}

impl MemoryMapStore {
    pub fn new() -> Self {
        Self::with_event_capacity(EVENT_CAPACITY)
    }

    pub fn with_event_capacity(capacity: usize) -> Self {
        Self {
            hashes: Arc::new(RwLock::new(BTreeMap::new())),
            health: Arc::new(Health::new(capacity)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.health.set_available(available);
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.health.failing_writes.store(count, Ordering::SeqCst);
    }

    /// The hash stored under a prefix key.
    pub fn hash(&self, prefix: &PrefixKey) -> Option<BTreeMap<SuffixKey, Value>> {
        self.hashes.read().get(prefix).cloned()
    }
}

impl Default for MemoryMapStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackingStore for MemoryMapStore {
    fn layout(&self) -> StoreLayout {
        StoreLayout::Map
    }

    async fn ready(&self) -> Result<(), StoreError> {
        self.health.ready().await;
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.health.is_available()
    }

    async fn write(&self, prefix: &PrefixKey, suffix: &SuffixKey, value: &Value) -> Result<(), StoreError> {
        key::decode(prefix, suffix)?;
        self.health.check_write()?;
        self.hashes
            .write()
            .entry(prefix.clone())
            .or_default()
            .insert(suffix.clone(), value.clone());
        self.health.emit(StoreEvent::Written {
            prefix: prefix.clone(),
            suffix: suffix.clone(),
            value: value.clone(),
        });
        Ok(())
    }

    async fn delete(&self, prefix: &PrefixKey, suffix: Option<&SuffixKey>) -> Result<(), StoreError> {
        key::decode_prefix(prefix)?;
        self.health.check_write()?;
        {
            let mut hashes = self.hashes.write();
            match suffix {
                Some(suffix) => {
                    if let Some(hash) = hashes.get_mut(prefix) {
                        hash.remove(suffix);
                        if hash.is_empty() {
                            hashes.remove(prefix);
                        }
                    }
                }
                None => {
                    hashes.remove(prefix);
                }
            }
        }
        self.health.emit(StoreEvent::Removed {
            prefix: prefix.clone(),
            suffix: suffix.cloned(),
        });
        Ok(())
    }

    async fn read_all(&self, prefix: &PrefixKey) -> Result<Vec<(SuffixKey, Value)>, StoreError> {
        self.health.check_read()?;
        Ok(self
            .hashes
            .read()
            .get(prefix)
            .map(|hash| hash.iter().map(|(s, v)| (s.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn list_prefixes(&self) -> Result<Vec<PrefixKey>, StoreError> {
        self.health.check_read()?;
        Ok(self.hashes.read().keys().cloned().collect())
    }

    fn watch(&self, prefix: Option<&PrefixKey>) -> StoreWatcher {
        StoreWatcher::new(self.health.events.subscribe(), prefix.cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mconf_core::{Cmd, CmdBuilder};
    use serde_json::json;

    fn cmd(conf: &str, data: &str) -> Cmd {
        CmdBuilder::new()
            .node("n1")
            .app("a1")
            .env("e1")
            .conf(conf)
            .group("g1")
            .version("v1")
            .data(data)
            .build()
            .unwrap()
    }

    fn keys(cmd: &Cmd) -> (PrefixKey, SuffixKey) {
        (key::encode_prefix(cmd), key::encode_suffix(cmd))
    }

    #[tokio::test]
    async fn test_tree_store_layout() {
        let store = MemoryTreeStore::new();
        let (prefix, suffix) = keys(&cmd("c1", "d1"));

        store.write(&prefix, &suffix, &json!("x")).await.unwrap();

        assert_eq!(store.paths(), vec!["/mconf/a1/n1/e1/c1/g1/v1/d1".to_string()]);
        let read = store.read_all(&prefix).await.unwrap();
        assert_eq!(read, vec![(suffix, json!("x"))]);
    }

    #[tokio::test]
    async fn test_map_store_layout() {
        let store = MemoryMapStore::new();
        let (prefix, suffix) = keys(&cmd("c1", "d1"));

        store.write(&prefix, &suffix, &json!("x")).await.unwrap();

        let hash = store.hash(&prefix).unwrap();
        assert_eq!(hash.get(&suffix), Some(&json!("x")));
        assert_eq!(store.list_prefixes().await.unwrap(), vec![prefix]);
    }

    #[tokio::test]
    async fn test_tree_delete_prefix_keeps_similar_names() {
        let store = MemoryTreeStore::new();
        let (p1, s1) = keys(&cmd("c1", "d1"));
        let (p2, s2) = keys(&cmd("c10", "d1"));
        store.write(&p1, &s1, &json!(1)).await.unwrap();
        store.write(&p2, &s2, &json!(2)).await.unwrap();

        store.delete(&p1, None).await.unwrap();

        assert!(store.read_all(&p1).await.unwrap().is_empty());
        assert_eq!(store.read_all(&p2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_map_delete_single_suffix() {
        let store = MemoryMapStore::new();
        let (prefix, s1) = keys(&cmd("c1", "d1"));
        let (_, s2) = keys(&cmd("c1", "d2"));
        store.write(&prefix, &s1, &json!(1)).await.unwrap();
        store.write(&prefix, &s2, &json!(2)).await.unwrap();

        store.delete(&prefix, Some(&s1)).await.unwrap();
        assert_eq!(store.read_all(&prefix).await.unwrap(), vec![(s2.clone(), json!(2))]);

        store.delete(&prefix, Some(&s2)).await.unwrap();
        assert!(store.list_prefixes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_invalid_keys() {
        let store = MemoryMapStore::new();
        let err = store
            .write(&PrefixKey::from_raw("garbage"), &SuffixKey::from_raw(""), &json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Key(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_offline_and_injected_failures() {
        let store = MemoryTreeStore::new();
        let (prefix, suffix) = keys(&cmd("c1", "d1"));

        store.fail_next_writes(1);
        let err = store.write(&prefix, &suffix, &json!(1)).await.unwrap_err();
        assert!(err.is_transient());
        store.write(&prefix, &suffix, &json!(1)).await.unwrap();

        store.set_available(false);
        assert!(!store.is_available());
        assert!(store.read_all(&prefix).await.is_err());
        store.set_available(true);
        assert!(store.read_all(&prefix).await.is_ok());
    }

    #[tokio::test]
    async fn test_ready_waits_for_availability() {
        let store = MemoryMapStore::new();
        store.set_available(false);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.ready().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        store.set_available(true);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_watch_filters_by_prefix() {
        let store = MemoryTreeStore::new();
        let (p1, s1) = keys(&cmd("c1", "d1"));
        let (p2, s2) = keys(&cmd("c2", "d1"));
        let mut watcher = store.watch(Some(&p2));

        store.write(&p1, &s1, &json!(1)).await.unwrap();
        store.write(&p2, &s2, &json!(2)).await.unwrap();

        let event = watcher.next().await.unwrap().unwrap();
        assert_eq!(
            event,
            StoreEvent::Written {
                prefix: p2,
                suffix: s2,
                value: json!(2)
            }
        );
    }

    #[tokio::test]
    async fn test_slow_watcher_reports_lag() {
        let store = MemoryMapStore::with_event_capacity(2);
        let mut watcher = store.watch(None);

        for data in ["d1", "d2", "d3", "d4"] {
            let (prefix, suffix) = keys(&cmd("c1", data));
            store.write(&prefix, &suffix, &json!(data)).await.unwrap();
        }

        match watcher.next().await {
            Some(Err(StoreError::Lagged(missed))) => assert_eq!(missed, 2),
            other => panic!("expected lag, got {other:?}"),
        }
        assert!(matches!(watcher.next().await, Some(Ok(StoreEvent::Written { .. }))));
    }
}
