//! Backing store abstraction.
//!
//! A backing store persists entries in one of the two physical layouts and
//! reports changes made to it. Implementations exist for ZooKeeper-like
//! tree stores and Redis-like map stores; this crate ships in-memory
//! versions of both (see `memory`).
//!
//! All keys cross this boundary in map-layout form (`PrefixKey`,
//! `SuffixKey`); tree stores convert with `mconf_core::key::tree_path`.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

use mconf_core::{KeyError, PrefixKey, StoreLayout, SuffixKey};

/// Errors reported by a backing store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store cannot be reached right now.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer in time.
    #[error("Store operation timed out")]
    Timeout,

    /// The store rejected the operation.
    #[error("Store error: {0}")]
    Backend(String),

    /// A key read from or passed to the store is not valid.
    #[error("Invalid store key: {0}")]
    Key(#[from] KeyError),

    /// A watcher fell behind and missed this many events.
    #[error("Store watch lagged, {0} events missed")]
    Lagged(u64),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout)
    }
}

/// A change observed on the backing store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A value was written at `prefix` + `suffix`.
    Written {
        prefix: PrefixKey,
        suffix: SuffixKey,
        value: Value,
    },
    /// A single suffix, or the whole prefix when `suffix` is `None`, was removed.
    Removed {
        prefix: PrefixKey,
        suffix: Option<SuffixKey>,
    },
}

impl StoreEvent {
    pub fn prefix(&self) -> &PrefixKey {
        match self {
            StoreEvent::Written { prefix, .. } | StoreEvent::Removed { prefix, .. } => prefix,
        }
    }
}

/// Trait for backing store adapters.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// The physical layout this store uses.
    fn layout(&self) -> StoreLayout;

    /// Resolve once the store is ready to serve requests.
    async fn ready(&self) -> Result<(), StoreError>;

    /// Current connectivity. Must not block.
    fn is_available(&self) -> bool;

    /// Write one value.
    async fn write(&self, prefix: &PrefixKey, suffix: &SuffixKey, value: &Value) -> Result<(), StoreError>;

    /// Delete one suffix, or everything under `prefix` when `suffix` is `None`.
    async fn delete(&self, prefix: &PrefixKey, suffix: Option<&SuffixKey>) -> Result<(), StoreError>;

    /// Read every suffix and value stored under `prefix`.
    async fn read_all(&self, prefix: &PrefixKey) -> Result<Vec<(SuffixKey, Value)>, StoreError>;

    /// List every prefix that currently holds at least one value.
    async fn list_prefixes(&self) -> Result<Vec<PrefixKey>, StoreError>;

    /// Watch changes under `prefix`, or under every prefix when `None`.
    ///
    /// Every successful `write` or `delete` produces exactly one event, also
    /// for watchers created by the writer itself.
    fn watch(&self, prefix: Option<&PrefixKey>) -> StoreWatcher;
}

/// Receiver side of a store watch, filtered to one prefix.
pub struct StoreWatcher {
    rx: broadcast::Receiver<StoreEvent>,
    prefix: Option<PrefixKey>,
}

impl StoreWatcher {
    pub fn new(rx: broadcast::Receiver<StoreEvent>, prefix: Option<PrefixKey>) -> Self {
        Self { rx, prefix }
    }

    /// Wait for the next matching event. Returns `None` once the store is gone.
    ///
    /// `Some(Err(StoreError::Lagged(_)))` means events were missed; the
    /// caller has to reread the store to catch up.
    pub async fn next(&mut self) -> Option<Result<StoreEvent, StoreError>> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.prefix.as_ref().map_or(true, |p| p == event.prefix()) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Store watcher lagged {} events", n);
                    return Some(Err(StoreError::Lagged(n)));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
