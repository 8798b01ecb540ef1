//! Configuration registry.
//!
//! The registry holds the authoritative in-memory view of every entry known
//! to one connected center. Each mutation returns the change events it
//! produced so the caller can dispatch and persist them.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;

use crate::error::{KeyError, MconfError, Result};
use crate::model::{ChangeEvent, ChangeKind, Cmd, Entry};

/// Trait for configuration registry implementations.
pub trait ConfStore: Send + Sync {
    /// Insert a new entry. Fails with `Conflict` if the key exists, unless
    /// `allow_overwrite` is set, in which case the entry is replaced.
    fn add_conf(&mut self, cmd: &Cmd, value: Value, allow_overwrite: bool) -> Result<Vec<ChangeEvent>>;

    /// Replace an existing entry. Fails with `NotFound` if absent.
    fn up_conf(&mut self, cmd: &Cmd, value: Value) -> Result<Vec<ChangeEvent>>;

    /// Remove one entry (`data` set) or every entry within the scope.
    fn del_conf(&mut self, cmd: &Cmd) -> Result<Vec<ChangeEvent>>;

    /// Exact lookup of a single entry.
    fn pull(&self, cmd: &Cmd) -> Result<&Entry>;

    /// All entries within the scope of `cmd`, in key order.
    fn pulls(&self, cmd: &Cmd) -> Vec<&Entry>;

    /// All entries, in key order.
    fn entries(&self) -> Vec<&Entry>;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Revision of the most recent mutation.
    fn revision(&self) -> u64;
}

/// In-memory registry keyed by full `Cmd`.
///
/// Keys are kept in a `BTreeMap`; since a scope sorts directly before the
/// keys it covers, scope queries are a single range scan.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    entries: BTreeMap<Cmd, Entry>,
    revision: u64,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load entries read from a backing store without emitting events.
    ///
    /// Keys without `data` are skipped. Returns the number of entries loaded.
    pub fn load<I>(&mut self, entries: I) -> usize
    where
        I: IntoIterator<Item = (Cmd, Value)>,
    {
        let mut loaded = 0;
        for (cmd, value) in entries {
            if !cmd.is_entry() {
                continue;
            }
            let revision = self.next_revision();
            let now = Utc::now();
            self.entries.insert(
                cmd.clone(),
                Entry {
                    cmd,
                    value,
                    revision,
                    created_at: now,
                    updated_at: now,
                },
            );
            loaded += 1;
        }
        loaded
    }

    /// Apply a write observed on the backing store (upsert semantics).
    ///
    /// Emits nothing if the stored value is already identical.
    pub fn apply_remote_put(&mut self, cmd: &Cmd, value: Value) -> Vec<ChangeEvent> {
        if !cmd.is_entry() {
            return Vec::new();
        }
        if let Some(existing) = self.entries.get(cmd) {
            if existing.value == value {
                return Vec::new();
            }
        }
        vec![self.upsert(cmd, value)]
    }

    /// Apply a removal observed on the backing store. Missing keys are ignored.
    pub fn apply_remote_delete(&mut self, cmd: &Cmd) -> Vec<ChangeEvent> {
        if cmd.is_entry() {
            return self.remove(cmd).into_iter().collect();
        }
        self.remove_scope(cmd)
    }

    /// Reconcile with a full read of the backing store.
    ///
    /// Every entry for which `admits` holds is replaced by the state in
    /// `stored`: missing keys are deleted, new or differing values are
    /// upserted. Entries outside `admits` are left alone.
    pub fn resync<F>(&mut self, admits: F, stored: Vec<(Cmd, Value)>) -> Vec<ChangeEvent>
    where
        F: Fn(&Cmd) -> bool,
    {
        let stored: BTreeMap<Cmd, Value> = stored
            .into_iter()
            .filter(|(cmd, _)| cmd.is_entry() && admits(cmd))
            .collect();

        let stale: Vec<Cmd> = self
            .entries
            .keys()
            .filter(|cmd| admits(cmd) && !stored.contains_key(*cmd))
            .cloned()
            .collect();

        let mut events: Vec<ChangeEvent> = stale.iter().filter_map(|cmd| self.remove(cmd)).collect();
        for (cmd, value) in stored {
            events.extend(self.apply_remote_put(&cmd, value));
        }
        events
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn scan<'a>(&'a self, scope: &Cmd) -> impl Iterator<Item = &'a Entry> + 'a {
        let scope = scope.clone();
        self.entries
            .range(scope.clone()..)
            .take_while(move |(key, _)| scope.covers(key))
            .map(|(_, entry)| entry)
    }

    fn upsert(&mut self, cmd: &Cmd, value: Value) -> ChangeEvent {
        let revision = self.next_revision();
        let now = Utc::now();

        let kind = match self.entries.get_mut(cmd) {
            Some(entry) => {
                entry.value = value.clone();
                entry.revision = revision;
                entry.updated_at = now;
                ChangeKind::Updated
            }
            None => {
                self.entries.insert(
                    cmd.clone(),
                    Entry {
                        cmd: cmd.clone(),
                        value: value.clone(),
                        revision,
                        created_at: now,
                        updated_at: now,
                    },
                );
                ChangeKind::Created
            }
        };

        ChangeEvent {
            kind,
            cmd: cmd.clone(),
            value: Some(value),
            revision,
            timestamp: now,
        }
    }

    fn remove(&mut self, cmd: &Cmd) -> Option<ChangeEvent> {
        self.entries.remove(cmd)?;
        Some(ChangeEvent {
            kind: ChangeKind::Deleted,
            cmd: cmd.clone(),
            value: None,
            revision: self.next_revision(),
            timestamp: Utc::now(),
        })
    }

    /// Remove every entry within `scope`: one `Deleted` per entry followed by
    /// one `SubtreeDeleted`. Empty if nothing was in scope.
    fn remove_scope(&mut self, scope: &Cmd) -> Vec<ChangeEvent> {
        let keys: Vec<Cmd> = self.scan(scope).map(|entry| entry.cmd.clone()).collect();
        if keys.is_empty() {
            return Vec::new();
        }

        let mut events: Vec<ChangeEvent> = keys.iter().filter_map(|key| self.remove(key)).collect();
        events.push(ChangeEvent {
            kind: ChangeKind::SubtreeDeleted,
            cmd: scope.clone(),
            value: None,
            revision: self.next_revision(),
            timestamp: Utc::now(),
        });
        events
    }
}

fn require_entry(cmd: &Cmd) -> Result<()> {
    if cmd.is_entry() {
        Ok(())
    } else {
        Err(MconfError::InvalidKey(KeyError::MissingSegment("data")))
    }
}

impl ConfStore for MemoryRegistry {
    fn add_conf(&mut self, cmd: &Cmd, value: Value, allow_overwrite: bool) -> Result<Vec<ChangeEvent>> {
        require_entry(cmd)?;
        if !allow_overwrite && self.entries.contains_key(cmd) {
            return Err(MconfError::Conflict(cmd.to_string()));
        }
        Ok(vec![self.upsert(cmd, value)])
    }

    fn up_conf(&mut self, cmd: &Cmd, value: Value) -> Result<Vec<ChangeEvent>> {
        require_entry(cmd)?;
        if !self.entries.contains_key(cmd) {
            return Err(MconfError::NotFound(cmd.to_string()));
        }
        Ok(vec![self.upsert(cmd, value)])
    }

    fn del_conf(&mut self, cmd: &Cmd) -> Result<Vec<ChangeEvent>> {
        if cmd.is_entry() {
            return self
                .remove(cmd)
                .map(|event| vec![event])
                .ok_or_else(|| MconfError::NotFound(cmd.to_string()));
        }
        Ok(self.remove_scope(cmd))
    }

    fn pull(&self, cmd: &Cmd) -> Result<&Entry> {
        require_entry(cmd)?;
        self.entries
            .get(cmd)
            .ok_or_else(|| MconfError::NotFound(cmd.to_string()))
    }

    fn pulls(&self, cmd: &Cmd) -> Vec<&Entry> {
        self.scan(cmd).collect()
    }

    fn entries(&self) -> Vec<&Entry> {
        self.entries.values().collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn revision(&self) -> u64 {
        self.revision
    }
}
