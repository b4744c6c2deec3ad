//! Client registry
//!
//! The only state shared between sessions: a map from username to the
//! connection that claimed it. Mutations are serialized by a mutex that is
//! never held across an `.await`; readers take a [`Snapshot`] and release the
//! lock before doing any I/O.

use std::collections::btree_map::{BTreeMap, Entry};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::connection::ConnectionHandle;

/// Shared username → connection map
///
/// Cloning yields another reference to the same registry.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    clients: Arc<Mutex<BTreeMap<String, ConnectionHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn clients(&self) -> MutexGuard<'_, BTreeMap<String, ConnectionHandle>> {
        // Every critical section is a single map operation, so a poisoned
        // lock still guards a consistent map.
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `handle` under `name` if the name is free.
    ///
    /// Returns whether the insertion happened. Among concurrent callers
    /// using the same name exactly one succeeds.
    pub fn register(&self, name: &str, handle: ConnectionHandle) -> bool {
        match self.clients().entry(name.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Remove `name` if present. Removing an absent name is a no-op.
    ///
    /// Returns whether an entry was removed.
    pub fn unregister(&self, name: &str) -> bool {
        self.clients().remove(name).is_some()
    }

    /// Point-in-time copy of all entries, sorted by name
    pub fn snapshot(&self) -> Snapshot {
        let entries = self
            .clients()
            .iter()
            .map(|(name, handle)| (name.clone(), handle.clone()))
            .collect();
        Snapshot { entries }
    }

    /// Registered names in lexicographic order
    pub fn names_sorted(&self) -> Vec<String> {
        self.clients().keys().cloned().collect()
    }

    /// Connection currently registered under `name`
    pub fn get(&self, name: &str) -> Option<ConnectionHandle> {
        self.clients().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.clients().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients().is_empty()
    }
}

/// Copied view of the registry, safe to iterate while it keeps changing
///
/// Entries are sorted by name, which fixes broadcast order.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: Vec<(String, ConnectionHandle)>,
}

impl Snapshot {
    /// Names in the snapshot, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Handle registered under `name` at snapshot time
    pub fn get(&self, name: &str) -> Option<&ConnectionHandle> {
        self.entries
            .binary_search_by(|(entry, _)| entry.as_str().cmp(name))
            .ok()
            .map(|idx| &self.entries[idx].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConnectionHandle)> + '_ {
        self.entries
            .iter()
            .map(|(name, handle)| (name.as_str(), handle))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
