//! Process-wide window state, one entry per `(endpoint class, client)` pair.
//!
//! Backed by a sharded concurrent map. Every read-modify-write goes through
//! [`WindowStore::update`], which holds the shard lock for the whole closure, so
//! two requests for the same key can never interleave their updates.

use crate::policy::EndpointClass;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

/// Map key: the endpoint class and the resolved client identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    /// Endpoint class the request was tagged with.
    pub class: EndpointClass,
    /// Resolved client identifier.
    pub client_id: String,
}

impl WindowKey {
    /// Build a key.
    pub fn new(class: EndpointClass, client_id: impl Into<String>) -> Self {
        Self { class, client_id: client_id.into() }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.client_id)
    }
}

/// Counter and block state for one key. Times are epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    /// Requests counted in the current window, including over-quota ones.
    pub request_count: u32,
    /// When the counter resets.
    pub window_reset_at: u64,
    /// Set while the client is (or was, until swept) blocked.
    pub blocked_until: Option<u64>,
}

impl WindowEntry {
    /// A fresh window opening at `now`.
    pub fn fresh(now: u64, window_millis: u64) -> Self {
        Self { request_count: 0, window_reset_at: now.saturating_add(window_millis), blocked_until: None }
    }

    /// Whether a block has been recorded.
    pub fn is_blocked(&self) -> bool {
        self.blocked_until.is_some()
    }

    /// Whether the recorded block is still in force at `now`.
    pub fn is_blocked_at(&self, now: u64) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }

    /// Whether the counting window has ended at `now`.
    pub fn window_expired_at(&self, now: u64) -> bool {
        self.window_reset_at <= now
    }

    /// Eviction predicate: unblocked with an elapsed window, or blocked with an
    /// elapsed block.
    pub fn is_stale_at(&self, now: u64) -> bool {
        match self.blocked_until {
            None => self.window_reset_at < now,
            Some(until) => until < now,
        }
    }
}

/// Concurrent `(class, client) -> WindowEntry` map. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct WindowStore {
    entries: Arc<DashMap<WindowKey, WindowEntry>>,
}

impl WindowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the entry for `key`.
    pub fn get(&self, key: &WindowKey) -> Option<WindowEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    /// Insert or replace the entry for `key`, returning the previous one.
    pub fn upsert(&self, key: WindowKey, entry: WindowEntry) -> Option<WindowEntry> {
        self.entries.insert(key, entry)
    }

    /// Delete the entry for `key`.
    pub fn remove(&self, key: &WindowKey) -> Option<WindowEntry> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    /// Atomically read-modify-write the entry for `key`.
    ///
    /// `f` receives `None` when the key is absent; leaving `None` in the slot
    /// deletes the entry. The shard lock is held until `f` returns.
    pub fn update<F, R>(&self, key: WindowKey, f: F) -> R
    where
        F: FnOnce(&mut Option<WindowEntry>) -> R,
    {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let mut slot = Some(*occupied.get());
                let result = f(&mut slot);
                match slot {
                    Some(entry) => *occupied.get_mut() = entry,
                    None => {
                        occupied.remove();
                    }
                }
                result
            }
            Entry::Vacant(vacant) => {
                let mut slot = None;
                let result = f(&mut slot);
                if let Some(entry) = slot {
                    vacant.insert(entry);
                }
                result
            }
        }
    }

    /// Delete the entry for `key` only if it is stale at `now`, checked under
    /// the shard lock.
    pub fn remove_if_stale(&self, key: &WindowKey, now: u64) -> bool {
        self.entries.remove_if(key, |_, entry| entry.is_stale_at(now)).is_some()
    }

    /// Keep only entries for which `keep` returns true. Returns the number removed.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&WindowKey, &WindowEntry) -> bool,
    {
        let mut removed = 0;
        self.entries.retain(|key, entry| {
            let kept = keep(key, entry);
            removed += usize::from(!kept);
            kept
        });
        removed
    }

    /// Point-in-time copy of every entry.
    pub fn snapshot(&self) -> Vec<(WindowKey, WindowEntry)> {
        self.entries.iter().map(|item| (item.key().clone(), *item.value())).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
