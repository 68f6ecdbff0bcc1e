//! Session store: the session cache keyed by session id.

use std::collections::HashMap;
use std::time::Instant;

use thiserror::Error;

use super::entry::SessionEntry;

/// Errors from session store operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A live entry already uses this id
    #[error("session {id} already exists{}", if *.lingering { " (lingering)" } else { "" })]
    Collision {
        /// Colliding id
        id: String,
        /// Whether the live entry may be evicted by the caller
        lingering: bool,
    },
}

/// Session cache. Not synchronized; the session service wraps it.
#[derive(Debug, Default)]
pub struct SessionStore {
    entries: HashMap<String, SessionEntry>,
}

impl SessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `entry`. A dead entry under the same id is replaced; a live
    /// one is a collision.
    pub fn insert_at(&mut self, entry: SessionEntry, now: Instant) -> Result<(), StoreError> {
        if let Some(existing) = self.entries.get(entry.id()) {
            if !existing.is_expired_at(now) {
                return Err(StoreError::Collision {
                    id: entry.id().to_string(),
                    lingering: existing.lingers(),
                });
            }
        }
        self.entries.insert(entry.id().to_string(), entry);
        Ok(())
    }

    /// [`SessionStore::insert_at`] with the current time
    pub fn insert(&mut self, entry: SessionEntry) -> Result<(), StoreError> {
        self.insert_at(entry, Instant::now())
    }

    /// Live entry for `id`. A dead entry is evicted and `None` returned.
    pub fn lookup_at(&mut self, id: &str, now: Instant) -> Option<&mut SessionEntry> {
        if self
            .entries
            .get(id)
            .is_some_and(|entry| entry.is_expired_at(now))
        {
            self.entries.remove(id);
            tracing::debug!(session_id = id, "evicted expired session on lookup");
            return None;
        }
        self.entries.get_mut(id)
    }

    /// [`SessionStore::lookup_at`] with the current time
    pub fn lookup(&mut self, id: &str) -> Option<&mut SessionEntry> {
        self.lookup_at(id, Instant::now())
    }

    /// Entry for `id` without expiry checks
    pub fn peek(&self, id: &str) -> Option<&SessionEntry> {
        self.entries.get(id)
    }

    /// Remove one session
    pub fn invalidate(&mut self, id: &str) -> Option<SessionEntry> {
        self.entries.remove(id)
    }

    /// Remove every session bound to `peer`
    pub fn invalidate_by_peer(&mut self, peer: &str) -> Vec<SessionEntry> {
        self.drain_where(|entry| entry.bound_peer() == Some(peer))
    }

    /// Remove every session created by the process `(owner_id, pid)`
    pub fn invalidate_by_owner(&mut self, owner_id: &str, pid: i64) -> Vec<SessionEntry> {
        self.drain_where(|entry| {
            entry.owner_unique_id() == Some(owner_id) && entry.server_pid() == Some(pid)
        })
    }

    /// Remove every dead entry in one pass; returns the removed entries
    pub fn sweep_expired_at(&mut self, now: Instant) -> Vec<SessionEntry> {
        self.drain_where(|entry| entry.is_expired_at(now))
    }

    /// [`SessionStore::sweep_expired_at`] with the current time
    pub fn sweep_expired(&mut self) -> Vec<SessionEntry> {
        self.sweep_expired_at(Instant::now())
    }

    /// Remove everything
    pub fn clear(&mut self) -> Vec<SessionEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    fn drain_where(&mut self, pred: impl Fn(&SessionEntry) -> bool) -> Vec<SessionEntry> {
        let ids: Vec<String> = self
            .entries
            .values()
            .filter(|entry| pred(entry))
            .map(|entry| entry.id().to_string())
            .collect();
        ids.iter()
            .filter_map(|id| self.entries.remove(id))
            .collect()
    }

    /// Number of entries (including not-yet-swept dead ones)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all entries
    pub fn iter(&self) -> impl Iterator<Item = &SessionEntry> {
        self.entries.values()
    }
}
