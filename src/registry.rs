//! Registry of live forwarded connections.
//!
//! The registry is the only state shared between connection tasks. Every
//! mutation happens under a single lock that is never held across I/O.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Identifier of a forwarded connection, unique for a tunnel's lifetime.
pub type ConnectionId = u64;

struct Slots<T> {
    entries: HashMap<ConnectionId, T>,
    /// Set by `drain`; a closed registry refuses new entries.
    closed: bool,
}

/// Thread-safe map from connection id to connection entry.
pub struct ConnectionRegistry<T> {
    slots: Mutex<Slots<T>>,
}

impl<T> Default for ConnectionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConnectionRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        // Each mutation is a single map operation, so a poisoned lock still guards a consistent map.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an entry. Gives the entry back if the registry is closed or
    /// the id is already taken.
    pub fn insert(&self, id: ConnectionId, entry: T) -> Result<(), T> {
        let mut slots = self.lock();
        if slots.closed || slots.entries.contains_key(&id) {
            return Err(entry);
        }
        slots.entries.insert(id, entry);
        Ok(())
    }

    /// Build and insert an entry atomically.
    ///
    /// `make` runs under the registry lock and only if the entry will be
    /// accepted, so it must not block. Returns false when the registry
    /// refused the id; `make` is then dropped without being called.
    pub fn insert_with(&self, id: ConnectionId, make: impl FnOnce() -> T) -> bool {
        let mut slots = self.lock();
        if slots.closed || slots.entries.contains_key(&id) {
            return false;
        }
        let entry = make();
        slots.entries.insert(id, entry);
        true
    }

    /// Remove an entry. Removing a missing id is a no-op.
    pub fn remove(&self, id: ConnectionId) -> Option<T> {
        self.lock().entries.remove(&id)
    }

    /// Remove every entry and close the registry to new inserts.
    pub fn drain(&self) -> Vec<(ConnectionId, T)> {
        let mut slots = self.lock();
        slots.closed = true;
        let mut drained: Vec<_> = slots.entries.drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Ids of live entries in ascending order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.lock().entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
