//! Resource lock table.
//!
//! Maps each resource key (devpath) with an in-flight worker to the record
//! holding it. This table is the only mutual exclusion between events; a key
//! absent from it is assumed to have no running worker.

use std::collections::HashMap;

use thiserror::Error;

use crate::event::EventId;

/// Attempt to lock a key that is already held.
///
/// The dispatcher checks the table before acquiring, so this only surfaces
/// on a broken invariant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("resource '{key}' is already locked by {holder}")]
pub struct LockConflict {
    /// The contended resource key.
    pub key: String,
    /// The current holder.
    pub holder: EventId,
}

/// Resource key to lock-holding record.
#[derive(Debug, Default)]
pub struct ResourceLockTable {
    held: HashMap<String, EventId>,
}

impl ResourceLockTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record holding `key`, if any.
    #[must_use]
    pub fn holder(&self, key: &str) -> Option<EventId> {
        self.held.get(key).copied()
    }

    /// Locks `key` for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`LockConflict`] if another record already holds the key.
    pub fn acquire(&mut self, key: &str, id: EventId) -> Result<(), LockConflict> {
        if let Some(holder) = self.holder(key) {
            return Err(LockConflict {
                key: key.to_owned(),
                holder,
            });
        }
        self.held.insert(key.to_owned(), id);
        Ok(())
    }

    /// Releases `key` if `id` holds it. Returns whether anything was released.
    pub fn release(&mut self, key: &str, id: EventId) -> bool {
        if self.holder(key) == Some(id) {
            self.held.remove(key);
            true
        } else {
            false
        }
    }

    /// Returns all current lock holders, in no particular order.
    pub fn holders(&self) -> impl Iterator<Item = EventId> + '_ {
        self.held.values().copied()
    }

    /// Returns the number of held locks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// Returns `true` if no key is locked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
