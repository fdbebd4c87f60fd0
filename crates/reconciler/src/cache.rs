//! Pre-update snapshots awaiting a successful reconcile.
//!
//! When a specification changes, the snapshot from before the change is
//! stored here so the next reconcile can retract the stale fragment before
//! applying the fresh one. Entries are last-write-wins: a second update
//! before the key is reconciled replaces the first snapshot.
//!
//! The final snapshot of a deleted specification is held in a separate slot.
//! Completing an update never clears it; only the deletion reconcile does.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use vsmerger_core::{ObjectKey, Specification};

#[derive(Debug, Clone, Default, PartialEq)]
struct Entry {
    previous: Option<Specification>,
    deleted: Option<Specification>,
}

impl Entry {
    const fn is_empty(&self) -> bool {
        self.previous.is_none() && self.deleted.is_none()
    }
}

/// Shared, concurrency-safe snapshot cache.
///
/// Clones share the same backing map.
#[derive(Debug, Clone, Default)]
pub struct ChangeCache {
    entries: Arc<Mutex<HashMap<ObjectKey, Entry>>>,
}

impl ChangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ObjectKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store the pre-update snapshot for `key`, replacing any unconsumed one.
    ///
    /// Returns the replaced snapshot.
    pub fn put(&self, key: ObjectKey, snapshot: Specification) -> Option<Specification> {
        self.entries().entry(key).or_default().previous.replace(snapshot)
    }

    /// Store the final snapshot of a deleted specification.
    pub fn record_deletion(&self, key: ObjectKey, snapshot: Specification) {
        self.entries().entry(key).or_default().deleted = Some(snapshot);
    }

    /// Non-destructive read of the pre-update snapshot for `key`.
    pub fn get(&self, key: &ObjectKey) -> Option<Specification> {
        self.entries().get(key).and_then(|e| e.previous.clone())
    }

    /// Non-destructive read of the deletion snapshot for `key`.
    pub fn deleted(&self, key: &ObjectKey) -> Option<Specification> {
        self.entries().get(key).and_then(|e| e.deleted.clone())
    }

    /// Remove both snapshots for `key` unconditionally.
    ///
    /// Returns the pre-update snapshot, if any.
    pub fn delete(&self, key: &ObjectKey) -> Option<Specification> {
        self.entries().remove(key).and_then(|e| e.previous)
    }

    /// Clear the pre-update snapshot if it is still the one a reconcile
    /// consumed.
    ///
    /// A snapshot stored after the reconcile read the cache was not consumed
    /// and is kept, as is any deletion snapshot. Returns whether a snapshot
    /// was cleared.
    pub fn complete(&self, key: &ObjectKey, consumed: Option<&Specification>) -> bool {
        self.clear_slot(key, consumed, |e| &mut e.previous)
    }

    /// Clear the deletion snapshot if it is still the one that was retracted.
    pub fn complete_deletion(&self, key: &ObjectKey, retracted: Option<&Specification>) -> bool {
        self.clear_slot(key, retracted, |e| &mut e.deleted)
    }

    fn clear_slot(
        &self,
        key: &ObjectKey,
        consumed: Option<&Specification>,
        slot: impl Fn(&mut Entry) -> &mut Option<Specification>,
    ) -> bool {
        let Some(consumed) = consumed else {
            return false;
        };
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        let target = slot(entry);
        if target.as_ref() != Some(consumed) {
            return false;
        }
        *target = None;
        if entry.is_empty() {
            entries.remove(key);
        }
        true
    }

    /// Number of keys holding any snapshot.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries().clear();
    }
}
