//! Per-key mutual exclusion for work done outside the store lock.
//!
//! Cascade steps plan and commit under the store's upgradable lock, which
//! already serializes them. Replaying a journaled event calls an external
//! gateway before the event is settled, so concurrent replays of one event
//! are serialized here instead.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

#[derive(Debug)]
pub struct KeyLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash> Default for KeyLocks<K> {
    fn default() -> Self {
        Self { locks: DashMap::new() }
    }
}

impl<K: Eq + Hash + Clone> KeyLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`.
    pub fn with_lock<T>(&self, key: &K, f: impl FnOnce() -> T) -> T {
        // Clone the Arc out so the map shard is not held while `f` runs.
        let lock = self.locks.entry(key.clone()).or_default().clone();
        let _guard = lock.lock();
        f()
    }

    /// Drop the lock for `key` once nobody holds or waits on it.
    pub fn release(&self, key: &K) {
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
