//! Per-resource async locks keyed by VNI or interface name.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

type LockMap<K> = Arc<Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>>;

fn lock_map<K>(locks: &LockMap<K>) -> std::sync::MutexGuard<'_, HashMap<K, Arc<tokio::sync::Mutex<()>>>> {
    match locks.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One async mutex per key, created on first use and dropped with the last
/// guard.
///
/// Operations on the same key are strictly ordered while unrelated keys
/// proceed concurrently. The guard is released on drop, including when the
/// holder's future is cancelled or times out.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: LockMap<K>,
}

impl<K> Clone for KeyedLocks<K> {
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
        }
    }
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &K) -> KeyedGuard<K> {
        let entry = lock_map(&self.locks)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        KeyedGuard {
            _guard: entry.lock_owned().await,
            key: key.clone(),
            locks: self.locks.clone(),
        }
    }

    /// Number of keys currently locked or waited on.
    pub fn len(&self) -> usize {
        lock_map(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held lock on one key of a [`KeyedLocks`].
pub struct KeyedGuard<K: Eq + Hash> {
    _guard: OwnedMutexGuard<()>,
    key: K,
    locks: LockMap<K>,
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        let mut locks = lock_map(&self.locks);
        // Only the map and this guard reference the mutex: nobody is waiting
        let idle = locks
            .get(&self.key)
            .is_some_and(|entry| Arc::strong_count(entry) <= 2);
        if idle {
            locks.remove(&self.key);
        }
    }
}
