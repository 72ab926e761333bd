//! u64-keyed reference counted map.

use super::Ob;
use fnv::FnvHashMap;
use spin::Mutex;

/// Map from u64 keys to [`Ob`] objects. Insertion takes a reference,
/// removal releases it. The lock is short-held; no callbacks run under it.
pub struct ObMap<T> {
    inner: Mutex<FnvHashMap<u64, Ob<T>>>,
}

impl<T> Default for ObMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObMap<T> {
    pub fn new() -> Self {
        Self { inner: Mutex::new(FnvHashMap::default()) }
    }

    /// Insert unless the key already exists.
    pub fn push(&self, key: u64, ob: Ob<T>) -> bool {
        let mut m = self.inner.lock();
        if m.contains_key(&key) {
            return false;
        }
        m.insert(key, ob);
        true
    }

    pub fn get(&self, key: u64) -> Option<Ob<T>> {
        self.inner.lock().get(&key).cloned()
    }

    pub fn exists(&self, key: u64) -> bool {
        self.inner.lock().contains_key(&key)
    }

    /// Remove and return; the returned reference is the caller's to drop.
    pub fn remove(&self, key: u64) -> Option<Ob<T>> {
        self.inner.lock().remove(&key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Snapshot of current members for iteration outside the lock.
    pub fn snapshot(&self) -> Vec<(u64, Ob<T>)> {
        self.inner.lock().iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    /// Drop all members.
    pub fn clear(&self) {
        let drained: Vec<Ob<T>> = {
            let mut m = self.inner.lock();
            m.drain().map(|(_, v)| v).collect()
        };
        drop(drained);
    }
}
