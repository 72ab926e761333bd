//! u64 value set used for address/pid bookkeeping during walks.

use fnv::FnvHashSet;
use spin::Mutex;

pub struct ObSet {
    inner: Mutex<FnvHashSet<u64>>,
}

impl Default for ObSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ObSet {
    pub fn new() -> Self {
        Self { inner: Mutex::new(FnvHashSet::default()) }
    }

    /// Insert; false when the value was already present. The usual idiom in
    /// list walks: refuse to revisit an address already seen.
    pub fn push(&self, value: u64) -> bool {
        self.inner.lock().insert(value)
    }

    pub fn exists(&self, value: u64) -> bool {
        self.inner.lock().contains(&value)
    }

    pub fn remove(&self, value: u64) -> bool {
        self.inner.lock().remove(&value)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<u64> {
        self.inner.lock().iter().copied().collect()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_guard_idiom() {
        let seen = ObSet::new();
        assert!(seen.push(0xfffff800_00001000));
        assert!(seen.push(0xfffff800_00002000));
        assert!(!seen.push(0xfffff800_00001000), "revisit refused");
        assert_eq!(seen.len(), 2);
        assert!(seen.exists(0xfffff800_00002000));
        seen.clear();
        assert!(seen.is_empty());
    }
}
