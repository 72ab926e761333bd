//! Bounded set-associative page cache with generation filtering.
//!
//! Two instances exist per handle: the physical read cache and the cache of
//! validated page-table pages. Both are read-through and write-invalidate.
//! A refresh tick bumps the generation; stale lines are treated as absent at
//! lookup time, so a tick is O(1) and full eviction is never required.

use crate::mem::{PAGE_SHIFT, PAGE_SIZE};
use spin::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sets in the physical read cache (pages cached = sets * ways).
pub const PHYS_CACHE_SETS: usize = 0x400;
/// Sets in the page-table cache.
pub const TLB_CACHE_SETS: usize = 0x200;
pub const CACHE_WAYS: usize = 4;

struct CacheLine {
    pa: u64,
    generation: u64,
    valid: bool,
    lru: u64,
    data: Arc<[u8; PAGE_SIZE]>,
}

struct CacheSet {
    lines: Vec<CacheLine>,
    lru_clock: u64,
}

pub struct PageCache {
    sets: Vec<Mutex<CacheSet>>,
    generation: AtomicU64,
    set_mask: u64,
}

impl PageCache {
    /// `nsets` must be a power of two (indexing is by low-order page bits).
    pub fn new(nsets: usize, ways: usize) -> Self {
        assert!(nsets.is_power_of_two());
        let empty = Arc::new([0u8; PAGE_SIZE]);
        let sets = (0..nsets)
            .map(|_| {
                Mutex::new(CacheSet {
                    lines: (0..ways)
                        .map(|_| CacheLine {
                            pa: 0,
                            generation: 0,
                            valid: false,
                            lru: 0,
                            data: empty.clone(),
                        })
                        .collect(),
                    lru_clock: 0,
                })
            })
            .collect();
        Self { sets, generation: AtomicU64::new(1), set_mask: (nsets - 1) as u64 }
    }

    fn set_of(&self, pa: u64) -> &Mutex<CacheSet> {
        &self.sets[((pa >> PAGE_SHIFT) & self.set_mask) as usize]
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Advance the generation. Existing lines become stale and are filtered
    /// at the next lookup.
    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn get(&self, pa: u64) -> Option<Arc<[u8; PAGE_SIZE]>> {
        let generation = self.generation();
        let mut set = self.set_of(pa).lock();
        set.lru_clock += 1;
        let clock = set.lru_clock;
        for line in set.lines.iter_mut() {
            if line.valid && line.pa == pa {
                if line.generation != generation {
                    line.valid = false;
                    return None;
                }
                line.lru = clock;
                return Some(line.data.clone());
            }
        }
        None
    }

    pub fn put(&self, pa: u64, data: Arc<[u8; PAGE_SIZE]>) {
        let generation = self.generation();
        let mut set = self.set_of(pa).lock();
        set.lru_clock += 1;
        let clock = set.lru_clock;
        // reuse an existing line for the same page, else an invalid/stale
        // line, else the LRU victim
        let mut victim = 0usize;
        let mut victim_lru = u64::MAX;
        for (i, line) in set.lines.iter().enumerate() {
            if line.valid && line.pa == pa {
                victim = i;
                victim_lru = 0;
                break;
            }
            if !line.valid || line.generation != generation {
                victim = i;
                victim_lru = 0;
            } else if line.lru < victim_lru {
                victim = i;
                victim_lru = line.lru;
            }
        }
        let line = &mut set.lines[victim];
        line.pa = pa;
        line.generation = generation;
        line.valid = true;
        line.lru = clock;
        line.data = data;
    }

    /// Drop the line for one physical page, if cached.
    pub fn invalidate(&self, pa: u64) {
        let mut set = self.set_of(pa).lock();
        for line in set.lines.iter_mut() {
            if line.valid && line.pa == pa {
                line.valid = false;
            }
        }
    }

    /// Is this page currently cached with the live generation? Used by the
    /// write path for conservative page-table invalidation.
    pub fn contains(&self, pa: u64) -> bool {
        let generation = self.generation();
        let set = self.set_of(pa).lock();
        set.lines.iter().any(|l| l.valid && l.pa == pa && l.generation == generation)
    }

    pub fn clear(&self) {
        for set in &self.sets {
            let mut set = set.lock();
            for line in set.lines.iter_mut() {
                line.valid = false;
            }
        }
    }
}
