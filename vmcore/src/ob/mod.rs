//! Reference counted objects with tags.
//!
//! Every shared heap object produced by the engine is wrapped in an [`Ob`]:
//! a reference counted allocation carrying validity magics, a four character
//! tag and the id of the owning handle. Cleanup callbacks fire exactly once,
//! at the final release, before the payload itself is dropped.
//!
//! Containers ([`ObMap`], [`ObSet`], [`ObStrMap`]) hold their members by
//! reference count; removing an entry releases it, destroying the container
//! releases all members.

pub mod map;
pub mod set;
pub mod strmap;

pub use map::ObMap;
pub use set::ObSet;
pub use strmap::{ObStrMap, TextRef};

use fnv::FnvHashMap;
use once_cell::sync::Lazy;
use std::ops::Deref;
use std::sync::{Arc, RwLock};

pub const OB_HEADER_MAGIC: u32 = 0x0bfe_c0de;

struct ObBox<T> {
    magic1: u32,
    tag: [u8; 4],
    handle_id: u64,
    size: u32,
    magic2: u32,
    cleanup: Option<fn(&T)>,
    data: T,
}

impl<T> Drop for ObBox<T> {
    fn drop(&mut self) {
        if let Some(cb) = self.cleanup {
            cb(&self.data);
        }
    }
}

/// A tagged, reference counted object. `Clone` increments the reference
/// count; dropping the last clone fires the cleanup callback and frees the
/// payload.
pub struct Ob<T>(Arc<ObBox<T>>);

impl<T> Clone for Ob<T> {
    fn clone(&self) -> Self {
        Ob(Arc::clone(&self.0))
    }
}

impl<T> Deref for Ob<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0.data
    }
}

impl<T> Ob<T> {
    pub fn alloc(handle_id: u64, tag: &[u8; 4], data: T) -> Self {
        Self::alloc_with_cleanup(handle_id, tag, data, None)
    }

    pub fn alloc_with_cleanup(
        handle_id: u64,
        tag: &[u8; 4],
        data: T,
        cleanup: Option<fn(&T)>,
    ) -> Self {
        Ob(Arc::new(ObBox {
            magic1: OB_HEADER_MAGIC,
            tag: *tag,
            handle_id,
            size: core::mem::size_of::<T>() as u32,
            magic2: OB_HEADER_MAGIC,
            cleanup,
            data,
        }))
    }

    /// Both magics intact implies the header has not been scribbled over
    /// and a dereference is safe.
    pub fn is_valid(&self) -> bool {
        self.0.magic1 == OB_HEADER_MAGIC && self.0.magic2 == OB_HEADER_MAGIC
    }

    pub fn tag(&self) -> &[u8; 4] {
        &self.0.tag
    }

    pub fn handle_id(&self) -> u64 {
        self.0.handle_id
    }

    pub fn size(&self) -> u32 {
        self.0.size
    }

    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Stable key for registry purposes: the allocation address.
    pub fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

//
// External allocation registry. Process-wide: every buffer handed across
// the API boundary is tracked here keyed by its allocation address so that
// double-free is refused and leaks are reported at handle close.
//

pub struct ExtAlloc {
    pub ob: Ob<Vec<u8>>,
}

static ALLOC_EXT: Lazy<RwLock<FnvHashMap<usize, ExtAlloc>>> =
    Lazy::new(|| RwLock::new(FnvHashMap::default()));

/// Allocate an externally owned buffer. Returns the registry key.
pub fn ext_alloc(handle_id: u64, tag: &[u8; 4], size: usize) -> Option<usize> {
    if size > 0x4000_0000 {
        return None;
    }
    let ob = Ob::alloc(handle_id, tag, vec![0u8; size]);
    let key = ob.key();
    let mut reg = ALLOC_EXT.write().unwrap();
    reg.insert(key, ExtAlloc { ob });
    Some(key)
}

/// Look up a previously registered external allocation.
pub fn ext_get(key: usize) -> Option<Ob<Vec<u8>>> {
    ALLOC_EXT.read().unwrap().get(&key).map(|e| e.ob.clone())
}

/// Size query; zero when the key is unknown or the header is damaged.
pub fn ext_size(key: usize) -> usize {
    match ALLOC_EXT.read().unwrap().get(&key) {
        Some(e) if e.ob.is_valid() => e.ob.len(),
        _ => 0,
    }
}

/// Release an external allocation. A second call with the same key is a
/// refused double-free and returns false.
pub fn ext_free(key: usize) -> bool {
    ALLOC_EXT.write().unwrap().remove(&key).is_some()
}

/// Report allocations still registered for `handle_id` at close. At most
/// ten entries are logged, then the warning is muted.
pub fn ext_leak_scan(handle_id: u64) -> usize {
    let reg = ALLOC_EXT.read().unwrap();
    let mut shown = 0usize;
    let mut total = 0usize;
    for (key, e) in reg.iter() {
        if e.ob.handle_id() != handle_id {
            continue;
        }
        total += 1;
        if shown < 10 {
            shown += 1;
            let t = e.ob.tag();
            log::warn!(
                "memory not deallocated at close: key={:#x} size={:#x} tag={}{}{}{}",
                key,
                e.ob.len(),
                t[0] as char,
                t[1] as char,
                t[2] as char,
                t[3] as char
            );
            if shown == 10 {
                log::warn!("memory not deallocated at close: first 10 entries shown - warning muted");
            }
        }
    }
    total
}

/// Drop every allocation still owned by `handle_id` (after the leak scan).
pub fn ext_release_all(handle_id: u64) {
    let mut reg = ALLOC_EXT.write().unwrap();
    reg.retain(|_, e| e.ob.handle_id() != handle_id);
}
