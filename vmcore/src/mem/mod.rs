//! The layered memory read/write path: device scatter I/O, physical and
//! page-table caches, paging-mode translation and per-process virtual I/O.

pub mod cache;
pub mod device;
pub mod devices;
pub mod mmu;
pub mod scatter;
pub mod search;
pub mod virt;

use crate::mem::cache::PageCache;
use crate::mem::device::{MemDevice, PageFileIo};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

pub use x86::bits64::paging::BASE_PAGE_SIZE as PAGE_SIZE;

pub const PAGE_SHIFT: u64 = 12;
pub const PAGE_MASK: u64 = 0xfff;

const_assert_eq!(PAGE_SIZE, 0x1000);

bitflags::bitflags! {
    /// Flags steering a read through the memory path.
    pub struct ReadFlags: u32 {
        /// Unreadable slices are zero-filled and the full request size is
        /// reported back instead of a short count.
        const ZEROPAD = 0b0001;
        /// Bypass the physical page cache (volatile-sensitive callers).
        const NOCACHE = 0b0010;
        /// Do not attempt pagefile resolution of paged-out entries.
        const NOPAGING = 0b0100;
    }
}

/// One page-granular device request.
pub struct MemScatter {
    /// Page-aligned physical address.
    pub addr: u64,
    pub data: Box<[u8; PAGE_SIZE]>,
    /// Set by the device if and only if every byte is valid.
    pub ok: bool,
}

impl MemScatter {
    pub fn new(addr: u64) -> Self {
        debug_assert_eq!(addr & PAGE_MASK, 0);
        Self { addr, data: Box::new([0u8; PAGE_SIZE]), ok: false }
    }
}

/// Shared state of the physical memory path: the acquisition device, the
/// physical read cache and the cache of validated page-table pages.
pub struct MemCore {
    pub device: Arc<dyn MemDevice>,
    pub cache_phys: PageCache,
    pub cache_tlb: PageCache,
    pub pagefiles: Vec<Option<Box<dyn PageFileIo>>>,
    /// Max physical address; authoritative value comes from the device.
    pub pa_max: AtomicU64,
}

impl MemCore {
    pub fn new(device: Arc<dyn MemDevice>) -> Self {
        let pa_max = device.caps().pa_max;
        Self {
            device,
            cache_phys: PageCache::new(cache::PHYS_CACHE_SETS, cache::CACHE_WAYS),
            cache_tlb: PageCache::new(cache::TLB_CACHE_SETS, cache::CACHE_WAYS),
            pagefiles: (0..10).map(|_| None).collect(),
            pa_max: AtomicU64::new(pa_max),
        }
    }
}
