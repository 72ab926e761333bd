//! Asynchronous-friendly bounded virtual address space scanner.
//!
//! The scanner itself is synchronous; callers run it on a worker and abort
//! it cooperatively through the context flag, which is checked at chunk
//! boundaries.

use crate::mem::mmu::{self, MemoryModel};
use crate::mem::{MemCore, ReadFlags, PAGE_MASK, PAGE_SIZE};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

pub const SEARCH_PATTERN_MAX: usize = 32;
pub const SEARCH_RESULTS_MAX: u32 = 0x10000;

const CHUNK_PAGES: usize = 16;
const CHUNK_SIZE: usize = CHUNK_PAGES * PAGE_SIZE;

/// One search term: pattern bytes, a skip mask (set bits are ignored during
/// comparison) and a power-of-two alignment.
#[derive(Debug, Clone, Default)]
pub struct SearchTerm {
    pub pattern: Vec<u8>,
    pub skip_mask: Vec<u8>,
    pub align: u32,
}

impl SearchTerm {
    pub fn is_valid(&self) -> bool {
        !self.pattern.is_empty()
            && self.pattern.len() <= SEARCH_PATTERN_MAX
            && self.align.is_power_of_two()
            && (self.skip_mask.is_empty() || self.skip_mask.len() == self.pattern.len())
    }

    fn matches(&self, hay: &[u8]) -> bool {
        if hay.len() < self.pattern.len() {
            return false;
        }
        if self.skip_mask.is_empty() {
            return hay[..self.pattern.len()] == self.pattern[..];
        }
        self.pattern
            .iter()
            .zip(&self.skip_mask)
            .zip(hay)
            .all(|((p, m), h)| (p ^ h) & !m == 0)
    }
}

/// Search progress and control block, shared with status readers.
#[derive(Debug)]
pub struct SearchContext {
    pub term: SearchTerm,
    pub va_min: u64,
    pub va_max: u64,
    pub max_results: u32,
    pub va_current: AtomicU64,
    pub bytes_read: AtomicU64,
    pub hits: AtomicU32,
    pub abort: AtomicBool,
}

impl SearchContext {
    pub fn new(term: SearchTerm, va_min: u64, va_max: u64) -> Self {
        Self {
            term,
            // min rounds down to a page boundary, max up to page-1
            va_min: va_min & !PAGE_MASK,
            va_max: va_max | PAGE_MASK,
            max_results: SEARCH_RESULTS_MAX,
            va_current: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            hits: AtomicU32::new(0),
            abort: AtomicBool::new(false),
        }
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }
}

/// Scan `[va_min, va_max]` of the given address space for the term.
/// Returns the hit addresses; progress counters update as the scan runs.
/// `external_abort` is the owning handle's abort flag.
pub fn virt_search(
    mem: &MemCore,
    model: MemoryModel,
    dtb: u64,
    ctx: &SearchContext,
    external_abort: &AtomicBool,
) -> Vec<u64> {
    let mut results = Vec::new();
    if !ctx.term.is_valid() || ctx.va_min > ctx.va_max {
        return results;
    }
    let plen = ctx.term.pattern.len();
    let align = ctx.term.align.max(1) as u64;
    let mut window = vec![0u8; CHUNK_SIZE + plen - 1];

    let mut va = ctx.va_min;
    loop {
        if ctx.abort_requested() || external_abort.load(Ordering::Relaxed) {
            log::debug!("search aborted at {:#x}", va);
            break;
        }
        ctx.va_current.store(va, Ordering::Relaxed);

        let chunk_last = va.saturating_add(CHUNK_SIZE as u64 - 1).min(ctx.va_max);
        let chunk_len = (chunk_last - va + 1) as usize;

        if chunk_mapped(mem, model, dtb, va, chunk_len) {
            // overlap by pattern_len-1 so matches spanning the boundary hit
            let wlen = (chunk_len + plen - 1).min(window.len());
            let n = {
                let w = &mut window[..wlen];
                mem.virt_read_into(model, dtb, va, w, ReadFlags::ZEROPAD)
            };
            ctx.bytes_read.fetch_add(chunk_len as u64, Ordering::Relaxed);
            if n == wlen {
                let mut off = va.next_multiple_of(align).wrapping_sub(va);
                while (off as usize) < chunk_len {
                    if ctx.term.matches(&window[off as usize..wlen]) {
                        results.push(va + off);
                        ctx.hits.fetch_add(1, Ordering::Relaxed);
                        if results.len() as u32 >= ctx.max_results {
                            log::debug!("search result cap reached at {:#x}", va + off);
                            return results;
                        }
                    }
                    off += align;
                }
            }
        }

        match va.checked_add(CHUNK_SIZE as u64) {
            Some(next) if next <= ctx.va_max => va = next,
            _ => break,
        }
    }
    results
}

/// Cheap pre-check: does any page of the chunk translate? Unmapped gaps are
/// skipped without touching the read path.
fn chunk_mapped(mem: &MemCore, model: MemoryModel, dtb: u64, va: u64, len: usize) -> bool {
    let mut page = va;
    let last = va + len as u64 - 1;
    loop {
        if mmu::translate(mem, model, dtb, page).is_ok() {
            return true;
        }
        match page.checked_add(PAGE_SIZE as u64) {
            Some(next) if next <= last => page = next,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::devices::RamDevice;
    use std::sync::Arc;

    const P: u64 = 1;
    const RW: u64 = 2;

    /// Identity-style mapping of three data pages at va 0x10000.
    fn searchable_mem() -> MemCore {
        let mut img = vec![0u8; 0x100000];
        let w64 = |img: &mut Vec<u8>, a: usize, v: u64| {
            img[a..a + 8].copy_from_slice(&v.to_le_bytes())
        };
        w64(&mut img, 0x1000, 0x2000 | P | RW | 4);
        w64(&mut img, 0x2000, 0x3000 | P | RW | 4);
        w64(&mut img, 0x3000, 0x4000 | P | RW | 4);
        for i in 0..3usize {
            w64(&mut img, 0x4000 + (0x10 + i) * 8, (0x20000 + i * 0x1000) as u64 | P | RW);
        }
        // pattern at page starts and once unaligned
        img[0x20000..0x20004].copy_from_slice(b"\x4d\x5a\x90\x00");
        img[0x21000..0x21004].copy_from_slice(b"\x4d\x5a\x90\x00");
        img[0x21300..0x21304].copy_from_slice(b"\x4d\x5a\x90\x00");
        // crossing the page boundary between the 2nd and 3rd page
        img[0x21ffe..0x22002].copy_from_slice(b"\x4d\x5a\x90\x00");
        MemCore::new(Arc::new(RamDevice::new(img, false)))
    }

    fn ctx(pattern: &[u8], align: u32, min: u64, max: u64) -> SearchContext {
        SearchContext::new(
            SearchTerm { pattern: pattern.to_vec(), skip_mask: Vec::new(), align },
            min,
            max,
        )
    }

    #[test]
    fn finds_hits_and_respects_alignment() {
        let mem = searchable_mem();
        let no_abort = AtomicBool::new(false);

        let c = ctx(b"\x4d\x5a\x90\x00", 1, 0x10000, 0x13fff);
        let hits = virt_search(&mem, MemoryModel::X64, 0x1000, &c, &no_abort);
        assert_eq!(hits, vec![0x10000, 0x11000, 0x11300, 0x11ffe]);

        let c = ctx(b"\x4d\x5a\x90\x00", 0x1000, 0x10000, 0x13fff);
        let hits = virt_search(&mem, MemoryModel::X64, 0x1000, &c, &no_abort);
        assert_eq!(hits, vec![0x10000, 0x11000]);
        for h in &hits {
            assert_eq!(h % 0x1000, 0);
        }
    }

    #[test]
    fn skip_mask_ignores_masked_bytes() {
        let mem = searchable_mem();
        let no_abort = AtomicBool::new(false);
        let c = SearchContext::new(
            SearchTerm {
                pattern: b"\x4d\x5a\x00\x00".to_vec(),
                skip_mask: b"\x00\x00\xff\x00".to_vec(),
                align: 0x1000,
            },
            0x10000,
            0x13fff,
        );
        let hits = virt_search(&mem, MemoryModel::X64, 0x1000, &c, &no_abort);
        assert_eq!(hits, vec![0x10000, 0x11000]);
    }

    #[test]
    fn bounds_are_page_rounded() {
        let c = ctx(b"ab", 1, 0x10234, 0x11567);
        assert_eq!(c.va_min, 0x10000);
        assert_eq!(c.va_max, 0x11fff);
    }

    #[test]
    fn abort_stops_scan() {
        let mem = searchable_mem();
        let c = ctx(b"\x4d\x5a\x90\x00", 1, 0x10000, 0x13fff);
        c.abort.store(true, Ordering::Relaxed);
        let no_abort = AtomicBool::new(false);
        let hits = virt_search(&mem, MemoryModel::X64, 0x1000, &c, &no_abort);
        assert!(hits.is_empty());
    }

    #[test]
    fn invalid_terms_yield_nothing() {
        let mem = searchable_mem();
        let no_abort = AtomicBool::new(false);
        // alignment not a power of two
        let c = ctx(b"\x4d\x5a", 3, 0x10000, 0x13fff);
        assert!(virt_search(&mem, MemoryModel::X64, 0x1000, &c, &no_abort).is_empty());
        // empty pattern
        let c = ctx(b"", 1, 0x10000, 0x13fff);
        assert!(virt_search(&mem, MemoryModel::X64, 0x1000, &c, &no_abort).is_empty());
    }
}
