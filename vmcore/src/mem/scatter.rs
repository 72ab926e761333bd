//! Physical scatter I/O: byte-range reads over the physical address space
//! are split into page slots, satisfied from the read cache where possible,
//! deduplicated and issued to the device as one call, then gathered back
//! into the caller's ranges.

use crate::mem::{MemCore, MemScatter, ReadFlags, PAGE_MASK, PAGE_SIZE};
use fnv::FnvHashMap;
use std::sync::Arc;

/// One caller-visible byte range of a scatter request.
pub struct ReadRange<'a> {
    pub addr: u64,
    pub buf: &'a mut [u8],
    /// Valid leading bytes after the call.
    pub read: usize,
    pub ok: bool,
}

impl<'a> ReadRange<'a> {
    pub fn new(addr: u64, buf: &'a mut [u8]) -> Self {
        Self { addr, buf, read: 0, ok: false }
    }
}

/// Content source for one page slot after the lookup/device phase.
enum PageState {
    Ready(Arc<[u8; PAGE_SIZE]>),
    Failed,
}

impl MemCore {
    /// Scatter read over physical address space. At most one device
    /// round-trip regardless of the number of ranges.
    pub fn phys_read_scatter(&self, ranges: &mut [ReadRange], flags: ReadFlags) {
        let mut pages: FnvHashMap<u64, PageState> = FnvHashMap::default();
        let use_cache = !flags.contains(ReadFlags::NOCACHE);

        // 1: page slots per range, cache consult, miss dedup
        let mut pending: Vec<MemScatter> = Vec::new();
        for r in ranges.iter() {
            if r.buf.is_empty() {
                continue;
            }
            let Some(last) = r.addr.checked_add(r.buf.len() as u64 - 1) else {
                continue;
            };
            let mut page = r.addr & !PAGE_MASK;
            loop {
                if !pages.contains_key(&page) {
                    match use_cache.then(|| self.cache_phys.get(page)).flatten() {
                        Some(data) => {
                            pages.insert(page, PageState::Ready(data));
                        }
                        None => {
                            pages.insert(page, PageState::Failed);
                            pending.push(MemScatter::new(page));
                        }
                    }
                }
                if page >= last & !PAGE_MASK {
                    break;
                }
                page += PAGE_SIZE as u64;
            }
        }

        // 2: one device call for all outstanding pages
        if !pending.is_empty() {
            self.device.scatter_read(&mut pending);
            for m in pending {
                if m.ok {
                    let data: Arc<[u8; PAGE_SIZE]> = Arc::new(*m.data);
                    if use_cache {
                        self.cache_phys.put(m.addr, data.clone());
                    }
                    pages.insert(m.addr, PageState::Ready(data));
                }
            }
        }

        // 3: gather
        for r in ranges.iter_mut() {
            gather_range(r, &pages, flags);
        }
    }

    /// Read a physical byte range into `buf`. Returns the number of valid
    /// leading bytes (equal to `buf.len()` under ZEROPAD).
    pub fn phys_read_into(&self, pa: u64, buf: &mut [u8], flags: ReadFlags) -> usize {
        let mut ranges = [ReadRange::new(pa, buf)];
        self.phys_read_scatter(&mut ranges, flags);
        ranges[0].read
    }

    /// Write a physical byte range. Sub-page boundaries are handled by
    /// read-modify-write of the surrounding page. The write is truncated at
    /// the first failing page, never spread past it.
    pub fn phys_write(&self, pa: u64, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let Some(_) = pa.checked_add(data.len() as u64 - 1) else {
            return 0;
        };

        let mut mems: Vec<MemScatter> = Vec::new();
        let mut consumed = 0usize;
        let mut page = pa & !PAGE_MASK;
        while consumed < data.len() {
            let slot_off = if mems.is_empty() { (pa & PAGE_MASK) as usize } else { 0 };
            let n = (PAGE_SIZE - slot_off).min(data.len() - consumed);
            let mut m = MemScatter::new(page);
            if slot_off != 0 || n != PAGE_SIZE {
                // partial page: fetch current content first
                if self.phys_read_into(page, &mut m.data[..], ReadFlags::NOCACHE) != PAGE_SIZE {
                    break;
                }
            }
            m.data[slot_off..slot_off + n].copy_from_slice(&data[consumed..consumed + n]);
            mems.push(m);
            consumed += n;
            page = page.wrapping_add(PAGE_SIZE as u64);
        }

        self.device.scatter_write(&mut mems);

        // count the contiguous successful prefix and invalidate its cache
        // lines; a cached page-table page hit by the write is dropped too
        let mut written = 0usize;
        let mut offset = (pa & PAGE_MASK) as usize;
        for m in &mems {
            self.cache_phys.invalidate(m.addr);
            if self.cache_tlb.contains(m.addr) {
                log::debug!("write into cached page-table page {:#x}, invalidating", m.addr);
                self.cache_tlb.invalidate(m.addr);
            }
            if !m.ok {
                break;
            }
            written += PAGE_SIZE - offset;
            offset = 0;
        }
        written.min(data.len())
    }

    /// Fetch a page-table page through the TLB cache. The page content is
    /// verified against the physical address ceiling before it is admitted:
    /// a present entry pointing past the end of physical memory marks the
    /// whole page as untrustworthy.
    pub fn tlb_page(&self, pa: u64, entry64: bool) -> Option<Arc<[u8; PAGE_SIZE]>> {
        let pa = pa & !PAGE_MASK;
        if let Some(data) = self.cache_tlb.get(pa) {
            return Some(data);
        }
        let mut mems = [MemScatter::new(pa)];
        self.device.scatter_read(&mut mems);
        let [m] = mems;
        if !m.ok {
            return None;
        }
        let data: Arc<[u8; PAGE_SIZE]> = Arc::new(*m.data);
        if !verify_pt_page(&data, self.pa_max.load(std::sync::atomic::Ordering::Relaxed), entry64) {
            log::debug!("page-table page {:#x} failed verification", pa);
            return None;
        }
        self.cache_tlb.put(pa, data.clone());
        Some(data)
    }
}

fn gather_range(r: &mut ReadRange, pages: &FnvHashMap<u64, PageState>, flags: ReadFlags) {
    r.read = 0;
    r.ok = false;
    if r.buf.is_empty() {
        r.ok = true;
        return;
    }
    if r.addr.checked_add(r.buf.len() as u64 - 1).is_none() {
        if flags.contains(ReadFlags::ZEROPAD) {
            r.buf.fill(0);
            r.read = r.buf.len();
            r.ok = true;
        }
        return;
    }

    let zeropad = flags.contains(ReadFlags::ZEROPAD);
    let mut failed = false;
    let mut pos = 0usize;
    let mut page = r.addr & !PAGE_MASK;
    let mut slot_off = (r.addr & PAGE_MASK) as usize;
    while pos < r.buf.len() {
        let n = (PAGE_SIZE - slot_off).min(r.buf.len() - pos);
        match pages.get(&page) {
            Some(PageState::Ready(data)) => {
                r.buf[pos..pos + n].copy_from_slice(&data[slot_off..slot_off + n]);
                if !failed {
                    r.read = pos + n;
                }
            }
            _ => {
                if !zeropad {
                    return;
                }
                r.buf[pos..pos + n].fill(0);
                failed = true;
            }
        }
        pos += n;
        slot_off = 0;
        page = page.wrapping_add(PAGE_SIZE as u64);
    }
    if zeropad {
        r.read = r.buf.len();
        r.ok = true;
    } else {
        r.ok = r.read == r.buf.len();
    }
}

/// A page admitted to the TLB cache must look like a plausible page table:
/// no present entry may point above the physical ceiling.
fn verify_pt_page(data: &[u8; PAGE_SIZE], pa_max: u64, entry64: bool) -> bool {
    if entry64 {
        for c in data.chunks_exact(8) {
            let e = u64::from_le_bytes(c.try_into().unwrap());
            if e & 1 != 0 && (e & 0x000f_ffff_ffff_f000) > pa_max {
                return false;
            }
        }
    } else {
        for c in data.chunks_exact(4) {
            let e = u32::from_le_bytes(c.try_into().unwrap()) as u64;
            if e & 1 != 0 && (e & 0xffff_f000) > pa_max {
                return false;
            }
        }
    }
    true
}
