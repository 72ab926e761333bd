//! Per-process virtual address I/O built on translation plus physical
//! scatter. A virtual range is split by page, each page translated, the
//! surviving pages fetched in one scatter batch and stitched back.

use crate::error::TranslateFail;
use crate::mem::mmu::{self, MemoryModel};
use crate::mem::scatter::ReadRange;
use crate::mem::{MemCore, ReadFlags, PAGE_MASK, PAGE_SIZE};

enum Slot {
    /// Backed by a physical range; index into the scatter batch.
    Phys(usize),
    /// Already settled (pagefile hit or failure), with the slot length.
    Done { len: usize, ok: bool },
}

impl MemCore {
    /// Read a virtual byte range. Under [`ReadFlags::ZEROPAD`] the buffer
    /// is always fully written (zeroed where unreadable) and the returned
    /// count equals the request size; otherwise the count of valid leading
    /// bytes is returned and reading stops at the first failing page.
    pub fn virt_read_into(
        &self,
        model: MemoryModel,
        dtb: u64,
        va: u64,
        buf: &mut [u8],
        flags: ReadFlags,
    ) -> usize {
        let zeropad = flags.contains(ReadFlags::ZEROPAD);
        let total = buf.len();
        if total == 0 {
            return 0;
        }

        // clamp at the top of the address space instead of wrapping
        let space_left = (u64::MAX - va) as u128 + 1;
        let effective = (total as u128).min(space_left) as usize;
        let (active, tail) = buf.split_at_mut(effective);
        if zeropad {
            tail.fill(0);
        }

        let mut ranges: Vec<ReadRange> = Vec::new();
        let mut slots: Vec<Slot> = Vec::new();

        let mut rest = active;
        let mut slot_va = va;
        while !rest.is_empty() {
            let n = (PAGE_SIZE - (slot_va & PAGE_MASK) as usize).min(rest.len());
            let (slice, remaining) = rest.split_at_mut(n);
            rest = remaining;

            match self.resolve_page(model, dtb, slot_va, flags) {
                PageSource::Phys(pa) => {
                    slots.push(Slot::Phys(ranges.len()));
                    ranges.push(ReadRange::new(pa, slice));
                }
                PageSource::PageFile { pf, offset } => {
                    let ok = self.pagefile_read(pf, offset, slot_va, slice);
                    if !ok && zeropad {
                        slice.fill(0);
                    }
                    slots.push(Slot::Done { len: n, ok });
                }
                PageSource::Unreadable => {
                    if zeropad {
                        slice.fill(0);
                    }
                    slots.push(Slot::Done { len: n, ok: false });
                }
            }
            slot_va = slot_va.wrapping_add(n as u64);
        }

        // one physical batch for everything that translated
        self.phys_read_scatter(&mut ranges, flags & ReadFlags::NOCACHE);

        let mut count = 0usize;
        for slot in &slots {
            let (len, ok) = match slot {
                Slot::Phys(i) => {
                    let r = &mut ranges[*i];
                    if !r.ok && zeropad {
                        r.buf.fill(0);
                    }
                    (r.buf.len(), r.ok)
                }
                Slot::Done { len, ok } => (*len, *ok),
            };
            if !ok {
                break;
            }
            count += len;
        }
        if zeropad {
            total
        } else {
            count
        }
    }

    /// Read a virtual range into a fresh vector (ZEROPAD semantics).
    pub fn virt_read(&self, model: MemoryModel, dtb: u64, va: u64, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.virt_read_into(model, dtb, va, &mut buf, ReadFlags::ZEROPAD);
        buf
    }

    /// Write a virtual byte range. The write is truncated at the first
    /// page that fails to translate or to reach the device; it never
    /// spreads past an unwritable mapping.
    pub fn virt_write(&self, model: MemoryModel, dtb: u64, va: u64, data: &[u8]) -> usize {
        let mut written = 0usize;
        let mut slot_va = va;
        while written < data.len() {
            let n = (PAGE_SIZE - (slot_va & PAGE_MASK) as usize).min(data.len() - written);
            let pa = match mmu::translate(self, model, dtb, slot_va) {
                Ok(t) => t.pa,
                Err(TranslateFail::Transition { pa }) => pa | (slot_va & PAGE_MASK),
                Err(_) => break,
            };
            let w = self.phys_write(pa, &data[written..written + n]);
            written += w;
            if w != n {
                break;
            }
            if slot_va.checked_add(n as u64).is_none() {
                break;
            }
            slot_va += n as u64;
        }
        written
    }

    fn resolve_page(&self, model: MemoryModel, dtb: u64, va: u64, flags: ReadFlags) -> PageSource {
        match mmu::translate(self, model, dtb, va) {
            Ok(t) => PageSource::Phys(t.pa),
            Err(TranslateFail::Transition { pa }) => PageSource::Phys(pa | (va & PAGE_MASK)),
            Err(TranslateFail::Paged { pf, offset }) if !flags.contains(ReadFlags::NOPAGING) => {
                PageSource::PageFile { pf, offset }
            }
            Err(_) => PageSource::Unreadable,
        }
    }

    fn pagefile_read(&self, pf: u8, offset: u64, va: u64, out: &mut [u8]) -> bool {
        let Some(Some(pagefile)) = self.pagefiles.get(pf as usize) else {
            return false;
        };
        let mut page = [0u8; PAGE_SIZE];
        if !pagefile.read_page(offset, &mut page) {
            return false;
        }
        let off = (va & PAGE_MASK) as usize;
        out.copy_from_slice(&page[off..off + out.len()]);
        true
    }
}

enum PageSource {
    Phys(u64),
    PageFile { pf: u8, offset: u64 },
    Unreadable,
}
