//! Virtual to physical address translation.
//!
//! The paging variant is identified once at initialization and stays fixed
//! for the handle lifetime. Variants are tagged values with per-variant walk
//! functions; there is no trait object in the hot path.

pub mod x64;
pub mod x86;
pub mod x86pae;

use crate::error::TranslateFail;
use crate::mem::MemCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryModel {
    #[default]
    None,
    /// 2-level 32-bit legacy paging, 4 MiB large pages.
    X86,
    /// 3-level 32-bit PAE paging, 64-bit entries, 2 MiB large pages.
    X86Pae,
    /// 4-level 64-bit paging, 1 GiB and 2 MiB large pages.
    X64,
}

impl MemoryModel {
    pub fn is_32bit(&self) -> bool {
        matches!(self, MemoryModel::X86 | MemoryModel::X86Pae)
    }

    /// Highest canonical virtual address of the model.
    pub fn va_max(&self) -> u64 {
        if self.is_32bit() {
            0xffff_ffff
        } else {
            u64::MAX
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryModel::None => "N/A",
            MemoryModel::X86 => "X86",
            MemoryModel::X86Pae => "X86PAE",
            MemoryModel::X64 => "X64",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub pa: u64,
    pub page_size: u64,
}

bitflags::bitflags! {
    /// Effective protection of a leaf mapping.
    pub struct PteProt: u32 {
        const READ    = 0b0001;
        const WRITE   = 0b0010;
        const EXECUTE = 0b0100;
        const USER    = 0b1000;
    }
}

/// A contiguous run of present pages found by a page-table walk.
#[derive(Debug, Clone, Copy)]
pub struct PteRun {
    pub va: u64,
    pub pages: u64,
    pub prot: PteProt,
}

pub fn translate(
    mem: &MemCore,
    model: MemoryModel,
    dtb: u64,
    va: u64,
) -> Result<Translation, TranslateFail> {
    match model {
        MemoryModel::X64 => x64::translate(mem, dtb, va),
        MemoryModel::X86 => x86::translate(mem, dtb, va),
        MemoryModel::X86Pae => x86pae::translate(mem, dtb, va),
        MemoryModel::None => Err(TranslateFail::NotPresent),
    }
}

/// Enumerate all present leaf mappings of an address space, merging
/// adjacent pages with identical protection into runs. Used by the PTE map
/// builder.
pub fn collect_runs(mem: &MemCore, model: MemoryModel, dtb: u64, va_max: u64) -> Vec<PteRun> {
    let mut runs: Vec<PteRun> = Vec::new();
    let mut emit = |va: u64, pages: u64, prot: PteProt| {
        if va > va_max {
            return;
        }
        if let Some(last) = runs.last_mut() {
            if last.prot == prot && last.va.wrapping_add(last.pages << 12) == va {
                last.pages += pages;
                return;
            }
        }
        runs.push(PteRun { va, pages, prot });
    };
    match model {
        MemoryModel::X64 => x64::walk(mem, dtb, &mut emit),
        MemoryModel::X86 => x86::walk(mem, dtb, &mut emit),
        MemoryModel::X86Pae => x86pae::walk(mem, dtb, &mut emit),
        MemoryModel::None => {}
    }
    runs
}

/// Classify a non-present 64-bit entry (X64/PAE software encodings).
pub(crate) fn soft_classify64(e: u64) -> TranslateFail {
    if e == 0 {
        return TranslateFail::NotPresent;
    }
    if e & (1 << 10) != 0 {
        return TranslateFail::Prototype;
    }
    if e & (1 << 11) != 0 {
        return TranslateFail::Transition { pa: e & 0x000f_ffff_ffff_f000 };
    }
    let offset = e >> 32;
    if offset != 0 {
        return TranslateFail::Paged { pf: ((e >> 1) & 0xf) as u8, offset: offset << 12 };
    }
    TranslateFail::NotPresent
}

/// Classify a non-present 32-bit legacy entry.
pub(crate) fn soft_classify32(e: u32) -> TranslateFail {
    if e == 0 {
        return TranslateFail::NotPresent;
    }
    if e & (1 << 10) != 0 {
        return TranslateFail::Prototype;
    }
    if e & (1 << 11) != 0 {
        return TranslateFail::Transition { pa: (e & 0xffff_f000) as u64 };
    }
    let offset = (e >> 12) as u64;
    if offset != 0 {
        return TranslateFail::Paged { pf: ((e >> 1) & 0xf) as u8, offset: offset << 12 };
    }
    TranslateFail::NotPresent
}

/// Protection of a present 64-bit entry, folding in the inherited
/// upper-level write/user/execute restrictions.
pub(crate) fn prot_of64(e: u64, upper_rw: bool, upper_us: bool, upper_nx: bool) -> PteProt {
    let mut p = PteProt::READ;
    if upper_rw && e & 2 != 0 {
        p |= PteProt::WRITE;
    }
    if upper_us && e & 4 != 0 {
        p |= PteProt::USER;
    }
    if !upper_nx && e & (1 << 63) == 0 {
        p |= PteProt::EXECUTE;
    }
    p
}

/// Fetch one 64-bit entry of a page-table page.
pub(crate) fn entry64(mem: &MemCore, table_pa: u64, index: u64) -> Option<u64> {
    let page = mem.tlb_page(table_pa, true)?;
    let off = (index as usize) * 8;
    Some(u64::from_le_bytes(page[off..off + 8].try_into().unwrap()))
}

/// Fetch one 32-bit entry of a page-table page.
pub(crate) fn entry32(mem: &MemCore, table_pa: u64, index: u64) -> Option<u32> {
    let page = mem.tlb_page(table_pa, false)?;
    let off = (index as usize) * 4;
    Some(u32::from_le_bytes(page[off..off + 4].try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_classification_x64() {
        assert_eq!(soft_classify64(0), TranslateFail::NotPresent);
        assert_eq!(soft_classify64(1 << 10), TranslateFail::Prototype);
        assert_eq!(
            soft_classify64((0x1234 << 12) | (1 << 11)),
            TranslateFail::Transition { pa: 0x1234 << 12 }
        );
        assert_eq!(
            soft_classify64((0x77u64 << 32) | (2 << 1)),
            TranslateFail::Paged { pf: 2, offset: 0x77 << 12 }
        );
    }

    #[test]
    fn soft_classification_x86() {
        assert_eq!(soft_classify32(0), TranslateFail::NotPresent);
        assert_eq!(soft_classify32(1 << 10), TranslateFail::Prototype);
        assert_eq!(
            soft_classify32(0x5000 | (1 << 11)),
            TranslateFail::Transition { pa: 0x5000 }
        );
        assert_eq!(
            soft_classify32((0x33 << 12) | (1 << 1)),
            TranslateFail::Paged { pf: 1, offset: 0x33 << 12 }
        );
    }

    #[test]
    fn model_limits() {
        assert_eq!(MemoryModel::X86.va_max(), 0xffff_ffff);
        assert_eq!(MemoryModel::X86Pae.va_max(), 0xffff_ffff);
        assert_eq!(MemoryModel::X64.va_max(), u64::MAX);
        assert_eq!(MemoryModel::X64.as_str(), "X64");
    }
}
