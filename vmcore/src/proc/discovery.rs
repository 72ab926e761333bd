//! Kernel directory table base location and `_EPROCESS` list enumeration.

use crate::mem::mmu::{self, MemoryModel};
use crate::mem::{MemCore, ReadFlags, PAGE_SIZE};
use crate::ob::ObSet;
use crate::proc::ProcessSeed;
use crate::sym::{OffsetProfile, SymbolProvider};

/// Hard cap on list walk length; a hostile image must not loop us.
const EPROCESS_WALK_MAX: usize = 0x1000;

/// Physical scan ceiling when no DTB was configured.
const DTB_SCAN_MAX: u64 = 0x1000_0000;

const PFN_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Locate the kernel DTB by scanning low physical memory for a
/// self-referencing top level page directory with kernel-half mappings.
pub fn locate_dtb(mem: &MemCore, model: MemoryModel) -> Option<u64> {
    let pa_max = mem.pa_max.load(std::sync::atomic::Ordering::Relaxed).min(DTB_SCAN_MAX);
    let mut page = [0u8; PAGE_SIZE];
    let mut pa = 0x1000u64;
    while pa < pa_max {
        if mem.phys_read_into(pa, &mut page, ReadFlags::NOCACHE) == PAGE_SIZE
            && is_dtb_candidate(&page, pa, model)
        {
            log::info!("kernel dtb located by scan: {:#x}", pa);
            return Some(pa);
        }
        pa += PAGE_SIZE as u64;
    }
    log::warn!("kernel dtb not found below {:#x}", pa_max);
    None
}

fn is_dtb_candidate(page: &[u8; PAGE_SIZE], pa: u64, model: MemoryModel) -> bool {
    if model != MemoryModel::X64 {
        // self-reference scanning is a 64-bit technique; 32-bit images
        // configure the DTB explicitly
        return false;
    }
    let mut self_ref = false;
    let mut kernel_entries = 0usize;
    for (i, c) in page.chunks_exact(8).enumerate() {
        let e = u64::from_le_bytes(c.try_into().unwrap());
        if e & 1 == 0 {
            continue;
        }
        if e & PFN_MASK == pa {
            self_ref = true;
        } else if i >= 256 {
            kernel_entries += 1;
        }
    }
    self_ref && kernel_entries > 0
}

/// Walk `PsActiveProcessHead` and harvest one seed per `_EPROCESS` record.
/// Every pointer is validated by translation before its record is read;
/// implausible records are skipped, never fatal.
pub fn enumerate_eprocess(
    mem: &MemCore,
    model: MemoryModel,
    kernel_dtb: u64,
    symbols: &dyn SymbolProvider,
    profile: &OffsetProfile,
) -> Vec<ProcessSeed> {
    let mut seeds = Vec::new();
    let Some(head) = symbols.symbol_va("nt", "PsActiveProcessHead") else {
        log::warn!("PsActiveProcessHead not resolvable, no process enumeration");
        return seeds;
    };
    let off = &profile.eprocess;
    let visited = ObSet::new();
    visited.push(head);

    let mut link = match read_ptr(mem, model, kernel_dtb, head) {
        Some(va) => va,
        None => {
            log::warn!("process list head unreadable at {:#x}", head);
            return seeds;
        }
    };

    while link != head && visited.push(link) {
        if seeds.len() >= EPROCESS_WALK_MAX {
            log::warn!("process list walk cap reached, truncating");
            break;
        }
        let va_eprocess = link.wrapping_sub(off.active_process_links as u64);
        if let Some(seed) = read_eprocess(mem, model, kernel_dtb, va_eprocess, profile) {
            seeds.push(seed);
        }
        link = match read_ptr(mem, model, kernel_dtb, link) {
            Some(next) if next != 0 => next,
            _ => break,
        };
    }
    log::info!("process enumeration: {} processes", seeds.len());
    seeds
}

fn read_eprocess(
    mem: &MemCore,
    model: MemoryModel,
    kernel_dtb: u64,
    va: u64,
    profile: &OffsetProfile,
) -> Option<ProcessSeed> {
    // discard list nodes pointing into unmapped space up front
    mmu::translate(mem, model, kernel_dtb, va).ok()?;

    let off = &profile.eprocess;
    let mut rec = vec![0u8; off.size as usize];
    mem.virt_read_into(model, kernel_dtb, va, &mut rec, ReadFlags::ZEROPAD);

    let pid = read_u64_at(&rec, off.unique_process_id)? as u32;
    let ppid = read_u64_at(&rec, off.inherited_from_pid)? as u32;
    let dtb = read_u64_at(&rec, off.dtb)?;
    if pid == 0 || dtb == 0 {
        return None;
    }
    // the DTB must be page aligned (low flag bits tolerated) and inside
    // physical memory
    if dtb & 0xfff != 0 && model != MemoryModel::X86Pae {
        return None;
    }
    if (dtb & PFN_MASK) > mem.pa_max.load(std::sync::atomic::Ordering::Relaxed) {
        return None;
    }

    let name_raw = rec.get(off.image_file_name as usize..off.image_file_name as usize + 15)?;
    let name: String = name_raw
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect();

    let dtb_user = match off.dtb_user {
        0 => None,
        o => match read_u64_at(&rec, o) {
            Some(v) if v > 0xfff => Some(v),
            _ => None,
        },
    };
    let va_peb = read_u64_at(&rec, off.peb).unwrap_or(0);
    let va_token = read_u64_at(&rec, off.token).unwrap_or(0) & !0xf;
    let is_wow64 = off.wow64_process != 0 && read_u64_at(&rec, off.wow64_process).unwrap_or(0) != 0;
    let session_id = match off.session {
        0 => 0,
        o => (read_u64_at(&rec, o).unwrap_or(0) != 0) as u32,
    };

    Some(ProcessSeed {
        pid,
        ppid,
        dtb,
        dtb_user,
        name,
        va_eprocess: va,
        va_peb,
        va_token,
        is_wow64,
        session_id,
    })
}

pub(crate) fn read_ptr(mem: &MemCore, model: MemoryModel, dtb: u64, va: u64) -> Option<u64> {
    if model.is_32bit() {
        let mut buf = [0u8; 4];
        (mem.virt_read_into(model, dtb, va, &mut buf, ReadFlags::empty()) == 4)
            .then(|| u32::from_le_bytes(buf) as u64)
    } else {
        let mut buf = [0u8; 8];
        (mem.virt_read_into(model, dtb, va, &mut buf, ReadFlags::empty()) == 8)
            .then(|| u64::from_le_bytes(buf))
    }
}

fn read_u64_at(rec: &[u8], offset: u32) -> Option<u64> {
    let o = offset as usize;
    rec.get(o..o + 8).map(|b| u64::from_le_bytes(b.try_into().unwrap()))
}
