//! Loaded module view, walked from PEB -> Ldr -> InLoadOrderModuleList.

use super::{u32_at, u64_at, BuildCtx, WALK_MAX};
use crate::mem::ReadFlags;
use crate::ob::{ObSet, ObStrMap, TextRef};
use crate::proc::Process;

#[derive(Debug, Clone, Copy)]
pub struct ModuleEntry {
    pub base: u64,
    pub image_size: u64,
    pub entry_point: u64,
    pub full_path: TextRef,
    pub name: TextRef,
    pub is_wow64: bool,
    pub eat_count: u32,
    pub iat_count: u32,
    pub section_count: u32,
}

#[derive(Debug, Default)]
pub struct ModuleMap {
    pub entries: Vec<ModuleEntry>,
    pub pool: String,
}

impl ModuleMap {
    pub fn find_by_name<'a>(&'a self, name: &str) -> Option<&'a ModuleEntry> {
        self.entries.iter().find(|e| e.name.get(&self.pool).eq_ignore_ascii_case(name))
    }

    pub fn find_by_va(&self, va: u64) -> Option<&ModuleEntry> {
        self.entries.iter().find(|e| va >= e.base && va < e.base + e.image_size)
    }
}

pub fn build(ctx: &BuildCtx, proc: &Process) -> ModuleMap {
    let mut map = ModuleMap::default();
    if proc.win.va_peb == 0 {
        return map;
    }
    let profile = ctx.profile();
    let off = &profile.ldr;
    let dtb = proc.dtb;

    let Some(ldr) = ctx.read_ptr(dtb, proc.win.va_peb + off.peb_ldr as u64) else {
        return map;
    };
    let list_head = ldr + off.in_load_order_list as u64;
    let Some(mut link) = ctx.read_ptr(dtb, list_head) else {
        return map;
    };

    let mut pool = ObStrMap::new();
    let visited = ObSet::new();
    visited.push(list_head);

    while link != list_head && link != 0 && visited.push(link) {
        if map.entries.len() >= WALK_MAX {
            log::warn!("module list walk cap reached for pid {}", proc.pid);
            break;
        }
        let Some(rec) = ctx.read_struct(dtb, link, off.size as usize) else {
            break;
        };
        let base = u64_at(&rec, off.dll_base);
        let image_size = u32_at(&rec, off.size_of_image) as u64;
        if base != 0 && image_size != 0 && image_size < 0x1_0000_0000 {
            let full = ctx
                .read_unicode_string(dtb, link + off.full_dll_name as u64)
                .unwrap_or_default();
            let name = ctx
                .read_unicode_string(dtb, link + off.base_dll_name as u64)
                .unwrap_or_else(|| format!("_UNKNOWN-{:x}.dll", base));
            let (eat_count, iat_count, section_count) = pe_counts(ctx, dtb, base);
            map.entries.push(ModuleEntry {
                base,
                image_size,
                entry_point: u64_at(&rec, off.entry_point),
                full_path: pool.push(&full),
                name: pool.push(&name),
                is_wow64: false,
                eat_count,
                iat_count,
                section_count,
            });
        }
        link = match ctx.read_ptr(dtb, link) {
            Some(next) => next,
            None => break,
        };
    }

    map.entries.sort_by_key(|e| e.base);
    map.pool = pool.finalize();

    // the main image entry carries the long process path
    if let Some(e) =
        map.entries.iter().find(|e| e.name.get(&map.pool).eq_ignore_ascii_case(&proc.name))
    {
        proc.set_path_long(e.full_path.get(&map.pool).to_string());
    }

    log::debug!("module map pid {}: {} modules", proc.pid, map.entries.len());
    map
}

/// Section/export/import counts from the PE header of a mapped image.
/// A damaged or paged-out header yields zero counts, not failure.
fn pe_counts(ctx: &BuildCtx, dtb: u64, base: u64) -> (u32, u32, u32) {
    let mut hdr = [0u8; 0x1000];
    if ctx.mem.virt_read_into(ctx.model, dtb, base, &mut hdr, ReadFlags::ZEROPAD) != hdr.len() {
        return (0, 0, 0);
    }
    if &hdr[0..2] != b"MZ" {
        return (0, 0, 0);
    }
    let e_lfanew = u32::from_le_bytes(hdr[0x3c..0x40].try_into().unwrap()) as usize;
    if e_lfanew == 0 || e_lfanew > 0x800 || &hdr[e_lfanew..e_lfanew + 4] != b"PE\0\0" {
        return (0, 0, 0);
    }
    let sections = u16::from_le_bytes(hdr[e_lfanew + 6..e_lfanew + 8].try_into().unwrap()) as u32;
    let opt = e_lfanew + 0x18;
    let magic = u16::from_le_bytes(hdr[opt..opt + 2].try_into().unwrap());
    let dirs = match magic {
        0x20b => opt + 0x70, // PE32+
        0x10b => opt + 0x60, // PE32
        _ => return (0, 0, sections),
    };
    let dir = |idx: usize| -> (u32, u32) {
        let o = dirs + idx * 8;
        if o + 8 > hdr.len() {
            return (0, 0);
        }
        (
            u32::from_le_bytes(hdr[o..o + 4].try_into().unwrap()),
            u32::from_le_bytes(hdr[o + 4..o + 8].try_into().unwrap()),
        )
    };

    // export directory: NumberOfFunctions at +0x14
    let (eat_rva, _) = dir(0);
    let eat_count = if eat_rva != 0 {
        ctx.read_u32(dtb, base + eat_rva as u64 + 0x14).unwrap_or(0).min(0xffff)
    } else {
        0
    };
    // import directory: one _IMAGE_IMPORT_DESCRIPTOR per DLL, 20 bytes
    let (_, iat_size) = dir(1);
    let iat_count = (iat_size / 20).min(0xffff);
    (eat_count, iat_count, sections)
}
