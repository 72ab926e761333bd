//! Handle table view, decoded from the up to three level `_HANDLE_TABLE`.

use super::BuildCtx;
use crate::mem::{ReadFlags, PAGE_SIZE};
use crate::proc::Process;

/// Handle entries per level-0 table page.
const L0_ENTRIES: usize = PAGE_SIZE / 16;
const PTRS_PER_PAGE: usize = PAGE_SIZE / 8;

#[derive(Debug, Clone, Copy)]
pub struct HandleEntry {
    pub handle: u32,
    pub va_object: u64,
    pub granted_access: u32,
    pub type_index: u8,
}

#[derive(Debug, Default)]
pub struct HandleMap {
    pub entries: Vec<HandleEntry>,
}

pub fn build(ctx: &BuildCtx, proc: &Process) -> HandleMap {
    let mut map = HandleMap::default();
    if ctx.model.is_32bit() {
        // the compact 64-bit entry encoding below does not apply
        return map;
    }
    let table_va = proc.win.va_eprocess + ctx.profile().eprocess.object_table as u64;
    let Some(handle_table) = ctx.read_ptr(proc.dtb, table_va) else {
        return map;
    };
    if handle_table == 0 {
        return map;
    }
    let Some(table_code) =
        ctx.read_ptr(proc.dtb, handle_table + ctx.profile().handle_table.table_code as u64)
    else {
        return map;
    };
    let level = (table_code & 3) as u32;
    let base = table_code & !0xfu64;

    match level {
        0 => decode_l0(ctx, proc, base, 0, &mut map),
        1 => decode_l1(ctx, proc, base, 0, &mut map),
        2 => {
            for (i, l1) in read_ptr_page(ctx, proc, base).into_iter().enumerate() {
                if l1 != 0 {
                    decode_l1(ctx, proc, l1, (i * PTRS_PER_PAGE * L0_ENTRIES) as u32, &mut map);
                }
            }
        }
        _ => {}
    }
    log::debug!("handle map pid {}: {} handles", proc.pid, map.entries.len());
    map
}

fn decode_l1(ctx: &BuildCtx, proc: &Process, base: u64, handle_base: u32, map: &mut HandleMap) {
    for (i, l0) in read_ptr_page(ctx, proc, base).into_iter().enumerate() {
        if l0 != 0 {
            decode_l0(ctx, proc, l0, handle_base + (i * L0_ENTRIES) as u32, map);
        }
    }
}

fn decode_l0(ctx: &BuildCtx, proc: &Process, base: u64, handle_base: u32, map: &mut HandleMap) {
    let mut page = vec![0u8; PAGE_SIZE];
    if ctx.mem.virt_read_into(ctx.model, proc.dtb, base, &mut page, ReadFlags::empty())
        != PAGE_SIZE
    {
        return;
    }
    for i in 0..L0_ENTRIES {
        let lo = u64::from_le_bytes(page[i * 16..i * 16 + 8].try_into().unwrap());
        let hi = u64::from_le_bytes(page[i * 16 + 8..i * 16 + 16].try_into().unwrap());
        if lo == 0 {
            continue;
        }
        // ObjectPointerBits (bits 20..64) shifted to a kernel address
        let va_object = ((lo >> 20) << 4) | 0xffff_0000_0000_0000;
        let granted_access = (hi & 0x1ff_ffff) as u32;
        let type_index = object_type_index(ctx, proc, va_object);
        map.entries.push(HandleEntry {
            // the first table slot is reserved, handles start at 4
            handle: (handle_base + i as u32) * 4,
            va_object,
            granted_access,
            type_index,
        });
    }
}

/// TypeIndex byte of the object header preceding the object body.
fn object_type_index(ctx: &BuildCtx, proc: &Process, va_object: u64) -> u8 {
    ctx.read_u32(proc.dtb, va_object - 0x30 + 0x18)
        .map(|v| v as u8)
        .unwrap_or(0)
}

fn read_ptr_page(ctx: &BuildCtx, proc: &Process, base: u64) -> Vec<u64> {
    let mut page = vec![0u8; PAGE_SIZE];
    if ctx.mem.virt_read_into(ctx.model, proc.dtb, base, &mut page, ReadFlags::empty())
        != PAGE_SIZE
    {
        return Vec::new();
    }
    page.chunks_exact(8).map(|c| u64::from_le_bytes(c.try_into().unwrap())).collect()
}
