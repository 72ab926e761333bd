//! Heap view, read from the PEB heap pointer array and sized through the
//! VAD covering each heap base.

use super::{BuildCtx, VadMap};
use crate::proc::Process;

#[derive(Debug, Clone, Copy)]
pub struct HeapEntry {
    pub va: u64,
    pub size: u64,
    pub index: u32,
    /// Default process heap is index 0.
    pub is_default: bool,
}

#[derive(Debug, Default)]
pub struct HeapMap {
    pub entries: Vec<HeapEntry>,
}

pub fn build(ctx: &BuildCtx, proc: &Process, vads: Option<&VadMap>) -> HeapMap {
    let mut map = HeapMap::default();
    if proc.win.va_peb == 0 {
        return map;
    }
    let off = &ctx.profile().peb;
    let dtb = proc.dtb;

    let Some(count) = ctx.read_u32(dtb, proc.win.va_peb + off.number_of_heaps as u64) else {
        return map;
    };
    let count = count.min(0x100);
    let Some(array) = ctx.read_ptr(dtb, proc.win.va_peb + off.process_heaps as u64) else {
        return map;
    };
    if array == 0 {
        return map;
    }

    for i in 0..count {
        let Some(heap_va) = ctx.read_ptr(dtb, array + (i as u64) * ctx.ptr_size() as u64) else {
            break;
        };
        if heap_va == 0 {
            continue;
        }
        let size = vads
            .and_then(|v| v.find(heap_va))
            .map(|e| e.va_end - e.va_start + 1)
            .unwrap_or(0);
        map.entries.push(HeapEntry { va: heap_va, size, index: i, is_default: i == 0 });
    }
    log::debug!("heap map pid {}: {} heaps", proc.pid, map.entries.len());
    map
}
