//! Kernel big-pool view, decoded from `nt!PoolBigPageTable`.

use super::{u32_at, u64_at, BuildCtx};
use crate::mem::ReadFlags;
use crate::proc::Process;

/// Upper bound on table entries considered (1M records).
const POOL_TABLE_MAX: u64 = 0x100000;

#[derive(Debug, Clone, Copy)]
pub struct PoolEntry {
    pub va: u64,
    pub size: u64,
    pub tag: [u8; 4],
    pub alloc: bool,
}

#[derive(Debug, Default)]
pub struct PoolMap {
    pub entries: Vec<PoolEntry>,
}

impl PoolMap {
    pub fn with_tag(&self, tag: &[u8; 4]) -> impl Iterator<Item = &PoolEntry> {
        let tag = *tag;
        self.entries.iter().filter(move |e| e.tag == tag && e.alloc)
    }
}

pub fn build(ctx: &BuildCtx, system: &Process) -> PoolMap {
    let mut map = PoolMap::default();
    let dtb = system.dtb;
    let Some(table_sym) = ctx.symbols.symbol_va("nt", "PoolBigPageTable") else {
        return map;
    };
    let Some(size_sym) = ctx.symbols.symbol_va("nt", "PoolBigPageTableSize") else {
        return map;
    };
    let Some(table) = ctx.read_ptr(dtb, table_sym) else {
        return map;
    };
    let Some(count) = ctx.read_ptr(dtb, size_sym) else {
        return map;
    };
    if table == 0 || count == 0 || count > POOL_TABLE_MAX {
        return map;
    }

    let off = &ctx.profile().pool;
    let entry_size = off.entry_size as usize;
    let mut raw = vec![0u8; count as usize * entry_size];
    ctx.mem.virt_read_into(ctx.model, dtb, table, &mut raw, ReadFlags::ZEROPAD);

    for rec in raw.chunks_exact(entry_size) {
        let va = u64_at(rec, off.va);
        if va <= 1 {
            continue;
        }
        let key = u32_at(rec, off.key);
        map.entries.push(PoolEntry {
            // the low bit marks a freed allocation
            va: va & !1,
            size: u64_at(rec, off.bytes),
            tag: key.to_le_bytes(),
            alloc: va & 1 == 0,
        });
    }
    map.entries.sort_by_key(|e| e.va);
    log::debug!("pool map: {} big-pool records", map.entries.len());
    map
}
