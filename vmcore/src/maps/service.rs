//! Service view, reconstructed from the service control manager database
//! inside the services.exe process.

use super::{u32_at, u64_at, BuildCtx, WALK_MAX};
use crate::ob::{ObSet, ObStrMap, TextRef};
use crate::proc::ProcessTable;

#[derive(Debug, Clone, Copy)]
pub struct ServiceEntry {
    pub ordinal: u32,
    pub state: u32,
    pub pid: u32,
    pub name: TextRef,
    pub display: TextRef,
    pub va_record: u64,
}

#[derive(Debug, Default)]
pub struct ServiceMap {
    pub entries: Vec<ServiceEntry>,
    pub pool: String,
}

pub fn build(ctx: &BuildCtx, table: &ProcessTable) -> ServiceMap {
    let mut map = ServiceMap::default();
    let Some(services) = table.get_by_name("services.exe") else {
        return map;
    };
    let Some(head) = ctx.symbols.symbol_va("services", "ServiceDatabase") else {
        return map;
    };
    let off = &ctx.profile().service;
    let dtb = services.dtb;

    let Some(mut link) = ctx.read_ptr(dtb, head) else {
        return map;
    };
    let visited = ObSet::new();
    visited.push(head);
    let mut pool = ObStrMap::new();

    while link != head && link != 0 && visited.push(link) {
        if map.entries.len() >= WALK_MAX {
            log::warn!("service record walk cap reached");
            break;
        }
        let va_record = link.wrapping_sub(off.list_entry as u64);
        let Some(rec) = ctx.read_struct(dtb, va_record, off.size as usize) else {
            break;
        };
        let name = read_utf16_ptr(ctx, dtb, u64_at(&rec, off.name_ptr));
        if let Some(name) = name {
            let display = read_utf16_ptr(ctx, dtb, u64_at(&rec, off.display_ptr)).unwrap_or_default();
            map.entries.push(ServiceEntry {
                ordinal: u32_at(&rec, off.ordinal),
                state: u32_at(&rec, off.state),
                pid: u32_at(&rec, off.pid),
                name: pool.push(&name),
                display: pool.push(&display),
                va_record,
            });
        }
        link = match ctx.read_ptr(dtb, link) {
            Some(next) => next,
            None => break,
        };
    }

    map.entries.sort_by_key(|e| e.ordinal);
    map.pool = pool.finalize();
    log::debug!("service map: {} services", map.entries.len());
    map
}

/// NUL-terminated UTF-16 string behind a pointer; capped at 260 chars.
fn read_utf16_ptr(ctx: &BuildCtx, dtb: u64, va: u64) -> Option<String> {
    if va == 0 {
        return None;
    }
    let raw = ctx.read_struct(dtb, va, 260 * 2)?;
    let s = crate::util::utf16_to_string(&raw);
    (!s.is_empty()).then_some(s)
}
