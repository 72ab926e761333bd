//! Thread view, walked from `_EPROCESS.ThreadListHead`.

use super::{u64_at, u8_at, BuildCtx, WALK_MAX};
use crate::ob::ObSet;
use crate::proc::Process;

#[derive(Debug, Clone, Copy)]
pub struct ThreadEntry {
    pub tid: u32,
    pub va_ethread: u64,
    pub va_teb: u64,
    pub start_address: u64,
    pub win32_start_address: u64,
    pub priority: u8,
    pub state: u8,
}

#[derive(Debug, Default)]
pub struct ThreadMap {
    pub entries: Vec<ThreadEntry>,
}

pub fn build(ctx: &BuildCtx, proc: &Process) -> ThreadMap {
    let mut map = ThreadMap::default();
    let off = &ctx.profile().ethread;
    let head = proc.win.va_eprocess + ctx.profile().eprocess.thread_list_head as u64;
    let Some(mut link) = ctx.read_ptr(proc.dtb, head) else {
        return map;
    };

    let visited = ObSet::new();
    visited.push(head);

    while link != head && link != 0 && visited.push(link) {
        if map.entries.len() >= WALK_MAX {
            log::warn!("thread list walk cap reached for pid {}", proc.pid);
            break;
        }
        let va_ethread = link.wrapping_sub(off.thread_list_entry as u64);
        if let Some(rec) = ctx.read_struct(proc.dtb, va_ethread, off.size as usize) {
            let tid = u64_at(&rec, off.cid_unique_thread) as u32;
            if tid != 0 {
                map.entries.push(ThreadEntry {
                    tid,
                    va_ethread,
                    va_teb: u64_at(&rec, off.teb),
                    start_address: u64_at(&rec, off.start_address),
                    win32_start_address: u64_at(&rec, off.win32_start_address),
                    priority: u8_at(&rec, off.priority),
                    state: u8_at(&rec, off.state),
                });
            }
        }
        link = match ctx.read_ptr(proc.dtb, link) {
            Some(next) => next,
            None => break,
        };
    }

    map.entries.sort_by_key(|e| e.tid);
    log::debug!("thread map pid {}: {} threads", proc.pid, map.entries.len());
    map
}
