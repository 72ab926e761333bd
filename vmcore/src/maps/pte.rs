//! Page table view: present runs of the process address space with their
//! effective protection, annotated with the owning module where one covers
//! the run.

use super::{BuildCtx, ModuleMap};
use crate::mem::mmu::{self, PteProt};
use crate::ob::{ObStrMap, TextRef};
use crate::proc::Process;

#[derive(Debug, Clone, Copy)]
pub struct PteEntry {
    pub va: u64,
    /// Number of 4 KiB pages.
    pub pages: u64,
    pub prot: PteProt,
    pub module: TextRef,
}

#[derive(Debug, Default)]
pub struct PteMap {
    pub entries: Vec<PteEntry>,
    pub pool: String,
}

pub fn build(ctx: &BuildCtx, proc: &Process, modules: Option<&ModuleMap>) -> PteMap {
    let va_max = if proc.user_only { user_va_max(ctx) } else { ctx.model.va_max() };
    let runs = mmu::collect_runs(ctx.mem, ctx.model, proc.dtb, va_max);

    let mut pool = ObStrMap::new();
    let entries = runs
        .into_iter()
        .map(|r| {
            let module = modules
                .and_then(|m| m.find_by_va(r.va))
                .map(|e| {
                    let name = e.name.get(&modules.unwrap().pool).to_string();
                    pool.push(&name)
                })
                .unwrap_or_default();
            PteEntry { va: r.va, pages: r.pages, prot: r.prot, module }
        })
        .collect();

    let map = PteMap { entries, pool: pool.finalize() };
    log::debug!("pte map pid {}: {} runs", proc.pid, map.entries.len());
    map
}

fn user_va_max(ctx: &BuildCtx) -> u64 {
    if ctx.model.is_32bit() {
        0x7fff_ffff
    } else {
        0x7fff_ffff_ffff
    }
}
