//! Virtual address descriptor view, walked from the `_MMVAD` AVL tree.

use super::{u32_at, u64_at, u8_at, BuildCtx, WALK_MAX};
use crate::ob::{ObSet, ObStrMap, TextRef};
use crate::proc::Process;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadKind {
    Private,
    Mapped,
    Image,
}

#[derive(Debug, Clone, Copy)]
pub struct VadEntry {
    pub va_start: u64,
    /// Inclusive end address.
    pub va_end: u64,
    pub kind: VadKind,
    pub protection: u32,
    pub file: TextRef,
}

#[derive(Debug, Default)]
pub struct VadMap {
    pub entries: Vec<VadEntry>,
    pub pool: String,
}

impl VadMap {
    pub fn find(&self, va: u64) -> Option<&VadEntry> {
        let i = crate::util::lower_bound(&self.entries, va, |e| e.va_end);
        self.entries.get(i).filter(|e| va >= e.va_start && va <= e.va_end)
    }
}

pub fn build(ctx: &BuildCtx, proc: &Process) -> VadMap {
    let mut map = VadMap::default();
    let off = &ctx.profile().vad;
    let root_ptr_va = proc.win.va_eprocess + ctx.profile().eprocess.vad_root as u64;
    let Some(root) = ctx.read_ptr(proc.dtb, root_ptr_va) else {
        return map;
    };

    let mut pool = ObStrMap::new();
    let visited = ObSet::new();
    let mut stack = vec![root];

    while let Some(node) = stack.pop() {
        if node == 0 || !visited.push(node) || map.entries.len() >= WALK_MAX {
            continue;
        }
        let Some(rec) = ctx.read_struct(proc.dtb, node, off.size as usize) else {
            continue;
        };
        stack.push(u64_at(&rec, off.node_left));
        stack.push(u64_at(&rec, off.node_right));

        let start_vpn =
            u32_at(&rec, off.starting_vpn) as u64 | ((u8_at(&rec, off.starting_vpn_high) as u64) << 32);
        let end_vpn =
            u32_at(&rec, off.ending_vpn) as u64 | ((u8_at(&rec, off.ending_vpn_high) as u64) << 32);
        if end_vpn < start_vpn {
            continue;
        }

        let flags = u32_at(&rec, off.flags);
        let vad_type = flags & 0x7;
        let protection = (flags >> 3) & 0x1f;
        let private = flags & (1 << 20) != 0;
        let kind = if vad_type == 2 {
            VadKind::Image
        } else if private {
            VadKind::Private
        } else {
            VadKind::Mapped
        };

        let file = if kind != VadKind::Private {
            backing_file(ctx, proc.dtb, node, &rec).map(|f| pool.push(&f)).unwrap_or_default()
        } else {
            TextRef::default()
        };

        map.entries.push(VadEntry {
            va_start: start_vpn << 12,
            va_end: (end_vpn << 12) | 0xfff,
            kind,
            protection,
            file,
        });
    }

    map.entries.sort_by_key(|e| e.va_start);
    map.pool = pool.finalize();
    log::debug!("vad map pid {}: {} descriptors", proc.pid, map.entries.len());
    map
}

/// Resolve the backing file of a mapped/image VAD through
/// subsection -> control area -> file object. Any broken link gives None.
fn backing_file(ctx: &BuildCtx, dtb: u64, node: u64, rec: &[u8]) -> Option<String> {
    let off = &ctx.profile().vad;
    let fr = &ctx.profile().file_ref;
    if off.subsection >= off.size {
        return None;
    }
    let subsection = u64_at(rec, off.subsection);
    if subsection == 0 || subsection == node {
        return None;
    }
    let control_area = ctx.read_ptr(dtb, subsection + fr.subsection_control_area as u64)?;
    if control_area == 0 {
        return None;
    }
    // low bits of the file pointer are reference-count flags
    let file_object =
        ctx.read_ptr(dtb, control_area + fr.control_area_file_pointer as u64)? & !0xf;
    if file_object == 0 {
        return None;
    }
    ctx.read_unicode_string(dtb, file_object + fr.file_object_file_name as u64)
}
