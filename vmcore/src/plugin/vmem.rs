//! Raw virtual memory window plugin mounted at `/pid/<n>/vmemd`.
//!
//! One `.vmem` file per VAD region; reads and writes pass straight through
//! the virtual memory path of the owning process.

use super::{Plugin, PluginCtx, VfsEntry};
use crate::error::ExtStatus;
use crate::mem::ReadFlags;

pub struct VmemPlugin;

fn file_name(start: u64, end: u64, tag: &str) -> String {
    if tag.is_empty() {
        format!("{:016x}-{:016x}.vmem", start, end)
    } else {
        format!("{:016x}-{:016x}-{}.vmem", start, end, sanitize(tag))
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
        .take(64)
        .collect()
}

/// Recover the VA range back out of a window file name.
fn parse_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(".vmem")?;
    let mut it = stem.splitn(3, '-');
    let start = u64::from_str_radix(it.next()?, 16).ok()?;
    let end = u64::from_str_radix(it.next()?, 16).ok()?;
    (end >= start).then_some((start, end))
}

impl Plugin for VmemPlugin {
    fn list(&self, ctx: &PluginCtx, out: &mut Vec<VfsEntry>) -> bool {
        if !ctx.path.is_empty() {
            return false;
        }
        let Some(proc) = &ctx.process else {
            return false;
        };
        let vads = ctx.vmm.vad_map_of(proc);
        for e in &vads.entries {
            let tag = e.file.get(&vads.pool);
            let tag = tag.rsplit(['/', '\\']).next().unwrap_or("");
            out.push(VfsEntry::file(
                file_name(e.va_start, e.va_end, tag),
                e.va_end - e.va_start + 1,
            ));
        }
        true
    }

    fn read(&self, ctx: &PluginCtx, buf: &mut [u8], offset: u64) -> (usize, ExtStatus) {
        let Some(proc) = &ctx.process else {
            return (0, ExtStatus::FileInvalid);
        };
        let Some((start, end)) = parse_name(ctx.path) else {
            return (0, ExtStatus::FileInvalid);
        };
        let size = end - start + 1;
        if offset >= size {
            return (0, ExtStatus::EndOfFile);
        }
        let n = buf.len().min((size - offset) as usize);
        let read = ctx.vmm.mem().virt_read_into(
            ctx.vmm.model(),
            proc.dtb,
            start + offset,
            &mut buf[..n],
            ReadFlags::ZEROPAD,
        );
        (read, ExtStatus::Success)
    }

    fn write(&self, ctx: &PluginCtx, data: &[u8], offset: u64) -> (usize, ExtStatus) {
        let Some(proc) = &ctx.process else {
            return (0, ExtStatus::FileInvalid);
        };
        let Some((start, end)) = parse_name(ctx.path) else {
            return (0, ExtStatus::FileInvalid);
        };
        let size = end - start + 1;
        if offset >= size {
            return (0, ExtStatus::EndOfFile);
        }
        let n = data.len().min((size - offset) as usize);
        let written =
            ctx.vmm.mem().virt_write(ctx.vmm.model(), proc.dtb, start + offset, &data[..n]);
        // sub-range failures surface as a short count, not an error
        (written, ExtStatus::Success)
    }
}
