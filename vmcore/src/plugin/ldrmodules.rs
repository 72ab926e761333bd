//! Loaded module plugin mounted at `/pid/<n>/modules`: a fixed-width
//! `modules.txt` summary plus one directory per module with base, size,
//! entry point and full path files.

use super::{Plugin, PluginCtx, VfsEntry};
use crate::error::ExtStatus;
use crate::maps::ModuleEntry;
use crate::util;

const LINE: usize = 64;

pub struct LdrModulesPlugin;

fn render_line(idx: usize, m: &ModuleEntry, pool: &str) -> String {
    let mut name = m.name.get(pool).to_string();
    name.truncate(30);
    format!("{:04x} {:016x} {:08x} {}", idx, m.base, m.image_size, name)
}

impl Plugin for LdrModulesPlugin {
    fn list(&self, ctx: &PluginCtx, out: &mut Vec<VfsEntry>) -> bool {
        let Some(proc) = &ctx.process else {
            return false;
        };
        let map = ctx.vmm.module_map_of(proc);
        if ctx.path.is_empty() {
            out.push(VfsEntry::file("modules.txt", (map.entries.len() * LINE) as u64));
            for m in &map.entries {
                out.push(VfsEntry::dir(m.name.get(&map.pool)));
            }
            return true;
        }
        // per-module directory
        let (module, rest) = util::path_split_first(ctx.path);
        if !rest.is_empty() || map.find_by_name(module).is_none() {
            return false;
        }
        let m = map.find_by_name(module).unwrap();
        out.push(VfsEntry::file("base.txt", 16));
        out.push(VfsEntry::file("entry.txt", 16));
        out.push(VfsEntry::file("size.txt", 16));
        out.push(VfsEntry::file(
            "fullname.txt",
            m.full_path.get(&map.pool).len() as u64,
        ));
        true
    }

    fn read(&self, ctx: &PluginCtx, buf: &mut [u8], offset: u64) -> (usize, ExtStatus) {
        let Some(proc) = &ctx.process else {
            return (0, ExtStatus::FileInvalid);
        };
        let map = ctx.vmm.module_map_of(proc);
        if ctx.path == "modules.txt" {
            let idx: Vec<usize> = (0..map.entries.len()).collect();
            return util::vfs_read_line_fixed(
                &idx,
                LINE,
                |&i| render_line(i, &map.entries[i], &map.pool),
                buf,
                offset,
            );
        }
        let (module, file) = util::path_split_first(ctx.path);
        let Some(m) = map.find_by_name(module) else {
            return (0, ExtStatus::FileInvalid);
        };
        match file {
            "base.txt" => util::vfs_read_u64_hex(m.base, buf, offset),
            "entry.txt" => util::vfs_read_u64_hex(m.entry_point, buf, offset),
            "size.txt" => util::vfs_read_u64_hex(m.image_size, buf, offset),
            "fullname.txt" => {
                util::vfs_read_from_buffer(m.full_path.get(&map.pool).as_bytes(), buf, offset)
            }
            _ => (0, ExtStatus::FileInvalid),
        }
    }
}
