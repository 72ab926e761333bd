//! Path addressed plugin tree.
//!
//! Plugins register a name plus a subset of list/read/write/close and a
//! scope: mounted at the root, under every process (`/pid/<n>/...` and
//! `/name/<name>/...`), or both. Dispatch resolves the process prefix, then
//! the first matching plugin wins; misses surface as `FileInvalid`.

pub mod ldrmodules;
pub mod search;
pub mod vmem;

use crate::error::ExtStatus;
use crate::handle::Vmm;
use crate::proc::Process;
use crate::util;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

impl VfsEntry {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self { name: name.into(), size, is_dir: false }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self { name: name.into(), size: 0, is_dir: true }
    }
}

/// Dispatch context handed to plugin callbacks: the owning handle, the
/// resolved process for process-scope calls and the remaining sub-path.
pub struct PluginCtx<'a> {
    pub vmm: &'a Arc<Vmm>,
    pub process: Option<Arc<Process>>,
    pub path: &'a str,
}

/// A registered subsystem. `list` never side-effects guest memory; absence
/// of `write` makes the subtree read-only.
pub trait Plugin: Send + Sync {
    fn list(&self, ctx: &PluginCtx, out: &mut Vec<VfsEntry>) -> bool;

    fn read(&self, _ctx: &PluginCtx, _buf: &mut [u8], _offset: u64) -> (usize, ExtStatus) {
        (0, ExtStatus::FileInvalid)
    }

    fn write(&self, _ctx: &PluginCtx, _data: &[u8], _offset: u64) -> (usize, ExtStatus) {
        (0, ExtStatus::Unsuccessful)
    }

    /// Fires once at handle shutdown, in registration-reverse order.
    fn close(&self) {}
}

struct PluginEntry {
    name: String,
    root_scope: bool,
    process_scope: bool,
    plugin: Arc<dyn Plugin>,
}

#[derive(Default)]
pub struct PluginRegistry {
    entries: RwLock<Vec<PluginEntry>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under a name; duplicate names are refused.
    pub fn register(
        &self,
        name: &str,
        root_scope: bool,
        process_scope: bool,
        plugin: Arc<dyn Plugin>,
    ) -> bool {
        let name = util::path_normalize(name);
        if name.is_empty() || name.contains('/') {
            return false;
        }
        let mut entries = self.entries.write().unwrap();
        if entries.iter().any(|e| e.name == name) {
            return false;
        }
        log::debug!("plugin registered: {} (root={}, process={})", name, root_scope, process_scope);
        entries.push(PluginEntry { name, root_scope, process_scope, plugin });
        true
    }

    pub fn unregister(&self, name: &str) -> bool {
        let name = util::path_normalize(name);
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|e| e.name != name);
        before != entries.len()
    }

    fn find(&self, name: &str, process_scope: bool) -> Option<Arc<dyn Plugin>> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .find(|e| e.name == name && if process_scope { e.process_scope } else { e.root_scope })
            .map(|e| Arc::clone(&e.plugin))
    }

    fn names(&self, process_scope: bool) -> Vec<String> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .filter(|e| if process_scope { e.process_scope } else { e.root_scope })
            .map(|e| e.name.clone())
            .collect()
    }

    /// Shutdown: close callbacks fire in registration-reverse order.
    pub fn close_all(&self) {
        let drained: Vec<PluginEntry> = {
            let mut entries = self.entries.write().unwrap();
            entries.drain(..).collect()
        };
        for e in drained.into_iter().rev() {
            log::debug!("plugin close: {}", e.name);
            e.plugin.close();
        }
    }
}

//
// Dispatch. Paths arrive in either separator style; normalization happens
// once at this boundary.
//

pub fn vfs_list(vmm: &Arc<Vmm>, path: &str) -> Option<Vec<VfsEntry>> {
    let path = util::path_normalize(path);
    let mut out = Vec::new();

    if path.is_empty() {
        out.push(VfsEntry::dir("name"));
        out.push(VfsEntry::dir("pid"));
        for name in vmm.plugins.names(false) {
            out.push(VfsEntry::dir(name));
        }
        return Some(out);
    }

    let (seg, rest) = util::path_split_first(&path);
    match seg {
        "pid" if rest.is_empty() => {
            for p in vmm.table.list() {
                out.push(VfsEntry::dir(p.pid.to_string()));
            }
            Some(out)
        }
        "name" if rest.is_empty() => {
            for p in vmm.table.list() {
                out.push(VfsEntry::dir(format!("{}-{}", sanitize(&p.name), p.pid)));
            }
            Some(out)
        }
        "pid" | "name" => {
            let (proc_seg, sub) = util::path_split_first(rest);
            let process = resolve_process(vmm, seg, proc_seg)?;
            if sub.is_empty() {
                for name in vmm.plugins.names(true) {
                    out.push(VfsEntry::dir(name));
                }
                return Some(out);
            }
            let (plugin_name, plugin_path) = util::path_split_first(sub);
            let plugin = vmm.plugins.find(plugin_name, true)?;
            let ctx = PluginCtx { vmm, process: Some(process), path: plugin_path };
            plugin.list(&ctx, &mut out).then_some(out)
        }
        _ => {
            let (plugin_name, plugin_path) = (seg, rest);
            let plugin = vmm.plugins.find(plugin_name, false)?;
            let ctx = PluginCtx { vmm, process: None, path: plugin_path };
            plugin.list(&ctx, &mut out).then_some(out)
        }
    }
}

pub fn vfs_read(vmm: &Arc<Vmm>, path: &str, buf: &mut [u8], offset: u64) -> (usize, ExtStatus) {
    match resolve(vmm, path) {
        Some((plugin, process, sub)) => {
            let ctx = PluginCtx { vmm, process, path: &sub };
            plugin.read(&ctx, buf, offset)
        }
        None => (0, ExtStatus::FileInvalid),
    }
}

pub fn vfs_write(vmm: &Arc<Vmm>, path: &str, data: &[u8], offset: u64) -> (usize, ExtStatus) {
    match resolve(vmm, path) {
        Some((plugin, process, sub)) => {
            let ctx = PluginCtx { vmm, process, path: &sub };
            plugin.write(&ctx, data, offset)
        }
        None => (0, ExtStatus::FileInvalid),
    }
}

type Resolved = (Arc<dyn Plugin>, Option<Arc<Process>>, String);

fn resolve(vmm: &Arc<Vmm>, path: &str) -> Option<Resolved> {
    let path = util::path_normalize(path);
    let (seg, rest) = util::path_split_first(&path);
    match seg {
        "pid" | "name" => {
            let (proc_seg, sub) = util::path_split_first(rest);
            let process = resolve_process(vmm, seg, proc_seg)?;
            let (plugin_name, plugin_path) = util::path_split_first(sub);
            let plugin = vmm.plugins.find(plugin_name, true)?;
            Some((plugin, Some(process), plugin_path.to_string()))
        }
        "" => None,
        _ => {
            let plugin = vmm.plugins.find(seg, false)?;
            Some((plugin, None, rest.to_string()))
        }
    }
}

fn resolve_process(vmm: &Arc<Vmm>, kind: &str, seg: &str) -> Option<Arc<Process>> {
    if seg.is_empty() {
        return None;
    }
    if kind == "pid" {
        return vmm.table.get(seg.parse().ok()?);
    }
    // name dirs carry a "-<pid>" suffix; accept both forms
    if let Some((name, pid)) = seg.rsplit_once('-') {
        if let Ok(pid) = pid.parse::<u32>() {
            if let Some(p) = vmm.table.get(pid) {
                if sanitize(&p.name) == name {
                    return Some(p);
                }
            }
        }
    }
    vmm.table.get_by_name(seg)
}

fn sanitize(name: &str) -> String {
    name.chars().map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c }).collect()
}
