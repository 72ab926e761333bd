//! Virtual memory search plugin mounted at `/pid/<n>/search`.
//!
//! A write to `search.txt` commits the hex pattern and queues the scan on a
//! worker; progress is observable through `status.txt` and results through
//! `result.txt` once completed. Writing `1` to `reset.txt` drops the
//! context and aborts a running scan at its next chunk boundary.

use super::{Plugin, PluginCtx, VfsEntry};
use crate::error::ExtStatus;
use crate::handle::Vmm;
use crate::mem::search::{virt_search, SearchContext, SearchTerm, SEARCH_PATTERN_MAX};
use crate::ob::{Ob, ObMap};
use crate::util;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const README: &str = "Information about the search module\n\
===================================\n\
Write a hexascii sequence into search.txt and save to trigger a binary search\n\
in virtual address space for the data searched. The results once completed is\n\
shown in result.txt\n\
---\n\
Before a search is initiated (by writing to search.txt) it is possible to add\n\
additional constraints to writeable files:\n\
align.txt, addr-min.txt, addr-max.txt, search-skip-bitmask.txt.\n\
---\n\
An ongoing search may be cancelled by writing '1' to reset.txt.\n\
Additional info is shown in status.txt.\n";

const RESULT_LINE: usize = 17;

/// Pending configuration, mutable only before the scan starts.
#[derive(Debug, Clone)]
struct JobConfig {
    pattern: Vec<u8>,
    skip_mask: Vec<u8>,
    align: u32,
    va_min: u64,
    va_max: u64,
}

/// Per-process search state kept in the plugin's OB-counted map.
pub struct SearchJob {
    pid: u32,
    config: Mutex<JobConfig>,
    active: AtomicBool,
    completed: AtomicBool,
    /// Live progress block, present once the worker started.
    progress: Mutex<Option<Arc<SearchContext>>>,
    result: Mutex<Option<Vec<u64>>>,
}

impl SearchJob {
    fn status_name(&self) -> &'static str {
        if self.active.load(Ordering::Acquire) {
            "RUNNING"
        } else if self.completed.load(Ordering::Acquire) {
            "COMPLETED"
        } else {
            "NOT_STARTED"
        }
    }

    fn idle(&self) -> bool {
        !self.active.load(Ordering::Acquire) && !self.completed.load(Ordering::Acquire)
    }

    fn request_abort(&self) {
        if let Some(p) = &*self.progress.lock().unwrap() {
            p.abort.store(true, Ordering::Release);
        }
    }

    fn status_text(&self) -> String {
        let c = self.config.lock().unwrap().clone();
        let (current, read, hits) = match &*self.progress.lock().unwrap() {
            Some(p) => (
                p.va_current.load(Ordering::Relaxed),
                p.bytes_read.load(Ordering::Relaxed),
                p.hits.load(Ordering::Relaxed),
            ),
            None => (0, 0, 0),
        };
        format!(
            "Status:          {}\n\
             Search size:     {}\n\
             Search align:    {}\n\
             Min address:     0x{:x}\n\
             Max address:     0x{:x}\n\
             Current address: 0x{:x}\n\
             Bytes read:      0x{:x}\n\
             Search hits:     {}\n",
            self.status_name(),
            c.pattern.len(),
            c.align,
            c.va_min,
            c.va_max,
            current,
            read,
            hits
        )
    }
}

/// Abort relay fired when the job leaves the plugin map for good.
fn job_cleanup(job: &SearchJob) {
    job.request_abort();
}

pub struct SearchPlugin {
    jobs: ObMap<SearchJob>,
    /// Serializes the whole check/mutate/start sequence of a write; two
    /// concurrent committers must not interleave on the same job.
    write_lock: Mutex<()>,
    handle_id: u64,
}

impl SearchPlugin {
    pub fn new(handle_id: u64) -> Self {
        Self { jobs: ObMap::new(), write_lock: Mutex::new(()), handle_id }
    }

    /// Fetch or create the per-process job.
    fn job(&self, vmm: &Arc<Vmm>, pid: u32) -> Ob<SearchJob> {
        if let Some(job) = self.jobs.get(pid as u64) {
            return job;
        }
        let user_only = vmm.table.get(pid).map(|p| p.user_only).unwrap_or(false);
        let va_max = match (vmm.model().is_32bit(), user_only) {
            (true, true) => 0x7fff_ffff,
            (true, false) => 0xffff_ffff,
            (false, true) => 0x7fff_ffff_ffff,
            (false, false) => u64::MAX,
        };
        let job = Ob::alloc_with_cleanup(
            self.handle_id,
            b"SRCH",
            SearchJob {
                pid,
                config: Mutex::new(JobConfig {
                    pattern: Vec::new(),
                    skip_mask: Vec::new(),
                    align: 1,
                    va_min: 0,
                    va_max,
                }),
                active: AtomicBool::new(false),
                completed: AtomicBool::new(false),
                progress: Mutex::new(None),
                result: Mutex::new(None),
            },
            Some(job_cleanup),
        );
        // a concurrent creator may have won the race
        if !self.jobs.push(pid as u64, job.clone()) {
            if let Some(existing) = self.jobs.get(pid as u64) {
                return existing;
            }
        }
        job
    }

    fn start(&self, vmm: &Arc<Vmm>, job: &Ob<SearchJob>) {
        if job.completed.load(Ordering::Acquire) {
            return;
        }
        // exactly one of two concurrent starters flips active
        if job.active.swap(true, Ordering::AcqRel) {
            return;
        }
        let c = job.config.lock().unwrap().clone();
        let ctx = Arc::new(SearchContext::new(
            SearchTerm { pattern: c.pattern, skip_mask: c.skip_mask, align: c.align },
            c.va_min,
            c.va_max,
        ));
        *job.progress.lock().unwrap() = Some(Arc::clone(&ctx));

        let worker_vmm = Arc::clone(vmm);
        let worker_job = job.clone();
        let submitted = vmm.pool().submit(move || {
            if let Some(proc) = worker_vmm.table.get(worker_job.pid) {
                let hits = virt_search(
                    worker_vmm.mem(),
                    worker_vmm.model(),
                    proc.dtb,
                    &ctx,
                    worker_vmm.abort_flag(),
                );
                *worker_job.result.lock().unwrap() = Some(hits);
            }
            worker_job.completed.store(true, Ordering::Release);
            worker_job.active.store(false, Ordering::Release);
        });
        if !submitted {
            job.active.store(false, Ordering::Release);
        }
    }
}

impl Plugin for SearchPlugin {
    fn list(&self, ctx: &PluginCtx, out: &mut Vec<VfsEntry>) -> bool {
        if !ctx.path.is_empty() {
            return false;
        }
        let Some(proc) = &ctx.process else {
            return false;
        };
        let job = self.job(ctx.vmm, proc.pid);
        let c = job.config.lock().unwrap().clone();
        let result_size = job
            .result
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| (r.len() * RESULT_LINE) as u64)
            .unwrap_or(0);
        out.push(VfsEntry::file("addr-max.txt", 16));
        out.push(VfsEntry::file("addr-min.txt", 16));
        out.push(VfsEntry::file("align.txt", 10));
        out.push(VfsEntry::file("readme.txt", README.len() as u64));
        out.push(VfsEntry::file("reset.txt", 1));
        out.push(VfsEntry::file("result.txt", result_size));
        out.push(VfsEntry::file("search.txt", (c.pattern.len() * 2) as u64));
        out.push(VfsEntry::file("search-skip-bitmask.txt", (c.skip_mask.len() * 2) as u64));
        out.push(VfsEntry::file("status.txt", job.status_text().len() as u64));
        true
    }

    fn read(&self, ctx: &PluginCtx, buf: &mut [u8], offset: u64) -> (usize, ExtStatus) {
        let Some(proc) = &ctx.process else {
            return (0, ExtStatus::FileInvalid);
        };
        let job = self.job(ctx.vmm, proc.pid);
        match ctx.path {
            "readme.txt" => util::vfs_read_from_buffer(README.as_bytes(), buf, offset),
            "status.txt" => util::vfs_read_from_buffer(job.status_text().as_bytes(), buf, offset),
            "reset.txt" => util::vfs_read_from_buffer(b"0", buf, offset),
            "align.txt" => {
                let c = job.config.lock().unwrap();
                util::vfs_read_u32_dec(c.align, buf, offset)
            }
            "addr-min.txt" => {
                let c = job.config.lock().unwrap();
                util::vfs_read_u64_hex(c.va_min, buf, offset)
            }
            "addr-max.txt" => {
                let c = job.config.lock().unwrap();
                util::vfs_read_u64_hex(c.va_max, buf, offset)
            }
            "search.txt" => {
                let c = job.config.lock().unwrap();
                util::vfs_read_from_buffer(util::bytes_to_hexascii(&c.pattern).as_bytes(), buf, offset)
            }
            "search-skip-bitmask.txt" => {
                let c = job.config.lock().unwrap();
                util::vfs_read_from_buffer(
                    util::bytes_to_hexascii(&c.skip_mask).as_bytes(),
                    buf,
                    offset,
                )
            }
            "result.txt" => {
                let result = job.result.lock().unwrap();
                match &*result {
                    Some(hits) if job.completed.load(Ordering::Acquire) => util::vfs_read_line_fixed(
                        hits,
                        RESULT_LINE,
                        |va| format!("{:016x}", va),
                        buf,
                        offset,
                    ),
                    _ => (0, ExtStatus::EndOfFile),
                }
            }
            _ => (0, ExtStatus::FileInvalid),
        }
    }

    fn write(&self, ctx: &PluginCtx, data: &[u8], offset: u64) -> (usize, ExtStatus) {
        let Some(proc) = &ctx.process else {
            return (0, ExtStatus::FileInvalid);
        };
        let pid = proc.pid;
        let job = self.job(ctx.vmm, pid);

        // the idle check, the config mutation and the start below form one
        // critical section; of two racing commits exactly one starts the
        // worker and the other lands after the job left the idle state
        let _serial = self.write_lock.lock().unwrap();

        if ctx.path == "reset.txt" {
            if util::vfs_write_bool(data) == Some(true) {
                // dropping the map reference aborts a running worker at its
                // next chunk boundary; a fresh context appears on next use
                job.request_abort();
                self.jobs.remove(pid as u64);
            }
            return (data.len(), ExtStatus::Success);
        }

        // configuration and start are refused once a search ran
        if !job.idle() {
            return (data.len(), ExtStatus::Success);
        }

        match ctx.path {
            "align.txt" => {
                if let Some(v) = util::vfs_write_number(data, offset) {
                    let v = if v == 0 { 1 } else { v };
                    if v <= 0x1000_0000 && (v as u32).is_power_of_two() {
                        let mut c = job.config.lock().unwrap();
                        c.align = v as u32;
                    }
                }
            }
            "addr-min.txt" => {
                if let Some(v) = util::vfs_write_hex(data, offset) {
                    let mut c = job.config.lock().unwrap();
                    c.va_min = v & !0xfff;
                }
            }
            "addr-max.txt" => {
                if let Some(v) = util::vfs_write_hex(data, offset) {
                    let mut c = job.config.lock().unwrap();
                    c.va_max = v.saturating_sub(1) | 0xfff;
                }
            }
            "search-skip-bitmask.txt" => {
                if let Some(mask) = util::hexascii_to_bytes(&String::from_utf8_lossy(data)) {
                    if !mask.is_empty() && mask.len() <= SEARCH_PATTERN_MAX {
                        let mut c = job.config.lock().unwrap();
                        c.skip_mask = mask;
                    }
                }
            }
            "search.txt" => {
                if let Some(pattern) = util::hexascii_to_bytes(&String::from_utf8_lossy(data)) {
                    if !pattern.is_empty() && pattern.len() <= SEARCH_PATTERN_MAX {
                        {
                            let mut c = job.config.lock().unwrap();
                            if !c.skip_mask.is_empty() && c.skip_mask.len() != pattern.len() {
                                c.skip_mask.resize(pattern.len(), 0);
                            }
                            c.pattern = pattern;
                        }
                        log::info!("search start pid {}", pid);
                        self.start(ctx.vmm, &job);
                    }
                }
            }
            _ => return (0, ExtStatus::FileInvalid),
        }
        (data.len(), ExtStatus::Success)
    }

    fn close(&self) {
        for (_, job) in self.jobs.snapshot() {
            job.request_abort();
        }
        self.jobs.clear();
    }
}
