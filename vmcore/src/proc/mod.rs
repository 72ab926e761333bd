//! Process objects and the reference counted, refreshable process table.

pub mod discovery;
pub mod refresh;

use crate::maps::{HandleMap, HeapMap, ModuleMap, PteMap, ThreadMap, VadMap};
use fnv::FnvHashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

pub const PROCESS_STATE_LIVE: u32 = 0;
pub const PROCESS_STATE_TERMINATED: u32 = 1;

/// OS-specific block of a process.
#[derive(Debug, Clone, Default)]
pub struct ProcessWinInfo {
    pub va_eprocess: u64,
    pub va_peb: u64,
    pub va_token: u64,
    pub is_wow64: bool,
    pub session_id: u32,
    /// 0 when unknown.
    pub integrity_level: u32,
}

/// A reconstructed guest process. Immutable identity fields are set at
/// creation; volatile views live in generation tagged lazy slots.
pub struct Process {
    pub pid: u32,
    pub ppid: u32,
    pub dtb: u64,
    pub dtb_user: Option<u64>,
    /// 15-byte short image name.
    pub name: String,
    pub user_only: bool,
    pub win: ProcessWinInfo,
    /// Long image path, resolved lazily from the module map.
    path_long: Mutex<Option<String>>,
    state: AtomicU32,
    /// Table generation at which the process was seen terminated; retired
    /// one full slow cycle later.
    pub(crate) terminated_gen: AtomicU64,
    pub(crate) maps: ProcessMaps,
}

impl Process {
    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        self.state() == PROCESS_STATE_LIVE
    }

    /// A process that left the kernel list never mutates again.
    pub(crate) fn mark_terminated(&self, generation: u64) {
        if self
            .state
            .compare_exchange(
                PROCESS_STATE_LIVE,
                PROCESS_STATE_TERMINATED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.terminated_gen.store(generation, Ordering::Release);
            log::debug!("process {} ({}) terminated", self.pid, self.name);
        }
    }

    pub fn path_long(&self) -> Option<String> {
        self.path_long.lock().unwrap().clone()
    }

    pub(crate) fn set_path_long(&self, path: String) {
        let mut p = self.path_long.lock().unwrap();
        if p.is_none() {
            *p = Some(path);
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("dtb", &format_args!("{:#x}", self.dtb))
            .field("state", &self.state())
            .finish()
    }
}

/// Lazily built, generation tagged snapshot slot. The lock is held across a
/// build so two threads never construct the same map kind concurrently.
pub struct MapSlot<T> {
    inner: Mutex<SlotState<T>>,
}

struct SlotState<T> {
    cached: Option<Arc<T>>,
    generation: u64,
}

impl<T> Default for MapSlot<T> {
    fn default() -> Self {
        Self { inner: Mutex::new(SlotState { cached: None, generation: 0 }) }
    }
}

impl<T> MapSlot<T> {
    pub fn get_or_build(&self, generation: u64, build: impl FnOnce() -> Arc<T>) -> Arc<T> {
        let mut slot = self.inner.lock().unwrap();
        if slot.generation == generation {
            if let Some(map) = &slot.cached {
                return Arc::clone(map);
            }
        }
        let map = build();
        slot.cached = Some(Arc::clone(&map));
        slot.generation = generation;
        map
    }

    pub fn invalidate(&self) {
        let mut slot = self.inner.lock().unwrap();
        slot.cached = None;
    }
}

#[derive(Default)]
pub(crate) struct ProcessMaps {
    pub pte: MapSlot<PteMap>,
    pub vad: MapSlot<VadMap>,
    pub module: MapSlot<ModuleMap>,
    pub thread: MapSlot<ThreadMap>,
    pub handle: MapSlot<HandleMap>,
    pub heap: MapSlot<HeapMap>,
}

impl ProcessMaps {
    /// Fast tier: thread and handle views.
    pub fn invalidate_fast(&self) {
        self.thread.invalidate();
        self.handle.invalidate();
    }

    /// Medium tier: module/VAD/PTE/heap views.
    pub fn invalidate_medium(&self) {
        self.pte.invalidate();
        self.vad.invalidate();
        self.module.invalidate();
        self.heap.invalidate();
    }
}

/// Raw identity of a process as found by the kernel walk.
#[derive(Debug, Clone, Default)]
pub struct ProcessSeed {
    pub pid: u32,
    pub ppid: u32,
    pub dtb: u64,
    pub dtb_user: Option<u64>,
    pub name: String,
    pub va_eprocess: u64,
    pub va_peb: u64,
    pub va_token: u64,
    pub is_wow64: bool,
    pub session_id: u32,
}

impl ProcessSeed {
    fn into_process(self) -> Process {
        let user_only = self.va_peb != 0;
        Process {
            pid: self.pid,
            ppid: self.ppid,
            dtb: self.dtb,
            dtb_user: self.dtb_user,
            name: self.name,
            user_only,
            win: ProcessWinInfo {
                va_eprocess: self.va_eprocess,
                va_peb: self.va_peb,
                va_token: self.va_token,
                is_wow64: self.is_wow64,
                session_id: self.session_id,
                integrity_level: 0,
            },
            path_long: Mutex::new(None),
            state: AtomicU32::new(PROCESS_STATE_LIVE),
            terminated_gen: AtomicU64::new(0),
            maps: ProcessMaps::default(),
        }
    }
}

struct Snapshot {
    by_pid: FnvHashMap<u32, Arc<Process>>,
    by_eprocess: FnvHashMap<u64, u32>,
}

impl Snapshot {
    fn empty() -> Self {
        Self { by_pid: FnvHashMap::default(), by_eprocess: FnvHashMap::default() }
    }
}

/// Snapshot of the process set behind a short reader-writer lock. Readers
/// clone out process references and drop the lock; the slow refresh builds
/// the next snapshot off to the side and swaps it in.
pub struct ProcessTable {
    snapshot: RwLock<Arc<Snapshot>>,
    /// Advances on each slow (enumeration) refresh.
    generation: AtomicU64,
    /// Advances on fast sweeps; tags the thread/handle map slots.
    fast_generation: AtomicU64,
    /// Advances on medium sweeps; tags the module/VAD/PTE/heap slots and
    /// the global maps.
    medium_generation: AtomicU64,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::empty())),
            generation: AtomicU64::new(1),
            fast_generation: AtomicU64::new(1),
            medium_generation: AtomicU64::new(1),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn fast_generation(&self) -> u64 {
        self.fast_generation.load(Ordering::Acquire)
    }

    pub fn medium_generation(&self) -> u64 {
        self.medium_generation.load(Ordering::Acquire)
    }

    pub fn bump_fast_generation(&self) {
        self.fast_generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn bump_medium_generation(&self) {
        self.medium_generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn get(&self, pid: u32) -> Option<Arc<Process>> {
        self.snapshot.read().unwrap().by_pid.get(&pid).cloned()
    }

    /// Case-insensitive lookup by short name; the lowest pid wins on
    /// duplicates.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<Process>> {
        let snap = self.snapshot.read().unwrap();
        snap.by_pid
            .values()
            .filter(|p| p.name.eq_ignore_ascii_case(name))
            .min_by_key(|p| p.pid)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<Process>> {
        let snap = self.snapshot.read().unwrap();
        let mut v: Vec<Arc<Process>> = snap.by_pid.values().cloned().collect();
        v.sort_by_key(|p| p.pid);
        v
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().unwrap().by_pid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a fresh kernel enumeration. Identity is preserved by EPROCESS
    /// address first, then by pid. Vanished processes are marked terminated
    /// and retired after one further enumeration cycle.
    pub fn apply_enumeration(&self, seeds: Vec<ProcessSeed>) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let old = self.snapshot.read().unwrap().clone();

        let mut next = Snapshot::empty();
        for seed in seeds {
            let existing = old
                .by_eprocess
                .get(&seed.va_eprocess)
                .and_then(|pid| old.by_pid.get(pid))
                .filter(|p| p.win.va_eprocess == seed.va_eprocess)
                .or_else(|| {
                    // pid match alone is not identity: a recycled pid with a
                    // different record is a new process
                    old.by_pid
                        .get(&seed.pid)
                        .filter(|p| p.is_live() && p.dtb == seed.dtb && p.name == seed.name)
                });
            let proc = match existing {
                Some(p) => Arc::clone(p),
                None => {
                    log::debug!("process {} ({}) discovered", seed.pid, seed.name);
                    Arc::new(seed.into_process())
                }
            };
            next.by_eprocess.insert(proc.win.va_eprocess, proc.pid);
            next.by_pid.insert(proc.pid, proc);
        }

        // vanished: newly terminated or retired after a full cycle
        for (pid, p) in old.by_pid.iter() {
            if next.by_pid.contains_key(pid) {
                continue;
            }
            if p.is_live() {
                p.mark_terminated(generation);
                next.by_eprocess.insert(p.win.va_eprocess, *pid);
                next.by_pid.insert(*pid, Arc::clone(p));
            } else if p.terminated_gen.load(Ordering::Acquire) >= generation.saturating_sub(1) {
                // keep one more cycle
                next.by_eprocess.insert(p.win.va_eprocess, *pid);
                next.by_pid.insert(*pid, Arc::clone(p));
            } else {
                log::debug!("process {} ({}) retired", p.pid, p.name);
            }
        }

        *self.snapshot.write().unwrap() = Arc::new(next);
    }
}
