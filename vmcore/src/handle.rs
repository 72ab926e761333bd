//! The top-level handle: initialization, the external allow-list,
//! reserve/return accounting and the drain-then-teardown close sequence.

use crate::config::{Config, ConfigOpt, VERSION_MAJOR, VERSION_MINOR, VERSION_REVISION};
use crate::error::{ExtStatus, VmmError};
use crate::maps::{
    self, BuildCtx, HandleMap, HeapMap, ModuleMap, NetMap, PoolMap, PteMap, ServiceMap, ThreadMap,
    UserMap, VadMap,
};
use crate::mem::device::{DeviceCmd, DeviceOpt, MemDevice};
use crate::mem::devices::dump::PageFileDevice;
use crate::mem::devices::DumpFileDevice;
use crate::mem::mmu::MemoryModel;
use crate::mem::search::{virt_search, SearchContext, SearchTerm};
use crate::mem::{MemCore, ReadFlags};
use crate::ob;
use crate::plugin::{self, PluginRegistry, VfsEntry};
use crate::proc::{discovery, refresh, MapSlot, Process, ProcessTable};
use crate::sym::{NullSymbols, OffsetDb, StaticOffsetDb, SymbolProvider};
use crate::work::WorkPool;
use once_cell::sync::Lazy;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const VMM_MAGIC: u64 = 0x6d76_6d6d_7663_6f72;
pub const VMM_HANDLE_MAX_COUNT: usize = 32;

/// Process-wide allow-list of live handles. Reserve takes the shared side
/// for the membership check; close holds the exclusive side for the whole
/// teardown.
static ALLOW_LIST: Lazy<RwLock<Vec<Arc<Vmm>>>> = Lazy::new(|| RwLock::new(Vec::new()));

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

pub enum DeviceSpec {
    /// An already constructed device.
    Device(Arc<dyn MemDevice>),
    /// Raw flat dump file on disk.
    DumpFile(PathBuf),
}

/// Initialization parameters.
pub struct VmmArgs {
    pub device: DeviceSpec,
    /// Kernel directory table base; scanned for when absent.
    pub dtb: Option<u64>,
    /// Paging variant; 64-bit 4-level assumed when absent.
    pub memory_model: Option<MemoryModel>,
    /// Physical memory map text installed into the device.
    pub memmap: Option<String>,
    /// (pagefile index, path) pairs.
    pub pagefiles: Vec<(u8, PathBuf)>,
    pub symbols: Option<Arc<dyn SymbolProvider>>,
    pub offsets: Option<Arc<dyn OffsetDb>>,
    pub no_refresh: bool,
    pub verbose: bool,
    pub worker_count: Option<usize>,
}

impl VmmArgs {
    pub fn new(device: DeviceSpec) -> Self {
        Self {
            device,
            dtb: None,
            memory_model: None,
            memmap: None,
            pagefiles: Vec::new(),
            symbols: None,
            offsets: None,
            no_refresh: false,
            verbose: false,
            worker_count: None,
        }
    }

    pub fn for_device(device: Arc<dyn MemDevice>) -> Self {
        Self::new(DeviceSpec::Device(device))
    }
}

#[derive(Default)]
pub(crate) struct GlobalMaps {
    pub pool: MapSlot<PoolMap>,
    pub net: MapSlot<NetMap>,
    pub user: MapSlot<UserMap>,
    pub service: MapSlot<ServiceMap>,
}

/// The opaque top-level context. All external calls go through
/// [`reserve`]-guarded entry points; `close` drains and tears down.
pub struct Vmm {
    magic: AtomicU64,
    abort: AtomicBool,
    id: u64,
    model: MemoryModel,
    kernel_dtb: u64,
    mem: MemCore,
    pub(crate) config: Config,
    pub(crate) table: ProcessTable,
    pub(crate) plugins: PluginRegistry,
    pub(crate) symbols: Arc<dyn SymbolProvider>,
    pub(crate) offsets: Arc<dyn OffsetDb>,
    pub(crate) global_maps: GlobalMaps,
    work: WorkPool,
    threads_external: AtomicU32,
    threads_internal: Arc<AtomicU32>,
    refresh_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Successful reservation of a handle. The matching return happens on drop,
/// on every exit path.
pub struct HandleGuard {
    h: Arc<Vmm>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.h.threads_external.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Validate a handle against the allow-list and check it out. Every
/// external entry point starts here.
pub fn reserve(h: &Arc<Vmm>) -> Result<HandleGuard, VmmError> {
    {
        let list = ALLOW_LIST.read().unwrap();
        if !list.iter().any(|x| Arc::ptr_eq(x, h)) {
            return Err(VmmError::HandleInvalid);
        }
        h.threads_external.fetch_add(1, Ordering::AcqRel);
    }
    if h.magic.load(Ordering::Acquire) != VMM_MAGIC || h.abort.load(Ordering::Acquire) {
        h.threads_external.fetch_sub(1, Ordering::AcqRel);
        return Err(VmmError::HandleInvalid);
    }
    Ok(HandleGuard { h: Arc::clone(h) })
}

impl Vmm {
    /// Initialize against a memory image. On success the returned handle is
    /// in the external allow-list and background refresh is running (for
    /// volatile devices).
    pub fn initialize(args: VmmArgs) -> Result<Arc<Vmm>, VmmError> {
        let device: Arc<dyn MemDevice> = match args.device {
            DeviceSpec::Device(d) => d,
            DeviceSpec::DumpFile(path) => Arc::new(DumpFileDevice::open(&path, false)?),
        };

        // device memory map (if given) before anything reads
        if let Some(map_text) = &args.memmap {
            device.command(DeviceCmd::MemMapSet, map_text.as_bytes())?;
        }
        let mut mem = MemCore::new(device);
        if let Some(pa_max) = mem.device.get_option(DeviceOpt::AddrMax) {
            mem.pa_max.store(pa_max, Ordering::Relaxed);
        }
        for (idx, path) in &args.pagefiles {
            if (*idx as usize) < mem.pagefiles.len() {
                mem.pagefiles[*idx as usize] = Some(Box::new(PageFileDevice::open(path)?));
            }
        }

        let model = args.memory_model.unwrap_or(MemoryModel::X64);
        let kernel_dtb = match args.dtb {
            Some(dtb) => dtb,
            None => discovery::locate_dtb(&mem, model)
                .ok_or(VmmError::InitFailed { reason: "kernel dtb not found" })?,
        };
        log::info!("initialize: model={} dtb={:#x}", model.as_str(), kernel_dtb);

        let config = Config::default();
        config.verbose_dll.store(args.verbose, Ordering::Relaxed);
        let volatile = mem.device.caps().volatile;
        if args.no_refresh || !volatile {
            config.refresh_enabled.store(false, Ordering::Relaxed);
        }

        let threads_internal = Arc::new(AtomicU32::new(0));
        let workers = args.worker_count.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        });

        let h = Arc::new(Vmm {
            magic: AtomicU64::new(VMM_MAGIC),
            abort: AtomicBool::new(false),
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            model,
            kernel_dtb,
            mem,
            config,
            table: ProcessTable::new(),
            plugins: PluginRegistry::new(),
            symbols: args.symbols.unwrap_or_else(|| Arc::new(NullSymbols)),
            offsets: args.offsets.unwrap_or_else(|| Arc::new(StaticOffsetDb::new())),
            global_maps: GlobalMaps::default(),
            work: WorkPool::new(workers, Arc::clone(&threads_internal)),
            threads_external: AtomicU32::new(0),
            threads_internal,
            refresh_thread: Mutex::new(None),
        });

        // allow-list admission caps concurrent handles
        {
            let mut list = ALLOW_LIST.write().unwrap();
            if list.len() >= VMM_HANDLE_MAX_COUNT {
                h.work.close();
                return Err(VmmError::ResourceExhausted { what: "handle allow-list" });
            }
            list.push(Arc::clone(&h));
        }

        // initial process enumeration; an unreadable kernel yields an empty
        // table and partial functionality rather than failure
        let seeds = discovery::enumerate_eprocess(
            &h.mem,
            h.model,
            h.kernel_dtb,
            &*h.symbols,
            h.offsets.profile(),
        );
        h.table.apply_enumeration(seeds);

        // built-in plugins
        h.plugins.register("search", false, true, Arc::new(plugin::search::SearchPlugin::new(h.id)));
        h.plugins.register("vmemd", false, true, Arc::new(plugin::vmem::VmemPlugin));
        h.plugins.register("modules", false, true, Arc::new(plugin::ldrmodules::LdrModulesPlugin));

        // background refresh ticks even when disabled so triggered sweeps
        // and re-enabling keep working
        *h.refresh_thread.lock().unwrap() = Some(refresh::spawn(&h));

        log::info!("initialize done: {} processes", h.table.len());
        Ok(h)
    }

    /// Close the handle: remove from the allow-list, flip abort, interrupt
    /// workers, drain both thread counters, then tear down in reverse init
    /// order and report external leaks.
    pub fn close(self: &Arc<Vmm>) {
        let mut list = ALLOW_LIST.write().unwrap();
        let Some(idx) = list.iter().position(|x| Arc::ptr_eq(x, self)) else {
            return;
        };
        list.remove(idx);

        self.abort.store(true, Ordering::Release);
        self.magic.store(0, Ordering::Release);
        self.work.interrupt();

        let mut warn_at = Instant::now();
        loop {
            let ext = self.threads_external.load(Ordering::Acquire);
            let int = self.threads_internal.load(Ordering::Acquire);
            if ext == 0 && int == 0 {
                break;
            }
            if warn_at.elapsed() > Duration::from_secs(30) {
                warn_at = Instant::now();
                log::error!("shutdown waiting for long running threads (ext={}, int={})", ext, int);
                self.work.interrupt();
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        // teardown in reverse init order
        if let Some(t) = self.refresh_thread.lock().unwrap().take() {
            let _ = t.join();
        }
        self.plugins.close_all();
        self.work.close();
        self.mem.cache_phys.clear();
        self.mem.cache_tlb.clear();
        ob::ext_leak_scan(self.id);
        ob::ext_release_all(self.id);
        log::info!("handle closed");
    }

    //
    // accessors used by plugins, builders and the refresh thread
    //

    pub fn model(&self) -> MemoryModel {
        self.model
    }

    pub fn kernel_dtb(&self) -> u64 {
        self.kernel_dtb
    }

    pub fn mem(&self) -> &MemCore {
        &self.mem
    }

    pub fn pool(&self) -> &WorkPool {
        &self.work
    }

    pub fn abort_flag(&self) -> &AtomicBool {
        &self.abort
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub(crate) fn build_ctx(&self) -> BuildCtx<'_> {
        BuildCtx { mem: &self.mem, model: self.model, db: &*self.offsets, symbols: &*self.symbols }
    }

    fn read_flags(&self) -> ReadFlags {
        if self.config.paging_enabled.load(Ordering::Relaxed) {
            ReadFlags::empty()
        } else {
            ReadFlags::NOPAGING
        }
    }

    //
    // configuration
    //

    pub fn config_get(self: &Arc<Vmm>, opt: ConfigOpt) -> Result<u64, VmmError> {
        let _g = reserve(self)?;
        let c = &self.config;
        let v = match opt {
            ConfigOpt::System => 2, // 64-bit windows family
            ConfigOpt::MemoryModel => self.model as u64,
            ConfigOpt::VersionMajor => VERSION_MAJOR,
            ConfigOpt::VersionMinor => VERSION_MINOR,
            ConfigOpt::VersionRevision => VERSION_REVISION,
            ConfigOpt::RefreshEnabled => Config::get_bool(&c.refresh_enabled),
            ConfigOpt::PagingEnabled => Config::get_bool(&c.paging_enabled),
            ConfigOpt::TickPeriodMs => c.tick_period_ms.load(Ordering::Relaxed),
            ConfigOpt::RefreshMem => c.refresh_mem.load(Ordering::Relaxed),
            ConfigOpt::RefreshTlb => c.refresh_tlb.load(Ordering::Relaxed),
            ConfigOpt::RefreshFast => c.refresh_fast.load(Ordering::Relaxed),
            ConfigOpt::RefreshMedium => c.refresh_medium.load(Ordering::Relaxed),
            ConfigOpt::RefreshSlow => c.refresh_slow.load(Ordering::Relaxed),
            ConfigOpt::VerboseDll => Config::get_bool(&c.verbose_dll),
            ConfigOpt::Verbose => Config::get_bool(&c.verbose),
            ConfigOpt::VerboseExtra => Config::get_bool(&c.verbose_extra),
            ConfigOpt::VerboseExtraTlp => Config::get_bool(&c.verbose_extra_tlp),
            ConfigOpt::ForensicMode => c.forensic_mode.load(Ordering::Relaxed) as u64,
            _ => return Err(VmmError::InvalidParameter { reason: "write-only option" }),
        };
        Ok(v)
    }

    pub fn config_set(self: &Arc<Vmm>, opt: ConfigOpt, value: u64) -> Result<(), VmmError> {
        let _g = reserve(self)?;
        let c = &self.config;
        if opt.is_trigger() {
            refresh::force(self, opt);
            return Ok(());
        }
        match opt {
            ConfigOpt::RefreshEnabled => Config::set_bool(&c.refresh_enabled, value),
            ConfigOpt::PagingEnabled => Config::set_bool(&c.paging_enabled, value),
            ConfigOpt::TickPeriodMs => {
                if value == 0 {
                    return Err(VmmError::InvalidParameter { reason: "tick period zero" });
                }
                c.tick_period_ms.store(value, Ordering::Relaxed);
            }
            ConfigOpt::RefreshMem => c.refresh_mem.store(value.max(1), Ordering::Relaxed),
            ConfigOpt::RefreshTlb => c.refresh_tlb.store(value.max(1), Ordering::Relaxed),
            ConfigOpt::RefreshFast => c.refresh_fast.store(value.max(1), Ordering::Relaxed),
            ConfigOpt::RefreshMedium => c.refresh_medium.store(value.max(1), Ordering::Relaxed),
            ConfigOpt::RefreshSlow => c.refresh_slow.store(value.max(1), Ordering::Relaxed),
            ConfigOpt::VerboseDll => Config::set_bool(&c.verbose_dll, value),
            ConfigOpt::Verbose => Config::set_bool(&c.verbose, value),
            ConfigOpt::VerboseExtra => Config::set_bool(&c.verbose_extra, value),
            ConfigOpt::VerboseExtraTlp => Config::set_bool(&c.verbose_extra_tlp, value),
            ConfigOpt::ForensicMode => {
                if value > 4 {
                    return Err(VmmError::InvalidParameter { reason: "forensic mode range" });
                }
                c.forensic_mode.store(value as u8, Ordering::Relaxed);
            }
            _ => return Err(VmmError::InvalidParameter { reason: "read-only option" }),
        }
        Ok(())
    }

    //
    // memory
    //

    /// Read memory. `pid` None addresses physical memory, otherwise the
    /// virtual address space of the process.
    pub fn mem_read(
        self: &Arc<Vmm>,
        pid: Option<u32>,
        addr: u64,
        buf: &mut [u8],
        flags: ReadFlags,
    ) -> Result<usize, VmmError> {
        let _g = reserve(self)?;
        let flags = flags | self.read_flags();
        match pid {
            None => Ok(self.mem.phys_read_into(addr, buf, flags)),
            Some(pid) => {
                let p = self.process(pid)?;
                Ok(self.mem.virt_read_into(self.model, p.dtb, addr, buf, flags))
            }
        }
    }

    pub fn mem_write(
        self: &Arc<Vmm>,
        pid: Option<u32>,
        addr: u64,
        data: &[u8],
    ) -> Result<usize, VmmError> {
        let _g = reserve(self)?;
        if !self.mem.device.caps().writable {
            return Err(VmmError::Device { reason: "device not writable".into() });
        }
        match pid {
            None => Ok(self.mem.phys_write(addr, data)),
            Some(pid) => {
                let p = self.process(pid)?;
                Ok(self.mem.virt_write(self.model, p.dtb, addr, data))
            }
        }
    }

    /// Synchronous bounded search of a process address space.
    pub fn mem_search(
        self: &Arc<Vmm>,
        pid: u32,
        term: SearchTerm,
        va_min: u64,
        va_max: u64,
    ) -> Result<Vec<u64>, VmmError> {
        let _g = reserve(self)?;
        let p = self.process(pid)?;
        let ctx = SearchContext::new(term, va_min, va_max);
        Ok(virt_search(&self.mem, self.model, p.dtb, &ctx, &self.abort))
    }

    //
    // processes
    //

    pub(crate) fn process(&self, pid: u32) -> Result<Arc<Process>, VmmError> {
        self.table.get(pid).ok_or(VmmError::InvalidPid { pid })
    }

    pub fn process_list(self: &Arc<Vmm>) -> Result<Vec<Arc<Process>>, VmmError> {
        let _g = reserve(self)?;
        Ok(self.table.list())
    }

    pub fn process_get(self: &Arc<Vmm>, pid: u32) -> Result<Arc<Process>, VmmError> {
        let _g = reserve(self)?;
        self.process(pid)
    }

    pub fn process_by_name(self: &Arc<Vmm>, name: &str) -> Result<Arc<Process>, VmmError> {
        let _g = reserve(self)?;
        self.table.get_by_name(name).ok_or(VmmError::InvalidPath)
    }

    /// Base address of a named module inside a process.
    pub fn process_module_base(self: &Arc<Vmm>, pid: u32, name: &str) -> Result<u64, VmmError> {
        let _g = reserve(self)?;
        let p = self.process(pid)?;
        let map = self.module_map_of(&p);
        map.find_by_name(name).map(|m| m.base).ok_or(VmmError::InvalidPath)
    }

    //
    // map snapshots (cached per process per kind, serialized per slot;
    // thread/handle views belong to the fast refresh tier, the rest to the
    // medium tier, each stamped with its own tier generation)
    //

    pub(crate) fn module_map_of(&self, p: &Arc<Process>) -> Arc<ModuleMap> {
        let p2 = Arc::clone(p);
        p.maps.module.get_or_build(self.table.medium_generation(), || {
            Arc::new(maps::module::build(&self.build_ctx(), &p2))
        })
    }

    pub(crate) fn vad_map_of(&self, p: &Arc<Process>) -> Arc<VadMap> {
        let p2 = Arc::clone(p);
        p.maps.vad.get_or_build(self.table.medium_generation(), || {
            Arc::new(maps::vad::build(&self.build_ctx(), &p2))
        })
    }

    pub(crate) fn pte_map_of(&self, p: &Arc<Process>) -> Arc<PteMap> {
        let modules = self.module_map_of(p);
        let p2 = Arc::clone(p);
        p.maps.pte.get_or_build(self.table.medium_generation(), || {
            Arc::new(maps::pte::build(&self.build_ctx(), &p2, Some(&modules)))
        })
    }

    pub(crate) fn thread_map_of(&self, p: &Arc<Process>) -> Arc<ThreadMap> {
        let p2 = Arc::clone(p);
        p.maps.thread.get_or_build(self.table.fast_generation(), || {
            Arc::new(maps::thread::build(&self.build_ctx(), &p2))
        })
    }

    pub(crate) fn handle_map_of(&self, p: &Arc<Process>) -> Arc<HandleMap> {
        let p2 = Arc::clone(p);
        p.maps.handle.get_or_build(self.table.fast_generation(), || {
            Arc::new(maps::handles::build(&self.build_ctx(), &p2))
        })
    }

    pub(crate) fn heap_map_of(&self, p: &Arc<Process>) -> Arc<HeapMap> {
        let vads = self.vad_map_of(p);
        let p2 = Arc::clone(p);
        p.maps.heap.get_or_build(self.table.medium_generation(), || {
            Arc::new(maps::heap::build(&self.build_ctx(), &p2, Some(&vads)))
        })
    }

    pub fn map_pte(self: &Arc<Vmm>, pid: u32) -> Result<Arc<PteMap>, VmmError> {
        let _g = reserve(self)?;
        let p = self.process(pid)?;
        Ok(self.pte_map_of(&p))
    }

    pub fn map_vad(self: &Arc<Vmm>, pid: u32) -> Result<Arc<VadMap>, VmmError> {
        let _g = reserve(self)?;
        let p = self.process(pid)?;
        Ok(self.vad_map_of(&p))
    }

    pub fn map_module(self: &Arc<Vmm>, pid: u32) -> Result<Arc<ModuleMap>, VmmError> {
        let _g = reserve(self)?;
        let p = self.process(pid)?;
        Ok(self.module_map_of(&p))
    }

    pub fn map_thread(self: &Arc<Vmm>, pid: u32) -> Result<Arc<ThreadMap>, VmmError> {
        let _g = reserve(self)?;
        let p = self.process(pid)?;
        Ok(self.thread_map_of(&p))
    }

    pub fn map_handle(self: &Arc<Vmm>, pid: u32) -> Result<Arc<HandleMap>, VmmError> {
        let _g = reserve(self)?;
        let p = self.process(pid)?;
        Ok(self.handle_map_of(&p))
    }

    pub fn map_heap(self: &Arc<Vmm>, pid: u32) -> Result<Arc<HeapMap>, VmmError> {
        let _g = reserve(self)?;
        let p = self.process(pid)?;
        Ok(self.heap_map_of(&p))
    }

    fn system_process(&self) -> Result<Arc<Process>, VmmError> {
        self.table.get(4).or_else(|| self.table.list().into_iter().find(|p| !p.user_only)).ok_or(
            VmmError::InvalidPid { pid: 4 },
        )
    }

    pub fn map_pool(self: &Arc<Vmm>) -> Result<Arc<PoolMap>, VmmError> {
        let _g = reserve(self)?;
        let system = self.system_process()?;
        Ok(self.global_maps.pool.get_or_build(self.table.medium_generation(), || {
            Arc::new(maps::pool::build(&self.build_ctx(), &system))
        }))
    }

    pub fn map_net(self: &Arc<Vmm>) -> Result<Arc<NetMap>, VmmError> {
        let pool = self.map_pool()?;
        let _g = reserve(self)?;
        let system = self.system_process()?;
        Ok(self.global_maps.net.get_or_build(self.table.medium_generation(), || {
            Arc::new(maps::net::build(&self.build_ctx(), &system, &pool, &self.table))
        }))
    }

    pub fn map_user(self: &Arc<Vmm>) -> Result<Arc<UserMap>, VmmError> {
        let _g = reserve(self)?;
        Ok(self.global_maps.user.get_or_build(self.table.medium_generation(), || {
            Arc::new(maps::user::build(&self.build_ctx(), &self.table))
        }))
    }

    pub fn map_service(self: &Arc<Vmm>) -> Result<Arc<ServiceMap>, VmmError> {
        let _g = reserve(self)?;
        Ok(self.global_maps.service.get_or_build(self.table.medium_generation(), || {
            Arc::new(maps::service::build(&self.build_ctx(), &self.table))
        }))
    }

    //
    // path addressed plugin surface
    //

    /// Register an external plugin under a path name.
    pub fn plugin_register(
        self: &Arc<Vmm>,
        name: &str,
        root_scope: bool,
        process_scope: bool,
        p: Arc<dyn plugin::Plugin>,
    ) -> Result<(), VmmError> {
        let _g = reserve(self)?;
        if self.plugins.register(name, root_scope, process_scope, p) {
            Ok(())
        } else {
            Err(VmmError::InvalidParameter { reason: "plugin name taken or invalid" })
        }
    }

    pub fn plugin_unregister(self: &Arc<Vmm>, name: &str) -> bool {
        let Ok(_g) = reserve(self) else {
            return false;
        };
        self.plugins.unregister(name)
    }

    pub fn vfs_list(self: &Arc<Vmm>, path: &str) -> Result<Vec<VfsEntry>, VmmError> {
        let _g = reserve(self)?;
        plugin::vfs_list(self, path).ok_or(VmmError::InvalidPath)
    }

    pub fn vfs_read(self: &Arc<Vmm>, path: &str, buf: &mut [u8], offset: u64) -> (usize, ExtStatus) {
        let Ok(_g) = reserve(self) else {
            return (0, ExtStatus::FileInvalid);
        };
        plugin::vfs_read(self, path, buf, offset)
    }

    pub fn vfs_write(self: &Arc<Vmm>, path: &str, data: &[u8], offset: u64) -> (usize, ExtStatus) {
        let Ok(_g) = reserve(self) else {
            return (0, ExtStatus::FileInvalid);
        };
        plugin::vfs_write(self, path, data, offset)
    }

    //
    // external allocation surface
    //

    pub fn mem_alloc_external(self: &Arc<Vmm>, tag: &[u8; 4], size: usize) -> Result<usize, VmmError> {
        let _g = reserve(self)?;
        ob::ext_alloc(self.id, tag, size).ok_or(VmmError::ResourceExhausted { what: "external alloc" })
    }

    pub fn mem_size_external(self: &Arc<Vmm>, key: usize) -> usize {
        ob::ext_size(key)
    }

    pub fn mem_free_external(self: &Arc<Vmm>, key: usize) -> bool {
        ob::ext_free(key)
    }
}
