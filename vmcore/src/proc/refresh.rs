//! Periodic refresh tiers.
//!
//! A single background thread ticks at the configured base period and fires
//! the tiers at their tick multiples: cache generations (mem/tlb), fast
//! (thread/handle views), medium (module/VAD views) and slow (full process
//! re-enumeration). Triggered options force a tier out of band.

use crate::config::ConfigOpt;
use crate::handle::Vmm;
use crate::proc::discovery;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) fn spawn(vmm: &Arc<Vmm>) -> JoinHandle<()> {
    let vmm = Arc::clone(vmm);
    std::thread::Builder::new()
        .name("vmm-refresh".into())
        .spawn(move || refresh_loop(vmm))
        .expect("spawn refresh thread")
}

fn refresh_loop(vmm: Arc<Vmm>) {
    let mut tick = 0u64;
    log::debug!("refresh thread running");
    while !vmm.aborted() {
        let period = vmm.config.tick_period_ms.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(period.clamp(1, 1000)));
        tick += 1;
        if !vmm.config.refresh_enabled.load(Ordering::Relaxed) {
            continue;
        }
        let c = &vmm.config;
        if tick % c.refresh_mem.load(Ordering::Relaxed) == 0 {
            refresh_mem(&vmm);
        }
        if tick % c.refresh_tlb.load(Ordering::Relaxed) == 0 {
            refresh_tlb(&vmm);
        }
        if tick % c.refresh_fast.load(Ordering::Relaxed) == 0 {
            refresh_fast(&vmm);
        }
        if tick % c.refresh_medium.load(Ordering::Relaxed) == 0 {
            refresh_medium(&vmm);
        }
        if tick % c.refresh_slow.load(Ordering::Relaxed) == 0 {
            refresh_slow(&vmm);
        }
    }
    log::debug!("refresh thread exit");
}

/// Out-of-band sweep for a triggered (write-only) config option.
pub(crate) fn force(vmm: &Arc<Vmm>, opt: ConfigOpt) {
    match opt {
        ConfigOpt::RefreshFreqMem | ConfigOpt::RefreshFreqMemPartial => refresh_mem(vmm),
        ConfigOpt::RefreshFreqTlb | ConfigOpt::RefreshFreqTlbPartial => refresh_tlb(vmm),
        ConfigOpt::RefreshFreqFast | ConfigOpt::RefreshFreqProcPartial => refresh_fast(vmm),
        ConfigOpt::RefreshFreqMedium => refresh_medium(vmm),
        ConfigOpt::RefreshFreqSlow => refresh_slow(vmm),
        _ => {}
    }
}

fn refresh_mem(vmm: &Arc<Vmm>) {
    vmm.mem().cache_phys.bump_generation();
}

fn refresh_tlb(vmm: &Arc<Vmm>) {
    vmm.mem().cache_tlb.bump_generation();
}

/// Drop thread/handle views of live processes, in parallel across workers.
fn refresh_fast(vmm: &Arc<Vmm>) {
    vmm.table.bump_fast_generation();
    let procs: Vec<_> = vmm.table.list().into_iter().filter(|p| p.is_live()).collect();
    let h = Arc::clone(vmm);
    vmm.pool().parallel_foreach(procs, move |p| {
        if !h.aborted() {
            p.maps.invalidate_fast();
        }
    });
}

/// Drop module/VAD/PTE/heap views and the global maps.
fn refresh_medium(vmm: &Arc<Vmm>) {
    vmm.table.bump_medium_generation();
    let procs: Vec<_> = vmm.table.list().into_iter().filter(|p| p.is_live()).collect();
    let h = Arc::clone(vmm);
    vmm.pool().parallel_foreach(procs, move |p| {
        if !h.aborted() {
            p.maps.invalidate_medium();
        }
    });
    vmm.global_maps.pool.invalidate();
    vmm.global_maps.net.invalidate();
    vmm.global_maps.user.invalidate();
    vmm.global_maps.service.invalidate();
}

/// Re-enumerate the kernel process list.
fn refresh_slow(vmm: &Arc<Vmm>) {
    if vmm.aborted() {
        return;
    }
    let seeds = discovery::enumerate_eprocess(
        vmm.mem(),
        vmm.model(),
        vmm.kernel_dtb(),
        &*vmm.symbols,
        vmm.offsets.profile(),
    );
    if !seeds.is_empty() || !vmm.table.is_empty() {
        vmm.table.apply_enumeration(seeds);
    }
}
