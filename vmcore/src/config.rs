//! Runtime configuration options reachable through `config_get`/`config_set`
//! on a handle. Numeric values only; triggered (write-only) options force an
//! immediate refresh sweep of the named tier.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

pub const VERSION_MAJOR: u64 = 0;
pub const VERSION_MINOR: u64 = 1;
pub const VERSION_REVISION: u64 = 0;

/// Default base tick for the refresh thread.
pub const TICK_PERIOD_MS_DEFAULT: u64 = 100;

// Per-tier tick counts at the default 100ms base tick.
pub const REFRESH_TICKS_MEM: u64 = 3;
pub const REFRESH_TICKS_TLB: u64 = 2;
pub const REFRESH_TICKS_FAST: u64 = 50;
pub const REFRESH_TICKS_MEDIUM: u64 = 150;
pub const REFRESH_TICKS_SLOW: u64 = 3000;

/// Options recognized by `Vmm::config_get` / `Vmm::config_set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOpt {
    // read-only identity:
    System,
    MemoryModel,
    VersionMajor,
    VersionMinor,
    VersionRevision,
    // get/set:
    RefreshEnabled,
    PagingEnabled,
    TickPeriodMs,
    RefreshMem,
    RefreshTlb,
    RefreshFast,
    RefreshMedium,
    RefreshSlow,
    VerboseDll,
    Verbose,
    VerboseExtra,
    VerboseExtraTlp,
    ForensicMode,
    // write-only triggers forcing an immediate sweep:
    RefreshFreqMem,
    RefreshFreqMemPartial,
    RefreshFreqTlb,
    RefreshFreqTlbPartial,
    RefreshFreqFast,
    RefreshFreqMedium,
    RefreshFreqSlow,
    RefreshFreqProcPartial,
}

impl ConfigOpt {
    pub fn is_trigger(&self) -> bool {
        matches!(
            self,
            ConfigOpt::RefreshFreqMem
                | ConfigOpt::RefreshFreqMemPartial
                | ConfigOpt::RefreshFreqTlb
                | ConfigOpt::RefreshFreqTlbPartial
                | ConfigOpt::RefreshFreqFast
                | ConfigOpt::RefreshFreqMedium
                | ConfigOpt::RefreshFreqSlow
                | ConfigOpt::RefreshFreqProcPartial
        )
    }
}

/// Mutable configuration state carried by a handle. All fields are atomics
/// so option reads never take the master lock.
#[derive(Debug)]
pub struct Config {
    pub refresh_enabled: AtomicBool,
    pub paging_enabled: AtomicBool,
    pub tick_period_ms: AtomicU64,
    pub refresh_mem: AtomicU64,
    pub refresh_tlb: AtomicU64,
    pub refresh_fast: AtomicU64,
    pub refresh_medium: AtomicU64,
    pub refresh_slow: AtomicU64,
    pub verbose_dll: AtomicBool,
    pub verbose: AtomicBool,
    pub verbose_extra: AtomicBool,
    pub verbose_extra_tlp: AtomicBool,
    pub forensic_mode: AtomicU8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_enabled: AtomicBool::new(true),
            paging_enabled: AtomicBool::new(true),
            tick_period_ms: AtomicU64::new(TICK_PERIOD_MS_DEFAULT),
            refresh_mem: AtomicU64::new(REFRESH_TICKS_MEM),
            refresh_tlb: AtomicU64::new(REFRESH_TICKS_TLB),
            refresh_fast: AtomicU64::new(REFRESH_TICKS_FAST),
            refresh_medium: AtomicU64::new(REFRESH_TICKS_MEDIUM),
            refresh_slow: AtomicU64::new(REFRESH_TICKS_SLOW),
            verbose_dll: AtomicBool::new(false),
            verbose: AtomicBool::new(false),
            verbose_extra: AtomicBool::new(false),
            verbose_extra_tlp: AtomicBool::new(false),
            forensic_mode: AtomicU8::new(0),
        }
    }
}

impl Config {
    pub fn get_bool(b: &AtomicBool) -> u64 {
        b.load(Ordering::Relaxed) as u64
    }

    pub fn set_bool(b: &AtomicBool, v: u64) {
        b.store(v != 0, Ordering::Relaxed);
    }
}
