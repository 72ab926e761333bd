//! Kernel object reconstruction into immutable map snapshots.
//!
//! Every builder follows the same discipline: read the well-known kernel
//! structure through the virtual memory path, validate each pointer by
//! translation before dereferencing it, cap list walks against hostile
//! images, and return an immutable snapshot (entries plus string pool). An
//! unreadable kernel object produces an empty map, never an error.

pub mod handles;
pub mod heap;
pub mod module;
pub mod net;
pub mod pool;
pub mod pte;
pub mod service;
pub mod thread;
pub mod user;
pub mod vad;

pub use handles::{HandleEntry, HandleMap};
pub use heap::{HeapEntry, HeapMap};
pub use module::{ModuleEntry, ModuleMap};
pub use net::{NetEntry, NetMap};
pub use pool::{PoolEntry, PoolMap};
pub use pte::{PteEntry, PteMap};
pub use service::{ServiceEntry, ServiceMap};
pub use thread::{ThreadEntry, ThreadMap};
pub use user::{UserEntry, UserMap};
pub use vad::{VadEntry, VadKind, VadMap};

use crate::mem::mmu::{self, MemoryModel};
use crate::mem::{MemCore, ReadFlags};
use crate::sym::{OffsetDb, OffsetProfile, SymbolProvider};
use crate::util;

/// Upper bound on any single kernel list/tree walk.
pub(crate) const WALK_MAX: usize = 0x10000;

/// Everything a map builder needs from the handle.
pub struct BuildCtx<'a> {
    pub mem: &'a MemCore,
    pub model: MemoryModel,
    pub db: &'a dyn OffsetDb,
    pub symbols: &'a dyn SymbolProvider,
}

impl<'a> BuildCtx<'a> {
    pub fn profile(&self) -> &OffsetProfile {
        self.db.profile()
    }

    pub(crate) fn ptr_size(&self) -> usize {
        if self.model.is_32bit() {
            4
        } else {
            8
        }
    }

    pub(crate) fn read_ptr(&self, dtb: u64, va: u64) -> Option<u64> {
        crate::proc::discovery::read_ptr(self.mem, self.model, dtb, va)
    }

    pub(crate) fn read_u64(&self, dtb: u64, va: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        (self.mem.virt_read_into(self.model, dtb, va, &mut buf, ReadFlags::empty()) == 8)
            .then(|| u64::from_le_bytes(buf))
    }

    pub(crate) fn read_u32(&self, dtb: u64, va: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        (self.mem.virt_read_into(self.model, dtb, va, &mut buf, ReadFlags::empty()) == 4)
            .then(|| u32::from_le_bytes(buf))
    }

    /// Read a whole structure, zero-padded. Returns None only when the base
    /// address does not translate at all.
    pub(crate) fn read_struct(&self, dtb: u64, va: u64, size: usize) -> Option<Vec<u8>> {
        mmu::translate(self.mem, self.model, dtb, va).ok()?;
        let mut buf = vec![0u8; size];
        self.mem.virt_read_into(self.model, dtb, va, &mut buf, ReadFlags::ZEROPAD);
        Some(buf)
    }

    /// Decode a `_UNICODE_STRING` at `va_us`: 16-bit length, padding, then
    /// the buffer pointer at the pointer-size boundary.
    pub(crate) fn read_unicode_string(&self, dtb: u64, va_us: u64) -> Option<String> {
        let rec = self.read_struct(dtb, va_us, 2 * self.ptr_size())?;
        let len = u16::from_le_bytes(rec[0..2].try_into().unwrap()) as usize;
        if len == 0 || len > 0x800 {
            return None;
        }
        let buf_va = if self.model.is_32bit() {
            u32::from_le_bytes(rec[4..8].try_into().unwrap()) as u64
        } else {
            u64::from_le_bytes(rec[8..16].try_into().unwrap())
        };
        if buf_va == 0 {
            return None;
        }
        let mut raw = vec![0u8; len & !1];
        if self.mem.virt_read_into(self.model, dtb, buf_va, &mut raw, ReadFlags::empty())
            != raw.len()
        {
            return None;
        }
        Some(util::utf16_to_string(&raw))
    }
}

pub(crate) fn u64_at(rec: &[u8], off: u32) -> u64 {
    let o = off as usize;
    rec.get(o..o + 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
        .unwrap_or(0)
}

pub(crate) fn u32_at(rec: &[u8], off: u32) -> u32 {
    let o = off as usize;
    rec.get(o..o + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
        .unwrap_or(0)
}

pub(crate) fn u8_at(rec: &[u8], off: u32) -> u8 {
    rec.get(off as usize).copied().unwrap_or(0)
}
