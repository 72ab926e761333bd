//! Core engine exposing an opaque physical memory image as a structured,
//! queryable view of the guest operating system contained in it.
//!
//! The entry point is [`Vmm::initialize`] which connects a memory acquisition
//! device, identifies the guest paging mode, discovers the kernel process
//! list and returns a reference counted handle. All queries (process lists,
//! virtual memory reads, path addressed plugin calls) go through the handle.

#[macro_use]
extern crate static_assertions;

pub mod config;
pub mod error;
pub mod handle;
pub mod maps;
pub mod mem;
pub mod ob;
pub mod plugin;
pub mod proc;
pub mod sym;
pub mod util;
pub mod work;

pub use config::ConfigOpt;
pub use error::{ExtStatus, TranslateFail, VmmError};
pub use handle::{reserve, DeviceSpec, HandleGuard, Vmm, VmmArgs};
pub use mem::mmu::MemoryModel;
pub use mem::ReadFlags;
pub use plugin::VfsEntry;
