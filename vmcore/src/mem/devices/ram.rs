//! In-memory image device. Writable, optionally marked volatile. Used by
//! tests and by callers that already hold a captured image in memory.

use crate::error::VmmError;
use crate::mem::device::{DeviceCaps, DeviceCmd, DeviceOpt, MemDevice, MemMap};
use crate::mem::{MemScatter, PAGE_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

pub struct RamDevice {
    image: RwLock<Vec<u8>>,
    memmap: RwLock<Option<MemMap>>,
    pa_max: AtomicU64,
    verbosity: AtomicU64,
    volatile: bool,
}

impl RamDevice {
    pub fn new(image: Vec<u8>, volatile: bool) -> Self {
        let pa_max = (image.len() as u64).saturating_sub(1);
        Self {
            image: RwLock::new(image),
            memmap: RwLock::new(None),
            pa_max: AtomicU64::new(pa_max),
            verbosity: AtomicU64::new(0),
            volatile,
        }
    }

    fn page_valid(&self, pa: u64, image_len: usize) -> bool {
        match pa.checked_add(PAGE_SIZE as u64) {
            Some(end) if end <= image_len as u64 => {}
            _ => return false,
        }
        match &*self.memmap.read().unwrap() {
            Some(map) => map.contains_page(pa),
            None => true,
        }
    }
}

impl MemDevice for RamDevice {
    fn caps(&self) -> DeviceCaps {
        DeviceCaps {
            volatile: self.volatile,
            writable: true,
            pa_max: self.pa_max.load(Ordering::Relaxed),
        }
    }

    fn scatter_read(&self, mems: &mut [MemScatter]) {
        let image = self.image.read().unwrap();
        for m in mems.iter_mut() {
            let pa = m.addr as usize;
            if !self.page_valid(m.addr, image.len()) {
                m.ok = false;
                continue;
            }
            m.data.copy_from_slice(&image[pa..pa + PAGE_SIZE]);
            m.ok = true;
        }
    }

    fn scatter_write(&self, mems: &mut [MemScatter]) {
        let mut image = self.image.write().unwrap();
        let len = image.len();
        for m in mems.iter_mut() {
            let pa = m.addr as usize;
            if !self.page_valid(m.addr, len) {
                m.ok = false;
                continue;
            }
            image[pa..pa + PAGE_SIZE].copy_from_slice(&m.data[..]);
            m.ok = true;
        }
    }

    fn get_option(&self, opt: DeviceOpt) -> Option<u64> {
        match opt {
            DeviceOpt::AddrMax => Some(self.pa_max.load(Ordering::Relaxed)),
            DeviceOpt::PrintfVerbosity => Some(self.verbosity.load(Ordering::Relaxed)),
        }
    }

    fn set_option(&self, opt: DeviceOpt, value: u64) -> bool {
        match opt {
            DeviceOpt::AddrMax => {
                self.pa_max.store(value, Ordering::Relaxed);
                true
            }
            DeviceOpt::PrintfVerbosity => {
                self.verbosity.store(value, Ordering::Relaxed);
                true
            }
        }
    }

    fn command(&self, cmd: DeviceCmd, data: &[u8]) -> Result<Vec<u8>, VmmError> {
        match cmd {
            DeviceCmd::MemMapSet => {
                let text = std::str::from_utf8(data)
                    .map_err(|_| VmmError::InvalidParameter { reason: "memmap not utf-8" })?;
                let map = MemMap::parse(text)?;
                if map.is_empty() {
                    return Err(VmmError::InvalidParameter { reason: "memmap empty" });
                }
                self.pa_max.store(map.pa_max(), Ordering::Relaxed);
                *self.memmap.write().unwrap() = Some(map);
                Ok(Vec::new())
            }
        }
    }
}
