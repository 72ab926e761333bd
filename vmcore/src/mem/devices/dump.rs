//! Raw flat memory dump file device. Non-volatile; writable when opened
//! read-write (write-back changes the dump on disk).

use crate::error::VmmError;
use crate::mem::device::{DeviceCaps, DeviceCmd, DeviceOpt, MemDevice, MemMap};
use crate::mem::{MemScatter, PAGE_SIZE};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::os::unix::fs::FileExt;

        fn read_at(file: &File, buf: &mut [u8], offset: u64) -> bool {
            file.read_exact_at(buf, offset).is_ok()
        }

        fn write_at(file: &File, buf: &[u8], offset: u64) -> bool {
            file.write_all_at(buf, offset).is_ok()
        }
    } else {
        use std::io::{Read, Seek, SeekFrom, Write};
        use std::sync::Mutex;
        use once_cell::sync::Lazy;

        static IO_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

        fn read_at(file: &File, buf: &mut [u8], offset: u64) -> bool {
            let _g = IO_LOCK.lock().unwrap();
            let mut f = file;
            f.seek(SeekFrom::Start(offset)).is_ok() && f.read_exact(buf).is_ok()
        }

        fn write_at(file: &File, buf: &[u8], offset: u64) -> bool {
            let _g = IO_LOCK.lock().unwrap();
            let mut f = file;
            f.seek(SeekFrom::Start(offset)).is_ok() && f.write_all(buf).is_ok()
        }
    }
}

pub struct DumpFileDevice {
    file: File,
    len: u64,
    writable: bool,
    memmap: RwLock<Option<MemMap>>,
    pa_max: AtomicU64,
    verbosity: AtomicU64,
}

impl DumpFileDevice {
    pub fn open(path: &Path, writable: bool) -> Result<Self, VmmError> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| VmmError::Device { reason: format!("open {}: {}", path.display(), e) })?;
        let len = file
            .metadata()
            .map_err(|e| VmmError::Device { reason: format!("stat: {}", e) })?
            .len();
        if len < PAGE_SIZE as u64 {
            return Err(VmmError::Device { reason: "dump smaller than one page".into() });
        }
        log::info!("dump device: {} ({:#x} bytes, writable={})", path.display(), len, writable);
        Ok(Self {
            file,
            len,
            writable,
            memmap: RwLock::new(None),
            pa_max: AtomicU64::new(len - 1),
            verbosity: AtomicU64::new(0),
        })
    }

    fn page_valid(&self, pa: u64) -> bool {
        match pa.checked_add(PAGE_SIZE as u64) {
            Some(end) if end <= self.len => {}
            _ => return false,
        }
        match &*self.memmap.read().unwrap() {
            Some(map) => map.contains_page(pa),
            None => true,
        }
    }
}

impl MemDevice for DumpFileDevice {
    fn caps(&self) -> DeviceCaps {
        DeviceCaps {
            volatile: false,
            writable: self.writable,
            pa_max: self.pa_max.load(Ordering::Relaxed),
        }
    }

    fn scatter_read(&self, mems: &mut [MemScatter]) {
        for m in mems.iter_mut() {
            m.ok = self.page_valid(m.addr) && read_at(&self.file, &mut m.data[..], m.addr);
        }
    }

    fn scatter_write(&self, mems: &mut [MemScatter]) {
        for m in mems.iter_mut() {
            m.ok = self.writable && self.page_valid(m.addr) && write_at(&self.file, &m.data[..], m.addr);
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

/// Pagefile backed by a file on disk.
pub struct PageFileDevice {
    file: File,
    len: u64,
}

impl PageFileDevice {
    pub fn open(path: &Path) -> Result<Self, VmmError> {
        let file = File::open(path)
            .map_err(|e| VmmError::Device { reason: format!("open {}: {}", path.display(), e) })?;
        let len = file
            .metadata()
            .map_err(|e| VmmError::Device { reason: format!("stat: {}", e) })?
            .len();
        Ok(Self { file, len })
    }
}

impl crate::mem::device::PageFileIo for PageFileDevice {
    fn read_page(&self, offset: u64, out: &mut [u8; PAGE_SIZE]) -> bool {
        offset + PAGE_SIZE as u64 <= self.len && read_at(&self.file, &mut out[..], offset)
    }
}
