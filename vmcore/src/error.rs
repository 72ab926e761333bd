//! Error taxonomy. The internal [`VmmError`] carries enough detail for the
//! retry layers; the plugin/file-system edge only ever sees [`ExtStatus`].

use snafu::prelude::*;

/// Reason a virtual address failed to translate.
///
/// Soft failures (`Transition`, `Prototype`, `Paged`) may be resolvable by a
/// secondary lookup; `NotPresent` and `BadEntry` are final for the current
/// memory snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateFail {
    /// The page table entry is zero or has no usable encoding.
    NotPresent,

    /// Valid bit clear but the entry is in transition and still carries a
    /// valid page frame. The page content is readable at the given physical
    /// address.
    Transition { pa: u64 },

    /// Prototype PTE encoding. Resolution requires the prototype arrays
    /// which are not kept for the current snapshot.
    Prototype,

    /// Paged out to a pagefile. `pf` is the pagefile index, `offset` the
    /// byte offset of the page inside it.
    Paged { pf: u8, offset: u64 },

    /// Reserved bits set or the entry points outside the physical address
    /// space. Hostile or corrupt image.
    BadEntry,
}

#[derive(Debug, Snafu)]
pub enum VmmError {
    #[snafu(display("Invalid parameter: {reason}"))]
    InvalidParameter { reason: &'static str },

    #[snafu(display("Invalid path"))]
    InvalidPath,

    #[snafu(display("No such process: {pid}"))]
    InvalidPid { pid: u32 },

    #[snafu(display("Physical page unreadable: {pa:#x}"))]
    MemoryRead { pa: u64 },

    #[snafu(display("Translation of {va:#x} failed: {fail:?}"))]
    Translate { va: u64, fail: TranslateFail },

    #[snafu(display("Resource exhausted: {what}"))]
    ResourceExhausted { what: &'static str },

    #[snafu(display("Device failure: {reason}"))]
    Device { reason: String },

    #[snafu(display("Operation aborted"))]
    Aborted,

    #[snafu(display("Handle not valid"))]
    HandleInvalid,

    #[snafu(display("Initialization failed: {reason}"))]
    InitFailed { reason: &'static str },
}

/// The four-value status surfaced to plugins and file-system consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtStatus {
    Success,
    EndOfFile,
    FileInvalid,
    Unsuccessful,
}

impl VmmError {
    /// Translate the internal taxonomy at the external edge.
    pub fn ext_status(&self) -> ExtStatus {
        match self {
            VmmError::InvalidPath | VmmError::InvalidPid { .. } => ExtStatus::FileInvalid,
            VmmError::InvalidParameter { .. } => ExtStatus::FileInvalid,
            VmmError::HandleInvalid | VmmError::Aborted => ExtStatus::FileInvalid,
            _ => ExtStatus::Unsuccessful,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ext_status_translation() {
        assert_eq!(VmmError::InvalidPath.ext_status(), ExtStatus::FileInvalid);
        assert_eq!(VmmError::InvalidPid { pid: 7 }.ext_status(), ExtStatus::FileInvalid);
        assert_eq!(
            VmmError::Device { reason: "timeout".into() }.ext_status(),
            ExtStatus::Unsuccessful
        );
        assert_eq!(
            VmmError::MemoryRead { pa: 0x1000 }.ext_status(),
            ExtStatus::Unsuccessful
        );
    }
}
