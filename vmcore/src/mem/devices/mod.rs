//! Concrete acquisition devices: a raw dump file and an in-memory image.

pub mod dump;
pub mod ram;

pub use dump::DumpFileDevice;
pub use ram::RamDevice;
