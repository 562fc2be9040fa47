//! Shared utilities.

mod disk;

pub use disk::{detect_block_size, DiskStats, FixedDiskStats, SysinfoDisks, DEFAULT_BLOCK_SIZE};
