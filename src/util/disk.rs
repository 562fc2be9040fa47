//! Filesystem capacity and free-space queries.
//!
//! The cache consults the filesystem on every insert and reclamation pass,
//! so the query lives behind the [`DiskStats`] trait and tests can inject
//! fixed values instead of the real disk.

use std::io;
use std::path::Path;

/// Fallback accounting block size when the filesystem does not report one.
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// Capacity and free space of the filesystem holding a path.
pub trait DiskStats: Send + Sync {
    /// Bytes still available on the filesystem containing `path`.
    fn available(&self, path: &Path) -> io::Result<u64>;

    /// Total capacity in bytes of the filesystem containing `path`.
    fn capacity(&self, path: &Path) -> io::Result<u64>;
}

// =============================================================================
// SysinfoDisks
// =============================================================================

/// Real disk statistics via the system disk list.
///
/// The disk whose mount point is the longest prefix of the queried path is
/// taken to be the owning filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoDisks;

impl SysinfoDisks {
    fn best_match(path: &Path) -> io::Result<(u64, u64)> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let mut best: Option<(usize, u64, u64)> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if path.starts_with(mount) {
                let len = mount.as_os_str().len();
                if best.map(|(l, _, _)| l).unwrap_or(0) <= len {
                    best = Some((len, disk.available_space(), disk.total_space()));
                }
            }
        }
        match best {
            Some((_, avail, total)) => Ok((avail, total)),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no filesystem found for {}", path.display()),
            )),
        }
    }
}

impl DiskStats for SysinfoDisks {
    fn available(&self, path: &Path) -> io::Result<u64> {
        Self::best_match(path).map(|(avail, _)| avail)
    }

    fn capacity(&self, path: &Path) -> io::Result<u64> {
        Self::best_match(path).map(|(_, total)| total)
    }
}

// =============================================================================
// FixedDiskStats
// =============================================================================

/// Disk statistics with fixed values, for tests and capacity simulation.
#[derive(Debug, Clone, Copy)]
pub struct FixedDiskStats {
    pub available: u64,
    pub capacity: u64,
}

impl FixedDiskStats {
    pub fn new(available: u64, capacity: u64) -> Self {
        Self {
            available,
            capacity,
        }
    }
}

impl DiskStats for FixedDiskStats {
    fn available(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.available)
    }

    fn capacity(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.capacity)
    }
}

// =============================================================================
// Block size
// =============================================================================

/// Preferred I/O block size of the filesystem holding `path`.
#[cfg(unix)]
pub fn detect_block_size(path: &Path) -> u64 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path)
        .map(|m| m.blksize())
        .ok()
        .filter(|&b| b > 0)
        .unwrap_or(DEFAULT_BLOCK_SIZE)
}

#[cfg(not(unix))]
pub fn detect_block_size(_path: &Path) -> u64 {
    DEFAULT_BLOCK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_stats() {
        let stats = FixedDiskStats::new(1_000, 10_000);
        let p = Path::new("/anywhere");
        assert_eq!(stats.available(p).unwrap(), 1_000);
        assert_eq!(stats.capacity(p).unwrap(), 10_000);
    }

    #[test]
    fn test_detect_block_size_present_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let block = detect_block_size(dir.path());
        assert!(block > 0);
    }

    #[test]
    fn test_detect_block_size_missing_path_falls_back() {
        let block = detect_block_size(Path::new("/definitely/not/here"));
        assert_eq!(block, DEFAULT_BLOCK_SIZE);
    }
}
