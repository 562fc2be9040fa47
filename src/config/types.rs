//! Configuration types for the file cache service.
//!
//! These structures represent the application configuration as parsed from
//! an INI-format config file.

use std::collections::HashMap;
use std::path::PathBuf;

// =============================================================================
// Primitive Types
// =============================================================================

/// A byte size that can be parsed from strings like "100MB", "1GB", etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSize(pub u64);

// =============================================================================
// Config Sections
// =============================================================================

/// [cache] section - cache tree location and accounting.
#[derive(Debug, Clone)]
pub struct CacheDirConfig {
    /// Root of the cache tree.
    pub base_dir: PathBuf,
    /// Destination used by copy requests that omit one. Must not live
    /// under `base_dir` or startup cleanup would remove it.
    pub default_download_dir: PathBuf,
    /// Accounting block size override; detected from the filesystem when
    /// absent.
    pub block_size: Option<ByteSize>,
    /// Age an unindexed file must reach before the orphan cleaner removes it.
    pub orphan_grace_secs: u64,
    /// Reject type definitions whose summed reserves exceed disk capacity.
    pub enforce_reserve: bool,
}

/// [workers] section - periodic maintenance cadence.
#[derive(Debug, Clone)]
pub struct WorkersConfig {
    /// Period of the subscribed-object validator and orphan cleaner.
    pub validate_period_secs: u64,
    /// Delay before the one-shot dir-type cleanup after startup.
    pub dir_cleanup_delay_secs: u64,
}

/// [permissions] section - where copies may be written.
#[derive(Debug, Clone)]
pub struct PermissionsConfig {
    /// Directories (and their subtrees) writable by copy requests.
    /// An empty list allows any destination.
    pub allowed_destinations: Vec<PathBuf>,
}

/// [type.{name}] section - a cache type declared in configuration.
///
/// Declared types are defined when the service boots, restoring the
/// quota layout the on-disk tree was built under.
#[derive(Debug, Clone)]
pub struct TypeConfig {
    pub lo_watermark: ByteSize,
    pub hi_watermark: ByteSize,
    pub size: ByteSize,
    pub cost: u8,
    pub lifetime: u64,
    pub dir_type: bool,
}

// =============================================================================
// Top-Level Config
// =============================================================================

/// Complete application configuration as parsed from the config file.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache: CacheDirConfig,
    pub workers: WorkersConfig,
    pub permissions: PermissionsConfig,
    pub types: HashMap<String, TypeConfig>,
}
