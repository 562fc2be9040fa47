//! The file cache engine.
//!
//! A cache is a rooted directory tree plus an in-memory index. The
//! [`CacheSet`] owns every [`TypeCache`]; a type cache owns the
//! [`CacheObject`] records of its type. Objects are addressed by
//! server-assigned 64-bit IDs encoded into pathnames by the codec in
//! [`pathname`].

mod cache_set;
mod object;
pub mod pathname;
mod type_cache;
mod walk;

pub use cache_set::{CacheSet, CacheSetOptions, CacheStatus, DEFAULT_ORPHAN_GRACE};
pub use object::CacheObject;
pub use type_cache::{TypeCache, TypeStatus};
pub use walk::{walk_type_dir, WalkEvents, WalkedObject};

use serde::{Deserialize, Serialize};

/// Server-assigned identifier of a cached object. Always non-zero.
pub type ObjectId = u64;

/// Maximum length of a cache type name.
pub const MAX_TYPE_NAME_LEN: usize = 64;

/// Highest accepted value for an object's cost.
pub const MAX_COST: u8 = 100;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur in cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Inputs failed validation.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Entity not found, or a pathname no longer matches its indexed type.
    #[error("{0}")]
    Exists(String),

    /// A new cache type could not be defined.
    #[error("define failed: {0}")]
    Define(String),

    /// A cache type could not be changed.
    #[error("change failed: {0}")]
    Change(String),

    /// A cache type could not be deleted.
    #[error("delete failed: {0}")]
    Delete(String),

    /// An object could not be resized.
    #[error("resize failed: {0}")]
    Resize(String),

    /// Expire deferred because the object is pinned.
    #[error("object in use: {0}")]
    InUse(String),

    /// Destination not writable by the caller.
    #[error("no permission: {0}")]
    Permission(String),

    /// Destination is unusable or no unique name could be found.
    #[error("bad argument: {0}")]
    Argument(String),

    /// Filesystem error creating or using a destination.
    #[error("directory error: {0}")]
    Directory(String),

    /// A type was re-defined with conflicting parameters.
    #[error("configuration conflict: {0}")]
    Configuration(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// CacheParams
// =============================================================================

/// Parameters of a cache type: watermarks and insertion defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheParams {
    /// Bytes guaranteed to be reserved for the type.
    pub lo_watermark: u64,
    /// Hard cap in bytes on the type's usage.
    pub hi_watermark: u64,
    /// Default object size for inserts that omit one.
    pub default_size: u64,
    /// Default object cost (0-100) for inserts that omit one.
    pub default_cost: u8,
    /// Default object lifetime in seconds; 0 means infinite.
    pub default_lifetime: u64,
}

impl CacheParams {
    /// Create params with the given watermarks and zeroed defaults.
    pub fn new(lo_watermark: u64, hi_watermark: u64) -> Self {
        Self {
            lo_watermark,
            hi_watermark,
            default_size: 0,
            default_cost: 0,
            default_lifetime: 0,
        }
    }

    /// Set the default object size.
    pub fn with_default_size(mut self, size: u64) -> Self {
        self.default_size = size;
        self
    }

    /// Set the default object cost.
    pub fn with_default_cost(mut self, cost: u8) -> Self {
        self.default_cost = cost;
        self
    }

    /// Set the default object lifetime in seconds.
    pub fn with_default_lifetime(mut self, lifetime: u64) -> Self {
        self.default_lifetime = lifetime;
        self
    }

    /// Validate the watermark relation and cost range.
    pub fn validate(&self) -> Result<()> {
        if self.lo_watermark == 0 {
            return Err(CacheError::InvalidParams(
                "loWatermark must be greater than zero".to_string(),
            ));
        }
        if self.hi_watermark <= self.lo_watermark {
            return Err(CacheError::InvalidParams(
                "hiWatermark must be greater than loWatermark".to_string(),
            ));
        }
        if self.default_cost > MAX_COST {
            return Err(CacheError::InvalidParams(format!(
                "cost must be between 0 and {}",
                MAX_COST
            )));
        }
        Ok(())
    }
}

/// Validate the shape of a cache type name.
///
/// A name is 1-64 characters, does not start with a period, and must be
/// usable as a single path segment under the cache base directory.
pub fn validate_type_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_TYPE_NAME_LEN {
        return Err(CacheError::InvalidParams(format!(
            "typeName must be 1 to {} characters",
            MAX_TYPE_NAME_LEN
        )));
    }
    if name.starts_with('.') {
        return Err(CacheError::InvalidParams(
            "typeName cannot start with a period".to_string(),
        ));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(CacheError::InvalidParams(
            "typeName cannot contain path separators".to_string(),
        ));
    }
    Ok(())
}

/// Round `size` up to the next multiple of `block_size`.
pub(crate) fn round_to_blocks(size: u64, block_size: u64) -> u64 {
    if block_size <= 1 {
        return size;
    }
    size.div_ceil(block_size).saturating_mul(block_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_validate() {
        assert!(CacheParams::new(1_000, 10_000).validate().is_ok());
        assert!(CacheParams::new(0, 10_000).validate().is_err());
        assert!(CacheParams::new(1_000, 1_000).validate().is_err());
        assert!(CacheParams::new(1_000, 999).validate().is_err());
        assert!(CacheParams::new(1_000, 10_000)
            .with_default_cost(101)
            .validate()
            .is_err());
    }

    #[test]
    fn test_type_name_shape() {
        assert!(validate_type_name("photos").is_ok());
        assert!(validate_type_name(&"x".repeat(64)).is_ok());
        assert!(validate_type_name("").is_err());
        assert!(validate_type_name(&"x".repeat(65)).is_err());
        assert!(validate_type_name(".hidden").is_err());
        assert!(validate_type_name("a/b").is_err());
    }

    #[test]
    fn test_round_to_blocks() {
        assert_eq!(round_to_blocks(0, 4096), 0);
        assert_eq!(round_to_blocks(1, 4096), 4096);
        assert_eq!(round_to_blocks(4096, 4096), 4096);
        assert_eq!(round_to_blocks(4097, 4096), 8192);
        assert_eq!(round_to_blocks(12345, 1), 12345);
    }
}
