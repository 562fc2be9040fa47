//! filecache-rs - A persistent on-disk file cache service.
//!
//! Cache types are named, quota-bounded buckets of cached files. Clients
//! define types with low/high watermark quotas, insert files addressed by
//! server-assigned object IDs, subscribe to pin in-progress writes, and
//! copy cached files out to permitted destinations. The store survives
//! restart by walking its directory tree and rebuilding the index.

pub mod cache;
pub mod cli;
pub mod config;
pub mod service;
pub mod util;

pub use cache::{
    CacheError, CacheObject, CacheParams, CacheSet, CacheSetOptions, CacheStatus, ObjectId,
    TypeCache, TypeStatus,
};
pub use service::{FileCacheService, INTERFACE_VERSION};
