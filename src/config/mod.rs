//! Service configuration.
//!
//! Configuration is an INI file. The `[cache]`, `[workers]` and
//! `[permissions]` sections tune the engine; each `[type.<name>]` section
//! declares a cache type that is re-defined on every boot, since type
//! parameters are never persisted in the cache tree itself.

mod read_config;
mod types;

pub use read_config::{read_config, ConfigError, ConfigSource, Result};
pub use types::{
    ByteSize, CacheDirConfig, Config, PermissionsConfig, TypeConfig, WorkersConfig,
};
