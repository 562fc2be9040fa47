//! Configuration file reading and parsing.
//!
//! Locates and parses the INI-format configuration file. Lookup order:
//! an explicit path, then the `FILECACHE_CONFIG_FILE` environment
//! variable, then the default system path; a missing default file yields
//! the built-in configuration.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use configparser::ini::Ini;
use thiserror::Error;

use super::{
    ByteSize, CacheDirConfig, Config, PermissionsConfig, TypeConfig, WorkersConfig,
};

// =============================================================================
// Constants - Default Values
// =============================================================================

const DEFAULT_BASE_DIR: &str = "/var/cache/filecache";
const DEFAULT_DOWNLOAD_DIR: &str = "/var/cache/filecache-downloads";
const DEFAULT_ORPHAN_GRACE_SECS: u64 = 15;
const DEFAULT_VALIDATE_PERIOD_SECS: u64 = 15;
const DEFAULT_DIR_CLEANUP_DELAY_SECS: u64 = 120;

const ENV_CONFIG_FILE: &str = "FILECACHE_CONFIG_FILE";
const DEFAULT_CONFIG_PATH: &str = "/etc/filecache.conf";

const TYPE_SECTION_PREFIX: &str = "type.";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("cannot parse byte size '{value}': {message}")]
    InvalidByteSize { value: String, message: String },

    #[error("key '{key}' has non-integer value '{value}'")]
    InvalidInteger { key: String, value: String },

    #[error("key '{key}' has non-boolean value '{value}'")]
    InvalidBoolean { key: String, value: String },

    #[error("missing required field '{field}' in section '{section}'")]
    MissingRequiredField { section: String, field: String },
}

/// Result type for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

// =============================================================================
// ConfigSource
// =============================================================================

/// Specifies how to locate configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    /// Explicit config file path from the CLI. If specified and missing,
    /// error. If None, fall back to FILECACHE_CONFIG_FILE, then the
    /// default path, then built-in defaults.
    pub config_file: Option<PathBuf>,
}

// =============================================================================
// ByteSize Parsing
// =============================================================================

impl ByteSize {
    /// Parse a byte size such as "4096", "64KB" or "2g".
    ///
    /// Units are powers of 1024; a trailing B is optional ("64K" and
    /// "64KB" are the same size). Values that overflow u64 are rejected.
    pub fn parse(input: &str) -> Result<Self> {
        let fail = |message: String| ConfigError::InvalidByteSize {
            value: input.to_string(),
            message,
        };

        let text = input.trim();
        let split = text
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit())
            .map(|(i, _)| i)
            .unwrap_or(text.len());
        let (digits, rest) = text.split_at(split);
        let count: u64 = digits
            .parse()
            .map_err(|_| fail("expected a leading byte count".to_string()))?;

        let mut unit = rest.trim().to_ascii_uppercase();
        if unit.len() == 2 && unit.ends_with('B') {
            unit.pop();
        }
        let shift: u32 = match unit.as_str() {
            "" | "B" => 0,
            "K" => 10,
            "M" => 20,
            "G" => 30,
            "T" => 40,
            _ => return Err(fail(format!("unrecognized unit '{}'", rest.trim()))),
        };

        count
            .checked_mul(1u64 << shift)
            .map(ByteSize)
            .ok_or_else(|| fail("value does not fit in 64 bits".to_string()))
    }
}

// =============================================================================
// Field parsing helpers
// =============================================================================

fn get_bytesize(ini: &Ini, section: &str, key: &str) -> Result<Option<ByteSize>> {
    match ini.get(section, key) {
        None => Ok(None),
        Some(v) => ByteSize::parse(&v).map(Some),
    }
}

fn require_bytesize(ini: &Ini, section: &str, key: &str) -> Result<ByteSize> {
    get_bytesize(ini, section, key)?.ok_or_else(|| ConfigError::MissingRequiredField {
        section: section.to_string(),
        field: key.to_string(),
    })
}

fn get_u64(ini: &Ini, section: &str, key: &str, default: u64) -> Result<u64> {
    ini.getuint(section, key)
        .map(|value| value.unwrap_or(default))
        .map_err(|_| ConfigError::InvalidInteger {
            key: key.to_string(),
            value: ini.get(section, key).unwrap_or_default(),
        })
}

fn get_bool(ini: &Ini, section: &str, key: &str, default: bool) -> Result<bool> {
    ini.getboolcoerce(section, key)
        .map(|value| value.unwrap_or(default))
        .map_err(|_| ConfigError::InvalidBoolean {
            key: key.to_string(),
            value: ini.get(section, key).unwrap_or_default(),
        })
}

// =============================================================================
// read_config
// =============================================================================

/// Read and parse configuration.
pub fn read_config(source: &ConfigSource) -> Result<Config> {
    let (path, required) = match &source.config_file {
        Some(p) => (p.clone(), true),
        None => match env::var(ENV_CONFIG_FILE) {
            Ok(p) if !p.is_empty() => (PathBuf::from(p), true),
            _ => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        },
    };

    if !path.exists() {
        if required {
            return Err(ConfigError::FileNotFound(path));
        }
        return parse_ini(&Ini::new_cs());
    }

    let mut ini = Ini::new_cs();
    ini.load(&path).map_err(|message| ConfigError::ParseError {
        path: path.clone(),
        message,
    })?;
    parse_ini(&ini)
}

fn parse_ini(ini: &Ini) -> Result<Config> {
    let cache = CacheDirConfig {
        base_dir: ini
            .get("cache", "base_dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR)),
        default_download_dir: ini
            .get("cache", "default_download_dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR)),
        block_size: get_bytesize(ini, "cache", "block_size")?,
        orphan_grace_secs: get_u64(ini, "cache", "orphan_grace_secs", DEFAULT_ORPHAN_GRACE_SECS)?,
        enforce_reserve: get_bool(ini, "cache", "enforce_reserve", true)?,
    };

    let workers = WorkersConfig {
        validate_period_secs: get_u64(
            ini,
            "workers",
            "validate_period_secs",
            DEFAULT_VALIDATE_PERIOD_SECS,
        )?,
        dir_cleanup_delay_secs: get_u64(
            ini,
            "workers",
            "dir_cleanup_delay_secs",
            DEFAULT_DIR_CLEANUP_DELAY_SECS,
        )?,
    };

    let permissions = PermissionsConfig {
        allowed_destinations: ini
            .get("permissions", "allowed_destinations")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default(),
    };

    let mut types = HashMap::new();
    for section in ini.sections() {
        let Some(type_name) = section.strip_prefix(TYPE_SECTION_PREFIX) else {
            continue;
        };
        let type_config = TypeConfig {
            lo_watermark: require_bytesize(ini, &section, "lo_watermark")?,
            hi_watermark: require_bytesize(ini, &section, "hi_watermark")?,
            size: get_bytesize(ini, &section, "size")?.unwrap_or(ByteSize(0)),
            cost: get_u64(ini, &section, "cost", 0)? as u8,
            lifetime: get_u64(ini, &section, "lifetime", 0)?,
            dir_type: get_bool(ini, &section, "dir_type", false)?,
        };
        types.insert(type_name.to_string(), type_config);
    }

    Ok(Config {
        cache,
        workers,
        permissions,
        types,
    })
}
