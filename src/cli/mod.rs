//! Command-line interface for the file cache service.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing::info;

use crate::cache::CacheError;
use crate::config::{read_config, ByteSize, ConfigError, ConfigSource};
use crate::service::{spawn_workers, DefineTypeParams, FileCacheService};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during CLI execution.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration error.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// Cache error.
    #[error("{0}")]
    Cache(#[from] CacheError),

    /// Output serialization error.
    #[error("{0}")]
    Serialize(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for CLI operations.
pub type Result<T> = std::result::Result<T, CliError>;

// =============================================================================
// CLI Definition
// =============================================================================

/// fcache - a persistent on-disk file cache service.
#[derive(Parser, Debug)]
#[command(name = "fcache", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the cache service until interrupted.
    Serve,

    /// Show cache status, overall and per type.
    Status {
        /// Emit JSON instead of plain text.
        #[arg(long)]
        json: bool,
    },

    /// List the defined cache types.
    Types,

    /// Define a new cache type.
    DefineType {
        /// Name of the new cache type.
        name: String,

        /// Bytes reserved for the type, e.g. "1MB".
        #[arg(long, value_parser = parse_byte_size)]
        lo_watermark: u64,

        /// Hard cap in bytes on the type's usage, e.g. "10MB".
        #[arg(long, value_parser = parse_byte_size)]
        hi_watermark: u64,

        /// Default object size for inserts that omit one.
        #[arg(long, value_parser = parse_byte_size, default_value = "0")]
        size: u64,

        /// Default object cost (0-100).
        #[arg(long, default_value_t = 0)]
        cost: u8,

        /// Default object lifetime in seconds; 0 means infinite.
        #[arg(long, default_value_t = 0)]
        lifetime: u64,

        /// Objects of this type are directories.
        #[arg(long)]
        dir_type: bool,
    },

    /// Run one maintenance pass (orphans, subscribed objects, dir types).
    Gc,
}

/// Byte-size argument parser ("1MB", "4096") for clap.
fn parse_byte_size(raw: &str) -> std::result::Result<u64, String> {
    ByteSize::parse(raw).map(|b| b.0).map_err(|e| e.to_string())
}

// =============================================================================
// Entry point
// =============================================================================

/// Parse arguments and run the requested command.
pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let source = ConfigSource {
        config_file: cli.config.clone(),
    };
    let config = read_config(&source)?;

    match cli.command {
        Command::Serve => {
            let service = FileCacheService::open(&config).await?;
            let status = service.get_cache_status().await;
            info!(
                types = status.num_types,
                objects = status.num_objects,
                used = status.size,
                "file cache service ready"
            );
            let _workers = spawn_workers(&service, &config.workers);
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            Ok(())
        }
        Command::Status { json } => {
            let service = FileCacheService::attach(&config).await?;
            let status = service.get_cache_status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!(
                    "types: {}  objects: {}  used: {} bytes  avail: {} bytes",
                    status.num_types, status.num_objects, status.size, status.avail_space
                );
                for name in service.get_cache_types().await {
                    let ts = service.get_cache_type_status(&name).await?;
                    println!("  {:<24} {:>12} bytes  {:>8} objects", name, ts.used, ts.count);
                }
            }
            Ok(())
        }
        Command::Types => {
            let service = FileCacheService::attach(&config).await?;
            for name in service.get_cache_types().await {
                println!("{}", name);
            }
            Ok(())
        }
        Command::DefineType {
            name,
            lo_watermark,
            hi_watermark,
            size,
            cost,
            lifetime,
            dir_type,
        } => {
            let service = FileCacheService::attach(&config).await?;
            service
                .define_type(DefineTypeParams {
                    type_name: name.clone(),
                    lo_watermark,
                    hi_watermark,
                    size,
                    cost,
                    lifetime,
                    dir_type,
                })
                .await?;
            println!("defined type '{}'", name);
            println!(
                "add a [type.{}] section to the config file to keep it across restarts",
                name
            );
            Ok(())
        }
        Command::Gc => {
            let service = FileCacheService::attach(&config).await?;
            service.run_maintenance().await;
            service.run_dir_cleanup().await;
            let status = service.get_cache_status().await;
            println!(
                "after cleanup: {} objects, {} bytes used",
                status.num_objects, status.size
            );
            Ok(())
        }
    }
}
