//! The public operation surface of the file cache.
//!
//! [`FileCacheService`] owns the cache set and exposes the typed
//! operations a transport layer dispatches to: type management, object
//! insertion and lifecycle, subscriptions, status queries, and copying
//! cached files out to permitted destinations. All index access funnels
//! through one async mutex, so operations observe each other in a single
//! serial order.

mod copier;
mod permissions;
mod subscriptions;
mod workers;

pub use copier::{AsyncCopier, FileCopier};
pub use permissions::{AllowListPermissions, WritePermission};
pub use subscriptions::{Subscription, SubscriptionId, SubscriptionTable};
pub use workers::spawn_workers;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{
    pathname, CacheError, CacheParams, CacheSet, CacheSetOptions, CacheStatus, ObjectId, Result,
    TypeStatus,
};
use crate::config::Config;
use crate::util::{DiskStats, SysinfoDisks};

/// Version reported by GetVersion.
pub const INTERFACE_VERSION: &str = "1.0";

/// Collision suffixes tried before a copy gives up on a unique name.
const MAX_UNIQUE_FILE_INDEX: u32 = 100;

// =============================================================================
// Parameter and reply types
// =============================================================================

/// Parameters for DefineType.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefineTypeParams {
    pub type_name: String,
    pub lo_watermark: u64,
    pub hi_watermark: u64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub cost: u8,
    #[serde(default)]
    pub lifetime: u64,
    #[serde(default)]
    pub dir_type: bool,
}

/// Parameters for ChangeType; absent fields keep their current values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeTypeParams {
    pub type_name: String,
    pub lo_watermark: Option<u64>,
    pub hi_watermark: Option<u64>,
    pub size: Option<u64>,
    pub cost: Option<u8>,
    pub lifetime: Option<u64>,
}

/// Reply for DescribeType.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeDescription {
    pub lo_watermark: u64,
    pub hi_watermark: u64,
    pub size: u64,
    pub cost: u8,
    pub lifetime: u64,
    pub dir_type: bool,
}

/// Parameters for InsertCacheObject; absent values take the type defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertParams {
    pub type_name: String,
    pub file_name: String,
    pub size: Option<u64>,
    pub cost: Option<u8>,
    pub lifetime: Option<u64>,
    #[serde(default)]
    pub subscribe: bool,
}

/// Reply for InsertCacheObject.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertReply {
    pub path_name: PathBuf,
    pub subscribed: bool,
    /// Cancellation handle when the insert subscribed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionId>,
}

/// Reply for SubscribeCacheObject.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeReply {
    pub path_name: PathBuf,
    pub subscribed: bool,
    pub subscription: SubscriptionId,
}

/// Parameters for CopyCacheObject.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyParams {
    pub path_name: PathBuf,
    pub destination: Option<PathBuf>,
    pub file_name: Option<String>,
}

// =============================================================================
// FileCacheService
// =============================================================================

/// The file cache service: the cache engine plus its collaborators.
#[derive(Clone)]
pub struct FileCacheService {
    cache: Arc<Mutex<CacheSet>>,
    subscriptions: Arc<Mutex<SubscriptionTable>>,
    copier: Arc<dyn FileCopier>,
    permissions: Arc<dyn WritePermission>,
    default_download_dir: PathBuf,
}

impl FileCacheService {
    /// Open the service from configuration: attach to the cache tree,
    /// clear startup leftovers and ensure the default download directory
    /// exists. This is the boot path for the daemon.
    pub async fn open(config: &Config) -> Result<Self> {
        let service = Self::attach(config).await?;
        service.cache.lock().await.cleanup_at_startup().await?;
        tokio::fs::create_dir_all(&service.default_download_dir).await?;
        Ok(service)
    }

    /// Attach to the cache tree without removing anything: build the cache
    /// set, define the configured types and rebuild the index from disk.
    /// Inspection commands use this path.
    pub async fn attach(config: &Config) -> Result<Self> {
        let disk: Arc<dyn DiskStats> = Arc::new(SysinfoDisks);
        let options = CacheSetOptions {
            block_size: config.cache.block_size.map(|b| b.0),
            orphan_grace: Duration::from_secs(config.cache.orphan_grace_secs),
            enforce_reserve: config.cache.enforce_reserve,
        };
        let mut set = CacheSet::new(&config.cache.base_dir, disk, options).await?;

        for (name, declared) in &config.types {
            let params = CacheParams {
                lo_watermark: declared.lo_watermark.0,
                hi_watermark: declared.hi_watermark.0,
                default_size: declared.size.0,
                default_cost: declared.cost,
                default_lifetime: declared.lifetime,
            };
            if let Err(e) = set.define_type(name, params, declared.dir_type).await {
                warn!(type_name = %name, error = %e, "skipping configured type");
            }
        }

        set.walk_dir_tree().await?;

        Ok(Self::with_parts(
            set,
            Arc::new(AllowListPermissions::new(
                config.permissions.allowed_destinations.clone(),
            )),
            Arc::new(AsyncCopier::spawn()),
            config.cache.default_download_dir.clone(),
        ))
    }

    /// Assemble a service from already-built parts.
    pub fn with_parts(
        cache: CacheSet,
        permissions: Arc<dyn WritePermission>,
        copier: Arc<dyn FileCopier>,
        default_download_dir: PathBuf,
    ) -> Self {
        Self {
            cache: Arc::new(Mutex::new(cache)),
            subscriptions: Arc::new(Mutex::new(SubscriptionTable::new())),
            copier,
            permissions,
            default_download_dir,
        }
    }

    // =========================================================================
    // Type management
    // =========================================================================

    /// Define a new cache type.
    pub async fn define_type(&self, params: DefineTypeParams) -> Result<()> {
        if params.hi_watermark <= params.lo_watermark {
            return Err(CacheError::InvalidParams(
                "hiWatermark must be greater than loWatermark".to_string(),
            ));
        }
        let cache_params = CacheParams {
            lo_watermark: params.lo_watermark,
            hi_watermark: params.hi_watermark,
            default_size: params.size,
            default_cost: params.cost,
            default_lifetime: params.lifetime,
        };
        let mut set = self.cache.lock().await;
        set.define_type(&params.type_name, cache_params, params.dir_type)
            .await
    }

    /// Change parameters of an existing type; unspecified fields keep
    /// their current values.
    pub async fn change_type(&self, params: ChangeTypeParams) -> Result<()> {
        let mut set = self.cache.lock().await;
        let current = set
            .describe_type(&params.type_name)
            .map_err(|_| CacheError::Change(format!("type '{}' does not exist", params.type_name)))?;
        let merged = CacheParams {
            lo_watermark: params.lo_watermark.unwrap_or(current.lo_watermark),
            hi_watermark: params.hi_watermark.unwrap_or(current.hi_watermark),
            default_size: params.size.unwrap_or(current.default_size),
            default_cost: params.cost.unwrap_or(current.default_cost),
            default_lifetime: params.lifetime.unwrap_or(current.default_lifetime),
        };
        if merged.hi_watermark <= merged.lo_watermark {
            return Err(CacheError::InvalidParams(
                "hiWatermark must be greater than loWatermark".to_string(),
            ));
        }
        set.change_type(&params.type_name, merged).await
    }

    /// Delete an empty cache type, returning the bytes it freed.
    pub async fn delete_type(&self, type_name: &str) -> Result<u64> {
        self.cache.lock().await.delete_type(type_name).await
    }

    /// Describe a cache type's current parameters.
    pub async fn describe_type(&self, type_name: &str) -> Result<TypeDescription> {
        let set = self.cache.lock().await;
        let params = set.describe_type(type_name)?;
        Ok(TypeDescription {
            lo_watermark: params.lo_watermark,
            hi_watermark: params.hi_watermark,
            size: params.default_size,
            cost: params.default_cost,
            lifetime: params.default_lifetime,
            dir_type: set.is_dir_type(type_name),
        })
    }

    /// Names of all defined cache types.
    pub async fn get_cache_types(&self) -> Vec<String> {
        self.cache.lock().await.get_types()
    }

    // =========================================================================
    // Object lifecycle
    // =========================================================================

    /// Insert a new object, optionally subscribing the inserter to it.
    pub async fn insert_cache_object(
        &self,
        params: InsertParams,
        principal: &str,
    ) -> Result<InsertReply> {
        let mut set = self.cache.lock().await;
        let defaults = set
            .describe_type(&params.type_name)
            .map_err(|_| CacheError::Exists(format!("no type '{}' defined", params.type_name)))?;

        let size = params.size.unwrap_or(defaults.default_size);
        let cost = params.cost.unwrap_or(defaults.default_cost);
        let lifetime = params.lifetime.unwrap_or(defaults.default_lifetime);

        let id = set
            .insert(
                &params.type_name,
                &params.file_name,
                size,
                cost,
                lifetime,
                params.subscribe,
            )
            .await?;
        let path_name = set.pathname_of(id).expect("just inserted");

        let subscription = if params.subscribe {
            let mut table = self.subscriptions.lock().await;
            Some(table.add(id, path_name.clone(), principal))
        } else {
            None
        };
        debug!(id, principal, subscribed = params.subscribe, "insert complete");
        Ok(InsertReply {
            path_name,
            subscribed: params.subscribe,
            subscription,
        })
    }

    /// Resize a cached object to a new size.
    pub async fn resize_cache_object(&self, path: &Path, new_size: u64) -> Result<u64> {
        let mut set = self.cache.lock().await;
        let id = verify_object_path(&set, path)?;
        let final_size = set.resize(id, new_size).await?;
        if final_size != new_size {
            return Err(CacheError::Resize("unable to resize object".to_string()));
        }
        Ok(final_size)
    }

    /// Expire a cached object; pinned objects are expired when released.
    pub async fn expire_cache_object(&self, path: &Path, principal: &str) -> Result<()> {
        let mut set = self.cache.lock().await;
        let id = verify_object_path(&set, path)?;
        if set.expire(id).await? {
            info!(id, principal, "object expired by user");
            Ok(())
        } else {
            Err(CacheError::InUse("expire deferred, object in use".to_string()))
        }
    }

    /// Mark a cached object as recently used.
    pub async fn touch_cache_object(&self, path: &Path) -> Result<()> {
        let mut set = self.cache.lock().await;
        let id = verify_object_path(&set, path)?;
        if set.touch(id) {
            Ok(())
        } else {
            Err(CacheError::Exists("could not locate object".to_string()))
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Pin a cached object for the duration of a client's use.
    pub async fn subscribe_cache_object(
        &self,
        path: &Path,
        principal: &str,
    ) -> Result<SubscribeReply> {
        let mut set = self.cache.lock().await;
        let id = verify_object_path(&set, path)?;
        let path_name = set.subscribe(id)?;
        let subscription = {
            let mut table = self.subscriptions.lock().await;
            table.add(id, path_name.clone(), principal)
        };
        debug!(id, principal, "subscribed object");
        Ok(SubscribeReply {
            path_name,
            subscribed: true,
            subscription,
        })
    }

    /// Release a subscription.
    ///
    /// This is the host's cancellation callback: it runs both for explicit
    /// unsubscribes and when a subscribed client disconnects. Dropping the
    /// last pin applies any pending expire.
    pub async fn cancel_subscription(&self, subscription: SubscriptionId) {
        let mut set = self.cache.lock().await;
        let removed = self.subscriptions.lock().await.remove(subscription);
        let Some(sub) = removed else {
            return;
        };
        let type_name = pathname::type_name_from_path(set.base_dir(), &sub.path);
        if type_name.is_empty() {
            warn!(subscription, "pathname no longer found in cache");
            return;
        }
        set.unsubscribe(&type_name, sub.object_id).await;
        info!(
            subscription,
            client = %sub.client,
            "removed subscription"
        );
    }

    /// Number of live subscriptions.
    pub async fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    // =========================================================================
    // Copy
    // =========================================================================

    /// Copy a cached object to a non-cached destination.
    ///
    /// Returns the final destination path, which may differ from the
    /// requested one when a name collision forced a `-(N)` suffix.
    pub async fn copy_cache_object(&self, params: CopyParams, principal: &str) -> Result<PathBuf> {
        let (src, file_name) = {
            let set = self.cache.lock().await;
            let id = verify_object_path(&set, &params.path_name)?;
            let src = set
                .pathname_of(id)
                .ok_or_else(|| CacheError::Exists("could not locate object".to_string()))?;
            let file_name = match &params.file_name {
                Some(name) if !name.is_empty() => name.clone(),
                _ => {
                    let stored = set.object_filename(id).unwrap_or_default();
                    if stored.is_empty() {
                        return Err(CacheError::Argument(
                            "no fileName specified or found".to_string(),
                        ));
                    }
                    stored
                }
            };
            (src, file_name)
        };

        let destination = params
            .destination
            .clone()
            .unwrap_or_else(|| self.default_download_dir.clone());
        if !self.permissions.can_write(&destination, principal) {
            return Err(CacheError::Permission(
                "invalid destination, no write permission".to_string(),
            ));
        }

        if !tokio::fs::try_exists(&destination)
            .await
            .map_err(|e| CacheError::Directory(e.to_string()))?
        {
            tokio::fs::create_dir_all(&destination)
                .await
                .map_err(|e| CacheError::Directory(e.to_string()))?;
        }
        let meta = tokio::fs::metadata(&destination)
            .await
            .map_err(|e| CacheError::Directory(e.to_string()))?;
        if !meta.is_dir() {
            return Err(CacheError::Argument(
                "invalid destination, not a directory".to_string(),
            ));
        }

        let dest = unique_destination(&destination, &file_name).await?;
        self.copier
            .copy(&src, &dest)
            .await
            .map_err(|e| CacheError::Directory(e.to_string()))?;
        info!(src = %src.display(), dest = %dest.display(), principal, "copied cache object");
        Ok(dest)
    }

    // =========================================================================
    // Status queries
    // =========================================================================

    /// Status of the cache as a whole.
    pub async fn get_cache_status(&self) -> CacheStatus {
        self.cache.lock().await.get_cache_status()
    }

    /// Status of a single cache type.
    pub async fn get_cache_type_status(&self, type_name: &str) -> Result<TypeStatus> {
        self.cache.lock().await.get_type_status(type_name)
    }

    /// Accounted size of a cached object.
    pub async fn get_cache_object_size(&self, path: &Path) -> Result<u64> {
        let set = self.cache.lock().await;
        let id = pathname::object_id_from_path(path)?;
        set.object_size(id)
            .ok_or_else(|| CacheError::Exists(format!("object '{}' doesn't exist", path.display())))
    }

    /// Original filename of a cached object.
    pub async fn get_cache_object_filename(&self, path: &Path) -> Result<String> {
        let set = self.cache.lock().await;
        let id = pathname::object_id_from_path(path)?;
        set.object_filename(id)
            .ok_or_else(|| CacheError::Exists(format!("object '{}' doesn't exist", path.display())))
    }

    /// The file cache interface version.
    pub fn get_version(&self) -> &'static str {
        INTERFACE_VERSION
    }

    // =========================================================================
    // Maintenance entry points
    // =========================================================================

    /// One validator pass: reconcile orphans and check every subscribed
    /// object against the filesystem.
    pub async fn run_maintenance(&self) {
        let mut set = self.cache.lock().await;
        set.cleanup_orphans().await;
        let snapshot = self.subscriptions.lock().await.snapshot();
        for sub in snapshot {
            let type_name = pathname::type_name_from_path(set.base_dir(), &sub.path);
            if type_name.is_empty() {
                continue;
            }
            debug!(id = sub.object_id, "validating subscribed object");
            set.check_subscribed_object(&type_name, sub.object_id).await;
        }
    }

    /// One dir-type cleanup pass.
    pub async fn run_dir_cleanup(&self) {
        self.cache.lock().await.cleanup_dir_types().await;
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Decode a caller-supplied pathname and confirm the object still lives in
/// the type the path names.
fn verify_object_path(set: &CacheSet, path: &Path) -> Result<ObjectId> {
    let (id, path_type) = pathname::decode_pathname(set.base_dir(), path)?;
    let indexed_type = set.type_of_object(id);
    if indexed_type.is_empty() || indexed_type != path_type {
        return Err(CacheError::Exists(format!(
            "'{}' no longer found in cache",
            path.display()
        )));
    }
    Ok(id)
}

/// Split a filename into its stem and extension (dot included).
fn split_file_name(file_name: &str) -> (String, String) {
    let path = Path::new(file_name);
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) => (
            stem.to_string_lossy().into_owned(),
            format!(".{}", ext.to_string_lossy()),
        ),
        _ => (file_name.to_string(), String::new()),
    }
}

/// Find a non-colliding name for `file_name` inside `dir`.
///
/// Collisions get a `-(N)` suffix before the extension, counting up from 1.
async fn unique_destination(dir: &Path, file_name: &str) -> Result<PathBuf> {
    let mut candidate = dir.join(file_name);
    let (stem, ext) = split_file_name(file_name);
    let mut index = 1u32;
    while tokio::fs::try_exists(&candidate)
        .await
        .map_err(|e| CacheError::Directory(e.to_string()))?
    {
        if index >= MAX_UNIQUE_FILE_INDEX {
            return Err(CacheError::Argument(
                "no unique destination name found".to_string(),
            ));
        }
        candidate = dir.join(format!("{}-({}){}", stem, index, ext));
        index += 1;
    }
    Ok(candidate)
}
