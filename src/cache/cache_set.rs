//! The cache set: root owner of every cache type.
//!
//! Coordinates cross-type concerns: the monotonic object-ID counter,
//! global free-space accounting, the startup directory walk, and the
//! orphan/startup cleanup passes. All public operations route through
//! here and are serialized by the owner (the service holds the set behind
//! a single async mutex).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::util::{detect_block_size, DiskStats};

use super::object::CacheObject;
use super::pathname::build_pathname;
use super::type_cache::{TypeCache, TypeStatus};
use super::walk::walk_type_dir;
use super::{
    round_to_blocks, validate_type_name, CacheError, CacheParams, ObjectId, Result, MAX_COST,
};

/// Default age a stray file must reach before the orphan cleaner removes it.
pub const DEFAULT_ORPHAN_GRACE: Duration = Duration::from_secs(15);

/// Aggregate status of the whole cache.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheStatus {
    pub num_types: u64,
    pub size: u64,
    pub num_objects: u64,
    pub avail_space: u64,
}

/// Construction options for a [`CacheSet`].
pub struct CacheSetOptions {
    /// Accounting block size; detected from the base directory when None.
    pub block_size: Option<u64>,
    /// Grace window before unindexed files are removed.
    pub orphan_grace: Duration,
    /// Enforce that the summed low watermarks stay within disk capacity.
    pub enforce_reserve: bool,
}

impl Default for CacheSetOptions {
    fn default() -> Self {
        Self {
            block_size: None,
            orphan_grace: DEFAULT_ORPHAN_GRACE,
            enforce_reserve: true,
        }
    }
}

/// The root of the cache: all type caches plus the base directory.
pub struct CacheSet {
    base: PathBuf,
    types: BTreeMap<String, TypeCache>,
    next_id: ObjectId,
    block_size: u64,
    orphan_grace: Duration,
    disk: Arc<dyn DiskStats>,
    enforce_reserve: bool,
}

impl CacheSet {
    /// Create a cache set rooted at `base`, creating the directory if
    /// needed. A base directory that cannot be created is fatal.
    pub async fn new(
        base: impl AsRef<Path>,
        disk: Arc<dyn DiskStats>,
        options: CacheSetOptions,
    ) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base).await?;
        let block_size = options.block_size.unwrap_or_else(|| detect_block_size(&base));
        info!(base = %base.display(), block_size, "cache set opened");
        Ok(Self {
            base,
            types: BTreeMap::new(),
            next_id: 1,
            block_size,
            orphan_grace: options.orphan_grace,
            disk,
            enforce_reserve: options.enforce_reserve,
        })
    }

    /// The cache base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    /// The accounting block size.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    // =========================================================================
    // Type management
    // =========================================================================

    /// Define a new cache type and create its directory.
    ///
    /// Re-defining an existing type with identical parameters reports
    /// `Exists`; with different parameters it reports `Configuration`.
    pub async fn define_type(
        &mut self,
        name: &str,
        params: CacheParams,
        dir_type: bool,
    ) -> Result<()> {
        validate_type_name(name)?;
        params.validate()?;

        if let Some(existing) = self.types.get(name) {
            if *existing.params() == params && existing.is_dir_type() == dir_type {
                return Err(CacheError::Exists(format!(
                    "type '{}' already exists",
                    name
                )));
            }
            return Err(CacheError::Configuration(format!(
                "type '{}' has different configuration",
                name
            )));
        }

        self.check_reserve(params.lo_watermark, None)?;

        tokio::fs::create_dir_all(self.base.join(name))
            .await
            .map_err(|e| CacheError::Define(format!("cannot create type directory: {}", e)))?;

        info!(
            type_name = name,
            lo = params.lo_watermark,
            hi = params.hi_watermark,
            dir_type,
            "defined cache type"
        );
        self.types
            .insert(name.to_string(), TypeCache::new(name, &self.base, params, dir_type));
        Ok(())
    }

    /// Change an existing type's parameters.
    pub async fn change_type(&mut self, name: &str, params: CacheParams) -> Result<()> {
        params.validate()?;
        if !self.types.contains_key(name) {
            return Err(CacheError::Change(format!("type '{}' does not exist", name)));
        }
        self.check_reserve(params.lo_watermark, Some(name))?;
        let cache = self.types.get_mut(name).expect("checked above");
        cache.change(params).await
    }

    /// Current parameters of a type.
    pub fn describe_type(&self, name: &str) -> Result<CacheParams> {
        self.types
            .get(name)
            .map(|t| *t.params())
            .ok_or_else(|| CacheError::Exists(format!("type '{}' does not exist", name)))
    }

    /// Delete an empty cache type, returning the bytes it had accounted.
    ///
    /// Types still holding objects are rejected; clients expire objects
    /// first.
    pub async fn delete_type(&mut self, name: &str) -> Result<u64> {
        let cache = self
            .types
            .get(name)
            .ok_or_else(|| CacheError::Delete(format!("type '{}' does not exist", name)))?;
        if cache.status().count > 0 {
            return Err(CacheError::Delete(format!(
                "type '{}' is not empty; expire its objects first",
                name
            )));
        }
        let freed = cache.used();
        let dir = cache.type_dir();
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CacheError::Delete(format!(
                    "cannot remove type directory: {}",
                    e
                )))
            }
        }
        let mut cache = self.types.remove(name).expect("checked above");
        cache.clear();
        info!(type_name = name, freed, "deleted cache type");
        Ok(freed)
    }

    /// Enforce that summed low watermarks stay within filesystem capacity.
    ///
    /// `replacing` names a type whose current reserve is superseded by
    /// `new_lo` (the ChangeType path); DefineType passes None.
    fn check_reserve(&self, new_lo: u64, replacing: Option<&str>) -> Result<()> {
        if !self.enforce_reserve {
            return Ok(());
        }
        let capacity = self.disk.capacity(&self.base)?;
        let reserved: u64 = self
            .types
            .iter()
            .filter(|(name, _)| Some(name.as_str()) != replacing)
            .map(|(_, t)| t.params().lo_watermark)
            .sum();
        let total = reserved.saturating_add(new_lo);
        if total > capacity {
            let msg = format!(
                "summed loWatermarks of {} bytes exceed filesystem capacity of {}",
                total, capacity
            );
            return Err(match replacing {
                Some(_) => CacheError::Change(msg),
                None => CacheError::Define(msg),
            });
        }
        Ok(())
    }

    /// Whether a type is defined.
    pub fn type_exists(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Whether a type stores directory objects.
    pub fn is_dir_type(&self, name: &str) -> bool {
        self.types.get(name).map(|t| t.is_dir_type()).unwrap_or(false)
    }

    /// Names of all defined types, in order.
    pub fn get_types(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    /// The type currently holding an object, or empty if unknown.
    pub fn type_of_object(&self, id: ObjectId) -> String {
        self.types
            .values()
            .find(|t| t.contains(id))
            .map(|t| t.name().to_string())
            .unwrap_or_default()
    }

    // =========================================================================
    // Inserts and reclamation
    // =========================================================================

    /// Insert a new object into a type, making room first.
    ///
    /// Returns the new object's ID; its pathname follows from the codec.
    /// When `subscribe` is set the record starts in the writing state with
    /// the inserter holding the first pin.
    pub async fn insert(
        &mut self,
        type_name: &str,
        file_name: &str,
        size: u64,
        cost: u8,
        lifetime: u64,
        subscribe: bool,
    ) -> Result<ObjectId> {
        if file_name.is_empty() || file_name.contains('/') {
            return Err(CacheError::InvalidParams(
                "fileName must be a plain basename".to_string(),
            ));
        }
        if cost > MAX_COST {
            return Err(CacheError::InvalidParams(format!(
                "cost must be between 0 and {}",
                MAX_COST
            )));
        }
        let dir_type = {
            let cache = self.types.get(type_name).ok_or_else(|| {
                CacheError::Exists(format!("no type '{}' defined", type_name))
            })?;
            cache.is_dir_type()
        };
        if dir_type {
            if size <= self.block_size {
                return Err(CacheError::InvalidParams(
                    "size must be greater than 1 block when dirType = true".to_string(),
                ));
            }
        } else if size == 0 {
            return Err(CacheError::InvalidParams(
                "size must be greater than zero".to_string(),
            ));
        }

        let rounded = round_to_blocks(size, self.block_size);
        self.make_room(type_name, rounded).await?;

        let id = self.next_id;
        let path = build_pathname(&self.base, type_name, id, file_name);
        tokio::fs::create_dir_all(path.parent().expect("pathname has shard parent")).await?;
        if dir_type {
            tokio::fs::create_dir(&path).await?;
        } else {
            let file = tokio::fs::File::create(&path).await?;
            file.set_len(size).await?;
        }
        self.next_id += 1;

        let now = Utc::now();
        let record = CacheObject {
            id,
            file_name: file_name.to_string(),
            size: rounded,
            cost,
            lifetime,
            inserted_at: now,
            accessed_at: now,
            subscribers: if subscribe { 1 } else { 0 },
            writing: subscribe,
            expire_pending: false,
            dir_object: dir_type,
        };
        debug!(id, type_name, size = rounded, subscribe, "inserted cache object");
        self.types
            .get_mut(type_name)
            .expect("checked above")
            .insert_record(record);
        Ok(id)
    }

    /// Make room for `rounded` new bytes in a type.
    ///
    /// First reclaims within the type to respect its high watermark, then
    /// reclaims other types' slack when the filesystem is short. Failure
    /// leaves the caller's request unsatisfied and nothing inserted.
    async fn make_room(&mut self, type_name: &str, rounded: u64) -> Result<()> {
        let (hi, used) = {
            let cache = self.types.get(type_name).expect("caller checked");
            (cache.params().hi_watermark, cache.used())
        };
        if rounded > hi {
            return Err(CacheError::Define(format!(
                "object of {} bytes can never fit under hiWatermark {}",
                rounded, hi
            )));
        }

        let over = (used + rounded).saturating_sub(hi);
        if over > 0 {
            let cache = self.types.get_mut(type_name).expect("caller checked");
            cache.reclaim(over).await;
            if cache.used() + rounded > hi {
                return Err(CacheError::Define(
                    "cannot reclaim enough space within the type's hiWatermark".to_string(),
                ));
            }
        }

        let avail = self.disk.available(&self.base)?;
        let shortfall = rounded.saturating_sub(avail);
        if shortfall > 0 {
            let freed = self.global_reclaim(shortfall, type_name).await;
            if freed < shortfall {
                return Err(CacheError::Define(format!(
                    "filesystem has {} bytes free and only {} could be reclaimed",
                    avail, freed
                )));
            }
        }
        Ok(())
    }

    /// Evict from other types' slack above their low watermarks.
    ///
    /// Types are visited in descending order of slack; no type is taken
    /// below its reserve. Returns the bytes freed.
    async fn global_reclaim(&mut self, need: u64, requesting_type: &str) -> u64 {
        let mut victims: Vec<(u64, String)> = self
            .types
            .values()
            .filter(|t| t.name() != requesting_type && t.slack_above_lo() > 0)
            .map(|t| (t.slack_above_lo(), t.name().to_string()))
            .collect();
        victims.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let mut freed = 0u64;
        for (_, name) in victims {
            if freed >= need {
                break;
            }
            let cache = self.types.get_mut(&name).expect("collected above");
            let floor = cache.params().lo_watermark;
            let taken = cache.reclaim_to_floor(need - freed, floor).await;
            if taken > 0 {
                debug!(from = %name, taken, "reclaimed slack for global space");
            }
            freed += taken;
        }
        freed
    }

    // =========================================================================
    // Object operations
    // =========================================================================

    /// Pathname of an indexed object.
    pub fn pathname_of(&self, id: ObjectId) -> Option<PathBuf> {
        self.types
            .values()
            .find(|t| t.contains(id))
            .and_then(|t| t.lookup(id).map(|obj| t.object_pathname(obj)))
    }

    /// Accounted size of an indexed object.
    pub fn object_size(&self, id: ObjectId) -> Option<u64> {
        self.types.values().find_map(|t| t.lookup(id)).map(|o| o.size)
    }

    /// Original filename of an indexed object.
    pub fn object_filename(&self, id: ObjectId) -> Option<String> {
        self.types
            .values()
            .find_map(|t| t.lookup(id))
            .map(|o| o.file_name.clone())
    }

    /// Mark an object as recently used.
    pub fn touch(&mut self, id: ObjectId) -> bool {
        self.types.values_mut().any(|t| t.touch(id))
    }

    /// Resize an object, reclaiming for growth.
    ///
    /// Returns the final size: the requested size on success, the old
    /// size when room could not be made.
    pub async fn resize(&mut self, id: ObjectId, new_size: u64) -> Result<u64> {
        let type_name = self.type_of_object(id);
        if type_name.is_empty() {
            return Err(CacheError::Exists(format!("object {:x} not found", id)));
        }
        if new_size == 0 {
            return Err(CacheError::InvalidParams(
                "newSize must be greater than zero".to_string(),
            ));
        }
        let (old_rounded, dir_object) = {
            let cache = self.types.get(&type_name).expect("type_of_object");
            let obj = cache.lookup(id).expect("type_of_object");
            (obj.size, obj.dir_object)
        };
        if dir_object && new_size <= self.block_size {
            return Err(CacheError::InvalidParams(
                "size must be greater than 1 block when dirType = true".to_string(),
            ));
        }

        let new_rounded = round_to_blocks(new_size, self.block_size);
        if new_rounded == old_rounded {
            // Accounting already matches; only refresh the file length.
            if !dir_object {
                self.set_object_len(&type_name, id, new_size).await?;
            }
            self.types.get_mut(&type_name).expect("checked").touch(id);
            return Ok(new_size);
        }

        if new_rounded > old_rounded {
            let grow = new_rounded - old_rounded;
            if self.grow_room(&type_name, id, grow).await.is_err() {
                return Ok(old_rounded);
            }
        }

        if !dir_object {
            self.set_object_len(&type_name, id, new_size).await?;
        }
        self.types
            .get_mut(&type_name)
            .expect("checked")
            .resize_record(id, new_rounded);
        debug!(id, type_name = %type_name, new_size, "resized cache object");
        Ok(new_size)
    }

    /// Make room for `grow` extra bytes on an existing object.
    async fn grow_room(&mut self, type_name: &str, id: ObjectId, grow: u64) -> Result<()> {
        let (hi, used) = {
            let cache = self.types.get(type_name).expect("caller checked");
            (cache.params().hi_watermark, cache.used())
        };
        let over = (used + grow).saturating_sub(hi);
        if over > 0 {
            let cache = self.types.get_mut(type_name).expect("caller checked");
            cache.reclaim_protecting(over, id).await;
            if cache.used() + grow > hi {
                return Err(CacheError::Resize("cannot grow within hiWatermark".to_string()));
            }
        }
        let avail = self.disk.available(&self.base)?;
        let shortfall = grow.saturating_sub(avail);
        if shortfall > 0 {
            let freed = self.global_reclaim(shortfall, type_name).await;
            if freed < shortfall {
                return Err(CacheError::Resize("insufficient filesystem space".to_string()));
            }
        }
        Ok(())
    }

    async fn set_object_len(&self, type_name: &str, id: ObjectId, len: u64) -> Result<()> {
        let cache = self.types.get(type_name).expect("caller checked");
        let obj = cache.lookup(id).expect("caller checked");
        let path = cache.object_pathname(obj);
        let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
        file.set_len(len).await?;
        Ok(())
    }

    /// Expire an object now, or mark it when pinned.
    pub async fn expire(&mut self, id: ObjectId) -> Result<bool> {
        let type_name = self.type_of_object(id);
        if type_name.is_empty() {
            return Err(CacheError::Exists(format!("object {:x} not found", id)));
        }
        self.types
            .get_mut(&type_name)
            .expect("type_of_object")
            .expire(id)
            .await
    }

    /// Pin an object with a new subscription; returns its pathname.
    pub fn subscribe(&mut self, id: ObjectId) -> Result<PathBuf> {
        let type_name = self.type_of_object(id);
        if type_name.is_empty() {
            return Err(CacheError::Exists(format!("object {:x} not found", id)));
        }
        let cache = self.types.get_mut(&type_name).expect("type_of_object");
        cache.subscribe(id);
        let obj = cache.lookup(id).expect("subscribed");
        Ok(cache.object_pathname(obj))
    }

    /// Release a subscription pin; applies a pending expire when the last
    /// pin clears.
    pub async fn unsubscribe(&mut self, type_name: &str, id: ObjectId) {
        let Some(cache) = self.types.get_mut(type_name) else {
            return;
        };
        if let Some(expire_now) = cache.unsubscribe(id) {
            if expire_now {
                debug!(id, type_name, "applying deferred expire on unpin");
                cache.delete_object(id).await;
            }
        }
    }

    /// Validate one subscribed object against the filesystem.
    ///
    /// Externally deleted files evict the record; size drift beyond the
    /// accounted size is reconciled into the accounting.
    pub async fn check_subscribed_object(&mut self, type_name: &str, id: ObjectId) {
        let Some(cache) = self.types.get_mut(type_name) else {
            return;
        };
        let Some(obj) = cache.lookup(id) else {
            return;
        };
        let path = cache.object_pathname(obj);
        let accounted = obj.size;
        match tokio::fs::metadata(&path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(id, type_name, "subscribed object deleted externally; evicting record");
                cache.remove_record(id);
            }
            Err(e) => warn!(id, type_name, error = %e, "cannot stat subscribed object"),
            Ok(meta) => {
                let on_disk = round_to_blocks(meta.len(), self.block_size);
                if on_disk > accounted {
                    warn!(
                        id,
                        type_name, accounted, on_disk, "subscribed object outgrew its record"
                    );
                    cache.resize_record(id, on_disk);
                }
            }
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Aggregate status across every type.
    pub fn get_cache_status(&self) -> CacheStatus {
        let mut size = 0u64;
        let mut num_objects = 0u64;
        for cache in self.types.values() {
            let status = cache.status();
            size += status.used;
            num_objects += status.count;
        }
        CacheStatus {
            num_types: self.types.len() as u64,
            size,
            num_objects,
            avail_space: self.disk.available(&self.base).unwrap_or(0),
        }
    }

    /// Status of a single type.
    pub fn get_type_status(&self, name: &str) -> Result<TypeStatus> {
        self.types
            .get(name)
            .map(|t| t.status())
            .ok_or_else(|| CacheError::Exists(format!("type '{}' does not exist", name)))
    }

    // =========================================================================
    // Cleanup and startup
    // =========================================================================

    /// Reconcile the index with the on-disk tree.
    ///
    /// Files under a type directory with no index entry are removed once
    /// older than the grace window; index entries whose file is gone are
    /// dropped. Filesystem errors are logged and skipped.
    pub async fn cleanup_orphans(&mut self) {
        let type_names = self.get_types();
        for name in type_names {
            if let Err(e) = self.cleanup_type_orphans(&name).await {
                warn!(type_name = %name, error = %e, "orphan cleanup pass failed");
            }
        }
    }

    async fn cleanup_type_orphans(&mut self, type_name: &str) -> std::io::Result<()> {
        let Some(cache) = self.types.get(type_name) else {
            return Ok(());
        };
        let type_dir = cache.type_dir();

        // Pass 1: on-disk entries nobody indexed.
        let mut stray: Vec<PathBuf> = Vec::new();
        let mut shards = match tokio::fs::read_dir(&type_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                stray.push(shard.path());
                continue;
            }
            let mut leaves = tokio::fs::read_dir(shard.path()).await?;
            while let Some(leaf) = leaves.next_entry().await? {
                let path = leaf.path();
                let indexed = super::pathname::object_id_from_path(&path)
                    .map(|id| cache.contains(id))
                    .unwrap_or(false);
                if indexed {
                    continue;
                }
                let age = leaf
                    .metadata()
                    .await
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|m| m.elapsed().ok());
                if age.map(|a| a >= self.orphan_grace).unwrap_or(false) {
                    stray.push(path);
                }
            }
        }
        for path in stray {
            info!(path = %path.display(), "removing orphaned cache entry");
            let result = if tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            if let Err(e) = result {
                warn!(path = %path.display(), error = %e, "failed to remove orphan");
            }
        }

        // Pass 2: index entries whose artifact is gone.
        let cache = self.types.get(type_name).expect("still present");
        let mut lost: Vec<ObjectId> = Vec::new();
        for obj in cache.objects() {
            let path = cache.object_pathname(obj);
            if let Err(e) = tokio::fs::symlink_metadata(&path).await {
                if e.kind() == std::io::ErrorKind::NotFound {
                    lost.push(obj.id);
                }
            }
        }
        let cache = self.types.get_mut(type_name).expect("still present");
        for id in lost {
            info!(id, type_name, "dropping index entry with no backing file");
            cache.remove_record(id);
        }
        Ok(())
    }

    /// Prune empty shard directories of dir-type caches.
    pub async fn cleanup_dir_types(&mut self) {
        for cache in self.types.values().filter(|t| t.is_dir_type()) {
            let type_dir = cache.type_dir();
            let Ok(mut shards) = tokio::fs::read_dir(&type_dir).await else {
                continue;
            };
            while let Ok(Some(shard)) = shards.next_entry().await {
                let path = shard.path();
                let empty = match tokio::fs::read_dir(&path).await {
                    Ok(mut rd) => matches!(rd.next_entry().await, Ok(None)),
                    Err(_) => false,
                };
                if empty {
                    debug!(path = %path.display(), "pruning empty dir-type shard");
                    let _ = tokio::fs::remove_dir(&path).await;
                }
            }
        }
    }

    /// Rebuild the index from the on-disk tree for every defined type.
    ///
    /// Restored records take their size from the filesystem and their
    /// access time from the file's mtime; the ID counter advances past the
    /// highest ID seen so new inserts never collide.
    pub async fn walk_dir_tree(&mut self) -> Result<()> {
        let type_names = self.get_types();
        for name in type_names {
            let (type_dir, defaults, dir_type) = {
                let cache = self.types.get(&name).expect("listed above");
                (cache.type_dir(), *cache.params(), cache.is_dir_type())
            };
            let mut events = walk_type_dir(&type_dir).await?;
            while let Some(walked) = events.next().await {
                let walked = walked?;
                let cache = self.types.get_mut(&name).expect("listed above");
                if cache.contains(walked.id) {
                    continue;
                }
                let disk_size = if walked.is_dir {
                    directory_size(&walked.path).await.unwrap_or(walked.disk_size)
                } else {
                    walked.disk_size
                };
                let record = CacheObject {
                    id: walked.id,
                    file_name: walked.leaf_name.clone(),
                    size: round_to_blocks(disk_size, self.block_size),
                    cost: defaults.default_cost,
                    lifetime: defaults.default_lifetime,
                    inserted_at: walked.modified_at,
                    accessed_at: walked.modified_at,
                    subscribers: 0,
                    writing: false,
                    expire_pending: false,
                    dir_object: dir_type,
                };
                self.next_id = self.next_id.max(walked.id + 1);
                cache.insert_record(record);
            }
            let status = self.types.get(&name).expect("listed above").status();
            info!(
                type_name = %name,
                objects = status.count,
                used = status.used,
                "restored type from disk"
            );
        }
        Ok(())
    }

    /// Remove leftovers that no defined type accounts for.
    ///
    /// Run once after the startup walk: directories for unknown types and
    /// undecodable artifacts inside known types are deleted immediately.
    pub async fn cleanup_at_startup(&mut self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.base).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if !entry.file_type().await?.is_dir() {
                info!(path = %path.display(), "removing stray file at cache root");
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            if !self.types.contains_key(&name) {
                info!(path = %path.display(), "removing directory of unknown type");
                let _ = tokio::fs::remove_dir_all(&path).await;
            }
        }

        // Inside known types, drop anything the walk could not decode.
        for cache in self.types.values() {
            let type_dir = cache.type_dir();
            let Ok(mut shards) = tokio::fs::read_dir(&type_dir).await else {
                continue;
            };
            while let Ok(Some(shard)) = shards.next_entry().await {
                let shard_path = shard.path();
                if !shard.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    let _ = tokio::fs::remove_file(&shard_path).await;
                    continue;
                }
                let Ok(mut leaves) = tokio::fs::read_dir(&shard_path).await else {
                    continue;
                };
                while let Ok(Some(leaf)) = leaves.next_entry().await {
                    let path = leaf.path();
                    if super::pathname::decode_pathname(&self.base, &path).is_ok() {
                        // Decodable but unindexed entries are left to the
                        // orphan cleaner and its grace window.
                        continue;
                    }
                    info!(path = %path.display(), "removing partial artifact at startup");
                    let is_dir = leaf.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                    let _ = if is_dir {
                        tokio::fs::remove_dir_all(&path).await
                    } else {
                        tokio::fs::remove_file(&path).await
                    };
                }
            }
        }
        Ok(())
    }
}

/// Recursive size of a directory's contents in bytes.
async fn directory_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0u64;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::FixedDiskStats;
    use tempfile::TempDir;

    const CAPACITY: u64 = 1_000_000;

    async fn cache_set(tmp: &TempDir, avail: u64) -> CacheSet {
        CacheSet::new(
            tmp.path().join("cache"),
            Arc::new(FixedDiskStats::new(avail, CAPACITY)),
            CacheSetOptions {
                block_size: Some(1),
                orphan_grace: Duration::from_secs(0),
                enforce_reserve: true,
            },
        )
        .await
        .unwrap()
    }

    fn photo_params() -> CacheParams {
        CacheParams::new(1_000_000 / 2, 1_000_000)
            .with_default_size(100_000)
            .with_default_cost(50)
    }

    #[tokio::test]
    async fn test_insert_and_expire_round_trip() {
        let tmp = TempDir::new().unwrap();
        let mut set = cache_set(&tmp, CAPACITY).await;
        set.define_type("photos", CacheParams::new(1_000_000 / 10, 1_000_000 / 2), false)
            .await
            .unwrap();

        let id = set
            .insert("photos", "a.jpg", 200_000, 50, 0, false)
            .await
            .unwrap();
        let path = set.pathname_of(id).unwrap();
        assert!(tokio::fs::metadata(&path).await.unwrap().is_file());

        let status = set.get_type_status("photos").unwrap();
        assert_eq!(status.used, 200_000);
        assert_eq!(status.count, 1);
        assert_eq!(set.object_filename(id).as_deref(), Some("a.jpg"));
        assert_eq!(set.object_size(id), Some(200_000));

        assert!(set.expire(id).await.unwrap());
        let status = set.get_type_status("photos").unwrap();
        assert_eq!((status.used, status.count), (0, 0));
        assert!(tokio::fs::metadata(&path).await.is_err());
        assert!(matches!(set.expire(id).await, Err(CacheError::Exists(_))));
    }

    #[tokio::test]
    async fn test_define_duplicate_same_params_is_exists() {
        let tmp = TempDir::new().unwrap();
        let mut set = cache_set(&tmp, CAPACITY).await;
        set.define_type("t", photo_params(), false).await.unwrap();
        assert!(matches!(
            set.define_type("t", photo_params(), false).await,
            Err(CacheError::Exists(_))
        ));
    }

    #[tokio::test]
    async fn test_define_duplicate_different_params_is_configuration() {
        let tmp = TempDir::new().unwrap();
        let mut set = cache_set(&tmp, CAPACITY).await;
        set.define_type("t", photo_params(), false).await.unwrap();
        assert!(matches!(
            set.define_type("t", CacheParams::new(1, 2), false).await,
            Err(CacheError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_reserve_policy_rejects_overcommit() {
        let tmp = TempDir::new().unwrap();
        let mut set = cache_set(&tmp, CAPACITY).await;
        set.define_type("a", CacheParams::new(CAPACITY - 1_000, CAPACITY), false)
            .await
            .unwrap();
        let err = set
            .define_type("b", CacheParams::new(2_000, 10_000), false)
            .await;
        assert!(matches!(err, Err(CacheError::Define(_))));
    }

    #[tokio::test]
    async fn test_eviction_sequence_cost_then_age() {
        let tmp = TempDir::new().unwrap();
        let mut set = cache_set(&tmp, CAPACITY).await;
        set.define_type("t", CacheParams::new(1_000, 3_000), false)
            .await
            .unwrap();

        // A, B, C inserted oldest-first with costs 10, 50, 10.
        let a = set.insert("t", "a.dat", 1_000, 10, 0, false).await.unwrap();
        let b = set.insert("t", "b.dat", 1_000, 50, 0, false).await.unwrap();
        let c = set.insert("t", "c.dat", 1_000, 10, 0, false).await.unwrap();

        // D forces one eviction: A has the lowest cost and oldest access.
        let _d = set.insert("t", "d.dat", 1_000, 50, 0, false).await.unwrap();
        assert!(set.object_size(a).is_none());
        assert!(set.object_size(b).is_some());
        assert!(set.object_size(c).is_some());

        // E forces another: C beats B on cost.
        let _e = set.insert("t", "e.dat", 1_000, 50, 0, false).await.unwrap();
        assert!(set.object_size(c).is_none());
        assert!(set.object_size(b).is_some());
    }

    #[tokio::test]
    async fn test_subscription_blocks_expire_until_unpin() {
        let tmp = TempDir::new().unwrap();
        let mut set = cache_set(&tmp, CAPACITY).await;
        set.define_type("t", CacheParams::new(1_000, 3_000), false)
            .await
            .unwrap();
        let x = set.insert("t", "x.dat", 500, 50, 0, false).await.unwrap();

        set.subscribe(x).unwrap();
        assert!(!set.expire(x).await.unwrap());
        assert_eq!(set.object_size(x), Some(500));

        set.unsubscribe("t", x).await;
        assert!(set.object_size(x).is_none());
        assert!(matches!(set.expire(x).await, Err(CacheError::Exists(_))));
    }

    #[tokio::test]
    async fn test_writing_insert_pins_until_unsubscribe() {
        let tmp = TempDir::new().unwrap();
        let mut set = cache_set(&tmp, CAPACITY).await;
        set.define_type("t", CacheParams::new(1_000, 3_000), false)
            .await
            .unwrap();
        let id = set.insert("t", "w.dat", 2_000, 0, 0, true).await.unwrap();

        // The writer's pin defeats eviction even for a cost-0 object.
        let err = set.insert("t", "big.dat", 2_000, 50, 0, false).await;
        assert!(matches!(err, Err(CacheError::Define(_))));

        set.unsubscribe("t", id).await;
        let ok = set.insert("t", "big.dat", 2_000, 50, 0, false).await;
        assert!(ok.is_ok());
        assert!(set.object_size(id).is_none());
    }

    #[tokio::test]
    async fn test_dir_type_insert_rules() {
        let tmp = TempDir::new().unwrap();
        let mut set = CacheSet::new(
            tmp.path().join("cache"),
            Arc::new(FixedDiskStats::new(CAPACITY, CAPACITY)),
            CacheSetOptions {
                block_size: Some(4_096),
                orphan_grace: Duration::from_secs(0),
                enforce_reserve: true,
            },
        )
        .await
        .unwrap();
        set.define_type("d", CacheParams::new(100_000, 500_000), true)
            .await
            .unwrap();

        // One block is not enough for a dir object.
        let err = set.insert("d", "bundle", 4_096, 0, 0, false).await;
        assert!(matches!(err, Err(CacheError::InvalidParams(_))));

        let id = set.insert("d", "bundle", 8_192, 0, 0, false).await.unwrap();
        let path = set.pathname_of(id).unwrap();
        assert!(tokio::fs::metadata(&path).await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_zero_size_rejected_for_file_type() {
        let tmp = TempDir::new().unwrap();
        let mut set = cache_set(&tmp, CAPACITY).await;
        set.define_type("t", CacheParams::new(1_000, 3_000), false)
            .await
            .unwrap();
        assert!(matches!(
            set.insert("t", "z.dat", 0, 0, 0, false).await,
            Err(CacheError::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn test_global_reclaim_takes_only_slack() {
        let tmp = TempDir::new().unwrap();
        // Free space fixed at 1_000: inserting 1_500 is 500 short.
        let mut set = cache_set(&tmp, 1_000).await;
        set.define_type("t", CacheParams::new(1_000, 3_000), false)
            .await
            .unwrap();
        for n in 0..3 {
            set.insert("t", &format!("{}.dat", n), 1_000, 50, 0, false)
                .await
                .unwrap();
        }
        set.define_type("u", CacheParams::new(1_000, 2_000), false)
            .await
            .unwrap();

        set.insert("u", "new.dat", 1_500, 50, 0, false).await.unwrap();
        // One whole object was evicted from t's slack.
        assert_eq!(set.get_type_status("t").unwrap().used, 2_000);
        assert_eq!(set.get_type_status("u").unwrap().used, 1_500);
    }

    #[tokio::test]
    async fn test_global_reclaim_never_breaks_reserve() {
        let tmp = TempDir::new().unwrap();
        let mut set = cache_set(&tmp, 1_000).await;
        set.define_type("t", CacheParams::new(1_000, 3_000), false)
            .await
            .unwrap();
        // t sits exactly at its reserve: no slack to give.
        set.insert("t", "only.dat", 1_000, 50, 0, false).await.unwrap();
        set.define_type("u", CacheParams::new(1_000, 2_000), false)
            .await
            .unwrap();

        let err = set.insert("u", "new.dat", 1_500, 50, 0, false).await;
        assert!(matches!(err, Err(CacheError::Define(_))));
        assert_eq!(set.get_type_status("t").unwrap().used, 1_000);
    }

    #[tokio::test]
    async fn test_resize_grow_shrink_and_noop() {
        let tmp = TempDir::new().unwrap();
        let mut set = cache_set(&tmp, CAPACITY).await;
        set.define_type("t", CacheParams::new(1_000, 3_000), false)
            .await
            .unwrap();
        let id = set.insert("t", "r.dat", 1_000, 50, 0, false).await.unwrap();

        assert_eq!(set.resize(id, 1_000).await.unwrap(), 1_000);
        assert_eq!(set.resize(id, 2_500).await.unwrap(), 2_500);
        assert_eq!(set.object_size(id), Some(2_500));
        let path = set.pathname_of(id).unwrap();
        assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), 2_500);

        assert_eq!(set.resize(id, 500).await.unwrap(), 500);
        assert_eq!(set.get_type_status("t").unwrap().used, 500);
    }

    #[tokio::test]
    async fn test_resize_failure_returns_old_size() {
        let tmp = TempDir::new().unwrap();
        let mut set = cache_set(&tmp, CAPACITY).await;
        set.define_type("t", CacheParams::new(1_000, 3_000), false)
            .await
            .unwrap();
        let pinned = set.insert("t", "p.dat", 2_000, 0, 0, true).await.unwrap();
        let id = set.insert("t", "r.dat", 1_000, 50, 0, false).await.unwrap();

        // Growing to 2_000 needs 1_000 more than hi allows while p is pinned.
        assert_eq!(set.resize(id, 2_000).await.unwrap(), 1_000);
        assert_eq!(set.object_size(id), Some(1_000));
        let _ = pinned;
    }

    #[tokio::test]
    async fn test_delete_type_requires_empty() {
        let tmp = TempDir::new().unwrap();
        let mut set = cache_set(&tmp, CAPACITY).await;
        set.define_type("t", CacheParams::new(1_000, 3_000), false)
            .await
            .unwrap();
        let id = set.insert("t", "x.dat", 100, 50, 0, false).await.unwrap();

        assert!(matches!(set.delete_type("t").await, Err(CacheError::Delete(_))));
        set.expire(id).await.unwrap();
        assert_eq!(set.delete_type("t").await.unwrap(), 0);
        assert!(!set.type_exists("t"));
        assert!(matches!(set.delete_type("t").await, Err(CacheError::Delete(_))));
    }

    #[tokio::test]
    async fn test_orphan_cleanup_reconciles_both_ways() {
        let tmp = TempDir::new().unwrap();
        let mut set = cache_set(&tmp, CAPACITY).await;
        set.define_type("t", CacheParams::new(1_000, 100_000), false)
            .await
            .unwrap();
        let kept = set.insert("t", "kept.dat", 100, 50, 0, false).await.unwrap();
        let lost = set.insert("t", "lost.dat", 100, 50, 0, false).await.unwrap();

        // A stray file nobody indexed, and an externally deleted object.
        let stray = set.base_dir().join("t").join("99").join("deadbeef.tmp");
        tokio::fs::create_dir_all(stray.parent().unwrap()).await.unwrap();
        tokio::fs::write(&stray, b"junk").await.unwrap();
        tokio::fs::remove_file(set.pathname_of(lost).unwrap()).await.unwrap();

        set.cleanup_orphans().await;

        assert!(tokio::fs::metadata(&stray).await.is_err());
        assert!(set.object_size(lost).is_none());
        assert_eq!(set.object_size(kept), Some(100));
        assert_eq!(set.get_type_status("t").unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_walk_restores_index_and_id_counter() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("cache");
        let (ids, status_before) = {
            let mut set = CacheSet::new(
                &base,
                Arc::new(FixedDiskStats::new(CAPACITY, CAPACITY)),
                CacheSetOptions {
                    block_size: Some(1),
                    orphan_grace: Duration::from_secs(0),
                    enforce_reserve: true,
                },
            )
            .await
            .unwrap();
            set.define_type("t", CacheParams::new(1_000, 100_000), false)
                .await
                .unwrap();
            let mut ids = Vec::new();
            for (n, size) in [(1, 300u64), (2, 400), (3, 500)] {
                let id = set
                    .insert("t", &format!("f{}.bin", n), size, 50, 0, false)
                    .await
                    .unwrap();
                // Give the files real contents so restored sizes match.
                tokio::fs::write(set.pathname_of(id).unwrap(), vec![0u8; size as usize])
                    .await
                    .unwrap();
                ids.push(id);
            }
            (ids, set.get_cache_status())
        };

        // Restart: fresh set, types re-supplied, index rebuilt from disk.
        let mut set = CacheSet::new(
            &base,
            Arc::new(FixedDiskStats::new(CAPACITY, CAPACITY)),
            CacheSetOptions {
                block_size: Some(1),
                orphan_grace: Duration::from_secs(0),
                enforce_reserve: true,
            },
        )
        .await
        .unwrap();
        set.define_type("t", CacheParams::new(1_000, 100_000), false)
            .await
            .unwrap();
        set.walk_dir_tree().await.unwrap();

        let status = set.get_cache_status();
        assert_eq!(status.num_objects, status_before.num_objects);
        assert_eq!(status.size, status_before.size);
        for id in &ids {
            assert!(set.object_size(*id).is_some());
        }

        // Walking twice is a fixed point.
        set.walk_dir_tree().await.unwrap();
        assert_eq!(set.get_cache_status().num_objects, status_before.num_objects);

        // New IDs start past everything restored.
        let new_id = set.insert("t", "new.bin", 100, 50, 0, false).await.unwrap();
        assert!(new_id > *ids.iter().max().unwrap());
    }

    #[tokio::test]
    async fn test_startup_cleanup_drops_unknown_types() {
        let tmp = TempDir::new().unwrap();
        let mut set = cache_set(&tmp, CAPACITY).await;
        set.define_type("known", CacheParams::new(1_000, 100_000), false)
            .await
            .unwrap();

        let ghost = set.base_dir().join("ghost");
        tokio::fs::create_dir_all(ghost.join("00")).await.unwrap();
        tokio::fs::write(ghost.join("00").join("1.dat"), b"x").await.unwrap();
        let stray = set.base_dir().join("stray.txt");
        tokio::fs::write(&stray, b"x").await.unwrap();

        set.cleanup_at_startup().await.unwrap();
        assert!(tokio::fs::metadata(&ghost).await.is_err());
        assert!(tokio::fs::metadata(&stray).await.is_err());
        assert!(tokio::fs::metadata(set.base_dir().join("known")).await.is_ok());
    }

    #[tokio::test]
    async fn test_check_subscribed_object_evicts_missing() {
        let tmp = TempDir::new().unwrap();
        let mut set = cache_set(&tmp, CAPACITY).await;
        set.define_type("t", CacheParams::new(1_000, 100_000), false)
            .await
            .unwrap();
        let id = set.insert("t", "s.dat", 100, 50, 0, true).await.unwrap();

        tokio::fs::remove_file(set.pathname_of(id).unwrap()).await.unwrap();
        set.check_subscribed_object("t", id).await;
        assert!(set.object_size(id).is_none());
    }

    #[tokio::test]
    async fn test_change_type_respects_reserve_policy() {
        let tmp = TempDir::new().unwrap();
        let mut set = cache_set(&tmp, CAPACITY).await;
        set.define_type("a", CacheParams::new(CAPACITY / 2, CAPACITY), false)
            .await
            .unwrap();
        set.define_type("b", CacheParams::new(CAPACITY / 4, CAPACITY / 2), false)
            .await
            .unwrap();

        // Raising b's reserve past what remains must fail.
        let err = set
            .change_type("b", CacheParams::new(CAPACITY, CAPACITY + 1))
            .await;
        assert!(matches!(err, Err(CacheError::Change(_))));

        set.change_type("b", CacheParams::new(CAPACITY / 8, CAPACITY / 2))
            .await
            .unwrap();
        assert_eq!(
            set.describe_type("b").unwrap().lo_watermark,
            CAPACITY / 8
        );
    }
}
