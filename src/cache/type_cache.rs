//! A single cache type: its parameters, its objects and their accounting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use super::object::CacheObject;
use super::pathname::build_pathname;
use super::{CacheError, CacheParams, ObjectId, Result};

/// Aggregate usage of a cache type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeStatus {
    /// Sum of the accounted sizes of all objects.
    pub used: u64,
    /// Number of indexed objects.
    pub count: u64,
}

/// All objects of one cache type plus the type's parameters.
///
/// The owning [`CacheSet`](super::CacheSet) routes operations here by type
/// name; the type cache keeps `used` equal to the sum of its records'
/// sizes across every mutation.
pub struct TypeCache {
    name: String,
    base: PathBuf,
    params: CacheParams,
    dir_type: bool,
    objects: HashMap<ObjectId, CacheObject>,
    used: u64,
}

impl TypeCache {
    /// Create an empty type cache rooted under `base`.
    pub fn new(name: impl Into<String>, base: &Path, params: CacheParams, dir_type: bool) -> Self {
        Self {
            name: name.into(),
            base: base.to_path_buf(),
            params,
            dir_type,
            objects: HashMap::new(),
            used: 0,
        }
    }

    /// The type's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The type's current parameters.
    pub fn params(&self) -> &CacheParams {
        &self.params
    }

    /// Whether objects of this type are directories.
    pub fn is_dir_type(&self) -> bool {
        self.dir_type
    }

    /// Bytes currently accounted to this type.
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Bytes of usage above the type's guaranteed reserve.
    ///
    /// This is what global reclamation may take back from the type.
    pub fn slack_above_lo(&self) -> u64 {
        self.used.saturating_sub(self.params.lo_watermark)
    }

    /// Usage and object count.
    pub fn status(&self) -> TypeStatus {
        TypeStatus {
            used: self.used,
            count: self.objects.len() as u64,
        }
    }

    /// The directory holding this type's objects.
    pub fn type_dir(&self) -> PathBuf {
        self.base.join(&self.name)
    }

    /// The on-disk pathname of one of this type's objects.
    pub fn object_pathname(&self, obj: &CacheObject) -> PathBuf {
        build_pathname(&self.base, &self.name, obj.id, &obj.file_name)
    }

    /// Look up an object by ID.
    pub fn lookup(&self, id: ObjectId) -> Option<&CacheObject> {
        self.objects.get(&id)
    }

    /// Whether the type holds an object with the given ID.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Iterate over all objects of the type.
    pub fn objects(&self) -> impl Iterator<Item = &CacheObject> {
        self.objects.values()
    }

    // =========================================================================
    // Record mutation
    // =========================================================================

    /// Add a fully-formed record to the index.
    ///
    /// The caller has already made room and created the on-disk artifact.
    pub fn insert_record(&mut self, obj: CacheObject) {
        self.used += obj.size;
        self.objects.insert(obj.id, obj);
    }

    /// Drop a record from the index without touching the filesystem.
    ///
    /// Returns the bytes the record accounted for.
    pub fn remove_record(&mut self, id: ObjectId) -> Option<u64> {
        self.objects.remove(&id).map(|obj| {
            self.used -= obj.size;
            obj.size
        })
    }

    /// Mark an object as recently used. Returns false if it is not indexed.
    pub fn touch(&mut self, id: ObjectId) -> bool {
        match self.objects.get_mut(&id) {
            Some(obj) => {
                obj.accessed_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Add a subscriber pin to an object. Returns false if it is not indexed.
    pub fn subscribe(&mut self, id: ObjectId) -> bool {
        match self.objects.get_mut(&id) {
            Some(obj) => {
                obj.subscribers += 1;
                true
            }
            None => false,
        }
    }

    /// Release a subscriber pin.
    ///
    /// Dropping the last subscription also ends the writing phase. Returns
    /// the object's pending-expire flag once fully unpinned, so the caller
    /// can remove it immediately.
    pub fn unsubscribe(&mut self, id: ObjectId) -> Option<bool> {
        let obj = self.objects.get_mut(&id)?;
        obj.subscribers = obj.subscribers.saturating_sub(1);
        if obj.subscribers == 0 {
            obj.writing = false;
            return Some(obj.expire_pending);
        }
        Some(false)
    }

    // =========================================================================
    // Expire
    // =========================================================================

    /// Expire an object.
    ///
    /// A pinned object is only marked; it is removed when the last pin
    /// clears. Returns true when the object was removed now.
    pub async fn expire(&mut self, id: ObjectId) -> Result<bool> {
        let obj = self
            .objects
            .get_mut(&id)
            .ok_or_else(|| CacheError::Exists(format!("object {:x} not found", id)))?;
        if obj.is_pinned() {
            obj.expire_pending = true;
            debug!(id, type_name = %self.name, "expire deferred, object pinned");
            return Ok(false);
        }
        self.delete_object(id).await;
        Ok(true)
    }

    /// Remove an object's on-disk artifact and its record.
    ///
    /// Filesystem drift (the artifact already gone, or undeletable) is
    /// logged and reconciled by the orphan cleaner; the index entry is
    /// dropped either way. Returns the freed bytes.
    pub async fn delete_object(&mut self, id: ObjectId) -> u64 {
        let Some(obj) = self.objects.get(&id) else {
            return 0;
        };
        let path = self.object_pathname(obj);
        let result = if obj.dir_object {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to delete cached object");
            }
        }
        self.remove_record(id).unwrap_or(0)
    }

    // =========================================================================
    // Reclamation
    // =========================================================================

    /// IDs of evictable objects, in eviction order.
    ///
    /// Order: objects past their lifetime first, then ascending cost, then
    /// least recently accessed, then ascending ID. Pinned and
    /// expire-pending records are never candidates.
    fn eviction_candidates(&self, protect: Option<ObjectId>) -> Vec<ObjectId> {
        let now = Utc::now();
        let mut candidates: Vec<&CacheObject> = self
            .objects
            .values()
            .filter(|obj| !obj.is_pinned() && !obj.expire_pending && Some(obj.id) != protect)
            .collect();
        candidates.sort_by_key(|obj| (!obj.is_expired(now), obj.cost, obj.accessed_at, obj.id));
        candidates.into_iter().map(|obj| obj.id).collect()
    }

    async fn reclaim_inner(&mut self, need: u64, floor: u64, protect: Option<ObjectId>) -> u64 {
        let mut freed = 0u64;
        for id in self.eviction_candidates(protect) {
            if freed >= need || self.used <= floor {
                break;
            }
            let size = self.lookup(id).map(|o| o.size).unwrap_or(0);
            if self.used.saturating_sub(size) < floor {
                continue;
            }
            let released = self.delete_object(id).await;
            debug!(id, type_name = %self.name, released, "evicted object");
            freed += released;
        }
        freed
    }

    /// Evict objects until `need` bytes are freed or no candidates remain.
    ///
    /// Returns the bytes actually freed.
    pub async fn reclaim(&mut self, need: u64) -> u64 {
        self.reclaim_inner(need, 0, None).await
    }

    /// Evict without ever considering `protect` as a victim.
    ///
    /// Used when growing an existing object, which must not evict itself.
    pub async fn reclaim_protecting(&mut self, need: u64, protect: ObjectId) -> u64 {
        self.reclaim_inner(need, 0, Some(protect)).await
    }

    /// Evict, but never take the type's usage below `floor`.
    ///
    /// Used by global reclamation, which may only take the slack above a
    /// type's low watermark.
    pub async fn reclaim_to_floor(&mut self, need: u64, floor: u64) -> u64 {
        self.reclaim_inner(need, floor, None).await
    }

    // =========================================================================
    // Resize
    // =========================================================================

    /// Update a record's accounted size after a successful resize.
    pub fn resize_record(&mut self, id: ObjectId, new_size: u64) -> bool {
        match self.objects.get_mut(&id) {
            Some(obj) => {
                self.used = self.used - obj.size + new_size;
                obj.size = new_size;
                obj.accessed_at = Utc::now();
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Parameter changes
    // =========================================================================

    /// Apply new parameters.
    ///
    /// Shrinking `hi_watermark` below current usage first reclaims down to
    /// the new cap; if pinned objects keep usage above it, the change is
    /// rejected.
    pub async fn change(&mut self, params: CacheParams) -> Result<()> {
        params.validate()?;
        if params.hi_watermark < self.used {
            let need = self.used - params.hi_watermark;
            self.reclaim(need).await;
            if self.used > params.hi_watermark {
                return Err(CacheError::Change(format!(
                    "cannot lower hiWatermark below {} bytes of unreclaimable usage",
                    self.used
                )));
            }
        }
        self.params = params;
        Ok(())
    }

    /// Forget every record. Only valid while the type is empty of pins;
    /// the caller removes the on-disk tree.
    pub(crate) fn clear(&mut self) {
        self.objects.clear();
        self.used = 0;
    }
}
