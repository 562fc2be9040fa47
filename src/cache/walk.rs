//! Startup directory walk.
//!
//! Rebuilds object records from the on-disk tree of one cache type. The
//! walk yields events as a stream; the cache set consumes them to restore
//! its index after a restart.

use std::path::{Path, PathBuf};
use std::pin::Pin;

use chrono::{DateTime, Utc};
use futures::stream;
use tracing::debug;

use super::pathname::{object_id_from_path, shard_for};
use super::{ObjectId, Result};

/// An object reconstructed from the on-disk tree.
#[derive(Debug, Clone)]
pub struct WalkedObject {
    pub id: ObjectId,
    /// Leaf name on disk; the hex ID plus the preserved extension.
    pub leaf_name: String,
    /// Size in bytes as reported by the filesystem, not yet rounded.
    pub disk_size: u64,
    /// Last modification time, used as the restored access time.
    pub modified_at: DateTime<Utc>,
    pub is_dir: bool,
    pub path: PathBuf,
}

/// Async iterator over walked objects.
pub type WalkEvents = Pin<Box<dyn futures::Stream<Item = Result<WalkedObject>> + Send>>;

/// Walk one type directory, yielding every decodable object under it.
///
/// Entries that do not decode to an object ID (stray files, wrong shard)
/// are skipped here; startup cleanup removes them. A missing type
/// directory yields an empty stream.
pub async fn walk_type_dir(type_dir: &Path) -> Result<WalkEvents> {
    let mut found: Vec<WalkedObject> = Vec::new();

    let mut shards = match tokio::fs::read_dir(type_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Box::pin(stream::empty()));
        }
        Err(e) => return Err(e.into()),
    };

    while let Some(shard_entry) = shards.next_entry().await? {
        let shard_path = shard_entry.path();
        if !shard_entry.file_type().await?.is_dir() {
            continue;
        }
        let mut leaves = tokio::fs::read_dir(&shard_path).await?;
        while let Some(leaf) = leaves.next_entry().await? {
            let path = leaf.path();
            let Ok(id) = object_id_from_path(&path) else {
                debug!(path = %path.display(), "skipping undecodable cache entry");
                continue;
            };
            let shard_name = shard_path.file_name().and_then(|s| s.to_str());
            if shard_name != Some(shard_for(id).as_str()) {
                debug!(path = %path.display(), "skipping entry in foreign shard");
                continue;
            }
            let metadata = leaf.metadata().await?;
            let modified_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            found.push(WalkedObject {
                id,
                leaf_name: leaf.file_name().to_string_lossy().into_owned(),
                disk_size: metadata.len(),
                modified_at,
                is_dir: metadata.is_dir(),
                path,
            });
        }
    }

    // Stable order keeps the rebuilt index deterministic.
    found.sort_by_key(|obj| obj.id);
    Ok(Box::pin(stream::iter(found.into_iter().map(Ok))))
}
