//! The metadata record for one cached object.

use chrono::{DateTime, Utc};

use super::ObjectId;

/// Metadata for a single cached file or directory.
///
/// Mutation happens only inside the owning [`TypeCache`](super::TypeCache)
/// so the type's aggregate accounting stays consistent with the records.
#[derive(Debug, Clone)]
pub struct CacheObject {
    /// Server-assigned identifier, unique for the life of the process.
    pub id: ObjectId,
    /// Original basename supplied by the client, extension preserved.
    pub file_name: String,
    /// Accounted size in bytes, rounded up to the accounting block size.
    pub size: u64,
    /// Eviction cost, 0-100. Lower costs evict first.
    pub cost: u8,
    /// Lifetime in seconds; 0 means the object never ages out.
    pub lifetime: u64,
    /// When the object was inserted.
    pub inserted_at: DateTime<Utc>,
    /// When the object was last touched or inserted.
    pub accessed_at: DateTime<Utc>,
    /// Live subscriptions pinning the object.
    pub subscribers: u32,
    /// True while the object's size is not yet final.
    pub writing: bool,
    /// Expire was requested while the object was pinned.
    pub expire_pending: bool,
    /// The object is a directory rather than a regular file.
    pub dir_object: bool,
}

impl CacheObject {
    /// A pinned object cannot be evicted or reclaimed.
    pub fn is_pinned(&self) -> bool {
        self.subscribers > 0 || self.writing
    }

    /// Whether the object has outlived its lifetime as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.lifetime == 0 {
            return false;
        }
        let age = now.signed_duration_since(self.inserted_at);
        age.num_seconds() >= 0 && age.num_seconds() as u64 > self.lifetime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn object(lifetime: u64) -> CacheObject {
        let now = Utc::now();
        CacheObject {
            id: 1,
            file_name: "a.jpg".to_string(),
            size: 100,
            cost: 50,
            lifetime,
            inserted_at: now,
            accessed_at: now,
            subscribers: 0,
            writing: false,
            expire_pending: false,
            dir_object: false,
        }
    }

    #[test]
    fn test_pinned() {
        let mut obj = object(0);
        assert!(!obj.is_pinned());
        obj.subscribers = 1;
        assert!(obj.is_pinned());
        obj.subscribers = 0;
        obj.writing = true;
        assert!(obj.is_pinned());
    }

    #[test]
    fn test_zero_lifetime_never_expires() {
        let obj = object(0);
        assert!(!obj.is_expired(obj.inserted_at + Duration::days(365 * 10)));
    }

    #[test]
    fn test_expiry_boundary() {
        let obj = object(60);
        assert!(!obj.is_expired(obj.inserted_at + Duration::seconds(60)));
        assert!(obj.is_expired(obj.inserted_at + Duration::seconds(61)));
    }
}
