//! Subscription bookkeeping.
//!
//! Each live subscription is a handle pinning one cached object on behalf
//! of one client. The host's request layer calls back with the handle ID
//! when a client disconnects; the service then releases the pin. Handles
//! reference objects by ID only and never keep an evicted record alive.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::cache::ObjectId;

/// Identifier handed to the host's cancellation service.
pub type SubscriptionId = u64;

/// One client's live pin on a cached object.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub object_id: ObjectId,
    /// Pathname the client subscribed with; re-decoded on release so a
    /// type deleted in between cannot misroute the unpin.
    pub path: PathBuf,
    pub client: String,
}

/// All live subscriptions, addressable by handle ID.
#[derive(Default)]
pub struct SubscriptionTable {
    next: SubscriptionId,
    subscriptions: HashMap<SubscriptionId, Subscription>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscription and return its handle ID.
    pub fn add(&mut self, object_id: ObjectId, path: PathBuf, client: &str) -> SubscriptionId {
        self.next += 1;
        let id = self.next;
        self.subscriptions.insert(
            id,
            Subscription {
                id,
                object_id,
                path,
                client: client.to_string(),
            },
        );
        id
    }

    /// Remove a subscription, returning it for the caller to release.
    pub fn remove(&mut self, id: SubscriptionId) -> Option<Subscription> {
        self.subscriptions.remove(&id)
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Snapshot of live subscriptions, for the periodic validator.
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.subscriptions.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique_and_removable() {
        let mut table = SubscriptionTable::new();
        let a = table.add(7, PathBuf::from("/c/t/07/7.jpg"), "com.example.viewer");
        let b = table.add(7, PathBuf::from("/c/t/07/7.jpg"), "com.example.other");
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);

        let sub = table.remove(a).unwrap();
        assert_eq!(sub.object_id, 7);
        assert_eq!(sub.client, "com.example.viewer");
        assert!(table.remove(a).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_snapshot_reflects_live_handles() {
        let mut table = SubscriptionTable::new();
        table.add(1, PathBuf::from("/c/t/01/1"), "x");
        let b = table.add(2, PathBuf::from("/c/t/02/2"), "y");
        table.remove(b);
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].object_id, 1);
    }
}
