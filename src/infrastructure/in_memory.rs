use crate::domain::entitlement::{EntitlementRecord, RecordSource};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

type Key = (String, String);

/// In-memory cache of which resources the current user holds.
///
/// Explicitly injected into the flow controller and reconciler rather than
/// living as ambient global state. The in-flight set enforces one writer per
/// `(resource, user)` key at a time; records persist until `clear` (logout).
#[derive(Default, Clone)]
pub struct LocalEntitlementStore {
    records: Arc<RwLock<HashMap<Key, EntitlementRecord>>>,
    in_flight: Arc<RwLock<HashSet<Key>>>,
}

impl LocalEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, resource_id: &str, user_id: &str) -> Option<EntitlementRecord> {
        let records = self.records.read().await;
        records
            .get(&(resource_id.to_string(), user_id.to_string()))
            .cloned()
    }

    /// Applies a record under the supersede rule. A confirmed write
    /// replaces anything; an optimistic write never downgrades a confirmed
    /// record.
    pub async fn apply(&self, record: EntitlementRecord) {
        let key = (record.resource_id.clone(), record.user_id.clone());
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&key) {
            if !existing.superseded_by(&record) {
                debug!(
                    resource_id = %key.0,
                    "optimistic write ignored, record already confirmed"
                );
                return;
            }
        }
        records.insert(key, record);
    }

    /// Removes a record only while it is still optimistic.
    pub async fn rollback_optimistic(&self, resource_id: &str, user_id: &str) {
        let key = (resource_id.to_string(), user_id.to_string());
        let mut records = self.records.write().await;
        if records
            .get(&key)
            .is_some_and(|r| r.source == RecordSource::Optimistic)
        {
            records.remove(&key);
            debug!(resource_id, "optimistic entitlement rolled back");
        }
    }

    /// Claims the single-writer slot for a key. Returns `false` when a
    /// session for the key is already in flight.
    pub async fn try_begin(&self, resource_id: &str, user_id: &str) -> bool {
        let mut in_flight = self.in_flight.write().await;
        in_flight.insert((resource_id.to_string(), user_id.to_string()))
    }

    pub async fn finish(&self, resource_id: &str, user_id: &str) {
        let mut in_flight = self.in_flight.write().await;
        in_flight.remove(&(resource_id.to_string(), user_id.to_string()));
    }

    /// Drops everything; used on logout.
    pub async fn clear(&self) {
        self.records.write().await.clear();
        self.in_flight.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entitlement::EntitlementStatus;

    #[tokio::test]
    async fn test_apply_and_get() {
        let store = LocalEntitlementStore::new();
        assert!(store.get("res-1", "user-1").await.is_none());

        store
            .apply(EntitlementRecord::optimistic("res-1", "user-1"))
            .await;
        let record = store.get("res-1", "user-1").await.unwrap();
        assert_eq!(record.source, RecordSource::Optimistic);
        assert_eq!(record.status, EntitlementStatus::Active);
    }

    #[tokio::test]
    async fn test_optimistic_never_downgrades_confirmed() {
        let store = LocalEntitlementStore::new();
        store
            .apply(EntitlementRecord::confirmed(
                "res-1",
                "user-1",
                EntitlementStatus::Absent,
            ))
            .await;
        store
            .apply(EntitlementRecord::optimistic("res-1", "user-1"))
            .await;

        let record = store.get("res-1", "user-1").await.unwrap();
        assert_eq!(record.source, RecordSource::Confirmed);
        assert_eq!(record.status, EntitlementStatus::Absent);
    }

    #[tokio::test]
    async fn test_confirmed_overrides_optimistic() {
        let store = LocalEntitlementStore::new();
        store
            .apply(EntitlementRecord::optimistic("res-1", "user-1"))
            .await;
        store
            .apply(EntitlementRecord::confirmed(
                "res-1",
                "user-1",
                EntitlementStatus::Active,
            ))
            .await;

        let record = store.get("res-1", "user-1").await.unwrap();
        assert_eq!(record.source, RecordSource::Confirmed);
    }

    #[tokio::test]
    async fn test_rollback_only_touches_optimistic() {
        let store = LocalEntitlementStore::new();
        store
            .apply(EntitlementRecord::optimistic("res-1", "user-1"))
            .await;
        store.rollback_optimistic("res-1", "user-1").await;
        assert!(store.get("res-1", "user-1").await.is_none());

        store
            .apply(EntitlementRecord::confirmed(
                "res-1",
                "user-1",
                EntitlementStatus::Active,
            ))
            .await;
        store.rollback_optimistic("res-1", "user-1").await;
        assert!(store.get("res-1", "user-1").await.is_some());
    }

    #[tokio::test]
    async fn test_in_flight_is_exclusive_per_key() {
        let store = LocalEntitlementStore::new();
        assert!(store.try_begin("res-1", "user-1").await);
        assert!(!store.try_begin("res-1", "user-1").await);
        assert!(store.try_begin("res-2", "user-1").await);

        store.finish("res-1", "user-1").await;
        assert!(store.try_begin("res-1", "user-1").await);
    }
}
