//! Endpoint reference cache
//!
//! Read-through, write-through cache in front of the store. Expired entries
//! are evicted on lookup and never handed out.

use chrono::Utc;
use dsc_common::types::TransferId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::descriptor::EndpointReferenceEntry;
use crate::error::{Result, TransferError};
use crate::store::TransferStore;

pub struct EndpointReferenceCache {
    store: Arc<dyn TransferStore>,
    entries: RwLock<HashMap<TransferId, EndpointReferenceEntry>>,
}

impl EndpointReferenceCache {
    pub fn new(store: Arc<dyn TransferStore>) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Current entry for `id`. Fails with `EndpointExpired` past expiry and
    /// `EndpointMissing` when none is recorded.
    pub async fn get(&self, id: &TransferId) -> Result<EndpointReferenceEntry> {
        let cached = self.entries.read().await.get(id).cloned();
        let entry = match cached {
            Some(entry) => entry,
            None => {
                let loaded = self
                    .store
                    .get_endpoint(id)
                    .await?
                    .ok_or_else(|| TransferError::EndpointMissing(id.clone()))?;
                debug!(transfer_id = %id, "Loaded endpoint reference from store");
                self.entries.write().await.insert(id.clone(), loaded.clone());
                loaded
            },
        };

        if entry.is_expired_at(Utc::now()) {
            info!(transfer_id = %id, expires_at = ?entry.expires_at, "Endpoint reference expired, evicting");
            self.evict(id).await?;
            return Err(TransferError::EndpointExpired(id.clone()));
        }

        Ok(entry)
    }

    /// Replace the entry in the store and the cache.
    pub async fn refresh(&self, entry: EndpointReferenceEntry) -> Result<()> {
        self.store.put_endpoint(&entry).await?;
        info!(transfer_id = %entry.transfer_id, expires_at = ?entry.expires_at, "Endpoint reference refreshed");
        self.entries
            .write()
            .await
            .insert(entry.transfer_id.clone(), entry);
        Ok(())
    }

    /// Seed the cache after the store recorded the entry at admission.
    pub(crate) async fn remember(&self, entry: EndpointReferenceEntry) {
        self.entries
            .write()
            .await
            .insert(entry.transfer_id.clone(), entry);
    }

    pub async fn evict(&self, id: &TransferId) -> Result<()> {
        self.entries.write().await.remove(id);
        self.store.delete_endpoint(id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::descriptor::{
        Credentials, EndpointReference, HttpSinkMode, SinkSpec, SourceSpec, TransferDescriptor,
    };
    use crate::store::{MemoryTransferStore, TransferRecord};
    use chrono::Duration;

    async fn admitted(store: &MemoryTransferStore, expires_in: Duration) -> EndpointReferenceEntry {
        let descriptor = TransferDescriptor::new(
            TransferId::new("t1"),
            SourceSpec::HttpStreaming { path: None },
            SinkSpec::Http {
                url: "http://lake/ingest".into(),
                mode: HttpSinkMode::Ranged,
                auth_key: None,
                part_name: None,
                resume_granularity: None,
            },
            EndpointReference {
                endpoint: "http://origin/data".into(),
                credentials: Credentials::None,
                expires_at: Some(Utc::now() + expires_in),
            },
        );
        let entry = EndpointReferenceEntry::new(descriptor.transfer_id.clone(), &descriptor.endpoint);
        store
            .insert(&TransferRecord::pending(&descriptor), &entry)
            .await
            .unwrap();
        entry
    }

    #[tokio::test]
    async fn test_miss_loads_from_store() {
        let store = Arc::new(MemoryTransferStore::new());
        let entry = admitted(&store, Duration::hours(1)).await;
        let cache = EndpointReferenceCache::new(store);

        assert_eq!(cache.get(&entry.transfer_id).await.unwrap(), entry);
    }

    #[tokio::test]
    async fn test_expired_entry_is_evicted_everywhere() {
        let store = Arc::new(MemoryTransferStore::new());
        let entry = admitted(&store, Duration::seconds(-1)).await;
        let cache = EndpointReferenceCache::new(store.clone());

        let err = cache.get(&entry.transfer_id).await.unwrap_err();
        assert!(matches!(err, TransferError::EndpointExpired(_)));
        assert!(store.get_endpoint(&entry.transfer_id).await.unwrap().is_none());

        let err = cache.get(&entry.transfer_id).await.unwrap_err();
        assert!(matches!(err, TransferError::EndpointMissing(_)));
    }

    #[tokio::test]
    async fn test_refresh_replaces_entry() {
        let store = Arc::new(MemoryTransferStore::new());
        let mut entry = admitted(&store, Duration::seconds(-1)).await;
        let cache = EndpointReferenceCache::new(store);

        entry.endpoint = "http://origin/v2".into();
        entry.expires_at = Some(Utc::now() + Duration::hours(2));
        cache.refresh(entry.clone()).await.unwrap();

        let current = cache.get(&entry.transfer_id).await.unwrap();
        assert_eq!(current.endpoint, "http://origin/v2");
    }
}
