//! The set of replica stores the engine synchronizes between.

use crate::error::{SyncError, SyncResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use twinstore_core::ReplicaId;
use twinstore_core::config::ReplicaConfig;
use twinstore_storage::{ObjectStore, StorageResult};

/// Named object stores, one per replica.
#[derive(Clone, Default)]
pub struct ReplicaSet {
    stores: BTreeMap<ReplicaId, Arc<dyn ObjectStore>>,
}

impl ReplicaSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured replica's backend.
    pub async fn from_config(replicas: &[ReplicaConfig]) -> StorageResult<Self> {
        let mut set = Self::new();
        for replica in replicas {
            let store = twinstore_storage::from_config(&replica.storage).await?;
            tracing::info!(
                replica = %replica.name,
                backend = store.backend_name(),
                "Replica store initialized"
            );
            set.insert(ReplicaId::new(&replica.name), store);
        }
        Ok(set)
    }

    pub fn insert(&mut self, id: ReplicaId, store: Arc<dyn ObjectStore>) {
        self.stores.insert(id, store);
    }

    /// Look up a replica's store.
    pub fn get(&self, id: &ReplicaId) -> SyncResult<&Arc<dyn ObjectStore>> {
        self.stores
            .get(id)
            .ok_or_else(|| SyncError::UnknownReplica(id.to_string()))
    }

    pub fn contains(&self, id: &ReplicaId) -> bool {
        self.stores.contains_key(id)
    }

    /// Replica names in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &ReplicaId> {
        self.stores.keys()
    }

    /// Every replica except `id`.
    pub fn others<'a>(
        &'a self,
        id: &'a ReplicaId,
    ) -> impl Iterator<Item = (&'a ReplicaId, &'a Arc<dyn ObjectStore>)> + 'a {
        self.stores.iter().filter(move |(other, _)| *other != id)
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}
