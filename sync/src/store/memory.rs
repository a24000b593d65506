//! In-memory storage backend.

use super::StorageBackend;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use workspot_engine::{BoundingBox, PendingMutation, RecordId, SyncMetadata, WorkspaceRecord};

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<RecordId, WorkspaceRecord>,
    metadata: HashMap<RecordId, SyncMetadata>,
    mutations: BTreeMap<u64, PendingMutation>,
}

/// Backend keeping everything in process memory. Nothing survives a restart
/// except through a shared `Arc`.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load_record(&self, id: &str) -> Result<Option<WorkspaceRecord>> {
        Ok(self.state.read().await.records.get(id).cloned())
    }

    async fn save_record(&self, record: &WorkspaceRecord) -> Result<()> {
        self.state
            .write()
            .await
            .records
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn remove_record(&self, id: &str) -> Result<bool> {
        Ok(self.state.write().await.records.remove(id).is_some())
    }

    async fn records_in_bounds(&self, bounds: &BoundingBox) -> Result<Vec<WorkspaceRecord>> {
        Ok(self
            .state
            .read()
            .await
            .records
            .values()
            .filter(|r| bounds.contains(&r.coordinate))
            .cloned()
            .collect())
    }

    async fn all_records(&self) -> Result<Vec<WorkspaceRecord>> {
        Ok(self.state.read().await.records.values().cloned().collect())
    }

    async fn load_metadata(&self, id: &str) -> Result<Option<SyncMetadata>> {
        Ok(self.state.read().await.metadata.get(id).cloned())
    }

    async fn save_metadata(&self, meta: &SyncMetadata) -> Result<()> {
        self.state
            .write()
            .await
            .metadata
            .insert(meta.record_id.clone(), meta.clone());
        Ok(())
    }

    async fn remove_metadata(&self, id: &str) -> Result<()> {
        self.state.write().await.metadata.remove(id);
        Ok(())
    }

    async fn all_metadata(&self) -> Result<Vec<SyncMetadata>> {
        Ok(self.state.read().await.metadata.values().cloned().collect())
    }

    async fn save_mutation(&self, mutation: &PendingMutation) -> Result<()> {
        self.state
            .write()
            .await
            .mutations
            .insert(mutation.seq, mutation.clone());
        Ok(())
    }

    async fn remove_mutation(&self, mutation_id: &str) -> Result<()> {
        self.state
            .write()
            .await
            .mutations
            .retain(|_, m| m.mutation_id != mutation_id);
        Ok(())
    }

    async fn load_mutations(&self) -> Result<Vec<PendingMutation>> {
        Ok(self.state.read().await.mutations.values().cloned().collect())
    }
}
