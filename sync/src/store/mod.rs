//! Local Store: durable persistence for records, sync metadata and the
//! pending-mutation queue.
//!
//! [`LocalStore`] wraps a [`StorageBackend`] and adds the rules every backend
//! shares: validation before writes, revision bumps on content changes,
//! per-record write locks, and synchronous change notification.

mod memory;
mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use workspot_engine::{
    BoundingBox, Enqueued, MutationQueue, PendingMutation, RecordId, SyncMetadata,
    WorkspaceRecord,
};

/// Raw persistence operations. Implementations do no validation.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn load_record(&self, id: &str) -> Result<Option<WorkspaceRecord>>;
    async fn save_record(&self, record: &WorkspaceRecord) -> Result<()>;
    /// Returns whether the record existed.
    async fn remove_record(&self, id: &str) -> Result<bool>;
    /// Records inside `bounds` (edges included), ordered by id.
    async fn records_in_bounds(&self, bounds: &BoundingBox) -> Result<Vec<WorkspaceRecord>>;
    async fn all_records(&self) -> Result<Vec<WorkspaceRecord>>;

    async fn load_metadata(&self, id: &str) -> Result<Option<SyncMetadata>>;
    async fn save_metadata(&self, meta: &SyncMetadata) -> Result<()>;
    async fn remove_metadata(&self, id: &str) -> Result<()>;
    async fn all_metadata(&self) -> Result<Vec<SyncMetadata>>;

    /// Insert or replace a queued mutation, keyed by its sequence number.
    async fn save_mutation(&self, mutation: &PendingMutation) -> Result<()>;
    async fn remove_mutation(&self, mutation_id: &str) -> Result<()>;
    /// Every queued mutation, in sequence order.
    async fn load_mutations(&self) -> Result<Vec<PendingMutation>>;
}

/// A change made through the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    Upserted(WorkspaceRecord),
    Removed(RecordId),
}

/// Receives every record change, synchronously, before the write returns.
pub trait ChangeObserver: Send + Sync {
    fn on_change(&self, change: &StoreChange);
}

/// Exclusive write access to one record id.
///
/// Held across read-modify-write sequences; the `*_locked` store methods
/// require it.
pub struct RecordLock {
    id: RecordId,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<LockTable>,
}

type LockTable = DashMap<RecordId, Arc<Mutex<()>>>;

impl RecordLock {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Nobody else holds or waits on this mutex: drop its table entry.
        self.table
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Local Store over a pluggable backend.
pub struct LocalStore {
    backend: Arc<dyn StorageBackend>,
    locks: Arc<LockTable>,
    queue: Mutex<MutationQueue>,
    observers: RwLock<Vec<Arc<dyn ChangeObserver>>>,
}

impl LocalStore {
    /// Open a store, loading any persisted mutation queue.
    pub async fn open(backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let persisted = backend.load_mutations().await?;
        if !persisted.is_empty() {
            tracing::info!(count = persisted.len(), "Restored pending mutations");
        }
        Ok(Self {
            backend,
            locks: Arc::new(DashMap::new()),
            queue: Mutex::new(MutationQueue::from_entries(persisted)),
            observers: RwLock::new(Vec::new()),
        })
    }

    /// Open a store over a fresh in-memory backend.
    pub async fn in_memory() -> Result<Self> {
        Self::open(Arc::new(MemoryBackend::new())).await
    }

    pub fn subscribe(&self, observer: Arc<dyn ChangeObserver>) {
        self.observers.write().push(observer);
    }

    /// Take the write lock for `id`.
    pub async fn lock(&self, id: &str) -> RecordLock {
        let mutex = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        RecordLock {
            id: id.to_string(),
            guard: Some(mutex.lock_owned().await),
            table: self.locks.clone(),
        }
    }

    #[cfg(test)]
    fn lock_table_len(&self) -> usize {
        self.locks.len()
    }

    // Records

    pub async fn get(&self, id: &str) -> Result<Option<WorkspaceRecord>> {
        self.backend.load_record(id).await
    }

    /// Validate and upsert a record.
    ///
    /// Idempotent: storing content equal to what is already there changes
    /// nothing. Otherwise the revision is bumped past the stored one.
    /// Returns the record as stored.
    pub async fn put(&self, record: WorkspaceRecord) -> Result<WorkspaceRecord> {
        let lock = self.lock(&record.id).await;
        self.put_locked(&lock, record).await
    }

    pub async fn put_locked(
        &self,
        lock: &RecordLock,
        mut record: WorkspaceRecord,
    ) -> Result<WorkspaceRecord> {
        debug_assert_eq!(lock.id(), record.id);
        record.validate()?;

        let existing = self.backend.load_record(&record.id).await?;
        if let Some(existing) = existing.as_ref() {
            if existing.same_content(&record) {
                return Ok(existing.clone());
            }
        }
        record.revision = existing.map_or(0, |r| r.revision) + 1;

        self.backend.save_record(&record).await?;
        self.notify(&StoreChange::Upserted(record.clone()));
        Ok(record)
    }

    /// Remove a record. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let lock = self.lock(id).await;
        self.delete_locked(&lock).await
    }

    pub async fn delete_locked(&self, lock: &RecordLock) -> Result<bool> {
        let removed = self.backend.remove_record(lock.id()).await?;
        if removed {
            self.notify(&StoreChange::Removed(lock.id().to_string()));
        }
        Ok(removed)
    }

    /// Exactly the records inside `bounds`, ordered by id.
    pub async fn query_by_bounds(&self, bounds: &BoundingBox) -> Result<Vec<WorkspaceRecord>> {
        self.backend.records_in_bounds(bounds).await
    }

    pub async fn all_records(&self) -> Result<Vec<WorkspaceRecord>> {
        self.backend.all_records().await
    }

    pub async fn saved_records(&self) -> Result<Vec<WorkspaceRecord>> {
        let mut saved: Vec<_> = self
            .backend
            .all_records()
            .await?
            .into_iter()
            .filter(|r| r.saved)
            .collect();
        saved.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(saved)
    }

    /// Mark exactly `ids` as saved. Returns how many records changed.
    pub async fn set_saved(&self, ids: &HashSet<RecordId>) -> Result<usize> {
        let mut changed = 0;
        for record in self.backend.all_records().await? {
            let lock = self.lock(&record.id).await;
            // Re-read under the lock; the snapshot above may be outdated.
            let Some(mut current) = self.backend.load_record(&record.id).await? else {
                continue;
            };
            let saved = ids.contains(&current.id);
            if current.saved != saved {
                current.saved = saved;
                self.put_locked(&lock, current).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    // Metadata

    pub async fn metadata(&self, id: &str) -> Result<Option<SyncMetadata>> {
        self.backend.load_metadata(id).await
    }

    pub async fn put_metadata(&self, meta: &SyncMetadata) -> Result<()> {
        self.backend.save_metadata(meta).await
    }

    pub async fn remove_metadata(&self, id: &str) -> Result<()> {
        self.backend.remove_metadata(id).await
    }

    pub async fn all_metadata(&self) -> Result<Vec<SyncMetadata>> {
        self.backend.all_metadata().await
    }

    // Mutation queue

    /// Queue a mutation, persisting it before returning.
    pub async fn enqueue_mutation(&self, mut mutation: PendingMutation) -> Result<Enqueued> {
        let mut queue = self.queue.lock().await;
        let outcome = queue.enqueue(mutation.clone());
        if let Enqueued::Queued(seq) = outcome {
            mutation.seq = seq;
            if let Err(err) = self.backend.save_mutation(&mutation).await {
                queue.remove(&mutation.mutation_id);
                return Err(err);
            }
        }
        Ok(outcome)
    }

    /// Remove and return the oldest queued mutation.
    pub async fn dequeue_next_mutation(&self) -> Result<Option<PendingMutation>> {
        let mut queue = self.queue.lock().await;
        let Some(next) = queue.peek().cloned() else {
            return Ok(None);
        };
        self.backend.remove_mutation(&next.mutation_id).await?;
        queue.dequeue();
        Ok(Some(next))
    }

    /// Head mutation of each record not in `busy`, oldest first.
    pub async fn ready_mutations(
        &self,
        busy: &HashSet<RecordId>,
        limit: usize,
    ) -> Vec<PendingMutation> {
        let queue = self.queue.lock().await;
        queue.ready_heads(busy, limit).into_iter().cloned().collect()
    }

    pub async fn pending_for(&self, id: &str) -> Vec<PendingMutation> {
        let queue = self.queue.lock().await;
        queue.pending_for(id).into_iter().cloned().collect()
    }

    /// Oldest queued mutation for `id`.
    pub async fn head_for(&self, id: &str) -> Option<PendingMutation> {
        self.queue.lock().await.head_for(id).cloned()
    }

    pub async fn has_pending(&self, id: &str) -> bool {
        self.queue.lock().await.head_for(id).is_some()
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn remove_mutation(&self, mutation_id: &str) -> Result<Option<PendingMutation>> {
        let mut queue = self.queue.lock().await;
        let removed = queue.remove(mutation_id);
        if removed.is_some() {
            self.backend.remove_mutation(mutation_id).await?;
        }
        Ok(removed)
    }

    /// Remove every queued mutation for `id`, in queue order.
    pub async fn take_pending_for(&self, id: &str) -> Result<Vec<PendingMutation>> {
        let mut queue = self.queue.lock().await;
        let taken = queue.take_for(id);
        for mutation in &taken {
            self.backend.remove_mutation(&mutation.mutation_id).await?;
        }
        Ok(taken)
    }

    /// Update a queued mutation in place. Returns false if it is no longer
    /// queued.
    pub async fn replace_mutation(&self, mutation: PendingMutation) -> Result<bool> {
        let mut queue = self.queue.lock().await;
        if !queue.replace(mutation.clone()) {
            return Ok(false);
        }
        self.backend.save_mutation(&mutation).await?;
        Ok(true)
    }

    fn notify(&self, change: &StoreChange) {
        for observer in self.observers.read().iter() {
            observer.on_change(change);
        }
    }
}
