//! Sync Engine: reconciles the Local Store with the remote source.
//!
//! # Reads
//!
//! `nearby` answers from the Query Cache. When the queried region has not
//! been fetched within the freshness window, a pull runs in a spawned task
//! and the query waits for it at most `remote_timeout`; on timeout or network
//! failure the cached records are returned. `get_record` returns the local
//! copy right away and refreshes it in the background when stale.
//!
//! # Writes
//!
//! `submit_mutation` applies the change to the Local Store, queues it and
//! wakes the drain loop. The drain loop pushes the head mutation of every
//! record concurrently (bounded), one mutation in flight per record, so
//! per-record order is preserved on the remote side.
//!
//! # Record states
//!
//! ```text
//! Clean ──local write──▶ PendingPush ──ack──▶ Clean
//!                             │ ├──rejected──▶ Clean (reverted)
//!                             │ ├──remote newer──▶ Conflict ──resolve_conflict──▶ …
//!                             │ └──retries exhausted / remote error──▶ Failed ──retry_failed──▶ PendingPush
//! Clean ──stale──▶ PendingPull ──merged──▶ Clean
//!                       └──network unavailable──▶ PendingPull (retried on next access)
//! ```

use crate::cache::QueryCache;
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::gateway::{GatewayError, PushOutcome, RemoteGateway};
use crate::status::StatusHub;
use crate::store::{LocalStore, RecordLock};
use dashmap::{DashMap, DashSet};
use futures::stream::BoxStream;
use futures::FutureExt;
use rand::Rng;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use workspot_engine::merge::state_after_push;
use workspot_engine::{
    merge_pull, resolve_push_conflict, revert_rejected, BoundingBox, ConflictSnapshots,
    Coordinate, Enqueued, MutationId, MutationRequest, PendingMutation, PullOutcome,
    PushResolution, RecordId, RetryPolicy, SyncMetadata, SyncState, WorkspaceRecord,
};

type Outcome = Result<Option<WorkspaceRecord>>;

/// Handle on a submitted mutation.
#[derive(Debug)]
pub struct MutationTicket {
    mutation_id: MutationId,
    record_id: RecordId,
    receiver: oneshot::Receiver<Outcome>,
}

impl MutationTicket {
    pub fn mutation_id(&self) -> &str {
        &self.mutation_id
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    /// Wait until the remote source settled the mutation.
    ///
    /// Resolves to the local record afterwards (`None` once deleted), or to
    /// `Rejected`, `Conflict` or `Failed`. A mutation parked by a conflict
    /// resolves only once the conflict is resolved.
    pub async fn outcome(self) -> Outcome {
        self.receiver.await.unwrap_or(Err(SyncError::ShutDown))
    }
}

/// How to settle a record in Conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Push the parked local mutations again on top of the remote version.
    KeepLocal,
    /// Adopt the remote version and drop the parked mutations.
    KeepRemote,
}

enum Step {
    Settled,
    /// Network failure; back off, then push again.
    Retry,
    /// Rebased onto a newer remote version; push again right away.
    Rebased,
}

struct Shared {
    store: Arc<LocalStore>,
    gateway: Arc<dyn RemoteGateway>,
    cache: Arc<QueryCache>,
    status: StatusHub,
    config: SyncConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    pull_permits: Semaphore,
    wake: Notify,
    shutdown: CancellationToken,
    waiters: DashMap<MutationId, oneshot::Sender<Outcome>>,
    /// Records whose head mutation is being pushed right now
    pushing: DashSet<RecordId>,
    /// Records with a background refresh in flight
    refreshing: DashSet<RecordId>,
}

/// The sync runtime. Cheap to share behind an `Arc`.
pub struct SyncEngine {
    shared: Arc<Shared>,
    drain: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Start the engine on the current Tokio runtime.
    pub fn start(
        store: Arc<LocalStore>,
        gateway: Arc<dyn RemoteGateway>,
        config: SyncConfig,
    ) -> Self {
        Self::start_with_clock(store, gateway, config, Arc::new(SystemClock))
    }

    pub fn start_with_clock(
        store: Arc<LocalStore>,
        gateway: Arc<dyn RemoteGateway>,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = Arc::new(QueryCache::new());
        store.subscribe(cache.clone());

        let shared = Arc::new(Shared {
            store,
            gateway,
            cache,
            status: StatusHub::new(),
            retry: config.retry_policy(),
            pull_permits: Semaphore::new(config.pull_concurrency_limit),
            config,
            clock,
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            waiters: DashMap::new(),
            pushing: DashSet::new(),
            refreshing: DashSet::new(),
        });

        let drain = tokio::spawn(shared.clone().drain_loop());
        tracing::info!(
            push_concurrency = shared.config.push_concurrency_limit,
            pull_concurrency = shared.config.pull_concurrency_limit,
            "Sync engine started"
        );

        Self {
            shared,
            drain: parking_lot::Mutex::new(Some(drain)),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.shared.store
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.shared.cache
    }

    /// Records within `radius_m` meters of `center`, nearest first.
    pub async fn nearby(&self, center: Coordinate, radius_m: f64) -> Result<Vec<WorkspaceRecord>> {
        self.ensure_running()?;
        let shared = &self.shared;
        let regions = BoundingBox::regions_around(center, radius_m)?;
        shared.cache.ensure_built(&shared.store).await?;

        let now = shared.clock.now_ms();
        let window = shared.config.freshness_window_ms();
        let stale: Vec<BoundingBox> = regions
            .into_iter()
            .filter(|bounds| !shared.cache.is_region_fresh(bounds, now, window))
            .collect();
        if !stale.is_empty() {
            // Spawned so that dropping this query does not cancel the pull.
            let pull = tokio::spawn({
                let shared = shared.clone();
                async move {
                    let pulls = stale.into_iter().map(|bounds| shared.pull_region(bounds));
                    futures::future::try_join_all(pulls)
                        .await
                        .map(|merged| merged.into_iter().sum::<usize>())
                }
            });
            match tokio::time::timeout(shared.config.remote_timeout, pull).await {
                Ok(Ok(Ok(merged))) => tracing::debug!(merged, "Region refreshed"),
                Ok(Ok(Err(err))) => {
                    tracing::warn!(error = %err, "Region refresh failed, serving cached records")
                }
                Ok(Err(err)) => tracing::error!(error = %err, "Region refresh task failed"),
                Err(_) => tracing::warn!("Region refresh is slow, serving cached records"),
            }
        }

        Ok(shared.cache.nearby(center, radius_m)?)
    }

    /// A single record. Served locally when cached, even if stale.
    pub async fn get_record(&self, id: &str) -> Result<WorkspaceRecord> {
        self.ensure_running()?;
        let shared = &self.shared;

        if let Some(record) = shared.store.get(id).await? {
            let now = shared.clock.now_ms();
            let window = shared.config.freshness_window_ms();
            let refresh = match shared.store.metadata(id).await? {
                None => true,
                Some(meta) => {
                    meta.is_stale(now, window)
                        && matches!(meta.state, SyncState::Clean | SyncState::PendingPull)
                }
            };
            if refresh {
                shared.spawn_refresh(id);
            }
            return Ok(record);
        }

        shared
            .refresh_record(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(id.to_string()))
    }

    /// Apply a mutation locally and queue it for the remote source.
    ///
    /// Validation errors are returned before anything is stored.
    pub async fn submit_mutation(&self, request: MutationRequest) -> Result<MutationTicket> {
        self.ensure_running()?;
        let shared = &self.shared;
        let id = request.record_id.clone();
        let lock = shared.store.lock(&id).await;

        let meta = shared.store.metadata(&id).await?;
        if let Some(meta) = &meta {
            match &meta.state {
                SyncState::Conflict(snapshots) => {
                    return Err(SyncError::Conflict(snapshots.clone()));
                }
                SyncState::Failed { mutation, .. } => {
                    return Err(SyncError::Failed {
                        mutation_id: mutation.mutation_id.clone(),
                        attempts: meta.retry_count,
                        reason: meta.last_error.clone().unwrap_or_default(),
                    });
                }
                _ => {}
            }
        }

        let base = shared.store.get(&id).await?;
        let next = request.apply(base.as_ref())?;
        let pending = shared.store.pending_for(&id).await;
        if let Some(delete) = pending.iter().find(|m| m.is_delete()) {
            return Err(SyncError::Superseded {
                by: delete.mutation_id.clone(),
            });
        }

        let mutation_id = uuid::Uuid::new_v4().to_string();
        let mut mutation = PendingMutation::new(
            mutation_id.clone(),
            request,
            shared.clock.now_ms(),
            base.clone(),
        );
        // Earlier mutations may already be rebased past the local copy.
        if let Some(known) = pending.iter().map(|m| m.base_remote_at).max() {
            mutation.base_remote_at = mutation.base_remote_at.max(known);
        }

        // Record first, then queue: a persisted mutation always has its
        // local write.
        match next {
            Some(record) => {
                shared.store.put_locked(&lock, record).await?;
            }
            None => {
                shared.store.delete_locked(&lock).await?;
            }
        }

        let (sender, receiver) = oneshot::channel();
        shared.waiters.insert(mutation_id.clone(), sender);
        let failure = match shared.store.enqueue_mutation(mutation).await {
            Ok(Enqueued::Queued(seq)) => {
                tracing::debug!(record_id = %id, mutation_id = %mutation_id, seq, "Mutation queued");
                None
            }
            Ok(Enqueued::Superseded { by }) => Some(SyncError::Superseded { by }),
            Err(err) => Some(err),
        };
        if let Some(err) = failure {
            shared.waiters.remove(&mutation_id);
            match base {
                Some(base) => {
                    shared.store.put_locked(&lock, base).await?;
                }
                None => {
                    shared.store.delete_locked(&lock).await?;
                }
            }
            return Err(err);
        }

        let mut meta = meta.unwrap_or_else(|| SyncMetadata::new(&id));
        meta.state = SyncState::PendingPush;
        shared.save_status(&meta).await?;
        drop(lock);

        shared.wake.notify_one();
        Ok(MutationTicket {
            mutation_id,
            record_id: id,
            receiver,
        })
    }

    /// Current sync metadata of a record.
    pub async fn sync_status(&self, id: &str) -> Result<SyncMetadata> {
        let shared = &self.shared;
        match shared.store.metadata(id).await? {
            Some(meta) => Ok(meta),
            None if shared.store.get(id).await?.is_some() => Ok(SyncMetadata::new(id)),
            None => Err(SyncError::NotFound(id.to_string())),
        }
    }

    /// Stream of sync metadata changes for a record, current value first.
    ///
    /// Dropping the stream unsubscribes. The stream ends when the record is
    /// removed or the engine shuts down.
    pub async fn observe_sync_status(&self, id: &str) -> Result<BoxStream<'static, SyncMetadata>> {
        self.ensure_running()?;
        // Under the lock no status update can slip in between read and
        // subscribe.
        let _lock = self.shared.store.lock(id).await;
        let current = self.sync_status(id).await?;
        Ok(self.shared.status.subscribe(current))
    }

    /// Settle a record in Conflict.
    pub async fn resolve_conflict(&self, id: &str, resolution: Resolution) -> Result<()> {
        self.ensure_running()?;
        let shared = &self.shared;
        let lock = shared.store.lock(id).await;
        let mut meta = shared
            .store
            .metadata(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        let SyncState::Conflict(snapshots) = std::mem::take(&mut meta.state) else {
            return Err(SyncError::UnexpectedState {
                id: id.to_string(),
                expected: "conflict",
            });
        };
        let ConflictSnapshots {
            local,
            remote,
            parked,
        } = *snapshots;

        match resolution {
            Resolution::KeepLocal => {
                for mut mutation in parked {
                    mutation.base_remote_at = mutation.base_remote_at.max(remote.remote_updated_at);
                    let mutation_id = mutation.mutation_id.clone();
                    if let Enqueued::Superseded { by } = shared.store.enqueue_mutation(mutation).await? {
                        shared.resolve_waiter(&mutation_id, Err(SyncError::Superseded { by }));
                    }
                }
                meta.state = SyncState::PendingPush;
                meta.retry_count = 0;
                meta.last_error = None;
            }
            Resolution::KeepRemote => {
                let record = match local {
                    Some(mut local) => {
                        local.adopt_remote(&remote)?;
                        local
                    }
                    None => {
                        let saved = parked
                            .first()
                            .and_then(|m| m.base.as_ref())
                            .is_some_and(|base| base.saved);
                        WorkspaceRecord { saved, ..remote }
                    }
                };
                let stored = shared.store.put_locked(&lock, record).await?;
                meta.mark_synced(shared.clock.now_ms(), stored.revision);
                for mutation in parked {
                    shared.resolve_waiter(
                        &mutation.mutation_id,
                        Err(SyncError::Rejected(
                            "discarded in favour of the remote version".into(),
                        )),
                    );
                }
            }
        }

        shared.save_status(&meta).await?;
        drop(lock);
        tracing::info!(record_id = %id, ?resolution, "Conflict resolved");
        shared.wake.notify_one();
        Ok(())
    }

    /// Queue the mutations of a Failed record again, in their original order.
    pub async fn retry_failed(&self, id: &str) -> Result<()> {
        self.ensure_running()?;
        let shared = &self.shared;
        let lock = shared.store.lock(id).await;
        let mut meta = shared
            .store
            .metadata(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        let SyncState::Failed { mutation, parked } = std::mem::take(&mut meta.state) else {
            return Err(SyncError::UnexpectedState {
                id: id.to_string(),
                expected: "failed",
            });
        };

        for mutation in std::iter::once(*mutation).chain(parked) {
            shared.store.enqueue_mutation(mutation).await?;
        }
        meta.state = SyncState::PendingPush;
        meta.retry_count = 0;
        meta.last_error = None;
        shared.save_status(&meta).await?;
        drop(lock);

        tracing::info!(record_id = %id, "Retrying failed mutations");
        shared.wake.notify_one();
        Ok(())
    }

    /// Give up on the mutations of a Failed record: restore the state before
    /// the failed mutation and refresh it from the remote source.
    pub async fn discard_failed(&self, id: &str) -> Result<()> {
        self.ensure_running()?;
        let shared = &self.shared;
        let lock = shared.store.lock(id).await;
        let mut meta = shared
            .store
            .metadata(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        let SyncState::Failed { mutation, parked } = std::mem::take(&mut meta.state) else {
            return Err(SyncError::UnexpectedState {
                id: id.to_string(),
                expected: "failed",
            });
        };

        for later in &parked {
            shared.resolve_waiter(
                &later.mutation_id,
                Err(SyncError::Rejected("discarded after an earlier failure".into())),
            );
        }

        match mutation.base {
            Some(base) => {
                let stored = shared.store.put_locked(&lock, base).await?;
                meta.state = SyncState::PendingPull;
                meta.synced_revision = stored.revision;
                meta.retry_count = 0;
                meta.last_error = None;
                shared.save_status(&meta).await?;
                drop(lock);
                shared.spawn_refresh(id);
            }
            None => {
                shared.store.delete_locked(&lock).await?;
                shared.forget(id).await?;
            }
        }
        tracing::info!(record_id = %id, "Discarded failed mutations");
        Ok(())
    }

    /// Mark exactly the remotely saved records as saved locally.
    pub async fn refresh_saved(&self) -> Result<usize> {
        self.ensure_running()?;
        let shared = &self.shared;
        let ids: HashSet<RecordId> = shared
            .call(shared.gateway.fetch_saved_ids())
            .await?
            .into_iter()
            .collect();
        let changed = shared.store.set_saved(&ids).await?;
        tracing::debug!(saved = ids.len(), changed, "Saved workspaces refreshed");
        Ok(changed)
    }

    /// Locally saved records, ordered by id.
    pub async fn saved(&self) -> Result<Vec<WorkspaceRecord>> {
        self.shared.store.saved_records().await
    }

    /// Remove clean, unsaved records whose last sync is older than the
    /// eviction TTL. Returns how many were removed.
    pub async fn evict_stale(&self) -> Result<usize> {
        self.ensure_running()?;
        let shared = &self.shared;
        let now = shared.clock.now_ms();
        let ttl = shared.config.eviction_ttl_ms();
        let expired = |meta: &SyncMetadata| {
            meta.state.is_clean()
                && meta
                    .last_synced_at
                    .is_some_and(|synced| now.saturating_sub(synced) > ttl)
        };

        let mut evicted = 0;
        for meta in shared.store.all_metadata().await? {
            if !expired(&meta) {
                continue;
            }
            let id = meta.record_id.as_str();
            let lock = shared.store.lock(id).await;
            // Re-check under the lock.
            let still_expired = shared.store.metadata(id).await?.is_some_and(|m| expired(&m));
            if !still_expired || shared.store.has_pending(id).await {
                continue;
            }
            if shared.store.get(id).await?.is_some_and(|r| r.saved) {
                continue;
            }
            shared.store.delete_locked(&lock).await?;
            shared.forget(id).await?;
            evicted += 1;
        }

        if evicted > 0 {
            // Fetched regions no longer hold everything the remote returned.
            shared.cache.clear_coverage();
            tracing::info!(evicted, "Evicted stale records");
        }
        Ok(evicted)
    }

    /// Stop the drain loop and end every status stream. Queued mutations
    /// stay in the store.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let drain = self.drain.lock().take();
        if let Some(drain) = drain {
            if let Err(err) = drain.await {
                tracing::error!(error = %err, "Drain loop ended abnormally");
            }
        }
        self.shared.status.close_all();
        self.shared.waiters.clear();
        tracing::info!("Sync engine shut down");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shared.shutdown.is_cancelled() {
            Err(SyncError::ShutDown)
        } else {
            Ok(())
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl Shared {
    /// Run a gateway call under the remote timeout. Timing out counts as
    /// the network being unavailable.
    async fn call<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, GatewayError>>,
    ) -> std::result::Result<T, GatewayError> {
        match tokio::time::timeout(self.config.remote_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::NetworkUnavailable(format!(
                "no answer within {:?}",
                self.config.remote_timeout
            ))),
        }
    }

    async fn save_status(&self, meta: &SyncMetadata) -> Result<()> {
        self.store.put_metadata(meta).await?;
        self.status.publish(meta);
        Ok(())
    }

    async fn meta_for(&self, id: &str) -> Result<SyncMetadata> {
        Ok(self
            .store
            .metadata(id)
            .await?
            .unwrap_or_else(|| SyncMetadata::new(id)))
    }

    /// Drop the metadata of a record that no longer exists.
    async fn forget(&self, id: &str) -> Result<()> {
        self.store.remove_metadata(id).await?;
        self.status.close(id);
        Ok(())
    }

    fn resolve_waiter(&self, mutation_id: &str, outcome: Outcome) {
        if let Some((_, sender)) = self.waiters.remove(mutation_id) {
            let _ = sender.send(outcome);
        }
    }

    // Pull path

    /// Fetch every page of `bounds` and merge it. Returns the number of
    /// records merged.
    async fn pull_region(&self, bounds: BoundingBox) -> Result<usize> {
        let _permit = self
            .pull_permits
            .acquire()
            .await
            .map_err(|_| SyncError::ShutDown)?;
        let started = self.clock.now_ms();
        let mut page_token: Option<String> = None;
        let mut merged = 0;

        loop {
            let page = self
                .call(self.gateway.fetch_by_bounds(&bounds, page_token.as_deref()))
                .await?;

            for record in page.records {
                let id = record.id.clone();
                match self.merge_remote(record).await {
                    Ok(true) => merged += 1,
                    Ok(false) => {}
                    Err(SyncError::Validation(err)) => {
                        tracing::warn!(record_id = %id, error = %err, "Skipping invalid remote record")
                    }
                    Err(err) => return Err(err),
                }
            }
            for id in &page.tombstones {
                self.apply_tombstone(id).await?;
            }

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        self.cache.record_fetch(bounds, started);
        Ok(merged)
    }

    /// Fold one remote record into the local state. Returns whether the
    /// remote version was adopted.
    async fn merge_remote(&self, remote: WorkspaceRecord) -> Result<bool> {
        let id = remote.id.clone();
        let lock = self.store.lock(&id).await;
        if self.pushing.contains(&id) {
            // The push settles this record itself.
            return Ok(false);
        }

        let local = self.store.get(&id).await?;
        let meta = self.store.metadata(&id).await?;
        let pending = self.store.pending_for(&id).await;
        let pending_refs: Vec<&PendingMutation> = pending.iter().collect();

        match merge_pull(local.as_ref(), meta.as_ref(), &pending_refs, &remote)? {
            PullOutcome::Merged(record) => {
                let stored = self.store.put_locked(&lock, record).await?;
                let mut meta = meta.unwrap_or_else(|| SyncMetadata::new(&id));
                meta.mark_synced(self.clock.now_ms(), stored.revision);
                self.save_status(&meta).await?;
                Ok(true)
            }
            PullOutcome::KeptLocal => Ok(false),
            PullOutcome::Conflict(mut snapshots) => {
                snapshots.parked = self.store.take_pending_for(&id).await?;
                tracing::warn!(
                    record_id = %id,
                    parked = snapshots.parked.len(),
                    "Remote record changed under local writes"
                );
                let mut meta = meta.unwrap_or_else(|| SyncMetadata::new(&id));
                meta.state = SyncState::Conflict(Box::new(snapshots));
                meta.last_error = Some("remote record changed under local writes".into());
                self.save_status(&meta).await?;
                Ok(false)
            }
        }
    }

    /// Remove a record the remote source deleted, unless local writes are
    /// still outstanding for it.
    async fn apply_tombstone(&self, id: &str) -> Result<()> {
        let lock = self.store.lock(id).await;
        if self.pushing.contains(id) || self.store.has_pending(id).await {
            return Ok(());
        }
        let meta = self.store.metadata(id).await?;
        if meta.as_ref().is_some_and(|m| m.state.needs_attention()) {
            return Ok(());
        }
        if self.store.delete_locked(&lock).await? {
            tracing::debug!(record_id = %id, "Removed record deleted remotely");
        }
        if meta.is_some() {
            self.forget(id).await?;
        }
        Ok(())
    }

    fn spawn_refresh(self: &Arc<Self>, id: &str) {
        if !self.refreshing.insert(id.to_string()) {
            return;
        }
        let shared = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(err) = shared.refresh_record(&id).await {
                tracing::debug!(record_id = %id, error = %err, "Background refresh failed");
            }
            shared.refreshing.remove(&id);
        });
    }

    /// Re-validate one record against the remote source.
    async fn refresh_record(&self, id: &str) -> Result<Option<WorkspaceRecord>> {
        self.set_pending_pull(id).await?;
        match self.call(self.gateway.fetch_by_id(id)).await {
            Ok(Some(remote)) => {
                self.merge_remote(remote).await?;
            }
            Ok(None) => self.apply_tombstone(id).await?,
            Err(err) => {
                let _lock = self.store.lock(id).await;
                if let Some(mut meta) = self.store.metadata(id).await? {
                    if meta.state == SyncState::PendingPull {
                        meta.note_retry(err.to_string());
                        self.save_status(&meta).await?;
                    }
                }
                return Err(err.into());
            }
        }
        self.store.get(id).await
    }

    async fn set_pending_pull(&self, id: &str) -> Result<()> {
        let _lock = self.store.lock(id).await;
        if let Some(mut meta) = self.store.metadata(id).await? {
            if meta.state.is_clean() {
                meta.state = SyncState::PendingPull;
                self.save_status(&meta).await?;
            }
        }
        Ok(())
    }

    // Push path

    async fn drain_loop(self: Arc<Self>) {
        let mut tasks: JoinSet<RecordId> = JoinSet::new();
        let mut busy: HashSet<RecordId> = HashSet::new();

        loop {
            let capacity = self
                .config
                .push_concurrency_limit
                .saturating_sub(tasks.len());
            if capacity > 0 {
                for head in self.store.ready_mutations(&busy, capacity).await {
                    let record_id = head.record_id;
                    busy.insert(record_id.clone());
                    let shared = self.clone();
                    tasks.spawn(async move {
                        let drive = AssertUnwindSafe(shared.drive(&record_id)).catch_unwind();
                        if drive.await.is_err() {
                            tracing::error!(record_id = %record_id, "Push task panicked");
                            shared.pushing.remove(&record_id);
                        }
                        record_id
                    });
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Ok(record_id) = joined {
                        busy.remove(&record_id);
                    }
                }
                _ = self.wake.notified() => {}
            }
        }

        tasks.shutdown().await;
        tracing::debug!("Drain loop stopped");
    }

    /// Push the head mutation of `record_id` until it settles, backing off
    /// on network failures.
    async fn drive(&self, record_id: &str) {
        let mut retries: u32 = 0;
        loop {
            match self.push_once(record_id, retries).await {
                Ok(Step::Settled) => return,
                Ok(Step::Rebased) => retries += 1,
                Ok(Step::Retry) => {
                    let unit: f64 = rand::thread_rng().gen();
                    let delay = self.retry.jittered_delay(retries, unit);
                    retries += 1;
                    tracing::debug!(record_id, retries, ?delay, "Backing off before next push");
                    if !self.pause(delay).await {
                        return;
                    }
                }
                Err(err) => {
                    tracing::error!(record_id, error = %err, "Push bookkeeping failed");
                    // The mutation stays queued; hold off before the drain
                    // loop picks it up again.
                    self.pause(self.retry.delay(0)).await;
                    return;
                }
            }
        }
    }

    /// Sleep unless shut down first. Returns false on shutdown.
    async fn pause(&self, delay: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown.cancelled() => false,
        }
    }

    async fn push_once(&self, record_id: &str, retries: u32) -> Result<Step> {
        let mutation = {
            let _lock = self.store.lock(record_id).await;
            let Some(head) = self.store.head_for(record_id).await else {
                return Ok(Step::Settled);
            };
            self.pushing.insert(record_id.to_string());
            head
        };

        tracing::debug!(
            record_id,
            mutation_id = %mutation.mutation_id,
            kind = ?mutation.kind,
            attempt = retries,
            "Pushing mutation"
        );
        let outcome = self.call(self.gateway.push(&mutation)).await;

        let lock = self.store.lock(record_id).await;
        let step = self.settle(&lock, mutation, outcome, retries).await;
        self.pushing.remove(record_id);
        step
    }

    async fn settle(
        &self,
        lock: &RecordLock,
        mutation: PendingMutation,
        outcome: std::result::Result<PushOutcome, GatewayError>,
        retries: u32,
    ) -> Result<Step> {
        match outcome {
            Ok(PushOutcome::Ack { record }) => {
                self.on_ack(lock, &mutation, record).await?;
                Ok(Step::Settled)
            }
            Ok(PushOutcome::Rejected { reason }) => {
                self.on_rejected(lock, &mutation, reason).await?;
                Ok(Step::Settled)
            }
            Ok(PushOutcome::Conflict { remote }) => match resolve_push_conflict(&mutation, &remote)
            {
                PushResolution::Conflict => {
                    self.on_conflict(lock, &mutation, remote).await?;
                    Ok(Step::Settled)
                }
                PushResolution::Rebase { base_remote_at } => {
                    if !self.retry.should_retry(retries) {
                        let reason = "remote kept reporting conflicting writes".to_string();
                        self.on_failed(lock, &mutation, reason, retries + 1).await?;
                        return Ok(Step::Settled);
                    }
                    tracing::info!(
                        record_id = %mutation.record_id,
                        mutation_id = %mutation.mutation_id,
                        base_remote_at,
                        "Local write is newer, rebasing onto remote version"
                    );
                    let rebased = PendingMutation {
                        base_remote_at,
                        ..mutation
                    };
                    self.store.replace_mutation(rebased).await?;
                    Ok(Step::Rebased)
                }
            },
            Err(GatewayError::NetworkUnavailable(reason)) => {
                if !self.retry.should_retry(retries) {
                    self.on_failed(lock, &mutation, reason, retries + 1).await?;
                    return Ok(Step::Settled);
                }
                let mut meta = self.meta_for(&mutation.record_id).await?;
                meta.note_retry(reason);
                self.save_status(&meta).await?;
                Ok(Step::Retry)
            }
            Err(err @ GatewayError::Remote { .. }) => {
                self.on_failed(lock, &mutation, err.to_string(), retries + 1)
                    .await?;
                Ok(Step::Settled)
            }
        }
    }

    async fn on_ack(
        &self,
        lock: &RecordLock,
        mutation: &PendingMutation,
        remote: Option<WorkspaceRecord>,
    ) -> Result<()> {
        let id = mutation.record_id.as_str();
        self.store.remove_mutation(&mutation.mutation_id).await?;
        let remaining = self.store.pending_for(id).await;
        let local = self.store.get(id).await?;

        let settled = match (local, remote) {
            (Some(mut local), Some(remote)) if remaining.is_empty() => {
                local.adopt_remote(&remote)?;
                Some(self.store.put_locked(lock, local).await?)
            }
            (local, remote) => {
                // Later mutations were written against the version this push
                // just replaced.
                if let Some(remote) = remote {
                    for later in &remaining {
                        if later.base_remote_at < remote.remote_updated_at {
                            let rebased = PendingMutation {
                                base_remote_at: remote.remote_updated_at,
                                ..later.clone()
                            };
                            self.store.replace_mutation(rebased).await?;
                        }
                    }
                }
                local
            }
        };

        let mut meta = self.meta_for(id).await?;
        meta.state = state_after_push(remaining.len());
        if meta.state.is_clean() {
            let revision = settled.as_ref().map_or(0, |r| r.revision);
            meta.mark_synced(self.clock.now_ms(), revision);
        } else {
            meta.retry_count = 0;
            meta.last_error = None;
        }
        self.save_status(&meta).await?;
        if settled.is_none() && remaining.is_empty() {
            self.forget(id).await?;
        }

        tracing::info!(
            record_id = %id,
            mutation_id = %mutation.mutation_id,
            remaining = remaining.len(),
            "Mutation acknowledged"
        );
        self.resolve_waiter(&mutation.mutation_id, Ok(settled));
        Ok(())
    }

    async fn on_rejected(
        &self,
        lock: &RecordLock,
        mutation: &PendingMutation,
        reason: String,
    ) -> Result<()> {
        let id = mutation.record_id.as_str();
        self.store.remove_mutation(&mutation.mutation_id).await?;
        let later = self.store.pending_for(id).await;
        let later_refs: Vec<&PendingMutation> = later.iter().collect();

        let reverted = match revert_rejected(mutation, &later_refs) {
            Some(record) => Some(self.store.put_locked(lock, record).await?),
            None => {
                self.store.delete_locked(lock).await?;
                None
            }
        };

        let mut meta = self.meta_for(id).await?;
        meta.state = state_after_push(later.len());
        if meta.state.is_clean() {
            meta.mark_synced(self.clock.now_ms(), reverted.as_ref().map_or(0, |r| r.revision));
        }
        meta.last_error = Some(format!("rejected: {reason}"));
        self.save_status(&meta).await?;
        if reverted.is_none() && later.is_empty() {
            self.forget(id).await?;
        }

        tracing::warn!(
            record_id = %id,
            mutation_id = %mutation.mutation_id,
            reason = %reason,
            "Mutation rejected, local change reverted"
        );
        self.resolve_waiter(&mutation.mutation_id, Err(SyncError::Rejected(reason)));
        Ok(())
    }

    async fn on_conflict(
        &self,
        _lock: &RecordLock,
        mutation: &PendingMutation,
        remote: WorkspaceRecord,
    ) -> Result<()> {
        let id = mutation.record_id.as_str();
        let snapshots = ConflictSnapshots {
            local: self.store.get(id).await?,
            remote,
            parked: self.store.take_pending_for(id).await?,
        };

        let mut meta = self.meta_for(id).await?;
        meta.state = SyncState::Conflict(Box::new(snapshots.clone()));
        meta.last_error = Some("remote record is newer than the local write".into());
        self.save_status(&meta).await?;

        tracing::warn!(
            record_id = %id,
            mutation_id = %mutation.mutation_id,
            parked = snapshots.parked.len(),
            "Push conflict, waiting for resolution"
        );
        self.resolve_waiter(
            &mutation.mutation_id,
            Err(SyncError::Conflict(Box::new(snapshots))),
        );
        Ok(())
    }

    async fn on_failed(
        &self,
        _lock: &RecordLock,
        mutation: &PendingMutation,
        reason: String,
        attempts: u32,
    ) -> Result<()> {
        let id = mutation.record_id.as_str();
        let mut parked = self.store.take_pending_for(id).await?;
        parked.retain(|m| m.mutation_id != mutation.mutation_id);

        let mut meta = self.meta_for(id).await?;
        meta.state = SyncState::Failed {
            mutation: Box::new(mutation.clone()),
            parked,
        };
        meta.retry_count = attempts;
        meta.last_error = Some(reason.clone());
        self.save_status(&meta).await?;

        tracing::error!(
            record_id = %id,
            mutation_id = %mutation.mutation_id,
            attempts,
            reason = %reason,
            "Mutation failed"
        );
        self.resolve_waiter(
            &mutation.mutation_id,
            Err(SyncError::Failed {
                mutation_id: mutation.mutation_id.clone(),
                attempts,
                reason,
            }),
        );
        Ok(())
    }
}
