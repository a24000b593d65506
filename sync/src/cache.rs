//! Query Cache: in-memory spatial read replica of the Local Store.
//!
//! The cache subscribes to store changes and applies them as they happen.
//! After a cold start or [`QueryCache::invalidate`] it is rebuilt from the
//! store on the next query. Changes that arrive while a rebuild is reading
//! the store are buffered and replayed on top of the snapshot.

use crate::error::Result;
use crate::store::{ChangeObserver, LocalStore, StoreChange};
use parking_lot::RwLock;
use std::collections::HashMap;
use workspot_engine::{
    BoundingBox, Coordinate, Coverage, RecordId, SpatialIndex, Timestamp, WorkspaceRecord,
};

#[derive(Debug, Default)]
struct CacheState {
    index: SpatialIndex,
    records: HashMap<RecordId, WorkspaceRecord>,
    built: bool,
    building: bool,
    buffered: Vec<StoreChange>,
    coverage: Coverage,
}

impl CacheState {
    fn apply(&mut self, change: &StoreChange) {
        match change {
            StoreChange::Upserted(record) => {
                self.index.upsert(&record.id, record.coordinate);
                self.records.insert(record.id.clone(), record.clone());
            }
            StoreChange::Removed(id) => {
                self.index.remove(id);
                self.records.remove(id);
            }
        }
    }
}

/// Spatial index plus record copies for low-latency nearby queries.
#[derive(Debug, Default)]
pub struct QueryCache {
    state: RwLock<CacheState>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_built(&self) -> bool {
        self.state.read().built
    }

    /// Rebuild from the store unless the cache is already current.
    pub async fn ensure_built(&self, store: &LocalStore) -> Result<()> {
        {
            let mut state = self.state.write();
            if state.built {
                return Ok(());
            }
            state.building = true;
            state.buffered.clear();
        }

        let snapshot = match store.all_records().await {
            Ok(records) => records,
            Err(err) => {
                self.state.write().building = false;
                return Err(err);
            }
        };

        let mut state = self.state.write();
        if state.built {
            // A concurrent rebuild finished first.
            return Ok(());
        }
        state.index = SpatialIndex::bulk_load(
            snapshot
                .iter()
                .map(|record| (record.id.clone(), record.coordinate)),
        );
        state.records = snapshot
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        for change in std::mem::take(&mut state.buffered) {
            state.apply(&change);
        }
        state.built = true;
        state.building = false;
        tracing::debug!(records = state.records.len(), "Query cache rebuilt");
        Ok(())
    }

    /// Drop the index; the next query rebuilds it. Coverage is forgotten too.
    pub fn invalidate(&self) {
        let mut state = self.state.write();
        state.index.clear();
        state.records.clear();
        state.built = false;
        state.buffered.clear();
        state.coverage.clear();
    }

    /// Cached records within `radius_m` of `center`, nearest first, ties by id.
    pub fn nearby(
        &self,
        center: Coordinate,
        radius_m: f64,
    ) -> std::result::Result<Vec<WorkspaceRecord>, workspot_engine::Error> {
        let state = self.state.read();
        let neighbors = state.index.nearby(center, radius_m)?;
        Ok(neighbors
            .into_iter()
            .filter_map(|n| state.records.get(&n.id).cloned())
            .collect())
    }

    /// Cached records inside `bounds`, ordered by id.
    pub fn within_bounds(&self, bounds: &BoundingBox) -> Vec<WorkspaceRecord> {
        let state = self.state.read();
        state
            .index
            .within_bounds(bounds)
            .into_iter()
            .filter_map(|id| state.records.get(&id).cloned())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<WorkspaceRecord> {
        self.state.read().records.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remember that `bounds` was fetched from the remote source at `at`.
    pub fn record_fetch(&self, bounds: BoundingBox, at: Timestamp) {
        self.state.write().coverage.record(bounds, at);
    }

    /// Whether a fetch younger than `window_ms` covers `bounds`.
    pub fn is_region_fresh(&self, bounds: &BoundingBox, now: Timestamp, window_ms: u64) -> bool {
        self.state.read().coverage.is_fresh(bounds, now, window_ms)
    }

    /// Forget every fetched region, keeping the index.
    pub fn clear_coverage(&self) {
        self.state.write().coverage.clear();
    }

    pub fn prune_coverage(&self, now: Timestamp, window_ms: u64) {
        self.state.write().coverage.prune(now, window_ms);
    }
}

impl ChangeObserver for QueryCache {
    fn on_change(&self, change: &StoreChange) {
        let mut state = self.state.write();
        if state.built {
            state.apply(change);
        } else if state.building {
            state.buffered.push(change.clone());
        }
    }
}
