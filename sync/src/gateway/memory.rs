//! In-process remote source.
//!
//! Behaves like the real API (pagination, tombstones, conflict detection on
//! pushes) while letting callers cut connectivity, add latency and script
//! responses. Built for tests and local tooling behind the `testing`
//! feature.

use super::{GatewayError, Page, PushOutcome, RemoteGateway};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;
use workspot_engine::{
    BoundingBox, MutationKind, PendingMutation, RecordId, Timestamp, WorkspaceRecord,
};

#[derive(Debug, Default)]
struct RemoteState {
    records: BTreeMap<RecordId, WorkspaceRecord>,
    tombstones: BTreeSet<RecordId>,
    saved: Vec<RecordId>,
    /// Remote clock, bumped on every accepted write
    now: Timestamp,
    online: bool,
    latency: Duration,
    scripted: VecDeque<Result<PushOutcome, GatewayError>>,
    pushes: Vec<PendingMutation>,
    fetches: usize,
    in_flight: usize,
    peak_in_flight: usize,
}

/// Counts a push as in progress until dropped, even when the caller gives
/// up on it.
struct InFlight<'a>(&'a Mutex<RemoteState>);

impl<'a> InFlight<'a> {
    fn enter(state: &'a Mutex<RemoteState>) -> Self {
        let mut guard = state.lock();
        guard.in_flight += 1;
        guard.peak_in_flight = guard.peak_in_flight.max(guard.in_flight);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.lock().in_flight -= 1;
    }
}

/// A simulated remote source.
#[derive(Debug)]
pub struct MemoryGateway {
    state: Mutex<RemoteState>,
    page_size: usize,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState {
                online: true,
                now: 1,
                ..RemoteState::default()
            }),
            page_size: 50,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Store a record as the remote source would, stamping its update time.
    pub fn insert(&self, mut record: WorkspaceRecord) -> WorkspaceRecord {
        let mut state = self.state.lock();
        state.now += 1;
        if record.remote_updated_at == 0 {
            record.remote_updated_at = state.now;
        }
        state.tombstones.remove(&record.id);
        state.records.insert(record.id.clone(), record.clone());
        record
    }

    /// Delete a record remotely, leaving a tombstone.
    pub fn remove(&self, id: &str) {
        let mut state = self.state.lock();
        state.records.remove(id);
        state.tombstones.insert(id.to_string());
    }

    pub fn record(&self, id: &str) -> Option<WorkspaceRecord> {
        self.state.lock().records.get(id).cloned()
    }

    /// Set the remote clock used to stamp accepted writes.
    pub fn set_time(&self, now: Timestamp) {
        self.state.lock().now = now;
    }

    pub fn set_saved(&self, ids: impl IntoIterator<Item = impl Into<RecordId>>) {
        self.state.lock().saved = ids.into_iter().map(Into::into).collect();
    }

    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Answer the next push with `outcome` instead of applying it.
    pub fn script_push(&self, outcome: Result<PushOutcome, GatewayError>) {
        self.state.lock().scripted.push_back(outcome);
    }

    /// Every push received, in arrival order, including failed ones.
    pub fn pushes(&self) -> Vec<PendingMutation> {
        self.state.lock().pushes.clone()
    }

    /// Most pushes ever in progress at the same time.
    pub fn peak_pushes_in_flight(&self) -> usize {
        self.state.lock().peak_in_flight
    }

    /// Number of fetch calls received.
    pub fn fetch_count(&self) -> usize {
        self.state.lock().fetches
    }

    /// Common prologue of every call: latency, then connectivity.
    async fn reach(&self) -> Result<(), GatewayError> {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.state.lock().online {
            Ok(())
        } else {
            Err(GatewayError::NetworkUnavailable("remote unreachable".into()))
        }
    }

    fn apply(state: &mut RemoteState, mutation: &PendingMutation) -> PushOutcome {
        let current = state.records.get(&mutation.record_id).cloned();
        if let Some(current) = &current {
            if mutation.kind != MutationKind::Create
                && current.remote_updated_at > mutation.base_remote_at
            {
                return PushOutcome::Conflict {
                    remote: current.clone(),
                };
            }
        }

        match mutation.request().apply(current.as_ref()) {
            Ok(Some(mut next)) => {
                state.now += 1;
                next.remote_updated_at = state.now;
                // The saved flag is per user, not part of the shared record.
                next.saved = false;
                next.revision = 0;
                if mutation.patch.saved == Some(true) && !state.saved.contains(&next.id) {
                    state.saved.push(next.id.clone());
                } else if mutation.patch.saved == Some(false) {
                    state.saved.retain(|id| id != &next.id);
                }
                state.records.insert(next.id.clone(), next.clone());
                PushOutcome::Ack { record: Some(next) }
            }
            Ok(None) => {
                state.records.remove(&mutation.record_id);
                state.tombstones.insert(mutation.record_id.clone());
                PushOutcome::Ack { record: None }
            }
            Err(err) => PushOutcome::Rejected {
                reason: err.to_string(),
            },
        }
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    async fn fetch_by_bounds(
        &self,
        bounds: &BoundingBox,
        page_token: Option<&str>,
    ) -> Result<Page, GatewayError> {
        self.reach().await?;
        let offset = match page_token {
            None => 0,
            Some(token) => token.parse::<usize>().map_err(|_| GatewayError::Remote {
                code: 400,
                message: format!("bad page token {token}"),
            })?,
        };

        let mut state = self.state.lock();
        state.fetches += 1;
        let matching: Vec<WorkspaceRecord> = state
            .records
            .values()
            .filter(|r| bounds.contains(&r.coordinate))
            .cloned()
            .collect();
        let end = (offset + self.page_size).min(matching.len());
        let records = matching.get(offset..end).unwrap_or_default().to_vec();
        let next_page_token = (end < matching.len()).then(|| end.to_string());
        let tombstones = if offset == 0 {
            state.tombstones.iter().cloned().collect()
        } else {
            Vec::new()
        };

        Ok(Page {
            records,
            tombstones,
            next_page_token,
        })
    }

    async fn fetch_by_id(&self, id: &str) -> Result<Option<WorkspaceRecord>, GatewayError> {
        self.reach().await?;
        let mut state = self.state.lock();
        state.fetches += 1;
        Ok(state.records.get(id).cloned())
    }

    async fn push(&self, mutation: &PendingMutation) -> Result<PushOutcome, GatewayError> {
        let _in_flight = InFlight::enter(&self.state);
        let reached = self.reach().await;
        let mut state = self.state.lock();
        state.pushes.push(mutation.clone());
        reached?;
        if let Some(scripted) = state.scripted.pop_front() {
            return scripted;
        }
        Ok(Self::apply(&mut state, mutation))
    }

    async fn fetch_saved_ids(&self) -> Result<Vec<RecordId>, GatewayError> {
        self.reach().await?;
        Ok(self.state.lock().saved.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workspot_engine::{Coordinate, MutationPatch, MutationRequest};

    fn record(id: &str, lat: f64) -> WorkspaceRecord {
        WorkspaceRecord::new(id, Coordinate::new(lat, 9.0).unwrap(), format!("Spot {id}"))
    }

    #[tokio::test]
    async fn paginates_bounds_queries() {
        let gateway = MemoryGateway::new().with_page_size(2);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            gateway.insert(record(id, 45.0 + i as f64 * 0.01));
        }
        let bounds = BoundingBox::new(44.0, 8.0, 46.0, 10.0).unwrap();

        let first = gateway.fetch_by_bounds(&bounds, None).await.unwrap();
        assert_eq!(first.records.len(), 2);
        let token = first.next_page_token.unwrap();
        let second = gateway.fetch_by_bounds(&bounds, Some(&token)).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert!(second.next_page_token.is_none());
    }

    #[tokio::test]
    async fn stale_base_conflicts() {
        let gateway = MemoryGateway::new();
        let stored = gateway.insert(record("a", 45.0));

        let fresh = PendingMutation::new(
            "m1",
            MutationRequest::update("a", MutationPatch::saved(true)),
            10,
            Some(stored.clone()),
        );
        let outcome = gateway.push(&fresh).await.unwrap();
        assert!(matches!(outcome, PushOutcome::Ack { record: Some(_) }));

        // Same base again: the remote has moved on.
        let stale = PendingMutation::new(
            "m2",
            MutationRequest::update("a", MutationPatch::saved(false)),
            20,
            Some(stored),
        );
        let outcome = gateway.push(&stale).await.unwrap();
        assert!(matches!(outcome, PushOutcome::Conflict { .. }));
        assert_eq!(gateway.pushes().len(), 2);
    }

    #[tokio::test]
    async fn offline_calls_fail_retryably() {
        let gateway = MemoryGateway::new();
        gateway.set_online(false);
        assert!(matches!(
            gateway.fetch_by_id("a").await,
            Err(GatewayError::NetworkUnavailable(_))
        ));
    }
}
