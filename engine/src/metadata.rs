//! Per-record sync metadata.

use crate::{PendingMutation, RecordId, Revision, Timestamp, WorkspaceRecord};
use serde::{Deserialize, Serialize};

/// Both sides of a divergence, kept until the caller resolves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSnapshots {
    /// Local state, `None` if the local side deleted the record
    pub local: Option<WorkspaceRecord>,
    pub remote: WorkspaceRecord,
    /// Local mutations set aside while the conflict is open
    #[serde(default)]
    pub parked: Vec<PendingMutation>,
}

/// Where a record stands relative to the remote source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SyncState {
    #[default]
    Clean,
    PendingPush,
    PendingPull,
    Conflict(Box<ConflictSnapshots>),
    /// A mutation ran out of retries or hit a fatal remote error. The local
    /// state is kept as it was; later mutations for the record wait in
    /// `parked` so they never overtake it.
    Failed {
        mutation: Box<PendingMutation>,
        #[serde(default)]
        parked: Vec<PendingMutation>,
    },
}

impl SyncState {
    pub fn is_clean(&self) -> bool {
        matches!(self, SyncState::Clean)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncState::Conflict(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SyncState::Failed { .. })
    }

    /// Conflict and Failed hold local writes back until the caller acts.
    pub fn needs_attention(&self) -> bool {
        self.is_conflict() || self.is_failed()
    }

    pub fn label(&self) -> &'static str {
        match self {
            SyncState::Clean => "clean",
            SyncState::PendingPush => "pendingPush",
            SyncState::PendingPull => "pendingPull",
            SyncState::Conflict(_) => "conflict",
            SyncState::Failed { .. } => "failed",
        }
    }
}

/// Sync bookkeeping for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub record_id: RecordId,
    pub state: SyncState,
    /// Last successful sync, `None` if never synced
    pub last_synced_at: Option<Timestamp>,
    /// Record revision at the last successful sync
    #[serde(default)]
    pub synced_revision: Revision,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SyncMetadata {
    /// Metadata for a record that has never been synced.
    pub fn new(record_id: impl Into<RecordId>) -> Self {
        Self {
            record_id: record_id.into(),
            state: SyncState::Clean,
            last_synced_at: None,
            synced_revision: 0,
            retry_count: 0,
            last_error: None,
        }
    }

    /// A record is stale when it was never synced or its last sync is older
    /// than the freshness window.
    pub fn is_stale(&self, now: Timestamp, freshness_window_ms: u64) -> bool {
        match self.last_synced_at {
            None => true,
            Some(synced) => now.saturating_sub(synced) > freshness_window_ms,
        }
    }

    /// Whether the record was written locally after the last sync.
    pub fn has_local_writes(&self, record: &WorkspaceRecord) -> bool {
        record.revision > self.synced_revision
    }

    /// Mark a successful sync at `now` against `revision`.
    pub fn mark_synced(&mut self, now: Timestamp, revision: Revision) {
        self.state = SyncState::Clean;
        self.last_synced_at = Some(now);
        self.synced_revision = revision;
        self.retry_count = 0;
        self.last_error = None;
    }

    /// Record a failed attempt without changing the state.
    pub fn note_retry(&mut self, error: impl Into<String>) {
        self.retry_count += 1;
        self.last_error = Some(error.into());
    }
}
