//! Merge rules between local and remote state.
//!
//! # Pull
//!
//! The remote side is authoritative for every shared field; the local saved
//! flag survives. When the record carries local writes newer than its last
//! sync and mutations are still queued, the push rule decides instead of a
//! blind overwrite.
//!
//! # Push
//!
//! Last write wins on timestamps: a remote update newer than the local
//! mutation's enqueue time is a conflict that must be surfaced with both
//! snapshots. Reservations are not safely mergeable, so nothing is resolved
//! automatically in that case.

use crate::{
    error::Result, metadata::ConflictSnapshots, PendingMutation, SyncMetadata, SyncState,
    Timestamp, WorkspaceRecord,
};

/// Result of merging a pulled remote record.
#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome {
    /// Store this record and mark it synced.
    Merged(WorkspaceRecord),
    /// Local writes are at least as new; keep local state and queue.
    KeptLocal,
    /// Remote changed after the local writes were made.
    Conflict(ConflictSnapshots),
}

/// Decision for a push that the remote answered with a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResolution {
    /// Local write is newer: push again against this remote version.
    Rebase { base_remote_at: Timestamp },
    /// Remote is newer: surface the divergence.
    Conflict,
}

/// Merge a pulled remote record into the local state.
///
/// `pending` must hold the queued mutations for the record in queue order.
pub fn merge_pull(
    local: Option<&WorkspaceRecord>,
    meta: Option<&SyncMetadata>,
    pending: &[&PendingMutation],
    remote: &WorkspaceRecord,
) -> Result<PullOutcome> {
    remote.validate()?;

    if meta.is_some_and(|m| m.state.needs_attention()) {
        return Ok(PullOutcome::KeptLocal);
    }

    if let Some(oldest) = pending.first() {
        let dirty = match (local, meta) {
            (Some(local), Some(meta)) => meta.has_local_writes(local),
            // Pending mutations without metadata or without a local copy
            // (a queued delete) are local writes by definition.
            _ => true,
        };
        if dirty {
            return Ok(if remote.remote_updated_at > oldest.enqueued_at {
                PullOutcome::Conflict(ConflictSnapshots {
                    local: local.cloned(),
                    remote: remote.clone(),
                    parked: Vec::new(),
                })
            } else {
                PullOutcome::KeptLocal
            });
        }
    }

    let merged = match local {
        Some(local) => {
            let mut merged = local.clone();
            merged.adopt_remote(remote)?;
            merged
        }
        None => {
            let mut fresh = remote.clone();
            fresh.saved = false;
            fresh.revision = 0;
            fresh
        }
    };
    Ok(PullOutcome::Merged(merged))
}

/// Apply the last-write-wins rule to a conflicting push.
pub fn resolve_push_conflict(
    mutation: &PendingMutation,
    remote: &WorkspaceRecord,
) -> PushResolution {
    if remote.remote_updated_at > mutation.enqueued_at {
        PushResolution::Conflict
    } else {
        PushResolution::Rebase {
            base_remote_at: remote.remote_updated_at,
        }
    }
}

/// Local state after the remote rejected `rejected`: its base snapshot with
/// every later queued mutation for the record applied on top.
///
/// Later mutations that no longer apply (an update over a rejected create)
/// are skipped.
pub fn revert_rejected(
    rejected: &PendingMutation,
    later: &[&PendingMutation],
) -> Option<WorkspaceRecord> {
    let mut state = rejected.base.clone();
    for mutation in later {
        if let Ok(next) = mutation.request().apply(state.as_ref()) {
            state = next;
        }
    }
    state
}

/// Metadata state after the head mutation of a record settled.
pub fn state_after_push(remaining: usize) -> SyncState {
    if remaining == 0 {
        SyncState::Clean
    } else {
        SyncState::PendingPush
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Availability, Coordinate, MutationPatch, MutationRequest};
    use serde_json::json;

    fn remote(updated_at: Timestamp) -> WorkspaceRecord {
        WorkspaceRecord::new("ws-1", Coordinate::new(45.46, 9.19).unwrap(), "Cowork")
            .with_availability(Availability::Full)
            .with_amenity("capacity", json!(12))
            .with_remote_updated_at(updated_at)
    }

    fn local() -> WorkspaceRecord {
        let mut record =
            WorkspaceRecord::new("ws-1", Coordinate::new(45.46, 9.19).unwrap(), "Cowork")
                .with_availability(Availability::Open);
        record.saved = true;
        record.revision = 2;
        record
    }

    fn synced_meta(revision: u64) -> SyncMetadata {
        let mut meta = SyncMetadata::new("ws-1");
        meta.mark_synced(100, revision);
        meta
    }

    fn pending(at: Timestamp) -> PendingMutation {
        PendingMutation::new(
            "m-1",
            MutationRequest::update("ws-1", MutationPatch::saved(false)),
            at,
            Some(local()),
        )
    }

    #[test]
    fn remote_wins_server_fields_and_keeps_saved() {
        let meta = synced_meta(2);
        let outcome = merge_pull(Some(&local()), Some(&meta), &[], &remote(500)).unwrap();
        let PullOutcome::Merged(merged) = outcome else {
            panic!("expected merge, got {outcome:?}");
        };
        assert_eq!(merged.availability, Availability::Full);
        assert_eq!(merged.amenities["capacity"], json!(12));
        assert!(merged.saved);
    }

    #[test]
    fn pull_merge_is_idempotent() {
        let meta = synced_meta(2);
        let PullOutcome::Merged(once) =
            merge_pull(Some(&local()), Some(&meta), &[], &remote(500)).unwrap()
        else {
            panic!("expected merge");
        };
        let PullOutcome::Merged(twice) =
            merge_pull(Some(&once), Some(&meta), &[], &remote(500)).unwrap()
        else {
            panic!("expected merge");
        };
        assert_eq!(once, twice);
    }

    #[test]
    fn new_remote_record_starts_unsaved() {
        let mut incoming = remote(10);
        incoming.saved = true;
        let PullOutcome::Merged(merged) = merge_pull(None, None, &[], &incoming).unwrap() else {
            panic!("expected merge");
        };
        assert!(!merged.saved);
    }

    #[test]
    fn newer_remote_over_local_writes_is_conflict() {
        let meta = synced_meta(1);
        let mutation = pending(300);
        let outcome =
            merge_pull(Some(&local()), Some(&meta), &[&mutation], &remote(400)).unwrap();
        match outcome {
            PullOutcome::Conflict(snapshots) => {
                assert_eq!(snapshots.local, Some(local()));
                assert_eq!(snapshots.remote, remote(400));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn older_remote_keeps_local_writes() {
        let meta = synced_meta(1);
        let mutation = pending(300);
        let outcome =
            merge_pull(Some(&local()), Some(&meta), &[&mutation], &remote(200)).unwrap();
        assert_eq!(outcome, PullOutcome::KeptLocal);
    }

    #[test]
    fn open_conflict_is_left_alone() {
        let mut meta = synced_meta(1);
        meta.state = SyncState::Conflict(Box::new(ConflictSnapshots {
            local: Some(local()),
            remote: remote(1),
            parked: vec![],
        }));
        let outcome = merge_pull(Some(&local()), Some(&meta), &[], &remote(900)).unwrap();
        assert_eq!(outcome, PullOutcome::KeptLocal);
    }

    #[test]
    fn failed_record_is_left_alone() {
        let mut meta = synced_meta(1);
        meta.state = SyncState::Failed {
            mutation: Box::new(pending(300)),
            parked: vec![],
        };
        let outcome = merge_pull(Some(&local()), Some(&meta), &[], &remote(900)).unwrap();
        assert_eq!(outcome, PullOutcome::KeptLocal);
    }

    #[test]
    fn invalid_remote_is_rejected() {
        let mut bad = remote(1);
        bad.coordinate = Coordinate { lat: 95.0, lon: 0.0 };
        assert!(merge_pull(None, None, &[], &bad).is_err());
    }

    #[test]
    fn push_conflict_last_write_wins() {
        let mutation = pending(300);
        assert_eq!(
            resolve_push_conflict(&mutation, &remote(301)),
            PushResolution::Conflict
        );
        assert_eq!(
            resolve_push_conflict(&mutation, &remote(300)),
            PushResolution::Rebase { base_remote_at: 300 }
        );
    }

    #[test]
    fn revert_replays_later_mutations() {
        let base = local();
        let rejected = PendingMutation::new(
            "m-1",
            MutationRequest::update(
                "ws-1",
                MutationPatch {
                    name: Some("Renamed".into()),
                    ..MutationPatch::default()
                },
            ),
            10,
            Some(base.clone()),
        );
        let later = PendingMutation::new(
            "m-2",
            MutationRequest::update("ws-1", MutationPatch::saved(false)),
            20,
            None,
        );

        let reverted = revert_rejected(&rejected, &[&later]).unwrap();
        assert_eq!(reverted.name, "Cowork");
        assert!(!reverted.saved);
    }

    #[test]
    fn revert_of_rejected_create_removes_record() {
        let create = PendingMutation::new("m-1", MutationRequest::create(&local()), 10, None);
        let later = PendingMutation::new(
            "m-2",
            MutationRequest::update("ws-1", MutationPatch::saved(false)),
            20,
            None,
        );
        assert_eq!(revert_rejected(&create, &[&later]), None);
    }

    #[test]
    fn state_after_push_depends_on_queue() {
        assert_eq!(state_after_push(0), SyncState::Clean);
        assert_eq!(state_after_push(2), SyncState::PendingPush);
    }
}
