//! # WorkSpot Engine
//!
//! Deterministic rules for an offline-first cache of shared workspaces.
//!
//! This crate holds the logic that decides what the local cache should look
//! like after a remote fetch, a local edit or a push attempt. It never
//! performs IO: storage, networking and scheduling live in `workspot-sync`.
//! The same inputs always produce the same outputs.
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`WorkspaceRecord`] is a workspace with a validated [`Coordinate`],
//! server-authoritative attributes (name, amenities, [`Availability`]) and a
//! local-only saved flag. Each record has a [`SyncMetadata`] companion that
//! tracks its [`SyncState`].
//!
//! ### Mutations
//!
//! Local edits are [`MutationRequest`]s. Once applied optimistically they
//! become [`PendingMutation`]s in a [`MutationQueue`], which keeps per-record
//! FIFO order and lets a queued delete cancel everything behind it.
//!
//! ### Merging
//!
//! [`merge_pull`] folds a remote record into the local copy; the remote wins
//! for shared fields unless unsynced local writes exist.
//! [`resolve_push_conflict`] applies last-write-wins to a rejected push and
//! reports a conflict when the remote side is newer.
//!
//! ### Spatial queries
//!
//! [`SpatialIndex`] is an R\*-tree over record coordinates answering box and
//! radius queries, sorted by great-circle distance.
//!
//! ## Quick Start
//!
//! ```rust
//! use workspot_engine::{
//!     Coordinate, MutationPatch, MutationQueue, MutationRequest, PendingMutation,
//!     SpatialIndex, WorkspaceRecord,
//! };
//!
//! let record = WorkspaceRecord::new("ws-1", Coordinate::new(45.46, 9.19).unwrap(), "Cowork");
//!
//! let index = SpatialIndex::bulk_load([(record.id.clone(), record.coordinate)]);
//! let near = index.nearby(Coordinate::new(45.46, 9.19).unwrap(), 500.0).unwrap();
//! assert_eq!(near[0].id, "ws-1");
//!
//! let request = MutationRequest::update("ws-1", MutationPatch::saved(true));
//! let saved = request.apply(Some(&record)).unwrap().unwrap();
//! assert!(saved.saved);
//!
//! let mut queue = MutationQueue::new();
//! queue.enqueue(PendingMutation::new("m-1", request, 1_000, Some(record)));
//! assert_eq!(queue.len(), 1);
//! ```

pub mod backoff;
pub mod coordinate;
pub mod coverage;
pub mod error;
pub mod merge;
pub mod metadata;
pub mod mutation;
pub mod queue;
pub mod record;
pub mod spatial;

// Re-export main types at crate root
pub use backoff::RetryPolicy;
pub use coordinate::{BoundingBox, Coordinate, EARTH_RADIUS_M};
pub use coverage::Coverage;
pub use error::Error;
pub use merge::{merge_pull, resolve_push_conflict, revert_rejected, PullOutcome, PushResolution};
pub use metadata::{ConflictSnapshots, SyncMetadata, SyncState};
pub use mutation::{MutationId, MutationKind, MutationPatch, MutationRequest, PendingMutation};
pub use queue::{Enqueued, MutationQueue};
pub use record::{Amenities, Availability, WorkspaceRecord};
pub use spatial::{Neighbor, SpatialIndex, SpatialIndexEntry};

/// Type aliases for clarity
pub type RecordId = String;
pub type Timestamp = u64;
pub type Revision = u64;
