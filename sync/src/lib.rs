//! # WorkSpot Sync
//!
//! Offline-first cache and sync runtime for WorkSpot clients.
//!
//! The runtime keeps a local copy of nearby workspaces so that reads never
//! wait on the network, applies edits locally right away and pushes them to
//! the remote source in the background. The rules for merging and conflict
//! detection live in `workspot-engine`; this crate adds storage, networking
//! and scheduling around them.
//!
//! ## Components
//!
//! - [`LocalStore`]: durable records, sync metadata and the mutation queue,
//!   behind a [`StorageBackend`] (SQLite or in-memory).
//! - [`RemoteGateway`]: the remote source. [`HttpGateway`] talks to the
//!   WorkSpot API. With the `testing` feature, `MemoryGateway` simulates it.
//! - [`SyncEngine`]: pulls stale regions, drains the mutation queue and
//!   surfaces conflicts and failures.
//! - [`QueryCache`]: in-memory spatial index kept in step with the store.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use workspot_engine::Coordinate;
//! use workspot_sync::{HttpGateway, LocalStore, SqliteBackend, SyncConfig, SyncEngine};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::default();
//! let backend = SqliteBackend::connect("sqlite://workspot.db").await?;
//! let store = Arc::new(LocalStore::open(Arc::new(backend)).await?);
//! let gateway = Arc::new(HttpGateway::new("https://api.workspot.example/", config.remote_timeout)?);
//! let engine = SyncEngine::start(store, gateway, config);
//!
//! let nearby = engine.nearby(Coordinate::new(45.4642, 9.19)?, 1_000.0).await?;
//! println!("{} workspaces nearby", nearby.len());
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod status;
pub mod store;

pub use cache::QueryCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClientConfig, ConfigError, SyncConfig};
pub use engine::{MutationTicket, Resolution, SyncEngine};
pub use error::{Result, SyncError};
#[cfg(any(test, feature = "testing"))]
pub use gateway::MemoryGateway;
pub use gateway::{GatewayError, HttpGateway, Page, PushOutcome, RemoteGateway};
pub use status::StatusHub;
pub use store::{
    ChangeObserver, LocalStore, MemoryBackend, RecordLock, SqliteBackend, StorageBackend,
    StoreChange,
};
