//! Shared fixtures for the sync integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use workspot_engine::{Coordinate, MutationPatch, WorkspaceRecord};
use workspot_sync::{LocalStore, ManualClock, MemoryGateway, SyncConfig, SyncEngine};

/// Local clock start. Remote timestamps in the tests stay far below it
/// unless a test moves the remote clock on purpose.
pub const START: u64 = 1_000_000;

pub fn milan() -> Coordinate {
    Coordinate::new(45.4642, 9.1900).unwrap()
}

pub fn record(id: &str, lat: f64, lon: f64) -> WorkspaceRecord {
    WorkspaceRecord::new(id, Coordinate::new(lat, lon).unwrap(), format!("Spot {id}"))
}

/// Three workspaces around the Duomo plus one in Bergamo.
pub fn seed(gateway: &MemoryGateway) {
    gateway.insert(record("castello", 45.4705, 9.1795));
    gateway.insert(record("duomo", 45.4642, 9.1900));
    gateway.insert(record("galleria", 45.4659, 9.1900));
    gateway.insert(record("bergamo", 45.6983, 9.6773));
}

pub fn rename(name: &str) -> MutationPatch {
    MutationPatch {
        name: Some(name.to_string()),
        ..MutationPatch::default()
    }
}

pub fn config() -> SyncConfig {
    SyncConfig {
        freshness_window: Duration::from_secs(60),
        max_retry_count: 50,
        backoff_base: Duration::from_millis(5),
        backoff_cap: Duration::from_millis(20),
        pull_concurrency_limit: 2,
        push_concurrency_limit: 4,
        remote_timeout: Duration::from_millis(300),
        eviction_ttl: Duration::from_secs(3_600),
    }
}

pub struct Harness {
    pub engine: SyncEngine,
    pub gateway: Arc<MemoryGateway>,
    pub clock: Arc<ManualClock>,
}

pub async fn harness() -> Harness {
    harness_with(config()).await
}

pub async fn harness_with(config: SyncConfig) -> Harness {
    let store = Arc::new(LocalStore::in_memory().await.unwrap());
    let gateway = Arc::new(MemoryGateway::new());
    seed(&gateway);
    let clock = Arc::new(ManualClock::new(START));
    let engine = SyncEngine::start_with_clock(store, gateway.clone(), config, clock.clone());
    Harness {
        engine,
        gateway,
        clock,
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait for a future, failing the test after five seconds.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}
