//! Remote Gateway: the boundary to the authoritative workspace source.
//!
//! Implementations never retry; scheduling retries is the sync engine's job.

mod http;
#[cfg(any(test, feature = "testing"))]
mod memory;

pub use http::HttpGateway;
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryGateway;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use workspot_engine::{BoundingBox, PendingMutation, RecordId, WorkspaceRecord};

/// One page of a bounding-box fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    #[serde(default)]
    pub records: Vec<WorkspaceRecord>,
    /// Ids the remote source has deleted
    #[serde(default)]
    pub tombstones: Vec<RecordId>,
    /// Token for the next page, absent on the last one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// How the remote source answered a pushed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum PushOutcome {
    /// Applied. Carries the resulting remote record unless it was deleted.
    Ack { record: Option<WorkspaceRecord> },
    /// Refused for good; the local change must be reverted.
    Rejected { reason: String },
    /// The remote record moved on since the mutation's base.
    Conflict { remote: WorkspaceRecord },
}

/// Gateway failure modes.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// No connectivity or the call timed out. Retryable.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The remote answered with an error. Not retryable.
    #[error("remote error {code}: {message}")]
    Remote { code: u16, message: String },
}

/// Remote data source.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Records inside `bounds`, one page at a time. Pass the previous page's
    /// token to continue.
    async fn fetch_by_bounds(
        &self,
        bounds: &BoundingBox,
        page_token: Option<&str>,
    ) -> Result<Page, GatewayError>;

    /// A single record, `None` if the remote has no such id.
    async fn fetch_by_id(&self, id: &str) -> Result<Option<WorkspaceRecord>, GatewayError>;

    async fn push(&self, mutation: &PendingMutation) -> Result<PushOutcome, GatewayError>;

    /// Ids the user saved on the remote side.
    async fn fetch_saved_ids(&self) -> Result<Vec<RecordId>, GatewayError> {
        Ok(Vec::new())
    }
}
