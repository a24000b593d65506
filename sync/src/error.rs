//! Unified error handling for the sync runtime.

use crate::gateway::GatewayError;
use workspot_engine::{ConflictSnapshots, MutationId, RecordId};

/// Errors surfaced to callers of the sync runtime.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("record not found: {0}")]
    NotFound(RecordId),

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("remote error {code}: {message}")]
    Remote { code: u16, message: String },

    #[error("rejected by remote: {0}")]
    Rejected(String),

    #[error("conflict on record {}", .0.remote.id)]
    Conflict(Box<ConflictSnapshots>),

    #[error("validation failed: {0}")]
    Validation(workspot_engine::Error),

    #[error("mutation {mutation_id} failed after {attempts} attempts: {reason}")]
    Failed {
        mutation_id: MutationId,
        attempts: u32,
        reason: String,
    },

    #[error("mutation cancelled by queued delete {by}")]
    Superseded { by: MutationId },

    #[error("record {id} is not in {expected} state")]
    UnexpectedState { id: RecordId, expected: &'static str },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sync engine is shut down")]
    ShutDown,
}

impl SyncError {
    /// Whether the failure may go away on its own (connectivity).
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::NetworkUnavailable(_))
    }
}

impl From<workspot_engine::Error> for SyncError {
    fn from(err: workspot_engine::Error) -> Self {
        match err {
            workspot_engine::Error::RecordNotFound(id) => SyncError::NotFound(id),
            other => SyncError::Validation(other),
        }
    }
}

impl From<GatewayError> for SyncError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NetworkUnavailable(reason) => SyncError::NetworkUnavailable(reason),
            GatewayError::Remote { code, message } => SyncError::Remote { code, message },
        }
    }
}

/// Result type alias for the sync runtime.
pub type Result<T> = std::result::Result<T, SyncError>;
