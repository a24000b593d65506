//! Error types for the WorkSpot engine.

use crate::RecordId;
use thiserror::Error;

/// All possible errors from the engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Validation errors
    #[error("invalid coordinate: latitude {lat}, longitude {lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },

    #[error("invalid radius: {0} meters")]
    InvalidRadius(f64),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    // State errors
    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("record already exists: {0}")]
    RecordAlreadyExists(RecordId),

    #[error("record id is immutable: expected {expected}, got {actual}")]
    ImmutableId { expected: RecordId, actual: RecordId },

    #[error("mutation targets {actual} but was applied to {expected}")]
    MutationTargetMismatch { expected: RecordId, actual: RecordId },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
