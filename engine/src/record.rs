//! Workspace records.

use crate::{error::Result, Coordinate, Error, RecordId, Revision, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attribute map for capacity and amenities (`"capacity" -> 12`, `"wifi" -> true`).
pub type Amenities = BTreeMap<String, serde_json::Value>;

/// Current availability of a workspace as reported by the remote source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Open,
    Full,
    Closed,
    #[default]
    Unknown,
}

/// A shared workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRecord {
    /// Stable, globally unique identifier
    pub id: RecordId,
    pub coordinate: Coordinate,
    pub name: String,
    #[serde(default)]
    pub address: String,
    /// Open-air spot rather than an indoor venue
    #[serde(default)]
    pub outdoor: bool,
    #[serde(default)]
    pub amenities: Amenities,
    #[serde(default)]
    pub availability: Availability,
    /// Saved by the local user. Never taken from the remote side.
    #[serde(default)]
    pub saved: bool,
    /// Last update on the remote side (milliseconds since epoch)
    #[serde(default)]
    pub remote_updated_at: Timestamp,
    /// Local revision counter, bumped on every content change in the store
    #[serde(default)]
    pub revision: Revision,
}

impl WorkspaceRecord {
    /// Create a record with default attributes.
    pub fn new(id: impl Into<RecordId>, coordinate: Coordinate, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            coordinate,
            name: name.into(),
            address: String::new(),
            outdoor: false,
            amenities: Amenities::new(),
            availability: Availability::Unknown,
            saved: false,
            remote_updated_at: 0,
            revision: 0,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_availability(mut self, availability: Availability) -> Self {
        self.availability = availability;
        self
    }

    pub fn with_amenity(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.amenities.insert(key.into(), value);
        self
    }

    pub fn with_remote_updated_at(mut self, timestamp: Timestamp) -> Self {
        self.remote_updated_at = timestamp;
        self
    }

    /// Reject records that must never reach storage.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidRecord("id must not be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(Error::InvalidRecord(format!(
                "record {} has an empty name",
                self.id
            )));
        }
        self.coordinate.validate()
    }

    /// Compare everything except the revision counter.
    pub fn same_content(&self, other: &WorkspaceRecord) -> bool {
        self.id == other.id
            && self.coordinate == other.coordinate
            && self.name == other.name
            && self.address == other.address
            && self.outdoor == other.outdoor
            && self.amenities == other.amenities
            && self.availability == other.availability
            && self.saved == other.saved
            && self.remote_updated_at == other.remote_updated_at
    }

    /// Overwrite the server-authoritative fields with `remote`, keeping the
    /// local-only ones.
    pub fn adopt_remote(&mut self, remote: &WorkspaceRecord) -> Result<()> {
        if remote.id != self.id {
            return Err(Error::ImmutableId {
                expected: self.id.clone(),
                actual: remote.id.clone(),
            });
        }
        self.coordinate = remote.coordinate;
        self.name = remote.name.clone();
        self.address = remote.address.clone();
        self.outdoor = remote.outdoor;
        self.amenities = remote.amenities.clone();
        self.availability = remote.availability;
        self.remote_updated_at = remote.remote_updated_at;
        Ok(())
    }
}
