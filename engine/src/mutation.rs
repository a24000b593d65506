//! Local mutations.
//!
//! UI writes are expressed as mutations, not direct record edits. A mutation
//! is applied optimistically to the local copy, queued, and later pushed to
//! the remote source.

use crate::{
    error::Result, Availability, Coordinate, Error, RecordId, Timestamp, WorkspaceRecord,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a mutation.
pub type MutationId = String;

/// What a mutation does to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    /// A reservation request, applied like an update locally.
    Reserve,
}

/// Field-level diff carried by a mutation. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinate: Option<Coordinate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outdoor: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability: Option<Availability>,
    /// Amenity changes: `Some(value)` sets, `None` removes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub amenities: BTreeMap<String, Option<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved: Option<bool>,
}

impl MutationPatch {
    /// Patch that recreates every field of `record`.
    pub fn from_record(record: &WorkspaceRecord) -> Self {
        Self {
            name: Some(record.name.clone()),
            address: Some(record.address.clone()),
            coordinate: Some(record.coordinate),
            outdoor: Some(record.outdoor),
            availability: Some(record.availability),
            amenities: record
                .amenities
                .iter()
                .map(|(k, v)| (k.clone(), Some(v.clone())))
                .collect(),
            saved: Some(record.saved),
        }
    }

    pub fn saved(saved: bool) -> Self {
        Self {
            saved: Some(saved),
            ..Self::default()
        }
    }

    fn apply_to(&self, record: &mut WorkspaceRecord) {
        if let Some(name) = &self.name {
            record.name = name.clone();
        }
        if let Some(address) = &self.address {
            record.address = address.clone();
        }
        if let Some(coordinate) = self.coordinate {
            record.coordinate = coordinate;
        }
        if let Some(outdoor) = self.outdoor {
            record.outdoor = outdoor;
        }
        if let Some(availability) = self.availability {
            record.availability = availability;
        }
        for (key, value) in &self.amenities {
            match value {
                Some(value) => {
                    record.amenities.insert(key.clone(), value.clone());
                }
                None => {
                    record.amenities.remove(key);
                }
            }
        }
        if let Some(saved) = self.saved {
            record.saved = saved;
        }
    }
}

/// A mutation as submitted by the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    pub record_id: RecordId,
    pub kind: MutationKind,
    #[serde(default)]
    pub patch: MutationPatch,
}

impl MutationRequest {
    pub fn create(record: &WorkspaceRecord) -> Self {
        Self {
            record_id: record.id.clone(),
            kind: MutationKind::Create,
            patch: MutationPatch::from_record(record),
        }
    }

    pub fn update(record_id: impl Into<RecordId>, patch: MutationPatch) -> Self {
        Self {
            record_id: record_id.into(),
            kind: MutationKind::Update,
            patch,
        }
    }

    pub fn reserve(record_id: impl Into<RecordId>, patch: MutationPatch) -> Self {
        Self {
            record_id: record_id.into(),
            kind: MutationKind::Reserve,
            patch,
        }
    }

    pub fn delete(record_id: impl Into<RecordId>) -> Self {
        Self {
            record_id: record_id.into(),
            kind: MutationKind::Delete,
            patch: MutationPatch::default(),
        }
    }

    /// Compute the record state after this mutation.
    ///
    /// Returns `None` when the mutation deletes the record.
    pub fn apply(&self, base: Option<&WorkspaceRecord>) -> Result<Option<WorkspaceRecord>> {
        if let Some(base) = base {
            if base.id != self.record_id {
                return Err(Error::MutationTargetMismatch {
                    expected: base.id.clone(),
                    actual: self.record_id.clone(),
                });
            }
        }

        match self.kind {
            MutationKind::Create => {
                if base.is_some() {
                    return Err(Error::RecordAlreadyExists(self.record_id.clone()));
                }
                let (Some(name), Some(coordinate)) = (&self.patch.name, self.patch.coordinate)
                else {
                    return Err(Error::InvalidRecord(format!(
                        "create of {} needs a name and a coordinate",
                        self.record_id
                    )));
                };
                let mut record = WorkspaceRecord::new(self.record_id.clone(), coordinate, name);
                self.patch.apply_to(&mut record);
                record.validate()?;
                Ok(Some(record))
            }
            MutationKind::Update | MutationKind::Reserve => {
                let mut record = base
                    .cloned()
                    .ok_or_else(|| Error::RecordNotFound(self.record_id.clone()))?;
                self.patch.apply_to(&mut record);
                record.validate()?;
                Ok(Some(record))
            }
            MutationKind::Delete => {
                if base.is_none() {
                    return Err(Error::RecordNotFound(self.record_id.clone()));
                }
                Ok(None)
            }
        }
    }
}

/// A mutation waiting in the queue to be pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub mutation_id: MutationId,
    pub record_id: RecordId,
    pub kind: MutationKind,
    pub patch: MutationPatch,
    /// When the mutation was queued (milliseconds since epoch)
    pub enqueued_at: Timestamp,
    /// Queue position, assigned on enqueue
    #[serde(default)]
    pub seq: u64,
    /// Record state before the mutation was applied locally
    #[serde(default)]
    pub base: Option<WorkspaceRecord>,
    /// Remote version the mutation was written against
    #[serde(default)]
    pub base_remote_at: Timestamp,
}

impl PendingMutation {
    pub fn new(
        mutation_id: impl Into<MutationId>,
        request: MutationRequest,
        enqueued_at: Timestamp,
        base: Option<WorkspaceRecord>,
    ) -> Self {
        let base_remote_at = base.as_ref().map_or(0, |b| b.remote_updated_at);
        Self {
            mutation_id: mutation_id.into(),
            record_id: request.record_id,
            kind: request.kind,
            patch: request.patch,
            enqueued_at,
            seq: 0,
            base,
            base_remote_at,
        }
    }

    /// The request this mutation was built from.
    pub fn request(&self) -> MutationRequest {
        MutationRequest {
            record_id: self.record_id.clone(),
            kind: self.kind,
            patch: self.patch.clone(),
        }
    }

    pub fn is_delete(&self) -> bool {
        self.kind == MutationKind::Delete
    }
}
