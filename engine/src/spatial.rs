//! In-memory spatial index over record coordinates.
//!
//! Entries live in an R\*-tree keyed by `[lon, lat]`. Range queries use the
//! tree envelope search; radius queries search the circle's bounding boxes
//! (two when it crosses the antimeridian) and then filter on exact
//! great-circle distance.

use crate::{error::Result, BoundingBox, Coordinate, RecordId};
use rstar::{RTree, RTreeObject, AABB};
use std::collections::HashMap;

/// (record id, coordinate) pair stored in the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialIndexEntry {
    pub id: RecordId,
    pub coordinate: Coordinate,
}

impl RTreeObject for SpatialIndexEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.coordinate.lon, self.coordinate.lat])
    }
}

/// A record id with its distance from a query center.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: RecordId,
    pub distance_m: f64,
}

/// R\*-tree plus an id lookup so single entries can be moved or removed.
#[derive(Debug, Default)]
pub struct SpatialIndex {
    tree: RTree<SpatialIndexEntry>,
    positions: HashMap<RecordId, Coordinate>,
}

impl SpatialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index in one pass.
    pub fn bulk_load(entries: impl IntoIterator<Item = (RecordId, Coordinate)>) -> Self {
        let positions: HashMap<RecordId, Coordinate> = entries.into_iter().collect();
        let tree = RTree::bulk_load(
            positions
                .iter()
                .map(|(id, coordinate)| SpatialIndexEntry {
                    id: id.clone(),
                    coordinate: *coordinate,
                })
                .collect(),
        );
        Self { tree, positions }
    }

    /// Insert a record or move it to a new coordinate.
    pub fn upsert(&mut self, id: &str, coordinate: Coordinate) {
        if let Some(old) = self.positions.get(id) {
            if *old == coordinate {
                return;
            }
            self.tree.remove(&SpatialIndexEntry {
                id: id.to_string(),
                coordinate: *old,
            });
        }
        self.positions.insert(id.to_string(), coordinate);
        self.tree.insert(SpatialIndexEntry {
            id: id.to_string(),
            coordinate,
        });
    }

    /// Remove a record. Returns whether it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.positions.remove(id) {
            Some(coordinate) => {
                self.tree.remove(&SpatialIndexEntry {
                    id: id.to_string(),
                    coordinate,
                });
                true
            }
            None => false,
        }
    }

    /// Ids inside `bounds`, sorted.
    pub fn within_bounds(&self, bounds: &BoundingBox) -> Vec<RecordId> {
        let (lower, upper) = bounds.corners();
        let envelope = AABB::from_corners(lower, upper);
        let mut ids: Vec<RecordId> = self
            .tree
            .locate_in_envelope(&envelope)
            .map(|entry| entry.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Records within `radius_m` meters of `center`, nearest first; equal
    /// distances are ordered by id.
    pub fn nearby(&self, center: Coordinate, radius_m: f64) -> Result<Vec<Neighbor>> {
        let mut neighbors: Vec<Neighbor> = Vec::new();
        for bounds in BoundingBox::regions_around(center, radius_m)? {
            let (lower, upper) = bounds.corners();
            let envelope = AABB::from_corners(lower, upper);
            neighbors.extend(self.tree.locate_in_envelope(&envelope).filter_map(|entry| {
                let distance_m = center.distance_to(&entry.coordinate);
                (distance_m <= radius_m).then(|| Neighbor {
                    id: entry.id.clone(),
                    distance_m,
                })
            }));
        }
        neighbors.sort_by(|a, b| {
            a.distance_m
                .total_cmp(&b.distance_m)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(neighbors)
    }

    pub fn coordinate_of(&self, id: &str) -> Option<Coordinate> {
        self.positions.get(id).copied()
    }

    pub fn clear(&mut self) {
        self.tree = RTree::new();
        self.positions.clear();
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
