//! Tracks which regions were fetched from the remote source and when.

use crate::{BoundingBox, Timestamp};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchedRegion {
    bounds: BoundingBox,
    fetched_at: Timestamp,
}

/// Fetched regions with their fetch time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Coverage {
    regions: Vec<FetchedRegion>,
}

impl Coverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed fetch of `bounds`. Older regions it covers are
    /// dropped.
    pub fn record(&mut self, bounds: BoundingBox, fetched_at: Timestamp) {
        self.regions
            .retain(|r| !(bounds.covers(&r.bounds) && r.fetched_at <= fetched_at));
        self.regions.push(FetchedRegion { bounds, fetched_at });
    }

    /// Whether a single fetched region covers `bounds` and is within the
    /// freshness window.
    pub fn is_fresh(&self, bounds: &BoundingBox, now: Timestamp, window_ms: u64) -> bool {
        self.regions.iter().any(|r| {
            r.bounds.covers(bounds) && now.saturating_sub(r.fetched_at) <= window_ms
        })
    }

    /// Drop regions older than the window.
    pub fn prune(&mut self, now: Timestamp, window_ms: u64) {
        self.regions
            .retain(|r| now.saturating_sub(r.fetched_at) <= window_ms);
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(s: f64, w: f64, n: f64, e: f64) -> BoundingBox {
        BoundingBox::new(s, w, n, e).unwrap()
    }

    #[test]
    fn fresh_only_inside_fetched_region_and_window() {
        let mut coverage = Coverage::new();
        coverage.record(bbox(45.0, 9.0, 46.0, 10.0), 1_000);

        let inner = bbox(45.4, 9.1, 45.5, 9.2);
        assert!(coverage.is_fresh(&inner, 2_000, 5_000));
        assert!(!coverage.is_fresh(&inner, 7_000, 5_000));
        assert!(!coverage.is_fresh(&bbox(44.0, 9.0, 45.5, 9.5), 2_000, 5_000));
    }

    #[test]
    fn newer_enclosing_fetch_replaces_old_regions() {
        let mut coverage = Coverage::new();
        coverage.record(bbox(45.4, 9.1, 45.5, 9.2), 1_000);
        coverage.record(bbox(45.0, 9.0, 46.0, 10.0), 2_000);
        assert_eq!(coverage.len(), 1);
    }

    #[test]
    fn prune_drops_expired_regions() {
        let mut coverage = Coverage::new();
        coverage.record(bbox(45.0, 9.0, 46.0, 10.0), 1_000);
        coverage.record(bbox(10.0, 10.0, 11.0, 11.0), 9_000);
        coverage.prune(10_000, 5_000);
        assert_eq!(coverage.len(), 1);
        coverage.clear();
        assert!(coverage.is_empty());
    }
}
