use serde::{Deserialize, Serialize};

use crate::error::LocationId;

/// A named logical storage class, e.g. `"ssd_blobs"`, `"hdd_journals"`.
///
/// Locations are tagged with a medium; placement picks among the writable
/// locations of the medium a session's `StartChunk` requested.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediumDescriptor {
    pub name: String,
    /// Index of this medium among the node's configured media, used in
    /// `session_id = (chunk_id, target medium index)`.
    pub index: u32,
}

impl MediumDescriptor {
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

/// Snapshot of one location's placement-relevant stats, used to compare
/// candidates lexicographically by `(session_count, used_space / quota)`
/// (spec.md §4.1, "Placement fairness").
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlacementScore {
    pub location: LocationId,
    pub session_count: u32,
    pub fill_ratio: f64,
}

impl PlacementScore {
    /// Lexicographic comparison by `(session_count, fill_ratio)`, the order
    /// `spec.md`'s placement-fairness policy asks for.
    pub fn compare(&self, other: &Self) -> std::cmp::Ordering {
        self.session_count
            .cmp(&other.session_count)
            .then_with(|| {
                self.fill_ratio
                    .partial_cmp(&other.fill_ratio)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}
