use std::collections::HashMap;

use geo::geometry::Rect;
use itertools::Itertools;
use rstar::{RTree, RTreeObject, AABB};

use crate::error::{ReconcileError, Result};
use crate::reconcile::features::{FeatureKey, SpatialFeature, TileId};

// R-tree entry: an arena slot plus the feature's envelope. The tree keys
// on slots handed out at insertion, never on feature labels, which repeat
// across tiles.
#[derive(Debug, Clone)]
struct IndexEntry {
    slot: u32,
    min: [f32; 2],
    max: [f32; 2],
}

impl RTreeObject for IndexEntry {
    type Envelope = AABB<[f32; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.min, self.max)
    }
}

// Arena-backed 2D index over all tiles' features. Queries return slots
// whose envelopes intersect the query rectangle, a superset of the true
// geometric overlaps.
pub struct SpatialIndex {
    arena: Vec<SpatialFeature>,
    by_key: HashMap<FeatureKey, u32>,
    by_tile: HashMap<TileId, Vec<u32>>,
    tree: RTree<IndexEntry>,
}

impl SpatialIndex {
    pub fn new() -> SpatialIndex {
        SpatialIndex {
            arena: Vec::new(),
            by_key: HashMap::new(),
            by_tile: HashMap::new(),
            tree: RTree::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    // at most one feature per key, and its bounding box must be finite
    pub fn insert(&mut self, feature: SpatialFeature) -> Result<u32> {
        let key = feature.key();
        if self.by_key.contains_key(&key) {
            return Err(ReconcileError::IndexInconsistency(format!(
                "feature {} indexed twice",
                key
            )));
        }

        let rect = feature.bounding_box();
        let (cmin, cmax) = (rect.min(), rect.max());
        if !(cmin.x.is_finite() && cmin.y.is_finite() && cmax.x.is_finite() && cmax.y.is_finite())
        {
            return Err(ReconcileError::IndexInconsistency(format!(
                "feature {} has a non-finite bounding box",
                key
            )));
        }

        let slot = self.arena.len() as u32;
        self.tree.insert(IndexEntry {
            slot,
            min: [cmin.x, cmin.y],
            max: [cmax.x, cmax.y],
        });
        self.by_key.insert(key, slot);
        self.by_tile.entry(feature.tile()).or_default().push(slot);
        self.arena.push(feature);

        Ok(slot)
    }

    pub fn feature(&self, slot: u32) -> &SpatialFeature {
        &self.arena[slot as usize]
    }

    pub fn get(&self, key: FeatureKey) -> Option<&SpatialFeature> {
        self.by_key.get(&key).map(|&slot| self.feature(slot))
    }

    // insertion order
    pub fn tile_slots(&self, tile: TileId) -> &[u32] {
        self.by_tile
            .get(&tile)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    // slots of all features whose envelope intersects rect, ascending
    pub fn query(&self, rect: &Rect<f32>) -> Vec<u32> {
        let envelope = AABB::from_corners(
            [rect.min().x, rect.min().y],
            [rect.max().x, rect.max().y],
        );
        // the rtree returns matches in tree order, which varies with
        // insertion history
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|entry| entry.slot)
            .sorted_unstable()
            .collect()
    }
}

impl Default for SpatialIndex {
    fn default() -> Self {
        SpatialIndex::new()
    }
}
