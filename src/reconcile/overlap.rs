use std::collections::{BTreeMap, BTreeSet};

use geo::{Area, BooleanOps, Intersects};
use json::JsonValue;
use log::debug;

use crate::error::Result;
use crate::reconcile::features::{FeatureKey, SpatialFeature, TileId};
use crate::reconcile::spatialindex::SpatialIndex;
use crate::reconcile::tiles::TileLayout;
use crate::reconcile::ReconcileConfig;

// Undirected graph over feature keys whose edges join features judged to
// be the same cell seen from different tiles. Edge weights record the
// overlap fraction that justified the edge (negative when the centroid
// fallback fired) and are diagnostic only. Endpoints are stored in
// (min, max) order so an edge can never appear twice.
#[derive(Debug, Clone, PartialEq)]
pub struct TileGraph {
    tile: TileId,
    nodes: BTreeSet<FeatureKey>,
    edges: BTreeMap<(FeatureKey, FeatureKey), f32>,
}

impl TileGraph {
    pub fn new(tile: TileId) -> TileGraph {
        TileGraph {
            tile,
            nodes: BTreeSet::new(),
            edges: BTreeMap::new(),
        }
    }

    pub fn tile(&self) -> TileId {
        self.tile
    }

    pub fn add_node(&mut self, key: FeatureKey) {
        self.nodes.insert(key);
    }

    // self loops are ignored, endpoints become nodes, and re-adding an
    // edge keeps the larger weight
    pub fn add_edge(&mut self, a: FeatureKey, b: FeatureKey, weight: f32) {
        if a == b {
            return;
        }
        let edge = (a.min(b), a.max(b));
        self.nodes.insert(a);
        self.nodes.insert(b);
        self.edges
            .entry(edge)
            .and_modify(|w| *w = w.max(weight))
            .or_insert(weight);
    }

    pub fn contains_node(&self, key: FeatureKey) -> bool {
        self.nodes.contains(&key)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    // ascending key order
    pub fn nodes(&self) -> impl Iterator<Item = FeatureKey> + '_ {
        self.nodes.iter().copied()
    }

    // ascending endpoint order
    pub fn edges(&self) -> impl Iterator<Item = (FeatureKey, FeatureKey, f32)> + '_ {
        self.edges.iter().map(|(&(a, b), &w)| (a, b, w))
    }

    pub(crate) fn to_json(&self) -> JsonValue {
        let mut nodes = JsonValue::new_array();
        for key in &self.nodes {
            nodes
                .push(JsonValue::from(vec![
                    JsonValue::from(key.tile),
                    JsonValue::from(key.local),
                ]))
                .unwrap();
        }

        let mut edges = JsonValue::new_array();
        for (&(a, b), &w) in &self.edges {
            edges
                .push(JsonValue::from(vec![
                    JsonValue::from(a.tile),
                    JsonValue::from(a.local),
                    JsonValue::from(b.tile),
                    JsonValue::from(b.local),
                    JsonValue::from(w),
                ]))
                .unwrap();
        }

        let mut data = JsonValue::new_object();
        data.insert("tile", self.tile).unwrap();
        data.insert("nodes", nodes).unwrap();
        data.insert("edges", edges).unwrap();
        data
    }

    pub(crate) fn from_json(value: &JsonValue) -> std::result::Result<TileGraph, String> {
        let tile = value["tile"]
            .as_u32()
            .ok_or_else(|| "missing or malformed tile id".to_string())?;
        let mut graph = TileGraph::new(tile);

        for node in value["nodes"].members() {
            let tile = node[0].as_u32().ok_or_else(|| "malformed node".to_string())?;
            let local = node[1].as_u32().ok_or_else(|| "malformed node".to_string())?;
            graph.add_node(FeatureKey::new(tile, local));
        }

        for edge in value["edges"].members() {
            let fields: Vec<&JsonValue> = edge.members().collect();
            if fields.len() != 5 {
                return Err(format!("edge with {} fields", fields.len()));
            }
            let num =
                |v: &JsonValue| -> std::result::Result<u32, String> {
                    v.as_u32().ok_or_else(|| "malformed edge".to_string())
                };
            let a = FeatureKey::new(num(fields[0])?, num(fields[1])?);
            let b = FeatureKey::new(num(fields[2])?, num(fields[3])?);
            let w = fields[4]
                .as_f32()
                .ok_or_else(|| "malformed edge weight".to_string())?;
            graph.add_edge(a, b, w);
        }

        Ok(graph)
    }
}

// Drop features that cannot meaningfully participate in overlap tests:
// zero total area, or boundaries identical to a feature already kept (the
// lowest label survives). Survivors come back in ascending key order.
pub fn clean_features(mut features: Vec<SpatialFeature>) -> Vec<SpatialFeature> {
    features.sort_by_key(|f| f.key());

    let mut kept: Vec<SpatialFeature> = Vec::with_capacity(features.len());
    for feature in features {
        if feature.total_area() <= 0.0 {
            debug!("dropping zero area feature {}", feature.display_id());
            continue;
        }
        let duplicate = kept.iter().find(|k| {
            k.bounding_box() == feature.bounding_box() && k.boundaries_identical(&feature)
        });
        if let Some(original) = duplicate {
            debug!(
                "dropping feature {} duplicating {}",
                feature.display_id(),
                original.display_id()
            );
            continue;
        }
        kept.push(feature);
    }
    kept
}

pub struct OverlapGraphBuilder<'a> {
    index: &'a SpatialIndex,
    layout: &'a TileLayout,
    config: &'a ReconcileConfig,
}

impl<'a> OverlapGraphBuilder<'a> {
    pub fn new(
        index: &'a SpatialIndex,
        layout: &'a TileLayout,
        config: &'a ReconcileConfig,
    ) -> OverlapGraphBuilder<'a> {
        OverlapGraphBuilder {
            index,
            layout,
            config,
        }
    }

    // Every feature the tile owns becomes a node. Candidate partners come
    // from the spatial index, restricted to tiles whose FOV boxes
    // intersect this tile's box, and surviving pairs are re-tested with
    // exact geometry. Same-tile pairs are tested once, from the
    // lower-labeled side.
    pub fn build(&self, tile: TileId) -> Result<TileGraph> {
        let neighbor_tiles: BTreeSet<TileId> =
            self.layout.intersecting_tiles(tile)?.into_iter().collect();

        let mut graph = TileGraph::new(tile);
        for &slot in self.index.tile_slots(tile) {
            let feature = self.index.feature(slot);
            graph.add_node(feature.key());

            for candidate_slot in self.index.query(&feature.bounding_box()) {
                if candidate_slot == slot {
                    continue;
                }
                let other = self.index.feature(candidate_slot);
                if !neighbor_tiles.contains(&other.tile()) {
                    continue;
                }
                if other.tile() == tile && other.key() <= feature.key() {
                    continue;
                }
                if !feature.bounding_box().intersects(&other.bounding_box()) {
                    continue;
                }

                if let Some(weight) = overlap_score(feature, other, self.config) {
                    graph.add_edge(feature.key(), other.key(), weight);
                }
            }
        }

        Ok(graph)
    }
}

// The score is the summed intersection area over shared planes divided by
// the smaller feature's total area; below overlap_threshold the pair is
// distinct. Features without usable area fall back to centroid distance,
// reported as a negative score.
fn overlap_score(a: &SpatialFeature, b: &SpatialFeature, config: &ReconcileConfig) -> Option<f32> {
    let denom = a.total_area().min(b.total_area());

    if denom > 0.0 {
        let mut intersection = 0.0;
        for (plane, pa) in a.planes() {
            if let Some(pb) = b.planes().get(plane) {
                intersection += pa.boundary.intersection(&pb.boundary).unsigned_area();
            }
        }
        let fraction = intersection / denom;
        if fraction >= config.overlap_threshold {
            Some(fraction)
        } else {
            None
        }
    } else {
        let ca = a.centroid();
        let cb = b.centroid();
        let d = ((ca.x - cb.x).powi(2) + (ca.y - cb.y).powi(2)).sqrt();
        if d < config.centroid_cutoff {
            Some(-d)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::features::PlaneBoundary;
    use geo::geometry::{LineString, MultiPolygon, Polygon};

    fn square_boundary(x0: f32, y0: f32, size: f32) -> MultiPolygon<f32> {
        MultiPolygon::new(vec![Polygon::new(
            LineString::from(vec![
                (x0, y0),
                (x0 + size, y0),
                (x0 + size, y0 + size),
                (x0, y0 + size),
                (x0, y0),
            ]),
            Vec::new(),
        )])
    }

    fn feature_on_planes(
        tile: TileId,
        local: u32,
        planes: &[u32],
        x0: f32,
        y0: f32,
        size: f32,
    ) -> SpatialFeature {
        let planes: BTreeMap<u32, PlaneBoundary> = planes
            .iter()
            .map(|&p| {
                (
                    p,
                    PlaneBoundary {
                        z: p as f32,
                        boundary: square_boundary(x0, y0, size),
                    },
                )
            })
            .collect();
        SpatialFeature::new(FeatureKey::new(tile, local), planes).unwrap()
    }

    fn two_tile_layout() -> TileLayout {
        TileLayout::from_positions(&[(0, 0.0, 0.0), (1, 90.0, 0.0)], 100, 100, 1.0).unwrap()
    }

    #[test]
    fn test_edge_canonical_order() {
        let mut graph = TileGraph::new(0);
        let a = FeatureKey::new(1, 4);
        let b = FeatureKey::new(0, 9);
        graph.add_edge(a, b, 0.7);
        graph.add_edge(b, a, 0.6);
        graph.add_edge(a, a, 1.0);

        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.node_count(), 2);
        let (lo, hi, w) = graph.edges().next().unwrap();
        assert_eq!((lo, hi), (b, a));
        assert_eq!(w, 0.7);
    }

    #[test]
    fn test_graph_json_round_trip() {
        let mut graph = TileGraph::new(3);
        graph.add_node(FeatureKey::new(3, 0));
        graph.add_edge(FeatureKey::new(3, 1), FeatureKey::new(2, 7), 0.61);
        graph.add_edge(FeatureKey::new(3, 1), FeatureKey::new(3, 2), -1.25);

        let restored = TileGraph::from_json(&graph.to_json()).unwrap();
        assert_eq!(restored, graph);
    }

    #[test]
    fn test_malformed_graph_json() {
        let value = json::parse(r#"{"nodes": [], "edges": []}"#).unwrap();
        assert!(TileGraph::from_json(&value).is_err());

        let value = json::parse(r#"{"tile": 0, "nodes": [], "edges": [[1, 2, 3]]}"#).unwrap();
        assert!(TileGraph::from_json(&value).is_err());
    }

    #[test]
    fn test_clean_features_drops_duplicates_and_zero_area() {
        let zero = {
            let mut planes = BTreeMap::new();
            planes.insert(
                0,
                PlaneBoundary {
                    z: 0.0,
                    boundary: MultiPolygon::new(vec![Polygon::new(
                        LineString::from(vec![(5.0, 5.0), (5.0, 5.0), (5.0, 5.0), (5.0, 5.0)]),
                        Vec::new(),
                    )]),
                },
            );
            SpatialFeature::new(FeatureKey::new(0, 3), planes).unwrap()
        };

        let features = vec![
            feature_on_planes(0, 2, &[0, 1], 0.0, 0.0, 10.0),
            feature_on_planes(0, 1, &[0, 1], 0.0, 0.0, 10.0),
            feature_on_planes(0, 0, &[0], 40.0, 0.0, 10.0),
            zero,
        ];

        let cleaned = clean_features(features);
        let keys: Vec<FeatureKey> = cleaned.iter().map(|f| f.key()).collect();
        // label 1 survives the duplicate pair, the zero area feature is gone
        assert_eq!(keys, vec![FeatureKey::new(0, 0), FeatureKey::new(0, 1)]);
    }

    #[test]
    fn test_overlap_score_fraction_of_smaller() {
        let config = ReconcileConfig::default();
        let a = feature_on_planes(0, 0, &[0, 1], 0.0, 0.0, 10.0);
        let b = feature_on_planes(1, 0, &[0, 1], 4.0, 0.0, 10.0);
        // 60 of 100 per plane on both planes
        let score = overlap_score(&a, &b, &config).unwrap();
        assert!((score - 0.6).abs() < 1e-4);

        let c = feature_on_planes(1, 1, &[0], 8.0, 0.0, 10.0);
        // 20 of 100 on the single shared plane, under the threshold
        assert!(overlap_score(&a, &c, &config).is_none());
    }

    #[test]
    fn test_overlap_requires_shared_planes() {
        let config = ReconcileConfig::default();
        let a = feature_on_planes(0, 0, &[0], 0.0, 0.0, 10.0);
        let b = feature_on_planes(1, 0, &[1], 0.0, 0.0, 10.0);
        assert!(overlap_score(&a, &b, &config).is_none());
    }

    #[test]
    fn test_overlap_centroid_fallback() {
        let config = ReconcileConfig::default();
        let degenerate = |tile: u32, x: f32| {
            let mut planes = BTreeMap::new();
            planes.insert(
                0,
                PlaneBoundary {
                    z: 0.0,
                    boundary: MultiPolygon::new(vec![Polygon::new(
                        LineString::from(vec![(x, 0.0), (x, 0.0), (x, 0.0), (x, 0.0)]),
                        Vec::new(),
                    )]),
                },
            );
            SpatialFeature::new(FeatureKey::new(tile, 0), planes).unwrap()
        };

        let a = degenerate(0, 0.0);
        let b = degenerate(1, 2.0);
        let score = overlap_score(&a, &b, &config).unwrap();
        assert!(score < 0.0);
        assert!((score + 2.0).abs() < 1e-4);

        let far = degenerate(2, 100.0);
        assert!(overlap_score(&a, &far, &config).is_none());
    }

    #[test]
    fn test_build_overlap_graph() {
        let layout = two_tile_layout();
        let config = ReconcileConfig::default();

        let mut index = SpatialIndex::new();
        index
            .insert(feature_on_planes(0, 0, &[0, 1], 85.0, 0.0, 10.0))
            .unwrap();
        index
            .insert(feature_on_planes(1, 0, &[0, 1], 89.0, 0.0, 10.0))
            .unwrap();
        index
            .insert(feature_on_planes(1, 1, &[0], 150.0, 50.0, 10.0))
            .unwrap();

        let builder = OverlapGraphBuilder::new(&index, &layout, &config);

        let graph = builder.build(0).unwrap();
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        let (a, b, w) = graph.edges().next().unwrap();
        assert_eq!((a, b), (FeatureKey::new(0, 0), FeatureKey::new(1, 0)));
        assert!((w - 0.6).abs() < 1e-4);
        assert!(!graph.contains_node(FeatureKey::new(1, 1)));

        // the neighbor sees the same edge from its side
        let graph = builder.build(1).unwrap();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_build_ignores_non_neighbor_tiles() {
        // tile 2 sits far from tile 0 in the layout, but one of its
        // features was indexed right on top of tile 0's feature
        let layout = TileLayout::from_positions(
            &[(0, 0.0, 0.0), (2, 500.0, 500.0)],
            100,
            100,
            1.0,
        )
        .unwrap();
        let config = ReconcileConfig::default();

        let mut index = SpatialIndex::new();
        index
            .insert(feature_on_planes(0, 0, &[0], 10.0, 10.0, 10.0))
            .unwrap();
        index
            .insert(feature_on_planes(2, 0, &[0], 10.0, 10.0, 10.0))
            .unwrap();

        let builder = OverlapGraphBuilder::new(&index, &layout, &config);
        let graph = builder.build(0).unwrap();
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_build_same_tile_duplicates() {
        let layout = two_tile_layout();
        let config = ReconcileConfig::default();

        let mut index = SpatialIndex::new();
        index
            .insert(feature_on_planes(0, 0, &[0], 10.0, 10.0, 10.0))
            .unwrap();
        index
            .insert(feature_on_planes(0, 1, &[0], 12.0, 10.0, 10.0))
            .unwrap();

        let builder = OverlapGraphBuilder::new(&index, &layout, &config);
        let graph = builder.build(0).unwrap();
        // tested once, from the lower labeled side
        assert_eq!(graph.edge_count(), 1);
        let (a, b, w) = graph.edges().next().unwrap();
        assert_eq!((a, b), (FeatureKey::new(0, 0), FeatureKey::new(0, 1)));
        assert!((w - 0.8).abs() < 1e-4);
    }
}
