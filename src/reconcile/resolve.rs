use std::collections::{BTreeSet, HashMap};

use itertools::Itertools;
use log::warn;
use petgraph::unionfind::UnionFind;

use crate::error::{ReconcileError, Result};
use crate::reconcile::compose::GlobalGraph;
use crate::reconcile::features::{FeatureKey, TileId};
use crate::reconcile::spatialindex::SpatialIndex;
use crate::reconcile::tiles::TileLayout;
use crate::reconcile::ReconcileConfig;

// One deduplicated cell: a connected component of the global graph, the
// member that owns it, and everything it superseded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCell {
    // sequential global id, assigned over cells sorted by canonical key
    pub cell: u32,
    pub canonical: FeatureKey,
    // ascending key order, the canonical member included
    pub members: Vec<FeatureKey>,
    // set when the component spanned more tiles than expected
    pub ambiguous: bool,
}

impl ResolvedCell {
    pub fn superseded(&self) -> impl Iterator<Item = FeatureKey> + '_ {
        self.members
            .iter()
            .copied()
            .filter(move |&key| key != self.canonical)
    }
}

// ordered by canonical key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub cells: Vec<ResolvedCell>,
}

impl Resolution {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn membership(&self) -> HashMap<FeatureKey, u32> {
        let mut membership = HashMap::new();
        for cell in &self.cells {
            for &key in &cell.members {
                membership.insert(key, cell.cell);
            }
        }
        membership
    }

    // no overlap edge may join two different resolved cells, and every
    // edge endpoint must belong to a cell
    pub fn verify_partition(&self, graph: &GlobalGraph) -> bool {
        let membership = self.membership();
        graph.edges().all(|(a, b, _)| {
            match (membership.get(&a), membership.get(&b)) {
                (Some(ca), Some(cb)) => ca == cb,
                _ => false,
            }
        })
    }
}

// Each connected component becomes one cell owned by the member whose
// centroid lies closest to its own tile's FOV center, ties broken by
// ascending key. Components spanning more than max_component_tiles tiles
// are flagged ambiguous and logged, never dropped.
pub fn resolve(
    graph: &GlobalGraph,
    index: &SpatialIndex,
    layout: &TileLayout,
    config: &ReconcileConfig,
) -> Result<Resolution> {
    let keys: Vec<FeatureKey> = graph.nodes().collect();
    let ordinal: HashMap<FeatureKey, usize> = keys
        .iter()
        .copied()
        .enumerate()
        .map(|(i, key)| (key, i))
        .collect();

    let mut components = UnionFind::<usize>::new(keys.len());
    for (a, b, _) in graph.edges() {
        components.union(ordinal[&a], ordinal[&b]);
    }

    // distance from each member's centroid to its own tile's FOV center
    let mut distances = Vec::with_capacity(keys.len());
    for &key in &keys {
        let feature = index.get(key).ok_or_else(|| {
            ReconcileError::IndexInconsistency(format!(
                "graph node {} is not in the spatial index",
                key
            ))
        })?;
        let center = layout.fov_center(key.tile)?;
        let c = feature.centroid();
        distances.push(((c.x - center.x).powi(2) + (c.y - center.y).powi(2)).sqrt());
    }

    // members come out in ascending ordinal, hence ascending key, order
    let groups: HashMap<usize, Vec<usize>> = components
        .into_labeling()
        .iter()
        .enumerate()
        .map(|(i, &rep)| (rep, i))
        .into_group_map();

    let mut cells: Vec<ResolvedCell> = Vec::with_capacity(groups.len());
    for members in groups.into_values() {
        let canonical = members
            .iter()
            .copied()
            .min_by(|&i, &j| {
                distances[i]
                    .total_cmp(&distances[j])
                    .then_with(|| keys[i].cmp(&keys[j]))
            })
            .map(|i| keys[i])
            .unwrap();

        let tiles: BTreeSet<TileId> = members.iter().map(|&i| keys[i].tile).collect();
        let ambiguous = tiles.len() > config.max_component_tiles;
        if ambiguous {
            warn!(
                "component owned by {} spans {} tiles, expected at most {}",
                canonical,
                tiles.len(),
                config.max_component_tiles
            );
        }

        cells.push(ResolvedCell {
            cell: 0,
            canonical,
            members: members.iter().map(|&i| keys[i]).collect(),
            ambiguous,
        });
    }

    // global ids are ordinals over cells sorted by canonical key
    cells.sort_by_key(|cell| cell.canonical);
    for (i, cell) in cells.iter_mut().enumerate() {
        cell.cell = i as u32;
    }

    let resolution = Resolution { cells };
    if !resolution.verify_partition(graph) {
        return Err(ReconcileError::IndexInconsistency(
            "an overlap edge crosses resolved cell boundaries".into(),
        ));
    }
    Ok(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::features::{PlaneBoundary, SpatialFeature};
    use geo::geometry::{LineString, MultiPolygon, Polygon};
    use std::collections::BTreeMap;

    fn square_feature(tile: TileId, local: u32, x0: f32, y0: f32, size: f32) -> SpatialFeature {
        let boundary = MultiPolygon::new(vec![Polygon::new(
            LineString::from(vec![
                (x0, y0),
                (x0 + size, y0),
                (x0 + size, y0 + size),
                (x0, y0 + size),
                (x0, y0),
            ]),
            Vec::new(),
        )]);
        let mut planes = BTreeMap::new();
        planes.insert(0, PlaneBoundary { z: 0.0, boundary });
        SpatialFeature::new(FeatureKey::new(tile, local), planes).unwrap()
    }

    fn row_layout(n: u32) -> TileLayout {
        let positions: Vec<(TileId, f32, f32)> =
            (0..n).map(|i| (i, i as f32 * 90.0, 0.0)).collect();
        TileLayout::from_positions(&positions, 100, 100, 1.0).unwrap()
    }

    #[test]
    fn test_owner_is_closest_to_fov_center() {
        let layout = row_layout(2);
        let mut index = SpatialIndex::new();
        // tile 0's copy sits on the tile edge, tile 1's near its center
        index.insert(square_feature(0, 0, 90.0, 45.0, 10.0)).unwrap();
        index.insert(square_feature(1, 0, 130.0, 45.0, 10.0)).unwrap();
        index.insert(square_feature(1, 1, 170.0, 80.0, 10.0)).unwrap();

        let mut tg = crate::reconcile::overlap::TileGraph::new(0);
        tg.add_edge(FeatureKey::new(0, 0), FeatureKey::new(1, 0), 0.9);
        tg.add_node(FeatureKey::new(1, 1));
        let mut global = GlobalGraph::new();
        global.absorb(&tg);

        let config = ReconcileConfig::default();
        let resolution = resolve(&global, &index, &layout, &config).unwrap();

        assert_eq!(resolution.len(), 2);
        let owned = &resolution.cells[0];
        assert_eq!(owned.cell, 0);
        assert_eq!(owned.canonical, FeatureKey::new(1, 0));
        assert_eq!(
            owned.members,
            vec![FeatureKey::new(0, 0), FeatureKey::new(1, 0)]
        );
        assert_eq!(
            owned.superseded().collect::<Vec<FeatureKey>>(),
            vec![FeatureKey::new(0, 0)]
        );
        assert!(!owned.ambiguous);

        let lone = &resolution.cells[1];
        assert_eq!(lone.cell, 1);
        assert_eq!(lone.canonical, FeatureKey::new(1, 1));
        assert_eq!(lone.members, vec![FeatureKey::new(1, 1)]);

        assert!(resolution.verify_partition(&global));
    }

    #[test]
    fn test_distance_tie_breaks_by_key() {
        // tile centers sit at x = 140, 230, 320; member centroids land 2.0,
        // 5.0, and 2.0 from their own centers, so tiles 1 and 3 tie and the
        // lower tile id wins
        let layout = row_layout(4);
        let mut index = SpatialIndex::new();
        index.insert(square_feature(1, 0, 137.0, 45.0, 10.0)).unwrap();
        index.insert(square_feature(2, 0, 230.0, 45.0, 10.0)).unwrap();
        index.insert(square_feature(3, 0, 317.0, 45.0, 10.0)).unwrap();

        let mut tg = crate::reconcile::overlap::TileGraph::new(1);
        tg.add_edge(FeatureKey::new(1, 0), FeatureKey::new(2, 0), 1.0);
        tg.add_edge(FeatureKey::new(2, 0), FeatureKey::new(3, 0), 1.0);
        let mut global = GlobalGraph::new();
        global.absorb(&tg);

        let config = ReconcileConfig::default();
        let resolution = resolve(&global, &index, &layout, &config).unwrap();
        assert_eq!(resolution.len(), 1);
        assert_eq!(resolution.cells[0].canonical, FeatureKey::new(1, 0));
    }

    #[test]
    fn test_wide_component_flagged_ambiguous() {
        let n = 6;
        let layout = row_layout(n);
        let mut index = SpatialIndex::new();
        let mut tg = crate::reconcile::overlap::TileGraph::new(0);
        for tile in 0..n {
            index
                .insert(square_feature(tile, 0, tile as f32 * 90.0 + 45.0, 45.0, 10.0))
                .unwrap();
            if tile > 0 {
                tg.add_edge(
                    FeatureKey::new(tile - 1, 0),
                    FeatureKey::new(tile, 0),
                    0.6,
                );
            }
        }
        let mut global = GlobalGraph::new();
        global.absorb(&tg);

        let config = ReconcileConfig::default();
        let resolution = resolve(&global, &index, &layout, &config).unwrap();
        assert_eq!(resolution.len(), 1);
        assert!(resolution.cells[0].ambiguous);
        assert_eq!(resolution.cells[0].members.len(), n as usize);
    }

    #[test]
    fn test_unindexed_node_fails_fast() {
        let layout = row_layout(1);
        let index = SpatialIndex::new();
        let mut tg = crate::reconcile::overlap::TileGraph::new(0);
        tg.add_node(FeatureKey::new(0, 0));
        let mut global = GlobalGraph::new();
        global.absorb(&tg);

        let config = ReconcileConfig::default();
        let result = resolve(&global, &index, &layout, &config);
        assert!(matches!(
            result,
            Err(ReconcileError::IndexInconsistency(_))
        ));
    }

    #[test]
    fn test_verify_partition_detects_cross_component_edges() {
        let mut tg = crate::reconcile::overlap::TileGraph::new(0);
        tg.add_edge(FeatureKey::new(0, 0), FeatureKey::new(1, 0), 0.9);
        let mut global = GlobalGraph::new();
        global.absorb(&tg);

        // a hand-built partition that wrongly splits the edge
        let broken = Resolution {
            cells: vec![
                ResolvedCell {
                    cell: 0,
                    canonical: FeatureKey::new(0, 0),
                    members: vec![FeatureKey::new(0, 0)],
                    ambiguous: false,
                },
                ResolvedCell {
                    cell: 1,
                    canonical: FeatureKey::new(1, 0),
                    members: vec![FeatureKey::new(1, 0)],
                    ambiguous: false,
                },
            ],
        };
        assert!(!broken.verify_partition(&global));
    }
}
