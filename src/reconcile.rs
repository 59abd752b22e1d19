pub mod compose;
pub mod features;
pub mod featurestore;
pub mod overlap;
pub mod planelink;
pub mod resolve;
pub mod spatialindex;
pub mod tiles;

use std::collections::{BTreeMap, BTreeSet};

use geo::AffineTransform;
use log::info;
use ndarray::{ArrayView3, Axis};
use num_traits::PrimInt;

use crate::error::{ReconcileError, Result};
use crate::reconcile::compose::{compose_graphs, validate_complete, GlobalGraph};
use crate::reconcile::features::{
    trace_all_label_boundaries, FeatureKey, PlaneBoundary, SpatialFeature, TileId,
};
use crate::reconcile::featurestore::FeatureStore;
use crate::reconcile::overlap::{clean_features, OverlapGraphBuilder, TileGraph};
use crate::reconcile::planelink::{extract_plane_detections, link_plane_detections};
use crate::reconcile::resolve::{resolve, Resolution};
use crate::reconcile::spatialindex::SpatialIndex;
use crate::reconcile::tiles::TileLayout;

// Tunable thresholds for reconciliation. Defaults suit MERFISH runs with
// roughly 10% tile overlap and micron units.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    // neighbors fetched per detection when linking planes, counting the
    // query point itself
    pub knn_neighbors: usize,

    // max xy centroid distance in microns for two detections on different
    // planes to count as the same cell
    pub link_distance: f32,

    // min fraction of the smaller feature's area that must be shared
    pub overlap_threshold: f32,

    // centroid distance cutoff in microns, used when either feature has no
    // usable area
    pub centroid_cutoff: f32,

    // components spanning more tiles than this are flagged ambiguous
    pub max_component_tiles: usize,
}

impl Default for ReconcileConfig {
    fn default() -> ReconcileConfig {
        ReconcileConfig {
            knn_neighbors: 6,
            link_distance: 3.0,
            overlap_threshold: 0.5,
            centroid_cutoff: 4.0,
            max_component_tiles: 4,
        }
    }
}

// The pipeline runs in passes so each one can be parallelized over tiles
// and restarted without redoing the others: segment_tile persists each
// tile's 3D features, index_tiles builds the shared spatial index over all
// of them, graph_tile persists each tile's overlap graph, and resolve_all
// composes the graphs and writes the deduplicated per-tile feature set.
//
// With link_planes set, per-plane labels are treated as independent and
// stitched by centroid proximity. Otherwise a label denotes the same cell
// on every plane.
pub fn segment_tile<T>(
    tile: TileId,
    labels: &ArrayView3<T>,
    z_positions: &[f32],
    link_planes: bool,
    layout: &TileLayout,
    config: &ReconcileConfig,
    store: &FeatureStore,
) -> Result<usize>
where
    T: PrimInt,
{
    let transform = layout.transform(tile)?;

    let features = if link_planes {
        let detections = extract_plane_detections(labels, transform, z_positions)?;
        link_plane_detections(tile, detections, config)?
    } else {
        segment_consistent_labels(tile, labels, transform, z_positions)?
    };

    store.write_features(tile, &features)?;
    Ok(features.len())
}

// Every plane a label occurs on contributes to the same feature, and the
// label value itself becomes the local feature id.
fn segment_consistent_labels<T>(
    tile: TileId,
    labels: &ArrayView3<T>,
    transform: &AffineTransform<f32>,
    z_positions: &[f32],
) -> Result<Vec<SpatialFeature>>
where
    T: PrimInt,
{
    let (nplanes, _, _) = labels.dim();
    if z_positions.len() != nplanes {
        return Err(ReconcileError::IndexInconsistency(format!(
            "{} z positions given for a volume with {} planes",
            z_positions.len(),
            nplanes
        )));
    }

    let mut grouped: BTreeMap<u32, BTreeMap<u32, PlaneBoundary>> = BTreeMap::new();
    for (plane, &z) in z_positions.iter().enumerate() {
        let view = labels.index_axis(Axis(0), plane);
        for (label, boundary) in trace_all_label_boundaries(&view, transform) {
            if boundary.0.is_empty() {
                continue;
            }
            let local = label.to_u32().ok_or_else(|| {
                ReconcileError::IndexInconsistency(format!(
                    "label {} on plane {} does not fit in 32 bits",
                    label.to_u64().unwrap_or_default(),
                    plane
                ))
            })?;
            grouped
                .entry(local)
                .or_default()
                .insert(plane as u32, PlaneBoundary { z, boundary });
        }
    }

    let mut features = Vec::with_capacity(grouped.len());
    for (local, planes) in grouped {
        features.push(SpatialFeature::new(FeatureKey::new(tile, local), planes)?);
    }
    Ok(features)
}

// Degenerate and duplicate features are dropped here, before indexing.
pub fn index_tiles(tiles: &[TileId], store: &FeatureStore) -> Result<SpatialIndex> {
    let mut index = SpatialIndex::new();
    let mut loaded = 0;
    for &tile in tiles {
        let features = store.read_features(tile)?;
        loaded += features.len();
        for feature in clean_features(features) {
            index.insert(feature)?;
        }
    }
    info!(
        "indexed {} features, dropped {} as degenerate or duplicate",
        index.len(),
        loaded - index.len()
    );
    Ok(index)
}

// Every spatially intersecting tile must be segmented before a tile's
// overlap graph can be built, or the graph would silently miss edges.
pub fn graph_tile(
    tile: TileId,
    index: &SpatialIndex,
    layout: &TileLayout,
    config: &ReconcileConfig,
    store: &FeatureStore,
) -> Result<TileGraph> {
    let missing: Vec<TileId> = layout
        .intersecting_tiles(tile)?
        .into_iter()
        .filter(|&t| !store.has_features(t))
        .collect();
    if !missing.is_empty() {
        return Err(ReconcileError::MissingInput { tile, missing });
    }

    let graph = OverlapGraphBuilder::new(index, layout, config).build(tile)?;
    store.write_tile_graph(tile, &graph)?;
    Ok(graph)
}

// Tiles all of whose features were superseded still get a refined file, so
// an empty tile can be told apart from an unprocessed one.
pub fn resolve_all(
    layout: &TileLayout,
    index: &SpatialIndex,
    config: &ReconcileConfig,
    store: &FeatureStore,
    refined: &FeatureStore,
) -> Result<(Resolution, GlobalGraph)> {
    let mut graphs = Vec::new();
    let mut present = BTreeSet::new();
    for &tile in layout.tiles() {
        if let Some(graph) = store.read_tile_graph(tile)? {
            present.insert(tile);
            graphs.push(graph);
        }
    }
    validate_complete(layout.tiles(), &present)?;

    let global = compose_graphs(&graphs);
    info!(
        "composed {} tile graphs into {} nodes and {} edges",
        graphs.len(),
        global.node_count(),
        global.edge_count()
    );

    let resolution = resolve(&global, index, layout, config)?;
    let ambiguous = resolution.cells.iter().filter(|c| c.ambiguous).count();
    info!(
        "resolved {} features into {} cells, {} ambiguous",
        global.node_count(),
        resolution.len(),
        ambiguous
    );

    let mut owned: BTreeMap<TileId, Vec<SpatialFeature>> = BTreeMap::new();
    for cell in &resolution.cells {
        // resolve verified every graph node against the index already
        let feature = index.get(cell.canonical).unwrap();
        owned.entry(cell.canonical.tile).or_default().push(feature.clone());
    }
    for &tile in layout.tiles() {
        match owned.get(&tile) {
            Some(features) => refined.write_features(tile, features)?,
            None => refined.write_features(tile, &[])?,
        }
    }

    Ok((resolution, global))
}
