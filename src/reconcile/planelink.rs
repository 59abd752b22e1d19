use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::mem;

use geo::geometry::MultiPolygon;
use geo::{AffineTransform, Area, BoundingRect, Centroid};
use kiddo::float::kdtree::KdTree;
use kiddo::SquaredEuclidean;
use log::debug;
use ndarray::{ArrayView3, Axis};
use num_traits::PrimInt;
use petgraph::unionfind::UnionFind;

use crate::error::{ReconcileError, Result};
use crate::reconcile::features::{
    trace_all_label_boundaries, FeatureKey, PlaneBoundary, SpatialFeature, TileId,
};
use crate::reconcile::ReconcileConfig;

// One label on one z-plane, boundary in global microns. Per-plane
// segmentation assigns unrelated labels on each z-plane, so a cell
// spanning several planes arrives as several detections.
#[derive(Debug, Clone)]
pub struct PlaneDetection {
    pub label: u32,
    pub plane: u32,
    pub z: f32,
    pub boundary: MultiPolygon<f32>,
}

// Labels carry no meaning across planes here. Linking recovers the 3D
// cells afterwards.
pub fn extract_plane_detections<T>(
    labels: &ArrayView3<T>,
    transform: &AffineTransform<f32>,
    z_positions: &[f32],
) -> Result<Vec<PlaneDetection>>
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

    let mut detections = Vec::new();
    for (plane, &z) in z_positions.iter().enumerate() {
        let view = labels.index_axis(Axis(0), plane);
        for (label, boundary) in trace_all_label_boundaries(&view, transform) {
            if boundary.0.is_empty() {
                continue;
            }
            let label = label.to_u32().ok_or_else(|| {
                ReconcileError::IndexInconsistency(format!(
                    "label {} on plane {} does not fit in 32 bits",
                    label.to_u64().unwrap_or_default(),
                    plane
                ))
            })?;
            detections.push(PlaneDetection {
                label,
                plane: plane as u32,
                z,
                boundary,
            });
        }
    }

    Ok(detections)
}

/// Link detections whose centroids are within link_distance in xy on
/// different planes, merging each connected component into one feature.
pub fn link_plane_detections(
    tile: TileId,
    mut detections: Vec<PlaneDetection>,
    config: &ReconcileConfig,
) -> Result<Vec<SpatialFeature>> {
    if detections.is_empty() {
        return Ok(Vec::new());
    }

    let mut centroids = Vec::with_capacity(detections.len());
    for det in &detections {
        let xy = det
            .boundary
            .centroid()
            .map(|c| (c.x(), c.y()))
            .or_else(|| det.boundary.bounding_rect().map(|r| (r.center().x, r.center().y)));
        let (x, y) = xy.ok_or_else(|| {
            ReconcileError::IndexInconsistency(format!(
                "tile {}: detection {} on plane {} has no extent",
                tile, det.label, det.plane
            ))
        })?;
        centroids.push((x, y, det.z));
    }

    let mut kdtree: KdTree<f32, u32, 3, 32, u32> = KdTree::with_capacity(centroids.len());
    for (i, &(x, y, z)) in centroids.iter().enumerate() {
        kdtree.add(&[x, y, z], i as u32);
    }

    let mut components = UnionFind::<usize>::new(detections.len());
    for (i, &(x, y, z)) in centroids.iter().enumerate() {
        // the query point itself counts toward the k neighbors
        for neighbor in kdtree.nearest_n::<SquaredEuclidean>(&[x, y, z], config.knn_neighbors) {
            let j = neighbor.item as usize;
            if j == i || detections[j].plane == detections[i].plane {
                continue;
            }
            let δx = centroids[j].0 - x;
            let δy = centroids[j].1 - y;
            if (δx * δx + δy * δy).sqrt() < config.link_distance {
                components.union(i, j);
            }
        }
    }

    // group detections by component, numbering components in first
    // appearance order
    let labeling = components.into_labeling();
    let mut component_ids: HashMap<usize, usize> = HashMap::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (i, &rep) in labeling.iter().enumerate() {
        let id = *component_ids.entry(rep).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[id].push(i);
    }

    let mut features = Vec::with_capacity(groups.len());
    for (local, group) in groups.iter().enumerate() {
        let mut planes: BTreeMap<u32, PlaneBoundary> = BTreeMap::new();
        for &i in group {
            let det = &mut detections[i];
            let boundary = mem::replace(&mut det.boundary, MultiPolygon::new(Vec::new()));
            match planes.entry(det.plane) {
                Entry::Occupied(mut e) => e.get_mut().boundary.0.extend(boundary.0),
                Entry::Vacant(e) => {
                    e.insert(PlaneBoundary {
                        z: det.z,
                        boundary,
                    });
                }
            }
        }
        for pb in planes.values_mut() {
            pb.boundary
                .0
                .sort_by(|a, b| b.unsigned_area().total_cmp(&a.unsigned_area()));
        }
        features.push(SpatialFeature::new(
            FeatureKey::new(tile, local as u32),
            planes,
        )?);
    }

    debug!(
        "tile {}: linked {} plane detections into {} features",
        tile,
        labeling.len(),
        features.len()
    );

    Ok(features)
}
