use std::collections::BTreeMap;
use std::fmt;

use geo::geometry::{Coord, LineString, MultiPolygon, Point, Polygon, Rect};
use geo::{AffineTransform, Area, BoundingRect, Centroid, Contains};
use ndarray::{ArrayView2, ArrayView3, Axis};
use num_traits::PrimInt;

use crate::error::{ReconcileError, Result};

pub type TileId = u32;

// Local labels repeat across tiles, so feature identity is the pair of the
// tile (field of view) that produced the feature and the label within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeatureKey {
    pub tile: TileId,
    pub local: u32,
}

impl FeatureKey {
    pub fn new(tile: TileId, local: u32) -> FeatureKey {
        FeatureKey { tile, local }
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "fov_{}_cell_{}", self.tile, self.local)
    }
}

// Boundary of a feature on one z-plane, with the plane's physical z
// position. Polygons are kept sorted by descending area.
#[derive(Debug, Clone)]
pub struct PlaneBoundary {
    pub z: f32,
    pub boundary: MultiPolygon<f32>,
}

// A 3D cell candidate: one boundary per z-plane it spans, plus a cached xy
// bounding box over all planes. Geometry is immutable once constructed.
#[derive(Debug, Clone)]
pub struct SpatialFeature {
    key: FeatureKey,
    planes: BTreeMap<u32, PlaneBoundary>,
    bounding_box: Rect<f32>,
}

impl SpatialFeature {
    /// Assemble a feature from per-plane boundaries. Fails with
    /// `IndexInconsistency` if the plane set is empty.
    pub fn new(key: FeatureKey, planes: BTreeMap<u32, PlaneBoundary>) -> Result<SpatialFeature> {
        if planes.is_empty() {
            return Err(ReconcileError::IndexInconsistency(format!(
                "feature {} has no plane boundaries",
                key
            )));
        }

        let mut bounding_box: Option<Rect<f32>> = None;
        for (&plane, pb) in &planes {
            if !pb.z.is_finite() {
                return Err(ReconcileError::IndexInconsistency(format!(
                    "feature {} plane {} has non-finite z position {}",
                    key, plane, pb.z
                )));
            }
            let rect = pb.boundary.bounding_rect().ok_or_else(|| {
                ReconcileError::IndexInconsistency(format!(
                    "feature {} plane {} has an empty boundary",
                    key, plane
                ))
            })?;
            bounding_box = Some(match bounding_box {
                None => rect,
                Some(acc) => Rect::new(
                    Coord {
                        x: acc.min().x.min(rect.min().x),
                        y: acc.min().y.min(rect.min().y),
                    },
                    Coord {
                        x: acc.max().x.max(rect.max().x),
                        y: acc.max().y.max(rect.max().y),
                    },
                ),
            });
        }

        let bounding_box = bounding_box.ok_or_else(|| {
            ReconcileError::IndexInconsistency(format!("feature {} has no extent", key))
        })?;
        let (cmin, cmax) = (bounding_box.min(), bounding_box.max());
        if !(cmin.x.is_finite() && cmin.y.is_finite() && cmax.x.is_finite() && cmax.y.is_finite()) {
            return Err(ReconcileError::IndexInconsistency(format!(
                "feature {} has a non-finite bounding box",
                key
            )));
        }

        Ok(SpatialFeature {
            key,
            planes,
            bounding_box,
        })
    }

    /// Build a feature for one label of a tile's label volume, tracing its
    /// boundary on every plane where the label occurs. A label absent from
    /// every plane is `DegenerateGeometry`.
    pub fn from_label_volume<T>(
        labels: &ArrayView3<T>,
        label: T,
        key: FeatureKey,
        transform: &AffineTransform<f32>,
        z_positions: &[f32],
    ) -> Result<SpatialFeature>
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

        let mut planes = BTreeMap::new();
        for (plane, &z) in z_positions.iter().enumerate() {
            let boundary =
                trace_label_boundaries(&labels.index_axis(Axis(0), plane), label, transform);
            if !boundary.0.is_empty() {
                planes.insert(plane as u32, PlaneBoundary { z, boundary });
            }
        }

        if planes.is_empty() {
            return Err(ReconcileError::DegenerateGeometry {
                tile: key.tile,
                label: label.to_u64().unwrap_or_default(),
                detail: "label absent from every plane".into(),
            });
        }

        SpatialFeature::new(key, planes)
    }

    pub fn key(&self) -> FeatureKey {
        self.key
    }

    pub fn tile(&self) -> TileId {
        self.key.tile
    }

    pub fn local(&self) -> u32 {
        self.key.local
    }

    pub fn planes(&self) -> &BTreeMap<u32, PlaneBoundary> {
        &self.planes
    }

    // z positions in ascending plane order
    pub fn z_coords(&self) -> Vec<f32> {
        self.planes.values().map(|pb| pb.z).collect()
    }

    // z position of the lowest plane
    pub fn representative_z(&self) -> f32 {
        self.planes.values().next().unwrap().z
    }

    pub fn display_id(&self) -> String {
        format!("{}_z_{:.1}", self.key, self.representative_z())
    }

    pub fn bounding_box(&self) -> Rect<f32> {
        self.bounding_box
    }

    pub fn total_area(&self) -> f32 {
        self.planes
            .values()
            .map(|pb| pb.boundary.unsigned_area())
            .sum()
    }

    /// Area-weighted xy centroid over all planes. Features with only
    /// zero-area boundaries fall back to the mean of their vertices.
    pub fn centroid(&self) -> Coord<f32> {
        let mut weight = 0.0;
        let mut acc = Coord { x: 0.0, y: 0.0 };
        for pb in self.planes.values() {
            let area = pb.boundary.unsigned_area();
            if let Some(c) = pb.boundary.centroid() {
                acc.x += area * c.x();
                acc.y += area * c.y();
                weight += area;
            }
        }
        if weight > 0.0 {
            return Coord {
                x: acc.x / weight,
                y: acc.y / weight,
            };
        }

        let mut n = 0;
        let mut acc = Coord { x: 0.0, y: 0.0 };
        for pb in self.planes.values() {
            for poly in pb.boundary.iter() {
                for c in poly.exterior().coords() {
                    acc.x += c.x;
                    acc.y += c.y;
                    n += 1;
                }
            }
        }
        Coord {
            x: acc.x / n.max(1) as f32,
            y: acc.y / n.max(1) as f32,
        }
    }

    // exact boundary equality on identical planes, used to drop duplicates
    pub(crate) fn boundaries_identical(&self, other: &SpatialFeature) -> bool {
        if self.planes.len() != other.planes.len() {
            return false;
        }
        for ((&plane_a, a), (&plane_b, b)) in self.planes.iter().zip(other.planes.iter()) {
            if plane_a != plane_b || a.z != b.z || a.boundary.0.len() != b.boundary.0.len() {
                return false;
            }
            for (poly_a, poly_b) in a.boundary.iter().zip(b.boundary.iter()) {
                if poly_a.exterior().0 != poly_b.exterior().0
                    || poly_a.interiors().len() != poly_b.interiors().len()
                {
                    return false;
                }
                for (ring_a, ring_b) in poly_a.interiors().iter().zip(poly_b.interiors()) {
                    if ring_a.0 != ring_b.0 {
                        return false;
                    }
                }
            }
        }
        true
    }
}

type LatticeEdge = ((i32, i32), (i32, i32));

/// Trace the boundary of every pixel equal to `label` in one plane of a
/// label image. Edges are walked on the integer corner lattice, then mapped
/// through `transform` to global microns. Polygons come back sorted by
/// descending area, with enclosed unlabeled regions as interior rings.
pub(crate) fn trace_label_boundaries<T>(
    plane: &ArrayView2<T>,
    label: T,
    transform: &AffineTransform<f32>,
) -> MultiPolygon<f32>
where
    T: PrimInt,
{
    let (height, width) = plane.dim();

    // every edge between a label pixel and a non-label neighbor, both
    // orientations, in (x, y) corner coordinates
    let mut edges: Vec<LatticeEdge> = Vec::new();
    for ((y, x), &v) in plane.indexed_iter() {
        if v != label {
            continue;
        }
        let (x, y) = (x as i32, y as i32);
        for (δx, δy) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
            let (nx, ny) = (x + δx, y + δy);
            let neighbor_in = nx >= 0
                && ny >= 0
                && nx < width as i32
                && ny < height as i32
                && plane[[ny as usize, nx as usize]] == label;
            if neighbor_in {
                continue;
            }
            push_boundary_edge(&mut edges, x, y, δx, δy);
        }
    }

    let in_label = |corner: (i32, i32)| -> bool {
        let (x, y) = corner;
        x >= 0
            && y >= 0
            && x < width as i32
            && y < height as i32
            && plane[[y as usize, x as usize]] == label
    };

    let mut polygons = boundary_rings(edges, in_label, transform);
    polygons.sort_by(|a, b| b.unsigned_area().total_cmp(&a.unsigned_area()));
    MultiPolygon::new(polygons)
}

/// Trace boundaries of every nonzero label in one plane with a single scan
/// of the image. Same output per label as `trace_label_boundaries`.
pub(crate) fn trace_all_label_boundaries<T>(
    plane: &ArrayView2<T>,
    transform: &AffineTransform<f32>,
) -> BTreeMap<T, MultiPolygon<f32>>
where
    T: PrimInt,
{
    let (height, width) = plane.dim();

    let mut edges_by_label: BTreeMap<T, Vec<LatticeEdge>> = BTreeMap::new();
    for ((y, x), &v) in plane.indexed_iter() {
        if v == T::zero() {
            continue;
        }
        let (x, y) = (x as i32, y as i32);
        for (δx, δy) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
            let (nx, ny) = (x + δx, y + δy);
            let neighbor_in = nx >= 0
                && ny >= 0
                && nx < width as i32
                && ny < height as i32
                && plane[[ny as usize, nx as usize]] == v;
            if neighbor_in {
                continue;
            }
            push_boundary_edge(edges_by_label.entry(v).or_default(), x, y, δx, δy);
        }
    }

    edges_by_label
        .into_iter()
        .map(|(label, edges)| {
            let in_label = |corner: (i32, i32)| -> bool {
                let (x, y) = corner;
                x >= 0
                    && y >= 0
                    && x < width as i32
                    && y < height as i32
                    && plane[[y as usize, x as usize]] == label
            };
            let mut polygons = boundary_rings(edges, in_label, transform);
            polygons.sort_by(|a, b| b.unsigned_area().total_cmp(&a.unsigned_area()));
            (label, MultiPolygon::new(polygons))
        })
        .collect()
}

fn push_boundary_edge(edges: &mut Vec<LatticeEdge>, x: i32, y: i32, δx: i32, δy: i32) {
    let x0 = x.max(x + δx);
    let y0 = y.max(y + δy);
    let edge = ((x0, y0), (x0 + δy.abs(), y0 + δx.abs()));
    edges.push(edge);
    edges.push((edge.1, edge.0));
}

// Walk a set of boundary lattice edges into closed rings and sort each ring
// into an exterior polygon or a hole of the exterior enclosing it. The edge
// set must contain both orientations of every edge. in_label is consulted
// at corners where two pixels of the label touch diagonally.
fn boundary_rings(
    mut edges: Vec<LatticeEdge>,
    in_label: impl Fn((i32, i32)) -> bool,
    transform: &AffineTransform<f32>,
) -> Vec<Polygon<f32>> {
    edges.sort_unstable();

    let mut visited = vec![false; edges.len()];
    let mut exteriors: Vec<Polygon<f32>> = Vec::new();
    let mut holes: Vec<(Point<f32>, LineString<f32>)> = Vec::new();

    while let Some(start) = visited.iter().position(|v| !v) {
        let edge = edges[start];
        mark_visited(&edges, &mut visited, edge);

        let mut ring = vec![edge.0, edge.1];

        while ring.first() != ring.last() {
            let u = *ring.last().unwrap();
            let prev = ring[ring.len() - 2];
            let δx = u.0 - prev.0;
            let δy = u.1 - prev.1;
            assert!(δx.abs() + δy.abs() == 1);

            let first = edges.partition_point(|e| e.0 < u);
            let last = edges.partition_point(|e| e.0 < (u.0, u.1 + 1));
            let unvisited: Vec<usize> = (first..last).filter(|&i| !visited[i]).collect();

            // either an unambiguous continuation or the corner where two
            // label pixels touch diagonally
            assert!(unvisited.len() == 1 || unvisited.len() == 3);

            let next = if unvisited.len() == 1 {
                edges[unvisited[0]]
            } else {
                // turn toward or away from the pixel whose min corner is u,
                // depending on whether it carries the label
                let v = if in_label(u) {
                    match (δx, δy) {
                        (-1, 0) => (u.0, u.1 - 1),
                        (1, 0) => (u.0, u.1 + 1),
                        (0, -1) => (u.0 - 1, u.1),
                        (0, 1) => (u.0 + 1, u.1),
                        _ => unreachable!(),
                    }
                } else {
                    match (δx, δy) {
                        (-1, 0) => (u.0, u.1 + 1),
                        (1, 0) => (u.0, u.1 - 1),
                        (0, -1) => (u.0 + 1, u.1),
                        (0, 1) => (u.0 - 1, u.1),
                        _ => unreachable!(),
                    }
                };
                let edge = (u, v);
                assert!(unvisited.iter().any(|&i| edges[i] == edge));
                edge
            };

            mark_visited(&edges, &mut visited, next);
            ring.push(next.1);
        }

        // a ring always encloses the pixel at its own minimum corner; that
        // pixel carries the label for exterior rings and not for holes
        let &(mx, my) = ring.iter().min().unwrap();
        let is_hole = !in_label((mx, my));

        // convert corner coordinates to μm
        let mut ring: Vec<(f32, f32)> = ring
            .iter()
            .map(|&(x, y)| {
                let c = transform.apply(Coord {
                    x: x as f32,
                    y: y as f32,
                });
                (c.x, c.y)
            })
            .collect();

        if is_hole {
            // wind holes opposite to exteriors
            ring.reverse();
            let inside = transform.apply(Coord {
                x: mx as f32 + 0.5,
                y: my as f32 + 0.5,
            });
            holes.push((Point::from(inside), LineString::from(ring)));
        } else {
            exteriors.push(Polygon::new(LineString::from(ring), Vec::new()));
        }
    }

    // each hole belongs to the smallest exterior that encloses it
    let mut hole_rings: Vec<Vec<LineString<f32>>> = vec![Vec::new(); exteriors.len()];
    for (inside, ring) in holes {
        let parent = exteriors
            .iter()
            .enumerate()
            .filter(|(_, poly)| poly.contains(&inside))
            .min_by(|(_, a), (_, b)| a.unsigned_area().total_cmp(&b.unsigned_area()))
            .map(|(i, _)| i)
            .unwrap();
        hole_rings[parent].push(ring);
    }
    for (poly, rings) in exteriors.iter_mut().zip(hole_rings) {
        for ring in rings {
            poly.interiors_push(ring);
        }
    }

    exteriors
}

fn mark_visited(edges: &[LatticeEdge], visited: &mut [bool], edge: LatticeEdge) {
    let pos = edges.binary_search(&edge).unwrap();
    assert!(!visited[pos]);
    visited[pos] = true;

    let pos = edges.binary_search(&(edge.1, edge.0)).unwrap();
    assert!(!visited[pos]);
    visited[pos] = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, s, Array2, Array3};

    fn identity() -> AffineTransform<f32> {
        AffineTransform::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0)
    }

    #[test]
    fn test_trace_single_pixel() {
        let plane = array![[0u32, 0, 0], [0, 7, 0], [0, 0, 0]];
        let mp = trace_label_boundaries(&plane.view(), 7, &identity());
        assert_eq!(mp.0.len(), 1);
        assert_eq!(mp.unsigned_area(), 1.0);
        let rect = mp.bounding_rect().unwrap();
        assert_eq!(rect.min(), Coord { x: 1.0, y: 1.0 });
        assert_eq!(rect.max(), Coord { x: 2.0, y: 2.0 });
    }

    #[test]
    fn test_trace_rectangle_with_transform() {
        let mut plane = Array2::<u32>::zeros((4, 5));
        plane.slice_mut(s![1..3, 1..4]).fill(2);
        // 0.5μm pixels with the tile origin at (10, 20)
        let transform = AffineTransform::new(0.5, 0.0, 10.0, 0.0, 0.5, 20.0);
        let mp = trace_label_boundaries(&plane.view(), 2, &transform);
        assert_eq!(mp.0.len(), 1);
        assert_eq!(mp.unsigned_area(), 1.5);
        let rect = mp.bounding_rect().unwrap();
        assert_eq!(rect.min(), Coord { x: 10.5, y: 20.5 });
        assert_eq!(rect.max(), Coord { x: 12.0, y: 21.5 });
    }

    #[test]
    fn test_trace_disjoint_blobs_sorted_by_area() {
        let mut plane = Array2::<u32>::zeros((6, 8));
        plane[[1, 1]] = 3;
        plane.slice_mut(s![3..5, 3..7]).fill(3);
        let mp = trace_label_boundaries(&plane.view(), 3, &identity());
        assert_eq!(mp.0.len(), 2);
        assert_eq!(mp.0[0].unsigned_area(), 8.0);
        assert_eq!(mp.0[1].unsigned_area(), 1.0);
    }

    #[test]
    fn test_trace_all_labels_matches_single_label() {
        let mut plane = Array2::<u32>::zeros((5, 5));
        plane.slice_mut(s![0..2, 0..2]).fill(1);
        plane.slice_mut(s![2..5, 2..5]).fill(4);

        let all = trace_all_label_boundaries(&plane.view(), &identity());
        assert_eq!(all.keys().copied().collect::<Vec<u32>>(), vec![1, 4]);
        for (&label, mp) in &all {
            let single = trace_label_boundaries(&plane.view(), label, &identity());
            assert_eq!(mp.0.len(), single.0.len());
            assert_eq!(mp.unsigned_area(), single.unsigned_area());
        }
    }

    #[test]
    fn test_trace_diagonal_touch() {
        let plane = array![[5u32, 0], [0, 5]];
        let mp = trace_label_boundaries(&plane.view(), 5, &identity());
        assert_eq!(mp.unsigned_area(), 2.0);
    }

    #[test]
    fn test_trace_label_with_hole() {
        // 3x3 ring of label pixels around an unlabeled center
        let mut plane = Array2::<u32>::zeros((5, 5));
        plane.slice_mut(s![1..4, 1..4]).fill(6);
        plane[[2, 2]] = 0;

        let mp = trace_label_boundaries(&plane.view(), 6, &identity());
        assert_eq!(mp.0.len(), 1);
        assert_eq!(mp.0[0].interiors().len(), 1);
        assert_eq!(mp.unsigned_area(), 8.0);
        let rect = mp.bounding_rect().unwrap();
        assert_eq!(rect.min(), Coord { x: 1.0, y: 1.0 });
        assert_eq!(rect.max(), Coord { x: 4.0, y: 4.0 });
    }

    #[test]
    fn test_from_label_volume() {
        let mut labels = Array3::<u32>::zeros((3, 4, 4));
        labels.slice_mut(s![0, 1..3, 1..3]).fill(9);
        labels.slice_mut(s![1, 1..3, 1..3]).fill(9);

        let key = FeatureKey::new(2, 0);
        let feature = SpatialFeature::from_label_volume(
            &labels.view(),
            9,
            key,
            &identity(),
            &[0.0, 1.5, 3.0],
        )
        .unwrap();

        assert_eq!(feature.key(), key);
        assert_eq!(feature.planes().len(), 2);
        assert_eq!(feature.z_coords(), vec![0.0, 1.5]);
        assert_eq!(feature.representative_z(), 0.0);
        assert_eq!(feature.total_area(), 8.0);
        assert_eq!(feature.display_id(), "fov_2_cell_0_z_0.0");

        let c = feature.centroid();
        assert!((c.x - 2.0).abs() < 1e-4);
        assert!((c.y - 2.0).abs() < 1e-4);

        let rect = feature.bounding_box();
        assert_eq!(rect.min(), Coord { x: 1.0, y: 1.0 });
        assert_eq!(rect.max(), Coord { x: 3.0, y: 3.0 });
    }

    #[test]
    fn test_absent_label_is_degenerate() {
        let labels = Array3::<u32>::zeros((2, 3, 3));
        let result = SpatialFeature::from_label_volume(
            &labels.view(),
            1,
            FeatureKey::new(0, 0),
            &identity(),
            &[0.0, 1.0],
        );
        assert!(matches!(
            result,
            Err(ReconcileError::DegenerateGeometry { .. })
        ));
    }

    #[test]
    fn test_empty_plane_set_rejected() {
        let result = SpatialFeature::new(FeatureKey::new(0, 0), BTreeMap::new());
        assert!(matches!(
            result,
            Err(ReconcileError::IndexInconsistency(_))
        ));
    }

    #[test]
    fn test_key_ordering() {
        assert!(FeatureKey::new(0, 5) < FeatureKey::new(1, 0));
        assert!(FeatureKey::new(1, 0) < FeatureKey::new(1, 1));
        assert_eq!(FeatureKey::new(3, 17).to_string(), "fov_3_cell_17");
    }
}
