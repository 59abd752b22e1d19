use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use geo::geometry::{LineString, MultiPolygon, Polygon};
use json::JsonValue;

use crate::error::{ReconcileError, Result};
use crate::reconcile::features::{FeatureKey, PlaneBoundary, SpatialFeature, TileId};
use crate::reconcile::overlap::TileGraph;

// On-disk persistence for per-tile features and overlap graphs. Each tile
// gets one gzipped GeoJSON file of its features and one gzipped JSON file
// of its overlap graph, so segmentation and graph construction can run
// tile by tile in separate passes and in parallel.
pub struct FeatureStore {
    root: PathBuf,
}

impl FeatureStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<FeatureStore> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FeatureStore { root })
    }

    pub fn features_path(&self, tile: TileId) -> PathBuf {
        self.root.join(format!("features_{}.geojson.gz", tile))
    }

    pub fn graph_path(&self, tile: TileId) -> PathBuf {
        self.root.join(format!("graph_{}.json.gz", tile))
    }

    // true once write_features has completed for this tile, an empty
    // feature set included
    pub fn has_features(&self, tile: TileId) -> bool {
        self.features_path(tile).exists()
    }

    // one GeoJSON Feature per (cell, plane), replacing any previous file
    // for the tile atomically
    pub fn write_features(&self, tile: TileId, features: &[SpatialFeature]) -> Result<()> {
        let mut collection = JsonValue::new_array();
        for feature in features {
            if feature.tile() != tile {
                return Err(ReconcileError::IndexInconsistency(format!(
                    "feature {} written to tile {}'s store",
                    feature.key(),
                    tile
                )));
            }
            for (&plane, pb) in feature.planes() {
                collection.push(feature_json(feature.key(), plane, pb)).unwrap();
            }
        }

        let mut data = JsonValue::new_object();
        data.insert("type", "FeatureCollection").unwrap();
        data.insert("features", collection).unwrap();
        write_gz_json(&self.features_path(tile), &data)
    }

    // ascending key order, a tile with no file yet reads as empty
    pub fn read_features(&self, tile: TileId) -> Result<Vec<SpatialFeature>> {
        let path = self.features_path(tile);
        let content = match read_gz(&path)? {
            Some(content) => content,
            None => return Ok(Vec::new()),
        };
        let data = json::parse(&content)
            .map_err(|err| malformed(&path, format!("unparseable json: {}", err)))?;

        // regroup (cell, plane) features into per-cell plane maps
        let mut grouped: BTreeMap<u32, BTreeMap<u32, PlaneBoundary>> = BTreeMap::new();
        for entry in data["features"].members() {
            let properties = &entry["properties"];
            let cell = properties["cell"]
                .as_u32()
                .ok_or_else(|| malformed(&path, "feature without a cell property".into()))?;
            let fov = properties["fov"]
                .as_u32()
                .ok_or_else(|| malformed(&path, "feature without a fov property".into()))?;
            if fov != tile {
                return Err(malformed(
                    &path,
                    format!("feature from fov {} in tile {}'s file", fov, tile),
                ));
            }
            let plane = properties["plane"]
                .as_u32()
                .ok_or_else(|| malformed(&path, "feature without a plane property".into()))?;
            let z = properties["z"]
                .as_f32()
                .ok_or_else(|| malformed(&path, "feature without a z property".into()))?;
            let boundary = parse_multipolygon(&entry["geometry"])
                .map_err(|detail| malformed(&path, detail))?;

            match grouped.entry(cell).or_default().entry(plane) {
                Entry::Vacant(e) => {
                    e.insert(PlaneBoundary { z, boundary });
                }
                Entry::Occupied(_) => {
                    return Err(malformed(
                        &path,
                        format!("cell {} appears twice on plane {}", cell, plane),
                    ));
                }
            }
        }

        let mut features = Vec::with_capacity(grouped.len());
        for (local, planes) in grouped {
            features.push(SpatialFeature::new(FeatureKey::new(tile, local), planes)?);
        }
        Ok(features)
    }

    pub fn write_tile_graph(&self, tile: TileId, graph: &TileGraph) -> Result<()> {
        if graph.tile() != tile {
            return Err(ReconcileError::IndexInconsistency(format!(
                "graph for tile {} written to tile {}'s store",
                graph.tile(),
                tile
            )));
        }
        write_gz_json(&self.graph_path(tile), &graph.to_json())
    }

    // None if the graph was never written
    pub fn read_tile_graph(&self, tile: TileId) -> Result<Option<TileGraph>> {
        let path = self.graph_path(tile);
        let content = match read_gz(&path)? {
            Some(content) => content,
            None => return Ok(None),
        };
        let data = json::parse(&content)
            .map_err(|err| malformed(&path, format!("unparseable json: {}", err)))?;
        let graph = TileGraph::from_json(&data).map_err(|detail| malformed(&path, detail))?;
        if graph.tile() != tile {
            return Err(malformed(
                &path,
                format!("graph for tile {} in tile {}'s file", graph.tile(), tile),
            ));
        }
        Ok(Some(graph))
    }
}

fn malformed(path: &Path, detail: String) -> ReconcileError {
    ReconcileError::MalformedStore {
        path: path.display().to_string(),
        detail,
    }
}

// write through a temp file so readers never see a partial gzip stream
fn write_gz_json(path: &Path, data: &JsonValue) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let file = File::create(&tmp)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(data.dump().as_bytes())?;
        encoder.finish()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_gz(path: &Path) -> Result<Option<String>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut content = String::new();
    GzDecoder::new(file)
        .read_to_string(&mut content)
        .map_err(|err| malformed(path, format!("not a gzip stream: {}", err)))?;
    Ok(Some(content))
}

fn feature_json(key: FeatureKey, plane: u32, pb: &PlaneBoundary) -> JsonValue {
    let mut properties = JsonValue::new_object();
    properties.insert("cell", key.local).unwrap();
    properties.insert("fov", key.tile).unwrap();
    properties.insert("plane", plane).unwrap();
    properties.insert("z", pb.z).unwrap();

    let mut feature = JsonValue::new_object();
    feature.insert("type", "Feature").unwrap();
    feature.insert("properties", properties).unwrap();
    feature.insert("geometry", multipolygon_json(&pb.boundary)).unwrap();
    feature
}

fn ring_json(ring: &LineString<f32>) -> JsonValue {
    let mut out = JsonValue::new_array();
    for coord in ring.coords() {
        out.push(JsonValue::from(vec![
            JsonValue::from(coord.x),
            JsonValue::from(coord.y),
        ]))
        .unwrap();
    }
    out
}

pub(crate) fn multipolygon_json(boundary: &MultiPolygon<f32>) -> JsonValue {
    let mut coordinates = JsonValue::new_array();
    for poly in boundary.iter() {
        let mut rings = JsonValue::new_array();
        rings.push(ring_json(poly.exterior())).unwrap();
        for interior in poly.interiors() {
            rings.push(ring_json(interior)).unwrap();
        }
        coordinates.push(rings).unwrap();
    }

    let mut geometry = JsonValue::new_object();
    geometry.insert("type", "MultiPolygon").unwrap();
    geometry.insert("coordinates", coordinates).unwrap();
    geometry
}

fn parse_multipolygon(geometry: &JsonValue) -> std::result::Result<MultiPolygon<f32>, String> {
    if geometry["type"] != "MultiPolygon" {
        return Err(format!(
            "geometry type {} where MultiPolygon expected",
            geometry["type"]
        ));
    }

    let mut polygons = Vec::new();
    for rings in geometry["coordinates"].members() {
        // ring 0 is the exterior, the rest are holes
        let mut parsed = Vec::new();
        for ring in rings.members() {
            let mut coords: Vec<(f32, f32)> = Vec::new();
            for coord in ring.members() {
                let x = coord[0].as_f32().ok_or("malformed coordinate")?;
                let y = coord[1].as_f32().ok_or("malformed coordinate")?;
                coords.push((x, y));
            }
            if coords.is_empty() {
                return Err("polygon with an empty ring".into());
            }
            parsed.push(LineString::from(coords));
        }
        let mut parsed = parsed.into_iter();
        let exterior = parsed.next().ok_or("polygon with no rings")?;
        polygons.push(Polygon::new(exterior, parsed.collect()));
    }
    if polygons.is_empty() {
        return Err("geometry with no polygons".into());
    }
    Ok(MultiPolygon::new(polygons))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn square_feature(tile: TileId, local: u32, x0: f32, y0: f32, size: f32) -> SpatialFeature {
        let mut planes = BTreeMap::new();
        for (plane, z) in [(2u32, 1.5f32), (3, 3.0)] {
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
            planes.insert(plane, PlaneBoundary { z, boundary });
        }
        SpatialFeature::new(FeatureKey::new(tile, local), planes).unwrap()
    }

    #[test]
    fn test_feature_round_trip() {
        let dir = tempdir().unwrap();
        let store = FeatureStore::open(dir.path()).unwrap();

        let written = vec![
            square_feature(4, 0, 0.25, 0.75, 10.0),
            square_feature(4, 3, 20.0, 20.0, 5.0),
        ];
        assert!(!store.has_features(4));
        store.write_features(4, &written).unwrap();
        assert!(store.has_features(4));

        let read = store.read_features(4).unwrap();
        assert_eq!(read.len(), written.len());
        for (r, w) in read.iter().zip(&written) {
            assert_eq!(r.key(), w.key());
            assert_eq!(r.z_coords(), w.z_coords());
            assert!(r.boundaries_identical(w));
        }

        // rewriting replaces rather than appends
        store.write_features(4, &written[..1]).unwrap();
        assert_eq!(store.read_features(4).unwrap().len(), 1);
    }

    #[test]
    fn test_interior_ring_round_trip() {
        let dir = tempdir().unwrap();
        let store = FeatureStore::open(dir.path()).unwrap();

        let outer = LineString::from(vec![
            (0.0, 0.0),
            (4.0, 0.0),
            (4.0, 4.0),
            (0.0, 4.0),
            (0.0, 0.0),
        ]);
        let hole = LineString::from(vec![
            (1.0, 1.0),
            (1.0, 2.0),
            (2.0, 2.0),
            (2.0, 1.0),
            (1.0, 1.0),
        ]);
        let boundary = MultiPolygon::new(vec![Polygon::new(outer, vec![hole])]);
        let mut planes = BTreeMap::new();
        planes.insert(0, PlaneBoundary { z: 0.0, boundary });
        let written = vec![SpatialFeature::new(FeatureKey::new(1, 0), planes).unwrap()];

        store.write_features(1, &written).unwrap();
        let read = store.read_features(1).unwrap();
        assert_eq!(read.len(), 1);
        assert!(read[0].boundaries_identical(&written[0]));
        assert_eq!(read[0].total_area(), 15.0);
    }

    #[test]
    fn test_empty_tile_round_trip() {
        let dir = tempdir().unwrap();
        let store = FeatureStore::open(dir.path()).unwrap();

        assert_eq!(store.read_features(9).unwrap().len(), 0);
        assert!(!store.has_features(9));

        store.write_features(9, &[]).unwrap();
        assert!(store.has_features(9));
        assert_eq!(store.read_features(9).unwrap().len(), 0);
    }

    #[test]
    fn test_graph_round_trip() {
        let dir = tempdir().unwrap();
        let store = FeatureStore::open(dir.path()).unwrap();

        assert!(store.read_tile_graph(2).unwrap().is_none());

        let mut graph = TileGraph::new(2);
        graph.add_node(FeatureKey::new(2, 5));
        graph.add_edge(FeatureKey::new(2, 0), FeatureKey::new(3, 1), 0.75);
        store.write_tile_graph(2, &graph).unwrap();

        let read = store.read_tile_graph(2).unwrap().unwrap();
        assert_eq!(read, graph);
    }

    #[test]
    fn test_wrong_tile_rejected() {
        let dir = tempdir().unwrap();
        let store = FeatureStore::open(dir.path()).unwrap();

        let result = store.write_features(1, &[square_feature(4, 0, 0.0, 0.0, 1.0)]);
        assert!(matches!(result, Err(ReconcileError::IndexInconsistency(_))));

        let result = store.write_tile_graph(1, &TileGraph::new(2));
        assert!(matches!(result, Err(ReconcileError::IndexInconsistency(_))));
    }

    #[test]
    fn test_corrupt_file_reported() {
        let dir = tempdir().unwrap();
        let store = FeatureStore::open(dir.path()).unwrap();

        fs::write(store.features_path(0), b"not gzip at all").unwrap();
        assert!(matches!(
            store.read_features(0),
            Err(ReconcileError::MalformedStore { .. })
        ));

        fs::write(store.graph_path(0), b"not gzip at all").unwrap();
        assert!(matches!(
            store.read_tile_graph(0),
            Err(ReconcileError::MalformedStore { .. })
        ));
    }
}
