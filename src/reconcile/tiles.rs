use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::StringRecord;
use flate2::read::GzDecoder;
use geo::geometry::{Coord, Rect};
use geo::{AffineTransform, Intersects};

use crate::error::{ReconcileError, Result};
use crate::reconcile::features::TileId;

// Immutable description of the imaging grid. Each tile (field of view) has
// a stage position in microns. Its FOV box is the axis-aligned rectangle
// covered by the tile's pixel extent after the micron transform.
#[derive(Debug, Clone)]
pub struct TileLayout {
    tiles: Vec<TileId>,
    boxes: HashMap<TileId, Rect<f32>>,
    transforms: HashMap<TileId, AffineTransform<f32>>,
}

impl TileLayout {
    // The pixel extent and scale are shared by every tile. Duplicate tile
    // ids are rejected.
    pub fn from_positions(
        positions: &[(TileId, f32, f32)],
        width_px: usize,
        height_px: usize,
        microns_per_pixel: f32,
    ) -> Result<TileLayout> {
        if positions.is_empty() {
            return Err(ReconcileError::MalformedLayout(
                "no tile positions given".into(),
            ));
        }
        if !(microns_per_pixel.is_finite() && microns_per_pixel > 0.0) {
            return Err(ReconcileError::MalformedLayout(format!(
                "microns_per_pixel must be positive, got {}",
                microns_per_pixel
            )));
        }

        let width_μm = width_px as f32 * microns_per_pixel;
        let height_μm = height_px as f32 * microns_per_pixel;

        let mut tiles = Vec::with_capacity(positions.len());
        let mut boxes = HashMap::with_capacity(positions.len());
        let mut transforms = HashMap::with_capacity(positions.len());
        for &(tile, x0, y0) in positions {
            if !(x0.is_finite() && y0.is_finite()) {
                return Err(ReconcileError::MalformedLayout(format!(
                    "tile {} has non-finite stage position ({}, {})",
                    tile, x0, y0
                )));
            }
            if boxes
                .insert(
                    tile,
                    Rect::new(
                        Coord { x: x0, y: y0 },
                        Coord {
                            x: x0 + width_μm,
                            y: y0 + height_μm,
                        },
                    ),
                )
                .is_some()
            {
                return Err(ReconcileError::MalformedLayout(format!(
                    "tile {} listed more than once",
                    tile
                )));
            }

            // pixel (col, row) to global micron coordinates
            transforms.insert(
                tile,
                AffineTransform::new(microns_per_pixel, 0.0, x0, 0.0, microns_per_pixel, y0),
            );
            tiles.push(tile);
        }
        tiles.sort_unstable();

        Ok(TileLayout {
            tiles,
            boxes,
            transforms,
        })
    }

    // ascending order
    pub fn tiles(&self) -> &[TileId] {
        &self.tiles
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn contains(&self, tile: TileId) -> bool {
        self.boxes.contains_key(&tile)
    }

    pub fn fov_box(&self, tile: TileId) -> Result<Rect<f32>> {
        self.boxes.get(&tile).copied().ok_or_else(|| {
            ReconcileError::MalformedLayout(format!("tile {} not present in layout", tile))
        })
    }

    pub fn fov_center(&self, tile: TileId) -> Result<Coord<f32>> {
        Ok(self.fov_box(tile)?.center())
    }

    // pixel coordinates to global microns
    pub fn transform(&self, tile: TileId) -> Result<&AffineTransform<f32>> {
        self.transforms.get(&tile).ok_or_else(|| {
            ReconcileError::MalformedLayout(format!("tile {} not present in layout", tile))
        })
    }

    // tiles whose FOV boxes intersect the given tile's box, in ascending
    // order, the tile itself included
    pub fn intersecting_tiles(&self, tile: TileId) -> Result<Vec<TileId>> {
        let fov_box = self.fov_box(tile)?;
        Ok(self
            .tiles
            .iter()
            .copied()
            .filter(|&other| fov_box.intersects(&self.boxes[&other]))
            .collect())
    }
}

fn find_column(headers: &StringRecord, column: &str) -> Result<usize> {
    headers
        .iter()
        .position(|x| x == column)
        .ok_or_else(|| ReconcileError::MalformedLayout(format!("missing column '{}'", column)))
}

/// Read a tile layout from a csv file with columns fov, x, y giving stage
/// positions in microns. Gzipped input is detected by extension.
pub fn read_tile_layout(
    path: &Path,
    width_px: usize,
    height_px: usize,
    microns_per_pixel: f32,
) -> Result<TileLayout> {
    let input = File::open(path)?;
    let input: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(GzDecoder::new(input))
    } else {
        Box::new(input)
    };
    let mut rdr = csv::Reader::from_reader(input);

    let headers = rdr
        .headers()
        .map_err(|err| ReconcileError::MalformedLayout(format!("unreadable header: {}", err)))?
        .clone();
    let fov_col = find_column(&headers, "fov")?;
    let x_col = find_column(&headers, "x")?;
    let y_col = find_column(&headers, "y")?;

    let mut positions = Vec::new();
    for (i, rec) in rdr.records().enumerate() {
        let rec =
            rec.map_err(|err| ReconcileError::MalformedLayout(format!("row {}: {}", i, err)))?;
        let parse = |col: usize, name: &str| -> Result<f32> {
            rec[col].parse::<f32>().map_err(|_| {
                ReconcileError::MalformedLayout(format!(
                    "row {}: cannot parse {} value '{}'",
                    i, name, &rec[col]
                ))
            })
        };
        let fov = rec[fov_col].parse::<TileId>().map_err(|_| {
            ReconcileError::MalformedLayout(format!(
                "row {}: cannot parse fov value '{}'",
                i, &rec[fov_col]
            ))
        })?;
        positions.push((fov, parse(x_col, "x")?, parse(y_col, "y")?));
    }

    TileLayout::from_positions(&positions, width_px, height_px, microns_per_pixel)
}
