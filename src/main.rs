use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::Parser;
use indicatif::ProgressBar;
use ndarray::Array3;
use ndarray_npy::ReadNpyExt;
use rayon::current_num_threads;
use rayon::prelude::*;

mod error;
mod output;
mod reconcile;
mod schemas;

use error::{ReconcileError, Result};
use output::{determine_format, write_cell_geometry, write_cell_metadata, write_component_audit};
use reconcile::features::TileId;
use reconcile::featurestore::FeatureStore;
use reconcile::tiles::{read_tile_layout, TileLayout};
use reconcile::{graph_tile, index_tiles, resolve_all, segment_tile, ReconcileConfig};
use schemas::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "stitchseg")]
#[command(version)]
#[command(about = "Reconcile per-FOV cell segmentation into a single 3D cell set.")]
struct Args {
    tile_layout: String,

    mask_dir: String,

    #[arg(long, default_value = "mask_{fov}.npy")]
    mask_pattern: String,

    #[arg(long, default_value = "stitchseg-output")]
    output_dir: String,

    #[arg(long, default_value_t = 0.108)]
    microns_per_pixel: f32,

    #[arg(long, default_value_t = 2048)]
    tile_width: usize,

    #[arg(long, default_value_t = 2048)]
    tile_height: usize,

    #[arg(
        long,
        value_delimiter = ',',
        default_value = "0.0,1.5,3.0,4.5,6.0,7.5,9.0"
    )]
    z_positions: Vec<f32>,

    #[arg(long, default_value_t = false)]
    consistent_z: bool,

    #[arg(long, default_value_t = 6)]
    knn_neighbors: usize,

    #[arg(long, default_value_t = 3.0)]
    link_distance: f32,

    #[arg(long, default_value_t = 0.5)]
    overlap_threshold: f32,

    #[arg(long, default_value_t = 4.0)]
    centroid_cutoff: f32,

    #[arg(long, default_value_t = 4)]
    max_component_tiles: usize,

    #[arg(long, default_value = "cell-metadata.csv.gz")]
    output_cell_metadata: String,

    #[arg(long, value_enum, default_value_t = OutputFormat::Infer)]
    output_cell_metadata_fmt: OutputFormat,

    #[arg(long, default_value = "component-members.csv.gz")]
    output_component_members: String,

    #[arg(long, value_enum, default_value_t = OutputFormat::Infer)]
    output_component_members_fmt: OutputFormat,

    #[arg(long, default_value = "cell-polygons.geojson.gz")]
    output_cell_polygons: String,

    #[arg(short = 't', long, default_value = None)]
    nthreads: Option<usize>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Some(nthreads) = args.nthreads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(nthreads)
            .build_global()
            .unwrap();
    }
    println!("Using {} threads", current_num_threads());

    let layout = read_tile_layout(
        Path::new(&args.tile_layout),
        args.tile_width,
        args.tile_height,
        args.microns_per_pixel,
    )
    .expect("Unable to read tile layout");
    println!("Read layout with {} tiles", layout.len());

    let config = ReconcileConfig {
        knn_neighbors: args.knn_neighbors,
        link_distance: args.link_distance,
        overlap_threshold: args.overlap_threshold,
        centroid_cutoff: args.centroid_cutoff,
        max_component_tiles: args.max_component_tiles,
    };

    let output_dir = PathBuf::from(&args.output_dir);
    let store =
        FeatureStore::open(output_dir.join("features")).expect("Unable to open feature store");
    let refined =
        FeatureStore::open(output_dir.join("refined")).expect("Unable to open refined store");

    println!("Segmenting {} tiles...", layout.len());
    let progress = ProgressBar::new(layout.len() as u64);
    let failures: Mutex<Vec<(TileId, ReconcileError)>> = Mutex::new(Vec::new());
    layout.tiles().par_iter().for_each(|&tile| {
        if let Err(err) = segment_one(tile, &args, &layout, &config, &store) {
            failures.lock().unwrap().push((tile, err));
        }
        progress.inc(1);
    });
    progress.finish();
    report_failures("Segmentation", failures.into_inner().unwrap());

    let index = index_tiles(layout.tiles(), &store).expect("Unable to index features");
    println!("Indexed {} features", index.len());

    println!("Building overlap graphs...");
    let progress = ProgressBar::new(layout.len() as u64);
    let failures: Mutex<Vec<(TileId, ReconcileError)>> = Mutex::new(Vec::new());
    layout.tiles().par_iter().for_each(|&tile| {
        if let Err(err) = graph_tile(tile, &index, &layout, &config, &store) {
            failures.lock().unwrap().push((tile, err));
        }
        progress.inc(1);
    });
    progress.finish();
    report_failures("Overlap graph construction", failures.into_inner().unwrap());

    let (resolution, _) = resolve_all(&layout, &index, &config, &store, &refined)
        .expect("Unable to resolve cell ownership");
    let ambiguous = resolution.cells.iter().filter(|cell| cell.ambiguous).count();
    println!(
        "Resolved {} cells ({} flagged ambiguous)",
        resolution.len(),
        ambiguous
    );

    let path = output_dir.join(&args.output_cell_metadata);
    let path = path.to_str().unwrap();
    let fmt = determine_format(path, args.output_cell_metadata_fmt);
    write_cell_metadata(path, fmt, &resolution, &index).expect("Unable to write cell metadata");

    let path = output_dir.join(&args.output_component_members);
    let path = path.to_str().unwrap();
    let fmt = determine_format(path, args.output_component_members_fmt);
    write_component_audit(path, fmt, &resolution, &index)
        .expect("Unable to write component members");

    let path = output_dir.join(&args.output_cell_polygons);
    let path = path.to_str().unwrap();
    write_cell_geometry(path, &resolution, &index).expect("Unable to write cell polygons");

    println!("Done");
}

fn segment_one(
    tile: TileId,
    args: &Args,
    layout: &TileLayout,
    config: &ReconcileConfig,
    store: &FeatureStore,
) -> Result<usize> {
    let filename = args.mask_pattern.replace("{fov}", &tile.to_string());
    let path = Path::new(&args.mask_dir).join(filename);
    let labels = read_label_volume(tile, &path)?;
    segment_tile(
        tile,
        &labels.view(),
        &args.z_positions,
        !args.consistent_z,
        layout,
        config,
        store,
    )
}

// accepts the integer dtypes segmenters commonly emit
fn read_label_volume(tile: TileId, path: &Path) -> Result<Array3<u32>> {
    let mask_err = |detail: String| ReconcileError::MaskRead {
        tile,
        path: path.display().to_string(),
        detail,
    };

    let bytes = fs::read(path).map_err(|err| mask_err(err.to_string()))?;

    if let Ok(labels) = Array3::<u32>::read_npy(&bytes[..]) {
        return Ok(labels);
    }
    if let Ok(labels) = Array3::<u16>::read_npy(&bytes[..]) {
        return Ok(labels.mapv(u32::from));
    }
    if let Ok(labels) = Array3::<u8>::read_npy(&bytes[..]) {
        return Ok(labels.mapv(u32::from));
    }
    if let Ok(labels) = Array3::<i32>::read_npy(&bytes[..]) {
        if let Some(&v) = labels.iter().find(|&&v| v < 0) {
            return Err(mask_err(format!("negative label value {}", v)));
        }
        return Ok(labels.mapv(|v| v as u32));
    }
    if let Ok(labels) = Array3::<i64>::read_npy(&bytes[..]) {
        if let Some(&v) = labels.iter().find(|&&v| v < 0 || v > u32::MAX as i64) {
            return Err(mask_err(format!("label value {} out of range", v)));
        }
        return Ok(labels.mapv(|v| v as u32));
    }

    Err(mask_err(
        "unsupported dtype or malformed npy file; expected a 3d integer array".into(),
    ))
}

fn report_failures(stage: &str, failures: Vec<(TileId, ReconcileError)>) {
    if failures.is_empty() {
        return;
    }
    for (tile, err) in &failures {
        eprintln!("tile {}: {}", tile, err);
    }
    panic!("{} failed for {} of the tiles", stage, failures.len());
}
