use thiserror::Error;

use crate::reconcile::features::TileId;

// Per-tile errors (MissingInput, DegenerateGeometry, MaskRead) are isolated
// by the pipeline driver: they fail the affected tile without aborting its
// siblings. Whole-dataset errors (IncompleteComposition, IndexInconsistency)
// stop the run.
#[derive(Error, Debug)]
pub enum ReconcileError {
    // recoverable by retrying the tile once the neighbors are produced
    #[error("tile {tile}: neighbor features missing for tiles {missing:?}")]
    MissingInput { tile: TileId, missing: Vec<TileId> },

    // the feature is skipped and logged, not fatal to the tile
    #[error("tile {tile}, label {label}: {detail}")]
    DegenerateGeometry {
        tile: TileId,
        label: u64,
        detail: String,
    },

    // raised at construction so invalid entries never reach the index
    #[error("inconsistent index entry: {0}")]
    IndexInconsistency(String),

    #[error("global graph incomplete: no overlap graph for tiles {missing:?}")]
    IncompleteComposition { missing: Vec<TileId> },

    #[error("malformed store file {path}: {detail}")]
    MalformedStore { path: String, detail: String },

    #[error("malformed tile layout: {0}")]
    MalformedLayout(String),

    #[error("tile {tile}: cannot read label volume {path}: {detail}")]
    MaskRead {
        tile: TileId,
        path: String,
        detail: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
