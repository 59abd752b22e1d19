
// Maintain file schemas shared between output.rs and downstream readers.

use arrow::datatypes::{DataType, Field, Schema};
use clap::ValueEnum;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    Infer,
    Csv,
    CsvGz,
    Parquet,
}

pub fn large_utf8_if_parquet(fmt: OutputFormat) -> DataType {
    match fmt {
        OutputFormat::Parquet => DataType::LargeUtf8,
        _ => DataType::Utf8,
    }
}

pub fn cell_metadata_schema(fmt: OutputFormat) -> Schema {
    Schema::new(vec![
        Field::new("cell", DataType::UInt32, false),
        Field::new("feature", large_utf8_if_parquet(fmt), false),
        Field::new("fov", DataType::UInt32, false),
        Field::new("label", DataType::UInt32, false),
        Field::new("centroid_x", DataType::Float32, false),
        Field::new("centroid_y", DataType::Float32, false),
        Field::new("centroid_z", DataType::Float32, false),
        Field::new("min_x", DataType::Float32, false),
        Field::new("min_y", DataType::Float32, false),
        Field::new("max_x", DataType::Float32, false),
        Field::new("max_y", DataType::Float32, false),
        Field::new("z_min", DataType::Float32, false),
        Field::new("z_max", DataType::Float32, false),
        Field::new("total_area", DataType::Float32, false),
        Field::new("nplanes", DataType::UInt32, false),
        Field::new("ambiguous", DataType::Boolean, false),
    ])
}

// records which duplicate won, so downstream tooling can trace a dropped
// segmentation back to the cell that superseded it
pub fn component_audit_schema(fmt: OutputFormat) -> Schema {
    Schema::new(vec![
        Field::new("cell", DataType::UInt32, false),
        Field::new("member", large_utf8_if_parquet(fmt), false),
        Field::new("member_fov", DataType::UInt32, false),
        Field::new("member_label", DataType::UInt32, false),
        Field::new("canonical", DataType::Boolean, false),
    ])
}
