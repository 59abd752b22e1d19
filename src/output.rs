use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::csv;
use arrow::datatypes::DataType;
use flate2::write::GzEncoder;
use flate2::Compression;
use json::JsonValue;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression::ZSTD, ZstdLevel};
use parquet::file::properties::WriterProperties;

use crate::error::Result;
use crate::reconcile::featurestore::multipolygon_json;
use crate::reconcile::resolve::Resolution;
use crate::reconcile::spatialindex::SpatialIndex;
use crate::schemas::{
    cell_metadata_schema, component_audit_schema, large_utf8_if_parquet, OutputFormat,
};

pub fn determine_format(filename: &str, fmtarg: OutputFormat) -> OutputFormat {
    if fmtarg != OutputFormat::Infer {
        return fmtarg;
    }

    if filename.ends_with(".csv.gz") {
        OutputFormat::CsvGz
    } else if filename.ends_with(".csv") {
        OutputFormat::Csv
    } else if filename.ends_with(".parquet") {
        OutputFormat::Parquet
    } else {
        panic!("Unknown file format for: {}", filename);
    }
}

fn write_table(filename: &str, fmt: OutputFormat, batch: &RecordBatch) -> Result<()> {
    let file = File::create(filename)?;
    match fmt {
        OutputFormat::Csv => {
            let mut writer = csv::WriterBuilder::new().with_header(true).build(file);
            writer.write(batch)?;
        }
        OutputFormat::CsvGz => {
            let mut encoder = GzEncoder::new(file, Compression::default());
            {
                let mut writer = csv::WriterBuilder::new()
                    .with_header(true)
                    .build(&mut encoder);
                writer.write(batch)?;
            }
            encoder.finish()?;
        }
        OutputFormat::Parquet => {
            let props = WriterProperties::builder()
                .set_compression(ZSTD(ZstdLevel::try_new(3).unwrap()))
                .build();
            let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
            writer.write(batch)?;
            writer.close()?;
        }
        OutputFormat::Infer => {
            panic!("Output format must be resolved before writing: {}", filename);
        }
    }
    Ok(())
}

fn string_column(
    fmt: OutputFormat,
    values: impl Iterator<Item = String>,
) -> Arc<dyn arrow::array::Array> {
    let values = values.map(Some);
    match large_utf8_if_parquet(fmt) {
        DataType::LargeUtf8 => Arc::new(values.collect::<arrow::array::LargeStringArray>()),
        _ => Arc::new(values.collect::<arrow::array::StringArray>()),
    }
}

// one row per resolved cell
pub fn write_cell_metadata(
    filename: &str,
    fmt: OutputFormat,
    resolution: &Resolution,
    index: &SpatialIndex,
) -> Result<()> {
    // resolution came out of the same index, so owners are always present
    let owners = || {
        resolution
            .cells
            .iter()
            .map(|cell| index.get(cell.canonical).unwrap())
    };

    let columns: Vec<Arc<dyn arrow::array::Array>> = vec![
        Arc::new(
            resolution
                .cells
                .iter()
                .map(|cell| cell.cell)
                .collect::<arrow::array::UInt32Array>(),
        ),
        string_column(fmt, owners().map(|owner| owner.display_id())),
        Arc::new(
            owners()
                .map(|owner| owner.tile())
                .collect::<arrow::array::UInt32Array>(),
        ),
        Arc::new(
            owners()
                .map(|owner| owner.local())
                .collect::<arrow::array::UInt32Array>(),
        ),
        Arc::new(
            owners()
                .map(|owner| owner.centroid().x)
                .collect::<arrow::array::Float32Array>(),
        ),
        Arc::new(
            owners()
                .map(|owner| owner.centroid().y)
                .collect::<arrow::array::Float32Array>(),
        ),
        Arc::new(
            owners()
                .map(|owner| owner.representative_z())
                .collect::<arrow::array::Float32Array>(),
        ),
        Arc::new(
            owners()
                .map(|owner| owner.bounding_box().min().x)
                .collect::<arrow::array::Float32Array>(),
        ),
        Arc::new(
            owners()
                .map(|owner| owner.bounding_box().min().y)
                .collect::<arrow::array::Float32Array>(),
        ),
        Arc::new(
            owners()
                .map(|owner| owner.bounding_box().max().x)
                .collect::<arrow::array::Float32Array>(),
        ),
        Arc::new(
            owners()
                .map(|owner| owner.bounding_box().max().y)
                .collect::<arrow::array::Float32Array>(),
        ),
        Arc::new(
            owners()
                .map(|owner| owner.z_coords().iter().fold(f32::INFINITY, |a, &z| a.min(z)))
                .collect::<arrow::array::Float32Array>(),
        ),
        Arc::new(
            owners()
                .map(|owner| {
                    owner.z_coords().iter().fold(f32::NEG_INFINITY, |a, &z| a.max(z))
                })
                .collect::<arrow::array::Float32Array>(),
        ),
        Arc::new(
            owners()
                .map(|owner| owner.total_area())
                .collect::<arrow::array::Float32Array>(),
        ),
        Arc::new(
            owners()
                .map(|owner| owner.planes().len() as u32)
                .collect::<arrow::array::UInt32Array>(),
        ),
        Arc::new(
            resolution
                .cells
                .iter()
                .map(|cell| Some(cell.ambiguous))
                .collect::<arrow::array::BooleanArray>(),
        ),
    ];

    let batch = RecordBatch::try_new(Arc::new(cell_metadata_schema(fmt)), columns)?;
    write_table(filename, fmt, &batch)
}

// one row per member of every resolved cell, the canonical member
// included and flagged
pub fn write_component_audit(
    filename: &str,
    fmt: OutputFormat,
    resolution: &Resolution,
    index: &SpatialIndex,
) -> Result<()> {
    let rows = || {
        resolution
            .cells
            .iter()
            .flat_map(|cell| cell.members.iter().map(move |&member| (cell, member)))
    };

    let columns: Vec<Arc<dyn arrow::array::Array>> = vec![
        Arc::new(
            rows()
                .map(|(cell, _)| cell.cell)
                .collect::<arrow::array::UInt32Array>(),
        ),
        string_column(
            fmt,
            rows().map(|(_, member)| index.get(member).unwrap().display_id()),
        ),
        Arc::new(
            rows()
                .map(|(_, member)| member.tile)
                .collect::<arrow::array::UInt32Array>(),
        ),
        Arc::new(
            rows()
                .map(|(_, member)| member.local)
                .collect::<arrow::array::UInt32Array>(),
        ),
        // arrow's BooleanArray FromIterator requires a sized iterator,
        // which the flat_map in rows() is not; materialize first
        Arc::new(arrow::array::BooleanArray::from(
            rows()
                .map(|(cell, member)| Some(member == cell.canonical))
                .collect::<Vec<Option<bool>>>(),
        )),
    ];

    let batch = RecordBatch::try_new(Arc::new(component_audit_schema(fmt)), columns)?;
    write_table(filename, fmt, &batch)
}

// gzipped GeoJSON FeatureCollection, one Feature per cell and plane
pub fn write_cell_geometry(
    filename: &str,
    resolution: &Resolution,
    index: &SpatialIndex,
) -> Result<()> {
    let mut features = JsonValue::new_array();
    for cell in &resolution.cells {
        let owner = index.get(cell.canonical).unwrap();
        for (&plane, pb) in owner.planes() {
            let mut properties = JsonValue::new_object();
            properties.insert("cell", cell.cell).unwrap();
            properties.insert("fov", owner.tile()).unwrap();
            properties.insert("label", owner.local()).unwrap();
            properties.insert("plane", plane).unwrap();
            properties.insert("z", pb.z).unwrap();

            let mut feature = JsonValue::new_object();
            feature.insert("type", "Feature").unwrap();
            feature.insert("properties", properties).unwrap();
            feature
                .insert("geometry", multipolygon_json(&pb.boundary))
                .unwrap();
            features.push(feature).unwrap();
        }
    }

    let mut data = JsonValue::new_object();
    data.insert("type", "FeatureCollection").unwrap();
    data.insert("features", features).unwrap();

    let file = File::create(filename)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(data.dump().as_bytes())?;
    encoder.finish()?;
    Ok(())
}
