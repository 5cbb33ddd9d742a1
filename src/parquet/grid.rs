//! Save and load the archive's grid index, and read the product grid of a raw
//! image archive.

use std::{fs::File, path::Path, sync::Arc};

use arrow::{
    array::{ArrayRef, Float32Array, Float64Array, Int32Array, UInt32Array},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use parquet::arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter};
use tempfile::NamedTempFile;

use crate::{
    error::{ArchiveError, Result},
    grid::{GridIndex, GridPartitioner, GridPoint},
};

use super::{column_by_name, writer_properties};

pub const GRID_FILE: &str = "grid.parquet";

/// Writes the index next to its final path, then renames it into place.
pub fn save_grid_index(index: &GridIndex, path: &Path) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;

    let schema = Arc::new(Schema::new(vec![
        Field::new("gpi", DataType::UInt32, false),
        Field::new("lon", DataType::Float64, false),
        Field::new("lat", DataType::Float64, false),
        Field::new("cell", DataType::Int32, false),
    ]));

    let points = index.points();
    let columns: Vec<ArrayRef> = vec![
        Arc::new(UInt32Array::from_iter_values(points.iter().map(|p| p.gpi))),
        Arc::new(Float64Array::from_iter_values(points.iter().map(|p| p.lon))),
        Arc::new(Float64Array::from_iter_values(points.iter().map(|p| p.lat))),
        Arc::new(Int32Array::from(index.cells().to_vec())),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns)?;

    let mut writer = ArrowWriter::try_new(tmp.as_file_mut(), schema, Some(writer_properties()))?;
    writer.write(&batch)?;
    writer.close()?;

    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// Loads an index and re-derives its partition under `cell_size`.
pub fn load_grid_index(path: &Path, cell_size: f64) -> Result<GridIndex> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut points = Vec::new();
    let mut stored_cells = Vec::new();

    for batch in reader {
        let batch = batch?;
        let gpis = column_by_name::<UInt32Array>(&batch, "gpi", path)?;
        let lons = column_by_name::<Float64Array>(&batch, "lon", path)?;
        let lats = column_by_name::<Float64Array>(&batch, "lat", path)?;
        let cells = column_by_name::<Int32Array>(&batch, "cell", path)?;

        for row in 0..batch.num_rows() {
            points.push(GridPoint::new(gpis.value(row), lons.value(row), lats.value(row)));
            stored_cells.push(cells.value(row));
        }
    }

    let index = GridPartitioner::new(cell_size)?.build(&points);
    if index.cells() != stored_cells.as_slice() {
        return Err(ArchiveError::corrupt(
            path,
            format!("stored cells do not match a {}° tiling", cell_size),
        ));
    }

    Ok(index)
}

/// Reads the `lon`/`lat` (and optional `land` fraction) columns of a raw
/// archive's grid definition. The row number is the grid point id.
pub fn load_product_grid(path: &Path) -> Result<(Vec<GridPoint>, Option<Vec<f32>>)> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let has_land = builder.schema().index_of("land").is_ok();

    let mut points = Vec::new();
    let mut land = has_land.then(Vec::new);

    for batch in builder.build()? {
        let batch = batch?;
        let lons = column_by_name::<Float64Array>(&batch, "lon", path)?;
        let lats = column_by_name::<Float64Array>(&batch, "lat", path)?;

        for row in 0..batch.num_rows() {
            let gpi = points.len() as u32;
            points.push(GridPoint::new(gpi, lons.value(row), lats.value(row)));
        }

        if let Some(land) = land.as_mut() {
            let fractions = column_by_name::<Float32Array>(&batch, "land", path)?;
            land.extend(fractions.iter().map(|v| v.unwrap_or(0.0)));
        }
    }

    Ok((points, land))
}

#[cfg(test)]
pub fn save_product_grid(path: &Path, coords: &[(f64, f64)], land: Option<&[f32]>) -> Result<()> {
    let mut fields = vec![
        Field::new("lon", DataType::Float64, false),
        Field::new("lat", DataType::Float64, false),
    ];
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(Float64Array::from_iter_values(coords.iter().map(|c| c.0))),
        Arc::new(Float64Array::from_iter_values(coords.iter().map(|c| c.1))),
    ];
    if let Some(land) = land {
        fields.push(Field::new("land", DataType::Float32, true));
        columns.push(Arc::new(Float32Array::from(land.to_vec())));
    }

    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema.clone(), columns)?;
    let mut writer = ArrowWriter::try_new(File::create(path)?, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(())
}

// -- Tests -------------------------------------------------------------------
