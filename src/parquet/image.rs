//! Read raw images: one Float32 column per variable, one row per grid point.

use std::{collections::BTreeMap, fs::File, path::Path};

use arrow::{array::Float32Array, datatypes::DataType};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::{error::Result, image::MISSING};

use super::column_by_name;

/// Names of the variable columns in an image file.
pub fn image_variables(path: &Path) -> Result<Vec<String>> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;

    Ok(builder
        .schema()
        .fields()
        .iter()
        .filter(|f| f.data_type() == &DataType::Float32)
        .map(|f| f.name().clone())
        .collect())
}

/// Loads the requested variables present in the file. Returns the number of
/// rows alongside the columns; nulls become the missing-value sentinel.
pub fn load_image(path: &Path, variables: &[String]) -> Result<(usize, BTreeMap<String, Vec<f32>>)> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    let present: Vec<String> = variables
        .iter()
        .filter(|name| builder.schema().index_of(name).is_ok())
        .cloned()
        .collect();

    let mut rows = 0;
    let mut data: BTreeMap<String, Vec<f32>> = present
        .iter()
        .map(|name| (name.clone(), Vec::new()))
        .collect();

    for batch in builder.build()? {
        let batch = batch?;
        rows += batch.num_rows();

        for name in &present {
            let array = column_by_name::<Float32Array>(&batch, name, path)?;
            if let Some(values) = data.get_mut(name) {
                values.extend(array.iter().map(|v| v.unwrap_or(MISSING)));
            }
        }
    }

    Ok((rows, data))
}

#[cfg(test)]
pub fn save_image(path: &Path, columns: &[(&str, Vec<f32>)]) -> Result<()> {
    use std::sync::Arc;

    use arrow::{
        array::ArrayRef,
        datatypes::{Field, Schema},
        record_batch::RecordBatch,
    };
    use parquet::arrow::ArrowWriter;

    let schema = Arc::new(Schema::new(
        columns
            .iter()
            .map(|(name, _)| Field::new(*name, DataType::Float32, true))
            .collect::<Vec<_>>(),
    ));
    let arrays: Vec<ArrayRef> = columns
        .iter()
        .map(|(_, values)| Arc::new(Float32Array::from(values.clone())) as ArrayRef)
        .collect();

    let batch = RecordBatch::try_new(schema.clone(), arrays)?;
    let mut writer = ArrowWriter::try_new(File::create(path)?, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(())
}

// -- Tests -------------------------------------------------------------------
