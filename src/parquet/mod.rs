//! Handles serialising archive files to disk in the _parquet_ file format.

pub mod cell;
pub mod grid;
pub mod image;

use std::path::Path;

use arrow::record_batch::RecordBatch;
use parquet::{
    basic::{Compression, ZstdLevel},
    file::properties::WriterProperties,
};

use crate::error::{ArchiveError, Result};

pub use cell::{load_cell, load_cell_times, merge_cell, StoredTimes};
pub use grid::{load_grid_index, load_product_grid, save_grid_index};
pub use image::{image_variables, load_image};

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build()
}

/// Downcasts a column, reporting the file on a type mismatch.
fn column<'a, T: 'static>(batch: &'a RecordBatch, index: usize, path: &Path) -> Result<&'a T> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| {
            ArchiveError::corrupt(
                path,
                format!(
                    "column `{}` has unexpected type {}",
                    batch.schema().field(index).name(),
                    batch.column(index).data_type()
                ),
            )
        })
}

fn column_by_name<'a, T: 'static>(batch: &'a RecordBatch, name: &str, path: &Path) -> Result<&'a T> {
    let index = batch
        .schema()
        .index_of(name)
        .map_err(|_| ArchiveError::corrupt(path, format!("missing column `{}`", name)))?;

    column(batch, index, path)
}
