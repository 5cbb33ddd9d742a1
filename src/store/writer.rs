//! Appends buffered images into per-cell stores.
//!
//! A flush touches each cell once. Only the stored location and time columns
//! are read to validate the batch; the stored rows are then streamed, with the
//! batch merged in, to a temp file next to the archive. Staged cells are
//! renamed into place only when every cell of the batch staged cleanly.

use std::{
    collections::{BTreeMap, BTreeSet},
    num::NonZeroUsize,
    path::PathBuf,
    sync::Arc,
    thread,
};

use chrono::NaiveDateTime;
use futures::future::join_all;
use tempfile::{NamedTempFile, TempPath};
use tokio::task;
use tracing::{debug, error};

use crate::{
    error::{ArchiveError, Result},
    grid::GridIndex,
    image::Image,
    parquet::{load_cell_times, merge_cell, StoredTimes},
};

use super::{cell_path, CellStore};

const DEFAULT_CONCURRENCY: usize = 4;

pub struct CellWriter {
    root: PathBuf,
    variables: Vec<String>,
    /// Cells processed at once by `write_batch`.
    concurrency: usize,
}

/// Exclusive access to one cell store. Dropping a handle without closing it
/// discards everything written through it.
#[derive(Debug)]
pub struct CellHandle {
    path: PathBuf,
    stored: Option<StoredTimes>,
    appended: CellStore,
    count: usize,
}

impl CellHandle {
    pub fn cell(&self) -> i32 {
        self.appended.cell()
    }

    /// Entries appended since the handle was opened.
    pub fn appended(&self) -> usize {
        self.count
    }
}

/// A cell rewritten to a closed temp file, waiting to replace the live file.
#[derive(Debug)]
pub struct StagedCell {
    cell: i32,
    path: PathBuf,
    tmp: TempPath,
}

impl StagedCell {
    pub fn cell(&self) -> i32 {
        self.cell
    }

    pub fn commit(self) -> Result<()> {
        self.tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// What a batch did to the archive once committed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchOutcome {
    /// Timestamps with at least one newly written entry.
    pub written: BTreeSet<NaiveDateTime>,
    /// Timestamps whose every entry was already in the archive.
    pub skipped: BTreeSet<NaiveDateTime>,
    pub cells: Vec<i32>,
}

struct CellBatch {
    staged: Option<StagedCell>,
    written: BTreeSet<NaiveDateTime>,
    skipped: BTreeSet<NaiveDateTime>,
}

impl CellWriter {
    pub fn new(root: impl Into<PathBuf>, variables: Vec<String>) -> Self {
        CellWriter {
            root: root.into(),
            variables,
            concurrency: thread::available_parallelism().map_or(DEFAULT_CONCURRENCY, NonZeroUsize::get),
        }
    }

    /// Opens the cell's store, or an empty one if the file does not exist yet.
    pub fn open_for_append(&self, cell: i32) -> Result<CellHandle> {
        self.open_since(cell, None)
    }

    /// Like `open_for_append`, but writes are only accepted from `since` on,
    /// so stored timestamps before it need not be kept.
    fn open_since(&self, cell: i32, since: Option<NaiveDateTime>) -> Result<CellHandle> {
        let path = cell_path(&self.root, cell);

        let (stored, variables) = if path.exists() {
            let stored = load_cell_times(&path, since)?;
            self.check_variables(cell, stored.variables())?;
            let variables = stored.variables().to_vec();
            (Some(stored), variables)
        } else {
            (None, self.variables.clone())
        };

        Ok(CellHandle {
            path,
            stored,
            appended: CellStore::new(cell, variables),
            count: 0,
        })
    }

    fn check_variables(&self, cell: i32, stored: &[String]) -> Result<()> {
        let stored: BTreeSet<&String> = stored.iter().collect();
        let requested: BTreeSet<&String> = self.variables.iter().collect();

        match requested.symmetric_difference(&stored).next() {
            Some(variable) => Err(ArchiveError::VariableMismatch {
                cell,
                variable: variable.to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn write(
        &self,
        handle: &mut CellHandle,
        location: u32,
        timestamp: NaiveDateTime,
        values: &BTreeMap<String, f32>,
    ) -> Result<()> {
        if let Some(stored) = &handle.stored {
            if let Some(last) = stored.last(location).filter(|&last| timestamp <= last) {
                if stored.contains(location, timestamp) {
                    return Err(ArchiveError::DuplicateTimestamp { location, timestamp });
                }
                return Err(ArchiveError::OutOfOrder {
                    location,
                    last,
                    timestamp,
                });
            }
        }

        handle.appended.append(location, timestamp, values)?;
        handle.count += 1;

        Ok(())
    }

    /// Writes the stored cell merged with the handle's entries to a temp file
    /// in the archive directory. Returns `None` when nothing was appended.
    pub fn stage(&self, handle: CellHandle) -> Result<Option<StagedCell>> {
        if handle.count == 0 {
            return Ok(None);
        }

        let stored = handle.stored.is_some().then_some(handle.path.as_path());
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        merge_cell(stored, &handle.appended, tmp.as_file_mut())?;
        tmp.as_file().sync_all()?;

        Ok(Some(StagedCell {
            cell: handle.cell(),
            path: handle.path,
            tmp: tmp.into_temp_path(),
        }))
    }

    pub fn close(&self, handle: CellHandle) -> Result<()> {
        if let Some(staged) = self.stage(handle)? {
            staged.commit()?;
        }

        Ok(())
    }

    /// Appends every image of the batch to every cell of the index, one
    /// blocking task per cell and at most `concurrency` tasks at a time.
    /// Nothing is committed unless all cells staged.
    pub async fn write_batch(self: Arc<Self>, index: Arc<GridIndex>, images: Arc<Vec<Image>>) -> Result<BatchOutcome> {
        let since = images.iter().map(|image| image.timestamp).min();
        let cells: Vec<i32> = index.cell_ids().collect();

        let mut batches = Vec::with_capacity(cells.len());
        let mut failure = None;

        for chunk in cells.chunks(self.concurrency) {
            let tasks: Vec<_> = chunk
                .iter()
                .map(|&cell| {
                    let writer = Arc::clone(&self);
                    let index = Arc::clone(&index);
                    let images = Arc::clone(&images);
                    task::spawn_blocking(move || writer.write_cell(cell, since, &index, &images))
                })
                .collect();

            for result in join_all(tasks).await {
                match result {
                    Ok(Ok(batch)) => batches.push(batch),
                    Ok(Err(e)) => {
                        failure.get_or_insert(e);
                    }
                    Err(e) => {
                        failure.get_or_insert(e.into());
                    }
                }
            }

            if failure.is_some() {
                break;
            }
        }

        if let Some(e) = failure {
            error!(error = %e, "Cell write failed, discarding staged batch");
            return Err(e);
        }

        let mut outcome = BatchOutcome::default();
        for batch in batches {
            if let Some(staged) = batch.staged {
                outcome.cells.push(staged.cell());
                staged.commit()?;
            }
            outcome.written.extend(batch.written);
            outcome.skipped.extend(batch.skipped);
        }
        let written = &outcome.written;
        outcome.skipped.retain(|t| !written.contains(t));

        Ok(outcome)
    }

    fn write_cell(
        &self,
        cell: i32,
        since: Option<NaiveDateTime>,
        index: &GridIndex,
        images: &[Image],
    ) -> Result<CellBatch> {
        let mut handle = self.open_since(cell, since)?;
        let mut written = BTreeSet::new();
        let mut skipped = BTreeSet::new();

        for point in index.points_in(cell) {
            for image in images {
                let values = image.values_at(point.gpi);
                match self.write(&mut handle, point.gpi, image.timestamp, &values) {
                    Ok(()) => {
                        written.insert(image.timestamp);
                    }
                    Err(ArchiveError::DuplicateTimestamp { .. }) => {
                        skipped.insert(image.timestamp);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        debug!(cell, appended = handle.appended(), "Staging cell");

        Ok(CellBatch {
            staged: self.stage(handle)?,
            written,
            skipped,
        })
    }
}

// -- Tests -------------------------------------------------------------------
