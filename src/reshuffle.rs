//! Reshuffle a date range of images into the cell-partitioned archive.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    buffer::ImageBuffer,
    cli::create_progress_bar,
    error::{ArchiveError, Result},
    grid::{select, BoundingBox, GridIndex, GridPartitioner, DEFAULT_CELL_SIZE},
    image::{timestamps_for_daterange, DirectoryImageSource, Image, ImageSource},
    metadata::ArchiveMetadata,
    parquet::{grid::GRID_FILE, load_grid_index, save_grid_index},
    store::CellWriter,
    update::{resume_date, UpdateController, UpdateOverrides},
};

pub const DEFAULT_H_STEPS: [u32; 4] = [0, 6, 12, 18];
pub const DEFAULT_BUFFER_SIZE: usize = 50;

/// Missing images beyond `buffer_size * GAP_SAFETY_FACTOR` raise a
/// completeness warning.
pub const GAP_SAFETY_FACTOR: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct ReshuffleOptions {
    /// Hours of the day with an expected image.
    pub h_steps: Vec<u32>,
    pub bbox: Option<BoundingBox>,
    pub land_points: bool,
    /// Images held in memory before a flush.
    pub buffer_size: usize,
    pub cell_size: f64,
}

impl Default for ReshuffleOptions {
    fn default() -> Self {
        ReshuffleOptions {
            h_steps: DEFAULT_H_STEPS.to_vec(),
            bbox: None,
            land_points: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            cell_size: DEFAULT_CELL_SIZE,
        }
    }
}

impl ReshuffleOptions {
    pub fn validate(&self) -> Result<()> {
        if self.h_steps.is_empty() {
            return Err(ArchiveError::InvalidOptions("h_steps is empty".to_string()));
        }
        if let Some(hour) = self.h_steps.iter().find(|&&h| h > 23) {
            return Err(ArchiveError::InvalidOptions(format!("h_step {} is not an hour of the day", hour)));
        }
        if self.buffer_size == 0 {
            return Err(ArchiveError::InvalidOptions("buffer size must be at least 1".to_string()));
        }
        GridPartitioner::new(self.cell_size)?;

        Ok(())
    }
}

/// Outcome of a reshuffle or update run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub images_written: usize,
    pub missing_count: usize,
    pub missing_timestamps: Vec<NaiveDateTime>,
    /// Images already in the archive before the run.
    pub skipped_duplicates: usize,
    pub coverage_end: Option<NaiveDateTime>,
    pub cells_touched: Vec<i32>,
    pub completeness_warning: bool,
}

impl RunSummary {
    pub fn noop(coverage_end: Option<NaiveDateTime>) -> Self {
        RunSummary {
            coverage_end,
            ..RunSummary::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.missing_count == 0
    }

    fn record_gap(&mut self, timestamp: NaiveDateTime) {
        self.missing_count += 1;
        self.missing_timestamps.push(timestamp);
    }
}

pub struct ReshuffleController {
    source: Arc<dyn ImageSource>,
    output: PathBuf,
}

impl ReshuffleController {
    pub fn new(source: Arc<dyn ImageSource>, output: impl Into<PathBuf>) -> Self {
        ReshuffleController {
            source,
            output: output.into(),
        }
    }

    /// Grid points left after the land and bbox filters, partitioned into cells.
    pub fn resolve_grid(&self, options: &ReshuffleOptions) -> Result<GridIndex> {
        let points = select(self.source.grid_points(options.land_points)?, options.bbox.as_ref());
        if points.is_empty() {
            return Err(ArchiveError::EmptyGrid);
        }

        Ok(GridPartitioner::new(options.cell_size)?.build(&points))
    }

    pub async fn run(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        variables: &[String],
        options: &ReshuffleOptions,
    ) -> Result<RunSummary> {
        options.validate()?;
        if variables.is_empty() {
            return Err(ArchiveError::InvalidOptions("no variables to reshuffle".to_string()));
        }

        let index = Arc::new(self.resolve_grid(options)?);
        let mut metadata = self.prepare_archive(&index, start, variables, options)?;

        let timestamps = timestamps_for_daterange(start, end, &options.h_steps);
        info!(
            start = %start,
            end = %end,
            images = timestamps.len(),
            points = index.len(),
            cells = index.cell_count(),
            "Reshuffling"
        );

        let writer = Arc::new(CellWriter::new(&self.output, variables.to_vec()));
        let mut buffer = ImageBuffer::new(options.buffer_size);
        let gap_threshold = options.buffer_size * GAP_SAFETY_FACTOR;

        let mut summary = RunSummary::noop(metadata.coverage_end);
        let mut touched = BTreeSet::new();

        let bar = create_progress_bar(timestamps.len() as u64, "Reshuffling images".to_string());

        for (position, timestamp) in timestamps.iter().enumerate() {
            match self.source.get(*timestamp, variables)? {
                Some(image) => buffer.push(image),
                None => {
                    debug!(timestamp = %timestamp, "Image missing");
                    summary.record_gap(*timestamp);
                    if summary.missing_count > gap_threshold && !summary.completeness_warning {
                        warn!(
                            missing = summary.missing_count,
                            threshold = gap_threshold,
                            "Many images missing, archive may be incomplete"
                        );
                        summary.completeness_warning = true;
                    }
                }
            }

            if position + 1 == timestamps.len() {
                buffer.end_of_range();
            }
            if buffer.should_flush() {
                let images = buffer.drain();
                self.flush(&writer, &index, images, &mut metadata, &mut summary, &mut touched)
                    .await?;
            }

            bar.inc(1);
        }

        bar.finish_with_message("Reshuffle complete");

        summary.cells_touched = touched.into_iter().collect();
        info!(
            written = summary.images_written,
            missing = summary.missing_count,
            skipped = summary.skipped_duplicates,
            coverage_end = ?summary.coverage_end,
            "Run finished"
        );

        Ok(summary)
    }

    /// Writes or verifies the grid index and loads or creates the metadata.
    fn prepare_archive(
        &self,
        index: &GridIndex,
        start: NaiveDate,
        variables: &[String],
        options: &ReshuffleOptions,
    ) -> Result<ArchiveMetadata> {
        fs::create_dir_all(&self.output)?;

        let existing = if ArchiveMetadata::exists(&self.output) {
            let metadata = ArchiveMetadata::load(&self.output)?;
            metadata.check_compatible(variables, options)?;
            Some(metadata)
        } else {
            None
        };

        let grid_path = self.output.join(GRID_FILE);
        if grid_path.exists() {
            let stored = load_grid_index(&grid_path, options.cell_size)?;
            if &stored != index {
                return Err(ArchiveError::mismatch(
                    "grid",
                    format!("{} points in {} cells", stored.len(), stored.cell_count()),
                    format!("{} points in {} cells", index.len(), index.cell_count()),
                ));
            }
        } else {
            save_grid_index(index, &grid_path)?;
        }

        match existing {
            Some(mut metadata) => {
                metadata.input_root = self.source.root().to_path_buf();
                Ok(metadata)
            }
            None => {
                let mut metadata =
                    ArchiveMetadata::new(self.source.product(), self.source.root(), variables, options, start);
                metadata.save(&self.output)?;
                Ok(metadata)
            }
        }
    }

    /// Writes one drained batch. Coverage advances only after the cells are committed.
    async fn flush(
        &self,
        writer: &Arc<CellWriter>,
        index: &Arc<GridIndex>,
        images: Vec<Image>,
        metadata: &mut ArchiveMetadata,
        summary: &mut RunSummary,
        touched: &mut BTreeSet<i32>,
    ) -> Result<()> {
        let count = images.len();
        let outcome = Arc::clone(writer)
            .write_batch(Arc::clone(index), Arc::new(images))
            .await?;

        summary.images_written += outcome.written.len();
        summary.skipped_duplicates += outcome.skipped.len();
        touched.extend(outcome.cells.iter().copied());

        if let Some(&last) = outcome.written.last() {
            if metadata.coverage_end.map_or(true, |covered| last > covered) {
                metadata.coverage_end = Some(last);
                metadata.save(&self.output)?;
            }
        }
        summary.coverage_end = metadata.coverage_end;

        debug!(
            images = count,
            written = outcome.written.len(),
            cells = outcome.cells.len(),
            "Flushed batch"
        );

        Ok(())
    }
}

/// Reshuffles the raw archive at `input_path` into `output_path`.
pub async fn reshuffle(
    input_path: &Path,
    output_path: &Path,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    variables: Option<Vec<String>>,
    options: ReshuffleOptions,
) -> Result<RunSummary> {
    let source = Arc::new(DirectoryImageSource::open(input_path)?);
    reshuffle_with(source, output_path, start, end, variables, options).await
}

/// Reshuffles from any source. Into an existing archive this appends after
/// its coverage, as `update` does, once the settings are found compatible.
/// There an earlier `start` is ignored and a later one is rejected.
pub async fn reshuffle_with(
    source: Arc<dyn ImageSource>,
    output_path: &Path,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    variables: Option<Vec<String>>,
    options: ReshuffleOptions,
) -> Result<RunSummary> {
    options.validate()?;

    if ArchiveMetadata::exists(output_path) {
        let metadata = ArchiveMetadata::load(output_path)?;
        let variables = variables.unwrap_or_else(|| metadata.variables.clone());
        metadata.check_compatible(&variables, &options)?;

        let resume = resume_date(&metadata);
        match start {
            Some(start) if start > resume => {
                return Err(ArchiveError::InvalidOptions(format!(
                    "start {} would leave a gap after the archive, which resumes at {}",
                    start, resume
                )));
            }
            Some(start) if start < resume => {
                warn!(requested = %start, resume = %resume, "Ignoring start date, appending after archive coverage");
            }
            _ => {}
        }

        info!(archive = ?output_path, resume = %resume, "Archive exists, appending after its coverage");
        let overrides = UpdateOverrides {
            buffer_size: Some(options.buffer_size),
            end_date: end,
            ..UpdateOverrides::default()
        };
        return UpdateController::new(output_path, source).append(&overrides).await;
    }

    let variables = match variables {
        Some(variables) if !variables.is_empty() => variables,
        _ => source.variables()?,
    };

    let (start, end) = match (start, end) {
        (Some(start), Some(end)) => (start, end),
        (start, end) => {
            let available = source.available_timestamps(NaiveDateTime::MIN, NaiveDateTime::MAX)?;
            let (first, last) = match (available.first(), available.last()) {
                (Some(first), Some(last)) => (first.date(), last.date()),
                _ => {
                    warn!(source = ?source.root(), "No images available");
                    return Ok(RunSummary::noop(None));
                }
            };
            (start.unwrap_or(first), end.unwrap_or(last))
        }
    };

    if start > end {
        warn!(start = %start, end = %end, "Start date is after end date, nothing to do");
        return Ok(RunSummary::noop(None));
    }

    ReshuffleController::new(source, output_path)
        .run(start, end, &variables, &options)
        .await
}

// -- Tests -------------------------------------------------------------------
