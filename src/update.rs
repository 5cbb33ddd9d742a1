//! Append newly available images to an existing archive.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use tracing::info;

use crate::{
    error::{ArchiveError, Result},
    grid::BoundingBox,
    image::{DirectoryImageSource, ImageSource},
    metadata::ArchiveMetadata,
    reshuffle::{ReshuffleController, RunSummary},
};

/// Settings a caller may pass to an update.
///
/// `input_root`, `buffer_size` and `end_date` replace the archive's values.
/// The rest are fixed by the archive and only checked: any value that differs
/// from the stored one is a configuration mismatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOverrides {
    pub input_root: Option<PathBuf>,
    pub buffer_size: Option<usize>,
    pub end_date: Option<NaiveDate>,
    pub variables: Option<Vec<String>>,
    pub h_steps: Option<Vec<u32>>,
    pub bbox: Option<BoundingBox>,
    pub land_points: Option<bool>,
    pub cell_size: Option<f64>,
}

impl UpdateOverrides {
    fn check_against(&self, metadata: &ArchiveMetadata) -> Result<()> {
        let mut options = metadata.options();
        if let Some(h_steps) = &self.h_steps {
            options.h_steps = h_steps.clone();
        }
        if let Some(bbox) = self.bbox {
            options.bbox = Some(bbox);
        }
        if let Some(land_points) = self.land_points {
            options.land_points = land_points;
        }
        if let Some(cell_size) = self.cell_size {
            options.cell_size = cell_size;
        }
        let variables = self.variables.as_ref().unwrap_or(&metadata.variables);

        metadata.check_compatible(variables, &options)
    }
}

pub struct UpdateController {
    archive: PathBuf,
    source: Arc<dyn ImageSource>,
}

impl UpdateController {
    pub fn new(archive: impl Into<PathBuf>, source: Arc<dyn ImageSource>) -> Self {
        UpdateController {
            archive: archive.into(),
            source,
        }
    }

    /// Reshuffles the images newer than the archive's coverage, with the
    /// archive's own settings. Overrides are validated before anything is
    /// written.
    pub async fn append(&self, overrides: &UpdateOverrides) -> Result<RunSummary> {
        let metadata = ArchiveMetadata::load(&self.archive)?;
        overrides.check_against(&metadata)?;

        let product = self.source.product();
        if !product.is_empty() && !metadata.product.is_empty() && product != metadata.product {
            return Err(ArchiveError::mismatch("product", &metadata.product, product));
        }

        let mut options = metadata.options();
        if let Some(buffer_size) = overrides.buffer_size {
            options.buffer_size = buffer_size;
        }
        options.validate()?;

        let start = resume_date(&metadata);
        let end = match overrides.end_date {
            Some(end) => Some(end),
            None => last_full_day(self.source.as_ref(), start, &metadata.h_steps)?,
        };
        let today = Utc::now().date_naive();

        let end = match end.map(|end| end.min(today)) {
            Some(end) if end >= start => end,
            _ => {
                info!(archive = ?self.archive, coverage_end = ?metadata.coverage_end, "No new images");
                return Ok(RunSummary::noop(metadata.coverage_end));
            }
        };

        info!(archive = ?self.archive, start = %start, end = %end, "Updating archive");

        ReshuffleController::new(Arc::clone(&self.source), &self.archive)
            .run(start, end, &metadata.variables, &options)
            .await
    }
}

/// First day an update has to look at: the day after the coverage if its
/// last h_step was written, the coverage day itself otherwise.
pub fn resume_date(metadata: &ArchiveMetadata) -> NaiveDate {
    let coverage_end = match metadata.coverage_end {
        Some(coverage_end) => coverage_end,
        None => return metadata.start_date,
    };

    let last_step = metadata.h_steps.iter().copied().max().unwrap_or(0);
    if coverage_end.hour() >= last_step {
        coverage_end.date().succ_opt().unwrap_or(NaiveDate::MAX)
    } else {
        coverage_end.date()
    }
}

/// Latest day from `start` on with an image for every h_step.
fn last_full_day(source: &dyn ImageSource, start: NaiveDate, h_steps: &[u32]) -> Result<Option<NaiveDate>> {
    let expected: BTreeSet<u32> = h_steps.iter().copied().collect();
    let mut days: BTreeMap<NaiveDate, BTreeSet<u32>> = BTreeMap::new();

    for timestamp in source.available_timestamps(start.and_time(NaiveTime::MIN), NaiveDateTime::MAX)? {
        days.entry(timestamp.date()).or_default().insert(timestamp.hour());
    }

    Ok(days
        .into_iter()
        .rev()
        .find(|(_, hours)| expected.is_subset(hours))
        .map(|(day, _)| day))
}

/// Updates the archive at `archive_path` from its recorded image archive, or
/// from `overrides.input_root`.
pub async fn update(archive_path: &Path, overrides: UpdateOverrides) -> Result<RunSummary> {
    let metadata = ArchiveMetadata::load(archive_path)?;
    let input_root = overrides
        .input_root
        .clone()
        .unwrap_or_else(|| metadata.input_root.clone());

    let source = Arc::new(DirectoryImageSource::open(input_root)?);
    UpdateController::new(archive_path, source).append(&overrides).await
}

// -- Tests -------------------------------------------------------------------
