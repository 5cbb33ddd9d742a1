//! Time-stamped images and the sources that produce them.

pub mod directory;

use std::{
    collections::BTreeMap,
    path::Path,
};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::{error::Result, grid::GridPoint};

pub use directory::DirectoryImageSource;

/// Stored wherever a variable has no value at a timestamp.
pub const MISSING: f32 = f32::NAN;

/// One snapshot: per variable, a value for every grid point id.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub timestamp: NaiveDateTime,
    pub data: BTreeMap<String, Vec<f32>>,
}

impl Image {
    pub fn new(timestamp: NaiveDateTime) -> Self {
        Image {
            timestamp,
            data: BTreeMap::new(),
        }
    }

    pub fn with_variable(mut self, name: &str, values: Vec<f32>) -> Self {
        self.data.insert(name.to_string(), values);
        self
    }

    /// Every variable's value at `gpi`.
    pub fn values_at(&self, gpi: u32) -> BTreeMap<String, f32> {
        self.data
            .iter()
            .map(|(name, values)| {
                let value = values.get(gpi as usize).copied().unwrap_or(MISSING);
                (name.clone(), value)
            })
            .collect()
    }
}

/// Produces decoded images for a raw archive.
///
/// `get` returns `Ok(None)` when an expected image is absent; an `Err` means
/// the source itself is broken and the run must stop.
pub trait ImageSource: Send + Sync {
    fn root(&self) -> &Path;

    /// Product label recorded in archive metadata.
    fn product(&self) -> &str;

    /// Grid points of the product, optionally restricted to land.
    fn grid_points(&self, land_only: bool) -> Result<Vec<GridPoint>>;

    /// Variables carried by the first available image.
    fn variables(&self) -> Result<Vec<String>>;

    /// Timestamps with an image in [start, end], ascending.
    fn available_timestamps(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<Vec<NaiveDateTime>>;

    /// Reads the requested variables; missing ones are filled with `MISSING`.
    fn get(&self, timestamp: NaiveDateTime, variables: &[String]) -> Result<Option<Image>>;
}

/// Every date in [start, end] crossed with every hour in `h_steps`,
/// chronologically.
pub fn timestamps_for_daterange(start: NaiveDate, end: NaiveDate, h_steps: &[u32]) -> Vec<NaiveDateTime> {
    let mut hours = h_steps.to_vec();
    hours.sort_unstable();
    hours.dedup();

    start
        .iter_days()
        .take_while(|date| *date <= end)
        .flat_map(|date| {
            hours
                .iter()
                .filter_map(move |&h| NaiveTime::from_hms_opt(h, 0, 0).map(|t| date.and_time(t)))
                .collect::<Vec<_>>()
        })
        .collect()
}


// -- Tests -------------------------------------------------------------------
