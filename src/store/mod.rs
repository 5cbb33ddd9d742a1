//! Per-location time series and the per-cell stores that hold them.

pub mod writer;

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

use chrono::NaiveDateTime;

use crate::{
    error::{ArchiveError, Result},
    grid::GridPoint,
    image::MISSING,
    metadata::ArchiveMetadata,
    parquet::{grid::GRID_FILE, load_cell, load_grid_index},
};

pub use writer::{CellHandle, CellWriter};

pub fn cell_file_name(cell: i32) -> String {
    format!("{:04}.parquet", cell)
}

pub fn cell_path(root: &Path, cell: i32) -> PathBuf {
    root.join(cell_file_name(cell))
}

/// Time-ordered values of a fixed variable set at one location.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesRecord {
    cell: i32,
    location: u32,
    times: Vec<NaiveDateTime>,
    values: BTreeMap<String, Vec<f32>>,
}

impl TimeSeriesRecord {
    pub fn new(cell: i32, location: u32, variables: &[String]) -> Self {
        TimeSeriesRecord {
            cell,
            location,
            times: Vec::new(),
            values: variables.iter().map(|v| (v.clone(), Vec::new())).collect(),
        }
    }

    pub fn location(&self) -> u32 {
        self.location
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> &[NaiveDateTime] {
        &self.times
    }

    pub fn last_timestamp(&self) -> Option<NaiveDateTime> {
        self.times.last().copied()
    }

    pub fn values(&self, variable: &str) -> Option<&[f32]> {
        self.values.get(variable).map(Vec::as_slice)
    }

    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Appends one entry after the last.
    ///
    /// Variables absent from `values` are stored as `MISSING`; variables
    /// outside the record's set are rejected. Nothing is modified on error.
    pub fn append(&mut self, timestamp: NaiveDateTime, values: &BTreeMap<String, f32>) -> Result<()> {
        if let Some(last) = self.last_timestamp() {
            if timestamp <= last {
                if self.times.binary_search(&timestamp).is_ok() {
                    return Err(ArchiveError::DuplicateTimestamp {
                        location: self.location,
                        timestamp,
                    });
                }
                return Err(ArchiveError::OutOfOrder {
                    location: self.location,
                    last,
                    timestamp,
                });
            }
        }

        if let Some(unknown) = values.keys().find(|name| !self.values.contains_key(*name)) {
            return Err(ArchiveError::VariableMismatch {
                cell: self.cell,
                variable: unknown.clone(),
            });
        }

        self.times.push(timestamp);
        for (name, series) in self.values.iter_mut() {
            series.push(values.get(name).copied().unwrap_or(MISSING));
        }

        Ok(())
    }
}

/// All time series of one cell, in the order their locations were first written.
#[derive(Debug, Clone, PartialEq)]
pub struct CellStore {
    cell: i32,
    variables: Vec<String>,
    records: Vec<TimeSeriesRecord>,
    positions: HashMap<u32, usize>,
}

impl CellStore {
    pub fn new(cell: i32, variables: Vec<String>) -> Self {
        CellStore {
            cell,
            variables,
            records: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn cell(&self) -> i32 {
        self.cell
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn records(&self) -> impl Iterator<Item = &TimeSeriesRecord> {
        self.records.iter()
    }

    pub fn record(&self, location: u32) -> Option<&TimeSeriesRecord> {
        self.positions.get(&location).map(|&pos| &self.records[pos])
    }

    pub fn append(&mut self, location: u32, timestamp: NaiveDateTime, values: &BTreeMap<String, f32>) -> Result<()> {
        let pos = match self.positions.get(&location) {
            Some(&pos) => pos,
            None => {
                self.records
                    .push(TimeSeriesRecord::new(self.cell, location, &self.variables));
                self.positions.insert(location, self.records.len() - 1);
                self.records.len() - 1
            }
        };

        self.records[pos].append(timestamp, values)
    }
}

/// Time series of the archived point nearest to (lon, lat).
pub fn read_time_series(archive: &Path, lon: f64, lat: f64) -> Result<(GridPoint, TimeSeriesRecord)> {
    let metadata = ArchiveMetadata::load(archive)?;
    let index = load_grid_index(&archive.join(GRID_FILE), metadata.cell_size)?;

    let point = *index.nearest(lon, lat).ok_or(ArchiveError::EmptyGrid)?;
    let cell = index.cell_of(point.gpi).ok_or(ArchiveError::EmptyGrid)?;

    let path = cell_path(archive, cell);
    let record = if path.exists() {
        load_cell(&path, cell)?.record(point.gpi).cloned()
    } else {
        None
    };

    Ok((
        point,
        record.unwrap_or_else(|| TimeSeriesRecord::new(cell, point.gpi, &metadata.variables)),
    ))
}

// -- Tests -------------------------------------------------------------------
