//! Error taxonomy for reshuffle and update runs.
//!
//! Missing images are not errors; they are counted in the run summary.
//! Everything here aborts the current run.

use std::path::PathBuf;

use chrono::NaiveDateTime;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The image source itself could not be read.
    #[error("image source fault at {path:?}: {reason}")]
    SourceFault { path: PathBuf, reason: String },

    /// A run requested settings that differ from the archive's.
    #[error("configuration mismatch on `{field}`: archive has {archive}, requested {requested}")]
    ConfigMismatch {
        field: String,
        archive: String,
        requested: String,
    },

    #[error("location {location}: timestamp {timestamp} is before last written {last}")]
    OutOfOrder {
        location: u32,
        last: NaiveDateTime,
        timestamp: NaiveDateTime,
    },

    #[error("location {location}: timestamp {timestamp} already written")]
    DuplicateTimestamp {
        location: u32,
        timestamp: NaiveDateTime,
    },

    /// Values carried a variable the cell store was not created with.
    #[error("cell {cell}: variable `{variable}` is not part of the stored variable set")]
    VariableMismatch { cell: i32, variable: String },

    #[error("spatial filter selected zero grid points")]
    EmptyGrid,

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("no archive metadata found at {0:?}")]
    MetadataMissing(PathBuf),

    #[error("corrupt archive file {path:?}: {reason}")]
    CorruptFile { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("cell writer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ArchiveError {
    pub fn source_fault(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::SourceFault {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn mismatch(field: &str, archive: impl ToString, requested: impl ToString) -> Self {
        Self::ConfigMismatch {
            field: field.to_string(),
            archive: archive.to_string(),
            requested: requested.to_string(),
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::CorruptFile {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
