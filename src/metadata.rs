//! The settings an archive was built with, and how far it reaches.

use std::{
    collections::BTreeSet,
    fs::File,
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::{
    error::{ArchiveError, Result},
    grid::BoundingBox,
    reshuffle::ReshuffleOptions,
};

pub const METADATA_FILE: &str = "overview.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    /// Incremented on every save.
    pub version: u64,
    pub product: String,
    pub input_root: PathBuf,
    pub variables: Vec<String>,
    pub h_steps: Vec<u32>,
    pub bbox: Option<BoundingBox>,
    pub land_points: bool,
    pub buffer_size: usize,
    pub cell_size: f64,
    pub start_date: NaiveDate,
    /// Last timestamp durably written to the cell stores.
    pub coverage_end: Option<NaiveDateTime>,
    pub last_update: Option<DateTime<Utc>>,
}

impl ArchiveMetadata {
    pub fn new(
        product: &str,
        input_root: &Path,
        variables: &[String],
        options: &ReshuffleOptions,
        start_date: NaiveDate,
    ) -> Self {
        ArchiveMetadata {
            version: 0,
            product: product.to_string(),
            input_root: input_root.to_path_buf(),
            variables: variables.to_vec(),
            h_steps: options.h_steps.clone(),
            bbox: options.bbox,
            land_points: options.land_points,
            buffer_size: options.buffer_size,
            cell_size: options.cell_size,
            start_date,
            coverage_end: None,
            last_update: None,
        }
    }

    pub fn path(archive: &Path) -> PathBuf {
        archive.join(METADATA_FILE)
    }

    pub fn exists(archive: &Path) -> bool {
        Self::path(archive).is_file()
    }

    pub fn load(archive: &Path) -> Result<Self> {
        let path = Self::path(archive);
        if !path.is_file() {
            return Err(ArchiveError::MetadataMissing(path));
        }

        let reader = BufReader::new(File::open(&path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Writes the next version next to the current one, then renames it over.
    pub fn save(&mut self, archive: &Path) -> Result<()> {
        self.version += 1;
        self.last_update = Some(Utc::now());

        let mut tmp = NamedTempFile::new_in(archive)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), self)?;
        tmp.as_file_mut().write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(Self::path(archive)).map_err(|e| e.error)?;

        debug!(version = self.version, coverage_end = ?self.coverage_end, "Saved archive metadata");

        Ok(())
    }

    /// Run options equivalent to the ones the archive was built with.
    pub fn options(&self) -> ReshuffleOptions {
        ReshuffleOptions {
            h_steps: self.h_steps.clone(),
            bbox: self.bbox,
            land_points: self.land_points,
            buffer_size: self.buffer_size,
            cell_size: self.cell_size,
        }
    }

    /// Fails on the first archive-fixed setting that `variables` or `options`
    /// would change. The buffer size is free to differ.
    pub fn check_compatible(&self, variables: &[String], options: &ReshuffleOptions) -> Result<()> {
        let stored: BTreeSet<&String> = self.variables.iter().collect();
        let requested: BTreeSet<&String> = variables.iter().collect();
        if stored != requested {
            return Err(ArchiveError::mismatch(
                "variables",
                self.variables.join(","),
                variables.join(","),
            ));
        }

        let stored: BTreeSet<u32> = self.h_steps.iter().copied().collect();
        let requested: BTreeSet<u32> = options.h_steps.iter().copied().collect();
        if stored != requested {
            return Err(ArchiveError::mismatch(
                "h_steps",
                format!("{:?}", self.h_steps),
                format!("{:?}", options.h_steps),
            ));
        }

        if self.bbox != options.bbox {
            return Err(ArchiveError::mismatch(
                "bbox",
                describe_bbox(self.bbox.as_ref()),
                describe_bbox(options.bbox.as_ref()),
            ));
        }

        if self.land_points != options.land_points {
            return Err(ArchiveError::mismatch(
                "land_points",
                self.land_points,
                options.land_points,
            ));
        }

        if self.cell_size != options.cell_size {
            return Err(ArchiveError::mismatch("cell_size", self.cell_size, options.cell_size));
        }

        Ok(())
    }
}

fn describe_bbox(bbox: Option<&BoundingBox>) -> String {
    bbox.map_or_else(|| "none".to_string(), ToString::to_string)
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    fn metadata() -> ArchiveMetadata {
        ArchiveMetadata::new(
            "ERA5",
            Path::new("/data/era5"),
            &["swvl1".to_string(), "swvl2".to_string()],
            &ReshuffleOptions::default(),
            NaiveDate::from_ymd_opt(2010, 1, 1).unwrap(),
        )
    }

    #[test]
    fn should_version_each_save() {
        let dir = TempDir::new().unwrap();
        let mut saved = metadata();

        saved.save(dir.path()).unwrap();
        saved.save(dir.path()).unwrap();
        let loaded = ArchiveMetadata::load(dir.path()).unwrap();

        assert_eq!(loaded.version, 2);
        assert_eq!(loaded, saved);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn should_report_missing_metadata() {
        let dir = TempDir::new().unwrap();

        assert!(!ArchiveMetadata::exists(dir.path()));
        assert!(matches!(
            ArchiveMetadata::load(dir.path()),
            Err(ArchiveError::MetadataMissing(_))
        ));
    }

    #[test]
    fn should_accept_reordered_variables_and_other_buffer() {
        let options = ReshuffleOptions {
            buffer_size: 7,
            ..ReshuffleOptions::default()
        };
        let variables = vec!["swvl2".to_string(), "swvl1".to_string()];

        assert!(metadata().check_compatible(&variables, &options).is_ok());
    }

    #[test]
    fn should_reject_changed_bbox() {
        let options = ReshuffleOptions {
            bbox: Some(BoundingBox::new(0.0, 0.0, 10.0, 10.0).unwrap()),
            ..ReshuffleOptions::default()
        };
        let variables = metadata().variables;

        let result = metadata().check_compatible(&variables, &options);

        assert!(matches!(
            result,
            Err(ArchiveError::ConfigMismatch { ref field, .. }) if field == "bbox"
        ));
    }

    #[test]
    fn should_reject_new_variable() {
        let variables = vec!["swvl1".to_string(), "swvl2".to_string(), "stl1".to_string()];

        let result = metadata().check_compatible(&variables, &ReshuffleOptions::default());

        assert!(matches!(
            result,
            Err(ArchiveError::ConfigMismatch { ref field, .. }) if field == "variables"
        ));
    }
}
