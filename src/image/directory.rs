//! Raw image archive organised as `<root>/<YYYY>/<DDD>/<PRODUCT>_AN_<YYYYMMDD>_<HHMM>.parquet`,
//! with the product grid in `<root>/grid.parquet`.
//!
//! Preliminary images (product suffixed `-T`) are read only when no final
//! image exists for the same timestamp.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use chrono::{Datelike, NaiveDateTime};
use tracing::{debug, warn};

use super::{Image, ImageSource, MISSING};
use crate::{
    error::{ArchiveError, Result},
    grid::GridPoint,
    parquet::{image_variables, load_image, load_product_grid},
};

pub const PRODUCT_GRID_FILE: &str = "grid.parquet";
const DATETIME_FORMAT: &str = "%Y%m%d_%H%M";
const IMAGE_EXTENSION: &str = "parquet";
const PRELIMINARY_SUFFIX: &str = "-T";

/// Land fraction at or above which a point counts as land.
const LAND_THRESHOLD: f32 = 0.5;
/// Land points south of this latitude (Antarctica) are excluded.
const LAND_MIN_LAT: f64 = -60.0;

pub struct DirectoryImageSource {
    root: PathBuf,
    product: String,
    points: Vec<GridPoint>,
    land: Option<Vec<f32>>,
}

/// An image file found on disk.
#[derive(Debug, Clone, PartialEq)]
struct ImageFile {
    path: PathBuf,
    product: String,
    timestamp: NaiveDateTime,
}

impl ImageFile {
    fn from_path(path: PathBuf) -> Option<Self> {
        if path.extension()?.to_str()? != IMAGE_EXTENSION {
            return None;
        }
        let stem = path.file_stem()?.to_str()?.to_string();
        let parts: Vec<&str> = stem.rsplitn(3, '_').collect();
        if parts.len() != 3 {
            return None;
        }

        let timestamp =
            NaiveDateTime::parse_from_str(&format!("{}_{}", parts[1], parts[0]), DATETIME_FORMAT).ok()?;
        let product = parts[2].split('_').next()?.to_string();

        Some(ImageFile {
            path,
            product,
            timestamp,
        })
    }

    fn is_preliminary(&self) -> bool {
        self.product.ends_with(PRELIMINARY_SUFFIX)
    }
}

impl DirectoryImageSource {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ArchiveError::source_fault(&root, "not a directory"));
        }

        let grid_path = root.join(PRODUCT_GRID_FILE);
        let (points, land) =
            load_product_grid(&grid_path).map_err(|e| ArchiveError::source_fault(&grid_path, e))?;

        let mut source = DirectoryImageSource {
            root,
            product: String::new(),
            points,
            land,
        };
        source.product = source
            .first_image()?
            .map(|file| file.product.trim_end_matches(PRELIMINARY_SUFFIX).to_string())
            .unwrap_or_default();

        debug!(root = ?source.root, product = %source.product, points = source.points.len(), "Opened image archive");

        Ok(source)
    }

    fn day_dir(&self, timestamp: &NaiveDateTime) -> PathBuf {
        self.root
            .join(format!("{:04}", timestamp.year()))
            .join(format!("{:03}", timestamp.ordinal()))
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(dir)
            .map_err(|e| ArchiveError::source_fault(dir, e))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| ArchiveError::source_fault(dir, e))?;
        entries.sort();

        Ok(entries)
    }

    fn images_in(&self, day_dir: &Path) -> Result<Vec<ImageFile>> {
        Ok(self
            .list_dir(day_dir)?
            .into_iter()
            .filter_map(ImageFile::from_path)
            .collect())
    }

    fn year_dirs(&self) -> Result<Vec<(i32, PathBuf)>> {
        Ok(self
            .list_dir(&self.root)?
            .into_iter()
            .filter(|p| p.is_dir())
            .filter_map(|p| {
                let year = p.file_name()?.to_str()?.parse::<i32>().ok()?;
                Some((year, p))
            })
            .collect())
    }

    fn first_image(&self) -> Result<Option<ImageFile>> {
        for (_, year_dir) in self.year_dirs()? {
            for day_dir in self.list_dir(&year_dir)?.into_iter().filter(|p| p.is_dir()) {
                if let Some(file) = self.images_in(&day_dir)?.into_iter().min_by_key(|f| f.timestamp) {
                    return Ok(Some(file));
                }
            }
        }

        Ok(None)
    }

    /// The final image for `timestamp`, or the preliminary one if that is all there is.
    fn find(&self, timestamp: &NaiveDateTime) -> Result<Option<ImageFile>> {
        if !self.root.is_dir() {
            return Err(ArchiveError::source_fault(&self.root, "image archive disappeared"));
        }

        let day_dir = self.day_dir(timestamp);
        if !day_dir.is_dir() {
            return Ok(None);
        }

        Ok(self
            .images_in(&day_dir)?
            .into_iter()
            .filter(|f| f.timestamp == *timestamp)
            .min_by_key(|f| f.is_preliminary()))
    }
}

impl ImageSource for DirectoryImageSource {
    fn root(&self) -> &Path {
        &self.root
    }

    fn product(&self) -> &str {
        &self.product
    }

    fn grid_points(&self, land_only: bool) -> Result<Vec<GridPoint>> {
        if !land_only {
            return Ok(self.points.clone());
        }

        let land = self.land.as_ref().ok_or_else(|| {
            ArchiveError::source_fault(
                self.root.join(PRODUCT_GRID_FILE),
                "no `land` column to select land points",
            )
        })?;

        Ok(self
            .points
            .iter()
            .zip(land)
            .filter(|(point, &fraction)| fraction >= LAND_THRESHOLD && point.lat >= LAND_MIN_LAT)
            .map(|(point, _)| *point)
            .collect())
    }

    fn variables(&self) -> Result<Vec<String>> {
        match self.first_image()? {
            Some(file) => image_variables(&file.path).map_err(|e| ArchiveError::source_fault(&file.path, e)),
            None => Ok(Vec::new()),
        }
    }

    fn available_timestamps(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<Vec<NaiveDateTime>> {
        let mut timestamps = Vec::new();

        for (year, year_dir) in self.year_dirs()? {
            if year < start.year() || year > end.year() {
                continue;
            }
            for day_dir in self.list_dir(&year_dir)?.into_iter().filter(|p| p.is_dir()) {
                timestamps.extend(
                    self.images_in(&day_dir)?
                        .into_iter()
                        .map(|f| f.timestamp)
                        .filter(|t| *t >= start && *t <= end),
                );
            }
        }

        timestamps.sort();
        timestamps.dedup();

        Ok(timestamps)
    }

    fn get(&self, timestamp: NaiveDateTime, variables: &[String]) -> Result<Option<Image>> {
        let file = match self.find(&timestamp)? {
            Some(file) => file,
            None => return Ok(None),
        };

        let (rows, mut data) =
            load_image(&file.path, variables).map_err(|e| ArchiveError::source_fault(&file.path, e))?;
        if rows != self.points.len() {
            return Err(ArchiveError::source_fault(
                &file.path,
                format!("image has {} rows, grid has {} points", rows, self.points.len()),
            ));
        }

        for name in variables {
            if !data.contains_key(name) {
                warn!(variable = %name, file = ?file.path, "Cannot load variable, filling image with missing values");
                data.insert(name.clone(), vec![MISSING; rows]);
            }
        }

        Ok(Some(Image { timestamp, data }))
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod test {
    use chrono::NaiveDate;
    use tempfile::TempDir;

    use super::*;
    use crate::parquet::{grid::save_product_grid, image::save_image};

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2010, 1, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn write_image(root: &Path, product: &str, timestamp: NaiveDateTime, swvl1: Vec<f32>) {
        let dir = root
            .join(format!("{:04}", timestamp.year()))
            .join(format!("{:03}", timestamp.ordinal()));
        fs::create_dir_all(&dir).unwrap();
        let name = format!("{}_AN_{}.parquet", product, timestamp.format(DATETIME_FORMAT));
        save_image(&dir.join(name), &[("swvl1", swvl1)]).unwrap();
    }

    fn archive_fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        save_product_grid(
            &dir.path().join(PRODUCT_GRID_FILE),
            &[(2.0, 2.0), (7.0, 2.0), (2.0, -70.0)],
            Some(&[1.0, 0.1, 1.0]),
        )
        .unwrap();
        write_image(dir.path(), "ERA5", at(1, 0), vec![0.1, 0.2, 0.3]);
        write_image(dir.path(), "ERA5", at(1, 6), vec![0.4, 0.5, 0.6]);
        write_image(dir.path(), "ERA5-T", at(1, 6), vec![9.0, 9.0, 9.0]);
        write_image(dir.path(), "ERA5-T", at(2, 0), vec![0.7, 0.8, 0.9]);
        dir
    }

    #[test]
    fn should_parse_image_file_names() {
        let file = ImageFile::from_path(PathBuf::from("/x/2010/001/ERA5-LAND_AN_20100101_0600.parquet")).unwrap();

        assert_eq!(file.product, "ERA5-LAND");
        assert_eq!(file.timestamp, at(1, 6));
        assert!(ImageFile::from_path(PathBuf::from("/x/notes.txt")).is_none());
        assert!(ImageFile::from_path(PathBuf::from("/x/ERA5_AN_2010.parquet")).is_none());
    }

    #[test]
    fn should_list_available_timestamps() {
        let dir = archive_fixture();
        let source = DirectoryImageSource::open(dir.path()).unwrap();

        let timestamps = source.available_timestamps(at(1, 0), at(31, 0)).unwrap();

        assert_eq!(source.product(), "ERA5");
        assert_eq!(timestamps, vec![at(1, 0), at(1, 6), at(2, 0)]);
        assert_eq!(source.variables().unwrap(), vec!["swvl1"]);
    }

    #[test]
    fn should_prefer_final_over_preliminary_image() {
        let dir = archive_fixture();
        let source = DirectoryImageSource::open(dir.path()).unwrap();
        let variables = vec!["swvl1".to_string()];

        let final_image = source.get(at(1, 6), &variables).unwrap().unwrap();
        assert_eq!(final_image.data["swvl1"], vec![0.4, 0.5, 0.6]);

        let preliminary = source.get(at(2, 0), &variables).unwrap().unwrap();
        assert_eq!(preliminary.data["swvl1"], vec![0.7, 0.8, 0.9]);
    }

    #[test]
    fn should_report_absent_image_as_none() {
        let dir = archive_fixture();
        let source = DirectoryImageSource::open(dir.path()).unwrap();

        assert!(source.get(at(1, 12), &["swvl1".to_string()]).unwrap().is_none());
        assert!(source.get(at(5, 0), &["swvl1".to_string()]).unwrap().is_none());
    }

    #[test]
    fn should_fill_missing_variable() {
        let dir = archive_fixture();
        let source = DirectoryImageSource::open(dir.path()).unwrap();
        let variables = vec!["swvl1".to_string(), "stl1".to_string()];

        let image = source.get(at(1, 0), &variables).unwrap().unwrap();

        assert_eq!(image.data["stl1"].len(), 3);
        assert!(image.data["stl1"].iter().all(|v| v.is_nan()));
    }

    #[test]
    fn should_select_land_points_outside_antarctica() {
        let dir = archive_fixture();
        let source = DirectoryImageSource::open(dir.path()).unwrap();

        let land: Vec<u32> = source.grid_points(true).unwrap().iter().map(|p| p.gpi).collect();

        assert_eq!(land, vec![0]);
        assert_eq!(source.grid_points(false).unwrap().len(), 3);
    }

    #[test]
    fn should_fault_on_unreadable_root() {
        let result = DirectoryImageSource::open("/nonexistent/era5ts/images");
        assert!(matches!(result, Err(ArchiveError::SourceFault { .. })));
    }

    #[test]
    fn should_fault_on_image_grid_mismatch() {
        let dir = archive_fixture();
        write_image(dir.path(), "ERA5", at(3, 0), vec![0.1]);
        let source = DirectoryImageSource::open(dir.path()).unwrap();

        let result = source.get(at(3, 0), &["swvl1".to_string()]);
        assert!(matches!(result, Err(ArchiveError::SourceFault { .. })));
    }
}
