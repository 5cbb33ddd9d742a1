//! Grid points and their partition into fixed-size geographic cells.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, Result};

pub const DEFAULT_CELL_SIZE: f64 = 5.0;

/// One location of the product grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridPoint {
    pub gpi: u32,
    pub lon: f64,
    pub lat: f64,
}

impl GridPoint {
    /// Longitudes are normalised into [-180, 180).
    pub fn new(gpi: u32, lon: f64, lat: f64) -> Self {
        GridPoint {
            gpi,
            lon: normalise_lon(lon),
            lat,
        }
    }
}

/// (min_lon, min_lat, max_lon, max_lat), inclusive on every edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Result<Self> {
        if min_lon > max_lon || min_lat > max_lat {
            return Err(ArchiveError::InvalidOptions(format!(
                "bbox corners are reversed: ({}, {}) to ({}, {})",
                min_lon, min_lat, max_lon, max_lat
            )));
        }

        Ok(BoundingBox {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        })
    }

    pub fn contains(&self, point: &GridPoint) -> bool {
        point.lon >= self.min_lon
            && point.lon <= self.max_lon
            && point.lat >= self.min_lat
            && point.lat <= self.max_lat
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}

fn normalise_lon(lon: f64) -> f64 {
    (lon + 180.0).rem_euclid(360.0) - 180.0
}

/// Cell number of the tile containing (lon, lat).
///
/// Cells are numbered column-major from (-180, -90): each column of
/// `ceil(180 / cell_size)` cells runs south to north. The north pole is
/// folded into the top row.
pub fn cell_id(lon: f64, lat: f64, cell_size: f64) -> i32 {
    let rows = (180.0 / cell_size).ceil() as i32;
    let col = ((normalise_lon(lon) + 180.0) / cell_size).floor() as i32;
    let row = (((lat + 90.0) / cell_size).floor() as i32).clamp(0, rows - 1);

    col * rows + row
}

/// Keeps the points inside `bbox`, in source order.
pub fn select(points: Vec<GridPoint>, bbox: Option<&BoundingBox>) -> Vec<GridPoint> {
    match bbox {
        Some(bbox) => points.into_iter().filter(|p| bbox.contains(p)).collect(),
        None => points,
    }
}

/// Assigns grid points to cells under a fixed tiling.
#[derive(Debug, Clone, Copy)]
pub struct GridPartitioner {
    cell_size: f64,
}

impl GridPartitioner {
    pub fn new(cell_size: f64) -> Result<Self> {
        if !(cell_size > 0.0 && cell_size <= 180.0) {
            return Err(ArchiveError::InvalidOptions(format!(
                "cell size must be in (0, 180], got {}",
                cell_size
            )));
        }

        Ok(GridPartitioner { cell_size })
    }

    /// Partitions `points`. Within a cell, points keep their input order.
    pub fn build(&self, points: &[GridPoint]) -> GridIndex {
        let mut cells = Vec::with_capacity(points.len());
        let mut members: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
        let mut positions = HashMap::with_capacity(points.len());

        for (pos, point) in points.iter().enumerate() {
            let cell = cell_id(point.lon, point.lat, self.cell_size);
            cells.push(cell);
            members.entry(cell).or_default().push(pos);
            positions.insert(point.gpi, pos);
        }

        GridIndex {
            cell_size: self.cell_size,
            points: points.to_vec(),
            cells,
            members,
            positions,
        }
    }
}

impl Default for GridPartitioner {
    fn default() -> Self {
        GridPartitioner {
            cell_size: DEFAULT_CELL_SIZE,
        }
    }
}

/// Grid point to cell mapping, in both directions.
#[derive(Debug, Clone, PartialEq)]
pub struct GridIndex {
    cell_size: f64,
    points: Vec<GridPoint>,
    cells: Vec<i32>,
    members: BTreeMap<i32, Vec<usize>>,
    positions: HashMap<u32, usize>,
}

impl GridIndex {
    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[GridPoint] {
        &self.points
    }

    /// Cell of every point, parallel to `points()`.
    pub fn cells(&self) -> &[i32] {
        &self.cells
    }

    /// Non-empty cells in ascending order.
    pub fn cell_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.members.keys().copied()
    }

    pub fn cell_count(&self) -> usize {
        self.members.len()
    }

    pub fn cell_of(&self, gpi: u32) -> Option<i32> {
        self.positions.get(&gpi).map(|&pos| self.cells[pos])
    }

    pub fn points_in(&self, cell: i32) -> impl Iterator<Item = &GridPoint> + '_ {
        self.members
            .get(&cell)
            .into_iter()
            .flatten()
            .map(|&pos| &self.points[pos])
    }

    /// Closest point by great-circle distance.
    pub fn nearest(&self, lon: f64, lat: f64) -> Option<&GridPoint> {
        let lon = normalise_lon(lon);
        self.points.iter().min_by(|a, b| {
            let da = angular_distance(lon, lat, a.lon, a.lat);
            let db = angular_distance(lon, lat, b.lon, b.lat);
            da.total_cmp(&db)
        })
    }
}

fn angular_distance(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let (lat1, lat2) = (lat1.to_radians(), lat2.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);

    2.0 * a.sqrt().min(1.0).asin()
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;

    fn four_points() -> Vec<GridPoint> {
        vec![
            GridPoint::new(0, 2.0, 2.0),
            GridPoint::new(1, 7.0, 2.0),
            GridPoint::new(2, 2.0, 7.0),
            GridPoint::new(3, -3.0, -3.0),
        ]
    }

    #[test]
    fn should_number_cells_from_lower_left_corner() {
        assert_eq!(cell_id(-180.0, -90.0, 5.0), 0);
        assert_eq!(cell_id(-180.0, -84.0, 5.0), 1);
        assert_eq!(cell_id(-174.0, -90.0, 5.0), 36);
        assert_eq!(cell_id(0.0, 0.0, 5.0), 36 * 36 + 18);
    }

    #[test]
    fn should_fold_poles_and_dateline() {
        assert_eq!(cell_id(0.0, 90.0, 5.0), cell_id(0.0, 89.9, 5.0));
        assert_eq!(cell_id(180.0, 0.0, 5.0), cell_id(-180.0, 0.0, 5.0));
        assert_eq!(cell_id(179.9, 89.9, 5.0), 72 * 36 - 1);
    }

    #[test]
    fn should_assign_four_points_to_four_cells() {
        let index = GridPartitioner::default().build(&four_points());

        assert_eq!(index.cell_count(), 4);
        assert_eq!(index.cell_of(0), Some(cell_id(0.0, 0.0, 5.0)));
        assert_eq!(index.cell_of(1), Some(cell_id(5.0, 0.0, 5.0)));
        assert_eq!(index.cell_of(2), Some(cell_id(0.0, 5.0, 5.0)));
        assert_eq!(index.cell_of(3), Some(cell_id(-5.0, -5.0, 5.0)));
        assert_eq!(index.cell_of(99), None);
    }

    #[test]
    fn should_neither_lose_nor_duplicate_points() {
        let points: Vec<GridPoint> = (0..720)
            .map(|i| GridPoint::new(i, -180.0 + (i % 72) as f64 * 5.3, -90.0 + (i / 72) as f64 * 17.9))
            .collect();
        let index = GridPartitioner::new(10.0).unwrap().build(&points);

        let mut seen = HashSet::new();
        for cell in index.cell_ids() {
            for point in index.points_in(cell) {
                assert!(seen.insert(point.gpi), "point {} in two cells", point.gpi);
                assert_eq!(index.cell_of(point.gpi), Some(cell));
            }
        }
        assert_eq!(seen.len(), points.len());
    }

    #[test]
    fn should_keep_source_order_within_cell() {
        let points = vec![
            GridPoint::new(10, 1.0, 1.0),
            GridPoint::new(4, 3.0, 3.0),
            GridPoint::new(7, 2.0, 2.0),
        ];
        let index = GridPartitioner::default().build(&points);
        let cell = index.cell_ids().next().unwrap();
        let order: Vec<u32> = index.points_in(cell).map(|p| p.gpi).collect();

        assert_eq!(order, vec![10, 4, 7]);
        assert_eq!(index, GridPartitioner::default().build(&points));
    }

    #[test]
    fn should_build_empty_index_from_no_points() {
        let index = GridPartitioner::default().build(&[]);

        assert!(index.is_empty());
        assert_eq!(index.cell_count(), 0);
    }

    #[test]
    fn should_filter_by_inclusive_bbox() {
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0).unwrap();
        let selected = select(four_points(), Some(&bbox));

        assert_eq!(selected.iter().map(|p| p.gpi).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(bbox.contains(&GridPoint::new(9, 10.0, 0.0)));
    }

    #[test]
    fn should_reject_reversed_bbox() {
        assert!(BoundingBox::new(10.0, 0.0, 0.0, 10.0).is_err());
        assert!(GridPartitioner::new(0.0).is_err());
    }

    #[test]
    fn should_find_nearest_point() {
        let index = GridPartitioner::default().build(&four_points());

        assert_eq!(index.nearest(6.5, 2.5).map(|p| p.gpi), Some(1));
        assert_eq!(index.nearest(-4.0, -2.0).map(|p| p.gpi), Some(3));
    }
}
