//! Save and load cell stores.
//!
//! One row per (location, timestamp). Rows of a location are contiguous and
//! in time order, so a single location reads without touching the others.
//! Appends never decode the stored value columns: the location and time
//! columns are scanned to validate new entries, and the stored rows are
//! streamed batch by batch into the rewritten file.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fs::File,
    io::Write,
    path::Path,
    sync::Arc,
};

use arrow::{
    array::{
        ArrayRef, Float32Array, Float32Builder, TimestampSecondArray, TimestampSecondBuilder,
        UInt32Array, UInt32Builder,
    },
    datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit},
    record_batch::RecordBatch,
};
use chrono::{DateTime, NaiveDateTime};
use parquet::arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter, ProjectionMask};

use crate::{
    error::{ArchiveError, Result},
    image::MISSING,
    store::{CellStore, TimeSeriesRecord},
};

use super::{column, writer_properties};

pub const LOCATION_COLUMN: &str = "location_id";
pub const TIME_COLUMN: &str = "time";

const CHUNK_SIZE: usize = 100_000;

fn cell_schema(variables: &[String]) -> SchemaRef {
    let mut fields = vec![
        Field::new(LOCATION_COLUMN, DataType::UInt32, false),
        Field::new(TIME_COLUMN, DataType::Timestamp(TimeUnit::Second, None), false),
    ];
    fields.extend(
        variables
            .iter()
            .map(|name| Field::new(name, DataType::Float32, false)),
    );

    Arc::new(Schema::new(fields))
}

/// Variable names of a cell file, in column order.
fn stored_variables(schema: &Schema, path: &Path) -> Result<Vec<String>> {
    let fields = schema.fields();
    if fields.len() < 2
        || fields[0].name() != LOCATION_COLUMN
        || fields[1].name() != TIME_COLUMN
    {
        return Err(ArchiveError::corrupt(path, "not a cell store file"));
    }

    Ok(fields.iter().skip(2).map(|f| f.name().clone()).collect())
}

fn to_timestamp(seconds: i64, path: &Path) -> Result<NaiveDateTime> {
    DateTime::from_timestamp(seconds, 0)
        .map(|t| t.naive_utc())
        .ok_or_else(|| ArchiveError::corrupt(path, "timestamp out of range"))
}

/// Encodes rows in `CHUNK_SIZE` batches. Stored batches can be passed through
/// between records; pending rows are written first so the order holds.
struct CellSink<W: Write + Send> {
    writer: ArrowWriter<W>,
    schema: SchemaRef,
    variables: Vec<String>,
    location_builder: UInt32Builder,
    time_builder: TimestampSecondBuilder,
    value_builders: Vec<Float32Builder>,
    current_batch_rows: usize,
}

impl<W: Write + Send> CellSink<W> {
    fn try_new(sink: W, variables: &[String]) -> Result<Self> {
        let schema = cell_schema(variables);
        let writer = ArrowWriter::try_new(sink, schema.clone(), Some(writer_properties()))?;

        Ok(CellSink {
            writer,
            schema,
            variables: variables.to_vec(),
            location_builder: UInt32Builder::with_capacity(CHUNK_SIZE),
            time_builder: TimestampSecondBuilder::with_capacity(CHUNK_SIZE),
            value_builders: variables
                .iter()
                .map(|_| Float32Builder::with_capacity(CHUNK_SIZE))
                .collect(),
            current_batch_rows: 0,
        })
    }

    fn push_record(&mut self, record: &TimeSeriesRecord) -> Result<()> {
        for (row, timestamp) in record.times().iter().enumerate() {
            self.location_builder.append_value(record.location());
            self.time_builder.append_value(timestamp.and_utc().timestamp());

            for (builder, variable) in self.value_builders.iter_mut().zip(&self.variables) {
                let value = record
                    .values(variable)
                    .and_then(|values| values.get(row).copied())
                    .unwrap_or(MISSING);
                builder.append_value(value);
            }

            self.current_batch_rows += 1;

            if self.current_batch_rows >= CHUNK_SIZE {
                self.write_pending()?;
            }
        }

        Ok(())
    }

    fn write_pending(&mut self) -> Result<()> {
        if self.current_batch_rows == 0 {
            return Ok(());
        }

        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(self.location_builder.finish()),
            Arc::new(self.time_builder.finish()),
        ];
        columns.extend(
            self.value_builders
                .iter_mut()
                .map(|builder| Arc::new(builder.finish()) as ArrayRef),
        );

        let batch = RecordBatch::try_new(self.schema.clone(), columns)?;
        self.writer.write(&batch)?;
        self.current_batch_rows = 0;

        Ok(())
    }

    fn write_stored(&mut self, batch: &RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        self.write_pending()?;
        self.writer.write(batch)?;

        Ok(())
    }

    fn close(mut self) -> Result<()> {
        self.write_pending()?;
        self.writer.close()?;

        Ok(())
    }
}

/// Streams the cell file at `stored` into `sink`, placing each location's
/// appended entries right after its stored rows. Locations new to the cell
/// follow in the order they were first appended. Without a stored file this
/// writes `appended` alone.
///
/// The appended store must use the stored file's variable order.
pub fn merge_cell<W: Write + Send>(stored: Option<&Path>, appended: &CellStore, sink: W) -> Result<()> {
    let mut sink = CellSink::try_new(sink, appended.variables())?;
    let mut merged = HashSet::new();

    if let Some(path) = stored {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
        if stored_variables(builder.schema(), path)? != appended.variables() {
            return Err(ArchiveError::corrupt(path, "variable columns changed while appending"));
        }

        let mut current: Option<u32> = None;
        for batch in builder.build()? {
            let batch = RecordBatch::try_new(sink.schema.clone(), batch?.columns().to_vec())?;
            let locations = column::<UInt32Array>(&batch, 0, path)?;

            let mut start = 0;
            for row in 0..batch.num_rows() {
                let location = locations.value(row);
                if current == Some(location) {
                    continue;
                }
                if let Some(previous) = current {
                    sink.write_stored(&batch.slice(start, row - start))?;
                    start = row;
                    if let Some(record) = appended.record(previous) {
                        sink.push_record(record)?;
                    }
                    merged.insert(previous);
                }
                current = Some(location);
            }
            sink.write_stored(&batch.slice(start, batch.num_rows() - start))?;
        }

        if let Some(last) = current {
            if let Some(record) = appended.record(last) {
                sink.push_record(record)?;
            }
            merged.insert(last);
        }
    }

    for record in appended.records().filter(|r| !merged.contains(&r.location())) {
        sink.push_record(record)?;
    }

    sink.close()
}

/// What an append needs to know of a stored cell: its variables and, per
/// location, the last timestamp plus every timestamp from a cut-off onwards.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTimes {
    variables: Vec<String>,
    last: HashMap<u32, NaiveDateTime>,
    recent: HashMap<u32, BTreeSet<NaiveDateTime>>,
}

impl StoredTimes {
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn last(&self, location: u32) -> Option<NaiveDateTime> {
        self.last.get(&location).copied()
    }

    /// Only answers for timestamps at or after the cut-off it was loaded with.
    pub fn contains(&self, location: u32, timestamp: NaiveDateTime) -> bool {
        self.recent
            .get(&location)
            .is_some_and(|times| times.contains(&timestamp))
    }
}

/// Reads the location and time columns of a cell file. Timestamps before
/// `since` are dropped once checked; `None` keeps them all.
pub fn load_cell_times(path: &Path, since: Option<NaiveDateTime>) -> Result<StoredTimes> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    let variables = stored_variables(builder.schema(), path)?;
    let mask = ProjectionMask::roots(builder.parquet_schema(), [0, 1]);

    let mut times = StoredTimes {
        variables,
        last: HashMap::new(),
        recent: HashMap::new(),
    };
    let mut current: Option<u32> = None;

    for batch in builder.with_projection(mask).build()? {
        let batch = batch?;
        let locations = column::<UInt32Array>(&batch, 0, path)?;
        let stamps = column::<TimestampSecondArray>(&batch, 1, path)?;

        for row in 0..batch.num_rows() {
            let location = locations.value(row);
            let timestamp = to_timestamp(stamps.value(row), path)?;

            if current != Some(location) && times.last.contains_key(&location) {
                return Err(ArchiveError::corrupt(
                    path,
                    format!("rows of location {} are not contiguous", location),
                ));
            }
            current = Some(location);

            if let Some(last) = times.last.insert(location, timestamp) {
                if timestamp <= last {
                    return Err(ArchiveError::corrupt(
                        path,
                        format!("location {} is not in time order at {}", location, timestamp),
                    ));
                }
            }
            if since.map_or(true, |since| timestamp >= since) {
                times.recent.entry(location).or_default().insert(timestamp);
            }
        }
    }

    Ok(times)
}

pub fn load_cell(path: &Path, cell: i32) -> Result<CellStore> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;

    let variables = stored_variables(builder.schema(), path)?;
    let mut store = CellStore::new(cell, variables.clone());

    for batch in builder.build()? {
        let batch = batch?;
        let locations = column::<UInt32Array>(&batch, 0, path)?;
        let times = column::<TimestampSecondArray>(&batch, 1, path)?;
        let values = (2..batch.num_columns())
            .map(|index| column::<Float32Array>(&batch, index, path))
            .collect::<Result<Vec<_>>>()?;

        for row in 0..batch.num_rows() {
            let timestamp = to_timestamp(times.value(row), path)?;
            let entry: BTreeMap<String, f32> = variables
                .iter()
                .zip(&values)
                .map(|(name, array)| (name.clone(), array.value(row)))
                .collect();

            store
                .append(locations.value(row), timestamp, &entry)
                .map_err(|e| ArchiveError::corrupt(path, e))?;
        }
    }

    Ok(store)
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod test {
    use chrono::NaiveDate;
    use tempfile::NamedTempFile;

    use super::*;

    fn entry(swvl1: f32, swvl2: f32) -> BTreeMap<String, f32> {
        BTreeMap::from([("swvl1".to_string(), swvl1), ("swvl2".to_string(), swvl2)])
    }

    #[test]
    fn should_keep_locations_contiguous_and_missing_values() {
        let t0 = NaiveDate::from_ymd_opt(2010, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let t1 = NaiveDate::from_ymd_opt(2010, 1, 1).unwrap().and_hms_opt(6, 0, 0).unwrap();
        let variables = vec!["swvl1".to_string(), "swvl2".to_string()];

        let mut store = CellStore::new(1314, variables.clone());
        store.append(7, t0, &entry(0.1, 0.2)).unwrap();
        store.append(3, t0, &entry(0.3, 0.4)).unwrap();
        store.append(7, t1, &entry(0.5, MISSING)).unwrap();

        let file = NamedTempFile::new().unwrap();
        merge_cell(None, &store, file.reopen().unwrap()).unwrap();

        let loaded = load_cell(file.path(), 1314).unwrap();
        assert_eq!(loaded.variables(), &variables[..]);

        let order: Vec<u32> = loaded.records().map(|r| r.location()).collect();
        assert_eq!(order, vec![7, 3]);

        let record = loaded.record(7).unwrap();
        assert_eq!(record.times(), &[t0, t1]);
        assert_eq!(record.values("swvl1").unwrap(), &[0.1, 0.5]);
        assert!(record.values("swvl2").unwrap()[1].is_nan());
    }

    #[test]
    fn should_reject_foreign_parquet_file() {
        let file = NamedTempFile::new().unwrap();
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::UInt32, false)]));
        let mut writer = ArrowWriter::try_new(file.reopen().unwrap(), schema, None).unwrap();
        writer.close().unwrap();

        let result = load_cell(file.path(), 0);
        assert!(matches!(result, Err(ArchiveError::CorruptFile { .. })));
    }

    fn hour(h: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2010, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
            + chrono::Duration::hours(h)
    }

    fn saved(store: &CellStore) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        merge_cell(None, store, file.reopen().unwrap()).unwrap();
        file
    }

    #[test]
    fn should_merge_appended_entries_after_stored_rows() {
        let variables = vec!["swvl1".to_string(), "swvl2".to_string()];
        let mut stored = CellStore::new(1314, variables.clone());
        stored.append(7, hour(0), &entry(0.1, 0.2)).unwrap();
        stored.append(3, hour(0), &entry(0.3, 0.4)).unwrap();
        let file = saved(&stored);

        let mut appended = CellStore::new(1314, variables);
        appended.append(3, hour(6), &entry(0.5, 0.6)).unwrap();
        appended.append(9, hour(6), &entry(0.7, 0.8)).unwrap();
        appended.append(7, hour(6), &entry(0.9, 1.0)).unwrap();

        let merged = NamedTempFile::new().unwrap();
        merge_cell(Some(file.path()), &appended, merged.reopen().unwrap()).unwrap();

        let loaded = load_cell(merged.path(), 1314).unwrap();
        let order: Vec<u32> = loaded.records().map(|r| r.location()).collect();
        assert_eq!(order, vec![7, 3, 9]);
        assert_eq!(loaded.record(7).unwrap().times(), &[hour(0), hour(6)]);
        assert_eq!(loaded.record(3).unwrap().values("swvl2").unwrap(), &[0.4, 0.6]);
        assert_eq!(loaded.record(9).unwrap().len(), 1);
    }

    #[test]
    fn should_merge_locations_spanning_several_read_batches() {
        let variables = vec!["swvl1".to_string()];
        let mut stored = CellStore::new(1314, variables.clone());
        for h in 0..3000 {
            let value = BTreeMap::from([("swvl1".to_string(), h as f32)]);
            stored.append(1, hour(h), &value).unwrap();
        }
        for h in 0..10 {
            let value = BTreeMap::from([("swvl1".to_string(), -1.0)]);
            stored.append(2, hour(h), &value).unwrap();
        }
        let file = saved(&stored);

        let mut appended = CellStore::new(1314, variables);
        let value = BTreeMap::from([("swvl1".to_string(), 9.0)]);
        appended.append(2, hour(3000), &value).unwrap();
        appended.append(1, hour(3000), &value).unwrap();

        let merged = NamedTempFile::new().unwrap();
        merge_cell(Some(file.path()), &appended, merged.reopen().unwrap()).unwrap();

        let times = load_cell_times(merged.path(), None).unwrap();
        assert_eq!(times.last(1), Some(hour(3000)));
        assert_eq!(times.last(2), Some(hour(3000)));

        let loaded = load_cell(merged.path(), 1314).unwrap();
        let record = loaded.record(1).unwrap();
        assert_eq!(record.len(), 3001);
        assert_eq!(record.values("swvl1").unwrap()[2999], 2999.0);
        assert_eq!(loaded.record(2).unwrap().len(), 11);
    }

    #[test]
    fn should_load_times_from_cut_off() {
        let mut stored = CellStore::new(1314, vec!["swvl1".to_string(), "swvl2".to_string()]);
        for h in [0, 6, 12, 18] {
            stored.append(4, hour(h), &entry(0.1, 0.2)).unwrap();
        }
        let file = saved(&stored);

        let times = load_cell_times(file.path(), Some(hour(12))).unwrap();

        assert_eq!(times.variables(), &["swvl1".to_string(), "swvl2".to_string()]);
        assert_eq!(times.last(4), Some(hour(18)));
        assert_eq!(times.last(5), None);
        assert!(times.contains(4, hour(12)));
        assert!(!times.contains(4, hour(6)));
    }
}
