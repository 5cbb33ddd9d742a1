//! Print the archived time series nearest to a location.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Serialize;

use crate::{
    cli::{create_spinner, ReadArgs},
    grid::GridPoint,
    store::{read_time_series, TimeSeriesRecord},
};

#[derive(Debug, Serialize)]
struct TimeSeries<'a> {
    point: GridPoint,
    times: &'a [NaiveDateTime],
    values: BTreeMap<&'a str, Vec<Option<f32>>>,
}

impl<'a> TimeSeries<'a> {
    /// Missing values become `null`.
    fn new(point: GridPoint, record: &'a TimeSeriesRecord) -> Self {
        let values = record
            .variables()
            .map(|name| {
                let series = record
                    .values(name)
                    .unwrap_or_default()
                    .iter()
                    .map(|v| (!v.is_nan()).then_some(*v))
                    .collect();
                (name, series)
            })
            .collect();

        TimeSeries {
            point,
            times: record.times(),
            values,
        }
    }
}

pub fn read(args: &ReadArgs) -> Result<()> {
    let bar = create_spinner(format!("Reading time series at ({}, {})...", args.lon, args.lat));
    let (point, record) = read_time_series(&args.ts_path, args.lon, args.lat)
        .with_context(|| format!("reading {:?}", args.ts_path))?;
    bar.finish_and_clear();

    let series = TimeSeries::new(point, &record);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&series)?);
    } else {
        println!("{}", render_table(&series));
    }

    Ok(())
}

fn render_table(series: &TimeSeries) -> String {
    let mut lines = vec![format!(
        "# gpi {} at ({}, {})",
        series.point.gpi, series.point.lon, series.point.lat
    )];

    let mut header = vec!["time"];
    header.extend(series.values.keys().copied());
    lines.push(header.join(","));

    for (row, time) in series.times.iter().enumerate() {
        let mut fields = vec![time.format("%Y-%m-%dT%H:%M").to_string()];
        fields.extend(series.values.values().map(|values| match values.get(row) {
            Some(Some(value)) => value.to_string(),
            _ => "NaN".to_string(),
        }));
        lines.push(fields.join(","));
    }

    lines.join("\n")
}

// -- Tests -------------------------------------------------------------------
