//! Command line interface.

pub mod command;

use std::{path::PathBuf, time::Duration};

use chrono::NaiveDate;
use clap::{command, Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use crate::{
    grid::DEFAULT_CELL_SIZE,
    reshuffle::{DEFAULT_BUFFER_SIZE, DEFAULT_H_STEPS},
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
/// Reshuffles reanalysis images into a cell-partitioned time series archive
pub struct Cli {
    /// Log filter, e.g. `info` or `era5ts=debug`
    #[arg(long, global = true, env = "ERA5TS_LOG", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Convert a raw image archive into a time series archive
    Reshuffle(ReshuffleArgs),
    /// Append newly available images to a time series archive
    Update(UpdateArgs),
    /// Print the time series nearest to a location
    Read(ReadArgs),
}

#[derive(Args)]
pub struct ReshuffleArgs {
    /// Root of the raw image archive
    pub img_path: PathBuf,
    /// Directory of the time series archive
    pub ts_path: PathBuf,
    /// First day to reshuffle [default: first available image]
    #[arg(long)]
    pub start: Option<NaiveDate>,
    /// Last day to reshuffle [default: last available image]
    #[arg(long)]
    pub end: Option<NaiveDate>,
    /// Variables to reshuffle [default: all variables of the first image]
    #[arg(long, value_delimiter = ',')]
    pub variables: Option<Vec<String>>,
    /// Hours of the day to reshuffle
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_H_STEPS)]
    pub h_steps: Vec<u32>,
    /// Only reshuffle points inside this box
    #[arg(
        long,
        num_args = 4,
        allow_negative_numbers = true,
        value_names = ["MIN_LON", "MIN_LAT", "MAX_LON", "MAX_LAT"]
    )]
    pub bbox: Option<Vec<f64>>,
    /// Only reshuffle land points
    #[arg(long)]
    pub land_points: bool,
    /// Images held in memory between writes
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    pub imgbuffer: usize,
    /// Cell edge length in degrees
    #[arg(long, default_value_t = DEFAULT_CELL_SIZE)]
    pub cell_size: f64,
    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct UpdateArgs {
    /// Directory of the time series archive
    pub ts_path: PathBuf,
    /// Read images from here instead of the archive's recorded image path
    #[arg(long)]
    pub imgpath: Option<PathBuf>,
    /// Images held in memory between writes [default: the archive's]
    #[arg(long)]
    pub imgbuffer: Option<usize>,
    /// Last day to append [default: last fully available day]
    #[arg(long)]
    pub end: Option<NaiveDate>,
    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ReadArgs {
    /// Directory of the time series archive
    pub ts_path: PathBuf,
    #[arg(allow_negative_numbers = true)]
    pub lon: f64,
    #[arg(allow_negative_numbers = true)]
    pub lat: f64,
    /// Print the time series as JSON
    #[arg(long)]
    pub json: bool,
}

/// Creates a spinner.
pub fn create_spinner(message: String) -> ProgressBar {
    let bar = ProgressBar::new_spinner().with_message(message);
    bar.enable_steady_tick(Duration::from_millis(100));

    bar
}

/// Creates a progress bar.
pub fn create_progress_bar(size: u64, message: String) -> ProgressBar {
    ProgressBar::new(size).with_message(message).with_style(
        ProgressStyle::with_template("[{eta_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("##-"),
    )
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod test {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn should_verify_command_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn should_parse_reshuffle_options() {
        let cli = Cli::parse_from([
            "era5ts",
            "reshuffle",
            "/data/era5",
            "/data/ts",
            "--start",
            "2010-01-01",
            "--variables",
            "swvl1,swvl2",
            "--h-steps",
            "0,12",
            "--bbox",
            "-10",
            "30",
            "40",
            "60",
        ]);

        match cli.command {
            Commands::Reshuffle(args) => {
                assert_eq!(args.start, NaiveDate::from_ymd_opt(2010, 1, 1));
                assert_eq!(args.end, None);
                assert_eq!(args.variables, Some(vec!["swvl1".to_string(), "swvl2".to_string()]));
                assert_eq!(args.h_steps, vec![0, 12]);
                assert_eq!(args.bbox, Some(vec![-10.0, 30.0, 40.0, 60.0]));
                assert_eq!(args.imgbuffer, DEFAULT_BUFFER_SIZE);
            }
            _ => panic!("expected reshuffle"),
        }
    }

    #[test]
    fn should_parse_negative_coordinates() {
        let cli = Cli::parse_from(["era5ts", "read", "/data/ts", "-3.5", "-70"]);

        match cli.command {
            Commands::Read(args) => assert_eq!((args.lon, args.lat), (-3.5, -70.0)),
            _ => panic!("expected read"),
        }
    }
}
