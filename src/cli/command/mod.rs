pub mod read;
pub mod reshuffle;
pub mod update;

use std::process::ExitCode;

use anyhow::Result;

pub use read::read;
pub use reshuffle::reshuffle;
pub use update::update;

use crate::reshuffle::RunSummary;

/// Exit code when the run finished but images were missing.
const EXIT_GAPS: u8 = 2;

/// Prints the summary and maps it to the process exit code.
pub fn report(summary: &RunSummary, json: bool) -> Result<ExitCode> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        println!("{}", render_summary(summary));
    }

    Ok(exit_code(summary))
}

pub fn exit_code(summary: &RunSummary) -> ExitCode {
    if summary.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_GAPS)
    }
}

fn render_summary(summary: &RunSummary) -> String {
    let coverage = summary
        .coverage_end
        .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());

    let mut lines = vec![
        format!("Images written:     {}", summary.images_written),
        format!("Already present:    {}", summary.skipped_duplicates),
        format!("Missing images:     {}", summary.missing_count),
        format!("Cells touched:      {}", summary.cells_touched.len()),
        format!("Coverage ends:      {}", coverage),
    ];
    if summary.completeness_warning {
        lines.push("Warning: many images were missing, the archive may be incomplete".to_string());
    }

    lines.join("\n")
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod test {
    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn should_render_summary() {
        let summary = RunSummary {
            images_written: 7,
            missing_count: 1,
            coverage_end: NaiveDate::from_ymd_opt(2010, 1, 2).unwrap().and_hms_opt(18, 0, 0),
            cells_touched: vec![1314, 1350],
            ..RunSummary::default()
        };

        let rendered = render_summary(&summary);

        assert!(rendered.contains("Images written:     7"));
        assert!(rendered.contains("Missing images:     1"));
        assert!(rendered.contains("Cells touched:      2"));
        assert!(rendered.contains("2010-01-02 18:00"));
        assert!(!rendered.contains("Warning"));
    }

    #[test]
    fn should_signal_gaps_in_exit_code() {
        let complete = RunSummary::noop(None);
        let gaps = RunSummary {
            missing_count: 1,
            ..RunSummary::default()
        };

        assert_eq!(format!("{:?}", exit_code(&complete)), format!("{:?}", ExitCode::SUCCESS));
        assert_eq!(format!("{:?}", exit_code(&gaps)), format!("{:?}", ExitCode::from(EXIT_GAPS)));
    }
}
