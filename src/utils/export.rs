//! Session summary export.
//!
//! Appends one row per scheduler to a session-wide CSV: group, nominal and effective rate,
//! tick counts, overruns, and episodes written. The header is written when the file is new,
//! so repeated sessions accumulate in one file for trending.

use std::{
    fs::{OpenOptions, create_dir_all},
    path::Path,
};

use csv::WriterBuilder;
use log::info;
use serde::Serialize;

use crate::engine::scheduler::SchedulerReport;
use crate::error::PersistError;

#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    session: &'a str,
    group: &'a str,
    nominal_hz: f64,
    effective_hz: f64,
    ticks_started: u64,
    ticks_completed: u64,
    ticks_failed: u64,
    overruns: u64,
    halted: bool,
    episodes: u32,
    elapsed_s: f64,
}

/// Appends a row per report to `csv_path`.
///
/// `nominal_hz` is looked up by group name; groups without an entry report 0.
pub fn export_session_summary(
    csv_path: &Path,
    session: &str,
    reports: &[SchedulerReport],
    nominal_hz: impl Fn(&str) -> Option<f64>,
    episodes: u32,
) -> Result<(), PersistError> {
    if let Some(parent) = csv_path.parent() {
        create_dir_all(parent).map_err(|e| PersistError::io(parent, e))?;
    }
    let file_exists = csv_path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(csv_path)
        .map_err(|e| PersistError::io(csv_path, e))?;

    let mut wtr = WriterBuilder::new().has_headers(!file_exists).from_writer(file);
    for report in reports {
        let row = SummaryRow {
            session,
            group: &report.name,
            nominal_hz: nominal_hz(&report.name).unwrap_or(0.0),
            effective_hz: report.effective_hz(),
            ticks_started: report.ticks_started,
            ticks_completed: report.ticks_completed,
            ticks_failed: report.ticks_failed,
            overruns: report.overruns,
            halted: report.halted,
            episodes,
            elapsed_s: report.elapsed.as_secs_f64(),
        };
        wtr.serialize(row)
            .map_err(|e| PersistError::io(csv_path, e.into()))?;
    }
    wtr.flush().map_err(|e| PersistError::io(csv_path, e))?;
    info!("Summary exported to: {:?}", csv_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn report(name: &str, ticks: u64) -> SchedulerReport {
        SchedulerReport {
            name: name.into(),
            ticks_started: ticks,
            ticks_completed: ticks,
            elapsed: Duration::from_secs(1),
            ..SchedulerReport::default()
        }
    }

    #[test]
    fn header_is_written_once_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        let hz = |g: &str| if g == "arm" { Some(120.0) } else { None };
        export_session_summary(&path, "s1", &[report("arm", 118)], hz, 1).unwrap();
        export_session_summary(&path, "s2", &[report("arm", 119), report("image", 30)], hz, 2).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("session,group,nominal_hz"));
        assert!(lines[3].starts_with("s2,image,0.0,30.0"));
    }
}
