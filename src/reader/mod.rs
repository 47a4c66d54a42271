//! Decoded AIS report input boundary.
//!
//! The core never parses raw AIS bit streams. An upstream decoder writes
//! JSON lines, one report per line, and this module streams them in file
//! order. Lines that fail to parse are logged and skipped so a single bad
//! record never stops ingestion.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A decoded position report for one vessel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionReport {
    pub mmsi: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub course_over_ground: f32,
    pub speed_over_ground: f32,
    pub timestamp: DateTime<Utc>,
}

/// A decoded static/identity report (ship type, dimensions, name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityReport {
    pub mmsi: u32,
    pub ship_type: u32,
    pub ship_length_meters: Option<f32>,
    pub name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Report {
    Position(PositionReport),
    Identity(IdentityReport),
}

/// Open a JSON-lines report file for streaming.
pub fn read_reports(path: &Path) -> Result<ReportReader> {
    let file =
        File::open(path).with_context(|| format!("cannot open report file {}", path.display()))?;
    Ok(ReportReader {
        lines: BufReader::new(file).lines(),
        line_no: 0,
        skipped: 0,
    })
}

pub struct ReportReader {
    lines: Lines<BufReader<File>>,
    line_no: u64,
    skipped: u64,
}

impl ReportReader {
    /// Lines dropped because of I/O or parse failures so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl Iterator for ReportReader {
    type Item = Report;

    fn next(&mut self) -> Option<Report> {
        loop {
            let line = self.lines.next()?;
            self.line_no += 1;
            match line {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => match serde_json::from_str::<Report>(&line) {
                    Ok(report) => return Some(report),
                    Err(e) => {
                        debug!(line = self.line_no, "skipping unparseable report: {}", e);
                        self.skipped += 1;
                    }
                },
                Err(e) => {
                    debug!(line = self.line_no, "read error, skipping line: {}", e);
                    self.skipped += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_streams_reports_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports.jsonl");
        let mut f = File::create(&path).unwrap();
        writeln!(
            f,
            r#"{{"type":"position","mmsi":123456789,"latitude":55.1,"longitude":10.2,"course_over_ground":90.0,"speed_over_ground":12.5,"timestamp":"2024-03-01T10:00:00Z"}}"#
        )
        .unwrap();
        writeln!(f, "this is not json").unwrap();
        writeln!(
            f,
            r#"{{"type":"identity","mmsi":123456789,"ship_type":70,"ship_length_meters":120.0,"name":"EXAMPLE","timestamp":"2024-03-01T10:00:05Z"}}"#
        )
        .unwrap();
        drop(f);

        let mut reader = read_reports(&path).unwrap();
        assert!(matches!(reader.next(), Some(Report::Position(p)) if p.mmsi == 123456789));
        assert!(matches!(reader.next(), Some(Report::Identity(i)) if i.ship_type == 70));
        assert!(reader.next().is_none());
        assert_eq!(reader.skipped(), 1);
    }
}
