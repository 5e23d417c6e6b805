//! Timestamped measurement series.
//!
//! A [`SeriesWriter`] appends named scalar samples (applied setpoints,
//! readings) to one CSV file per series. Rows are flushed as they are
//! written so a crashed run still leaves usable data.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

/// One recorded sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeriesRecord {
    /// Sample time (UTC)
    pub timestamp: DateTime<Utc>,
    /// Channel name (e.g., "power_w", "per_mille")
    pub channel: String,
    /// Sample value
    pub value: f64,
    /// Physical unit (e.g., "W", "photons/s")
    pub unit: String,
}

/// Appends timestamped samples to `<dir>/<name>.csv`.
pub struct SeriesWriter {
    writer: csv::Writer<File>,
    path: PathBuf,
}

impl SeriesWriter {
    /// Create (or truncate) the series file and write the header.
    pub fn create(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let path = dir.as_ref().join(format!("{}.csv", name));
        let file = File::create(&path)
            .with_context(|| format!("failed to create series file {}", path.display()))?;
        Ok(Self {
            writer: csv::Writer::from_writer(file),
            path,
        })
    }

    /// Append one sample, stamped now.
    pub fn append(&mut self, channel: &str, value: f64, unit: &str) -> Result<()> {
        self.append_record(SeriesRecord {
            timestamp: Utc::now(),
            channel: channel.to_string(),
            value,
            unit: unit.to_string(),
        })
    }

    /// Append a pre-stamped sample.
    pub fn append_record(&mut self, record: SeriesRecord) -> Result<()> {
        self.writer
            .serialize(&record)
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        self.writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        Ok(())
    }

    /// Path of the series file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read a series file back into memory.
pub fn read_series(path: impl AsRef<Path>) -> Result<Vec<SeriesRecord>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open series file {}", path.display()))?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        let record: SeriesRecord =
            row.with_context(|| format!("malformed row in {}", path.display()))?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SeriesWriter::create(dir.path(), "laser_setpoints").unwrap();

        writer.append("power_w", 7.5e-6, "W").unwrap();
        writer.append("per_mille", 500.0, "‰").unwrap();
        writer.append("photon_flux", 2.4e13, "photons/s").unwrap();

        let records = read_series(writer.path()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].channel, "power_w");
        assert!((records[0].value - 7.5e-6).abs() < 1e-18);
        assert_eq!(records[1].unit, "‰");
        // Timestamps are monotonic within a run
        assert!(records[0].timestamp <= records[2].timestamp);
    }

    #[test]
    fn test_read_rejects_malformed_series() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.csv");
        std::fs::write(&path, "timestamp,channel,value,unit\nnot-a-time,x,1.0,V\n").unwrap();
        assert!(read_series(&path).is_err());
    }

    #[test]
    fn test_create_in_missing_directory_fails() {
        assert!(SeriesWriter::create("/nonexistent/measurements", "s").is_err());
    }
}
