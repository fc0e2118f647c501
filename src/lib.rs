//! tsvault - storage-group coordinator for time-series data
//!
//! tsvault owns the on-disk and in-memory state of one logical storage group:
//! time-partitioned data files, their sidecar metadata and tombstone files,
//! and the writable buffers that feed them. It routes point and batch inserts
//! to sequential or unsequential files based on per-device flush watermarks,
//! drives asynchronous flush and close, coordinates background merges,
//! applies range deletions with crash-safe modification logging, enforces a
//! data TTL, and loads externally produced data files.

pub mod buffer;
pub mod concurrency;
pub mod config;
pub mod dirs;
pub mod error;
pub mod group;
pub mod merge;
pub mod metadata;
pub mod modfile;
pub mod query;
pub mod resource;
pub mod tracker;
pub mod version;
pub mod wal;

pub use config::{GroupConfig, MergeStrategy, SystemFlags};
pub use error::{Result, TsVaultError};
pub use group::{GroupBuilder, StorageGroup};
pub use query::{QueryDataSource, SeriesPath, TimeRange};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents a data point, the smallest unit of time series data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// The actual value.
    pub value: f64,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}

impl DataPoint {
    /// Creates a new DataPoint.
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataPoint(ts: {}, val: {})", self.timestamp, self.value)
    }
}

/// A single-row insertion: one timestamp, one device, several measurements.
#[derive(Debug, Clone)]
pub struct Record {
    device: String,
    measurements: Vec<String>,
    timestamp: i64,
    values: Vec<f64>,
}

impl Record {
    /// Creates a new Record.
    pub fn new(
        device: impl Into<String>,
        timestamp: i64,
        measurements: Vec<String>,
        values: Vec<f64>,
    ) -> Self {
        Self {
            device: device.into(),
            measurements,
            timestamp,
            values,
        }
    }

    /// Convenience constructor for a single-measurement row.
    pub fn single(
        device: impl Into<String>,
        measurement: impl Into<String>,
        timestamp: i64,
        value: f64,
    ) -> Self {
        Self::new(device, timestamp, vec![measurement.into()], vec![value])
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn measurements(&self) -> &[String] {
        &self.measurements
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// A batch insertion for a single device: sorted timestamps and a
/// column-major value block, one column per measurement.
#[derive(Debug, Clone)]
pub struct Tablet {
    device: String,
    measurements: Vec<String>,
    timestamps: Vec<i64>,
    columns: Vec<Vec<f64>>,
}

impl Tablet {
    /// Creates a new Tablet. `columns[m][row]` holds the value of
    /// measurement `m` at `timestamps[row]`.
    pub fn new(
        device: impl Into<String>,
        measurements: Vec<String>,
        timestamps: Vec<i64>,
        columns: Vec<Vec<f64>>,
    ) -> Self {
        Self {
            device: device.into(),
            measurements,
            timestamps,
            columns,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn measurements(&self) -> &[String] {
        &self.measurements
    }

    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    pub fn columns(&self) -> &[Vec<f64>] {
        &self.columns
    }

    pub fn row_count(&self) -> usize {
        self.timestamps.len()
    }

    /// Value of measurement `m` at row `row`.
    pub fn value_at(&self, m: usize, row: usize) -> f64 {
        self.columns[m][row]
    }
}

/// Per-row result code for batch insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    Success,
    OutOfTtl,
    InternalError,
}

/// Maps a timestamp to its time-partition id.
pub fn time_partition(timestamp: i64, partition_interval: i64) -> i64 {
    timestamp.div_euclid(partition_interval)
}

/// Current wall-clock time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_partition_uses_floor_division() {
        assert_eq!(time_partition(0, 1000), 0);
        assert_eq!(time_partition(999, 1000), 0);
        assert_eq!(time_partition(1000, 1000), 1);
        assert_eq!(time_partition(-1, 1000), -1);
        assert_eq!(time_partition(-1000, 1000), -1);
        assert_eq!(time_partition(-1001, 1000), -2);
    }

    #[test]
    fn tablet_exposes_column_major_values() {
        let tablet = Tablet::new(
            "d1",
            vec!["m1".into(), "m2".into()],
            vec![1, 2, 3],
            vec![vec![1.0, 2.0, 3.0], vec![10.0, 20.0, 30.0]],
        );
        assert_eq!(tablet.row_count(), 3);
        assert_eq!(tablet.value_at(0, 2), 3.0);
        assert_eq!(tablet.value_at(1, 0), 10.0);
    }
}
