//! Query snapshot types.
//!
//! A query does not execute here; the coordinator only assembles a
//! consistent snapshot of the resources a reader must visit. Sealed files
//! are included as-is; unsealed files carry their buffer's in-memory
//! points and on-disk chunk metadata captured under the close/query lock.

use crate::DataPoint;
use crate::resource::{ChunkMeta, FileResource};
use std::fmt;
use std::sync::Arc;

/// Full path of one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesPath {
    pub device: String,
    pub measurement: String,
}

impl SeriesPath {
    pub fn new(device: impl Into<String>, measurement: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            measurement: measurement.into(),
        }
    }
}

impl fmt::Display for SeriesPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.device, self.measurement)
    }
}

/// Time-range predicate supplied by the caller.
pub trait TimeFilter: Send + Sync {
    /// Whether a resource spanning `[start, end]` can contain matching data.
    fn satisfy_start_end_time(&self, start: i64, end: i64) -> bool;
}

/// Inclusive time-range filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub min: i64,
    pub max: i64,
}

impl TimeRange {
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }
}

impl TimeFilter for TimeRange {
    fn satisfy_start_end_time(&self, start: i64, end: i64) -> bool {
        start <= self.max && end >= self.min
    }
}

/// Snapshot of one unsealed buffer at query time.
#[derive(Debug, Clone)]
pub struct UnsealedView {
    pub mem_points: Vec<DataPoint>,
    pub disk_chunks: Vec<ChunkMeta>,
}

/// One resource in a query snapshot.
#[derive(Clone)]
pub struct ResourceView {
    pub resource: Arc<FileResource>,
    /// Present iff the resource was unsealed at capture time.
    pub unsealed: Option<UnsealedView>,
}

impl ResourceView {
    pub fn sealed(resource: Arc<FileResource>) -> Self {
        Self {
            resource,
            unsealed: None,
        }
    }

    pub fn unsealed(resource: Arc<FileResource>, view: UnsealedView) -> Self {
        Self {
            resource,
            unsealed: Some(view),
        }
    }
}

/// The snapshot handed to the query engine: the series plus the sequential
/// and unsequential resources it must read. The lists are independent of
/// subsequent mutations.
pub struct QueryDataSource {
    pub series: SeriesPath,
    pub seq: Vec<ResourceView>,
    pub unseq: Vec<ResourceView>,
    pub data_ttl: i64,
}

impl QueryDataSource {
    pub fn new(series: SeriesPath, seq: Vec<ResourceView>, unseq: Vec<ResourceView>) -> Self {
        Self {
            series,
            seq,
            unseq,
            data_ttl: i64::MAX,
        }
    }
}

/// Registers the files a running query depends on, so a concurrent merge
/// cannot physically remove them mid-read.
pub trait FilePathsManager: Send + Sync {
    fn add_used_files_for_query(&self, query_id: u64, source: &QueryDataSource);
}
