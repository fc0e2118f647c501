//! Metadata collaborator: series resolution and the last-value cache.
//!
//! The metadata tree proper lives outside the storage group; the
//! coordinator only needs schema lookups and last-value cache updates,
//! prioritized by the device's global flushed watermark.

use crate::{DataPoint, Result, TsVaultError};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Resolved schema of one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesSchema {
    pub device: String,
    pub measurement: String,
}

impl SeriesSchema {
    pub fn series_path(&self) -> String {
        format!("{}.{}", self.device, self.measurement)
    }
}

/// The slice of the metadata service the coordinator consumes.
pub trait MetadataService: Send + Sync {
    /// Resolves a series to its schema, creating device nodes on demand.
    fn series_schema(&self, device: &str, measurement: &str) -> Result<SeriesSchema>;

    /// Updates the cached last value of a series. `latest_flushed` is the
    /// device's global flushed watermark; a cached value at or above the
    /// incoming timestamp wins.
    fn update_last_cache(
        &self,
        device: &str,
        measurement: &str,
        point: DataPoint,
        high_priority: bool,
        latest_flushed: i64,
    ) -> Result<()>;

    /// The storage group owning a full series path.
    fn storage_group_for(&self, path: &str) -> Result<String>;
}

/// In-memory metadata service with a last-value cache.
pub struct InMemoryMetadata {
    group: String,
    last_cache: RwLock<HashMap<(String, String), DataPoint>>,
}

impl InMemoryMetadata {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            last_cache: RwLock::new(HashMap::new()),
        }
    }

    /// The cached last value of a series, if any.
    pub fn last_cached(&self, device: &str, measurement: &str) -> Option<DataPoint> {
        self.last_cache
            .read()
            .get(&(device.to_string(), measurement.to_string()))
            .copied()
    }
}

impl MetadataService for InMemoryMetadata {
    fn series_schema(&self, device: &str, measurement: &str) -> Result<SeriesSchema> {
        if device.is_empty() || measurement.is_empty() {
            return Err(TsVaultError::Metadata {
                series: format!("{device}.{measurement}"),
                details: "device and measurement must be non-empty".to_string(),
            });
        }
        Ok(SeriesSchema {
            device: device.to_string(),
            measurement: measurement.to_string(),
        })
    }

    fn update_last_cache(
        &self,
        device: &str,
        measurement: &str,
        point: DataPoint,
        _high_priority: bool,
        _latest_flushed: i64,
    ) -> Result<()> {
        let key = (device.to_string(), measurement.to_string());
        let mut cache = self.last_cache.write();
        match cache.get(&key) {
            Some(cached) if cached.timestamp >= point.timestamp => {}
            _ => {
                cache.insert(key, point);
            }
        }
        Ok(())
    }

    fn storage_group_for(&self, _path: &str) -> Result<String> {
        Ok(self.group.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_cache_keeps_the_newest_point() {
        let meta = InMemoryMetadata::new("root.sg");
        meta.update_last_cache("d1", "m1", DataPoint::new(10, 1.0), true, i64::MIN)
            .unwrap();
        meta.update_last_cache("d1", "m1", DataPoint::new(5, 9.0), true, i64::MIN)
            .unwrap();
        assert_eq!(meta.last_cached("d1", "m1"), Some(DataPoint::new(10, 1.0)));

        meta.update_last_cache("d1", "m1", DataPoint::new(20, 2.0), true, i64::MIN)
            .unwrap();
        assert_eq!(meta.last_cached("d1", "m1"), Some(DataPoint::new(20, 2.0)));
    }

    #[test]
    fn schema_rejects_empty_components() {
        let meta = InMemoryMetadata::new("root.sg");
        assert!(meta.series_schema("", "m1").is_err());
        assert!(meta.series_schema("d1", "").is_err());
        assert!(meta.series_schema("d1", "m1").is_ok());
    }
}
