//! Storage-group configuration.

use crate::{Result, TsVaultError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// One week in milliseconds, the default time-partition width.
pub const DEFAULT_PARTITION_INTERVAL_MS: i64 = 7 * 24 * 3600 * 1000;

/// Strategy used to pick merge candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Select as many whole files as the memory budget allows.
    MaxFileNum,
    /// Additionally bound the number of distinct series in one merge.
    MaxSeriesNum,
}

impl MergeStrategy {
    /// Resolves a strategy by its configuration name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "MAX_FILE_NUM" => Ok(MergeStrategy::MaxFileNum),
            "MAX_SERIES_NUM" => Ok(MergeStrategy::MaxSeriesNum),
            other => Err(TsVaultError::InvalidConfiguration(format!(
                "unknown merge strategy {other}"
            ))),
        }
    }
}

/// Configuration of one storage group.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Cap on writable buffers per kind; inserting into one partition more
    /// than this schedules the oldest buffer for async close.
    pub concurrent_writing_partitions: usize,
    /// Width of one time partition in milliseconds.
    pub partition_interval: i64,
    /// Data time-to-live in milliseconds; `i64::MAX` disables the check.
    pub data_ttl: i64,
    /// Memory budget handed to the merge selector, in bytes.
    pub merge_memory_budget: u64,
    /// Merge candidate selection strategy.
    pub merge_strategy: MergeStrategy,
    /// Rewrite every selected sequential file even when nothing overlaps it.
    pub force_full_merge: bool,
    /// Resume an interrupted merge found at startup instead of discarding it.
    pub continue_merge_after_reboot: bool,
    /// Append insert and deletion records to per-buffer log nodes.
    pub enable_wal: bool,
    /// Drop files whose historical versions are a subset of a loaded file's.
    pub reduce_overlap_on_load: bool,
    /// Number of buffered points after which a buffer reports `should_flush`.
    pub flush_threshold_points: usize,
    /// Interval between background TTL sweeps.
    pub ttl_check_interval: Duration,
    /// Worker threads executing flush and close jobs.
    pub flush_workers: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            concurrent_writing_partitions: 1,
            partition_interval: DEFAULT_PARTITION_INTERVAL_MS,
            data_ttl: i64::MAX,
            merge_memory_budget: 64 * 1024 * 1024,
            merge_strategy: MergeStrategy::MaxFileNum,
            force_full_merge: false,
            continue_merge_after_reboot: false,
            enable_wal: false,
            reduce_overlap_on_load: false,
            flush_threshold_points: 128 * 1024,
            ttl_check_interval: Duration::from_secs(600),
            flush_workers: 2,
        }
    }
}

impl GroupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrent_writing_partitions(mut self, n: usize) -> Self {
        self.concurrent_writing_partitions = n;
        self
    }

    pub fn with_partition_interval(mut self, millis: i64) -> Self {
        self.partition_interval = millis;
        self
    }

    pub fn with_data_ttl(mut self, millis: i64) -> Self {
        self.data_ttl = millis;
        self
    }

    pub fn with_merge_memory_budget(mut self, bytes: u64) -> Self {
        self.merge_memory_budget = bytes;
        self
    }

    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    pub fn with_force_full_merge(mut self, on: bool) -> Self {
        self.force_full_merge = on;
        self
    }

    pub fn with_continue_merge_after_reboot(mut self, on: bool) -> Self {
        self.continue_merge_after_reboot = on;
        self
    }

    pub fn with_wal_enabled(mut self, on: bool) -> Self {
        self.enable_wal = on;
        self
    }

    pub fn with_reduce_overlap_on_load(mut self, on: bool) -> Self {
        self.reduce_overlap_on_load = on;
        self
    }

    pub fn with_flush_threshold_points(mut self, points: usize) -> Self {
        self.flush_threshold_points = points;
        self
    }

    pub fn with_ttl_check_interval(mut self, interval: Duration) -> Self {
        self.ttl_check_interval = interval;
        self
    }

    pub fn with_flush_workers(mut self, workers: usize) -> Self {
        self.flush_workers = workers;
        self
    }

    /// Rejects configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.partition_interval <= 0 {
            return Err(TsVaultError::InvalidConfiguration(
                "partition_interval must be positive".to_string(),
            ));
        }
        if self.concurrent_writing_partitions == 0 {
            return Err(TsVaultError::InvalidConfiguration(
                "concurrent_writing_partitions must be at least 1".to_string(),
            ));
        }
        if self.data_ttl <= 0 {
            return Err(TsVaultError::InvalidConfiguration(
                "data_ttl must be positive (use i64::MAX to disable)".to_string(),
            ));
        }
        if self.flush_threshold_points == 0 {
            return Err(TsVaultError::InvalidConfiguration(
                "flush_threshold_points must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Process-level flags shared between storage groups and their host.
///
/// Disk exhaustion during buffer creation or load flips the read-only
/// latch; subsequent ingestion is rejected until an operator clears it.
#[derive(Debug, Default)]
pub struct SystemFlags {
    read_only: AtomicBool,
}

impl SystemFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn set_read_only(&self, on: bool) {
        self.read_only.store(on, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        GroupConfig::default().validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_partition_interval() {
        let cfg = GroupConfig::default().with_partition_interval(0);
        assert!(matches!(
            cfg.validate(),
            Err(TsVaultError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn merge_strategy_resolves_by_name() {
        assert_eq!(
            MergeStrategy::from_name("MAX_FILE_NUM").unwrap(),
            MergeStrategy::MaxFileNum
        );
        assert_eq!(
            MergeStrategy::from_name("MAX_SERIES_NUM").unwrap(),
            MergeStrategy::MaxSeriesNum
        );
        assert!(MergeStrategy::from_name("MAX_CHUNK_NUM").is_err());
    }
}
