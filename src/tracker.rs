//! Layered latest-timestamp tables driving the sequential/unsequential
//! routing decision.
//!
//! Three tables, from most volatile to most settled:
//! 1. per-partition, per-device latest timestamp seen in RAM,
//! 2. per-partition, per-device latest timestamp already flushed,
//! 3. per-device global maximum of (2) across partitions.
//!
//! For every `(partition, device)`, (2) never exceeds (1) and only grows.
//! An incoming row is sequential iff its timestamp is strictly greater
//! than (2) for its partition and device.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct LatestTimeTracker {
    latest: HashMap<i64, HashMap<String, i64>>,
    flushed: HashMap<i64, HashMap<String, i64>>,
    global_flushed: HashMap<String, i64>,
}

impl LatestTimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes sure both per-partition tables exist for `partition`.
    pub fn ensure_partition(&mut self, partition: i64) {
        self.latest.entry(partition).or_default();
        self.flushed.entry(partition).or_default();
    }

    /// The flushed watermark for `(partition, device)`; `i64::MIN` when the
    /// device has never been flushed in that partition.
    pub fn latest_flushed(&self, partition: i64, device: &str) -> i64 {
        self.flushed
            .get(&partition)
            .and_then(|m| m.get(device))
            .copied()
            .unwrap_or(i64::MIN)
    }

    /// The in-RAM latest timestamp for `(partition, device)`.
    pub fn latest_time(&self, partition: i64, device: &str) -> Option<i64> {
        self.latest
            .get(&partition)
            .and_then(|m| m.get(device))
            .copied()
    }

    /// The global flushed watermark for `device`; `i64::MIN` if absent.
    pub fn global_flushed(&self, device: &str) -> i64 {
        self.global_flushed
            .get(device)
            .copied()
            .unwrap_or(i64::MIN)
    }

    /// Records an ingested timestamp into the in-RAM table.
    pub fn observe(&mut self, partition: i64, device: &str, timestamp: i64) {
        let entry = self
            .latest
            .entry(partition)
            .or_default()
            .entry(device.to_string())
            .or_insert(i64::MIN);
        if *entry < timestamp {
            *entry = timestamp;
        }
    }

    /// Copies the in-RAM table of `partition` into the flushed tables;
    /// invoked when a sequential buffer's content is committed to disk.
    /// Returns false iff the partition holds no devices.
    pub fn promote_flushed(&mut self, partition: i64) -> bool {
        let Some(latest) = self.latest.get(&partition) else {
            return false;
        };
        if latest.is_empty() {
            return false;
        }
        let snapshot: Vec<(String, i64)> =
            latest.iter().map(|(d, t)| (d.clone(), *t)).collect();
        let flushed = self.flushed.entry(partition).or_default();
        for (device, ts) in snapshot {
            flushed.insert(device.clone(), ts);
            let global = self.global_flushed.entry(device).or_insert(i64::MIN);
            if *global < ts {
                *global = ts;
            }
        }
        true
    }

    /// Seeds all three tables monotonically; used by recovery and load,
    /// which observe data that is already on disk.
    pub fn seed_flushed(&mut self, partition: i64, device: &str, timestamp: i64) {
        let latest = self
            .latest
            .entry(partition)
            .or_default()
            .entry(device.to_string())
            .or_insert(i64::MIN);
        if *latest < timestamp {
            *latest = timestamp;
        }
        let flushed = self
            .flushed
            .entry(partition)
            .or_default()
            .entry(device.to_string())
            .or_insert(i64::MIN);
        if *flushed < timestamp {
            *flushed = timestamp;
        }
        let global = self
            .global_flushed
            .entry(device.to_string())
            .or_insert(i64::MIN);
        if *global < timestamp {
            *global = timestamp;
        }
    }

    /// The newest timestamp known for `device` across all partitions, or
    /// None if the device was never seen.
    pub fn last_update_time(&self, device: &str) -> Option<i64> {
        self.latest
            .values()
            .filter_map(|m| m.get(device))
            .copied()
            .max()
    }

    pub fn clear(&mut self) {
        self.latest.clear();
        self.flushed.clear();
        self.global_flushed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushed_never_exceeds_latest() {
        let mut t = LatestTimeTracker::new();
        t.observe(0, "d1", 10);
        t.observe(0, "d1", 20);
        assert_eq!(t.latest_flushed(0, "d1"), i64::MIN);

        assert!(t.promote_flushed(0));
        assert_eq!(t.latest_flushed(0, "d1"), 20);
        assert_eq!(t.latest_time(0, "d1"), Some(20));
        assert!(t.latest_flushed(0, "d1") <= t.latest_time(0, "d1").unwrap());
    }

    #[test]
    fn global_flushed_is_max_across_partitions() {
        let mut t = LatestTimeTracker::new();
        t.observe(0, "d1", 50);
        t.observe(1, "d1", 700);
        t.promote_flushed(0);
        t.promote_flushed(1);
        assert_eq!(t.global_flushed("d1"), 700);
        assert_eq!(t.latest_flushed(0, "d1"), 50);
    }

    #[test]
    fn promote_reports_empty_partitions() {
        let mut t = LatestTimeTracker::new();
        t.ensure_partition(3);
        assert!(!t.promote_flushed(3));
        assert!(!t.promote_flushed(99));
    }

    #[test]
    fn last_update_time_spans_partitions() {
        let mut t = LatestTimeTracker::new();
        assert_eq!(t.last_update_time("d1"), None);
        t.observe(0, "d1", 5);
        t.observe(2, "d1", 42);
        t.observe(2, "d2", 100);
        assert_eq!(t.last_update_time("d1"), Some(42));
    }

    #[test]
    fn seed_flushed_is_monotonic() {
        let mut t = LatestTimeTracker::new();
        t.seed_flushed(0, "d1", 30);
        t.seed_flushed(0, "d1", 10);
        assert_eq!(t.latest_flushed(0, "d1"), 30);
        assert_eq!(t.global_flushed("d1"), 30);
    }
}
