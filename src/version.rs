//! Durable per-partition version allocation.
//!
//! Every file creation and every deletion consumes one version from the
//! owning partition's counter. The counter is backed by a file named
//! `<partition>-versions` in the group's system directory; it persists an
//! upper bound in steps so a restart can never hand out a version that was
//! already used.

use crate::Result;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};

/// How many allocations one persisted bound covers. A crash skips at most
/// this many versions.
const SAVE_INTERVAL: u64 = 100;

/// Monotonic version counter for one time partition.
pub struct VersionController {
    partition: i64,
    path: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    current: u64,
    ceiling: u64,
}

impl VersionController {
    /// Opens (or creates) the counter for `partition` under `sys_dir`.
    pub fn open(sys_dir: &Path, partition: i64) -> Result<Self> {
        fs::create_dir_all(sys_dir)?;
        let path = sys_dir.join(format!("{partition}-versions"));
        let stored = if path.exists() {
            fs::read_to_string(&path)?
                .trim()
                .parse::<u64>()
                .unwrap_or(0)
        } else {
            0
        };
        Ok(Self {
            partition,
            path,
            inner: Mutex::new(Inner {
                current: stored,
                ceiling: stored,
            }),
        })
    }

    pub fn partition(&self) -> i64 {
        self.partition
    }

    /// Allocates the next version, persisting a new upper bound when the
    /// previous one is exhausted.
    pub fn next_version(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.current += 1;
        if inner.current > inner.ceiling {
            inner.ceiling += SAVE_INTERVAL;
            self.persist(inner.ceiling)?;
        }
        Ok(inner.current)
    }

    /// The most recently allocated version.
    pub fn current_version(&self) -> u64 {
        self.inner.lock().current
    }

    fn persist(&self, ceiling: u64) -> Result<()> {
        let temp = self.path.with_extension("temp");
        fs::write(&temp, ceiling.to_string())?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}
