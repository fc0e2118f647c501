//! Data-directory rotation.
//!
//! A storage group writes sequential and unsequential files into two
//! families of data roots. The rotator hands out the next root for each
//! family and fails with `DiskSpaceInsufficient` when a root cannot be
//! prepared.

use crate::{Result, TsVaultError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Hands out data roots for new files.
pub trait DirectoryRotator: Send + Sync {
    /// The root the next sequential file should be created under.
    fn next_sequential_root(&self) -> Result<PathBuf>;

    /// The root the next unsequential file should be created under.
    fn next_unsequential_root(&self) -> Result<PathBuf>;

    /// All sequential roots, for recovery scans.
    fn sequential_roots(&self) -> Vec<PathBuf>;

    /// All unsequential roots, for recovery scans.
    fn unsequential_roots(&self) -> Vec<PathBuf>;
}

/// Round-robin rotation over fixed lists of roots.
pub struct RoundRobinRotator {
    seq_roots: Vec<PathBuf>,
    unseq_roots: Vec<PathBuf>,
    seq_next: AtomicUsize,
    unseq_next: AtomicUsize,
}

impl RoundRobinRotator {
    pub fn new(seq_roots: Vec<PathBuf>, unseq_roots: Vec<PathBuf>) -> Result<Self> {
        if seq_roots.is_empty() || unseq_roots.is_empty() {
            return Err(TsVaultError::InvalidConfiguration(
                "at least one sequential and one unsequential data root is required".to_string(),
            ));
        }
        Ok(Self {
            seq_roots,
            unseq_roots,
            seq_next: AtomicUsize::new(0),
            unseq_next: AtomicUsize::new(0),
        })
    }

    fn next_from(roots: &[PathBuf], counter: &AtomicUsize) -> Result<PathBuf> {
        let idx = counter.fetch_add(1, Ordering::AcqRel) % roots.len();
        let root = roots[idx].clone();
        std::fs::create_dir_all(&root).map_err(|e| TsVaultError::DiskSpaceInsufficient {
            dir: root.clone(),
            details: e.to_string(),
        })?;
        Ok(root)
    }
}

impl DirectoryRotator for RoundRobinRotator {
    fn next_sequential_root(&self) -> Result<PathBuf> {
        Self::next_from(&self.seq_roots, &self.seq_next)
    }

    fn next_unsequential_root(&self) -> Result<PathBuf> {
        Self::next_from(&self.unseq_roots, &self.unseq_next)
    }

    fn sequential_roots(&self) -> Vec<PathBuf> {
        self.seq_roots.clone()
    }

    fn unsequential_roots(&self) -> Vec<PathBuf> {
        self.unseq_roots.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rotation_cycles_through_roots() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let u = dir.path().join("u");
        let rotator =
            RoundRobinRotator::new(vec![a.clone(), b.clone()], vec![u.clone()]).unwrap();

        assert_eq!(rotator.next_sequential_root().unwrap(), a);
        assert_eq!(rotator.next_sequential_root().unwrap(), b);
        assert_eq!(rotator.next_sequential_root().unwrap(), a);
        assert_eq!(rotator.next_unsequential_root().unwrap(), u);
        assert!(u.exists());
    }

    #[test]
    fn empty_root_lists_are_rejected() {
        assert!(RoundRobinRotator::new(vec![], vec![PathBuf::from("/tmp/u")]).is_err());
    }
}
