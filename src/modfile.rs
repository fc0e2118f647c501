//! Modification (tombstone) files.
//!
//! Every data file may carry a sidecar `.mods` file: an append-only log of
//! deletions. One extra modification file, `merge.mods` in the system
//! directory, is active only while a merge is in flight and mirrors every
//! deletion arriving during the merge window.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// A tombstone: for the series `device.measurement`, delete all data whose
/// timestamp is less than or equal to `end_time`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deletion {
    device: String,
    measurement: String,
    version: u64,
    end_time: i64,
}

impl Deletion {
    pub fn new(
        device: impl Into<String>,
        measurement: impl Into<String>,
        version: u64,
        end_time: i64,
    ) -> Self {
        Self {
            device: device.into(),
            measurement: measurement.into(),
            version,
            end_time,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn end_time(&self) -> i64 {
        self.end_time
    }

    /// The same tombstone stamped with another partition's version.
    pub fn with_version(&self, version: u64) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }

    pub fn series_path(&self) -> String {
        format!("{}.{}", self.device, self.measurement)
    }

    pub fn matches(&self, device: &str, measurement: &str) -> bool {
        self.device == device && self.measurement == measurement
    }
}

/// Append-only log of deletions accompanying one data file.
pub struct ModificationFile {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl ModificationFile {
    /// Binds to `path` without touching the filesystem; the file is
    /// created on the first write.
    pub fn new(path: PathBuf) -> Self {
        Self { path, writer: None }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Appends one deletion and flushes it.
    pub fn write(&mut self, deletion: &Deletion) -> Result<()> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        if let Some(w) = self.writer.as_mut() {
            let payload = bincode::serialize(deletion)?;
            w.write_all(&(payload.len() as u32).to_le_bytes())?;
            w.write_all(&payload)?;
            w.flush()?;
        }
        Ok(())
    }

    /// Flushes, syncs, and releases the file handle.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut w) = self.writer.take() {
            w.flush()?;
            w.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Reads every deletion recorded at `path`, stopping at a torn tail.
    pub fn read_all(path: &Path) -> Result<Vec<Deletion>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(path)?;
        let mut out = Vec::new();
        let mut pos = 0usize;
        while pos + 4 <= bytes.len() {
            let len = u32::from_le_bytes([
                bytes[pos],
                bytes[pos + 1],
                bytes[pos + 2],
                bytes[pos + 3],
            ]) as usize;
            pos += 4;
            if pos + len > bytes.len() {
                break;
            }
            match bincode::deserialize(&bytes[pos..pos + len]) {
                Ok(d) => out.push(d),
                Err(_) => break,
            }
            pos += len;
        }
        Ok(out)
    }

    /// All deletions recorded in this file.
    pub fn modifications(&self) -> Result<Vec<Deletion>> {
        Self::read_all(&self.path)
    }

    /// Drops the last recorded deletion; used to roll back a failed
    /// multi-file delete.
    pub fn abort(&mut self) -> Result<()> {
        self.close()?;
        let mut records = Self::read_all(&self.path)?;
        if records.pop().is_none() {
            return Ok(());
        }
        if records.is_empty() {
            if self.path.exists() {
                fs::remove_file(&self.path)?;
            }
            return Ok(());
        }
        let mut buf = Vec::new();
        for d in &records {
            let payload = bincode::serialize(d)?;
            buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            buf.extend_from_slice(&payload);
        }
        fs::write(&self.path, buf)?;
        Ok(())
    }

    /// Removes the file from disk.
    pub fn remove(&mut self) -> Result<()> {
        let _ = self.writer.take();
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
