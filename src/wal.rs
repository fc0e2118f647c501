//! Per-buffer write-ahead log nodes.
//!
//! The write-ahead log proper is an external collaborator; a writable
//! buffer only needs somewhere to append its insert and deletion records
//! when WAL is enabled. `LogNode` is a minimal append-only file with
//! length-framed bincode records, `NopWal` is the disabled variant.

use crate::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// A record appended to a buffer's log node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WalRecord {
    Insert {
        device: String,
        measurement: String,
        timestamp: i64,
        value: f64,
    },
    Delete {
        device: String,
        measurement: String,
        end_time: i64,
    },
}

/// Trait for per-buffer log nodes.
pub trait Wal: Send + Sync {
    /// Appends one record.
    fn append(&self, record: &WalRecord) -> Result<()>;

    /// Forces buffered records to stable storage.
    fn sync(&self) -> Result<()>;

    /// Removes the log; called when the owning buffer is sealed.
    fn remove(&self) -> Result<()>;
}

/// No-op log node used when WAL is disabled.
pub struct NopWal;

impl Wal for NopWal {
    fn append(&self, _record: &WalRecord) -> Result<()> {
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        Ok(())
    }
}

/// File-backed log node for one writable buffer.
pub struct LogNode {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl LogNode {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Reads every record back, stopping silently at a torn tail.
    pub fn read_all(&self) -> Result<Vec<WalRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&self.path)?;
        let mut records = Vec::new();
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
                Ok(record) => records.push(record),
                Err(_) => break,
            }
            pos += len;
        }
        Ok(records)
    }
}

impl Wal for LogNode {
    fn append(&self, record: &WalRecord) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            *writer = Some(BufWriter::new(file));
        }
        if let Some(w) = writer.as_mut() {
            let payload = bincode::serialize(record)?;
            w.write_all(&(payload.len() as u32).to_le_bytes())?;
            w.write_all(&payload)?;
            w.flush()?;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if let Some(w) = self.writer.lock().as_mut() {
            w.flush()?;
            w.get_ref().sync_all()?;
        }
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        let _ = self.writer.lock().take();
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn log_node_round_trips_records() {
        let dir = TempDir::new().unwrap();
        let node = LogNode::new(dir.path().join("b.log"));

        let insert = WalRecord::Insert {
            device: "d1".into(),
            measurement: "m1".into(),
            timestamp: 7,
            value: 1.5,
        };
        let delete = WalRecord::Delete {
            device: "d1".into(),
            measurement: "m1".into(),
            end_time: 7,
        };
        node.append(&insert).unwrap();
        node.append(&delete).unwrap();
        node.sync().unwrap();

        assert_eq!(node.read_all().unwrap(), vec![insert, delete]);

        node.remove().unwrap();
        assert!(!node.path().exists());
    }

    #[test]
    fn log_node_ignores_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torn.log");
        let node = LogNode::new(path.clone());
        node.append(&WalRecord::Delete {
            device: "d".into(),
            measurement: "m".into(),
            end_time: 1,
        })
        .unwrap();
        node.sync().unwrap();

        // Simulate a crash mid-append.
        let mut bytes = fs::read(&path).unwrap();
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3]);
        fs::write(&path, bytes).unwrap();

        assert_eq!(node.read_all().unwrap().len(), 1);
    }
}
