//! Writable buffers: the in-memory accumulator for one (partition, kind).
//!
//! A buffer owns the memtable and the append handle of one unsealed data
//! file. Flushing encodes the memtable into chunks appended to the file;
//! sealing performs a final flush, persists the `.resource` sidecar, and
//! transitions the attached resource to closed.

use crate::modfile::Deletion;
use crate::resource::{ChunkMeta, ChunkPayload, FileResource, write_chunk};
use crate::version::VersionController;
use crate::wal::{Wal, WalRecord};
use crate::{DataPoint, Record, Result, Tablet, TsVaultError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

#[derive(Default)]
struct MemTable {
    // device -> measurement -> points in arrival order
    series: HashMap<String, HashMap<String, Vec<DataPoint>>>,
}

impl MemTable {
    fn push(&mut self, device: &str, measurement: &str, point: DataPoint) {
        self.series
            .entry(device.to_string())
            .or_default()
            .entry(measurement.to_string())
            .or_default()
            .push(point);
    }

    fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

struct BufferState {
    memtable: MemTable,
    file: File,
    write_offset: u64,
}

/// The writable processor for one `(partition, kind)`.
pub struct MemBuffer {
    partition: i64,
    sequence: bool,
    resource: Arc<FileResource>,
    versions: Arc<VersionController>,
    wal: Arc<dyn Wal>,
    flush_threshold: usize,
    state: Mutex<BufferState>,
    flushing: AtomicBool,
    closing: AtomicBool,
    sealed: AtomicBool,
    mem_points: AtomicUsize,
}

impl MemBuffer {
    /// Creates a buffer over a fresh data file and attaches it to the
    /// resource.
    pub fn create(
        resource: Arc<FileResource>,
        versions: Arc<VersionController>,
        wal: Arc<dyn Wal>,
        flush_threshold: usize,
        sequence: bool,
    ) -> Result<Arc<Self>> {
        let path = resource.path();
        Self::build(resource, versions, wal, flush_threshold, sequence, path, 0)
    }

    /// Re-opens a buffer over a partially written file found at recovery.
    /// The file is truncated to `valid_len`, past any torn trailing chunk.
    pub fn recovered(
        resource: Arc<FileResource>,
        versions: Arc<VersionController>,
        wal: Arc<dyn Wal>,
        flush_threshold: usize,
        sequence: bool,
        valid_len: u64,
    ) -> Result<Arc<Self>> {
        let path = resource.path();
        if path.exists() {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Self::build(
            resource,
            versions,
            wal,
            flush_threshold,
            sequence,
            path,
            valid_len,
        )
    }

    fn build(
        resource: Arc<FileResource>,
        versions: Arc<VersionController>,
        wal: Arc<dyn Wal>,
        flush_threshold: usize,
        sequence: bool,
        path: PathBuf,
        write_offset: u64,
    ) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let partition = resource.partition();
        let buffer = Arc::new(Self {
            partition,
            sequence,
            resource: resource.clone(),
            versions,
            wal,
            flush_threshold,
            state: Mutex::new(BufferState {
                memtable: MemTable::default(),
                file,
                write_offset,
            }),
            flushing: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            sealed: AtomicBool::new(false),
            mem_points: AtomicUsize::new(0),
        });
        resource.attach_processor(&buffer);
        Ok(buffer)
    }

    pub fn partition(&self) -> i64 {
        self.partition
    }

    pub fn is_sequence(&self) -> bool {
        self.sequence
    }

    pub fn resource(&self) -> &Arc<FileResource> {
        &self.resource
    }

    pub fn version_controller(&self) -> &Arc<VersionController> {
        &self.versions
    }

    /// Number of points currently buffered in memory.
    pub fn memtable_size(&self) -> usize {
        self.mem_points.load(Ordering::Acquire)
    }

    /// Whether the buffer has grown past its flush watermark.
    pub fn should_flush(&self) -> bool {
        self.memtable_size() >= self.flush_threshold
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn set_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Marks the buffer as being flushed. Returns false when another flush
    /// is already in flight.
    pub fn begin_flush(&self) -> bool {
        self.flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_flush(&self) {
        self.flushing.store(false, Ordering::Release);
    }

    /// Accepts one row.
    pub fn insert(&self, record: &Record) -> Result<()> {
        if record.measurements().len() != record.values().len() {
            return Err(TsVaultError::WriteProcess(format!(
                "row has {} measurements but {} values",
                record.measurements().len(),
                record.values().len()
            )));
        }
        let ts = record.timestamp();
        let device = record.device();
        for (measurement, value) in record.measurements().iter().zip(record.values()) {
            self.wal.append(&WalRecord::Insert {
                device: device.to_string(),
                measurement: measurement.clone(),
                timestamp: ts,
                value: *value,
            })?;
        }

        let mut state = self.state.lock();
        for (measurement, value) in record.measurements().iter().zip(record.values()) {
            state
                .memtable
                .push(device, measurement, DataPoint::new(ts, *value));
        }
        drop(state);
        self.mem_points
            .fetch_add(record.measurements().len(), Ordering::AcqRel);

        self.resource.update_start_time(device, ts);
        // Unsequential end times stay current; sequential ones are frozen
        // from the latest-time table when the buffer is scheduled for close.
        if !self.sequence {
            self.resource.update_end_time(device, ts);
        }
        Ok(())
    }

    /// Accepts the tablet rows in `[start, end)`. The tablet is sorted by
    /// timestamp, so the run boundaries are `timestamps[start]` and
    /// `timestamps[end - 1]`.
    pub fn insert_tablet(&self, tablet: &Tablet, start: usize, end: usize) -> Result<()> {
        if start >= end {
            return Ok(());
        }
        let device = tablet.device();
        for row in start..end {
            let ts = tablet.timestamps()[row];
            for (m, measurement) in tablet.measurements().iter().enumerate() {
                self.wal.append(&WalRecord::Insert {
                    device: device.to_string(),
                    measurement: measurement.clone(),
                    timestamp: ts,
                    value: tablet.value_at(m, row),
                })?;
            }
        }

        let mut inserted = 0usize;
        let mut state = self.state.lock();
        for row in start..end {
            let ts = tablet.timestamps()[row];
            for (m, measurement) in tablet.measurements().iter().enumerate() {
                let value = tablet.value_at(m, row);
                state
                    .memtable
                    .push(device, measurement, DataPoint::new(ts, value));
                inserted += 1;
            }
        }
        drop(state);
        self.mem_points.fetch_add(inserted, Ordering::AcqRel);

        self.resource
            .update_start_time(device, tablet.timestamps()[start]);
        if !self.sequence {
            self.resource
                .update_end_time(device, tablet.timestamps()[end - 1]);
        }
        Ok(())
    }

    /// Appends a deletion record to this buffer's log node.
    pub fn log_deletion(&self, device: &str, measurement: &str, end_time: i64) -> Result<()> {
        self.wal.append(&WalRecord::Delete {
            device: device.to_string(),
            measurement: measurement.to_string(),
            end_time,
        })
    }

    /// Removes matching points from the memtable.
    pub fn delete_in_memory(&self, deletion: &Deletion) {
        let mut state = self.state.lock();
        let mut removed = 0usize;
        if let Some(measurements) = state.memtable.series.get_mut(deletion.device()) {
            if let Some(points) = measurements.get_mut(deletion.measurement()) {
                let before = points.len();
                points.retain(|p| p.timestamp > deletion.end_time());
                removed = before - points.len();
            }
        }
        drop(state);
        if removed > 0 {
            self.mem_points.fetch_sub(removed, Ordering::AcqRel);
        }
    }

    /// Encodes the memtable into chunks appended to the data file. Returns
    /// whether anything was written.
    pub fn flush_memtable(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.memtable.is_empty() {
            return Ok(false);
        }
        let memtable = std::mem::take(&mut state.memtable);
        // One version per flushed memtable keeps chunk batches and
        // deletions totally ordered within the partition.
        let flush_version = self.versions.next_version()?;

        let mut metas: Vec<ChunkMeta> = Vec::new();
        let mut flushed = 0usize;
        for (device, measurements) in memtable.series {
            for (measurement, mut points) in measurements {
                points.sort_by_key(|p| p.timestamp);
                flushed += points.len();
                let payload = ChunkPayload {
                    device: device.clone(),
                    measurement,
                    points,
                };
                let offset = state.write_offset;
                let (meta, next) = write_chunk(&mut state.file, offset, &payload)?;
                state.write_offset = next;
                metas.push(meta);
            }
        }
        state.file.sync_data()?;
        drop(state);

        debug!(
            partition = self.partition,
            version = flush_version,
            chunks = metas.len(),
            points = flushed,
            "flushed memtable"
        );
        self.resource.add_chunks(metas);
        self.mem_points.fetch_sub(flushed, Ordering::AcqRel);
        Ok(true)
    }

    /// Final flush, sidecar persistence, and the unsealed -> sealed
    /// transition.
    pub fn seal(&self) -> Result<()> {
        self.flush_memtable()?;
        {
            let state = self.state.lock();
            state.file.sync_all()?;
        }
        self.resource.set_closed(true);
        self.resource.write_resource_file()?;
        self.wal.remove()?;
        self.sealed.store(true, Ordering::Release);
        self.resource.detach_processor();
        Ok(())
    }

    /// Snapshot for an unsealed query: in-memory points of the series plus
    /// the chunk metadata already on disk.
    pub fn query(&self, device: &str, measurement: &str) -> (Vec<DataPoint>, Vec<ChunkMeta>) {
        let state = self.state.lock();
        let mut mem: Vec<DataPoint> = state
            .memtable
            .series
            .get(device)
            .and_then(|m| m.get(measurement))
            .cloned()
            .unwrap_or_default();
        drop(state);
        mem.sort_by_key(|p| p.timestamp);

        let disk = self
            .resource
            .chunks()
            .into_iter()
            .filter(|c| c.device == device && c.measurement == measurement)
            .collect();
        (mem, disk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::NopWal;
    use std::fs;
    use tempfile::TempDir;

    fn new_buffer(dir: &TempDir, sequence: bool) -> Arc<MemBuffer> {
        let pdir = dir.path().join("data").join("0");
        fs::create_dir_all(&pdir).unwrap();
        let resource = FileResource::new(pdir.join("1-1-0.tsd")).unwrap();
        resource.add_historical_versions([1]);
        let versions = Arc::new(VersionController::open(&dir.path().join("sys"), 0).unwrap());
        MemBuffer::create(resource, versions, Arc::new(NopWal), 4, sequence).unwrap()
    }

    #[test]
    fn insert_then_flush_then_seal_round_trips() {
        let dir = TempDir::new().unwrap();
        let buffer = new_buffer(&dir, true);

        buffer
            .insert(&Record::single("d1", "m1", 10, 1.0))
            .unwrap();
        buffer
            .insert(&Record::single("d1", "m1", 20, 2.0))
            .unwrap();
        assert_eq!(buffer.memtable_size(), 2);
        assert!(!buffer.should_flush());

        assert!(buffer.flush_memtable().unwrap());
        assert_eq!(buffer.memtable_size(), 0);

        buffer.resource().force_end_time("d1", 20);
        buffer.seal().unwrap();
        assert!(buffer.resource().is_closed());

        let points = buffer.resource().read_points("d1", "m1").unwrap();
        assert_eq!(points, vec![DataPoint::new(10, 1.0), DataPoint::new(20, 2.0)]);
    }

    #[test]
    fn unsequential_buffer_keeps_end_times_current() {
        let dir = TempDir::new().unwrap();
        let buffer = new_buffer(&dir, false);
        buffer.insert(&Record::single("d1", "m1", 5, 3.0)).unwrap();
        assert_eq!(buffer.resource().end_time("d1"), Some(5));
        buffer.insert(&Record::single("d1", "m1", 3, 4.0)).unwrap();
        assert_eq!(buffer.resource().end_time("d1"), Some(5));
    }

    #[test]
    fn delete_in_memory_drops_matching_points() {
        let dir = TempDir::new().unwrap();
        let buffer = new_buffer(&dir, true);
        buffer.insert(&Record::single("d1", "m1", 10, 1.0)).unwrap();
        buffer.insert(&Record::single("d1", "m1", 20, 2.0)).unwrap();
        buffer.insert(&Record::single("d1", "m2", 15, 9.0)).unwrap();

        buffer.delete_in_memory(&Deletion::new("d1", "m1", 1, 15));

        let (mem, _) = buffer.query("d1", "m1");
        assert_eq!(mem, vec![DataPoint::new(20, 2.0)]);
        let (other, _) = buffer.query("d1", "m2");
        assert_eq!(other.len(), 1);
        assert_eq!(buffer.memtable_size(), 2);
    }

    #[test]
    fn query_returns_memory_and_disk_sides() {
        let dir = TempDir::new().unwrap();
        let buffer = new_buffer(&dir, true);
        buffer.insert(&Record::single("d1", "m1", 10, 1.0)).unwrap();
        buffer.flush_memtable().unwrap();
        buffer.insert(&Record::single("d1", "m1", 30, 3.0)).unwrap();

        let (mem, disk) = buffer.query("d1", "m1");
        assert_eq!(mem, vec![DataPoint::new(30, 3.0)]);
        assert_eq!(disk.len(), 1);
        assert_eq!(disk[0].num_points, 1);
    }

    #[test]
    fn begin_flush_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let buffer = new_buffer(&dir, true);
        assert!(buffer.begin_flush());
        assert!(!buffer.begin_flush());
        buffer.end_flush();
        assert!(buffer.begin_flush());
    }
}
