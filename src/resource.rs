//! File resources: one per data file, plus the filename grammar and the
//! chunk framing shared by the writable buffers, recovery, and merge.
//!
//! Layout: `<dataRoot>/<sgName>/<partitionId>/<systemMillis>-<version>-<mergeCount>.tsd`
//! with a serde_json `.resource` sidecar (time maps, historical versions,
//! chunk index, sealed flag) and an optional `.mods` tombstone log.

use crate::buffer::MemBuffer;
use crate::modfile::{Deletion, ModificationFile};
use crate::query::TimeFilter;
use crate::{DataPoint, Result, TsVaultError, time_partition};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub const DATA_FILE_SUFFIX: &str = ".tsd";
pub const RESOURCE_SUFFIX: &str = ".resource";
pub const MODS_SUFFIX: &str = ".mods";
pub const TEMP_SUFFIX: &str = ".temp";
pub const MERGE_SUFFIX: &str = ".merge";

/// Parsed form of a data file name: `<systemMillis>-<version>-<mergeCount>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsFileName {
    pub time: i64,
    pub version: u64,
    pub merge_cnt: u32,
}

impl TsFileName {
    pub fn new(time: i64, version: u64, merge_cnt: u32) -> Self {
        Self {
            time,
            version,
            merge_cnt,
        }
    }

    /// Parses a file name such as `1596000000000-3-0.tsd`.
    pub fn parse(name: &str) -> Result<Self> {
        let stem = name
            .strip_suffix(DATA_FILE_SUFFIX)
            .ok_or_else(|| TsVaultError::InvalidFileName(name.to_string()))?;
        let parts: Vec<&str> = stem.split('-').collect();
        if parts.len() != 3 {
            return Err(TsVaultError::InvalidFileName(name.to_string()));
        }
        let time = parts[0]
            .parse::<i64>()
            .map_err(|_| TsVaultError::InvalidFileName(name.to_string()))?;
        let version = parts[1]
            .parse::<u64>()
            .map_err(|_| TsVaultError::InvalidFileName(name.to_string()))?;
        let merge_cnt = parts[2]
            .parse::<u32>()
            .map_err(|_| TsVaultError::InvalidFileName(name.to_string()))?;
        Ok(Self {
            time,
            version,
            merge_cnt,
        })
    }

    pub fn format(&self) -> String {
        format!(
            "{}-{}-{}{}",
            self.time, self.version, self.merge_cnt, DATA_FILE_SUFFIX
        )
    }

    /// Ordering key within one partition. Generated names share the version
    /// of a neighbor, so the time component dominates.
    pub fn cmp_key(&self) -> (i64, u64, u32) {
        (self.time, self.version, self.merge_cnt)
    }
}

/// One encoded chunk inside a data file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkPayload {
    pub device: String,
    pub measurement: String,
    pub points: Vec<DataPoint>,
}

/// Location and time span of one chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMeta {
    pub device: String,
    pub measurement: String,
    pub offset: u64,
    pub len: u64,
    pub start_time: i64,
    pub end_time: i64,
    pub num_points: usize,
}

/// Appends one length-framed chunk at `offset`, returning its metadata and
/// the next write offset.
pub(crate) fn write_chunk(
    file: &mut File,
    offset: u64,
    payload: &ChunkPayload,
) -> Result<(ChunkMeta, u64)> {
    let bytes = bincode::serialize(payload)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&(bytes.len() as u64).to_le_bytes())?;
    file.write_all(&bytes)?;

    let start_time = payload
        .points
        .iter()
        .map(|p| p.timestamp)
        .min()
        .unwrap_or(i64::MAX);
    let end_time = payload
        .points
        .iter()
        .map(|p| p.timestamp)
        .max()
        .unwrap_or(i64::MIN);
    let meta = ChunkMeta {
        device: payload.device.clone(),
        measurement: payload.measurement.clone(),
        offset,
        len: bytes.len() as u64,
        start_time,
        end_time,
        num_points: payload.points.len(),
    };
    Ok((meta, offset + 8 + bytes.len() as u64))
}

/// Scans a data file chunk by chunk, stopping at a torn tail. Returns the
/// recovered chunk index and the length of the valid prefix.
pub(crate) fn scan_chunks(path: &Path) -> Result<(Vec<ChunkMeta>, u64)> {
    let bytes = fs::read(path)?;
    let mut metas = Vec::new();
    let mut pos = 0u64;
    loop {
        let at = pos as usize;
        if at + 8 > bytes.len() {
            break;
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[at..at + 8]);
        let len = u64::from_le_bytes(len_bytes) as usize;
        if at + 8 + len > bytes.len() {
            break;
        }
        let payload: ChunkPayload = match bincode::deserialize(&bytes[at + 8..at + 8 + len]) {
            Ok(p) => p,
            Err(_) => break,
        };
        let start_time = payload
            .points
            .iter()
            .map(|p| p.timestamp)
            .min()
            .unwrap_or(i64::MAX);
        let end_time = payload
            .points
            .iter()
            .map(|p| p.timestamp)
            .max()
            .unwrap_or(i64::MIN);
        metas.push(ChunkMeta {
            device: payload.device,
            measurement: payload.measurement,
            offset: pos,
            len: len as u64,
            start_time,
            end_time,
            num_points: payload.points.len(),
        });
        pos += 8 + len as u64;
    }
    Ok((metas, pos))
}

/// Reads one chunk back through its metadata.
pub(crate) fn read_chunk(path: &Path, meta: &ChunkMeta) -> Result<ChunkPayload> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(meta.offset + 8))?;
    let mut buf = vec![0u8; meta.len as usize];
    file.read_exact(&mut buf)?;
    Ok(bincode::deserialize(&buf)?)
}

/// Appends a suffix to a full path, keeping the existing extension.
pub(crate) fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", path.display(), suffix))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ResourceMeta {
    start_times: HashMap<String, i64>,
    end_times: HashMap<String, i64>,
    historical_versions: BTreeSet<u64>,
    chunks: Vec<ChunkMeta>,
    sealed: bool,
}

#[derive(Debug, Default)]
struct DeviceTimes {
    start: HashMap<String, i64>,
    end: HashMap<String, i64>,
}

/// One data file with its in-memory bookkeeping.
pub struct FileResource {
    path: RwLock<PathBuf>,
    partition: RwLock<i64>,
    times: RwLock<DeviceTimes>,
    historical_versions: RwLock<BTreeSet<u64>>,
    chunks: RwLock<Vec<ChunkMeta>>,
    closed: AtomicBool,
    deleted: AtomicBool,
    merging: AtomicBool,
    mod_file: Mutex<Option<ModificationFile>>,
    processor: Mutex<Weak<MemBuffer>>,
    write_query_lock: RwLock<()>,
}

impl FileResource {
    /// A fresh resource for a file about to be written. The partition id is
    /// taken from the parent directory name.
    pub fn new(path: PathBuf) -> Result<Arc<Self>> {
        let partition = parse_partition_dir(&path)?;
        Ok(Arc::new(Self {
            path: RwLock::new(path),
            partition: RwLock::new(partition),
            times: RwLock::new(DeviceTimes::default()),
            historical_versions: RwLock::new(BTreeSet::new()),
            chunks: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            merging: AtomicBool::new(false),
            mod_file: Mutex::new(None),
            processor: Mutex::new(Weak::new()),
            write_query_lock: RwLock::new(()),
        }))
    }

    /// Restores a resource from its `.resource` sidecar during recovery.
    pub fn restore(path: PathBuf) -> Result<Arc<Self>> {
        let partition = parse_partition_dir(&path)?;
        let meta = Self::load_meta(&path)?;
        let resource = Self::from_meta(path, partition, meta);
        Ok(Arc::new(resource))
    }

    /// Binds to an externally produced file staged outside the group
    /// directories. Its partition id is computed from the device times via
    /// [`FileResource::time_partition_with_check`].
    pub fn staged(path: PathBuf) -> Result<Arc<Self>> {
        let meta = Self::load_meta(&path)?;
        let resource = Self::from_meta(path, 0, meta);
        Ok(Arc::new(resource))
    }

    fn load_meta(path: &Path) -> Result<ResourceMeta> {
        let sidecar = path_with_suffix(path, RESOURCE_SUFFIX);
        if !sidecar.exists() {
            return Err(TsVaultError::Recover {
                path: path.to_path_buf(),
                details: "missing .resource sidecar".to_string(),
            });
        }
        let file = File::open(&sidecar)?;
        let meta: ResourceMeta =
            serde_json::from_reader(file).map_err(|e| TsVaultError::Recover {
                path: path.to_path_buf(),
                details: format!("corrupt .resource sidecar: {e}"),
            })?;
        Ok(meta)
    }

    fn from_meta(path: PathBuf, partition: i64, meta: ResourceMeta) -> Self {
        Self {
            path: RwLock::new(path),
            partition: RwLock::new(partition),
            times: RwLock::new(DeviceTimes {
                start: meta.start_times,
                end: meta.end_times,
            }),
            historical_versions: RwLock::new(meta.historical_versions),
            chunks: RwLock::new(meta.chunks),
            closed: AtomicBool::new(meta.sealed),
            deleted: AtomicBool::new(false),
            merging: AtomicBool::new(false),
            mod_file: Mutex::new(None),
            processor: Mutex::new(Weak::new()),
            write_query_lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    pub fn set_path(&self, path: PathBuf) {
        *self.path.write() = path;
    }

    pub fn file_name(&self) -> String {
        self.path
            .read()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn ts_name(&self) -> Result<TsFileName> {
        TsFileName::parse(&self.file_name())
    }

    pub fn partition(&self) -> i64 {
        *self.partition.read()
    }

    pub fn set_partition(&self, partition: i64) {
        *self.partition.write() = partition;
    }

    /// Computes the partition id from the device times and checks that the
    /// whole file falls inside one partition.
    pub fn time_partition_with_check(&self, partition_interval: i64) -> Result<i64> {
        let times = self.times.read();
        let mut partition: Option<i64> = None;
        for ts in times.start.values().chain(times.end.values()) {
            let p = time_partition(*ts, partition_interval);
            match partition {
                None => partition = Some(p),
                Some(existing) if existing != p => {
                    return Err(TsVaultError::LoadFile {
                        path: self.path(),
                        details: "file spans multiple time partitions".to_string(),
                    });
                }
                Some(_) => {}
            }
        }
        let p = partition.ok_or_else(|| TsVaultError::LoadFile {
            path: self.path(),
            details: "file holds no devices".to_string(),
        })?;
        *self.partition.write() = p;
        Ok(p)
    }

    pub fn update_start_time(&self, device: &str, timestamp: i64) {
        let mut times = self.times.write();
        let entry = times.start.entry(device.to_string()).or_insert(i64::MAX);
        if *entry > timestamp {
            *entry = timestamp;
        }
    }

    pub fn update_end_time(&self, device: &str, timestamp: i64) {
        let mut times = self.times.write();
        let entry = times.end.entry(device.to_string()).or_insert(i64::MIN);
        if *entry < timestamp {
            *entry = timestamp;
        }
    }

    /// Overwrites the end time; used when a sequential buffer is frozen at
    /// close time.
    pub fn force_end_time(&self, device: &str, timestamp: i64) {
        self.times
            .write()
            .end
            .insert(device.to_string(), timestamp);
    }

    /// Overwrites the start time; used when a merge rewrite recomputes the
    /// exact device span.
    pub fn force_start_time(&self, device: &str, timestamp: i64) {
        self.times
            .write()
            .start
            .insert(device.to_string(), timestamp);
    }

    pub fn start_time(&self, device: &str) -> Option<i64> {
        self.times.read().start.get(device).copied()
    }

    pub fn end_time(&self, device: &str) -> Option<i64> {
        self.times.read().end.get(device).copied()
    }

    pub fn start_times(&self) -> HashMap<String, i64> {
        self.times.read().start.clone()
    }

    pub fn end_times(&self) -> HashMap<String, i64> {
        self.times.read().end.clone()
    }

    pub fn devices(&self) -> Vec<String> {
        self.times.read().start.keys().cloned().collect()
    }

    pub fn contains_device(&self, device: &str) -> bool {
        self.times.read().start.contains_key(device)
    }

    pub fn has_no_end_times(&self) -> bool {
        self.times.read().end.is_empty()
    }

    /// True while any device's data is newer than the TTL cutoff.
    pub fn still_lives(&self, time_lower_bound: i64) -> bool {
        self.times
            .read()
            .end
            .values()
            .any(|end| *end >= time_lower_bound)
    }

    /// Query admission check: device presence, TTL on the device end time,
    /// then the caller's time filter.
    pub fn is_satisfied(
        &self,
        device: &str,
        time_filter: Option<&dyn TimeFilter>,
        data_ttl: i64,
        now: i64,
    ) -> bool {
        let times = self.times.read();
        if !times.start.contains_key(device) {
            return false;
        }
        if data_ttl != i64::MAX
            && let Some(end) = times.end.get(device)
            && *end < now - data_ttl
        {
            return false;
        }
        if let Some(filter) = time_filter {
            let start = times.start.get(device).copied().unwrap_or(i64::MIN);
            let end = times.end.get(device).copied().unwrap_or(i64::MAX);
            return filter.satisfy_start_end_time(start, end);
        }
        true
    }

    pub fn historical_versions(&self) -> BTreeSet<u64> {
        self.historical_versions.read().clone()
    }

    pub fn set_historical_versions(&self, versions: BTreeSet<u64>) {
        *self.historical_versions.write() = versions;
    }

    pub fn add_historical_versions(&self, versions: impl IntoIterator<Item = u64>) {
        self.historical_versions.write().extend(versions);
    }

    pub fn max_historical_version(&self) -> Option<u64> {
        self.historical_versions.read().iter().next_back().copied()
    }

    pub fn chunks(&self) -> Vec<ChunkMeta> {
        self.chunks.read().clone()
    }

    pub fn set_chunks(&self, chunks: Vec<ChunkMeta>) {
        *self.chunks.write() = chunks;
    }

    pub fn add_chunks(&self, chunks: impl IntoIterator<Item = ChunkMeta>) {
        self.chunks.write().extend(chunks);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::SeqCst);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn set_deleted(&self, deleted: bool) {
        self.deleted.store(deleted, Ordering::SeqCst);
    }

    pub fn is_merging(&self) -> bool {
        self.merging.load(Ordering::SeqCst)
    }

    pub fn set_merging(&self, merging: bool) {
        self.merging.store(merging, Ordering::SeqCst);
    }

    pub fn attach_processor(&self, buffer: &Arc<MemBuffer>) {
        *self.processor.lock() = Arc::downgrade(buffer);
    }

    pub fn detach_processor(&self) {
        *self.processor.lock() = Weak::new();
    }

    /// The writable buffer attached to this unsealed file, if any.
    pub fn unsealed_processor(&self) -> Option<Arc<MemBuffer>> {
        self.processor.lock().upgrade()
    }

    /// Protects physical removal or move against ongoing reads.
    pub fn write_query_lock(&self) -> &RwLock<()> {
        &self.write_query_lock
    }

    pub fn mods_path(&self) -> PathBuf {
        path_with_suffix(&self.path(), MODS_SUFFIX)
    }

    pub fn resource_path(&self) -> PathBuf {
        path_with_suffix(&self.path(), RESOURCE_SUFFIX)
    }

    /// Appends one deletion to the sidecar modification file.
    pub fn write_deletion(&self, deletion: &Deletion) -> Result<()> {
        let mut guard = self.mod_file.lock();
        let mods = guard.get_or_insert_with(|| ModificationFile::new(self.mods_path()));
        mods.write(deletion)
    }

    pub fn close_mod_file(&self) -> Result<()> {
        if let Some(mods) = self.mod_file.lock().as_mut() {
            mods.close()?;
        }
        Ok(())
    }

    pub fn abort_mod_file(&self) -> Result<()> {
        let mut guard = self.mod_file.lock();
        let mods = guard.get_or_insert_with(|| ModificationFile::new(self.mods_path()));
        mods.abort()
    }

    pub fn remove_mod_file(&self) -> Result<()> {
        let mut guard = self.mod_file.lock();
        let mut mods = guard
            .take()
            .unwrap_or_else(|| ModificationFile::new(self.mods_path()));
        mods.remove()
    }

    /// Every tombstone currently recorded against this file.
    pub fn modifications(&self) -> Result<Vec<Deletion>> {
        ModificationFile::read_all(&self.mods_path())
    }

    /// Persists the `.resource` sidecar atomically.
    pub fn write_resource_file(&self) -> Result<()> {
        let times = self.times.read();
        let meta = ResourceMeta {
            start_times: times.start.clone(),
            end_times: times.end.clone(),
            historical_versions: self.historical_versions.read().clone(),
            chunks: self.chunks.read().clone(),
            sealed: self.is_closed(),
        };
        drop(times);

        let target = self.resource_path();
        let temp = path_with_suffix(&target, TEMP_SUFFIX);
        let json = serde_json::to_vec_pretty(&meta)?;
        fs::write(&temp, json)?;
        fs::rename(&temp, &target)?;
        Ok(())
    }

    /// Reads all points of one series from the sealed file, applying the
    /// sidecar tombstones.
    pub fn read_points(&self, device: &str, measurement: &str) -> Result<Vec<DataPoint>> {
        let _read_guard = self.write_query_lock.read();
        let path = self.path();
        let deletions: Vec<Deletion> = self
            .modifications()?
            .into_iter()
            .filter(|d| d.matches(device, measurement))
            .collect();

        let mut points = Vec::new();
        for meta in self.chunks.read().iter() {
            if meta.device != device || meta.measurement != measurement {
                continue;
            }
            let payload = read_chunk(&path, meta)?;
            points.extend(payload.points);
        }
        points.retain(|p| !deletions.iter().any(|d| p.timestamp <= d.end_time()));
        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }

    /// Physically removes the data file and both sidecars.
    pub fn remove(&self) -> Result<()> {
        let _ = self.mod_file.lock().take();
        let path = self.path();
        for candidate in [
            path.clone(),
            path_with_suffix(&path, RESOURCE_SUFFIX),
            path_with_suffix(&path, MODS_SUFFIX),
        ] {
            if candidate.exists() {
                fs::remove_file(&candidate)?;
            }
        }
        Ok(())
    }

    /// Moves the data file and its `.resource` sidecar into `target_dir`.
    pub fn move_to(&self, target_dir: &Path) -> Result<()> {
        fs::create_dir_all(target_dir)?;
        let source = self.path();
        let name = self.file_name();
        let target = target_dir.join(&name);
        fs::rename(&source, &target).map_err(|e| TsVaultError::LoadFile {
            path: source.clone(),
            details: format!("cannot move data file to {:?}: {e}", target),
        })?;

        let source_res = path_with_suffix(&source, RESOURCE_SUFFIX);
        let target_res = path_with_suffix(&target, RESOURCE_SUFFIX);
        if source_res.exists() {
            fs::rename(&source_res, &target_res).map_err(|e| TsVaultError::LoadFile {
                path: source_res.clone(),
                details: format!("cannot move .resource sidecar to {:?}: {e}", target_res),
            })?;
        }
        self.set_path(target);
        Ok(())
    }
}

fn parse_partition_dir(path: &Path) -> Result<i64> {
    let parent = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    parent
        .parse::<i64>()
        .map_err(|_| TsVaultError::InvalidFileName(format!("partition directory {parent:?}")))
}
