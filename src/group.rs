//! The storage-group coordinator.
//!
//! One `StorageGroup` owns the writable buffers, the sequential and
//! unsequential file indexes, the latest-time tables, the merge lifecycle,
//! TTL enforcement, and external-file loading for one storage group.
//!
//! A buffer is scheduled for close either when an insert finds its
//! partition map at capacity or when `sync_close_all` is called; the flush
//! workers then invoke the close callbacks back on the coordinator.

use crate::buffer::MemBuffer;
use crate::concurrency::WorkerPool;
use crate::config::{GroupConfig, SystemFlags};
use crate::dirs::{DirectoryRotator, RoundRobinRotator};
use crate::merge::{
    MERGING_MODS_NAME, MergeLog, MergeResource, MergeSelection, run_merge_task, selector_for,
};
use crate::metadata::{InMemoryMetadata, MetadataService};
use crate::modfile::{Deletion, ModificationFile};
use crate::query::{
    FilePathsManager, QueryDataSource, ResourceView, SeriesPath, TimeFilter, UnsealedView,
};
use crate::resource::{
    DATA_FILE_SUFFIX, FileResource, MERGE_SUFFIX, RESOURCE_SUFFIX, TEMP_SUFFIX, TsFileName,
    path_with_suffix, scan_chunks,
};
use crate::tracker::LatestTimeTracker;
use crate::version::VersionController;
use crate::wal::{LogNode, NopWal, Wal};
use crate::{
    Record, Result, RowStatus, Tablet, TsVaultError, now_millis, time_partition,
};
use crossbeam_channel::{Sender, bounded};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const GROUP_OPEN: u8 = 0;
const GROUP_CLOSING: u8 = 1;
const GROUP_CLOSED: u8 = 2;

/// Decides when a buffer that reports `should_flush` is actually flushed.
pub trait FlushPolicy: Send + Sync {
    fn apply(&self, group: &StorageGroup, buffer: &Arc<MemBuffer>, sequence: bool);
}

/// Default policy: flush immediately on the background workers.
pub struct DirectFlushPolicy;

impl FlushPolicy for DirectFlushPolicy {
    fn apply(&self, group: &StorageGroup, buffer: &Arc<MemBuffer>, sequence: bool) {
        if let Err(e) = group.submit_flush(buffer, sequence) {
            error!(group = group.name(), error = %e, "failed to submit a flush");
        }
    }
}

struct FlushJob {
    buffer: Arc<MemBuffer>,
    seal: bool,
}

struct MergeJob {
    selection: MergeSelection,
    full: bool,
}

/// Where `find_insertion_position` decided a loaded file belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertPosition {
    AlreadyExists,
    Overlap,
    /// Insert between `[index, index + 1]`; `-1` means before the head.
    Index(i64),
}

#[derive(Debug, Clone, Copy)]
enum LoadKind {
    Sequence,
    Unsequence,
}

/// Everything guarded by the coordinator's insert lock.
struct GroupState {
    work_seq: BTreeMap<i64, Arc<MemBuffer>>,
    work_unseq: BTreeMap<i64, Arc<MemBuffer>>,
    seq_files: Vec<Arc<FileResource>>,
    unseq_files: Vec<Arc<FileResource>>,
    tracker: LatestTimeTracker,
    versions: HashMap<i64, Arc<VersionController>>,
    direct_versions: HashMap<i64, std::collections::BTreeSet<u64>>,
    max_versions: HashMap<i64, u64>,
}

impl GroupState {
    fn new() -> Self {
        Self {
            work_seq: BTreeMap::new(),
            work_unseq: BTreeMap::new(),
            seq_files: Vec::new(),
            unseq_files: Vec::new(),
            tracker: LatestTimeTracker::new(),
            versions: HashMap::new(),
            direct_versions: HashMap::new(),
            max_versions: HashMap::new(),
        }
    }
}

/// The per-storage-group write, query, and file-lifecycle coordinator.
pub struct StorageGroup {
    name: String,
    sys_dir: PathBuf,
    config: GroupConfig,
    data_ttl: AtomicI64,
    flags: Arc<SystemFlags>,
    rotator: Arc<dyn DirectoryRotator>,
    metadata: Arc<dyn MetadataService>,
    flush_policy: Arc<dyn FlushPolicy>,

    state: RwLock<GroupState>,
    merge_lock: RwLock<()>,
    close_query_lock: RwLock<()>,

    closing_seq: Mutex<Vec<Arc<MemBuffer>>>,
    closing_unseq: Mutex<Vec<Arc<MemBuffer>>>,
    close_mutex: Mutex<()>,
    close_condition: Condvar,

    merging_mods: Mutex<Option<ModificationFile>>,
    is_merging: AtomicBool,
    merge_started_at: Mutex<Option<Instant>>,

    ttl_monitor: Mutex<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    sweeper_stop: Mutex<Option<Sender<()>>>,

    flush_pool: Mutex<Option<WorkerPool<FlushJob>>>,
    merge_pool: Mutex<Option<WorkerPool<MergeJob>>>,
    lifecycle: AtomicU8,
}

/// Builder for opening a storage group.
pub struct GroupBuilder {
    name: String,
    sys_root: Option<PathBuf>,
    seq_roots: Vec<PathBuf>,
    unseq_roots: Vec<PathBuf>,
    config: GroupConfig,
    rotator: Option<Arc<dyn DirectoryRotator>>,
    metadata: Option<Arc<dyn MetadataService>>,
    flush_policy: Option<Arc<dyn FlushPolicy>>,
    flags: Option<Arc<SystemFlags>>,
}

impl GroupBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sys_root: None,
            seq_roots: Vec::new(),
            unseq_roots: Vec::new(),
            config: GroupConfig::default(),
            rotator: None,
            metadata: None,
            flush_policy: None,
            flags: None,
        }
    }

    /// Standard layout under one base directory: `<base>/system` plus
    /// `<base>/data/{sequence,unsequence}`.
    pub fn with_data_root(mut self, base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        self.sys_root = Some(base.join("system"));
        self.seq_roots = vec![base.join("data").join("sequence")];
        self.unseq_roots = vec![base.join("data").join("unsequence")];
        self
    }

    pub fn with_system_root(mut self, path: impl AsRef<Path>) -> Self {
        self.sys_root = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_sequence_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.seq_roots = roots;
        self
    }

    pub fn with_unsequence_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.unseq_roots = roots;
        self
    }

    pub fn with_config(mut self, config: GroupConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_rotator(mut self, rotator: Arc<dyn DirectoryRotator>) -> Self {
        self.rotator = Some(rotator);
        self
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataService>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_flush_policy(mut self, policy: Arc<dyn FlushPolicy>) -> Self {
        self.flush_policy = Some(policy);
        self
    }

    pub fn with_flags(mut self, flags: Arc<SystemFlags>) -> Self {
        self.flags = Some(flags);
        self
    }

    /// Opens the group: recovers on-disk state and starts background work.
    pub fn build(self) -> Result<Arc<StorageGroup>> {
        self.config.validate()?;
        let sys_root = self.sys_root.ok_or_else(|| {
            TsVaultError::InvalidConfiguration("a system root is required".to_string())
        })?;
        let rotator: Arc<dyn DirectoryRotator> = match self.rotator {
            Some(r) => r,
            None => Arc::new(RoundRobinRotator::new(self.seq_roots, self.unseq_roots)?),
        };
        let metadata: Arc<dyn MetadataService> = self
            .metadata
            .unwrap_or_else(|| Arc::new(InMemoryMetadata::new(self.name.clone())));
        let flush_policy: Arc<dyn FlushPolicy> =
            self.flush_policy.unwrap_or_else(|| Arc::new(DirectFlushPolicy));
        let flags = self.flags.unwrap_or_else(SystemFlags::new);

        let sys_dir = sys_root.join(&self.name);
        if !sys_dir.exists() {
            info!(dir = %sys_dir.display(), "storage group system directory doesn't exist, creating it");
        }
        fs::create_dir_all(&sys_dir)?;

        let name = self.name;
        let config = self.config;
        let data_ttl = config.data_ttl;
        let flush_workers = config.flush_workers;

        let group = Arc::new_cyclic(|weak: &Weak<StorageGroup>| {
            let flush_weak = weak.clone();
            let merge_weak = weak.clone();
            StorageGroup {
                name: name.clone(),
                sys_dir,
                config,
                data_ttl: AtomicI64::new(data_ttl),
                flags,
                rotator,
                metadata,
                flush_policy,
                state: RwLock::new(GroupState::new()),
                merge_lock: RwLock::new(()),
                close_query_lock: RwLock::new(()),
                closing_seq: Mutex::new(Vec::new()),
                closing_unseq: Mutex::new(Vec::new()),
                close_mutex: Mutex::new(()),
                close_condition: Condvar::new(),
                merging_mods: Mutex::new(None),
                is_merging: AtomicBool::new(false),
                merge_started_at: Mutex::new(None),
                ttl_monitor: Mutex::new(()),
                sweeper: Mutex::new(None),
                sweeper_stop: Mutex::new(None),
                flush_pool: Mutex::new(Some(WorkerPool::new(
                    "tsvault-flush",
                    flush_workers,
                    move |job: FlushJob| {
                        if let Some(group) = flush_weak.upgrade() {
                            group.run_flush_job(job);
                        }
                    },
                ))),
                merge_pool: Mutex::new(Some(WorkerPool::new(
                    "tsvault-merge",
                    1,
                    move |job: MergeJob| {
                        if let Some(group) = merge_weak.upgrade() {
                            run_merge_task(&group, job.selection, job.full);
                        }
                    },
                ))),
                lifecycle: AtomicU8::new(GROUP_OPEN),
            }
        });

        group.recover()?;
        group.start_ttl_sweeper();
        Ok(group)
    }
}

impl StorageGroup {
    pub fn builder(name: impl Into<String>) -> GroupBuilder {
        GroupBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn system_dir(&self) -> &PathBuf {
        &self.sys_dir
    }

    pub fn flags(&self) -> &Arc<SystemFlags> {
        &self.flags
    }

    pub fn data_ttl(&self) -> i64 {
        self.data_ttl.load(Ordering::Acquire)
    }

    /// Adjusts the TTL at runtime and sweeps immediately.
    pub fn set_data_ttl(&self, ttl: i64) {
        self.data_ttl.store(ttl, Ordering::Release);
        self.check_files_ttl();
    }

    pub fn is_merging(&self) -> bool {
        self.is_merging.load(Ordering::SeqCst)
    }

    /// Snapshot of the sequential file index.
    pub fn sequence_files(&self) -> Vec<Arc<FileResource>> {
        self.state.read().seq_files.clone()
    }

    /// Snapshot of the unsequential file list.
    pub fn unsequence_files(&self) -> Vec<Arc<FileResource>> {
        self.state.read().unseq_files.clone()
    }

    /// The flushed watermark for `(partition, device)`; `i64::MIN` when the
    /// device has never been flushed in that partition.
    pub fn latest_flushed_time(&self, partition: i64, device: &str) -> i64 {
        self.state.read().tracker.latest_flushed(partition, device)
    }

    /// Partitions currently holding a writable buffer, per kind.
    pub fn working_partitions(&self) -> (Vec<i64>, Vec<i64>) {
        let state = self.state.read();
        (
            state.work_seq.keys().copied().collect(),
            state.work_unseq.keys().copied().collect(),
        )
    }

    fn ensure_operational(&self) -> Result<()> {
        match self.lifecycle.load(Ordering::SeqCst) {
            GROUP_OPEN => Ok(()),
            GROUP_CLOSING => Err(TsVaultError::ShuttingDown),
            _ => Err(TsVaultError::ShuttingDown),
        }
    }

    fn check_ttl(&self, timestamp: i64) -> bool {
        let ttl = self.data_ttl();
        ttl == i64::MAX || now_millis() - timestamp <= ttl
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Inserts one row.
    pub fn insert(&self, record: &Record) -> Result<()> {
        self.ensure_operational()?;
        if self.flags.is_read_only() {
            return Err(TsVaultError::ReadOnly);
        }
        if !self.check_ttl(record.timestamp()) {
            return Err(TsVaultError::OutOfTtl {
                timestamp: record.timestamp(),
                bound: now_millis() - self.data_ttl(),
            });
        }

        let device = record.device().to_string();
        let timestamp = record.timestamp();
        let global_flushed;
        let mut to_flush: Option<(Arc<MemBuffer>, bool)> = None;
        {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let partition = time_partition(timestamp, self.config.partition_interval);
            state.tracker.ensure_partition(partition);

            let sequence = timestamp > state.tracker.latest_flushed(partition, &device);
            let buffer = self.get_or_create_buffer_locked(state, partition, sequence)?;
            buffer.insert(record)?;
            state.tracker.observe(partition, &device, timestamp);
            global_flushed = state.tracker.global_flushed(&device);

            if buffer.should_flush() {
                to_flush = Some((buffer, sequence));
            }
        }

        for (measurement, value) in record.measurements().iter().zip(record.values()) {
            self.metadata.update_last_cache(
                &device,
                measurement,
                crate::DataPoint::new(timestamp, *value),
                true,
                global_flushed,
            )?;
        }

        if let Some((buffer, sequence)) = to_flush {
            self.flush_policy.apply(self, &buffer, sequence);
        }
        Ok(())
    }

    /// Inserts a sorted tablet, returning one status per row.
    pub fn insert_tablet(&self, tablet: &Tablet) -> Result<Vec<RowStatus>> {
        self.ensure_operational()?;
        if self.flags.is_read_only() {
            return Err(TsVaultError::ReadOnly);
        }
        let rows = tablet.row_count();
        if tablet.columns().len() != tablet.measurements().len()
            || tablet.columns().iter().any(|c| c.len() != rows)
        {
            return Err(TsVaultError::WriteProcess(
                "tablet columns do not match measurements and row count".to_string(),
            ));
        }
        let mut results = vec![RowStatus::Success; rows];
        if rows == 0 {
            return Ok(results);
        }

        let device = tablet.device().to_string();
        let times = tablet.timestamps();
        let interval = self.config.partition_interval;
        let global_flushed;
        let mut to_flush: Vec<(Arc<MemBuffer>, bool)> = Vec::new();
        {
            let mut guard = self.state.write();
            let state = &mut *guard;

            // The tablet is sorted, so TTL violations form a prefix.
            let mut loc = 0usize;
            while loc < rows && !self.check_ttl(times[loc]) {
                results[loc] = RowStatus::OutOfTtl;
                loc += 1;
            }
            if loc == rows {
                return Ok(results);
            }

            let mut before = loc;
            let mut before_partition = time_partition(times[loc], interval);
            state.tracker.ensure_partition(before_partition);
            let mut last_flush = state.tracker.latest_flushed(before_partition, &device);
            let mut is_sequence = false;

            while loc < rows {
                let time = times[loc];
                let cur_partition = time_partition(time, interval);
                if cur_partition != before_partition {
                    self.insert_tablet_section(
                        state,
                        tablet,
                        before,
                        loc,
                        is_sequence,
                        before_partition,
                        &mut results,
                        &mut to_flush,
                    );
                    before = loc;
                    before_partition = cur_partition;
                    state.tracker.ensure_partition(cur_partition);
                    last_flush = state.tracker.latest_flushed(cur_partition, &device);
                    is_sequence = false;
                } else {
                    if !is_sequence && time > last_flush {
                        // The run so far is out-of-order data; flush it into
                        // the unsequential buffer and start a sequential run.
                        self.insert_tablet_section(
                            state,
                            tablet,
                            before,
                            loc,
                            false,
                            before_partition,
                            &mut results,
                            &mut to_flush,
                        );
                        before = loc;
                        is_sequence = true;
                    }
                    loc += 1;
                }
            }

            if before < loc {
                self.insert_tablet_section(
                    state,
                    tablet,
                    before,
                    loc,
                    is_sequence,
                    before_partition,
                    &mut results,
                    &mut to_flush,
                );
            }
            global_flushed = state.tracker.global_flushed(&device);
        }

        let last = rows - 1;
        for (m, measurement) in tablet.measurements().iter().enumerate() {
            self.metadata.update_last_cache(
                &device,
                measurement,
                crate::DataPoint::new(times[last], tablet.value_at(m, last)),
                true,
                global_flushed,
            )?;
        }

        for (buffer, sequence) in to_flush {
            self.flush_policy.apply(self, &buffer, sequence);
        }
        Ok(results)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_tablet_section(
        &self,
        state: &mut GroupState,
        tablet: &Tablet,
        start: usize,
        end: usize,
        sequence: bool,
        partition: i64,
        results: &mut [RowStatus],
        to_flush: &mut Vec<(Arc<MemBuffer>, bool)>,
    ) {
        if start >= end {
            return;
        }
        let buffer = match self.get_or_create_buffer_locked(state, partition, sequence) {
            Ok(buffer) => buffer,
            Err(e) => {
                error!(group = %self.name, partition, error = %e, "cannot create a writable buffer");
                for status in &mut results[start..end] {
                    *status = RowStatus::InternalError;
                }
                return;
            }
        };
        if let Err(e) = buffer.insert_tablet(tablet, start, end) {
            error!(group = %self.name, error = %e, "tablet write into buffer failed");
            for status in &mut results[start..end] {
                *status = RowStatus::InternalError;
            }
            return;
        }

        if sequence {
            state
                .tracker
                .observe(partition, tablet.device(), tablet.timestamps()[end - 1]);
        }
        if buffer.should_flush() && !to_flush.iter().any(|(b, _)| Arc::ptr_eq(b, &buffer)) {
            to_flush.push((buffer, sequence));
        }
    }

    // ------------------------------------------------------------------
    // Buffer acquisition and closing
    // ------------------------------------------------------------------

    fn get_or_create_buffer_locked(
        &self,
        state: &mut GroupState,
        partition: i64,
        sequence: bool,
    ) -> Result<Arc<MemBuffer>> {
        let existing = if sequence {
            state.work_seq.get(&partition)
        } else {
            state.work_unseq.get(&partition)
        };
        if let Some(buffer) = existing {
            return Ok(buffer.clone());
        }

        let cap = self.config.concurrent_writing_partitions;
        let map_len = if sequence {
            state.work_seq.len()
        } else {
            state.work_unseq.len()
        };
        if map_len >= cap {
            let oldest = if sequence {
                state.work_seq.values().next().cloned()
            } else {
                state.work_unseq.values().next().cloned()
            };
            if let Some(victim) = oldest {
                info!(
                    group = %self.name,
                    open = map_len,
                    cap,
                    "too many writable partitions, closing the oldest buffer"
                );
                self.async_close_buffer_locked(state, victim);
            }
        }

        let buffer = self.create_buffer_locked(state, partition, sequence)?;
        if sequence {
            state.work_seq.insert(partition, buffer.clone());
            insert_seq_sorted(&mut state.seq_files, buffer.resource().clone());
        } else {
            state.work_unseq.insert(partition, buffer.clone());
            state.unseq_files.push(buffer.resource().clone());
        }
        Ok(buffer)
    }

    fn create_buffer_locked(
        &self,
        state: &mut GroupState,
        partition: i64,
        sequence: bool,
    ) -> Result<Arc<MemBuffer>> {
        let base = if sequence {
            self.rotator.next_sequential_root()
        } else {
            self.rotator.next_unsequential_root()
        };
        let base = match base {
            Ok(base) => base,
            Err(e @ TsVaultError::DiskSpaceInsufficient { .. }) => {
                error!(
                    group = %self.name,
                    error = %e,
                    "disk space insufficient while creating a buffer, switching to read-only"
                );
                self.flags.set_read_only(true);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let versions = version_controller(&self.sys_dir, &mut state.versions, partition)?;
        let version = versions.next_version()?;
        state
            .direct_versions
            .entry(partition)
            .or_default()
            .insert(version);
        let max = state.max_versions.entry(partition).or_insert(0);
        if *max < version {
            *max = version;
        }

        let dir = base.join(&self.name).join(partition.to_string());
        fs::create_dir_all(&dir)?;
        let file_name = TsFileName::new(now_millis(), version, 0).format();
        let resource = FileResource::new(dir.join(&file_name))?;
        resource.add_historical_versions([version]);

        let wal: Arc<dyn Wal> = if self.config.enable_wal {
            Arc::new(LogNode::new(
                self.sys_dir.join("wal").join(format!("{file_name}.log")),
            ))
        } else {
            Arc::new(NopWal)
        };
        debug!(group = %self.name, partition, file = %file_name, sequence, "created a writable buffer");
        MemBuffer::create(
            resource,
            versions,
            wal,
            self.config.flush_threshold_points,
            sequence,
        )
    }

    /// Schedules one buffer for asynchronous close. Caller holds the
    /// insert write lock.
    fn async_close_buffer_locked(&self, state: &mut GroupState, buffer: Arc<MemBuffer>) {
        let partition = buffer.partition();
        buffer.set_closing();

        if buffer.is_sequence() {
            // Freeze per-device end times from the in-RAM latest table; the
            // unsequential side keeps its end times current on insert.
            for device in buffer.resource().devices() {
                if let Some(ts) = state.tracker.latest_time(partition, &device) {
                    buffer.resource().force_end_time(&device, ts);
                }
            }
            state.tracker.promote_flushed(partition);
            self.closing_seq.lock().push(buffer.clone());
            state.work_seq.remove(&partition);
            if !state.work_unseq.contains_key(&partition) {
                state.versions.remove(&partition);
            }
            info!(group = %self.name, partition, "closing a sequential buffer");
        } else {
            self.closing_unseq.lock().push(buffer.clone());
            state.work_unseq.remove(&partition);
            if !state.work_seq.contains_key(&partition) {
                state.versions.remove(&partition);
            }
            info!(group = %self.name, partition, "closing an unsequential buffer");
        }

        if let Err(e) = self.submit_job(FlushJob {
            buffer,
            seal: true,
        }) {
            error!(group = %self.name, error = %e, "failed to submit a close job");
        }
    }

    /// Asynchronously closes every writable buffer.
    pub fn async_close_all(&self) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        info!(group = %self.name, "async close of all working buffers");
        let buffers: Vec<Arc<MemBuffer>> = state
            .work_seq
            .values()
            .chain(state.work_unseq.values())
            .cloned()
            .collect();
        for buffer in buffers {
            self.async_close_buffer_locked(state, buffer);
        }
    }

    /// Closes every writable buffer and blocks until both closing sets
    /// drain, logging progress every 60 seconds.
    pub fn sync_close_all(&self) {
        let mut guard = self.close_mutex.lock();
        self.async_close_all();
        let start = Instant::now();
        let mut last_warn = Instant::now();
        loop {
            if self.closing_seq.lock().is_empty() && self.closing_unseq.lock().is_empty() {
                break;
            }
            self.close_condition
                .wait_for(&mut guard, Duration::from_millis(100));
            if last_warn.elapsed() >= Duration::from_secs(60) {
                warn!(
                    group = %self.name,
                    waited_secs = start.elapsed().as_secs(),
                    "still waiting for buffers to close"
                );
                last_warn = Instant::now();
            }
        }
    }

    /// Stops background work and closes every buffer. The group rejects
    /// ingestion afterwards.
    pub fn close(&self) -> Result<()> {
        if self
            .lifecycle
            .compare_exchange(GROUP_OPEN, GROUP_CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TsVaultError::ShuttingDown);
        }
        self.stop_ttl_sweeper();
        self.sync_close_all();
        if let Some(pool) = self.flush_pool.lock().take() {
            if let Err(e) = pool.shutdown() {
                error!(group = %self.name, error = %e, "flush pool shutdown failed");
            }
        }
        if let Some(pool) = self.merge_pool.lock().take() {
            if let Err(e) = pool.shutdown() {
                error!(group = %self.name, error = %e, "merge pool shutdown failed");
            }
        }
        self.lifecycle.store(GROUP_CLOSED, Ordering::SeqCst);
        info!(group = %self.name, "storage group closed");
        Ok(())
    }

    fn submit_job(&self, job: FlushJob) -> Result<()> {
        match self.flush_pool.lock().as_ref() {
            Some(pool) => pool.submit(job),
            None => Err(TsVaultError::ShuttingDown),
        }
    }

    /// Entry point of the flush policy: commits the buffer's watermarks and
    /// hands the memtable to the flush workers.
    pub fn submit_flush(&self, buffer: &Arc<MemBuffer>, sequence: bool) -> Result<()> {
        if buffer.is_closing() || !buffer.begin_flush() {
            return Ok(());
        }
        if sequence {
            if !self.update_latest_flush_time_callback(buffer) {
                warn!(
                    group = %self.name,
                    partition = buffer.partition(),
                    "partition has no latest-time entries, nothing was written"
                );
            }
        } else {
            self.unsequence_flush_callback(buffer);
        }
        self.submit_job(FlushJob {
            buffer: buffer.clone(),
            seal: false,
        })
        .inspect_err(|_| buffer.end_flush())
    }

    fn run_flush_job(&self, job: FlushJob) {
        if job.seal {
            {
                let _close_query = self.close_query_lock.write();
                if let Err(e) = job.buffer.seal() {
                    error!(
                        group = %self.name,
                        path = %job.buffer.resource().path().display(),
                        error = %e,
                        "failed to close a buffer"
                    );
                }
            }
            self.closing_seq
                .lock()
                .retain(|b| !Arc::ptr_eq(b, &job.buffer));
            self.closing_unseq
                .lock()
                .retain(|b| !Arc::ptr_eq(b, &job.buffer));
            debug!(
                group = %self.name,
                partition = job.buffer.partition(),
                "signal closing storage group condition"
            );
            // Deliberately not taking close_mutex here: the waiter may be
            // blocked submitting close jobs while holding it, and it
            // re-checks on a timeout anyway.
            self.close_condition.notify_all();
        } else {
            if let Err(e) = job.buffer.flush_memtable() {
                error!(group = %self.name, error = %e, "memtable flush failed");
            }
            job.buffer.end_flush();
        }
    }

    /// Copies the partition's in-RAM latest times into the flushed tables.
    /// Returns false iff the partition held no devices.
    pub fn update_latest_flush_time_callback(&self, buffer: &Arc<MemBuffer>) -> bool {
        self.state.write().tracker.promote_flushed(buffer.partition())
    }

    /// Unsequential flushes leave the watermarks untouched.
    pub fn unsequence_flush_callback(&self, _buffer: &Arc<MemBuffer>) -> bool {
        true
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    fn recover(self: &Arc<Self>) -> Result<()> {
        info!(group = %self.name, "recovering storage group");
        let seq_paths = self.collect_data_files(self.rotator.sequential_roots())?;
        let unseq_paths = self.collect_data_files(self.rotator.unsequential_roots())?;
        self.recover_files(&seq_paths, true)?;
        self.recover_files(&unseq_paths, false)?;

        {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let all: Vec<Arc<FileResource>> = state
                .seq_files
                .iter()
                .chain(state.unseq_files.iter())
                .cloned()
                .collect();
            for resource in &all {
                let partition = resource.partition();
                let versions = resource.historical_versions();
                state
                    .direct_versions
                    .entry(partition)
                    .or_default()
                    .extend(versions.iter().copied());
                if let Some(max) = versions.iter().next_back() {
                    let entry = state.max_versions.entry(partition).or_insert(0);
                    if *entry < *max {
                        *entry = *max;
                    }
                }
            }
        }

        self.recover_merge_state();

        {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let seq: Vec<Arc<FileResource>> = state.seq_files.clone();
            for resource in seq {
                let partition = resource.partition();
                for (device, end) in resource.end_times() {
                    state.tracker.seed_flushed(partition, &device, end);
                }
            }
        }
        Ok(())
    }

    fn collect_data_files(&self, roots: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for root in roots {
            let group_dir = root.join(&self.name);
            if !group_dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&group_dir)? {
                let partition_dir = entry?.path();
                if !partition_dir.is_dir() {
                    warn!(path = %partition_dir.display(), "not a directory, skipping");
                    continue;
                }
                // Replay renames interrupted by a crash before scanning.
                continue_failed_renames(&partition_dir, TEMP_SUFFIX)?;
                continue_failed_renames(&partition_dir, MERGE_SUFFIX)?;

                let dir_name = partition_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if dir_name.parse::<i64>().is_err() {
                    warn!(
                        group = %self.name,
                        dir = %dir_name,
                        "skipping non-numeric partition directory"
                    );
                    continue;
                }

                for file in fs::read_dir(&partition_dir)? {
                    let path = file?.path();
                    if path
                        .file_name()
                        .map(|n| n.to_string_lossy().ends_with(DATA_FILE_SUFFIX))
                        .unwrap_or(false)
                    {
                        files.push(path);
                    }
                }
            }
        }
        files.sort_by_key(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            TsFileName::parse(&name)
                .map(|n| n.cmp_key())
                .unwrap_or((i64::MAX, u64::MAX, u32::MAX))
        });
        Ok(files)
    }

    fn recover_files(self: &Arc<Self>, paths: &[PathBuf], sequence: bool) -> Result<()> {
        for (i, path) in paths.iter().enumerate() {
            let last = i == paths.len() - 1;
            match self.recover_one(path, sequence, last) {
                Ok(resource) => {
                    let mut state = self.state.write();
                    if sequence {
                        insert_seq_sorted(&mut state.seq_files, resource);
                    } else {
                        state.unseq_files.push(resource);
                    }
                }
                Err(e) => {
                    warn!(
                        group = %self.name,
                        path = %path.display(),
                        error = %e,
                        "skipping data file that failed to recover"
                    );
                }
            }
        }
        Ok(())
    }

    fn recover_one(
        self: &Arc<Self>,
        path: &Path,
        sequence: bool,
        last: bool,
    ) -> Result<Arc<FileResource>> {
        let sidecar = path_with_suffix(path, RESOURCE_SUFFIX);
        let (resource, sealed) = if sidecar.exists() {
            let resource = FileResource::restore(path.to_path_buf())?;
            let sealed = resource.is_closed();
            (resource, sealed)
        } else {
            (FileResource::new(path.to_path_buf())?, false)
        };

        if sealed {
            return Ok(resource);
        }

        // Rebuild the chunk index and device times from the data file,
        // dropping any torn trailing chunk.
        let (chunks, valid_len) = scan_chunks(path)?;
        for chunk in &chunks {
            resource.update_start_time(&chunk.device, chunk.start_time);
            resource.update_end_time(&chunk.device, chunk.end_time);
        }
        resource.set_chunks(chunks);
        if resource.historical_versions().is_empty() {
            let name = TsFileName::parse(&resource.file_name())?;
            resource.add_historical_versions([name.version]);
        }

        if last {
            let partition = resource.partition();
            let versions = {
                let mut state = self.state.write();
                version_controller(&self.sys_dir, &mut state.versions, partition)?
            };
            let wal: Arc<dyn Wal> = if self.config.enable_wal {
                Arc::new(LogNode::new(
                    self.sys_dir
                        .join("wal")
                        .join(format!("{}.log", resource.file_name())),
                ))
            } else {
                Arc::new(NopWal)
            };
            let buffer = MemBuffer::recovered(
                resource.clone(),
                versions,
                wal,
                self.config.flush_threshold_points,
                sequence,
                valid_len,
            )?;
            let mut state = self.state.write();
            if sequence {
                state.work_seq.insert(partition, buffer);
            } else {
                state.work_unseq.insert(partition, buffer);
            }
            info!(
                group = %self.name,
                path = %path.display(),
                "reopened the last data file as a writable buffer"
            );
        } else {
            // An unsealed file that is not the newest cannot accept writes
            // any more; seal it with the recovered state.
            let file = fs::OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
            resource.set_closed(true);
            resource.write_resource_file()?;
        }
        Ok(resource)
    }

    fn recover_merge_state(self: &Arc<Self>) {
        let merging_path = self.sys_dir.join(MERGING_MODS_NAME);
        let log = MergeLog::new(&self.sys_dir);

        if merging_path.exists() {
            info!(
                group = %self.name,
                "found a merging modification file, starting merge recovery"
            );
            *self.merging_mods.lock() = Some(ModificationFile::new(merging_path.clone()));

            if self.config.continue_merge_after_reboot {
                match log.read() {
                    Ok(record) => {
                        let selection = {
                            let state = self.state.read();
                            let find = |paths: &[PathBuf], list: &[Arc<FileResource>]| {
                                paths
                                    .iter()
                                    .filter_map(|p| {
                                        list.iter().find(|r| &r.path() == p).cloned()
                                    })
                                    .collect::<Vec<_>>()
                            };
                            MergeSelection {
                                seq: find(&record.seq, &state.seq_files),
                                unseq: find(&record.unseq, &state.unseq_files),
                            }
                        };
                        if selection.seq.is_empty() || selection.unseq.is_empty() {
                            warn!(
                                group = %self.name,
                                "merge log names files that no longer exist, discarding the merge"
                            );
                            self.discard_merge_recovery();
                        } else {
                            for file in selection.seq.iter().chain(selection.unseq.iter()) {
                                file.set_merging(true);
                            }
                            self.is_merging.store(true, Ordering::SeqCst);
                            *self.merge_started_at.lock() = Some(Instant::now());
                            info!(group = %self.name, "resuming the interrupted merge");
                            let job = MergeJob {
                                selection,
                                full: self.config.force_full_merge,
                            };
                            if let Some(pool) = self.merge_pool.lock().as_ref() {
                                if let Err(e) = pool.submit(job) {
                                    error!(group = %self.name, error = %e, "failed to resubmit the merge");
                                    self.is_merging.store(false, Ordering::SeqCst);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            group = %self.name,
                            error = %e,
                            "merge log unreadable, discarding the interrupted merge"
                        );
                        self.discard_merge_recovery();
                    }
                }
            } else {
                self.discard_merge_recovery();
            }
        }

        // A merge log without a surviving merge.mods is an orphan left by a
        // crash between the two final deletions; clean it up.
        if !self.is_merging() && log.exists() {
            warn!(group = %self.name, "removing an orphan merge log");
            if let Err(e) = log.remove() {
                error!(group = %self.name, error = %e, "cannot remove the orphan merge log");
            }
        }
    }

    fn discard_merge_recovery(&self) {
        if let Some(mut mods) = self.merging_mods.lock().take() {
            if let Err(e) = mods.remove() {
                error!(group = %self.name, error = %e, "cannot remove the merging modification file");
            }
        }
        let log = MergeLog::new(&self.sys_dir);
        if let Err(e) = log.remove() {
            error!(group = %self.name, error = %e, "cannot remove the merge log");
        }
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Deletes all data of `device.measurement` with timestamps up to and
    /// including `upper_bound`.
    pub fn delete(&self, device: &str, measurement: &str, upper_bound: i64) -> Result<()> {
        let mut guard = self.state.write();
        let _merge = self.merge_lock.write();
        let state = &mut *guard;

        let mut updated: Vec<Arc<FileResource>> = Vec::new();
        let mut merging_written = false;

        let result = (|| -> Result<()> {
            if state.tracker.last_update_time(device).is_none() {
                debug!(group = %self.name, device, "no data for device, deletion is a no-op");
                return Ok(());
            }

            let partition = time_partition(upper_bound, self.config.partition_interval);
            if self.config.enable_wal {
                for (p, buffer) in state.work_seq.iter().chain(state.work_unseq.iter()) {
                    if *p <= partition {
                        buffer.log_deletion(device, measurement, upper_bound)?;
                    }
                }
            }

            let versions = version_controller(&self.sys_dir, &mut state.versions, partition)?;
            let deletion = Deletion::new(device, measurement, versions.next_version()?, upper_bound);

            if let Some(mods) = self.merging_mods.lock().as_mut() {
                mods.write(&deletion)?;
                merging_written = true;
            }

            let targets: Vec<Arc<FileResource>> = state
                .seq_files
                .iter()
                .chain(state.unseq_files.iter())
                .cloned()
                .collect();
            for resource in targets {
                let Some(start) = resource.start_time(device) else {
                    continue;
                };
                if upper_bound < start {
                    continue;
                }
                let file_versions =
                    version_controller(&self.sys_dir, &mut state.versions, resource.partition())?;
                let stamped = deletion.with_version(file_versions.next_version()?);
                resource.write_deletion(&stamped)?;
                resource.close_mod_file()?;
                if !resource.is_closed()
                    && let Some(buffer) = resource.unsealed_processor()
                {
                    buffer.delete_in_memory(&stamped);
                }
                updated.push(resource);
            }
            Ok(())
        })();

        if let Err(e) = result {
            // Roll back every modification file touched in this call.
            for resource in &updated {
                if let Err(abort_err) = resource.abort_mod_file() {
                    error!(
                        group = %self.name,
                        path = %resource.path().display(),
                        error = %abort_err,
                        "cannot roll back a modification file"
                    );
                }
            }
            if merging_written
                && let Some(mods) = self.merging_mods.lock().as_mut()
                && let Err(abort_err) = mods.abort()
            {
                error!(group = %self.name, error = %abort_err, "cannot roll back the merging modification file");
            }
            return Err(e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // TTL
    // ------------------------------------------------------------------

    /// Scans both file sets and evicts sealed resources entirely past the
    /// TTL cutoff. Never holds the insert lock across the whole scan.
    pub fn check_files_ttl(&self) {
        let _monitor = self.ttl_monitor.lock();
        let ttl = self.data_ttl();
        if ttl == i64::MAX {
            debug!(group = %self.name, "TTL not set, ignoring the check");
            return;
        }
        let time_lower_bound = now_millis() - ttl;

        let (seq_files, unseq_files) = {
            let state = self.state.read();
            (state.seq_files.clone(), state.unseq_files.clone())
        };
        for resource in seq_files {
            self.check_file_ttl(&resource, time_lower_bound, true);
        }
        for resource in unseq_files {
            self.check_file_ttl(&resource, time_lower_bound, false);
        }
    }

    fn check_file_ttl(&self, resource: &Arc<FileResource>, time_lower_bound: i64, seq: bool) {
        if resource.is_merging()
            || !resource.is_closed()
            || (!resource.is_deleted() && resource.still_lives(time_lower_bound))
        {
            return;
        }

        let mut state = self.state.write();
        // Prevent new merges and queries from choosing this file, then
        // re-check: it may have been picked for a merge since the scan.
        resource.set_deleted(true);
        if resource.is_merging() {
            return;
        }

        if let Some(_guard) = resource.write_query_lock().try_write() {
            if let Err(e) = resource.remove() {
                error!(
                    group = %self.name,
                    path = %resource.path().display(),
                    error = %e,
                    "cannot remove an expired file"
                );
                return;
            }
            info!(
                group = %self.name,
                path = %resource.path().display(),
                bound = time_lower_bound,
                "removed a file by TTL"
            );
            if seq {
                state.seq_files.retain(|r| !Arc::ptr_eq(r, resource));
            } else {
                state.unseq_files.retain(|r| !Arc::ptr_eq(r, resource));
            }
        }
    }

    fn start_ttl_sweeper(self: &Arc<Self>) {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        *self.sweeper_stop.lock() = Some(stop_tx);
        let weak = Arc::downgrade(self);
        let interval = self.config.ttl_check_interval;
        let handle = thread::Builder::new()
            .name("tsvault-ttl".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Ok(_) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                            let Some(group) = weak.upgrade() else {
                                break;
                            };
                            group.check_files_ttl();
                        }
                    }
                }
            });
        match handle {
            Ok(handle) => *self.sweeper.lock() = Some(handle),
            Err(e) => error!(group = %self.name, error = %e, "failed to spawn the TTL sweeper"),
        }
    }

    fn stop_ttl_sweeper(&self) {
        if let Some(tx) = self.sweeper_stop.lock().take() {
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }
    }

    // ------------------------------------------------------------------
    // Query snapshot
    // ------------------------------------------------------------------

    /// Builds a consistent snapshot of the resources a reader of
    /// `device.measurement` must visit.
    pub fn query(
        &self,
        device: &str,
        measurement: &str,
        query_id: u64,
        file_paths_manager: Option<&dyn FilePathsManager>,
        time_filter: Option<&dyn TimeFilter>,
    ) -> Result<QueryDataSource> {
        let state = self.state.read();
        let _merge = self.merge_lock.read();

        let schema = self.metadata.series_schema(device, measurement)?;
        let ttl = self.data_ttl();
        let now = now_millis();

        let seq = self.resource_views(&state.seq_files, device, measurement, time_filter, ttl, now);
        let unseq =
            self.resource_views(&state.unseq_files, device, measurement, time_filter, ttl, now);

        let mut source = QueryDataSource::new(
            SeriesPath::new(schema.device, schema.measurement),
            seq,
            unseq,
        );
        source.data_ttl = ttl;
        // Used files must be registered before the merge lock is released,
        // or a finishing merge may remove one mid-read.
        if let Some(manager) = file_paths_manager {
            manager.add_used_files_for_query(query_id, &source);
        }
        Ok(source)
    }

    fn resource_views(
        &self,
        files: &[Arc<FileResource>],
        device: &str,
        measurement: &str,
        time_filter: Option<&dyn TimeFilter>,
        ttl: i64,
        now: i64,
    ) -> Vec<ResourceView> {
        let mut views = Vec::new();
        for resource in files {
            if !resource.is_satisfied(device, time_filter, ttl, now) {
                continue;
            }
            let _close_query = self.close_query_lock.read();
            if resource.is_closed() {
                views.push(ResourceView::sealed(resource.clone()));
            } else if let Some(buffer) = resource.unsealed_processor() {
                let (mem_points, disk_chunks) = buffer.query(device, measurement);
                views.push(ResourceView::unsealed(
                    resource.clone(),
                    UnsealedView {
                        mem_points,
                        disk_chunks,
                    },
                ));
            } else {
                // Sealed between the check and the capture.
                views.push(ResourceView::sealed(resource.clone()));
            }
        }
        views
    }

    // ------------------------------------------------------------------
    // Merge lifecycle
    // ------------------------------------------------------------------

    /// Kicks off a background merge of unsequential data into the
    /// sequential files.
    pub fn merge(&self, full: bool) -> Result<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;

        if self.is_merging() {
            if let Some(started) = *self.merge_started_at.lock() {
                info!(
                    group = %self.name,
                    running_ms = started.elapsed().as_millis() as u64,
                    "last merge is still ongoing"
                );
            }
            return Ok(());
        }
        if state.seq_files.is_empty() || state.unseq_files.is_empty() {
            info!(group = %self.name, "no files to be merged");
            return Ok(());
        }

        let budget = self.config.merge_memory_budget;
        let ttl = self.data_ttl();
        let time_lower_bound = if ttl == i64::MAX {
            i64::MIN
        } else {
            now_millis() - ttl
        };
        let resource = MergeResource::new(
            state.seq_files.clone(),
            state.unseq_files.clone(),
            time_lower_bound,
        );
        let selector = selector_for(self.config.merge_strategy);
        let selection = match selector.select(&resource, budget) {
            Ok(Some(selection)) => selection,
            Ok(None) => {
                info!(group = %self.name, budget, "cannot select merge candidates under the budget");
                return Ok(());
            }
            Err(e) => {
                error!(group = %self.name, error = %e, "cannot select files for merge");
                return Err(e);
            }
        };

        for file in selection.seq.iter().chain(selection.unseq.iter()) {
            file.set_merging(true);
        }
        *self.merging_mods.lock() = Some(ModificationFile::new(
            self.sys_dir.join(MERGING_MODS_NAME),
        ));

        let log = MergeLog::new(&self.sys_dir);
        if let Err(e) = log.write(&selection) {
            for file in selection.seq.iter().chain(selection.unseq.iter()) {
                file.set_merging(false);
            }
            *self.merging_mods.lock() = None;
            return Err(TsVaultError::Merge(format!("cannot write the merge log: {e}")));
        }

        self.is_merging.store(true, Ordering::SeqCst);
        *self.merge_started_at.lock() = Some(Instant::now());
        info!(
            group = %self.name,
            seq = selection.seq.len(),
            unseq = selection.unseq.len(),
            full = full || self.config.force_full_merge,
            "submitting a merge task"
        );

        let job = MergeJob {
            selection: selection.clone(),
            full: full || self.config.force_full_merge,
        };
        let submit = match self.merge_pool.lock().as_ref() {
            Some(pool) => pool.submit(job),
            None => Err(TsVaultError::ShuttingDown),
        };
        if let Err(e) = submit {
            for file in selection.seq.iter().chain(selection.unseq.iter()) {
                file.set_merging(false);
            }
            self.is_merging.store(false, Ordering::SeqCst);
            *self.merging_mods.lock() = None;
            let _ = log.remove();
            return Err(e);
        }
        Ok(())
    }

    /// Invoked by the merge worker when the task finishes, normally or
    /// aborted (empty `unseq_files`).
    pub(crate) fn merge_end_action(
        &self,
        seq_files: &[Arc<FileResource>],
        unseq_files: &[Arc<FileResource>],
    ) {
        info!(group = %self.name, "a merge task is ending");

        if unseq_files.is_empty() {
            for file in seq_files {
                file.set_merging(false);
            }
            self.is_merging.store(false, Ordering::SeqCst);
            info!(group = %self.name, "a merge task abnormally ends");
            return;
        }

        self.remove_unseq_files(unseq_files);

        let count = seq_files.len();
        for (i, seq_file) in seq_files.iter().enumerate() {
            // Reverse of the delete path's order, so take both locks with
            // try-lock, releasing and retrying if only one is obtained.
            loop {
                let Some(file_guard) = seq_file.write_query_lock().try_write() else {
                    thread::yield_now();
                    continue;
                };
                let Some(merge_guard) = self.merge_lock.try_write() else {
                    drop(file_guard);
                    thread::yield_now();
                    continue;
                };

                self.update_merge_modification(seq_file);
                if i == count - 1 {
                    self.remove_merging_modification();
                    self.is_merging.store(false, Ordering::SeqCst);
                    let log = MergeLog::new(&self.sys_dir);
                    if let Err(e) = log.remove() {
                        error!(group = %self.name, error = %e, "cannot delete the merge log");
                    }
                }
                seq_file.set_merging(false);
                drop(merge_guard);
                drop(file_guard);
                break;
            }
        }
        info!(group = %self.name, "a merge task ends");
    }

    fn remove_unseq_files(&self, unseq_files: &[Arc<FileResource>]) {
        {
            let mut state = self.state.write();
            let _merge = self.merge_lock.write();
            state
                .unseq_files
                .retain(|r| !unseq_files.iter().any(|u| Arc::ptr_eq(r, u)));
        }
        for file in unseq_files {
            let _guard = file.write_query_lock().write();
            file.set_merging(false);
            file.set_deleted(true);
            if let Err(e) = file.remove() {
                error!(
                    group = %self.name,
                    path = %file.path().display(),
                    error = %e,
                    "cannot remove a merged unsequential file"
                );
            }
        }
    }

    /// Replaces the file's sidecar with the deletions recorded during the
    /// merge window, so none of them is lost with the old sidecar.
    fn update_merge_modification(&self, seq_file: &Arc<FileResource>) {
        if let Err(e) = seq_file.remove_mod_file() {
            error!(
                group = %self.name,
                path = %seq_file.path().display(),
                error = %e,
                "cannot remove the old modification file after merge"
            );
            return;
        }
        let guard = self.merging_mods.lock();
        let Some(merging) = guard.as_ref() else {
            return;
        };
        match merging.modifications() {
            Ok(records) => {
                for deletion in records {
                    if let Err(e) = seq_file.write_deletion(&deletion) {
                        error!(
                            group = %self.name,
                            path = %seq_file.path().display(),
                            error = %e,
                            "cannot copy a merge-window deletion"
                        );
                        return;
                    }
                }
                if let Err(e) = seq_file.close_mod_file() {
                    error!(
                        group = %self.name,
                        path = %seq_file.path().display(),
                        error = %e,
                        "cannot close the rewritten modification file"
                    );
                }
            }
            Err(e) => {
                error!(group = %self.name, error = %e, "cannot read the merging modification file");
            }
        }
    }

    fn remove_merging_modification(&self) {
        if let Some(mut mods) = self.merging_mods.lock().take() {
            if let Err(e) = mods.remove() {
                error!(group = %self.name, error = %e, "cannot remove the merging modification file");
            }
        }
    }

    // ------------------------------------------------------------------
    // Loading external files
    // ------------------------------------------------------------------

    /// Loads an externally produced file that is known to be newer than all
    /// local data; it always lands in the sequential index.
    pub fn load_for_sync(&self, resource: Arc<FileResource>) -> Result<()> {
        let partition = resource.time_partition_with_check(self.config.partition_interval)?;
        let mut guard = self.state.write();
        let _merge = self.merge_lock.write();
        let state = &mut *guard;
        if self.load_by_kind_locked(state, LoadKind::Sequence, &resource, partition)? {
            update_latest_time_map(state, &resource, self.config.partition_interval);
        }
        Ok(())
    }

    /// Loads an externally produced file, deciding between the sequential
    /// slot, the unsequential bucket, and the duplicate no-op.
    pub fn load(&self, resource: Arc<FileResource>) -> Result<()> {
        let partition = resource.time_partition_with_check(self.config.partition_interval)?;
        let mut guard = self.state.write();
        let _merge = self.merge_lock.write();
        let state = &mut *guard;

        let seq_snapshot = state.seq_files.clone();
        let loaded = match find_insertion_position(&resource, partition, &seq_snapshot) {
            InsertPosition::AlreadyExists => {
                info!(
                    group = %self.name,
                    file = %resource.file_name(),
                    "file already exists, load is a no-op"
                );
                return Ok(());
            }
            InsertPosition::Overlap => {
                self.load_by_kind_locked(state, LoadKind::Unsequence, &resource, partition)?
            }
            InsertPosition::Index(index) => {
                if !seq_snapshot.is_empty() {
                    let new_name =
                        self.file_name_for_loading_locked(state, &resource, index, partition, &seq_snapshot)?;
                    if new_name != resource.file_name() {
                        info!(
                            group = %self.name,
                            from = %resource.file_name(),
                            to = %new_name,
                            "renaming the file to preserve sequential ordering"
                        );
                        rename_staged_file(&resource, &new_name)?;
                    }
                }
                self.load_by_kind_locked(state, LoadKind::Sequence, &resource, partition)?
            }
        };
        if !loaded {
            return Ok(());
        }

        update_latest_time_map(state, &resource, self.config.partition_interval);
        if self.config.reduce_overlap_on_load {
            self.remove_fully_overlap_files_locked(state, &resource);
        }
        Ok(())
    }

    fn load_by_kind_locked(
        &self,
        state: &mut GroupState,
        kind: LoadKind,
        resource: &Arc<FileResource>,
        partition: i64,
    ) -> Result<bool> {
        let base = match kind {
            LoadKind::Sequence => self.rotator.next_sequential_root(),
            LoadKind::Unsequence => self.rotator.next_unsequential_root(),
        };
        let base = match base {
            Ok(base) => base,
            Err(e @ TsVaultError::DiskSpaceInsufficient { .. }) => {
                error!(
                    group = %self.name,
                    error = %e,
                    "disk space insufficient while loading, switching to read-only"
                );
                self.flags.set_read_only(true);
                return Err(TsVaultError::LoadFile {
                    path: resource.path(),
                    details: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let list = match kind {
            LoadKind::Sequence => &state.seq_files,
            LoadKind::Unsequence => &state.unseq_files,
        };
        if list.iter().any(|r| r.file_name() == resource.file_name()) {
            warn!(
                group = %self.name,
                file = %resource.file_name(),
                "file has already been loaded, skipping"
            );
            return Ok(false);
        }

        let target_dir = base.join(&self.name).join(partition.to_string());
        resource.move_to(&target_dir)?;
        resource.set_partition(partition);
        resource.set_closed(true);

        match kind {
            LoadKind::Sequence => {
                insert_seq_sorted(&mut state.seq_files, resource.clone());
                info!(
                    group = %self.name,
                    file = %resource.file_name(),
                    "loaded a file into the sequence list"
                );
            }
            LoadKind::Unsequence => {
                state.unseq_files.push(resource.clone());
                info!(
                    group = %self.name,
                    file = %resource.file_name(),
                    "loaded a file into the unsequence list"
                );
            }
        }

        let versions = resource.historical_versions();
        state
            .direct_versions
            .entry(partition)
            .or_default()
            .extend(versions.iter().copied());
        if let Some(max) = versions.iter().next_back() {
            let entry = state.max_versions.entry(partition).or_insert(0);
            if *entry < *max {
                *entry = *max;
            }
        }
        Ok(true)
    }

    /// Picks a file name that keeps the sequential index ordered when the
    /// new file lands between `[insert_index, insert_index + 1]`.
    fn file_name_for_loading_locked(
        &self,
        state: &mut GroupState,
        resource: &Arc<FileResource>,
        insert_index: i64,
        partition: i64,
        seq_list: &[Arc<FileResource>],
    ) -> Result<String> {
        let name = resource.file_name();
        let current_time = TsFileName::parse(&name)?.time;
        let pre_time = if insert_index == -1 {
            0
        } else {
            seq_list[insert_index as usize].ts_name()?.time
        };

        if insert_index == seq_list.len() as i64 - 1 {
            if pre_time < current_time {
                Ok(name)
            } else {
                self.new_file_name_locked(state, partition)
            }
        } else {
            let subsequent = seq_list[(insert_index + 1) as usize].ts_name()?;
            if pre_time < current_time && current_time < subsequent.time {
                Ok(name)
            } else {
                Ok(TsFileName::new(
                    pre_time + (subsequent.time - pre_time) / 2,
                    subsequent.version,
                    0,
                )
                .format())
            }
        }
    }

    fn new_file_name_locked(&self, state: &mut GroupState, partition: i64) -> Result<String> {
        let versions = version_controller(&self.sys_dir, &mut state.versions, partition)?;
        let version = versions.next_version()?;
        state
            .direct_versions
            .entry(partition)
            .or_default()
            .insert(version);
        let max = state.max_versions.entry(partition).or_insert(0);
        if *max < version {
            *max = version;
        }
        Ok(TsFileName::new(now_millis(), version, 0).format())
    }

    /// Drops any file whose historical versions are a strict subset of the
    /// loaded file's; the loaded file supersedes them.
    fn remove_fully_overlap_files_locked(
        &self,
        state: &mut GroupState,
        resource: &Arc<FileResource>,
    ) {
        let _close_query = self.close_query_lock.write();
        let new_versions = resource.historical_versions();
        for list in [&mut state.seq_files, &mut state.unseq_files] {
            list.retain(|file| {
                let file_versions = file.historical_versions();
                let superseded = new_versions.is_superset(&file_versions)
                    && new_versions != file_versions;
                if !superseded {
                    return true;
                }
                let Some(_guard) = file.write_query_lock().try_write() else {
                    return true;
                };
                if let Err(e) = file.remove() {
                    error!(
                        group = %self.name,
                        path = %file.path().display(),
                        error = %e,
                        "cannot remove a superseded file"
                    );
                    return true;
                }
                info!(
                    group = %self.name,
                    file = %file.file_name(),
                    "removed a file fully covered by a loaded file"
                );
                false
            });
        }
    }

    /// Whether the file's historical versions are already covered by the
    /// partition's direct versions.
    pub fn is_file_already_present(&self, resource: &Arc<FileResource>, partition: i64) -> bool {
        let state = self.state.read();
        let Some(known) = state.direct_versions.get(&partition) else {
            return false;
        };
        resource
            .historical_versions()
            .iter()
            .all(|v| known.contains(v))
    }

    /// Removes a named data file from either index and from disk.
    pub fn delete_file(&self, file_name: &str) -> bool {
        let target = {
            let mut state = self.state.write();
            let _merge = self.merge_lock.write();
            take_by_name(&mut state.seq_files, file_name)
                .or_else(|| take_by_name(&mut state.unseq_files, file_name))
        };
        let Some(resource) = target else {
            return false;
        };
        {
            let _guard = resource.write_query_lock().write();
            if let Err(e) = resource.remove() {
                error!(
                    group = %self.name,
                    path = %resource.path().display(),
                    error = %e,
                    "cannot delete the data file"
                );
            }
        }
        info!(group = %self.name, file = file_name, "deleted a data file");
        true
    }

    /// Moves a named data file and its sidecar out of the group.
    pub fn move_file(&self, file_name: &str, target_dir: &Path) -> Result<bool> {
        let target = {
            let mut state = self.state.write();
            let _merge = self.merge_lock.write();
            take_by_name(&mut state.seq_files, file_name)
                .or_else(|| take_by_name(&mut state.unseq_files, file_name))
        };
        let Some(resource) = target else {
            return Ok(false);
        };
        {
            let _guard = resource.write_query_lock().write();
            resource.move_to(target_dir)?;
        }
        info!(
            group = %self.name,
            file = file_name,
            target = %target_dir.display(),
            "moved a data file out of the group"
        );
        Ok(true)
    }

    /// Group teardown: closes everything and deletes the group's folders
    /// under every data root.
    pub fn sync_delete_data_files(&self) {
        info!(group = %self.name, "closing all files before deleting data folders");
        self.sync_close_all();

        let mut state = self.state.write();
        if let Some(mods) = self.merging_mods.lock().as_mut() {
            if let Err(e) = mods.close() {
                error!(group = %self.name, error = %e, "cannot close the merging modification file");
            }
        }
        for resource in state.seq_files.iter().chain(state.unseq_files.iter()) {
            if let Err(e) = resource.close_mod_file() {
                error!(
                    group = %self.name,
                    path = %resource.path().display(),
                    error = %e,
                    "cannot close a modification file"
                );
            }
        }

        let mut roots = self.rotator.sequential_roots();
        roots.extend(self.rotator.unsequential_roots());
        for root in roots {
            let folder = root.join(&self.name);
            if folder.exists()
                && let Err(e) = fs::remove_dir_all(&folder)
            {
                error!(group = %self.name, dir = %folder.display(), error = %e, "cannot delete a group folder");
            }
        }

        state.work_seq.clear();
        state.work_unseq.clear();
        state.seq_files.clear();
        state.unseq_files.clear();
        state.tracker.clear();
        state.direct_versions.clear();
        state.max_versions.clear();
    }
}

/// Finds where a loaded file belongs in the sequential list.
fn find_insertion_position(
    new_resource: &Arc<FileResource>,
    new_partition: i64,
    seq_list: &[Arc<FileResource>],
) -> InsertPosition {
    let new_name = new_resource.file_name();
    let mut insert_pos: i64 = -1;

    for (i, local) in seq_list.iter().enumerate() {
        if local.file_name() == new_name {
            return InsertPosition::AlreadyExists;
        }
        // Files of earlier partitions, and a trailing empty file, only hold
        // data older than the new file.
        if (i == seq_list.len() - 1 && local.has_no_end_times())
            || new_partition > local.partition()
        {
            continue;
        }
        match compare_file_devices(new_resource, local) {
            0 => return InsertPosition::Overlap,
            -1 => return InsertPosition::Index(i as i64 - 1),
            _ => insert_pos = i as i64,
        }
    }
    InsertPosition::Index(insert_pos)
}

/// Compares two files by their per-device time ranges.
///
/// Returns 1 when every shared device of `a` is newer than in `b`, -1 when
/// every shared device is older, and 0 when any device overlaps or the
/// relations disagree across devices.
fn compare_file_devices(a: &Arc<FileResource>, b: &Arc<FileResource>) -> i32 {
    let mut has_pre = false;
    let mut has_subsequent = false;
    for device in a.devices() {
        let (Some(start_a), Some(end_a)) = (a.start_time(&device), a.end_time(&device)) else {
            continue;
        };
        let (Some(start_b), Some(end_b)) = (b.start_time(&device), b.end_time(&device)) else {
            continue;
        };
        if start_a > end_b {
            has_pre = true;
        } else if start_b > end_a {
            has_subsequent = true;
        } else {
            return 0;
        }
    }
    if has_pre && has_subsequent {
        return 0;
    }
    if !has_pre && has_subsequent {
        return -1;
    }
    1
}

fn rename_staged_file(resource: &Arc<FileResource>, new_name: &str) -> Result<()> {
    let staged = resource.path();
    let parent = staged.parent().ok_or_else(|| TsVaultError::LoadFile {
        path: staged.clone(),
        details: "staged file has no parent directory".to_string(),
    })?;
    let renamed = parent.join(new_name);
    fs::rename(&staged, &renamed).map_err(|e| TsVaultError::LoadFile {
        path: staged.clone(),
        details: format!("cannot rename staged file: {e}"),
    })?;
    let staged_res = path_with_suffix(&staged, RESOURCE_SUFFIX);
    if staged_res.exists() {
        fs::rename(&staged_res, path_with_suffix(&renamed, RESOURCE_SUFFIX)).map_err(|e| {
            TsVaultError::LoadFile {
                path: staged_res.clone(),
                details: format!("cannot rename staged sidecar: {e}"),
            }
        })?;
    }
    resource.set_path(renamed);
    Ok(())
}

/// Seeds the latest-time tables from a loaded file's end times.
fn update_latest_time_map(
    state: &mut GroupState,
    resource: &Arc<FileResource>,
    partition_interval: i64,
) {
    for (device, end) in resource.end_times() {
        let partition = time_partition(end, partition_interval);
        state.tracker.seed_flushed(partition, &device, end);
    }
}

fn take_by_name(list: &mut Vec<Arc<FileResource>>, file_name: &str) -> Option<Arc<FileResource>> {
    let pos = list.iter().position(|r| r.file_name() == file_name)?;
    Some(list.remove(pos))
}

/// Keeps the sequential index ordered by (partition, time, version,
/// mergeCount); partition ordering dominates filename ordering.
fn insert_seq_sorted(list: &mut Vec<Arc<FileResource>>, resource: Arc<FileResource>) {
    let key = seq_sort_key(&resource);
    let pos = list
        .iter()
        .position(|r| seq_sort_key(r) > key)
        .unwrap_or(list.len());
    list.insert(pos, resource);
}

fn seq_sort_key(resource: &Arc<FileResource>) -> (i64, i64, u64, u32) {
    let name = resource
        .ts_name()
        .unwrap_or(TsFileName::new(i64::MAX, u64::MAX, u32::MAX));
    (
        resource.partition(),
        name.time,
        name.version,
        name.merge_cnt,
    )
}

fn version_controller(
    sys_dir: &Path,
    versions: &mut HashMap<i64, Arc<VersionController>>,
    partition: i64,
) -> Result<Arc<VersionController>> {
    if let Some(controller) = versions.get(&partition) {
        return Ok(controller.clone());
    }
    let controller = Arc::new(VersionController::open(sys_dir, partition)?);
    versions.insert(partition, controller.clone());
    Ok(controller)
}

/// Replays renames interrupted by a crash: a leftover `<name><suffix>` is
/// renamed to `<name>` unless the target already exists.
fn continue_failed_renames(partition_dir: &Path, suffix: &str) -> Result<()> {
    for entry in fs::read_dir(partition_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let Some(origin_name) = name.strip_suffix(suffix) else {
            continue;
        };
        let origin = partition_dir.join(origin_name);
        if origin.exists() {
            fs::remove_file(&path)?;
        } else {
            fs::rename(&path, &origin)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_group(dir: &TempDir, config: GroupConfig) -> Arc<StorageGroup> {
        GroupBuilder::new("root.sg")
            .with_data_root(dir.path())
            .with_config(config.with_ttl_check_interval(Duration::from_secs(3600)))
            .build()
            .unwrap()
    }

    #[test]
    fn routing_uses_strict_greater_than() {
        let dir = TempDir::new().unwrap();
        let group = open_group(&dir, GroupConfig::default());

        group.insert(&Record::single("d1", "m1", 100, 1.0)).unwrap();
        group.sync_close_all();

        // Equal to the flushed watermark: must land unsequential.
        group.insert(&Record::single("d1", "m1", 100, 2.0)).unwrap();
        let (seq, unseq) = group.working_partitions();
        assert!(seq.is_empty());
        assert_eq!(unseq.len(), 1);

        // Strictly newer: sequential.
        group.insert(&Record::single("d1", "m1", 101, 3.0)).unwrap();
        let (seq, _) = group.working_partitions();
        assert_eq!(seq.len(), 1);

        group.close().unwrap();
    }

    #[test]
    fn capacity_cap_closes_the_oldest_partition() {
        let dir = TempDir::new().unwrap();
        let config = GroupConfig::default()
            .with_concurrent_writing_partitions(1)
            .with_partition_interval(1000);
        let group = open_group(&dir, config);

        group.insert(&Record::single("d1", "m1", 100, 1.0)).unwrap();
        group.insert(&Record::single("d1", "m1", 5100, 2.0)).unwrap();

        let (seq, _) = group.working_partitions();
        assert_eq!(seq, vec![5]);
        group.close().unwrap();
    }

    #[test]
    fn exactly_one_writable_buffer_per_partition_and_kind() {
        let dir = TempDir::new().unwrap();
        let config = GroupConfig::default().with_concurrent_writing_partitions(4);
        let group = open_group(&dir, config);

        for ts in [10, 20, 30] {
            group
                .insert(&Record::single("d1", "m1", ts, ts as f64))
                .unwrap();
        }
        let (seq, unseq) = group.working_partitions();
        assert_eq!(seq.len(), 1);
        assert!(unseq.is_empty());
        assert_eq!(group.sequence_files().len(), 1);
        group.close().unwrap();
    }

    #[test]
    fn sync_close_all_with_empty_sets_returns_immediately() {
        let dir = TempDir::new().unwrap();
        let group = open_group(&dir, GroupConfig::default());
        let start = Instant::now();
        group.sync_close_all();
        assert!(start.elapsed() < Duration::from_secs(5));
        group.close().unwrap();
    }

    #[test]
    fn delete_without_device_data_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let group = open_group(&dir, GroupConfig::default());
        group.delete("d-unknown", "m1", 100).unwrap();
        assert!(group.sequence_files().is_empty());
        group.close().unwrap();
    }
}
