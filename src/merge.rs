//! Merge lifecycle: candidate selection, the merge worker that folds
//! unsequential files into sequential ones, and the on-disk merge log.
//!
//! The coordinator kicks a merge off under its writer lock, hands the
//! selection to a worker, and finishes in `merge_end_action`, where the
//! modification files recorded during the merge window are re-attached to
//! the surviving sequential files.

use crate::group::StorageGroup;
use crate::resource::{
    ChunkMeta, ChunkPayload, FileResource, MERGE_SUFFIX, path_with_suffix, write_chunk,
};
use crate::{DataPoint, MergeStrategy, Result, TsVaultError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Modification file mirroring deletions that arrive mid-merge; lives in
/// the group's system directory. Its presence at startup triggers merge
/// recovery.
pub const MERGING_MODS_NAME: &str = "merge.mods";

/// Progress log of the in-flight merge, next to `merge.mods`.
pub const MERGE_LOG_NAME: &str = "merge.log";

/// The file sets a merge may choose from, bounded below by the TTL cutoff.
pub struct MergeResource {
    seq_files: Vec<Arc<FileResource>>,
    unseq_files: Vec<Arc<FileResource>>,
    time_lower_bound: i64,
}

impl MergeResource {
    pub fn new(
        seq_files: Vec<Arc<FileResource>>,
        unseq_files: Vec<Arc<FileResource>>,
        time_lower_bound: i64,
    ) -> Self {
        let eligible = |r: &Arc<FileResource>| {
            r.is_closed() && !r.is_deleted() && !r.is_merging() && r.still_lives(time_lower_bound)
        };
        Self {
            seq_files: seq_files.into_iter().filter(|r| eligible(r)).collect(),
            unseq_files: unseq_files.into_iter().filter(|r| eligible(r)).collect(),
            time_lower_bound,
        }
    }

    pub fn seq_files(&self) -> &[Arc<FileResource>] {
        &self.seq_files
    }

    pub fn unseq_files(&self) -> &[Arc<FileResource>] {
        &self.unseq_files
    }

    pub fn time_lower_bound(&self) -> i64 {
        self.time_lower_bound
    }
}

/// The files one merge task will touch.
#[derive(Clone)]
pub struct MergeSelection {
    pub seq: Vec<Arc<FileResource>>,
    pub unseq: Vec<Arc<FileResource>>,
}

/// Picks merge candidates within a memory budget.
pub trait MergeFileSelector: Send + Sync {
    fn select(&self, resource: &MergeResource, budget: u64) -> Result<Option<MergeSelection>>;
}

/// Resolves the configured strategy to a selector.
pub fn selector_for(strategy: MergeStrategy) -> Box<dyn MergeFileSelector> {
    match strategy {
        MergeStrategy::MaxFileNum => Box::new(MaxFileNumSelector),
        MergeStrategy::MaxSeriesNum => Box::new(MaxSeriesNumSelector),
    }
}

/// Greedy whole-file selection bounded by the byte budget.
pub struct MaxFileNumSelector;

impl MergeFileSelector for MaxFileNumSelector {
    fn select(&self, resource: &MergeResource, budget: u64) -> Result<Option<MergeSelection>> {
        select_with_limit(resource, budget, None)
    }
}

/// Like [`MaxFileNumSelector`], additionally bounding the number of
/// distinct series one merge touches.
pub struct MaxSeriesNumSelector;

impl MergeFileSelector for MaxSeriesNumSelector {
    fn select(&self, resource: &MergeResource, budget: u64) -> Result<Option<MergeSelection>> {
        let max_series = (budget / 1024).max(1) as usize;
        select_with_limit(resource, budget, Some(max_series))
    }
}

fn select_with_limit(
    resource: &MergeResource,
    budget: u64,
    max_series: Option<usize>,
) -> Result<Option<MergeSelection>> {
    if resource.seq_files().is_empty() || resource.unseq_files().is_empty() {
        return Ok(None);
    }

    let mut cost = 0u64;
    let mut series: BTreeSet<(String, String)> = BTreeSet::new();
    let mut unseq_sel: Vec<Arc<FileResource>> = Vec::new();
    let mut seq_sel: Vec<Arc<FileResource>> = Vec::new();

    for unseq in resource.unseq_files() {
        let overlaps: Vec<Arc<FileResource>> = resource
            .seq_files()
            .iter()
            .filter(|seq| {
                seq.partition() == unseq.partition()
                    && devices_overlap(unseq, seq)
                    && !seq_sel.iter().any(|s| Arc::ptr_eq(s, seq))
            })
            .cloned()
            .collect::<Vec<_>>();

        let added_cost = file_size(unseq)
            + overlaps.iter().map(|s| file_size(s)).sum::<u64>();
        if cost + added_cost > budget {
            break;
        }

        if let Some(limit) = max_series {
            let mut candidate = series.clone();
            for file in std::iter::once(unseq).chain(overlaps.iter()) {
                for chunk in file.chunks() {
                    candidate.insert((chunk.device, chunk.measurement));
                }
            }
            if candidate.len() > limit && !unseq_sel.is_empty() {
                break;
            }
            series = candidate;
        }

        cost += added_cost;
        unseq_sel.push(unseq.clone());
        seq_sel.extend(overlaps);
    }

    if unseq_sel.is_empty() {
        return Ok(None);
    }

    // Every merge needs a sequential target; fall back to the newest
    // candidate of the partition, then to the newest candidate overall.
    if seq_sel.is_empty() {
        let partition = unseq_sel[0].partition();
        let fallback = resource
            .seq_files()
            .iter()
            .filter(|s| s.partition() == partition)
            .next_back()
            .or_else(|| resource.seq_files().last())
            .cloned();
        match fallback {
            Some(f) => seq_sel.push(f),
            None => return Ok(None),
        }
    }

    // Keep the index order of the sequential list.
    let mut ordered_seq: Vec<Arc<FileResource>> = Vec::new();
    for seq in resource.seq_files() {
        if seq_sel.iter().any(|s| Arc::ptr_eq(s, seq)) {
            ordered_seq.push(seq.clone());
        }
    }

    Ok(Some(MergeSelection {
        seq: ordered_seq,
        unseq: unseq_sel,
    }))
}

fn file_size(resource: &Arc<FileResource>) -> u64 {
    fs::metadata(resource.path()).map(|m| m.len()).unwrap_or(0)
}

/// Whether any device present in both files has intersecting time spans.
fn devices_overlap(a: &Arc<FileResource>, b: &Arc<FileResource>) -> bool {
    for device in a.devices() {
        let (Some(start_a), Some(end_a)) = (a.start_time(&device), a.end_time(&device)) else {
            continue;
        };
        let (Some(start_b), Some(end_b)) = (b.start_time(&device), b.end_time(&device)) else {
            continue;
        };
        if start_a <= end_b && start_b <= end_a {
            return true;
        }
    }
    false
}

/// Persisted record of the in-flight merge selection.
#[derive(Debug, Serialize, Deserialize)]
pub struct MergeLogRecord {
    pub seq: Vec<PathBuf>,
    pub unseq: Vec<PathBuf>,
}

/// The on-disk merge progress log.
pub struct MergeLog {
    path: PathBuf,
}

impl MergeLog {
    pub fn new(sys_dir: &Path) -> Self {
        Self {
            path: sys_dir.join(MERGE_LOG_NAME),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn write(&self, selection: &MergeSelection) -> Result<()> {
        let record = MergeLogRecord {
            seq: selection.seq.iter().map(|r| r.path()).collect(),
            unseq: selection.unseq.iter().map(|r| r.path()).collect(),
        };
        let json = serde_json::to_vec_pretty(&record)?;
        fs::write(&self.path, json)?;
        Ok(())
    }

    pub fn read(&self) -> Result<MergeLogRecord> {
        let bytes = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn remove(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Body of the merge worker. Rewrites the selected sequential files with
/// the unsequential data folded in, then hands control to the
/// coordinator's end action. A failed rewrite ends the merge through the
/// aborted path, leaving every file untouched.
pub(crate) fn run_merge_task(
    group: &Arc<StorageGroup>,
    selection: MergeSelection,
    full_merge: bool,
) {
    info!(
        group = group.name(),
        seq = selection.seq.len(),
        unseq = selection.unseq.len(),
        "merge task starting"
    );
    match rewrite_sequential_files(&selection, full_merge) {
        Ok(()) => group.merge_end_action(&selection.seq, &selection.unseq),
        Err(e) => {
            error!(group = group.name(), error = %e, "merge task failed, aborting");
            for file in &selection.unseq {
                file.set_merging(false);
            }
            group.merge_end_action(&selection.seq, &[]);
        }
    }
}

type SeriesKey = (String, String);

fn rewrite_sequential_files(selection: &MergeSelection, full_merge: bool) -> Result<()> {
    let seq = &selection.seq;
    if seq.is_empty() {
        return Err(TsVaultError::Merge(
            "merge selection holds no sequential files".to_string(),
        ));
    }

    // Route every unsequential point to the sequential file that owns its
    // device and time span; leftovers land in the last file holding the
    // device, extending its span.
    let mut assigned: Vec<HashMap<SeriesKey, Vec<DataPoint>>> = vec![HashMap::new(); seq.len()];
    let mut contributed: Vec<BTreeSet<u64>> = vec![BTreeSet::new(); seq.len()];

    let mut last_for_device: HashMap<String, usize> = HashMap::new();
    for (i, file) in seq.iter().enumerate() {
        for device in file.devices() {
            last_for_device.insert(device, i);
        }
    }

    for unseq in &selection.unseq {
        let versions = unseq.historical_versions();
        for chunk in unseq.chunks() {
            let points = unseq.read_points(&chunk.device, &chunk.measurement)?;
            if points.is_empty() {
                continue;
            }
            for point in points {
                let target = seq
                    .iter()
                    .position(|s| {
                        s.contains_device(&chunk.device)
                            && s.end_time(&chunk.device)
                                .map(|end| point.timestamp <= end)
                                .unwrap_or(false)
                    })
                    .or_else(|| last_for_device.get(&chunk.device).copied())
                    .unwrap_or(seq.len() - 1);
                assigned[target]
                    .entry((chunk.device.clone(), chunk.measurement.clone()))
                    .or_default()
                    .push(point);
                contributed[target].extend(versions.iter().copied());
            }
        }
    }

    for (i, seq_file) in seq.iter().enumerate() {
        if assigned[i].is_empty() && !full_merge {
            continue;
        }
        rewrite_one(seq_file, &assigned[i], &contributed[i])?;
    }
    Ok(())
}

fn rewrite_one(
    seq_file: &Arc<FileResource>,
    absorbed: &HashMap<SeriesKey, Vec<DataPoint>>,
    contributed: &BTreeSet<u64>,
) -> Result<()> {
    // Merge both sides per series; on a timestamp collision the
    // unsequential point wins, matching overwrite semantics.
    let mut merged: BTreeMap<SeriesKey, BTreeMap<i64, f64>> = BTreeMap::new();

    let mut own_series: BTreeSet<SeriesKey> = BTreeSet::new();
    for chunk in seq_file.chunks() {
        own_series.insert((chunk.device, chunk.measurement));
    }
    for (device, measurement) in &own_series {
        let entry = merged
            .entry((device.clone(), measurement.clone()))
            .or_default();
        for point in seq_file.read_points(device, measurement)? {
            entry.insert(point.timestamp, point.value);
        }
    }
    for (key, points) in absorbed {
        let entry = merged.entry(key.clone()).or_default();
        for point in points {
            entry.insert(point.timestamp, point.value);
        }
    }

    let target = seq_file.path();
    let temp = path_with_suffix(&target, MERGE_SUFFIX);
    let mut file = File::create(&temp)?;
    let mut offset = 0u64;
    let mut metas: Vec<ChunkMeta> = Vec::new();
    let mut spans: HashMap<String, (i64, i64)> = HashMap::new();

    for ((device, measurement), points) in &merged {
        if points.is_empty() {
            continue;
        }
        let payload = ChunkPayload {
            device: device.clone(),
            measurement: measurement.clone(),
            points: points
                .iter()
                .map(|(ts, value)| DataPoint::new(*ts, *value))
                .collect(),
        };
        let (meta, next) = write_chunk(&mut file, offset, &payload)?;
        offset = next;
        let span = spans
            .entry(device.clone())
            .or_insert((meta.start_time, meta.end_time));
        span.0 = span.0.min(meta.start_time);
        span.1 = span.1.max(meta.end_time);
        metas.push(meta);
    }
    file.sync_all()?;
    drop(file);

    // Substitute the rewritten file under its own write/query lock so no
    // reader observes the swap mid-flight.
    let _guard = seq_file.write_query_lock().write();
    fs::rename(&temp, &target)?;
    seq_file.set_chunks(metas);
    for (device, (start, end)) in spans {
        seq_file.force_start_time(&device, start);
        seq_file.force_end_time(&device, end);
    }
    seq_file.add_historical_versions(contributed.iter().copied());
    seq_file.write_resource_file()?;
    Ok(())
}
