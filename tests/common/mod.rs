#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tsvault::group::GroupBuilder;
use tsvault::{GroupConfig, Record, StorageGroup};

/// Opens a group under the temp dir with a slow TTL sweeper so tests
/// control every sweep themselves.
pub fn open_group(dir: &TempDir, config: GroupConfig) -> Arc<StorageGroup> {
    open_group_with(dir, config, |b| b)
}

pub fn open_group_with(
    dir: &TempDir,
    config: GroupConfig,
    customize: impl FnOnce(GroupBuilder) -> GroupBuilder,
) -> Arc<StorageGroup> {
    let builder = GroupBuilder::new("root.sg")
        .with_data_root(dir.path())
        .with_config(config.with_ttl_check_interval(Duration::from_secs(3600)));
    customize(builder).build().unwrap()
}

/// Polls `cond` until it holds or the timeout elapses.
pub fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Fabricates a sealed data file with the requested name, device range,
/// and historical versions by running it through a scratch group, then
/// parks it (plus its `.resource` sidecar) under `staging`.
pub fn make_sealed_file(
    staging: &Path,
    name: &str,
    device: &str,
    points: &[(i64, f64)],
    versions: &[u64],
) -> PathBuf {
    let scratch = TempDir::new().unwrap();
    let group = GroupBuilder::new("staging.sg")
        .with_data_root(scratch.path())
        .with_config(GroupConfig::default().with_ttl_check_interval(Duration::from_secs(3600)))
        .build()
        .unwrap();
    for (ts, value) in points {
        group
            .insert(&Record::single(device, "m1", *ts, *value))
            .unwrap();
    }
    group.sync_close_all();

    let produced = group.sequence_files()[0].clone();
    if !versions.is_empty() {
        produced.set_historical_versions(versions.iter().copied().collect());
        produced.write_resource_file().unwrap();
    }
    let original_name = produced.file_name();

    let inbox = staging.join(format!("{name}.inbox"));
    fs::create_dir_all(&inbox).unwrap();
    group.move_file(&original_name, &inbox).unwrap();
    group.close().unwrap();

    let src = inbox.join(&original_name);
    let dst = staging.join(name);
    fs::rename(&src, &dst).unwrap();
    fs::rename(
        format!("{}.resource", src.display()),
        format!("{}.resource", dst.display()),
    )
    .unwrap();
    let _ = fs::remove_dir(&inbox);
    dst
}

/// Plants a sealed file directly into the group's sequential layout, for
/// tests that need exact file names before the group is opened.
pub fn place_sequence_file(
    dir: &TempDir,
    name: &str,
    device: &str,
    points: &[(i64, f64)],
    versions: &[u64],
) {
    let staging = dir.path().join("staging");
    fs::create_dir_all(&staging).unwrap();
    let made = make_sealed_file(&staging, name, device, points, versions);

    let target_dir = dir
        .path()
        .join("data")
        .join("sequence")
        .join("root.sg")
        .join("0");
    fs::create_dir_all(&target_dir).unwrap();
    fs::rename(&made, target_dir.join(name)).unwrap();
    fs::rename(
        format!("{}.resource", made.display()),
        format!("{}.resource", target_dir.join(name).display()),
    )
    .unwrap();
}
