use std::fs;
use std::io::Write;
use std::time::Duration;

use tempfile::TempDir;
use tsvault::{DataPoint, GroupConfig, Record};

mod common;
use common::open_group;

#[test]
fn restart_restores_files_and_watermarks() {
    let dir = TempDir::new().unwrap();
    {
        let group = open_group(&dir, GroupConfig::default());
        group.insert(&Record::single("d1", "m1", 10, 1.0)).unwrap();
        group.insert(&Record::single("d1", "m1", 20, 2.0)).unwrap();
        group.sync_close_all();
        group.insert(&Record::single("d1", "m1", 5, 3.0)).unwrap();
        group.sync_close_all();
        group.close().unwrap();
    }

    let group = open_group(&dir, GroupConfig::default());
    let seq = group.sequence_files();
    let unseq = group.unsequence_files();
    assert_eq!(seq.len(), 1);
    assert_eq!(unseq.len(), 1);
    assert_eq!(
        seq[0].read_points("d1", "m1").unwrap(),
        vec![DataPoint::new(10, 1.0), DataPoint::new(20, 2.0)]
    );
    assert_eq!(
        unseq[0].read_points("d1", "m1").unwrap(),
        vec![DataPoint::new(5, 3.0)]
    );

    // The flushed watermark survives, so routing still treats old
    // timestamps as unsequential.
    assert_eq!(group.latest_flushed_time(0, "d1"), 20);
    group.insert(&Record::single("d1", "m1", 15, 9.0)).unwrap();
    let (seq_work, unseq_work) = group.working_partitions();
    assert!(seq_work.is_empty());
    assert_eq!(unseq_work, vec![0]);

    group.insert(&Record::single("d1", "m1", 25, 9.0)).unwrap();
    let (seq_work, _) = group.working_partitions();
    assert_eq!(seq_work, vec![0]);

    group.close().unwrap();
}

#[test]
fn unsealed_file_with_torn_tail_is_reopened_writable() {
    let dir = TempDir::new().unwrap();
    let data_path;
    {
        let group = open_group(&dir, GroupConfig::default());
        group.insert(&Record::single("d1", "m1", 10, 1.0)).unwrap();
        group.insert(&Record::single("d1", "m1", 20, 2.0)).unwrap();
        group.sync_close_all();
        data_path = group.sequence_files()[0].path();
        group.close().unwrap();
    }

    // Simulate a crash mid-flush: garbage after the last chunk and no
    // sidecar, as if the file was never sealed.
    fs::remove_file(format!("{}.resource", data_path.display())).unwrap();
    let mut file = fs::OpenOptions::new().append(true).open(&data_path).unwrap();
    file.write_all(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
    file.sync_all().unwrap();

    let group = open_group(&dir, GroupConfig::default());
    let seq = group.sequence_files();
    assert_eq!(seq.len(), 1);
    assert!(!seq[0].is_closed(), "last file must come back writable");
    assert_eq!(
        seq[0].read_points("d1", "m1").unwrap(),
        vec![DataPoint::new(10, 1.0), DataPoint::new(20, 2.0)]
    );

    let (seq_work, _) = group.working_partitions();
    assert_eq!(seq_work, vec![0]);

    // The recovered buffer keeps accepting rows and seals cleanly.
    group.insert(&Record::single("d1", "m1", 30, 3.0)).unwrap();
    group.sync_close_all();
    assert_eq!(
        group.sequence_files()[0].read_points("d1", "m1").unwrap(),
        vec![
            DataPoint::new(10, 1.0),
            DataPoint::new(20, 2.0),
            DataPoint::new(30, 3.0),
        ]
    );
    group.close().unwrap();
}

#[test]
fn pending_renames_are_replayed_at_startup() {
    let dir = TempDir::new().unwrap();
    let partition_dir;
    {
        let group = open_group(&dir, GroupConfig::default());
        group.insert(&Record::single("d1", "m1", 10, 1.0)).unwrap();
        group.sync_close_all();
        partition_dir = group.sequence_files()[0].path().parent().unwrap().to_path_buf();
        group.close().unwrap();
    }

    // A temp sidecar whose target survived the crash must be dropped.
    let existing = fs::read_dir(&partition_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().map(|e| e == "tsd").unwrap_or(false))
        .unwrap();
    let stale_temp = format!("{}.temp", existing.display());
    fs::write(&stale_temp, b"stale").unwrap();

    let group = open_group(&dir, GroupConfig::default());
    assert!(!fs::exists(&stale_temp).unwrap());
    assert_eq!(group.sequence_files().len(), 1);
    group.close().unwrap();
}

#[test]
fn non_numeric_partition_directories_are_skipped() {
    let dir = TempDir::new().unwrap();
    {
        let group = open_group(&dir, GroupConfig::default());
        group.insert(&Record::single("d1", "m1", 10, 1.0)).unwrap();
        group.sync_close_all();
        group.close().unwrap();
    }

    let rogue = dir
        .path()
        .join("data")
        .join("sequence")
        .join("root.sg")
        .join("not-a-partition");
    fs::create_dir_all(&rogue).unwrap();
    fs::write(rogue.join("999-9-0.tsd"), b"garbage").unwrap();

    let group = open_group(&dir, GroupConfig::default());
    assert_eq!(group.sequence_files().len(), 1);
    group.close().unwrap();
}

#[test]
fn corrupt_sidecar_is_logged_and_skipped() {
    let dir = TempDir::new().unwrap();
    let sidecar;
    {
        let group = open_group(&dir, GroupConfig::default());
        group.insert(&Record::single("d1", "m1", 10, 1.0)).unwrap();
        group.insert(&Record::single("d2", "m1", 10, 1.0)).unwrap();
        group.sync_close_all();
        group.insert(&Record::single("d1", "m1", 30, 2.0)).unwrap();
        group.sync_close_all();
        sidecar = group.sequence_files()[0].resource_path();
        group.close().unwrap();
    }

    fs::write(&sidecar, b"{ not json").unwrap();

    let group = open_group(&dir, GroupConfig::default());
    // The file with the broken sidecar is skipped, the other survives.
    assert_eq!(group.sequence_files().len(), 1);
    group.close().unwrap();
}

#[test]
fn orphan_merge_log_is_removed_at_startup() {
    let dir = TempDir::new().unwrap();
    let sys_group_dir = dir.path().join("system").join("root.sg");
    fs::create_dir_all(&sys_group_dir).unwrap();
    fs::write(sys_group_dir.join("merge.log"), b"{}").unwrap();

    let group = open_group(&dir, GroupConfig::default());
    assert!(!sys_group_dir.join("merge.log").exists());
    group.close().unwrap();
}

#[test]
fn stale_merging_mods_is_discarded_when_resume_is_off() {
    let dir = TempDir::new().unwrap();
    let sys_group_dir = dir.path().join("system").join("root.sg");
    fs::create_dir_all(&sys_group_dir).unwrap();
    fs::write(sys_group_dir.join("merge.mods"), b"").unwrap();
    fs::write(sys_group_dir.join("merge.log"), b"{}").unwrap();

    let group = open_group(
        &dir,
        GroupConfig::default().with_continue_merge_after_reboot(false),
    );
    assert!(!sys_group_dir.join("merge.mods").exists());
    assert!(!sys_group_dir.join("merge.log").exists());
    assert!(!group.is_merging());

    // A deletion after discard must not try to mirror anywhere.
    group.insert(&Record::single("d1", "m1", 10, 1.0)).unwrap();
    group.delete("d1", "m1", 5).unwrap();
    group.close().unwrap();
}

#[test]
fn sync_close_all_is_idempotent_and_fast_when_empty() {
    let dir = TempDir::new().unwrap();
    let group = open_group(&dir, GroupConfig::default());
    let started = std::time::Instant::now();
    group.sync_close_all();
    group.sync_close_all();
    assert!(started.elapsed() < Duration::from_secs(5));
    group.close().unwrap();
}
