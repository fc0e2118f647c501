use std::time::Duration;

use tempfile::TempDir;
use tsvault::{DataPoint, GroupConfig, Record};

mod common;
use common::{open_group, wait_until};

#[test]
fn delete_writes_a_tombstone_into_sealed_files() {
    let dir = TempDir::new().unwrap();
    let group = open_group(&dir, GroupConfig::default());

    for (ts, value) in [(10, 1.0), (50, 2.0), (90, 3.0)] {
        group.insert(&Record::single("d1", "m1", ts, value)).unwrap();
    }
    group.sync_close_all();

    group.delete("d1", "m1", 60).unwrap();

    let seq = group.sequence_files();
    let mods = seq[0].modifications().unwrap();
    assert_eq!(mods.len(), 1);
    assert_eq!(mods[0].end_time(), 60);
    assert!(mods[0].matches("d1", "m1"));

    assert_eq!(
        seq[0].read_points("d1", "m1").unwrap(),
        vec![DataPoint::new(90, 3.0)]
    );

    group.close().unwrap();
}

#[test]
fn delete_skips_files_starting_after_the_bound() {
    let dir = TempDir::new().unwrap();
    let group = open_group(&dir, GroupConfig::default());

    group.insert(&Record::single("d1", "m1", 100, 1.0)).unwrap();
    group.sync_close_all();

    group.delete("d1", "m1", 50).unwrap();
    assert!(group.sequence_files()[0].modifications().unwrap().is_empty());

    group.close().unwrap();
}

#[test]
fn delete_reaches_the_memtable_of_unsealed_buffers() {
    let dir = TempDir::new().unwrap();
    let group = open_group(&dir, GroupConfig::default());

    group.insert(&Record::single("d1", "m1", 10, 1.0)).unwrap();
    group.insert(&Record::single("d1", "m1", 20, 2.0)).unwrap();

    group.delete("d1", "m1", 15).unwrap();

    let source = group.query("d1", "m1", 1, None, None).unwrap();
    assert_eq!(source.seq.len(), 1);
    let unsealed = source.seq[0].unsealed.as_ref().expect("buffer is unsealed");
    assert_eq!(unsealed.mem_points, vec![DataPoint::new(20, 2.0)]);

    group.sync_close_all();
    assert_eq!(
        group.sequence_files()[0].read_points("d1", "m1").unwrap(),
        vec![DataPoint::new(20, 2.0)]
    );

    group.close().unwrap();
}

#[test]
fn deletions_are_stamped_per_partition() {
    let dir = TempDir::new().unwrap();
    let config = GroupConfig::default()
        .with_partition_interval(1000)
        .with_concurrent_writing_partitions(2);
    let group = open_group(&dir, config);

    group.insert(&Record::single("d1", "m1", 100, 1.0)).unwrap();
    group.insert(&Record::single("d1", "m1", 1100, 2.0)).unwrap();
    group.sync_close_all();

    group.delete("d1", "m1", 1500).unwrap();

    let seq = group.sequence_files();
    assert_eq!(seq.len(), 2);
    let m0 = seq[0].modifications().unwrap();
    let m1 = seq[1].modifications().unwrap();
    assert_eq!(m0.len(), 1);
    assert_eq!(m1.len(), 1);
    // Versions are partition-local; the two stamps need not agree.
    assert_eq!(m0[0].end_time(), 1500);
    assert_eq!(m1[0].end_time(), 1500);

    group.close().unwrap();
}

#[test]
fn merge_folds_unsequential_files_into_sequential_ones() {
    let dir = TempDir::new().unwrap();
    let group = open_group(&dir, GroupConfig::default());

    group.insert(&Record::single("d1", "m1", 10, 1.0)).unwrap();
    group.insert(&Record::single("d1", "m1", 100, 2.0)).unwrap();
    group.sync_close_all();
    group.insert(&Record::single("d1", "m1", 50, 9.0)).unwrap();
    group.sync_close_all();
    assert_eq!(group.unsequence_files().len(), 1);

    group.merge(false).unwrap();
    assert!(wait_until(|| !group.is_merging(), Duration::from_secs(10)));

    assert!(group.unsequence_files().is_empty(), "unseq file is consumed");
    let seq = group.sequence_files();
    assert_eq!(seq.len(), 1);
    assert_eq!(
        seq[0].read_points("d1", "m1").unwrap(),
        vec![
            DataPoint::new(10, 1.0),
            DataPoint::new(50, 9.0),
            DataPoint::new(100, 2.0),
        ]
    );
    assert!(!group.system_dir().join("merge.mods").exists());
    assert!(!group.system_dir().join("merge.log").exists());

    group.close().unwrap();
}

#[test]
fn deletion_racing_a_merge_survives_in_the_new_sidecar() {
    let dir = TempDir::new().unwrap();
    let group = open_group(&dir, GroupConfig::default());

    group.insert(&Record::single("d1", "m1", 10, 1.0)).unwrap();
    group.insert(&Record::single("d1", "m1", 100, 2.0)).unwrap();
    group.sync_close_all();
    group.insert(&Record::single("d1", "m1", 50, 9.0)).unwrap();
    group.sync_close_all();

    group.merge(false).unwrap();
    // Whether this lands mid-merge (mirrored through merge.mods and copied
    // by the end action) or after, the sequential file must end up with
    // the tombstone.
    group.delete("d1", "m1", 60).unwrap();
    assert!(wait_until(|| !group.is_merging(), Duration::from_secs(10)));

    let seq = group.sequence_files();
    assert_eq!(seq.len(), 1);
    let mods = seq[0].modifications().unwrap();
    assert!(
        mods.iter().any(|d| d.end_time() == 60 && d.matches("d1", "m1")),
        "the deletion must survive the merge, got {mods:?}"
    );
    let points = seq[0].read_points("d1", "m1").unwrap();
    assert_eq!(points, vec![DataPoint::new(100, 2.0)]);

    assert!(group.unsequence_files().is_empty());
    assert!(!group.system_dir().join("merge.mods").exists());

    group.close().unwrap();
}

#[test]
fn merge_without_candidates_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let group = open_group(&dir, GroupConfig::default());

    group.insert(&Record::single("d1", "m1", 10, 1.0)).unwrap();
    group.sync_close_all();

    // Only sequential data: nothing to merge.
    group.merge(false).unwrap();
    assert!(!group.is_merging());
    assert_eq!(group.sequence_files().len(), 1);

    group.close().unwrap();
}

#[test]
fn merging_files_are_ineligible_for_ttl() {
    let dir = TempDir::new().unwrap();
    let group = open_group(&dir, GroupConfig::default());

    group.insert(&Record::single("d1", "m1", 10, 1.0)).unwrap();
    group.sync_close_all();

    let resource = group.sequence_files()[0].clone();
    resource.set_merging(true);

    group.set_data_ttl(1);
    assert_eq!(group.sequence_files().len(), 1, "merging file must survive");

    resource.set_merging(false);
    group.set_data_ttl(1);
    assert!(group.sequence_files().is_empty());

    group.close().unwrap();
}
