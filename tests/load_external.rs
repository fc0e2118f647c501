use std::fs;

use tempfile::TempDir;
use tsvault::resource::FileResource;
use tsvault::{DataPoint, GroupConfig, Record};

mod common;
use common::{make_sealed_file, open_group, place_sequence_file};

#[test]
fn overlapping_load_lands_in_the_unsequential_bucket() {
    let dir = TempDir::new().unwrap();
    place_sequence_file(&dir, "100-1-0.tsd", "d1", &[(10, 1.0), (30, 2.0)], &[]);
    let group = open_group(&dir, GroupConfig::default());

    let staged = make_sealed_file(
        &dir.path().join("incoming"),
        "200-7-0.tsd",
        "d1",
        &[(20, 5.0), (40, 6.0)],
        &[],
    );
    let resource = FileResource::staged(staged).unwrap();
    group.load(resource).unwrap();

    assert_eq!(group.sequence_files().len(), 1);
    let unseq = group.unsequence_files();
    assert_eq!(unseq.len(), 1);
    assert_eq!(unseq[0].file_name(), "200-7-0.tsd");
    assert_eq!(
        unseq[0].read_points("d1", "m1").unwrap(),
        vec![DataPoint::new(20, 5.0), DataPoint::new(40, 6.0)]
    );

    group.close().unwrap();
}

#[test]
fn fitting_load_keeps_its_name_between_neighbors() {
    let dir = TempDir::new().unwrap();
    place_sequence_file(&dir, "100-1-0.tsd", "d1", &[(10, 1.0), (20, 2.0)], &[]);
    place_sequence_file(&dir, "300-2-0.tsd", "d1", &[(50, 5.0), (60, 6.0)], &[]);
    let group = open_group(&dir, GroupConfig::default());

    let staged = make_sealed_file(
        &dir.path().join("incoming"),
        "250-5-0.tsd",
        "d1",
        &[(30, 3.0), (40, 4.0)],
        &[],
    );
    group.load(FileResource::staged(staged).unwrap()).unwrap();

    let names: Vec<String> = group
        .sequence_files()
        .iter()
        .map(|r| r.file_name())
        .collect();
    assert_eq!(names, vec!["100-1-0.tsd", "250-5-0.tsd", "300-2-0.tsd"]);

    group.close().unwrap();
}

#[test]
fn misnamed_load_is_renamed_to_the_midpoint() {
    let dir = TempDir::new().unwrap();
    place_sequence_file(&dir, "100-1-0.tsd", "d1", &[(10, 1.0), (20, 2.0)], &[]);
    place_sequence_file(&dir, "300-2-0.tsd", "d1", &[(50, 5.0), (60, 6.0)], &[]);
    let group = open_group(&dir, GroupConfig::default());

    // Fits between the neighbors by device range, but its name time (400)
    // does not; it takes the midpoint time and the successor's version.
    let staged = make_sealed_file(
        &dir.path().join("incoming"),
        "400-5-0.tsd",
        "d1",
        &[(30, 3.0), (40, 4.0)],
        &[],
    );
    group.load(FileResource::staged(staged).unwrap()).unwrap();

    let names: Vec<String> = group
        .sequence_files()
        .iter()
        .map(|r| r.file_name())
        .collect();
    assert_eq!(names, vec!["100-1-0.tsd", "200-2-0.tsd", "300-2-0.tsd"]);

    group.close().unwrap();
}

#[test]
fn loading_an_already_present_file_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    place_sequence_file(&dir, "100-1-0.tsd", "d1", &[(10, 1.0)], &[]);
    let group = open_group(&dir, GroupConfig::default());

    let staged = make_sealed_file(
        &dir.path().join("incoming"),
        "100-1-0.tsd",
        "d1",
        &[(99, 9.0)],
        &[],
    );
    group.load(FileResource::staged(staged.clone()).unwrap()).unwrap();

    assert_eq!(group.sequence_files().len(), 1);
    assert!(group.unsequence_files().is_empty());
    assert!(staged.exists(), "staged file must be left untouched");

    group.close().unwrap();
}

#[test]
fn load_for_sync_always_appends_sequentially() {
    let dir = TempDir::new().unwrap();
    let group = open_group(&dir, GroupConfig::default());

    let staged = make_sealed_file(
        &dir.path().join("incoming"),
        "100-1-0.tsd",
        "d1",
        &[(10, 1.0), (20, 2.0)],
        &[],
    );
    group.load_for_sync(FileResource::staged(staged).unwrap()).unwrap();

    assert_eq!(group.sequence_files().len(), 1);
    // The watermark now reflects the loaded data: an equal timestamp must
    // route unsequentially.
    assert_eq!(group.latest_flushed_time(0, "d1"), 20);
    group.insert(&Record::single("d1", "m1", 20, 9.0)).unwrap();
    let (seq_work, unseq_work) = group.working_partitions();
    assert!(seq_work.is_empty());
    assert_eq!(unseq_work, vec![0]);

    group.close().unwrap();
}

#[test]
fn duplicate_versions_are_detected_through_the_catalog() {
    let dir = TempDir::new().unwrap();
    place_sequence_file(&dir, "100-1-0.tsd", "d1", &[(10, 1.0)], &[1, 2, 3]);
    let group = open_group(&dir, GroupConfig::default());

    let staged = make_sealed_file(
        &dir.path().join("incoming"),
        "500-9-0.tsd",
        "d1",
        &[(100, 9.0)],
        &[1, 2],
    );
    let resource = FileResource::staged(staged).unwrap();

    assert!(group.is_file_already_present(&resource, 0));

    // Without the reduction feature the file is still placed as-is.
    group.load(resource).unwrap();
    assert_eq!(group.sequence_files().len(), 2);

    group.close().unwrap();
}

#[test]
fn reduction_drops_files_covered_by_the_loaded_one() {
    let dir = TempDir::new().unwrap();
    place_sequence_file(&dir, "100-1-0.tsd", "d1", &[(10, 1.0)], &[1, 2]);
    let group = open_group(
        &dir,
        GroupConfig::default().with_reduce_overlap_on_load(true),
    );
    let superseded_path = group.sequence_files()[0].path();

    let staged = make_sealed_file(
        &dir.path().join("incoming"),
        "500-9-0.tsd",
        "d1",
        &[(100, 9.0)],
        &[1, 2, 3],
    );
    group.load(FileResource::staged(staged).unwrap()).unwrap();

    let names: Vec<String> = group
        .sequence_files()
        .iter()
        .map(|r| r.file_name())
        .collect();
    assert_eq!(names, vec!["500-9-0.tsd"]);
    assert!(!superseded_path.exists(), "superseded file must be removed");

    group.close().unwrap();
}

#[test]
fn delete_file_removes_a_named_file_from_disk_and_index() {
    let dir = TempDir::new().unwrap();
    let group = open_group(&dir, GroupConfig::default());

    group.insert(&Record::single("d1", "m1", 10, 1.0)).unwrap();
    group.sync_close_all();
    let resource = group.sequence_files()[0].clone();
    let name = resource.file_name();
    let path = resource.path();

    assert!(group.delete_file(&name));
    assert!(group.sequence_files().is_empty());
    assert!(!path.exists());
    assert!(!fs::exists(format!("{}.resource", path.display())).unwrap());

    assert!(!group.delete_file(&name), "second removal finds nothing");
    group.close().unwrap();
}

#[test]
fn teardown_wipes_every_group_folder() {
    let dir = TempDir::new().unwrap();
    let group = open_group(&dir, GroupConfig::default());

    group.insert(&Record::single("d1", "m1", 10, 1.0)).unwrap();
    group.sync_close_all();
    group.insert(&Record::single("d1", "m1", 5, 2.0)).unwrap();
    group.sync_close_all();

    group.sync_delete_data_files();
    assert!(group.sequence_files().is_empty());
    assert!(group.unsequence_files().is_empty());
    assert!(!dir.path().join("data").join("sequence").join("root.sg").exists());
    assert!(!dir.path().join("data").join("unsequence").join("root.sg").exists());

    group.close().unwrap();
}
