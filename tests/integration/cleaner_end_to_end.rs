//! End-to-end cleaning: selection by utilization, migration of live
//! records, checkpoint-gated deletion, and fatal corruption handling.

mod common;

use std::io::{Seek, SeekFrom, Write};

use umbra_cleaner::error::EngineError;
use umbra_cleaner::log::HEADER_BYTES;
use umbra_cleaner::{CleanerConfig, DatabaseId};

use common::{create_env, test_config};

const DB: DatabaseId = DatabaseId(1);

#[test]
fn low_utilization_file_is_cleaned_and_deleted() {
    let (_dir, env) = create_env(test_config());
    env.register_db(DB);

    for i in 0..10u32 {
        let key = format!("key{i:02}");
        env.put(DB, key.as_bytes(), format!("value-{i}").as_bytes())
            .unwrap();
    }
    for i in 0..6u32 {
        let key = format!("key{i:02}");
        env.delete(DB, key.as_bytes()).unwrap();
    }
    env.file_manager().force_rotate().unwrap();

    let cleaned = env.cleaner().clean().unwrap();
    assert_eq!(cleaned, 1);
    let stats = env.cleaner().stats();
    assert_eq!(stats.files_cleaned, 1);
    assert_eq!(stats.lns_migrated, 4);
    // 6 superseded copies plus 6 tombstones.
    assert_eq!(stats.lns_dead, 12);

    // The file survives until a checkpoint makes the migrations durable.
    assert!(env.file_manager().file_path(0).exists());
    env.checkpoint().unwrap();
    assert!(!env.file_manager().file_path(0).exists());
    assert_eq!(env.cleaner().stats().files_deleted, 1);
    assert!(env.profile().summary(0).is_none());

    // Live records are intact, deleted ones stay gone.
    for i in 0..10u32 {
        let key = format!("key{i:02}");
        let value = env.get(DB, key.as_bytes()).unwrap();
        if i < 6 {
            assert_eq!(value, None);
        } else {
            assert_eq!(value, Some(format!("value-{i}").into_bytes()));
        }
    }

    // Nothing left worth cleaning.
    assert_eq!(env.cleaner().clean().unwrap(), 0);
}

#[test]
fn well_utilized_file_is_left_alone() {
    let (_dir, env) = create_env(test_config());
    env.register_db(DB);

    for i in 0..10u32 {
        env.put(DB, format!("key{i:02}").as_bytes(), b"still live")
            .unwrap();
    }
    env.delete(DB, b"key00").unwrap();
    env.file_manager().force_rotate().unwrap();

    assert_eq!(env.cleaner().clean().unwrap(), 0);
    assert!(env.file_manager().file_path(0).exists());
    assert!(env.profile().utilization(0) > 0.5);

    // Forced cleaning bypasses the utilization gate.
    assert_eq!(env.cleaner().force_clean().unwrap(), 1);
    assert_eq!(env.cleaner().stats().lns_migrated, 9);
    env.checkpoint().unwrap();
    assert!(!env.file_manager().file_path(0).exists());
}

#[test]
fn explicit_queue_overrides_the_threshold() {
    let (_dir, env) = create_env(test_config());
    env.register_db(DB);

    for i in 0..10u32 {
        env.put(DB, format!("key{i:02}").as_bytes(), b"still live")
            .unwrap();
    }
    env.file_manager().force_rotate().unwrap();

    env.cleaner().selector().set_to_be_cleaned(&[0]);
    assert_eq!(env.cleaner().clean().unwrap(), 1);
    assert_eq!(env.cleaner().stats().lns_migrated, 10);
    env.checkpoint().unwrap();
    assert!(!env.file_manager().file_path(0).exists());
}

#[test]
fn queued_append_file_is_never_cleaned_or_deleted() {
    let (_dir, env) = create_env(test_config());
    env.register_db(DB);
    env.put(DB, b"only", b"copy").unwrap();

    // Queue the file the log is still appending to. It must stay queued
    // and untouched until the log rolls over.
    let current = env.file_manager().current_file();
    env.cleaner().selector().set_to_be_cleaned(&[current]);
    assert_eq!(env.cleaner().clean().unwrap(), 0);
    assert_eq!(env.cleaner().selector().must_be_cleaned_files(), vec![current]);
    env.checkpoint().unwrap();
    assert!(env.file_manager().file_path(current).exists());
    assert_eq!(env.get(DB, b"only").unwrap(), Some(b"copy".to_vec()));

    env.file_manager().force_rotate().unwrap();
    assert_eq!(env.cleaner().clean().unwrap(), 1);
    assert_eq!(env.cleaner().stats().lns_migrated, 1);
    env.checkpoint().unwrap();
    assert!(!env.file_manager().file_path(current).exists());
    assert_eq!(env.get(DB, b"only").unwrap(), Some(b"copy".to_vec()));
}

#[test]
fn expunge_disabled_renames_instead_of_deleting() {
    let config = CleanerConfig {
        expunge: false,
        ..test_config()
    };
    let (_dir, env) = create_env(config);
    env.register_db(DB);

    for i in 0..8u32 {
        env.put(DB, format!("key{i}").as_bytes(), b"v").unwrap();
    }
    for i in 0..6u32 {
        env.delete(DB, format!("key{i}").as_bytes()).unwrap();
    }
    env.file_manager().force_rotate().unwrap();

    assert_eq!(env.cleaner().clean().unwrap(), 1);
    env.checkpoint().unwrap();
    assert!(!env.file_manager().file_path(0).exists());
    assert!(env.file_manager().del_path(0).exists());
    assert_eq!(env.cleaner().stats().files_deleted, 1);
}

#[test]
fn duplicate_count_records_are_migrated() {
    let (_dir, env) = create_env(test_config());
    env.register_db(DB);

    env.put_dup(DB, b"fruit", b"apple", b"red").unwrap();
    env.put_dup(DB, b"fruit", b"pear", b"green").unwrap();
    // Churn to drag the file below the threshold.
    for i in 0..6u32 {
        env.put(DB, format!("churn{i}").as_bytes(), b"x").unwrap();
        env.delete(DB, format!("churn{i}").as_bytes()).unwrap();
    }
    env.file_manager().force_rotate().unwrap();

    assert_eq!(env.cleaner().clean().unwrap(), 1);
    // Two duplicate records plus the live count record.
    assert_eq!(env.cleaner().stats().lns_migrated, 3);

    env.checkpoint().unwrap();
    assert!(!env.file_manager().file_path(0).exists());
    let dup_node = env.tree().dup_count_node(DB, b"fruit").unwrap();
    let state = dup_node.latch();
    assert!(state.lsn.file() >= 1);
    assert_eq!(state.resident_count, Some(2));
}

#[test]
fn corruption_during_a_pass_is_fatal_and_requeues_the_file() {
    let (_dir, env) = create_env(test_config());
    env.register_db(DB);

    let mut first_ln = None;
    for i in 0..8u32 {
        let lsn = env
            .put(DB, format!("key{i}").as_bytes(), b"payload-bytes")
            .unwrap();
        first_ln.get_or_insert(lsn);
    }
    for i in 0..6u32 {
        env.delete(DB, format!("key{i}").as_bytes()).unwrap();
    }
    env.file_manager().force_rotate().unwrap();

    // Flip one payload byte of the first record.
    let target = u64::from(first_ln.unwrap().offset()) + HEADER_BYTES as u64 + 2;
    let path = env.file_manager().file_path(0);
    let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(target)).unwrap();
    file.write_all(&[0xFF]).unwrap();
    file.sync_all().unwrap();

    let err = env.cleaner().clean().unwrap_err();
    assert!(err.is_checksum_class(), "unexpected error: {err}");

    // The pass failed, so the file is requeued and never deleted.
    assert!(env.file_manager().file_path(0).exists());
    assert_eq!(env.cleaner().selector().must_be_cleaned_files(), vec![0]);
    assert_eq!(env.cleaner().stats().files_deleted, 0);

    // The environment is now unusable until recovery.
    let err = env.put(DB, b"later", b"write").unwrap_err();
    assert!(matches!(err, EngineError::EnvironmentInvalid(_)));
}

#[test]
fn overlapping_checkpoint_snapshots_are_rejected() {
    let (_dir, env) = create_env(test_config());
    env.register_db(DB);

    for i in 0..8u32 {
        env.put(DB, format!("key{i}").as_bytes(), b"v").unwrap();
    }
    for i in 0..6u32 {
        env.delete(DB, format!("key{i}").as_bytes()).unwrap();
    }
    env.file_manager().force_rotate().unwrap();
    assert_eq!(env.cleaner().clean().unwrap(), 1);

    let snapshot = env.cleaner().files_at_checkpoint_start().unwrap();
    assert!(snapshot.is_some());
    let second = env.cleaner().files_at_checkpoint_start();
    assert!(matches!(second, Err(EngineError::InvalidArgument(_))));
    env.cleaner().files_at_checkpoint_end(snapshot).unwrap();
    assert!(!env.file_manager().file_path(0).exists());
}

#[test]
fn abandoned_snapshot_does_not_wedge_later_checkpoints() {
    let (_dir, env) = create_env(test_config());
    env.register_db(DB);

    for i in 0..8u32 {
        env.put(DB, format!("key{i}").as_bytes(), b"v").unwrap();
    }
    for i in 0..6u32 {
        env.delete(DB, format!("key{i}").as_bytes()).unwrap();
    }
    env.file_manager().force_rotate().unwrap();
    assert_eq!(env.cleaner().clean().unwrap(), 1);

    // A checkpoint that dies between start and end drops its snapshot.
    let snapshot = env.cleaner().files_at_checkpoint_start().unwrap();
    assert!(snapshot.is_some());
    drop(snapshot);

    // The next full checkpoint proceeds and deletes the file.
    env.checkpoint().unwrap();
    assert!(!env.file_manager().file_path(0).exists());
    assert_eq!(env.cleaner().stats().files_deleted, 1);
}
