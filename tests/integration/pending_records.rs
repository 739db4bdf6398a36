//! Pending-record and pending-database handling: deferred migrations must
//! keep their files alive until resolved, across locks, database
//! deletions, and multi-process environment locks.

mod common;

use std::collections::{HashMap, HashSet};

use fs2::FileExt;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use umbra_cleaner::env::lock_file_path;
use umbra_cleaner::error::EngineError;
use umbra_cleaner::DatabaseId;

use common::{create_env, node_id_of, test_config};

const DB: DatabaseId = DatabaseId(1);

fn churn_below_threshold(env: &umbra_cleaner::Environment, db: DatabaseId) {
    for i in 0..8u32 {
        env.put(db, format!("churn{i}").as_bytes(), b"gone soon").unwrap();
        env.delete(db, format!("churn{i}").as_bytes()).unwrap();
    }
}

#[test]
fn locked_record_defers_migration_and_blocks_deletion() {
    let (_dir, env) = create_env(test_config());
    env.register_db(DB);

    env.put(DB, b"held", b"locked value").unwrap();
    env.put(DB, b"free", b"movable value").unwrap();
    churn_below_threshold(&env, DB);

    let held_node = node_id_of(&env, DB, b"held");
    let guard = env.locks().try_write_lock(held_node).unwrap();
    env.file_manager().force_rotate().unwrap();

    assert_eq!(env.cleaner().clean().unwrap(), 1);
    let stats = env.cleaner().stats();
    assert_eq!(stats.lns_migrated, 1);
    assert_eq!(stats.lns_locked, 1);
    assert_eq!(stats.lns_marked_pending, 1);
    let pending = env.cleaner().selector().pending_lns();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].node_id, held_node);
    assert_eq!(pending[0].file, 0);

    // Checkpoint cannot release the file while the record is pending.
    env.checkpoint().unwrap();
    assert!(env.file_manager().file_path(0).exists());
    assert!(env.cleaner().selector().copy_safe_to_delete_files().is_empty());

    // Lock released: the retry pass migrates it, the next checkpoint
    // deletes the file.
    drop(guard);
    env.cleaner().process_pending().unwrap();
    assert!(env.cleaner().selector().pending_lns().is_empty());
    assert_eq!(env.cleaner().stats().lns_migrated, 2);
    env.checkpoint().unwrap();
    assert!(!env.file_manager().file_path(0).exists());
    assert_eq!(env.get(DB, b"held").unwrap(), Some(b"locked value".to_vec()));
}

#[test]
fn pending_database_blocks_graduation_until_committed() {
    let doomed = DatabaseId(2);
    let (_dir, env) = create_env(test_config());
    env.register_db(DB);
    env.register_db(doomed);

    env.put(DB, b"keep", b"live").unwrap();
    env.put(doomed, b"orphan", b"in doomed db").unwrap();
    churn_below_threshold(&env, DB);
    env.start_db_delete(doomed);
    env.file_manager().force_rotate().unwrap();

    assert_eq!(env.cleaner().clean().unwrap(), 1);
    assert_eq!(env.cleaner().selector().pending_dbs(), vec![doomed]);

    env.checkpoint().unwrap();
    assert!(env.file_manager().file_path(0).exists());

    env.finish_db_delete(doomed);
    env.checkpoint().unwrap();
    assert!(!env.file_manager().file_path(0).exists());
    assert_eq!(env.get(DB, b"keep").unwrap(), Some(b"live".to_vec()));
}

#[test]
fn foreign_environment_lock_skips_deletion() {
    let (dir, env) = create_env(test_config());
    env.register_db(DB);

    env.put(DB, b"keep", b"live").unwrap();
    churn_below_threshold(&env, DB);
    env.file_manager().force_rotate().unwrap();
    assert_eq!(env.cleaner().clean().unwrap(), 1);

    // Another process holds the environment open.
    let foreign = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_file_path(dir.path()))
        .unwrap();
    foreign.try_lock_shared().unwrap();

    env.checkpoint().unwrap();
    assert!(env.file_manager().file_path(0).exists());
    assert_eq!(env.cleaner().selector().copy_safe_to_delete_files(), vec![0]);
    assert_eq!(env.cleaner().stats().files_deleted, 0);

    FileExt::unlock(&foreign).unwrap();
    env.cleaner().delete_safe_files().unwrap();
    assert!(!env.file_manager().file_path(0).exists());
    assert_eq!(env.cleaner().stats().files_deleted, 1);
}

#[test]
fn randomized_interleaving_never_deletes_a_referenced_file() {
    let (_dir, env) = create_env(test_config());
    env.register_db(DB);

    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
    let mut held: HashMap<Vec<u8>, umbra_cleaner::txn::WriteLockGuard> = HashMap::new();

    for round in 0..400u32 {
        let key = format!("key{:02}", rng.gen_range(0..20)).into_bytes();
        match rng.gen_range(0..10) {
            0..=4 => {
                let value = format!("value-{round}").into_bytes();
                match env.put(DB, &key, &value) {
                    Ok(_) => {
                        model.insert(key, value);
                    }
                    Err(EngineError::LockDenied(_)) => {}
                    Err(err) => panic!("put failed: {err}"),
                }
            }
            5..=6 => match env.delete(DB, &key) {
                Ok(()) => {
                    model.remove(&key);
                }
                Err(EngineError::LockDenied(_) | EngineError::NotFound(_)) => {}
                Err(err) => panic!("delete failed: {err}"),
            },
            7 => {
                // Toggle a test-held record lock.
                if held.remove(&key).is_none() {
                    if let Some(location) = env.tree().locate_parent_slot(DB, &key, None, 0) {
                        let node_id = {
                            let state = location.bin.latch();
                            state.slots[location.index].node_id
                        };
                        if let Some(lock) = env.locks().try_write_lock(node_id) {
                            held.insert(key, lock);
                        }
                    }
                }
            }
            8 => {
                if rng.gen_bool(0.3) {
                    env.file_manager().force_rotate().unwrap();
                }
                env.cleaner().clean().unwrap();
            }
            _ => {
                env.checkpoint().unwrap();
                // Evict a few resident values to force log reads later.
                for bin in env.tree().bins(DB) {
                    let mut state = bin.latch();
                    for index in 0..state.slots.len() {
                        if rng.gen_bool(0.2) {
                            env.cleaner().evict_ln(&mut state, index);
                        }
                    }
                }
            }
        }

        let pending_files: HashSet<u32> = env
            .cleaner()
            .selector()
            .pending_lns()
            .iter()
            .map(|p| p.file)
            .collect();
        for file in env.cleaner().selector().copy_safe_to_delete_files() {
            assert!(
                !pending_files.contains(&file),
                "file {file} is safe-to-delete but still referenced by a pending record"
            );
            assert!(env.file_manager().file_path(file).exists());
        }
    }

    // Settle everything and verify the surviving data.
    held.clear();
    env.cleaner().process_pending().unwrap();
    env.checkpoint().unwrap();
    assert!(env.cleaner().selector().pending_lns().is_empty());
    for (key, value) in &model {
        assert_eq!(
            env.get(DB, key).unwrap().as_ref(),
            Some(value),
            "lost record {}",
            String::from_utf8_lossy(key)
        );
    }
    for i in 0..20u32 {
        let key = format!("key{i:02}").into_bytes();
        if !model.contains_key(&key) {
            assert_eq!(env.get(DB, &key).unwrap(), None);
        }
    }
}
