//! Environment: shared engine state, the multi-process advisory lock, and
//! a minimal write/read surface that exercises the cleaner.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use fs2::FileExt;
use parking_lot::Mutex;
use tracing::warn;

use crate::cleaner::{Cleaner, UtilizationProfile, UtilizationTracker};
use crate::config::{CleanerConfig, EnvLockMode};
use crate::error::{EngineError, Result};
use crate::log::manager::FileManager;
use crate::log::{LnEntry, LogEntryType, Lsn, HEADER_BYTES};
use crate::tree::{BinSlot, DatabaseId, DbRegistry, Tree};
use crate::txn::LockManager;

/// Name of the advisory lock file inside the environment directory.
pub const ENV_LOCK_FILE: &str = "env.lock";

/// Path of the advisory lock file for an environment directory.
pub fn lock_file_path(dir: &Path) -> PathBuf {
    dir.join(ENV_LOCK_FILE)
}

/// Shared run-state flags consulted on every log and cleaner operation.
///
/// Once `invalidate` fires the environment stays unusable until recovery;
/// every subsequent operation fails with [`EngineError::EnvironmentInvalid`].
#[derive(Debug, Default)]
pub struct EnvState {
    invalid: AtomicBool,
    invalid_reason: Mutex<Option<String>>,
    closing: AtomicBool,
    read_only: AtomicBool,
}

impl EnvState {
    /// Fresh, valid state.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails when a prior fatal error invalidated the environment.
    pub fn check_if_invalid(&self) -> Result<()> {
        if self.invalid.load(Ordering::Acquire) {
            let reason = self
                .invalid_reason
                .lock()
                .clone()
                .unwrap_or_else(|| "unknown".into());
            return Err(EngineError::EnvironmentInvalid(reason));
        }
        Ok(())
    }

    /// Marks the environment invalid. The first reason wins and is logged
    /// once.
    pub fn invalidate(&self, reason: &str) {
        if self
            .invalid
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.invalid_reason.lock() = Some(reason.to_string());
            warn!(reason, "env.invalidated");
        }
    }

    /// True once shutdown has begun.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Begins shutdown: in-flight cleaning stops between files.
    pub fn set_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    /// True when the environment must not write (read-only or invalid).
    pub fn may_not_write(&self) -> bool {
        self.read_only.load(Ordering::Acquire) || self.invalid.load(Ordering::Acquire)
    }

    /// Toggles read-only mode.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }
}

/// Advisory whole-environment lock taken before files are deleted.
///
/// Deletion fails closed: if another process holds the environment open
/// (or the lock cannot be determined) the files simply stay for a later
/// attempt.
#[derive(Debug)]
pub struct EnvironmentLock {
    mode: EnvLockMode,
    path: PathBuf,
}

impl EnvironmentLock {
    /// Lock over the environment at `dir`.
    pub fn new(dir: &Path, mode: EnvLockMode) -> Self {
        EnvironmentLock {
            mode,
            path: lock_file_path(dir),
        }
    }

    /// Attempts the exclusive lock without blocking. `None` means another
    /// process holds it.
    pub fn try_exclusive(&self) -> Result<Option<EnvLockGuard>> {
        match self.mode {
            EnvLockMode::Disabled => Ok(Some(EnvLockGuard { file: None })),
            EnvLockMode::Advisory => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&self.path)?;
                match file.try_lock_exclusive() {
                    Ok(()) => Ok(Some(EnvLockGuard { file: Some(file) })),
                    Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }
}

/// Held while the exclusive environment lock is owned; unlocks on drop.
#[derive(Debug)]
pub struct EnvLockGuard {
    file: Option<File>,
}

impl Drop for EnvLockGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = FileExt::unlock(file);
        }
    }
}

/// A storage environment: the log, the index, and the cleaner over them.
///
/// The write surface here is deliberately small (put, delete, duplicate
/// put); it exists to drive obsolescence into the log the same way a full
/// transaction layer would.
#[derive(Debug)]
pub struct Environment {
    config: CleanerConfig,
    state: Arc<EnvState>,
    tracker: Arc<UtilizationTracker>,
    profile: Arc<UtilizationProfile>,
    file_manager: Arc<FileManager>,
    tree: Arc<Tree>,
    locks: Arc<LockManager>,
    registry: Arc<DbRegistry>,
    cleaner: Arc<Cleaner>,
    next_node_id: AtomicU64,
}

impl Environment {
    /// Creates a new environment in `dir`.
    pub fn create(dir: &Path, config: CleanerConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let state = EnvState::new();
        let profile = UtilizationProfile::new();
        let tracker =
            UtilizationTracker::new(Arc::clone(&profile), config.effective_bytes_interval());
        let file_manager =
            FileManager::create(dir, &config, Arc::clone(&state), Arc::clone(&tracker))?;
        let tree = Tree::new();
        let locks = LockManager::new();
        let registry = DbRegistry::new();
        let env_lock = EnvironmentLock::new(dir, config.env_lock);
        let cleaner = Cleaner::new(
            config.clone(),
            Arc::clone(&state),
            Arc::clone(&file_manager),
            Arc::clone(&tree),
            Arc::clone(&locks),
            Arc::clone(&registry),
            Arc::clone(&tracker),
            Arc::clone(&profile),
            env_lock,
        );
        Ok(Arc::new(Environment {
            config,
            state,
            tracker,
            profile,
            file_manager,
            tree,
            locks,
            registry,
            cleaner,
            next_node_id: AtomicU64::new(1),
        }))
    }

    /// The cleaner bound to this environment.
    pub fn cleaner(&self) -> &Arc<Cleaner> {
        &self.cleaner
    }

    /// The in-memory index.
    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    /// The log layer.
    pub fn file_manager(&self) -> &Arc<FileManager> {
        &self.file_manager
    }

    /// The per-file utilization profile.
    pub fn profile(&self) -> &Arc<UtilizationProfile> {
        &self.profile
    }

    /// The record lock table.
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Shared run-state flags.
    pub fn state(&self) -> &Arc<EnvState> {
        &self.state
    }

    /// Effective configuration.
    pub fn config(&self) -> &CleanerConfig {
        &self.config
    }

    fn next_node_id(&self) -> u64 {
        self.next_node_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a database so its records are judged live.
    pub fn register_db(&self, db: DatabaseId) {
        self.registry.register(db);
    }

    /// Begins removing a database. Until [`Environment::finish_db_delete`]
    /// runs, cleaned files referencing it cannot be deleted.
    pub fn start_db_delete(&self, db: DatabaseId) {
        self.registry.start_delete(db);
    }

    /// Commits a database removal; its records become dead everywhere.
    pub fn finish_db_delete(&self, db: DatabaseId) {
        self.registry.finish_delete(db);
        self.cleaner.selector().remove_pending_db(db);
    }

    /// Writes or overwrites a record, returning its log location.
    pub fn put(&self, db: DatabaseId, key: &[u8], value: &[u8]) -> Result<Lsn> {
        self.put_internal(db, key, None, value)
    }

    /// Writes a record under a duplicate key and re-logs the duplicate
    /// count for the main key.
    pub fn put_dup(
        &self,
        db: DatabaseId,
        key: &[u8],
        dup_key: &[u8],
        value: &[u8],
    ) -> Result<Lsn> {
        let lsn = self.put_internal(db, key, Some(dup_key), value)?;

        // Update the duplicate count record. The superseded count entry
        // becomes obsolete immediately.
        let (node_id, old) = match self.tree.dup_count_node(db, key) {
            Some(node) => {
                let state = node.latch();
                (
                    state.node_id,
                    Some((state.lsn, state.entry_size, state.resident_count.unwrap_or(0))),
                )
            }
            None => (self.next_node_id(), None),
        };
        let count = old.map_or(1, |(_, _, count)| count + 1);
        let entry = LnEntry {
            db,
            node_id,
            deleted: false,
            key: key.to_vec(),
            dup_key: None,
            value: count.to_be_bytes().to_vec(),
        };
        let payload = entry.encode();
        let count_lsn = self.file_manager.append(LogEntryType::DupCountLn, &payload)?;
        let entry_size = (HEADER_BYTES + payload.len()) as u32;
        self.tree
            .ensure_dup_node(db, key, node_id, count_lsn, entry_size, count);
        if let Some((old_lsn, old_size, _)) = old {
            self.tracker.count_obsolete(old_lsn.file(), u64::from(old_size));
        }
        Ok(lsn)
    }

    fn put_internal(
        &self,
        db: DatabaseId,
        key: &[u8],
        dup_key: Option<&[u8]>,
        value: &[u8],
    ) -> Result<Lsn> {
        self.state.check_if_invalid()?;
        let node_id = match self.tree.locate_parent_slot(db, key, dup_key, 0) {
            Some(location) => location.bin.latch().slots[location.index].node_id,
            None => self.next_node_id(),
        };
        let _guard = self
            .locks
            .try_write_lock(node_id)
            .ok_or(EngineError::LockDenied(node_id))?;

        let entry = LnEntry {
            db,
            node_id,
            deleted: false,
            key: key.to_vec(),
            dup_key: dup_key.map(<[u8]>::to_vec),
            value: value.to_vec(),
        };
        let payload = entry.encode();
        let lsn = self.file_manager.append(LogEntryType::Ln, &payload)?;
        let slot = BinSlot {
            key: key.to_vec(),
            dup_key: dup_key.map(<[u8]>::to_vec),
            node_id,
            lsn,
            entry_size: (HEADER_BYTES + payload.len()) as u32,
            migrate: false,
            resident: Some(value.to_vec()),
            known_deleted: false,
            pending_deleted: false,
        };
        if let Some(old) = self.tree.insert_slot(slot, db) {
            if old.lsn != Lsn::NULL && !old.known_deleted {
                self.tracker
                    .count_obsolete(old.lsn.file(), u64::from(old.entry_size));
            }
        }
        Ok(lsn)
    }

    /// Deletes a record by writing a tombstone. Both the superseded copy
    /// and the tombstone itself are obsolete the moment it commits.
    pub fn delete(&self, db: DatabaseId, key: &[u8]) -> Result<()> {
        self.state.check_if_invalid()?;
        let location = self
            .tree
            .locate_parent_slot(db, key, None, 0)
            .ok_or(EngineError::NotFound("record"))?;
        let node_id = location.bin.latch().slots[location.index].node_id;
        let _guard = self
            .locks
            .try_write_lock(node_id)
            .ok_or(EngineError::LockDenied(node_id))?;

        let entry = LnEntry {
            db,
            node_id,
            deleted: true,
            key: key.to_vec(),
            dup_key: None,
            value: Vec::new(),
        };
        let payload = entry.encode();
        let lsn = self.file_manager.append(LogEntryType::Ln, &payload)?;
        let tombstone_size = (HEADER_BYTES + payload.len()) as u64;

        let mut state = location.bin.latch();
        let slot = &mut state.slots[location.index];
        if slot.lsn != Lsn::NULL && !slot.known_deleted {
            self.tracker
                .count_obsolete(slot.lsn.file(), u64::from(slot.entry_size));
        }
        self.tracker.count_obsolete(lsn.file(), tombstone_size);
        slot.lsn = lsn;
        slot.entry_size = tombstone_size as u32;
        slot.resident = None;
        slot.known_deleted = true;
        state.dirty = true;
        Ok(())
    }

    /// Reads a record's value, from memory or the log.
    pub fn get(&self, db: DatabaseId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.state.check_if_invalid()?;
        let Some(location) = self.tree.locate_parent_slot(db, key, None, 0) else {
            return Ok(None);
        };
        let (lsn, resident, dead) = {
            let state = location.bin.latch();
            let slot = &state.slots[location.index];
            (slot.lsn, slot.resident.clone(), slot.known_deleted)
        };
        if dead {
            return Ok(None);
        }
        if let Some(value) = resident {
            return Ok(Some(value));
        }
        let (_, _, payload) = self.file_manager.read_entry(lsn)?;
        Ok(Some(LnEntry::decode(&payload)?.value))
    }

    /// Checkpoints the environment: flushes dirty BINs (migrating records
    /// the cleaner asked for), pins the cleaned-file set, logs a root
    /// entry, then graduates and deletes files that became safe.
    pub fn checkpoint(&self) -> Result<()> {
        self.state.check_if_invalid()?;
        self.cleaner.update_file_collections();
        for db in self.tree.database_ids() {
            for bin in self.tree.bins(db) {
                self.cleaner.lazy_migrate_lns(&bin, true)?;
            }
            for dup_node in self.tree.dup_nodes(db) {
                self.cleaner.lazy_migrate_dup_count_ln(&dup_node, true)?;
            }
        }
        let snapshot = self.cleaner.files_at_checkpoint_start()?;
        self.file_manager.append(LogEntryType::Root, &[])?;
        self.cleaner.files_at_checkpoint_end(snapshot)
    }

    /// Begins shutdown and flushes utilization accounting.
    pub fn close(&self) {
        self.state.set_closing();
        self.tracker.flush();
    }
}
