//! The cleaner: utilization-driven selection, live-record migration, and
//! safe file deletion.
//!
//! Cleaning a file never blocks writers. Records that cannot be migrated
//! immediately (locked, or their database is mid-deletion) become pending
//! work, and a cleaned file is deleted only after a checkpoint confirms
//! every migrated location is durable and nothing pending references it.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{CleanerConfig, ClusterMode};
use crate::env::{EnvState, EnvironmentLock};
use crate::error::Result;
use crate::log::manager::FileManager;
use crate::log::{LnEntry, LogEntryType, Lsn, HEADER_BYTES};
use crate::stats::{CleanerStats, CleanerStatsSnapshot};
use crate::tree::{Bin, BinSlot, BinState, DbRegistry, DbState, DupNode, DupNodeState, Tree};
use crate::txn::LockManager;

pub mod file_processor;
pub mod file_selector;
pub(crate) mod look_ahead;
pub mod utilization;

pub use file_selector::{CheckpointSnapshot, FileSelector, PendingInfo};
pub use utilization::{FileSummary, UtilizationProfile, UtilizationTracker};

use file_processor::FileProcessor;

/// Whether records in files queued for mandatory cleaning are migrated
/// proactively when their BIN is written out, ahead of the file's own
/// cleaning pass.
pub const PROACTIVE_MIGRATION: bool = true;

/// Liveness of a record's owning database, from the cleaner's viewpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DbLiveness {
    /// Database is open; the record is judged on its own merits.
    Live,
    /// Deletion in progress or registry busy; defer judgement.
    Pending,
    /// Database is gone; the record is dead.
    Obsolete,
}

#[derive(Debug, Default)]
struct FileCollections {
    must_be_cleaned: HashSet<u32>,
    low_utilization: HashSet<u32>,
}

/// The cleaning engine. One instance per environment.
#[derive(Debug)]
pub struct Cleaner {
    pub(crate) config: CleanerConfig,
    pub(crate) env: Arc<EnvState>,
    pub(crate) file_manager: Arc<FileManager>,
    pub(crate) tree: Arc<Tree>,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) registry: Arc<DbRegistry>,
    pub(crate) tracker: Arc<UtilizationTracker>,
    pub(crate) profile: Arc<UtilizationProfile>,
    pub(crate) selector: Arc<FileSelector>,
    env_lock: EnvironmentLock,
    // Serializes physical deletion so the env-lock probe and the removal
    // of accounting state happen as one unit per caller.
    delete_file_lock: Mutex<()>,
    collections: RwLock<FileCollections>,
    pub(crate) stats: CleanerStats,
}

impl Cleaner {
    /// Wires the cleaner to the shared engine components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CleanerConfig,
        env: Arc<EnvState>,
        file_manager: Arc<FileManager>,
        tree: Arc<Tree>,
        locks: Arc<LockManager>,
        registry: Arc<DbRegistry>,
        tracker: Arc<UtilizationTracker>,
        profile: Arc<UtilizationProfile>,
        env_lock: EnvironmentLock,
    ) -> Arc<Self> {
        Arc::new(Cleaner {
            config,
            env,
            file_manager,
            tree,
            locks,
            registry,
            tracker,
            profile,
            selector: FileSelector::new(),
            env_lock,
            delete_file_lock: Mutex::new(()),
            collections: RwLock::new(FileCollections::default()),
            stats: CleanerStats::default(),
        })
    }

    /// File lifecycle state, exposed for checkpoint drivers and tests.
    pub fn selector(&self) -> &FileSelector {
        &self.selector
    }

    /// Snapshot of the cleaning counters.
    pub fn stats(&self) -> CleanerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Runs cleaning passes until no candidate file remains (or the batch
    /// limit is hit), returning the number of files cleaned.
    pub fn clean(&self) -> Result<usize> {
        FileProcessor::new(self).do_clean(false)
    }

    /// Like [`Cleaner::clean`], but ignores the utilization threshold and
    /// cleans whatever file is least utilized.
    pub fn force_clean(&self) -> Result<usize> {
        FileProcessor::new(self).do_clean(true)
    }

    /// Refreshes the cached must-clean and low-utilization file sets used
    /// by migration decisions.
    pub fn update_file_collections(&self) {
        self.tracker.flush();
        let current = self.file_manager.current_file();
        let must: HashSet<u32> = self
            .selector
            .must_be_cleaned_files()
            .into_iter()
            .filter(|&file| file != current)
            .collect();
        let low: HashSet<u32> = self
            .profile
            .low_utilization_files(|f| f == current, self.config.min_utilization)
            .into_iter()
            .collect();
        *self.collections.write() = FileCollections {
            must_be_cleaned: must,
            low_utilization: low,
        };
    }

    /// Classifies the owning database of a record.
    pub(crate) fn check_deleted_db(&self, db: crate::tree::DatabaseId) -> DbLiveness {
        match self.registry.state_with_timeout(db, self.config.lock_timeout) {
            None => DbLiveness::Pending,
            Some(DbState::Alive) => DbLiveness::Live,
            Some(DbState::DeletePending) => DbLiveness::Pending,
            Some(DbState::Deleted) => DbLiveness::Obsolete,
        }
    }

    fn should_migrate(&self, migrate_flag: bool, lsn: Lsn, proactive: bool, resident: bool) -> bool {
        if lsn == Lsn::NULL {
            return false;
        }
        if migrate_flag {
            return true;
        }
        let file = lsn.file();
        let collections = self.collections.read();
        if proactive && PROACTIVE_MIGRATION && collections.must_be_cleaned.contains(&file) {
            return true;
        }
        let low = collections.low_utilization.contains(&file);
        match self.config.cluster {
            ClusterMode::Resident if resident && low => return true,
            ClusterMode::All if low => return true,
            _ => {}
        }
        // On shutdown, anything in a file mid-cleaning is flushed out so
        // the pass does not have to restart after recovery.
        self.env.is_closing() && self.selector.is_file_cleaning_in_progress(file)
    }

    fn should_migrate_ln(&self, slot: &BinSlot, proactive: bool) -> bool {
        if slot.known_deleted {
            return false;
        }
        self.should_migrate(slot.migrate, slot.lsn, proactive, slot.resident.is_some())
    }

    /// Migrates qualifying records of one BIN, as done when the BIN is
    /// about to be written out. Resident records go first under the
    /// latch; the rest are fetched in LSN order to keep reads sequential.
    pub fn lazy_migrate_lns(&self, bin: &Bin, proactive: bool) -> Result<()> {
        let mut state = bin.latch();
        let mut non_resident: Vec<(Lsn, usize)> = Vec::new();
        for index in 0..state.slots.len() {
            if !self.should_migrate_ln(&state.slots[index], proactive) {
                continue;
            }
            let lsn = state.slots[index].lsn;
            if state.slots[index].resident.is_some() {
                self.migrate_ln(&mut state, index, lsn, false, false, None)?;
            } else {
                non_resident.push((lsn, index));
            }
        }
        non_resident.sort_unstable();
        for (lsn, index) in non_resident {
            if state.slots[index].lsn != lsn {
                continue;
            }
            self.migrate_ln(&mut state, index, lsn, false, false, None)?;
        }
        Ok(())
    }

    /// Lazy-migration counterpart for a duplicate count record.
    pub fn lazy_migrate_dup_count_ln(&self, node: &DupNode, proactive: bool) -> Result<()> {
        let mut state = node.latch();
        let lsn = state.lsn;
        if !self.should_migrate(state.migrate, lsn, proactive, state.resident_count.is_some()) {
            return Ok(());
        }
        self.migrate_dup_count_ln(node, &mut state, lsn, false, false, None)
    }

    /// Whether the record in `state.slots[index]` may be evicted from
    /// memory. Records the migration policy wants resident (flagged,
    /// in a must-clean file, or claimed by clustering) and records that
    /// are currently locked stay.
    pub fn is_evictable(&self, state: &BinState, index: usize) -> bool {
        let slot = &state.slots[index];
        if self.should_migrate_ln(slot, PROACTIVE_MIGRATION) {
            return false;
        }
        self.locks.try_read_lock(slot.node_id).is_some()
    }

    /// Evicts the resident value of one slot when permitted, returning
    /// whether anything was dropped.
    pub fn evict_ln(&self, state: &mut BinState, index: usize) -> bool {
        if !self.is_evictable(state, index) {
            return false;
        }
        state.slots[index].resident.take().is_some()
    }

    fn fetch_ln(&self, slot: &BinSlot) -> Result<Vec<u8>> {
        if let Some(value) = &slot.resident {
            return Ok(value.clone());
        }
        let (_, _, payload) = self.file_manager.read_entry(slot.lsn)?;
        Ok(LnEntry::decode(&payload)?.value)
    }

    /// Migrates (re-logs) one record, under the caller's BIN latch.
    ///
    /// `lsn` is the location being cleaned or flushed; `was_cleaned` marks
    /// the cleaner-pass path, `is_pending` the retry path (which arrives
    /// with `locked_pending_node` already read-locked). Bookkeeping at the
    /// end runs on every exit: an unfinished to-be-migrated record is
    /// recorded as pending so its file cannot be deleted, and the migrate
    /// flag is always cleared.
    pub(crate) fn migrate_ln(
        &self,
        state: &mut BinState,
        index: usize,
        lsn: Lsn,
        was_cleaned: bool,
        is_pending: bool,
        locked_pending_node: Option<u64>,
    ) -> Result<()> {
        let node_id = state.slots[index].node_id;
        let db = state.db;
        let mut completed = false;
        let mut lock_denied = false;
        let mut obsolete = false;
        let mut migrated = false;

        let result = (|| -> Result<()> {
            if state.slots[index].known_deleted {
                obsolete = true;
                completed = true;
                return Ok(());
            }
            if !is_pending
                && !was_cleaned
                && state.slots[index].migrate
                && !self.selector.is_file_cleaning_in_progress(lsn.file())
            {
                // Stale flag: the pass that set it was abandoned.
                completed = true;
                return Ok(());
            }
            let _guard = match locked_pending_node {
                Some(locked) if locked == node_id => None,
                _ => match self.locks.try_read_lock(node_id) {
                    Some(guard) => Some(guard),
                    None => {
                        lock_denied = true;
                        completed = true;
                        return Ok(());
                    }
                },
            };
            if state.slots[index].pending_deleted {
                // Lock granted, so the deleting transaction has ended and
                // the slot is settled garbage.
                state.slots[index].known_deleted = true;
                obsolete = true;
                completed = true;
                return Ok(());
            }

            let value = self.fetch_ln(&state.slots[index])?;
            let slot = &state.slots[index];
            let entry = LnEntry {
                db,
                node_id,
                deleted: false,
                key: slot.key.clone(),
                dup_key: slot.dup_key.clone(),
                value,
            };
            let payload = entry.encode();
            let new_lsn = self.file_manager.append(LogEntryType::Ln, &payload)?;
            let old_size = u64::from(state.slots[index].entry_size);
            self.tracker.count_obsolete(lsn.file(), old_size);
            let slot = &mut state.slots[index];
            slot.lsn = new_lsn;
            slot.entry_size = (HEADER_BYTES + payload.len()) as u32;
            state.dirty = true;
            migrated = true;
            completed = true;
            debug!(node = node_id, from = %lsn, to = %new_lsn, "cleaner.ln.migrated");
            Ok(())
        })();

        if obsolete {
            self.stats.add(&self.stats.lns_dead, 1);
        }
        if migrated {
            self.stats.add(&self.stats.lns_migrated, 1);
        }
        if lock_denied {
            self.stats.add(&self.stats.lns_locked, 1);
        }
        if completed && is_pending && !lock_denied {
            self.selector.remove_pending_ln(node_id);
        }
        if (was_cleaned || state.slots[index].migrate) && (!completed || lock_denied) {
            let slot = &mut state.slots[index];
            slot.migrate = true;
            self.selector.add_pending_ln(PendingInfo {
                node_id,
                db,
                key: slot.key.clone(),
                dup_key: slot.dup_key.clone(),
                file: lsn.file(),
                is_dup_count: false,
            });
            self.stats.add(&self.stats.lns_marked_pending, 1);
        } else {
            state.slots[index].migrate = false;
        }
        result
    }

    /// Migration of a duplicate count record, under its node latch.
    pub(crate) fn migrate_dup_count_ln(
        &self,
        node: &DupNode,
        state: &mut DupNodeState,
        lsn: Lsn,
        was_cleaned: bool,
        is_pending: bool,
        locked_pending_node: Option<u64>,
    ) -> Result<()> {
        let node_id = state.node_id;
        let mut completed = false;
        let mut lock_denied = false;
        let mut migrated = false;

        let result = (|| -> Result<()> {
            if !is_pending
                && !was_cleaned
                && state.migrate
                && !self.selector.is_file_cleaning_in_progress(lsn.file())
            {
                completed = true;
                return Ok(());
            }
            let _guard = match locked_pending_node {
                Some(locked) if locked == node_id => None,
                _ => match self.locks.try_read_lock(node_id) {
                    Some(guard) => Some(guard),
                    None => {
                        lock_denied = true;
                        completed = true;
                        return Ok(());
                    }
                },
            };

            let count = match state.resident_count {
                Some(count) => count,
                None => {
                    let (_, _, payload) = self.file_manager.read_entry(state.lsn)?;
                    let decoded = LnEntry::decode(&payload)?;
                    let bytes: [u8; 8] =
                        decoded.value.as_slice().try_into().map_err(|_| {
                            crate::error::EngineError::Corruption(format!(
                                "malformed duplicate count at {}",
                                state.lsn
                            ))
                        })?;
                    u64::from_be_bytes(bytes)
                }
            };
            let entry = LnEntry {
                db: node.db,
                node_id,
                deleted: false,
                key: node.key.clone(),
                dup_key: None,
                value: count.to_be_bytes().to_vec(),
            };
            let payload = entry.encode();
            let new_lsn = self.file_manager.append(LogEntryType::DupCountLn, &payload)?;
            self.tracker
                .count_obsolete(lsn.file(), u64::from(state.entry_size));
            state.lsn = new_lsn;
            state.entry_size = (HEADER_BYTES + payload.len()) as u32;
            state.resident_count = Some(count);
            migrated = true;
            completed = true;
            debug!(node = node_id, from = %lsn, to = %new_lsn, "cleaner.dup_count.migrated");
            Ok(())
        })();

        if migrated {
            self.stats.add(&self.stats.lns_migrated, 1);
        }
        if lock_denied {
            self.stats.add(&self.stats.lns_locked, 1);
        }
        if completed && is_pending && !lock_denied {
            self.selector.remove_pending_ln(node_id);
        }
        if (was_cleaned || state.migrate) && (!completed || lock_denied) {
            state.migrate = true;
            self.selector.add_pending_ln(PendingInfo {
                node_id,
                db: node.db,
                key: node.key.clone(),
                dup_key: None,
                file: lsn.file(),
                is_dup_count: true,
            });
            self.stats.add(&self.stats.lns_marked_pending, 1);
        } else {
            state.migrate = false;
        }
        result
    }

    /// Retries every deferred record, migrating those whose lock is now
    /// free and dropping those that turned out dead. Also prunes pending
    /// databases whose deletion has committed.
    pub fn process_pending(&self) -> Result<()> {
        for info in self.selector.pending_lns() {
            self.stats.add(&self.stats.pending_lns_processed, 1);
            match self.check_deleted_db(info.db) {
                DbLiveness::Obsolete => {
                    self.stats.add(&self.stats.lns_dead, 1);
                    self.selector.remove_pending_ln(info.node_id);
                    continue;
                }
                DbLiveness::Pending => continue,
                DbLiveness::Live => {}
            }

            // Lock first, then latch. The record lock is what the writer
            // held when the migration was deferred.
            let Some(_guard) = self.locks.try_read_lock(info.node_id) else {
                continue;
            };

            if info.is_dup_count {
                let Some(dup_node) = self.tree.dup_count_node(info.db, &info.key) else {
                    self.stats.add(&self.stats.lns_dead, 1);
                    self.selector.remove_pending_ln(info.node_id);
                    continue;
                };
                let mut state = dup_node.latch();
                if state.node_id != info.node_id {
                    self.stats.add(&self.stats.lns_dead, 1);
                    self.selector.remove_pending_ln(info.node_id);
                    continue;
                }
                let lsn = state.lsn;
                self.migrate_dup_count_ln(
                    &dup_node,
                    &mut state,
                    lsn,
                    false,
                    true,
                    Some(info.node_id),
                )?;
            } else {
                let Some(location) = self.tree.locate_parent_slot(
                    info.db,
                    &info.key,
                    info.dup_key.as_deref(),
                    info.node_id,
                ) else {
                    self.stats.add(&self.stats.lns_dead, 1);
                    self.selector.remove_pending_ln(info.node_id);
                    continue;
                };
                let mut state = location.bin.latch();
                if state.slots[location.index].node_id != info.node_id {
                    self.stats.add(&self.stats.lns_dead, 1);
                    self.selector.remove_pending_ln(info.node_id);
                    continue;
                }
                let lsn = state.slots[location.index].lsn;
                self.migrate_ln(&mut state, location.index, lsn, false, true, Some(info.node_id))?;
            }
        }

        for db in self.selector.pending_dbs() {
            if self.registry.state_with_timeout(db, self.config.lock_timeout)
                == Some(DbState::Deleted)
            {
                self.selector.remove_pending_db(db);
            }
        }
        Ok(())
    }

    /// Checkpoint-start hook: resolves pending work, flushes utilization,
    /// and pins the CLEANED file set.
    pub fn files_at_checkpoint_start(&self) -> Result<Option<CheckpointSnapshot>> {
        self.process_pending()?;
        self.tracker.flush();
        self.selector.files_at_checkpoint_start()
    }

    /// Checkpoint-end hook: graduates the pinned files and deletes
    /// whatever became safe.
    pub fn files_at_checkpoint_end(&self, snapshot: Option<CheckpointSnapshot>) -> Result<()> {
        if let Some(snapshot) = snapshot {
            self.selector.files_at_checkpoint_end(snapshot)?;
        }
        self.delete_safe_files()
    }

    /// Physically removes every SAFE_TO_DELETE file.
    ///
    /// Skipped entirely when writes are not allowed or when another
    /// process holds the environment lock; a failed delete is logged,
    /// counted, and left in the set for the next attempt.
    pub fn delete_safe_files(&self) -> Result<()> {
        let _serial = self.delete_file_lock.lock();
        self.env.check_if_invalid()?;
        if self.env.may_not_write() {
            return Ok(());
        }
        let files = self.selector.copy_safe_to_delete_files();
        if files.is_empty() {
            return Ok(());
        }
        let env_guard = match self.env_lock.try_exclusive()? {
            Some(guard) => guard,
            None => {
                info!("cleaner.file.delete_skipped_env_locked");
                return Ok(());
            }
        };
        for file in files {
            let outcome = if self.config.expunge {
                self.file_manager.delete_file(file)
            } else {
                self.file_manager.rename_file(file).map(|_| ())
            };
            match outcome {
                Ok(()) => {
                    // Accounting must be gone before the selector forgets
                    // the file, or a concurrent pass could reselect it.
                    self.profile.remove_file(file);
                    self.tracker.remove_file(file);
                    self.selector.remove_deleted_file(file);
                    self.stats.add(&self.stats.files_deleted, 1);
                    info!(file, expunged = self.config.expunge, "cleaner.file.deleted");
                }
                Err(err) => {
                    self.stats.add(&self.stats.file_deletion_failures, 1);
                    warn!(file, error = %err, "cleaner.file.delete_failed");
                }
            }
        }
        drop(env_guard);
        Ok(())
    }
}
