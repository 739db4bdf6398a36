//! File lifecycle state machine and the pending-record set.
//!
//! A file moves TO_BE_CLEANED -> BEING_CLEANED -> CLEANED ->
//! (checkpointed) -> SAFE_TO_DELETE. A checkpoint snapshot pins the
//! CLEANED set; at checkpoint end a file graduates only if no pending
//! record still references it and no database deletion is outstanding.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::tree::DatabaseId;

use super::utilization::UtilizationProfile;

/// Everything needed to retry a record whose migration was deferred.
#[derive(Debug, Clone)]
pub struct PendingInfo {
    /// Logical node id of the record.
    pub node_id: u64,
    /// Owning database.
    pub db: DatabaseId,
    /// Main key.
    pub key: Vec<u8>,
    /// Duplicate key, if any.
    pub dup_key: Option<Vec<u8>>,
    /// File the record was read from when deferred.
    pub file: u32,
    /// Whether the record is a duplicate-count record.
    pub is_dup_count: bool,
}

/// Files whose cleaning was complete when a checkpoint began.
///
/// Dropping the snapshot without reaching
/// [`FileSelector::files_at_checkpoint_end`] aborts the checkpoint: the
/// exclusivity is released and the files stay CLEANED, so a failed
/// checkpoint never wedges later ones.
#[derive(Debug)]
pub struct CheckpointSnapshot {
    files: Vec<u32>,
    selector: Option<Arc<Mutex<SelectorState>>>,
}

impl CheckpointSnapshot {
    /// The pinned files.
    pub fn files(&self) -> &[u32] {
        &self.files
    }
}

impl Drop for CheckpointSnapshot {
    fn drop(&mut self) {
        if let Some(selector) = self.selector.take() {
            selector.lock().checkpoint_active = false;
            debug!("cleaner.checkpoint.aborted");
        }
    }
}

#[derive(Debug, Default)]
struct SelectorState {
    to_be_cleaned: BTreeSet<u32>,
    being_cleaned: BTreeSet<u32>,
    cleaned: BTreeSet<u32>,
    safe_to_delete: BTreeSet<u32>,
    checkpoint_active: bool,
    pending_lns: HashMap<u64, PendingInfo>,
    pending_dbs: HashSet<DatabaseId>,
}

/// Tracks every file's position in the cleaning lifecycle.
#[derive(Debug, Default)]
pub struct FileSelector {
    inner: Arc<Mutex<SelectorState>>,
}

impl FileSelector {
    /// Empty selector.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues files for mandatory cleaning.
    pub fn set_to_be_cleaned(&self, files: &[u32]) {
        let mut state = self.inner.lock();
        for file in files {
            if !state.being_cleaned.contains(file)
                && !state.cleaned.contains(file)
                && !state.safe_to_delete.contains(file)
            {
                state.to_be_cleaned.insert(*file);
            }
        }
    }

    /// Files explicitly queued but not yet picked up.
    pub fn must_be_cleaned_files(&self) -> Vec<u32> {
        self.inner.lock().to_be_cleaned.iter().copied().collect()
    }

    /// Picks the next file to clean and marks it BEING_CLEANED.
    ///
    /// The explicit queue wins; otherwise the lowest-utilization file
    /// below `threshold` is chosen from the profile. `current_file` (the
    /// append target) is never selected from either source; a queued
    /// current file stays queued until the log rolls over.
    pub fn select_file(
        &self,
        profile: &UtilizationProfile,
        threshold: f64,
        force: bool,
        current_file: u32,
    ) -> Option<u32> {
        let mut state = self.inner.lock();
        let queued = state
            .to_be_cleaned
            .iter()
            .copied()
            .find(|&file| file != current_file);
        let picked = if let Some(file) = queued {
            state.to_be_cleaned.remove(&file);
            Some(file)
        } else {
            let busy: BTreeSet<u32> = state
                .being_cleaned
                .iter()
                .chain(state.cleaned.iter())
                .chain(state.safe_to_delete.iter())
                .copied()
                .collect();
            profile.best_file(
                |file| file == current_file || busy.contains(&file),
                threshold,
                force,
            )
        }?;
        state.being_cleaned.insert(picked);
        debug!(file = picked, "cleaner.file.selected");
        Some(picked)
    }

    /// Marks a fully processed file CLEANED.
    pub fn add_cleaned_file(&self, file: u32) {
        let mut state = self.inner.lock();
        state.being_cleaned.remove(&file);
        state.cleaned.insert(file);
    }

    /// Returns a file to the queue after a failed pass.
    pub fn putback_file(&self, file: u32) {
        let mut state = self.inner.lock();
        state.being_cleaned.remove(&file);
        state.to_be_cleaned.insert(file);
    }

    /// True while `file` is being cleaned or awaiting checkpoint. Used to
    /// decide whether a deferred migrate flag still matters.
    pub fn is_file_cleaning_in_progress(&self, file: u32) -> bool {
        let state = self.inner.lock();
        state.being_cleaned.contains(&file) || state.cleaned.contains(&file)
    }

    /// Records a deferred record migration.
    pub fn add_pending_ln(&self, info: PendingInfo) {
        let mut state = self.inner.lock();
        debug!(node = info.node_id, file = info.file, "cleaner.pending.added");
        state.pending_lns.insert(info.node_id, info);
    }

    /// Drops a deferred record once migrated or found dead.
    pub fn remove_pending_ln(&self, node_id: u64) {
        self.inner.lock().pending_lns.remove(&node_id);
    }

    /// Snapshot of all deferred records.
    pub fn pending_lns(&self) -> Vec<PendingInfo> {
        self.inner.lock().pending_lns.values().cloned().collect()
    }

    /// Marks a database whose deletion must finish before any
    /// checkpointed file may graduate.
    pub fn add_pending_db(&self, db: DatabaseId) {
        self.inner.lock().pending_dbs.insert(db);
    }

    /// Clears a pending database once its deletion committed.
    pub fn remove_pending_db(&self, db: DatabaseId) {
        self.inner.lock().pending_dbs.remove(&db);
    }

    /// Databases with outstanding deletions.
    pub fn pending_dbs(&self) -> Vec<DatabaseId> {
        self.inner.lock().pending_dbs.iter().copied().collect()
    }

    /// Pins the CLEANED set at checkpoint start.
    ///
    /// Only one snapshot may be outstanding; overlapping checkpoints are
    /// a caller bug. `None` when there is nothing to pin.
    pub fn files_at_checkpoint_start(&self) -> Result<Option<CheckpointSnapshot>> {
        let mut state = self.inner.lock();
        if state.checkpoint_active {
            return Err(EngineError::InvalidArgument(
                "a checkpoint snapshot is already outstanding".into(),
            ));
        }
        if state.cleaned.is_empty() {
            return Ok(None);
        }
        state.checkpoint_active = true;
        Ok(Some(CheckpointSnapshot {
            files: state.cleaned.iter().copied().collect(),
            selector: Some(Arc::clone(&self.inner)),
        }))
    }

    /// Graduates snapshot files to SAFE_TO_DELETE at checkpoint end.
    ///
    /// A file stays CLEANED while any pending record references it or any
    /// database deletion is outstanding.
    pub fn files_at_checkpoint_end(&self, mut snapshot: CheckpointSnapshot) -> Result<()> {
        // The snapshot is consumed here; disarm its abort-on-drop.
        snapshot.selector = None;
        let mut state = self.inner.lock();
        if !state.checkpoint_active {
            return Err(EngineError::InvalidArgument(
                "no checkpoint snapshot is outstanding".into(),
            ));
        }
        state.checkpoint_active = false;
        let blocked_by_db = !state.pending_dbs.is_empty();
        for file in std::mem::take(&mut snapshot.files) {
            let referenced = state.pending_lns.values().any(|p| p.file == file);
            if referenced || blocked_by_db {
                debug!(file, referenced, blocked_by_db, "cleaner.file.graduation_blocked");
                continue;
            }
            if state.cleaned.remove(&file) {
                state.safe_to_delete.insert(file);
                debug!(file, "cleaner.file.safe_to_delete");
            }
        }
        Ok(())
    }

    /// Current SAFE_TO_DELETE set.
    pub fn copy_safe_to_delete_files(&self) -> Vec<u32> {
        self.inner.lock().safe_to_delete.iter().copied().collect()
    }

    /// Forgets a file once physically removed.
    pub fn remove_deleted_file(&self, file: u32) {
        self.inner.lock().safe_to_delete.remove(&file);
    }
}
