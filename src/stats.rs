//! Observable cleaner statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters updated by cleaning, migration, and deletion paths.
#[derive(Debug, Default)]
pub struct CleanerStats {
    pub(crate) runs: AtomicU64,
    pub(crate) entries_read: AtomicU64,
    pub(crate) lns_dead: AtomicU64,
    pub(crate) lns_locked: AtomicU64,
    pub(crate) lns_migrated: AtomicU64,
    pub(crate) lns_marked_pending: AtomicU64,
    pub(crate) pending_lns_processed: AtomicU64,
    pub(crate) files_cleaned: AtomicU64,
    pub(crate) files_deleted: AtomicU64,
    pub(crate) file_deletion_failures: AtomicU64,
}

/// Point-in-time copy of [`CleanerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanerStatsSnapshot {
    /// Cleaning invocations completed.
    pub runs: u64,
    /// Log entries read by cleaning scans.
    pub entries_read: u64,
    /// Leaf records found obsolete (dead) during cleaning.
    pub lns_dead: u64,
    /// Leaf records whose non-blocking lock was denied.
    pub lns_locked: u64,
    /// Leaf records migrated to the current file.
    pub lns_migrated: u64,
    /// Leaf records deferred into the pending set.
    pub lns_marked_pending: u64,
    /// Pending records examined by retry passes.
    pub pending_lns_processed: u64,
    /// Files for which a cleaning pass completed.
    pub files_cleaned: u64,
    /// Files physically deleted or renamed away.
    pub files_deleted: u64,
    /// Transient delete/rename failures left for retry.
    pub file_deletion_failures: u64,
}

impl CleanerStats {
    pub(crate) fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Takes a consistent-enough snapshot for reporting.
    pub fn snapshot(&self) -> CleanerStatsSnapshot {
        CleanerStatsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            entries_read: self.entries_read.load(Ordering::Relaxed),
            lns_dead: self.lns_dead.load(Ordering::Relaxed),
            lns_locked: self.lns_locked.load(Ordering::Relaxed),
            lns_migrated: self.lns_migrated.load(Ordering::Relaxed),
            lns_marked_pending: self.lns_marked_pending.load(Ordering::Relaxed),
            pending_lns_processed: self.pending_lns_processed.load(Ordering::Relaxed),
            files_cleaned: self.files_cleaned.load(Ordering::Relaxed),
            files_deleted: self.files_deleted.load(Ordering::Relaxed),
            file_deletion_failures: self.file_deletion_failures.load(Ordering::Relaxed),
        }
    }
}
