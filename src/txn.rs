//! Non-blocking record lock table.
//!
//! The cleaner only ever takes non-blocking read locks: a grant freezes a
//! record value long enough to rewrite it, a denial defers the record to
//! the pending set. Write locks exist for the ordinary write path and for
//! exercising denials; nothing in this table ever waits.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct LockEntry {
    readers: usize,
    writer: bool,
}

type LockTable = Arc<Mutex<HashMap<u64, LockEntry>>>;

/// Shared table of per-node locks. Grants and denials are immediate.
#[derive(Debug, Default)]
pub struct LockManager {
    table: LockTable,
}

impl LockManager {
    /// Fresh table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attempts a read lock on `node_id`; `None` means denied.
    pub fn try_read_lock(&self, node_id: u64) -> Option<ReadLockGuard> {
        let mut table = self.table.lock();
        let entry = table.entry(node_id).or_default();
        if entry.writer {
            return None;
        }
        entry.readers += 1;
        Some(ReadLockGuard {
            table: Arc::clone(&self.table),
            node_id,
        })
    }

    /// Attempts a write lock on `node_id`; `None` means denied.
    pub fn try_write_lock(&self, node_id: u64) -> Option<WriteLockGuard> {
        let mut table = self.table.lock();
        let entry = table.entry(node_id).or_default();
        if entry.writer || entry.readers > 0 {
            return None;
        }
        entry.writer = true;
        Some(WriteLockGuard {
            table: Arc::clone(&self.table),
            node_id,
        })
    }
}

/// RAII read lock; released on drop.
#[derive(Debug)]
pub struct ReadLockGuard {
    table: LockTable,
    node_id: u64,
}

impl Drop for ReadLockGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        if let Some(entry) = table.get_mut(&self.node_id) {
            entry.readers = entry.readers.saturating_sub(1);
            if entry.readers == 0 && !entry.writer {
                table.remove(&self.node_id);
            }
        }
    }
}

/// RAII write lock; released on drop.
#[derive(Debug)]
pub struct WriteLockGuard {
    table: LockTable,
    node_id: u64,
}

impl Drop for WriteLockGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        if let Some(entry) = table.get_mut(&self.node_id) {
            entry.writer = false;
            if entry.readers == 0 {
                table.remove(&self.node_id);
            }
        }
    }
}
