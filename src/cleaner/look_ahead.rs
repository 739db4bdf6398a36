//! FIFO look-ahead cache of leaf records read during a file pass.
//!
//! Entries are keyed by file offset, so draining in key order preserves
//! log order. When the record being processed shares a BIN with queued
//! neighbors, those neighbors are migrated opportunistically under the
//! same latch and removed from the cache.

use std::collections::BTreeMap;

use crate::tree::DatabaseId;

/// Decoded leaf record queued for processing.
#[derive(Debug, Clone)]
pub(crate) struct LnInfo {
    pub db: DatabaseId,
    pub node_id: u64,
    pub deleted: bool,
    pub key: Vec<u8>,
    pub dup_key: Option<Vec<u8>>,
    pub is_dup_count: bool,
}

/// Bounded offset-ordered cache.
#[derive(Debug)]
pub(crate) struct LookAheadCache {
    capacity: usize,
    map: BTreeMap<u32, LnInfo>,
}

impl LookAheadCache {
    pub fn new(capacity: usize) -> Self {
        LookAheadCache {
            capacity: capacity.max(1),
            map: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, offset: u32, info: LnInfo) {
        self.map.insert(offset, info);
    }

    pub fn is_full(&self) -> bool {
        self.map.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Removes and returns the lowest-offset entry.
    pub fn take_next(&mut self) -> Option<(u32, LnInfo)> {
        self.map.pop_first()
    }

    /// Removes a specific queued offset, if still present.
    pub fn remove(&mut self, offset: u32) -> Option<LnInfo> {
        self.map.remove(&offset)
    }

    /// Peeks at a queued offset without removing it.
    pub fn get(&self, offset: u32) -> Option<&LnInfo> {
        self.map.get(&offset)
    }

    /// Offsets currently queued, ascending.
    pub fn offsets(&self) -> Vec<u32> {
        self.map.keys().copied().collect()
    }
}
