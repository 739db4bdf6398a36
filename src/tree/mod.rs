//! In-memory index: databases, BINs (bottom internal nodes), and duplicate
//! count nodes.
//!
//! The index is authoritative for liveness. A log entry is live exactly
//! when some slot (or dup-count node) still points at its LSN; everything
//! the cleaner decides starts from a lookup here under the BIN latch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::log::Lsn;

/// Identifier of a logical database within the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatabaseId(pub u32);

/// Lifecycle of a database as seen by the cleaner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    /// Open and usable; records are migrated normally.
    Alive,
    /// Removal has begun but the final commit is still outstanding.
    DeletePending,
    /// Fully removed; all its records are obsolete by definition.
    Deleted,
}

/// Registry of database lifecycle states.
///
/// Lookups from the cleaner use a bounded-wait read so a long-held write
/// lock (a delete in progress) defers the record instead of stalling the
/// whole pass.
#[derive(Debug, Default)]
pub struct DbRegistry {
    map: RwLock<HashMap<DatabaseId, DbState>>,
}

impl DbRegistry {
    /// Empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a database as alive.
    pub fn register(&self, db: DatabaseId) {
        self.map.write().insert(db, DbState::Alive);
    }

    /// Marks a database as delete-in-progress.
    pub fn start_delete(&self, db: DatabaseId) {
        self.map.write().insert(db, DbState::DeletePending);
    }

    /// Commits a database removal.
    pub fn finish_delete(&self, db: DatabaseId) {
        self.map.write().insert(db, DbState::Deleted);
    }

    /// State of `db`, waiting at most `timeout` for the registry lock.
    /// `None` means the lock could not be acquired in time. Databases
    /// never registered are reported `Deleted`.
    pub fn state_with_timeout(&self, db: DatabaseId, timeout: Duration) -> Option<DbState> {
        let map = self.map.try_read_for(timeout)?;
        Some(map.get(&db).copied().unwrap_or(DbState::Deleted))
    }
}

/// Slots per BIN before a new BIN is started.
pub const BIN_FANOUT: usize = 32;

/// One record slot in a BIN.
#[derive(Debug, Clone)]
pub struct BinSlot {
    /// Main key.
    pub key: Vec<u8>,
    /// Duplicate key, for records in duplicate-enabled databases.
    pub dup_key: Option<Vec<u8>>,
    /// Logical node id, stable across migrations.
    pub node_id: u64,
    /// Current on-disk location.
    pub lsn: Lsn,
    /// On-disk size of the entry at `lsn`, header included. Kept so the
    /// old copy can be counted obsolete when the slot moves.
    pub entry_size: u32,
    /// Set by the cleaner when a locked record must be migrated later.
    pub migrate: bool,
    /// Cached value, when the record is resident in memory.
    pub resident: Option<Vec<u8>>,
    /// The record was deleted and committed; the slot is garbage.
    pub known_deleted: bool,
    /// The record was deleted by an open transaction.
    pub pending_deleted: bool,
}

/// Mutable BIN contents, guarded by the BIN latch.
#[derive(Debug)]
pub struct BinState {
    /// Owning database.
    pub db: DatabaseId,
    /// Set when the BIN holds changes not yet checkpointed.
    pub dirty: bool,
    /// Record slots.
    pub slots: Vec<BinSlot>,
}

/// Bottom internal node. The latch serializes all slot access.
#[derive(Debug)]
pub struct Bin {
    state: Mutex<BinState>,
}

impl Bin {
    fn new(db: DatabaseId) -> Arc<Self> {
        Arc::new(Bin {
            state: Mutex::new(BinState {
                db,
                dirty: false,
                slots: Vec::new(),
            }),
        })
    }

    /// Acquires the BIN latch.
    pub fn latch(&self) -> MutexGuard<'_, BinState> {
        self.state.lock()
    }
}

/// Mutable dup-count node contents.
#[derive(Debug)]
pub struct DupNodeState {
    /// Logical node id of the count record.
    pub node_id: u64,
    /// Current on-disk location of the count record.
    pub lsn: Lsn,
    /// On-disk size of the entry at `lsn`, header included.
    pub entry_size: u32,
    /// Deferred-migration flag, mirroring [`BinSlot::migrate`].
    pub migrate: bool,
    /// Cached count, when resident.
    pub resident_count: Option<u64>,
}

/// Duplicate count node: tracks how many duplicates exist under one key.
#[derive(Debug)]
pub struct DupNode {
    /// Owning database.
    pub db: DatabaseId,
    /// Main key the duplicates share.
    pub key: Vec<u8>,
    state: Mutex<DupNodeState>,
}

impl DupNode {
    /// Acquires the dup-count node latch.
    pub fn latch(&self) -> MutexGuard<'_, DupNodeState> {
        self.state.lock()
    }
}

/// Result of locating a record's parent BIN.
pub struct TreeLocation {
    /// The BIN holding the slot.
    pub bin: Arc<Bin>,
    /// Slot index within the BIN.
    pub index: usize,
}

#[derive(Debug, Default)]
struct DbIndex {
    bins: Vec<Arc<Bin>>,
    by_key: HashMap<(Vec<u8>, Option<Vec<u8>>), (usize, usize)>,
    dup_nodes: HashMap<Vec<u8>, Arc<DupNode>>,
}

/// The whole in-memory index, one sub-index per database.
#[derive(Debug, Default)]
pub struct Tree {
    dbs: RwLock<HashMap<DatabaseId, DbIndex>>,
}

impl Tree {
    /// Empty tree.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inserts or replaces the slot for `(key, dup_key)`, returning the
    /// previous slot when one existed.
    pub fn insert_slot(&self, slot: BinSlot, db: DatabaseId) -> Option<BinSlot> {
        let mut dbs = self.dbs.write();
        let index = dbs.entry(db).or_default();
        let map_key = (slot.key.clone(), slot.dup_key.clone());

        if let Some(&(bin_idx, slot_idx)) = index.by_key.get(&map_key) {
            let bin = Arc::clone(&index.bins[bin_idx]);
            let mut state = bin.latch();
            let old = std::mem::replace(&mut state.slots[slot_idx], slot);
            state.dirty = true;
            return Some(old);
        }

        let needs_new_bin = index
            .bins
            .last()
            .map_or(true, |bin| bin.latch().slots.len() >= BIN_FANOUT);
        if needs_new_bin {
            index.bins.push(Bin::new(db));
        }
        let bin_idx = index.bins.len() - 1;
        let bin = Arc::clone(&index.bins[bin_idx]);
        let mut state = bin.latch();
        let slot_idx = state.slots.len();
        state.slots.push(slot);
        state.dirty = true;
        drop(state);
        index.by_key.insert(map_key, (bin_idx, slot_idx));
        None
    }

    /// Finds the BIN slot for a record read from the log.
    ///
    /// The lookup is by key; the caller must re-check the slot under the
    /// latch (node id and LSN) because the record may have been replaced
    /// since the log entry was written.
    pub fn locate_parent_slot(
        &self,
        db: DatabaseId,
        key: &[u8],
        dup_key: Option<&[u8]>,
        node_id: u64,
    ) -> Option<TreeLocation> {
        let dbs = self.dbs.read();
        let index = dbs.get(&db)?;
        let map_key = (key.to_vec(), dup_key.map(<[u8]>::to_vec));
        if let Some(&(bin_idx, slot_idx)) = index.by_key.get(&map_key) {
            return Some(TreeLocation {
                bin: Arc::clone(&index.bins[bin_idx]),
                index: slot_idx,
            });
        }
        // Key no longer present under its original form; fall back to a
        // node-id scan so renamed slots are still found.
        for bin in &index.bins {
            let state = bin.latch();
            if let Some(i) = state.slots.iter().position(|s| s.node_id == node_id) {
                drop(state);
                return Some(TreeLocation {
                    bin: Arc::clone(bin),
                    index: i,
                });
            }
        }
        None
    }

    /// The dup-count node for `key`, if duplicates exist.
    pub fn dup_count_node(&self, db: DatabaseId, key: &[u8]) -> Option<Arc<DupNode>> {
        let dbs = self.dbs.read();
        dbs.get(&db)?.dup_nodes.get(key).map(Arc::clone)
    }

    /// Returns the dup-count node for `key`, creating it if absent.
    pub fn ensure_dup_node(
        &self,
        db: DatabaseId,
        key: &[u8],
        node_id: u64,
        lsn: Lsn,
        entry_size: u32,
        count: u64,
    ) -> Arc<DupNode> {
        let mut dbs = self.dbs.write();
        let index = dbs.entry(db).or_default();
        if let Some(existing) = index.dup_nodes.get(key) {
            let mut state = existing.latch();
            state.lsn = lsn;
            state.entry_size = entry_size;
            state.resident_count = Some(count);
            return Arc::clone(existing);
        }
        let node = Arc::new(DupNode {
            db,
            key: key.to_vec(),
            state: Mutex::new(DupNodeState {
                node_id,
                lsn,
                entry_size,
                migrate: false,
                resident_count: Some(count),
            }),
        });
        index.dup_nodes.insert(key.to_vec(), Arc::clone(&node));
        node
    }

    /// All BINs of one database, for lazy-migration sweeps.
    pub fn bins(&self, db: DatabaseId) -> Vec<Arc<Bin>> {
        let dbs = self.dbs.read();
        dbs.get(&db)
            .map(|index| index.bins.iter().map(Arc::clone).collect())
            .unwrap_or_default()
    }

    /// All dup-count nodes of one database.
    pub fn dup_nodes(&self, db: DatabaseId) -> Vec<Arc<DupNode>> {
        let dbs = self.dbs.read();
        dbs.get(&db)
            .map(|index| index.dup_nodes.values().map(Arc::clone).collect())
            .unwrap_or_default()
    }

    /// Databases with indexed records.
    pub fn database_ids(&self) -> Vec<DatabaseId> {
        let mut ids: Vec<DatabaseId> = self.dbs.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
