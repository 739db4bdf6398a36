//! One cleaning pass: scan a file, judge every entry, migrate the live
//! leaf records.

use tracing::{debug, info};

use crate::error::Result;
use crate::log::reader::{FileReader, ValidationMode};
use crate::log::{LnEntry, LogEntryType, Lsn};

use super::look_ahead::{LnInfo, LookAheadCache};
use super::{Cleaner, DbLiveness};

/// Drives cleaning passes for one invocation of [`Cleaner::clean`].
pub(crate) struct FileProcessor<'a> {
    cleaner: &'a Cleaner,
}

impl<'a> FileProcessor<'a> {
    pub(crate) fn new(cleaner: &'a Cleaner) -> Self {
        FileProcessor { cleaner }
    }

    /// Selects and processes files until no candidate remains, the batch
    /// limit is reached, or the environment starts closing. With `force`
    /// the utilization gate is bypassed.
    pub(crate) fn do_clean(&self, force: bool) -> Result<usize> {
        let c = self.cleaner;
        c.env.check_if_invalid()?;
        let mut cleaned = 0usize;
        loop {
            if c.env.is_closing() {
                break;
            }
            c.update_file_collections();
            let Some(file) = c.selector.select_file(
                &c.profile,
                c.config.min_utilization,
                force,
                c.file_manager.current_file(),
            ) else {
                break;
            };
            match self.process_file(file) {
                Ok(()) => {
                    c.selector.add_cleaned_file(file);
                    c.stats.add(&c.stats.files_cleaned, 1);
                    cleaned += 1;
                    info!(file, "cleaner.file.cleaned");
                }
                Err(err) => {
                    // The pass is incomplete; requeue so no record of this
                    // file is lost, then surface the failure.
                    c.selector.putback_file(file);
                    return Err(err);
                }
            }
            if c.config.max_batch_files > 0 && cleaned >= c.config.max_batch_files {
                break;
            }
        }
        c.stats.add(&c.stats.runs, 1);
        Ok(cleaned)
    }

    /// Scans every entry of `file`. Checksums are always validated here,
    /// and a failure is fatal: a file is never deleted on the strength of
    /// a scan that could not read all of it.
    fn process_file(&self, file: u32) -> Result<()> {
        let c = self.cleaner;
        let mut cache = LookAheadCache::new(c.config.look_ahead_cache_size);
        let mut reader = FileReader::new(
            &c.file_manager,
            file,
            c.config.read_buffer_size,
            ValidationMode::Always,
            false,
        )?;
        while let Some(entry) = reader.next_entry()? {
            c.stats.add(&c.stats.entries_read, 1);
            match entry.entry_type {
                LogEntryType::Ln | LogEntryType::DupCountLn => {
                    let decoded = LnEntry::decode(&entry.payload)?;
                    cache.add(
                        entry.lsn.offset(),
                        LnInfo {
                            db: decoded.db,
                            node_id: decoded.node_id,
                            deleted: decoded.deleted,
                            key: decoded.key,
                            dup_key: decoded.dup_key,
                            is_dup_count: entry.entry_type == LogEntryType::DupCountLn,
                        },
                    );
                    while cache.is_full() {
                        if let Some((offset, info)) = cache.take_next() {
                            self.process_ln(file, offset, info, &mut cache)?;
                        }
                    }
                }
                LogEntryType::FileHeader | LogEntryType::In | LogEntryType::Root => {
                    // Control and index entries are rewritten by the next
                    // checkpoint; once this file is cleaned they are dead.
                    c.tracker.count_obsolete(file, entry.header.entry_size());
                }
            }
        }
        while let Some((offset, info)) = cache.take_next() {
            self.process_ln(file, offset, info, &mut cache)?;
        }
        debug!(file, "cleaner.file.scan_complete");
        Ok(())
    }

    fn process_ln(
        &self,
        file: u32,
        offset: u32,
        info: LnInfo,
        cache: &mut LookAheadCache,
    ) -> Result<()> {
        let c = self.cleaner;
        let lsn = Lsn::new(file, offset);

        match c.check_deleted_db(info.db) {
            DbLiveness::Obsolete => {
                c.stats.add(&c.stats.lns_dead, 1);
                return Ok(());
            }
            DbLiveness::Pending => {
                // The file cannot graduate until this database settles.
                c.selector.add_pending_db(info.db);
                return Ok(());
            }
            DbLiveness::Live => {}
        }

        if info.deleted {
            // Tombstones are obsolete from birth; the writer counted them.
            c.stats.add(&c.stats.lns_dead, 1);
            return Ok(());
        }

        if info.is_dup_count {
            let Some(dup_node) = c.tree.dup_count_node(info.db, &info.key) else {
                c.stats.add(&c.stats.lns_dead, 1);
                return Ok(());
            };
            let mut state = dup_node.latch();
            if state.node_id != info.node_id || state.lsn != lsn {
                // Superseded since this entry was written.
                c.stats.add(&c.stats.lns_dead, 1);
                return Ok(());
            }
            return c.migrate_dup_count_ln(&dup_node, &mut state, lsn, true, false, None);
        }

        let Some(location) =
            c.tree
                .locate_parent_slot(info.db, &info.key, info.dup_key.as_deref(), info.node_id)
        else {
            c.stats.add(&c.stats.lns_dead, 1);
            return Ok(());
        };
        let mut state = location.bin.latch();
        {
            let slot = &state.slots[location.index];
            if slot.node_id != info.node_id || slot.lsn != lsn {
                c.stats.add(&c.stats.lns_dead, 1);
                return Ok(());
            }
        }
        c.migrate_ln(&mut state, location.index, lsn, true, false, None)?;

        // Opportunistic clustering: queued records that live in this same
        // BIN are migrated now, under the latch we already hold.
        for queued_offset in cache.offsets() {
            let found = {
                let Some(queued) = cache.get(queued_offset) else {
                    continue;
                };
                if queued.db != info.db || queued.is_dup_count || queued.deleted {
                    continue;
                }
                let queued_lsn = Lsn::new(file, queued_offset);
                state
                    .slots
                    .iter()
                    .position(|s| s.node_id == queued.node_id && s.lsn == queued_lsn)
            };
            if let Some(index) = found {
                cache.remove(queued_offset);
                let queued_lsn = Lsn::new(file, queued_offset);
                c.migrate_ln(&mut state, index, queued_lsn, true, false, None)?;
            }
        }
        Ok(())
    }
}
