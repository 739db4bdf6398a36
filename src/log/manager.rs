//! Log file management: naming, the current-file append path, random
//! entry reads, and physical delete/rename of reclaimed files.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cleaner::utilization::UtilizationTracker;
use crate::config::CleanerConfig;
use crate::env::EnvState;
use crate::error::{EngineError, Result};

use super::checksum::entry_checksum;
use super::{EntryHeader, LogEntryType, Lsn, CHECKSUM_BYTES, HEADER_BYTES, LOG_VERSION};

/// Suffix of active log files.
pub const LOG_SUFFIX: &str = "log";
/// Suffix applied when cleaned files are renamed instead of deleted.
pub const DEL_SUFFIX: &str = "del";

const FILE_HEADER_MAGIC: &[u8; 8] = b"UMBRLOG\0";

#[derive(Debug)]
struct WriteState {
    current_file: u32,
    offset: u32,
    prev_offset: u32,
    file: File,
}

/// Owns the log directory and the single append cursor.
///
/// Every append computes the entry checksum and reports the new bytes to
/// the utilization tracker; obsolescence counting is the caller's duty.
#[derive(Debug)]
pub struct FileManager {
    dir: PathBuf,
    file_max: u64,
    fsync: bool,
    checksum_on_read: bool,
    env: Arc<EnvState>,
    tracker: Arc<UtilizationTracker>,
    state: Mutex<WriteState>,
}

impl FileManager {
    /// Creates a fresh log environment in `dir`, starting at file 0.
    pub fn create(
        dir: &Path,
        config: &CleanerConfig,
        env: Arc<EnvState>,
        tracker: Arc<UtilizationTracker>,
    ) -> Result<Arc<Self>> {
        fs::create_dir_all(dir)?;
        let first = Self::open_log_file(dir, 0)?;
        let manager = Arc::new(FileManager {
            dir: dir.to_path_buf(),
            file_max: config.log_file_max,
            fsync: config.fsync,
            checksum_on_read: config.checksum_on_read,
            env,
            tracker,
            state: Mutex::new(WriteState {
                current_file: 0,
                offset: 0,
                prev_offset: 0,
                file: first,
            }),
        });
        {
            let mut state = manager.state.lock();
            manager.write_file_header(&mut state)?;
        }
        Ok(manager)
    }

    fn open_log_file(dir: &Path, file: u32) -> Result<File> {
        let path = Self::path_for(dir, file, LOG_SUFFIX);
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?)
    }

    fn path_for(dir: &Path, file: u32, suffix: &str) -> PathBuf {
        dir.join(format!("{file:08x}.{suffix}"))
    }

    /// Path of an active log file.
    pub fn file_path(&self, file: u32) -> PathBuf {
        Self::path_for(&self.dir, file, LOG_SUFFIX)
    }

    /// Path a file is renamed to when expunging is disabled.
    pub fn del_path(&self, file: u32) -> PathBuf {
        Self::path_for(&self.dir, file, DEL_SUFFIX)
    }

    /// Environment state shared with readers.
    pub(crate) fn env(&self) -> Arc<EnvState> {
        Arc::clone(&self.env)
    }

    /// The file currently receiving appends. Never a cleaning candidate.
    pub fn current_file(&self) -> u32 {
        self.state.lock().current_file
    }

    /// Appends one entry, returning its location.
    pub fn append(&self, entry_type: LogEntryType, payload: &[u8]) -> Result<Lsn> {
        self.env.check_if_invalid()?;
        let mut state = self.state.lock();
        let entry_len = (HEADER_BYTES + payload.len()) as u64;
        if u64::from(state.offset) + entry_len > self.file_max && state.offset > 0 {
            self.roll_file(&mut state)?;
        }
        self.write_entry_locked(&mut state, entry_type, payload)
    }

    /// Closes the current file and starts a new one regardless of size.
    pub fn force_rotate(&self) -> Result<u32> {
        let mut state = self.state.lock();
        self.roll_file(&mut state)?;
        Ok(state.current_file)
    }

    fn roll_file(&self, state: &mut WriteState) -> Result<()> {
        state.file.sync_data()?;
        let next = state
            .current_file
            .checked_add(1)
            .ok_or_else(|| EngineError::Corruption("log file number overflow".into()))?;
        state.file = Self::open_log_file(&self.dir, next)?;
        state.current_file = next;
        state.offset = 0;
        state.prev_offset = 0;
        info!(file = next, "log.file.rollover");
        self.write_file_header(state)?;
        Ok(())
    }

    fn write_file_header(&self, state: &mut WriteState) -> Result<()> {
        let mut payload = Vec::with_capacity(FILE_HEADER_MAGIC.len() + 5);
        payload.extend_from_slice(FILE_HEADER_MAGIC);
        payload.extend_from_slice(&state.current_file.to_be_bytes());
        payload.push(LOG_VERSION);
        self.write_entry_locked(state, LogEntryType::FileHeader, &payload)?;
        Ok(())
    }

    fn write_entry_locked(
        &self,
        state: &mut WriteState,
        entry_type: LogEntryType,
        payload: &[u8],
    ) -> Result<Lsn> {
        let mut header = EntryHeader {
            checksum: 0,
            prev_offset: state.prev_offset,
            entry_type: entry_type.tag(),
            version: LOG_VERSION,
            size: payload.len() as u32,
        };
        let encoded = header.encode();
        header.checksum = entry_checksum(&encoded[CHECKSUM_BYTES..], payload);
        let encoded = header.encode();

        state.file.seek(SeekFrom::Start(u64::from(state.offset)))?;
        state.file.write_all(&encoded)?;
        state.file.write_all(payload)?;
        if self.fsync {
            state.file.sync_data()?;
        }

        let lsn = Lsn::new(state.current_file, state.offset);
        let entry_len = (HEADER_BYTES + payload.len()) as u32;
        state.prev_offset = state.offset;
        state.offset = state.offset.checked_add(entry_len).ok_or_else(|| {
            EngineError::Corruption("log file offset overflow".into())
        })?;
        self.tracker
            .count_new_entry(lsn.file(), u64::from(entry_len));
        debug!(%lsn, ty = ?entry_type, size = payload.len(), "log.entry.appended");
        Ok(lsn)
    }

    /// Reads and (when configured) checksum-validates one entry at `lsn`.
    ///
    /// A mismatch here is never anticipated: the environment is
    /// invalidated before the error propagates.
    pub fn read_entry(&self, lsn: Lsn) -> Result<(EntryHeader, LogEntryType, Vec<u8>)> {
        self.env.check_if_invalid()?;
        let mut file = File::open(self.file_path(lsn.file()))?;
        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(u64::from(lsn.offset())))?;

        let mut header_buf = [0u8; HEADER_BYTES];
        read_exact_entry(&mut file, &mut header_buf, &self.env, lsn)?;
        let header = EntryHeader::decode(&header_buf);

        let entry_type = match LogEntryType::from_tag(header.entry_type) {
            Some(t) => t,
            None => {
                let err = EngineError::InvalidEntryType {
                    tag: header.entry_type,
                    lsn,
                };
                self.env.invalidate(&err.to_string());
                return Err(err);
            }
        };

        // Bound the untrusted size field before reserving payload space.
        let remaining = file_len.saturating_sub(u64::from(lsn.offset()) + HEADER_BYTES as u64);
        if u64::from(header.size) > remaining {
            let err = EngineError::Corruption(format!(
                "entry at {lsn} claims {} payload bytes with {remaining} left in the file",
                header.size
            ));
            self.env.invalidate(&err.to_string());
            return Err(err);
        }

        let mut payload = vec![0u8; header.size as usize];
        read_exact_entry(&mut file, &mut payload, &self.env, lsn)?;

        if self.checksum_on_read {
            let computed = entry_checksum(&header_buf[CHECKSUM_BYTES..], &payload);
            if computed != header.checksum {
                let err = EngineError::ChecksumMismatch {
                    lsn,
                    stored: header.checksum,
                    computed,
                };
                self.env.invalidate(&err.to_string());
                return Err(err);
            }
        }
        Ok((header, entry_type, payload))
    }

    /// Physically removes a log file.
    pub fn delete_file(&self, file: u32) -> Result<()> {
        fs::remove_file(self.file_path(file))?;
        Ok(())
    }

    /// Renames a log file out of the active set with the `.del` suffix.
    pub fn rename_file(&self, file: u32) -> Result<PathBuf> {
        let target = self.del_path(file);
        fs::rename(self.file_path(file), &target)?;
        Ok(target)
    }

    /// Active log file numbers present on disk, in order.
    pub fn files(&self) -> Result<Vec<u32>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(&format!(".{LOG_SUFFIX}")) else {
                continue;
            };
            if let Ok(file) = u32::from_str_radix(stem, 16) {
                files.push(file);
            }
        }
        files.sort_unstable();
        Ok(files)
    }
}

fn read_exact_entry(file: &mut File, buf: &mut [u8], env: &EnvState, lsn: Lsn) -> Result<()> {
    match file.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            let err = EngineError::Corruption(format!("entry at {lsn} extends past end of file"));
            env.invalidate(&err.to_string());
            Err(err)
        }
        Err(e) => Err(e.into()),
    }
}
