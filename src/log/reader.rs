//! Sequential log file scanning with configurable checksum validation.

use std::fs::File;
use std::io::{BufReader, Read};
use std::sync::Arc;

use tracing::debug;

use crate::env::EnvState;
use crate::error::{EngineError, Result};

use super::checksum::ChecksumValidator;
use super::manager::FileManager;
use super::{EntryHeader, LogEntryType, Lsn, CHECKSUM_BYTES, HEADER_BYTES};

/// Which entries a reader checksum-validates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Validate every entry. Used during recovery scans and always before
    /// a file may be deleted.
    Always,
    /// Validate only entries of one target type.
    TargetOnly(LogEntryType),
    /// Skip checksum validation (type tags are still checked).
    Never,
}

/// One entry produced by a scan.
#[derive(Debug, Clone)]
pub struct RawEntry {
    /// Location of the entry.
    pub lsn: Lsn,
    /// Registered type.
    pub entry_type: LogEntryType,
    /// Decoded header.
    pub header: EntryHeader,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// Reads one log file end-to-end.
///
/// With `anticipate_checksum_errors` set, a checksum-class failure or a
/// truncated trailing entry is the expected scan terminator (used when
/// probing for the true end of the log after a crash) and yields `None`
/// without invalidating the environment. Otherwise such failures mark the
/// whole engine invalid and propagate.
#[derive(Debug)]
pub struct FileReader {
    env: Arc<EnvState>,
    reader: BufReader<File>,
    file_num: u32,
    file_len: u64,
    next_offset: u32,
    validation: ValidationMode,
    anticipate_checksum_errors: bool,
}

impl FileReader {
    /// Opens a reader over one log file.
    pub fn new(
        manager: &FileManager,
        file_num: u32,
        read_buffer_size: usize,
        validation: ValidationMode,
        anticipate_checksum_errors: bool,
    ) -> Result<Self> {
        let file = File::open(manager.file_path(file_num))?;
        let file_len = file.metadata()?.len();
        Ok(FileReader {
            env: manager.env(),
            reader: BufReader::with_capacity(read_buffer_size, file),
            file_num,
            file_len,
            next_offset: 0,
            validation,
            anticipate_checksum_errors,
        })
    }

    /// Offset the next entry would be read from.
    pub fn next_offset(&self) -> u32 {
        self.next_offset
    }

    fn should_validate(&self, entry_type: LogEntryType) -> bool {
        match self.validation {
            ValidationMode::Always => true,
            ValidationMode::TargetOnly(target) => entry_type == target,
            ValidationMode::Never => false,
        }
    }

    fn scan_failure(&self, err: EngineError) -> Result<Option<RawEntry>> {
        if self.anticipate_checksum_errors {
            debug!(file = self.file_num, offset = self.next_offset, error = %err,
                "log.scan.terminated_by_anticipated_error");
            return Ok(None);
        }
        self.env.invalidate(&err.to_string());
        Err(err)
    }

    /// Returns the next entry, or `None` at the end of the valid log.
    pub fn next_entry(&mut self) -> Result<Option<RawEntry>> {
        let lsn = Lsn::new(self.file_num, self.next_offset);

        let mut header_buf = [0u8; HEADER_BYTES];
        match read_exact_or_eof(&mut self.reader, &mut header_buf)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Partial => {
                return self.scan_failure(EngineError::Corruption(format!(
                    "partial entry header at {lsn}"
                )));
            }
            ReadOutcome::Full => {}
        }
        // Decoding always consumes the checksum field, advancing the
        // cursor past it whether or not validation runs below.
        let header = EntryHeader::decode(&header_buf);

        // Check the type tag before any type-specific parsing.
        let Some(entry_type) = LogEntryType::from_tag(header.entry_type) else {
            return self.scan_failure(EngineError::InvalidEntryType {
                tag: header.entry_type,
                lsn,
            });
        };

        // The size field is untrusted until the checksum passes; a torn
        // tail can decode to a registered tag with an absurd size. Bound
        // it by the bytes actually left before reserving payload space.
        let remaining = self
            .file_len
            .saturating_sub(u64::from(self.next_offset) + HEADER_BYTES as u64);
        if u64::from(header.size) > remaining {
            return self.scan_failure(EngineError::Corruption(format!(
                "entry at {lsn} claims {} payload bytes with {remaining} left in the file",
                header.size
            )));
        }

        let mut payload = vec![0u8; header.size as usize];
        match read_exact_or_eof(&mut self.reader, &mut payload)? {
            ReadOutcome::Full => {}
            ReadOutcome::Eof | ReadOutcome::Partial => {
                return self.scan_failure(EngineError::Corruption(format!(
                    "partial entry payload at {lsn}"
                )));
            }
        }

        if self.should_validate(entry_type) {
            let mut validator = ChecksumValidator::new();
            validator.update(&header_buf[CHECKSUM_BYTES..]);
            validator.update(&payload);
            if let Err(err) = validator.validate(header.checksum, lsn) {
                return self.scan_failure(err);
            }
        }

        self.next_offset = self
            .next_offset
            .checked_add((HEADER_BYTES + payload.len()) as u32)
            .ok_or_else(|| EngineError::Corruption("log offset overflow during scan".into()))?;
        Ok(Some(RawEntry {
            lsn,
            entry_type,
            header,
            payload,
        }))
    }
}

enum ReadOutcome {
    Full,
    Eof,
    Partial,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Partial
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

/// Scans `file_num` with anticipated checksum errors to find the offset
/// one past the last valid entry, i.e. the true end of the log.
pub fn find_end_of_log(
    manager: &FileManager,
    file_num: u32,
    read_buffer_size: usize,
) -> Result<u32> {
    let mut reader = FileReader::new(
        manager,
        file_num,
        read_buffer_size,
        ValidationMode::Always,
        true,
    )?;
    while reader.next_entry()?.is_some() {}
    Ok(reader.next_offset())
}
