//! Error taxonomy for the cleaner engine.

use std::io;

use thiserror::Error;

use crate::log::Lsn;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the log and cleaner layers.
///
/// Lock denials are deliberately not represented here: a denied
/// non-blocking record lock is a normal outcome that turns a migration
/// into a pending record, never an error the caller sees.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A log entry's stored checksum does not match the recomputed value.
    #[error("checksum mismatch at {lsn}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Location of the bad entry.
        lsn: Lsn,
        /// Checksum stored in the entry header.
        stored: u32,
        /// Checksum recomputed over the entry bytes.
        computed: u32,
    },
    /// A log entry carries a type tag that is not registered.
    #[error("invalid log entry type {tag:#04x} at {lsn}")]
    InvalidEntryType {
        /// The unknown type tag.
        tag: u8,
        /// Location of the bad entry.
        lsn: Lsn,
    },
    /// A prior fatal corruption placed the engine in a must-recover state.
    #[error("environment is invalid and must be recovered: {0}")]
    EnvironmentInvalid(String),
    /// Structural log damage that is not a checksum mismatch.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// A non-blocking write lock could not be granted to a writer.
    #[error("lock denied for node {0}")]
    LockDenied(u64),
    /// Lookup failure on the write path.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// Caller misuse.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl EngineError {
    /// Whether this error belongs to the checksum class (mismatch or
    /// unknown entry type). Both are treated identically by readers that
    /// anticipate corruption while probing past the end of the log.
    pub fn is_checksum_class(&self) -> bool {
        matches!(
            self,
            EngineError::ChecksumMismatch { .. } | EngineError::InvalidEntryType { .. }
        )
    }
}
