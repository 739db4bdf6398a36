//! On-disk log format: sequence numbers, entry headers, and payloads.
//!
//! Every entry is self-describing:
//! `[checksum:4][prev-offset:4][type:1][version:1][size:4][payload...]`
//! with all integers big-endian. The checksum covers the header bytes that
//! follow the checksum slot plus the payload. External recovery tooling
//! depends on this exact layout, including the 4-byte checksum prefix.

use std::convert::TryInto;
use std::fmt;

use crate::error::{EngineError, Result};
use crate::tree::DatabaseId;

pub mod checksum;
pub mod manager;
pub mod reader;

/// Bytes reserved for the checksum at the head of every entry.
pub const CHECKSUM_BYTES: usize = 4;
/// Bytes of the previous-entry offset field.
pub const PREV_BYTES: usize = 4;
/// Total entry header size.
pub const HEADER_BYTES: usize = CHECKSUM_BYTES + PREV_BYTES + 1 + 1 + 4;
/// Offset of the type tag within the header.
pub const HEADER_TYPE_OFFSET: usize = CHECKSUM_BYTES + PREV_BYTES;
/// Offset of the version byte within the header.
pub const HEADER_VERSION_OFFSET: usize = HEADER_TYPE_OFFSET + 1;
/// Offset of the payload-size field within the header.
pub const HEADER_SIZE_OFFSET: usize = HEADER_VERSION_OFFSET + 1;
/// Current log format version written into every entry.
pub const LOG_VERSION: u8 = 1;

/// Log sequence number: an opaque, totally ordered (file, offset) pair.
///
/// Ordering by LSN equals ordering by write time.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(u64);

impl Lsn {
    /// Sentinel for "no location".
    pub const NULL: Lsn = Lsn(u64::MAX);

    /// Packs a file number and an offset within that file.
    pub fn new(file: u32, offset: u32) -> Self {
        Lsn((u64::from(file) << 32) | u64::from(offset))
    }

    /// The file number component.
    pub fn file(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The byte offset within the file.
    pub fn offset(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Lsn::NULL {
            write!(f, "lsn(null)")
        } else {
            write!(f, "lsn({:#x}/{:#x})", self.file(), self.offset())
        }
    }
}

/// Registered log entry types. Unknown tags on disk are a checksum-class
/// error, never silently skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogEntryType {
    /// Control record written at the start of every log file.
    FileHeader,
    /// Leaf record holding a key/value pair.
    Ln,
    /// Leaf record holding the duplicate count for a key.
    DupCountLn,
    /// Internal index node record.
    In,
    /// Control record for the index root.
    Root,
}

impl LogEntryType {
    /// The on-disk tag.
    pub fn tag(self) -> u8 {
        match self {
            LogEntryType::FileHeader => 1,
            LogEntryType::Ln => 2,
            LogEntryType::DupCountLn => 3,
            LogEntryType::In => 4,
            LogEntryType::Root => 5,
        }
    }

    /// Decodes a tag, returning `None` for unregistered values.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(LogEntryType::FileHeader),
            2 => Some(LogEntryType::Ln),
            3 => Some(LogEntryType::DupCountLn),
            4 => Some(LogEntryType::In),
            5 => Some(LogEntryType::Root),
            _ => None,
        }
    }

    /// Leaf types are the ones the cleaner migrates.
    pub fn is_leaf(self) -> bool {
        matches!(self, LogEntryType::Ln | LogEntryType::DupCountLn)
    }
}

/// Decoded entry header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Stored checksum over header content and payload.
    pub checksum: u32,
    /// Offset of the previous entry in the same file (0 for the first).
    pub prev_offset: u32,
    /// Raw type tag; may be unregistered on corrupt input.
    pub entry_type: u8,
    /// Format version the entry was written with.
    pub version: u8,
    /// Payload size in bytes.
    pub size: u32,
}

impl EntryHeader {
    /// Encodes the header into its fixed-size wire form.
    pub fn encode(&self) -> [u8; HEADER_BYTES] {
        let mut buf = [0u8; HEADER_BYTES];
        buf[..CHECKSUM_BYTES].copy_from_slice(&self.checksum.to_be_bytes());
        buf[CHECKSUM_BYTES..HEADER_TYPE_OFFSET].copy_from_slice(&self.prev_offset.to_be_bytes());
        buf[HEADER_TYPE_OFFSET] = self.entry_type;
        buf[HEADER_VERSION_OFFSET] = self.version;
        buf[HEADER_SIZE_OFFSET..].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    /// Decodes a header, always consuming the checksum field so callers
    /// advance past it whether or not validation is enabled.
    pub fn decode(buf: &[u8; HEADER_BYTES]) -> Self {
        let checksum = u32::from_be_bytes(buf[..CHECKSUM_BYTES].try_into().expect("4 bytes"));
        let prev_offset = u32::from_be_bytes(
            buf[CHECKSUM_BYTES..HEADER_TYPE_OFFSET]
                .try_into()
                .expect("4 bytes"),
        );
        let size = u32::from_be_bytes(buf[HEADER_SIZE_OFFSET..].try_into().expect("4 bytes"));
        EntryHeader {
            checksum,
            prev_offset,
            entry_type: buf[HEADER_TYPE_OFFSET],
            version: buf[HEADER_VERSION_OFFSET],
            size,
        }
    }

    /// Total on-disk size of the entry, header included.
    pub fn entry_size(&self) -> u64 {
        HEADER_BYTES as u64 + u64::from(self.size)
    }
}

const LN_FLAG_DELETED: u8 = 0x1;
const LN_FLAG_HAS_DUP_KEY: u8 = 0x2;

/// Payload of an `Ln` or `DupCountLn` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LnEntry {
    /// Owning database.
    pub db: DatabaseId,
    /// Logical node identifier, stable across migrations.
    pub node_id: u64,
    /// Tombstone marker; deleted records are never migrated.
    pub deleted: bool,
    /// Main key.
    pub key: Vec<u8>,
    /// Duplicate key, present for records in duplicate-enabled databases.
    pub dup_key: Option<Vec<u8>>,
    /// Record value (the duplicate count, big-endian, for `DupCountLn`).
    pub value: Vec<u8>,
}

impl LnEntry {
    /// Serializes the payload.
    pub fn encode(&self) -> Vec<u8> {
        let dup_len = self.dup_key.as_ref().map_or(0, Vec::len);
        let mut buf = Vec::with_capacity(4 + 8 + 1 + 2 + self.key.len() + 2 + dup_len + 4 + self.value.len());
        buf.extend_from_slice(&self.db.0.to_be_bytes());
        buf.extend_from_slice(&self.node_id.to_be_bytes());
        let mut flags = 0u8;
        if self.deleted {
            flags |= LN_FLAG_DELETED;
        }
        if self.dup_key.is_some() {
            flags |= LN_FLAG_HAS_DUP_KEY;
        }
        buf.push(flags);
        buf.extend_from_slice(&(self.key.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.key);
        if let Some(dup) = &self.dup_key {
            buf.extend_from_slice(&(dup.len() as u16).to_be_bytes());
            buf.extend_from_slice(dup);
        }
        buf.extend_from_slice(&(self.value.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.value);
        buf
    }

    /// Deserializes a payload produced by [`LnEntry::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { buf, pos: 0 };
        let db = DatabaseId(cursor.read_u32()?);
        let node_id = cursor.read_u64()?;
        let flags = cursor.read_u8()?;
        let key_len = cursor.read_u16()? as usize;
        let key = cursor.read_bytes(key_len)?;
        let dup_key = if flags & LN_FLAG_HAS_DUP_KEY != 0 {
            let dup_len = cursor.read_u16()? as usize;
            Some(cursor.read_bytes(dup_len)?)
        } else {
            None
        };
        let value_len = cursor.read_u32()? as usize;
        let value = cursor.read_bytes(value_len)?;
        Ok(LnEntry {
            db,
            node_id,
            deleted: flags & LN_FLAG_DELETED != 0,
            key,
            dup_key,
            value,
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or_else(|| EngineError::Corruption("LN payload length overflow".into()))?;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| EngineError::Corruption("truncated LN payload".into()))?;
        self.pos = end;
        Ok(slice.to_vec())
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        let arr: [u8; 8] = b.as_slice().try_into().expect("8 bytes");
        Ok(u64::from_be_bytes(arr))
    }
}
