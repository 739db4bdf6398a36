//! Rolling Adler-32 checksum over log entries.
//!
//! The algorithm is part of the wire format: the 32-bit value stored in
//! the 4-byte slot at the head of every entry covers the header bytes
//! after the slot plus the payload.

use crate::error::{EngineError, Result};
use crate::log::Lsn;

const ADLER_MOD: u32 = 65_521;
/// Largest run of bytes that can be summed before the modulo must be
/// applied to avoid overflowing `u32`.
const NMAX: usize = 5552;

/// Incremental Adler-32 state.
#[derive(Debug, Clone)]
pub struct Adler32 {
    a: u32,
    b: u32,
}

impl Default for Adler32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Adler32 {
    /// Fresh state.
    pub fn new() -> Self {
        Adler32 { a: 1, b: 0 }
    }

    /// Feeds bytes into the checksum.
    pub fn update(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(NMAX) {
            for &byte in chunk {
                self.a += u32::from(byte);
                self.b += self.a;
            }
            self.a %= ADLER_MOD;
            self.b %= ADLER_MOD;
        }
    }

    /// The current checksum value.
    pub fn value(&self) -> u32 {
        (self.b << 16) | self.a
    }

    /// Resets to the initial state.
    pub fn reset(&mut self) {
        self.a = 1;
        self.b = 0;
    }
}

/// Recomputes and compares an entry checksum on read.
#[derive(Debug, Default)]
pub struct ChecksumValidator {
    adler: Adler32,
}

impl ChecksumValidator {
    /// Fresh validator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds entry bytes (header content, then payload).
    pub fn update(&mut self, bytes: &[u8]) {
        self.adler.update(bytes);
    }

    /// Compares against the stored value, reporting the entry location on
    /// mismatch.
    pub fn validate(&self, stored: u32, lsn: Lsn) -> Result<()> {
        let computed = self.adler.value();
        if computed != stored {
            return Err(EngineError::ChecksumMismatch {
                lsn,
                stored,
                computed,
            });
        }
        Ok(())
    }
}

/// One-shot checksum of an entry as laid out on disk.
pub fn entry_checksum(header_content: &[u8], payload: &[u8]) -> u32 {
    let mut adler = Adler32::new();
    adler.update(header_content);
    adler.update(payload);
    adler.value()
}
