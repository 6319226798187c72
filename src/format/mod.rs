//! Unified File Format (UFF) Header
//!
//! The entire database is one file. A fixed-size header at offset 0
//! records where each embedded section lives, so opening a database is a
//! single `open` + header read — no cross-file ordering, and backup is an
//! atomic `cp`.
//!
//! # On-disk layout
//!
//! ```text
//! [ Header | Data section | Tag dictionary | Entity offset index | WAL ]
//! ```
//!
//! The header itself is exactly [`HEADER_LEN`] bytes, little-endian:
//!
//! ```text
//! magic        [u8;4]   = "EUFF"
//! version      u32      = 1
//! file_size    u64      file size at last header flush
//! flags        u32      bit0 = clean shutdown, bit1 = compression enabled
//! data         u64 offset, u64 size
//! dict         u64 offset, u64 size
//! index        u64 offset, u64 size
//! wal          u64 offset, u64 size
//! reserved     [u8;40]  zero padding
//! header_crc   u32      CRC32 over bytes [0, 124)
//! ```
//!
//! # Validation
//!
//! [`FileHeader::decode`] checks magic, version, and CRC.
//! [`FileHeader::validate_layout`] then checks that every section fits
//! inside the declared file size and that no two sections overlap — any
//! violation routes the open into recovery rather than a read of garbage
//! offsets. Trailing zero padding between the declared and actual file
//! size is tolerated, per the format contract.

#[cfg(test)]
mod tests;

use crc32fast::Hasher as Crc32;
use thiserror::Error;

use crate::encoding::{Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Header magic bytes.
pub const MAGIC: [u8; 4] = *b"EUFF";

/// Current format version. Version 1 fixes little-endian encoding for
/// the CRC, the section table, and every other on-disk integer.
pub const VERSION: u32 = 1;

/// Total on-disk header size, including the trailing CRC32.
pub const HEADER_LEN: usize = 128;

/// Byte count covered by the header CRC (everything before it).
pub const HEADER_CRC_COVERAGE: usize = HEADER_LEN - 4;

const FIELD_BYTES: usize = 4 + 4 + 8 + 4 + 4 * 16; // magic..sections = 84
const RESERVED_BYTES: usize = HEADER_CRC_COVERAGE - FIELD_BYTES; // 40

// The reserved padding must stay non-negative if fields are ever added.
const _: () = assert!(FIELD_BYTES + RESERVED_BYTES == HEADER_CRC_COVERAGE);

/// Flag bit: the previous session closed cleanly (WAL is empty).
pub const FLAG_CLEAN_SHUTDOWN: u32 = 0b01;

/// Flag bit: content compression is enabled for this file.
pub const FLAG_COMPRESSION: u32 = 0b10;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by header encoding, decoding, and layout validation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FormatError {
    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Header magic did not match `EUFF`.
    #[error("Bad header magic")]
    BadMagic,

    /// Header declared a version this build does not understand.
    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u32),

    /// Header CRC32 mismatch.
    #[error("Header checksum mismatch")]
    ChecksumMismatch,

    /// Fewer than [`HEADER_LEN`] bytes were available.
    #[error("Header truncated ({0} bytes)")]
    Truncated(usize),

    /// A section lies outside the declared file size, or its offset+size
    /// overflows.
    #[error("Section {name} out of bounds (offset {offset}, size {size}, file {file_size})")]
    SectionOutOfBounds {
        /// Section name.
        name: &'static str,
        /// Declared offset.
        offset: u64,
        /// Declared size.
        size: u64,
        /// Declared file size.
        file_size: u64,
    },

    /// Two sections overlap.
    #[error("Sections {a} and {b} overlap")]
    SectionOverlap {
        /// First section name.
        a: &'static str,
        /// Second section name.
        b: &'static str,
    },
}

// ------------------------------------------------------------------------------------------------
// Sections
// ------------------------------------------------------------------------------------------------

/// One `(offset, size)` span in the section table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionSpan {
    /// Byte offset of the section start.
    pub offset: u64,

    /// Byte length of the section.
    pub size: u64,
}

impl SectionSpan {
    /// Construct a span.
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Exclusive end offset, or `None` if `offset + size` overflows —
    /// overflow is itself a corruption signal.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }

    /// Whether `[offset, offset+len)` lies fully inside this span.
    pub fn contains_range(&self, offset: u64, len: u64) -> bool {
        let Some(range_end) = offset.checked_add(len) else {
            return false;
        };
        let Some(span_end) = self.end() else {
            return false;
        };
        offset >= self.offset && range_end <= span_end
    }
}

impl Encode for SectionSpan {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SectionSpan {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { offset, size }, off))
    }
}

// ------------------------------------------------------------------------------------------------
// FileHeader
// ------------------------------------------------------------------------------------------------

/// The decoded UFF header: version, declared file size, flags, and the
/// four-section table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Format version.
    pub version: u32,

    /// File size at the last header flush. Readers tolerate trailing
    /// zero padding beyond the live sections up to this size.
    pub file_size: u64,

    /// Flag bits ([`FLAG_CLEAN_SHUTDOWN`], [`FLAG_COMPRESSION`]).
    pub flags: u32,

    /// Entity record section.
    pub data: SectionSpan,

    /// Interned tag string dictionary section.
    pub dict: SectionSpan,

    /// Persisted index snapshot section.
    pub index: SectionSpan,

    /// Embedded write-ahead log section.
    pub wal: SectionSpan,
}

impl FileHeader {
    /// A fresh header for an empty database: all sections empty, data
    /// starting immediately after the header.
    pub fn empty() -> Self {
        Self {
            version: VERSION,
            file_size: HEADER_LEN as u64,
            flags: 0,
            data: SectionSpan::new(HEADER_LEN as u64, 0),
            dict: SectionSpan::default(),
            index: SectionSpan::default(),
            wal: SectionSpan::default(),
        }
    }

    /// Whether the clean-shutdown bit is set.
    pub fn is_clean_shutdown(&self) -> bool {
        self.flags & FLAG_CLEAN_SHUTDOWN != 0
    }

    /// Set or clear the clean-shutdown bit.
    pub fn set_clean_shutdown(&mut self, clean: bool) {
        if clean {
            self.flags |= FLAG_CLEAN_SHUTDOWN;
        } else {
            self.flags &= !FLAG_CLEAN_SHUTDOWN;
        }
    }

    /// Encode the full [`HEADER_LEN`]-byte header, CRC included.
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        MAGIC.encode_to(&mut buf)?;
        self.version.encode_to(&mut buf)?;
        self.file_size.encode_to(&mut buf)?;
        self.flags.encode_to(&mut buf)?;
        self.data.encode_to(&mut buf)?;
        self.dict.encode_to(&mut buf)?;
        self.index.encode_to(&mut buf)?;
        self.wal.encode_to(&mut buf)?;
        buf.resize(HEADER_CRC_COVERAGE, 0);

        let mut hasher = Crc32::new();
        hasher.update(&buf);
        hasher.finalize().encode_to(&mut buf)?;
        Ok(buf)
    }

    /// Decode and verify a header from the first [`HEADER_LEN`] bytes of
    /// `buf`. Checks CRC first, then magic, then version.
    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_LEN {
            return Err(FormatError::Truncated(buf.len()));
        }

        let covered = &buf[..HEADER_CRC_COVERAGE];
        let (stored_crc, _) = u32::decode_from(&buf[HEADER_CRC_COVERAGE..HEADER_LEN])?;
        let mut hasher = Crc32::new();
        hasher.update(covered);
        if hasher.finalize() != stored_crc {
            return Err(FormatError::ChecksumMismatch);
        }

        let mut off = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[off..])?;
        off += n;
        if magic != MAGIC {
            return Err(FormatError::BadMagic);
        }

        let (version, n) = u32::decode_from(&buf[off..])?;
        off += n;
        if version != VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let (file_size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (flags, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (data, n) = SectionSpan::decode_from(&buf[off..])?;
        off += n;
        let (dict, n) = SectionSpan::decode_from(&buf[off..])?;
        off += n;
        let (index, n) = SectionSpan::decode_from(&buf[off..])?;
        off += n;
        let (wal, _) = SectionSpan::decode_from(&buf[off..])?;

        Ok(Self {
            version,
            file_size,
            flags,
            data,
            dict,
            index,
            wal,
        })
    }

    /// Validate that every section fits within `actual_file_size` and
    /// that no two non-empty sections overlap.
    ///
    /// `actual_file_size` is what the filesystem reports; the declared
    /// `file_size` must not exceed it either (a shrunk file is
    /// corruption, extra trailing bytes are tolerated).
    pub fn validate_layout(&self, actual_file_size: u64) -> Result<(), FormatError> {
        if self.file_size > actual_file_size || self.file_size < HEADER_LEN as u64 {
            return Err(FormatError::SectionOutOfBounds {
                name: "header",
                offset: 0,
                size: HEADER_LEN as u64,
                file_size: self.file_size,
            });
        }

        let sections = self.named_sections();
        for (name, span) in sections {
            if span.size == 0 {
                continue;
            }
            let in_bounds = span.offset >= HEADER_LEN as u64
                && span
                    .end()
                    .map(|end| end <= self.file_size)
                    .unwrap_or(false);
            if !in_bounds {
                return Err(FormatError::SectionOutOfBounds {
                    name,
                    offset: span.offset,
                    size: span.size,
                    file_size: self.file_size,
                });
            }
        }

        for (i, (name_a, a)) in sections.iter().enumerate() {
            for (name_b, b) in &sections[i + 1..] {
                if a.size == 0 || b.size == 0 {
                    continue;
                }
                // end() verified above for non-empty, in-bounds sections.
                let a_end = a.end().unwrap_or(u64::MAX);
                let b_end = b.end().unwrap_or(u64::MAX);
                let disjoint = a_end <= b.offset || b_end <= a.offset;
                if !disjoint {
                    return Err(FormatError::SectionOverlap {
                        a: name_a,
                        b: name_b,
                    });
                }
            }
        }

        Ok(())
    }

    fn named_sections(&self) -> [(&'static str, SectionSpan); 4] {
        [
            ("data", self.data),
            ("dict", self.dict),
            ("index", self.index),
            ("wal", self.wal),
        ]
    }
}
