//! Embedded Write-Ahead Log
//!
//! The WAL is a **section inside the unified database file**, not a file
//! of its own. Every mutation is framed, checksummed, and fsynced here
//! before the entity record lands in the data section, so a crash at any
//! point between those two appends is recoverable by replay.
//!
//! # On-disk frame layout
//!
//! ```text
//! [LEN_LE u32][OP u8][PAYLOAD bytes][CRC32_LE u32]
//! ```
//!
//! - `LEN` counts the payload only and must be ≤ [`MAX_ENTRY_LEN`]
//!   (100 MiB). The guard exists because a corrupted length field once
//!   meant a multi-GiB allocation attempt; here it means a skip.
//! - `CRC32` covers `LEN || OP || PAYLOAD`.
//!
//! # Replay protocol
//!
//! Replay seeks to the **WAL section offset** — never to file offset 0;
//! with an embedded log that distinction is what makes recovery a single
//! open + seek. Each frame is then classified:
//!
//! - `LEN == 0` → the zeroed tail of the section; count one skip, stop.
//! - `LEN > MAX` → seek past `LEN` bytes (clamped to the section end),
//!   count a skip, continue.
//! - CRC mismatch → count a skip, continue at the next frame.
//! - Unknown op byte, undecodable payload, or payload failing entity
//!   validation → count a skip, continue.
//! - Torn tail (frame runs past the section end) → count a skip, stop.
//!
//! Replay **never** aborts on a bad frame. The `entries_replayed` /
//! `entries_skipped` counters are surfaced through store statistics.

#[cfg(test)]
mod tests;

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::entity::Entity;
use crate::tag::{self, Tag};

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Frame overhead: length prefix + op byte + trailing CRC.
pub const FRAME_OVERHEAD: u64 = (U32_SIZE + 1 + U32_SIZE) as u64;

/// Maximum payload length of a single WAL entry (100 MiB).
pub const MAX_ENTRY_LEN: u32 = 100 * 1024 * 1024;

const OP_CREATE: u8 = 0;
const OP_UPDATE: u8 = 1;
/// Reserved for future purge support; replay skips it.
const OP_TOMBSTONE: u8 = 2;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
///
/// Note that *corrupt frames during replay are not errors* — they are
/// counted and skipped. Only genuine I/O and encoding failures on the
/// append path (or a poisoned lock) surface here.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding error while serializing an op for append.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// An op serialized beyond [`MAX_ENTRY_LEN`].
    #[error("WAL entry size {0} exceeds limit")]
    EntryTooLarge(usize),

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Operations
// ------------------------------------------------------------------------------------------------

/// A logged mutation. The payload is fully self-contained (tags inline,
/// content uncompressed) so replay needs no dictionary.
#[derive(Debug, Clone, PartialEq)]
pub enum WalOp {
    /// First write of an entity: the complete initial state.
    Create {
        /// The entity as submitted, validation already passed.
        entity: Entity,
    },

    /// Additive tag append and optional content replacement.
    Update {
        /// Target entity id.
        id: String,
        /// Tags appended by this update, in submission order.
        added: Vec<Tag>,
        /// Replacement content, if the update set one.
        content: Option<Vec<u8>>,
    },
}

impl WalOp {
    fn op_byte(&self) -> u8 {
        match self {
            WalOp::Create { .. } => OP_CREATE,
            WalOp::Update { .. } => OP_UPDATE,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = Vec::new();
        match self {
            WalOp::Create { entity } => entity.encode_to(&mut buf)?,
            WalOp::Update { id, added, content } => {
                id.encode_to(&mut buf)?;
                encoding::encode_vec(added, &mut buf)?;
                content.encode_to(&mut buf)?;
            }
        }
        Ok(buf)
    }

    fn decode_payload(op: u8, payload: &[u8]) -> Result<Option<WalOp>, EncodingError> {
        match op {
            OP_CREATE => {
                let (entity, _) = Entity::decode_from(payload)?;
                Ok(Some(WalOp::Create { entity }))
            }
            OP_UPDATE => {
                let mut off = 0;
                let (id, n) = String::decode_from(&payload[off..])?;
                off += n;
                let (added, n) = encoding::decode_vec::<Tag>(&payload[off..])?;
                off += n;
                let (content, _) = Option::<Vec<u8>>::decode_from(&payload[off..])?;
                Ok(Some(WalOp::Update { id, added, content }))
            }
            // Reserved op: well-formed but carrying nothing we apply.
            OP_TOMBSTONE => Ok(None),
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "WalOp",
            }),
        }
    }

    /// Re-run the write-boundary validation against a replayed op, so a
    /// frame that decodes but carries illegal data is skipped rather
    /// than applied.
    fn validate(&self) -> bool {
        match self {
            WalOp::Create { entity } => entity.validate().is_ok(),
            WalOp::Update { id, added, content } => {
                tag::validate_id(id).is_ok()
                    && added
                        .iter()
                        .all(|t| t.ts != 0 && tag::validate_value(&t.value).is_ok())
                    && content
                        .as_ref()
                        .map(|c| c.len() <= crate::entity::MAX_CONTENT_LEN)
                        .unwrap_or(true)
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// WAL core
// ------------------------------------------------------------------------------------------------

/// The embedded WAL section of one database file.
///
/// Shares the writer's file handle via `Arc<Mutex<File>>`; appends are
/// serialized by that lock on top of the store's writer mutex. The WAL
/// tracks only its own `(start, len)` — the store owns the header that
/// persists them.
#[derive(Debug)]
pub struct Wal {
    /// Writer file handle, shared with the store.
    file: Arc<Mutex<File>>,

    /// Absolute byte offset of the WAL section start.
    start: u64,

    /// Current logical length of the WAL section.
    len: u64,
}

impl Wal {
    /// Attach to the WAL section at `start` with `len` existing bytes.
    pub fn new(file: Arc<Mutex<File>>, start: u64, len: u64) -> Self {
        Self { file, start, len }
    }

    /// Absolute offset of the section start.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Current section length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the WAL currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one framed op at the section end.
    ///
    /// When `fsync` is set the data is flushed with `sync_data` before
    /// returning — the durability point of every write.
    pub fn append(&mut self, op: &WalOp, fsync: bool) -> Result<(), WalError> {
        let payload = op.encode_payload()?;
        let payload_len =
            u32::try_from(payload.len()).map_err(|_| WalError::EntryTooLarge(payload.len()))?;
        if payload_len > MAX_ENTRY_LEN {
            return Err(WalError::EntryTooLarge(payload.len()));
        }

        let len_bytes = payload_len.to_le_bytes();
        let op_byte = [op.op_byte()];
        let crc = compute_crc(&[&len_bytes, &op_byte, &payload]);

        let mut guard = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("writer file mutex poisoned".into()))?;

        guard.seek(SeekFrom::Start(self.start + self.len))?;
        guard.write_all(&len_bytes)?;
        guard.write_all(&op_byte)?;
        guard.write_all(&payload)?;
        guard.write_all(&crc.to_le_bytes())?;
        if fsync {
            guard.sync_data()?;
        }

        self.len += FRAME_OVERHEAD + u64::from(payload_len);

        trace!(
            len = payload_len,
            wal_bytes = self.len,
            crc = format_args!("{crc:08x}"),
            "WAL entry appended"
        );
        Ok(())
    }

    /// Start a streaming replay over `[start, start + len)`.
    pub fn replay(&self) -> WalReplayer {
        debug!(start = self.start, len = self.len, "WAL replay started");
        WalReplayer {
            file: Arc::clone(&self.file),
            offset: self.start,
            end: self.start + self.len,
            replayed: 0,
            skipped: 0,
        }
    }

    /// Logically empty the WAL and move its section start to
    /// `new_start`. The caller (checkpoint) rewrites the header and
    /// truncates the physical file.
    pub fn reset(&mut self, new_start: u64) {
        self.start = new_start;
        self.len = 0;
    }
}

// ------------------------------------------------------------------------------------------------
// Replay
// ------------------------------------------------------------------------------------------------

/// Streaming, skip-and-continue WAL replayer.
///
/// Yields only valid ops. Corrupt, oversize, torn, or invalid frames
/// bump [`WalReplayer::skipped`] and replay moves on; replay terminates
/// at the section end or at the zeroed tail.
#[derive(Debug)]
pub struct WalReplayer {
    file: Arc<Mutex<File>>,
    offset: u64,
    end: u64,

    /// Frames successfully decoded, validated, and yielded.
    pub replayed: u64,

    /// Frames skipped for any reason (length guard, CRC, decode,
    /// validation, torn tail, reserved op).
    pub skipped: u64,
}

impl WalReplayer {
    /// Pull the next valid op, or `None` at the end of the section.
    ///
    /// `Err` is reserved for genuine I/O failures; corruption is
    /// counted, logged, and stepped over.
    pub fn next_op(&mut self) -> Result<Option<WalOp>, WalError> {
        loop {
            if self.offset >= self.end {
                return Ok(None);
            }

            let mut guard = self
                .file
                .lock()
                .map_err(|_| WalError::Internal("writer file mutex poisoned".into()))?;
            guard.seek(SeekFrom::Start(self.offset))?;

            // Length prefix.
            let mut len_bytes = [0u8; U32_SIZE];
            if self.offset + U32_SIZE as u64 > self.end {
                warn!(offset = self.offset, "WAL torn tail: partial length prefix");
                self.skipped += 1;
                self.offset = self.end;
                return Ok(None);
            }
            guard.read_exact(&mut len_bytes)?;
            let payload_len = u32::from_le_bytes(len_bytes);

            if payload_len == 0 {
                // Zeroed tail — nothing after this can be a frame.
                warn!(offset = self.offset, "WAL zero-length entry, stopping replay");
                self.skipped += 1;
                self.offset = self.end;
                return Ok(None);
            }

            if payload_len > MAX_ENTRY_LEN {
                // A corrupted length field must not become an allocation:
                // seek past the claimed payload, clamped to the section.
                warn!(
                    offset = self.offset,
                    len = payload_len,
                    "WAL entry length exceeds limit, seeking past"
                );
                self.skipped += 1;
                self.offset = (self.offset + U32_SIZE as u64)
                    .saturating_add(u64::from(payload_len))
                    .min(self.end);
                continue;
            }

            let frame_len = FRAME_OVERHEAD + u64::from(payload_len);
            if self.offset + frame_len > self.end {
                warn!(
                    offset = self.offset,
                    len = payload_len,
                    "WAL torn tail: frame runs past section end"
                );
                self.skipped += 1;
                self.offset = self.end;
                return Ok(None);
            }

            let mut op_byte = [0u8; 1];
            guard.read_exact(&mut op_byte)?;
            let mut payload = vec![0u8; payload_len as usize];
            guard.read_exact(&mut payload)?;
            let mut crc_bytes = [0u8; U32_SIZE];
            guard.read_exact(&mut crc_bytes)?;
            drop(guard);

            let entry_offset = self.offset;
            self.offset += frame_len;

            let stored_crc = u32::from_le_bytes(crc_bytes);
            if compute_crc(&[&len_bytes, &op_byte, &payload]) != stored_crc {
                warn!(offset = entry_offset, "WAL entry checksum mismatch, skipping");
                self.skipped += 1;
                continue;
            }

            match WalOp::decode_payload(op_byte[0], &payload) {
                Ok(Some(op)) => {
                    if !op.validate() {
                        warn!(offset = entry_offset, "WAL entry failed validation, skipping");
                        self.skipped += 1;
                        continue;
                    }
                    self.replayed += 1;
                    return Ok(Some(op));
                }
                Ok(None) => {
                    // Reserved op — counted but never applied.
                    self.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(offset = entry_offset, error = %e, "WAL entry undecodable, skipping");
                    self.skipped += 1;
                    continue;
                }
            }
        }
    }

    /// Drain the replayer into a vector of valid ops.
    pub fn collect_ops(mut self) -> Result<(Vec<WalOp>, u64, u64), WalError> {
        let mut ops = Vec::new();
        while let Some(op) = self.next_op()? {
            ops.push(op);
        }
        Ok((ops, self.replayed, self.skipped))
    }
}

// ------------------------------------------------------------------------------------------------
// CRC helpers
// ------------------------------------------------------------------------------------------------

/// CRC32 over one or more byte slices.
fn compute_crc(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}
