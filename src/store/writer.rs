//! Write path: single-writer commit discipline and checkpointing.
//!
//! All mutation flows through [`WriterState`], which the store wraps in
//! its writer mutex. A commit is:
//!
//! 1. intern + pin the record's tag strings,
//! 2. serialize the record to an owned buffer,
//! 3. append the op to the WAL and fsync it,
//! 4. append the record to the data section and note its offset,
//! 5. update the header (sizes, section table) and fsync last.
//!
//! A crash between 3 and 5 is healed by WAL replay at the next open.
//!
//! # Section growth
//!
//! The data section grows into a reserved gap between its end and the
//! dictionary offset. When a record would not fit, the commit first
//! runs a checkpoint, which relocates the dict/index/WAL sections past
//! the new data end with a fresh gap. The WAL itself is the final
//! section and grows freely at the end of the file.
//!
//! # Checkpoint
//!
//! Rewrites the dictionary and index sections from memory, truncates
//! the WAL to empty, and fsyncs the header **last** — the header write
//! is the commit point; a crash mid-checkpoint leaves the previous
//! header (and a stale-but-redundant WAL) in effect.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crc32fast::Hasher as Crc32;
use fs2::FileExt;
use tracing::{debug, info};

use crate::encoding::{self, Decode, Encode};
use crate::entity::{self, Entity};
use crate::format::{FileHeader, HEADER_LEN, SectionSpan};
use crate::index::IndexSet;
use crate::intern::Interner;
use crate::store::{StoreConfig, StoreError};
use crate::wal::{Wal, WalOp};

/// Absolute start of the data section — fixed for the file's lifetime.
pub(crate) const DATA_START: u64 = HEADER_LEN as u64;

/// Minimum growth gap reserved between the data end and the dictionary
/// section at checkpoint.
const MIN_GROWTH_GAP: u64 = 64 * 1024;

fn growth_gap(data_len: u64) -> u64 {
    MIN_GROWTH_GAP.max(data_len / 4)
}

// ------------------------------------------------------------------------------------------------
// WriterState
// ------------------------------------------------------------------------------------------------

/// Exclusive writer-side state: the writer file handle, the in-memory
/// header, and the embedded WAL.
pub struct WriterState {
    file: Arc<Mutex<File>>,
    header: FileHeader,
    wal: Wal,
    data_end: u64,

    /// First byte the data section must not reach (dictionary offset).
    gap_end: u64,

    last_checkpoint: Instant,
}

impl WriterState {
    pub(crate) fn new(file: Arc<Mutex<File>>, header: FileHeader, wal: Wal) -> Self {
        let data_end = header.data.offset + header.data.size;
        let gap_end = header.dict.offset;
        Self {
            file,
            header,
            wal,
            data_end,
            gap_end,
            last_checkpoint: Instant::now(),
        }
    }

    /// Absolute end of committed data.
    pub fn data_end(&self) -> u64 {
        self.data_end
    }

    /// Data section length in bytes.
    pub fn data_len(&self) -> u64 {
        self.data_end - DATA_START
    }

    /// Current WAL length in bytes.
    pub fn wal_len(&self) -> u64 {
        self.wal.len()
    }

    /// Whether the WAL holds no entries.
    pub fn wal_is_empty(&self) -> bool {
        self.wal.is_empty()
    }

    /// Time since the last checkpoint.
    pub fn checkpoint_age(&self) -> Duration {
        self.last_checkpoint.elapsed()
    }

    /// Release the advisory file lock (close path).
    pub(crate) fn unlock_file(&self) -> std::io::Result<()> {
        let guard = self
            .file
            .lock()
            .map_err(|_| std::io::Error::other("writer file mutex poisoned"))?;
        FileExt::unlock(&*guard)
    }

    // --------------------------------------------------------------------------------------------
    // Commit
    // --------------------------------------------------------------------------------------------

    /// Commit one mutation: WAL first, then the entity record. Returns
    /// the absolute offset of the new record.
    pub(crate) fn commit(
        &mut self,
        op: &WalOp,
        next_state: &Entity,
        interner: &Arc<Interner>,
        index: &Arc<IndexSet>,
        config: &StoreConfig,
    ) -> Result<u64, StoreError> {
        // 1. Intern and pin every tag value the record will reference.
        for t in &next_state.tags {
            let id = interner.intern(&t.value);
            interner.pin(id);
        }

        // 2. Serialize to an owned buffer before touching the file.
        let record = entity::encode_record(
            next_state,
            interner.as_ref(),
            config.compression_threshold_bytes,
        )?;

        // Relocate sections if the record will not fit in the gap. The
        // relocation reserves at least the record's own size, so even a
        // record larger than the default gap lands cleanly.
        if self.data_end + record.len() as u64 > self.gap_end {
            debug!(
                needed = record.len(),
                gap = self.gap_end - self.data_end,
                "data growth gap exhausted; checkpointing to relocate sections"
            );
            self.checkpoint_with_gap(interner, index, false, record.len() as u64)?;
        }

        // 3. WAL first — the durability point of the write.
        self.wal.append(op, config.fsync_on_write)?;

        // 4. Entity record into the data section.
        let offset = self.data_end;
        {
            let mut guard = self
                .file
                .lock()
                .map_err(|_| StoreError::Fatal("writer file mutex poisoned".into()))?;
            guard.seek(SeekFrom::Start(offset))?;
            guard.write_all(&record)?;
        }
        self.data_end += record.len() as u64;

        // 5. Header last: sizes, then optional fsync of everything.
        self.header.data = SectionSpan::new(DATA_START, self.data_len());
        self.header.wal = SectionSpan::new(self.wal.start(), self.wal.len());
        self.header.file_size = self
            .header
            .file_size
            .max(self.wal.start() + self.wal.len());
        self.header.set_clean_shutdown(false);
        self.write_header(config.fsync_on_write)?;

        Ok(offset)
    }

    // --------------------------------------------------------------------------------------------
    // Checkpoint
    // --------------------------------------------------------------------------------------------

    /// Reconcile: rewrite dict + index sections after a fresh growth
    /// gap, truncate the WAL, and commit the new layout via the header.
    ///
    /// Idempotent: with no intervening writes a second run rewrites the
    /// same sections and leaves the data section untouched.
    pub(crate) fn checkpoint(
        &mut self,
        interner: &Arc<Interner>,
        index: &Arc<IndexSet>,
        clean_shutdown: bool,
    ) -> Result<(), StoreError> {
        self.checkpoint_with_gap(interner, index, clean_shutdown, 0)
    }

    fn checkpoint_with_gap(
        &mut self,
        interner: &Arc<Interner>,
        index: &Arc<IndexSet>,
        clean_shutdown: bool,
        min_gap: u64,
    ) -> Result<(), StoreError> {
        let dict_bytes = encode_dict(&interner.snapshot_pinned())?;
        let index_bytes = index.snapshot()?;

        let gap = growth_gap(self.data_len()).max(min_gap);
        let dict_offset = self.data_end + gap;
        let index_offset = dict_offset + dict_bytes.len() as u64;
        let wal_offset = index_offset + index_bytes.len() as u64;

        {
            let mut guard = self
                .file
                .lock()
                .map_err(|_| StoreError::Fatal("writer file mutex poisoned".into()))?;
            guard.seek(SeekFrom::Start(dict_offset))?;
            guard.write_all(&dict_bytes)?;
            guard.write_all(&index_bytes)?;
            // Truncating here both discards the old WAL region and
            // zero-fills any extension, so a later replay of an empty
            // WAL sees the zeroed tail immediately.
            guard.set_len(wal_offset)?;
            guard.sync_data()?;
        }

        self.header.data = SectionSpan::new(DATA_START, self.data_len());
        self.header.dict = SectionSpan::new(dict_offset, dict_bytes.len() as u64);
        self.header.index = SectionSpan::new(index_offset, index_bytes.len() as u64);
        self.header.wal = SectionSpan::new(wal_offset, 0);
        self.header.file_size = wal_offset;
        self.header.set_clean_shutdown(clean_shutdown);
        // Header fsync is the checkpoint's commit point, regardless of
        // the per-write fsync policy.
        self.write_header(true)?;

        self.wal.reset(wal_offset);
        self.gap_end = dict_offset;
        self.last_checkpoint = Instant::now();

        info!(
            data_bytes = self.data_len(),
            dict_bytes = dict_bytes.len(),
            index_bytes = index_bytes.len(),
            clean_shutdown,
            "checkpoint complete"
        );
        Ok(())
    }

    fn write_header(&mut self, sync: bool) -> Result<(), StoreError> {
        let bytes = self.header.encode()?;
        let mut guard = self
            .file
            .lock()
            .map_err(|_| StoreError::Fatal("writer file mutex poisoned".into()))?;
        guard.seek(SeekFrom::Start(0))?;
        guard.write_all(&bytes)?;
        if sync {
            guard.sync_data()?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Dictionary section codec
// ------------------------------------------------------------------------------------------------

/// Encode the dictionary section: `[u32 count] (id, value)* [crc32]`.
pub(crate) fn encode_dict(entries: &[(u32, String)]) -> Result<Vec<u8>, StoreError> {
    let mut body = Vec::new();
    u32::try_from(entries.len())
        .map_err(|_| StoreError::Fatal("dictionary entry count overflow".into()))?
        .encode_to(&mut body)
        .map_err(|e| StoreError::Fatal(e.to_string()))?;
    for (id, value) in entries {
        id.encode_to(&mut body)
            .map_err(|e| StoreError::Fatal(e.to_string()))?;
        value
            .encode_to(&mut body)
            .map_err(|e| StoreError::Fatal(e.to_string()))?;
    }
    let mut hasher = Crc32::new();
    hasher.update(&body);
    hasher
        .finalize()
        .encode_to(&mut body)
        .map_err(|e| StoreError::Fatal(e.to_string()))?;
    Ok(body)
}

/// Decode and verify a dictionary section.
pub(crate) fn decode_dict(bytes: &[u8]) -> Result<Vec<(u32, String)>, StoreError> {
    if bytes.len() < 4 {
        return Err(StoreError::Corrupt("dictionary section truncated".into()));
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let (stored_crc, _) =
        u32::decode_from(crc_bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let mut hasher = Crc32::new();
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return Err(StoreError::Corrupt(
            "dictionary section checksum mismatch".into(),
        ));
    }

    let mut off = 0;
    let (count, n) = u32::decode_from(&body[off..]).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    off += n;
    if count > encoding::MAX_VEC_ELEMENTS {
        return Err(StoreError::Corrupt(format!(
            "dictionary entry count {count} exceeds limit"
        )));
    }
    let mut entries = Vec::with_capacity((count as usize).min(1024));
    for _ in 0..count {
        let (id, n) = u32::decode_from(&body[off..]).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        off += n;
        let (value, n) =
            String::decode_from(&body[off..]).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        off += n;
        entries.push((id, value));
    }
    Ok(entries)
}
