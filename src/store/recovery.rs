//! Recovery and integrity: open-time bootstrap, WAL replay application,
//! and runtime self-healing.
//!
//! # At open
//!
//! 1. Take the advisory exclusive lock (single writer across
//!    processes).
//! 2. Verify header magic, version, CRC; validate that every section
//!    fits the file and none overlap. An unreadable header is
//!    unrecoverable — the open fails.
//! 3. Load the dictionary section (corruption degrades to an empty
//!    dictionary with a warning — inline tags still decode).
//! 4. Load the index snapshot; on any validation failure fall back to a
//!    full data-section scan.
//! 5. Replay the WAL with skip-and-continue semantics, deduplicate
//!    already-applied entries, commit the replayed state into the data
//!    section and indices, then checkpoint (which truncates the WAL).
//!
//! # At runtime
//!
//! A read that hits a record failing its digest, its bounds, or its
//! id/index agreement marks the index entry suspect and triggers
//! [`recover_entity`]: a full scan of the data section that rebuilds
//! **all** indices from what actually decodes (self-heal), then retries
//! the lookup. Corruption is counted and logged, never propagated as a
//! panic.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use tracing::{info, warn};

use crate::entity::{self, Entity};
use crate::format::{FileHeader, HEADER_LEN, SectionSpan};
use crate::index::IndexSet;
use crate::intern::Interner;
use crate::store::writer::{self, DATA_START, WriterState};
use crate::store::{EntityStore, StoreConfig, StoreError};
use crate::tag::Tag;
use crate::wal::{Wal, WalOp};

// ------------------------------------------------------------------------------------------------
// Open
// ------------------------------------------------------------------------------------------------

/// Everything `EntityStore::open` needs from the recovery pass.
pub(crate) struct OpenedDatabase {
    pub(crate) writer: WriterState,
    pub(crate) index: Arc<IndexSet>,
    pub(crate) interner: Arc<Interner>,
    pub(crate) replayed: u64,
    pub(crate) skipped: u64,
}

/// Open or create the unified file, run recovery, and hand back a
/// consistent writer + index + interner.
pub(crate) fn open_database(
    path: &Path,
    config: &StoreConfig,
) -> Result<OpenedDatabase, StoreError> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;

    file.try_lock_exclusive().map_err(|_| {
        StoreError::Fatal(format!(
            "database {} is locked by another process",
            path.display()
        ))
    })?;

    let file_len = file.metadata()?.len();
    let header = if file_len == 0 {
        initialize_file(&mut file)?
    } else {
        let mut header_bytes = vec![0u8; HEADER_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header_bytes).map_err(|e| {
            StoreError::Fatal(format!("header unreadable: {e}"))
        })?;
        let header = FileHeader::decode(&header_bytes)
            .map_err(|e| StoreError::Fatal(format!("header invalid: {e}")))?;
        header
            .validate_layout(file_len)
            .map_err(|e| StoreError::Fatal(format!("section layout invalid: {e}")))?;
        header
    };

    if !header.is_clean_shutdown() && file_len != 0 {
        warn!(path = %path.display(), "previous session did not shut down cleanly");
    }

    // Dictionary: needed before any dict-encoded record can decode.
    let interner = Arc::new(Interner::new(
        config.string_intern_entries,
        config.string_intern_bytes,
    ));
    if header.dict.size > 0 {
        match read_span(&mut file, header.dict)
            .map_err(StoreError::from)
            .and_then(|bytes| writer::decode_dict(&bytes))
        {
            Ok(entries) => interner.load_pinned(entries),
            Err(e) => {
                // Inline-encoded tags still decode; dictionary-encoded
                // ones will surface as per-record corruption.
                warn!(error = %e, "dictionary section unreadable; continuing with empty dictionary");
            }
        }
    }

    // Index snapshot, or full rescan on any validation failure. A
    // snapshot that is valid but *stale* — records were appended after
    // the checkpoint that wrote it — is also rescanned, so a lost WAL
    // frame can never orphan a record that reached the data section.
    let data_span = header.data;
    let mut rebuilt = false;
    let index = if header.index.size > 0 {
        match read_span(&mut file, header.index)
            .map_err(StoreError::from)
            .and_then(|bytes| {
                IndexSet::load(
                    &bytes,
                    config.bloom_expected_tags,
                    config.bloom_false_positive_rate,
                )
                .map_err(StoreError::from)
            }) {
            Ok(loaded) => {
                let covered = index_covered_end(&mut file, &loaded);
                let data_end = data_span.offset + data_span.size;
                if covered < data_end {
                    warn!(
                        covered,
                        data_end, "index snapshot is stale; rebuilding from data section"
                    );
                    rebuilt = true;
                    Arc::new(rebuild_index_from_scan(&mut file, data_span, &interner, config)?)
                } else {
                    Arc::new(loaded)
                }
            }
            Err(e) => {
                warn!(error = %e, "index snapshot invalid; rebuilding from data section");
                rebuilt = true;
                Arc::new(rebuild_index_from_scan(
                    &mut file,
                    data_span,
                    &interner,
                    config,
                )?)
            }
        }
    } else {
        rebuilt = data_span.size > 0;
        Arc::new(rebuild_index_from_scan(
            &mut file,
            data_span,
            &interner,
            config,
        )?)
    };

    // WAL replay.
    let shared_file = Arc::new(Mutex::new(file));
    let mut wal = Wal::new(Arc::clone(&shared_file), header.wal.offset, header.wal.size);
    let (ops, replayed, skipped) = wal.replay().collect_ops()?;

    let mut writer = WriterState::new(Arc::clone(&shared_file), header, wal);
    let dirty = !ops.is_empty() || rebuilt;

    if !ops.is_empty() {
        apply_replayed_ops(ops, &mut writer, &index, &interner, config, &shared_file)?;
    }

    if dirty {
        // Commit the replayed state: sections rewritten, WAL truncated.
        writer.checkpoint(&interner, &index, false)?;
    }

    if replayed > 0 || skipped > 0 {
        info!(replayed, skipped, "WAL replay finished");
    }

    Ok(OpenedDatabase {
        writer,
        index,
        interner,
        replayed,
        skipped,
    })
}

/// Lay out a brand-new database file: empty data section, a growth
/// gap, empty dict/index, empty WAL.
fn initialize_file(file: &mut File) -> Result<FileHeader, StoreError> {
    let mut header = FileHeader::empty();
    let tail = DATA_START + 64 * 1024;
    header.data = SectionSpan::new(DATA_START, 0);
    header.dict = SectionSpan::new(tail, 0);
    header.index = SectionSpan::new(tail, 0);
    header.wal = SectionSpan::new(tail, 0);
    header.file_size = tail;
    header.set_clean_shutdown(true);

    file.set_len(tail)?;
    let bytes = header.encode()?;
    file.seek(SeekFrom::Start(0))?;
    std::io::Write::write_all(file, &bytes)?;
    file.sync_all()?;
    Ok(header)
}

fn read_span(file: &mut File, span: SectionSpan) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(span.offset))?;
    let mut buf = vec![0u8; span.size as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// The byte just past the last record a loaded index snapshot knows
/// about: the end of the record at the maximal indexed offset, or the
/// data-section start for an empty index. Zero on any read failure, so
/// callers treat an unreadable tail as staleness.
fn index_covered_end(file: &mut File, index: &IndexSet) -> u64 {
    let Some(max_offset) = index.id_entries().iter().map(|(_, off)| *off).max() else {
        return DATA_START;
    };
    let mut len_bytes = [0u8; 4];
    let ok = file
        .seek(SeekFrom::Start(max_offset))
        .and_then(|_| file.read_exact(&mut len_bytes));
    if ok.is_err() {
        return 0;
    }
    let payload_len = u32::from_le_bytes(len_bytes);
    if payload_len == 0 || payload_len > entity::MAX_RECORD_LEN {
        return 0;
    }
    max_offset + entity::framed_len(payload_len as usize) as u64
}

// ------------------------------------------------------------------------------------------------
// Data-section scanning
// ------------------------------------------------------------------------------------------------

/// Walk the data section record-by-record, returning the **latest**
/// decodable record per id (updates append full-state records, so the
/// last one wins).
///
/// A record whose payload fails to decode is stepped over via its
/// length prefix, so one bad record never hides the tail of the
/// section. The walk only stops when the frame structure itself is
/// gone (implausible length, overrun, unreadable bytes).
fn scan_records(
    mut read_at: impl FnMut(u64, usize) -> std::io::Result<Vec<u8>>,
    span: SectionSpan,
    dict: &Interner,
) -> Vec<(Entity, u64)> {
    let mut latest: HashMap<String, (Entity, u64)> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let end = span.offset + span.size;
    let mut offset = span.offset;

    while offset + 4 <= end {
        let Ok(len_bytes) = read_at(offset, 4) else {
            warn!(offset, "data scan: length prefix unreadable; stopping");
            break;
        };
        let payload_len =
            u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        if payload_len == 0 || payload_len > entity::MAX_RECORD_LEN {
            warn!(offset, len = payload_len, "data scan: record length out of bounds; stopping");
            break;
        }
        let framed = entity::framed_len(payload_len as usize);
        if offset + framed as u64 > end {
            warn!(offset, "data scan: record overruns section; stopping");
            break;
        }
        let Ok(bytes) = read_at(offset, framed) else {
            warn!(offset, "data scan: record unreadable; stopping");
            break;
        };
        match entity::decode_record(&bytes, dict) {
            Ok((decoded, _)) => {
                if !latest.contains_key(&decoded.id) {
                    order.push(decoded.id.clone());
                }
                latest.insert(decoded.id.clone(), (decoded, offset));
            }
            Err(e) => {
                warn!(offset, error = %e, "data scan: record undecodable; skipping frame");
            }
        }
        offset += framed as u64;
    }

    // Preserve first-seen order so rebuilt temporal sequences follow
    // the on-disk write order.
    order
        .into_iter()
        .filter_map(|id| latest.remove(&id))
        .collect()
}

fn rebuild_index_from_scan(
    file: &mut File,
    span: SectionSpan,
    interner: &Arc<Interner>,
    config: &StoreConfig,
) -> Result<IndexSet, StoreError> {
    let entities = scan_records(
        |offset, len| {
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf)?;
            Ok(buf)
        },
        span,
        interner,
    );
    Ok(IndexSet::rebuild_from(
        &entities,
        config.bloom_expected_tags,
        config.bloom_false_positive_rate,
    )?)
}

// ------------------------------------------------------------------------------------------------
// WAL replay application
// ------------------------------------------------------------------------------------------------

/// Fold replayed ops into per-entity pending states, skipping entries
/// whose effect is already present in the data section, then append one
/// record per touched entity and index the delta.
fn apply_replayed_ops(
    ops: Vec<WalOp>,
    writer: &mut WriterState,
    index: &Arc<IndexSet>,
    interner: &Arc<Interner>,
    config: &StoreConfig,
    file: &Arc<Mutex<File>>,
) -> Result<(), StoreError> {
    struct Pending {
        entity: Entity,
        new_tags: Vec<Tag>,
        is_new: bool,
    }

    let mut pending: Vec<(String, Pending)> = Vec::new();

    let find = |pending: &mut Vec<(String, Pending)>, id: &str| -> Option<usize> {
        pending.iter().position(|(pid, _)| pid == id)
    };

    for op in ops {
        match op {
            WalOp::Create { entity } => {
                let id = entity.id.clone();
                if find(&mut pending, &id).is_some() || index.contains_id(&id) {
                    // The record made it to the data section before the
                    // crash; this frame is already applied.
                    continue;
                }
                pending.push((
                    id,
                    Pending {
                        new_tags: entity.tags.clone(),
                        entity,
                        is_new: true,
                    },
                ));
            }
            WalOp::Update { id, added, content } => {
                let pos = match find(&mut pending, &id) {
                    Some(pos) => Some(pos),
                    None => {
                        // Pull the committed state into the pending set.
                        match index.offset_of(&id) {
                            Some(offset) => {
                                let current =
                                    read_record_from_file(file, offset, interner)?;
                                pending.push((
                                    id.clone(),
                                    Pending {
                                        entity: current,
                                        new_tags: Vec::new(),
                                        is_new: false,
                                    },
                                ));
                                Some(pending.len() - 1)
                            }
                            None => None,
                        }
                    }
                };
                let Some(pos) = pos else {
                    warn!(%id, "replayed update targets an unknown entity; skipping");
                    continue;
                };

                let p = &mut pending[pos].1;
                if tags_end_with(&p.entity.tags, &added)
                    && content
                        .as_ref()
                        .map(|c| *c == p.entity.content)
                        .unwrap_or(true)
                {
                    // Already applied before the crash.
                    continue;
                }
                p.entity.tags.extend(added.iter().cloned());
                p.new_tags.extend(added);
                if let Some(c) = content {
                    p.entity.content = c;
                }
            }
        }
    }

    for (id, p) in pending {
        let entity = Arc::new(p.entity);
        // Replay re-commits through the normal write path, WAL entry
        // included, so a crash during recovery is itself recoverable.
        let op = if p.is_new {
            WalOp::Create {
                entity: Entity::clone(&entity),
            }
        } else {
            WalOp::Update {
                id: id.clone(),
                added: p.new_tags.clone(),
                content: Some(entity.content.clone()),
            }
        };
        let offset = writer.commit(&op, &entity, interner, index, config)?;
        if p.is_new {
            index.note_created(&entity, offset)?;
        } else {
            index.note_updated(&id, &p.new_tags, offset)?;
        }
    }

    Ok(())
}

/// Whether `tags` already ends with the exact `suffix` sequence.
fn tags_end_with(tags: &[Tag], suffix: &[Tag]) -> bool {
    if suffix.is_empty() || suffix.len() > tags.len() {
        return suffix.is_empty();
    }
    tags[tags.len() - suffix.len()..] == *suffix
}

fn read_record_from_file(
    file: &Arc<Mutex<File>>,
    offset: u64,
    dict: &Interner,
) -> Result<Entity, StoreError> {
    let mut guard = file
        .lock()
        .map_err(|_| StoreError::Fatal("writer file mutex poisoned".into()))?;
    guard.seek(SeekFrom::Start(offset))?;
    let mut len_bytes = [0u8; 4];
    guard.read_exact(&mut len_bytes)?;
    let payload_len = u32::from_le_bytes(len_bytes);
    if payload_len == 0 || payload_len > entity::MAX_RECORD_LEN {
        return Err(StoreError::Corrupt(format!(
            "record length {payload_len} out of bounds at offset {offset}"
        )));
    }
    let framed = entity::framed_len(payload_len as usize);
    guard.seek(SeekFrom::Start(offset))?;
    let mut bytes = vec![0u8; framed];
    guard.read_exact(&mut bytes)?;
    drop(guard);

    let (decoded, _) = entity::decode_record(&bytes, dict)?;
    Ok(decoded)
}

// ------------------------------------------------------------------------------------------------
// Runtime self-heal
// ------------------------------------------------------------------------------------------------

/// Targeted recovery after a failed read: rescan the data section
/// through the reader pool, rebuild every index from what actually
/// decodes, swap it in, and retry the lookup.
pub(crate) fn recover_entity(store: &EntityStore, id: &str) -> Result<Arc<Entity>, StoreError> {
    // Serialize with the writer: the index swap below must not race a
    // mutation that is indexing against the old set. Callers reach
    // here from the lock-free read path, so this cannot deadlock.
    let _writer = store.lock_writer()?;

    let shared = store.shared();
    let span = SectionSpan::new(
        DATA_START,
        shared
            .data_end
            .load(std::sync::atomic::Ordering::SeqCst)
            .saturating_sub(DATA_START),
    );

    let mut lease = shared.pool.acquire(shared.config.reader_timeout)?;
    let entities = scan_records(
        |offset, len| lease.read_at(offset, len),
        span,
        &shared.interner,
    );
    drop(lease);

    let rebuilt = Arc::new(IndexSet::rebuild_from(
        &entities,
        shared.config.bloom_expected_tags,
        shared.config.bloom_false_positive_rate,
    )?);

    let recovered = entities
        .iter()
        .find(|(e, _)| e.id == id)
        .map(|(e, off)| (Arc::new(e.clone()), *off));

    store.swap_index(rebuilt)?;
    shared.cache.clear();
    warn!(
        id,
        entities = entities.len(),
        found = recovered.is_some(),
        "index rebuilt after runtime corruption"
    );

    match recovered {
        Some((entity, offset)) => {
            shared.cache.insert(offset, Arc::clone(&entity));
            Ok(entity)
        }
        None => Err(StoreError::Fatal(format!(
            "entity {id:?} could not be recovered from the data section"
        ))),
    }
}
