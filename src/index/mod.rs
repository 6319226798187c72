//! In-Memory Indices
//!
//! Four structures answer every lookup the repository serves, all
//! maintained in memory by the writer and persisted to the index
//! section at checkpoint:
//!
//! 1. **Id → offset map** — exact byte offset of the current record for
//!    each entity id.
//! 2. **Sharded tag → id-set index** — 256 shards keyed by
//!    `hash(tag) % 256`, each behind its own RW-lock. This is the
//!    single biggest query-performance lever in the engine.
//! 3. **Bloom filter** over tag values — short-circuits negative
//!    lookups before a shard lock is ever taken. Derived data: rebuilt
//!    from the tag index at load, never persisted.
//! 4. **Temporal B-tree** — keyed by nanosecond timestamp, holding
//!    `(sequence, entity, value)` insertions for range scans
//!    (changes-since, diff acceleration).
//!
//! # Concurrency
//!
//! Lookups take shard read locks only. Mutation happens exclusively
//! under the store's writer lock, and every new tag is visible in the
//! tag index and the temporal tree **before the write returns**.
//!
//! # Persistence
//!
//! [`IndexSet::snapshot`] encodes all non-derived state with a trailing
//! CRC32; [`IndexSet::load`] verifies it. A snapshot that fails
//! verification is discarded and the store falls back to a full
//! data-section rescan.

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::entity::Entity;
use crate::tag::Tag;

/// Number of tag-index shards.
pub const TAG_SHARDS: usize = 256;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by index snapshot persistence.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IndexError {
    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Snapshot CRC32 mismatch.
    #[error("Index snapshot checksum mismatch")]
    ChecksumMismatch,

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Temporal entries
// ------------------------------------------------------------------------------------------------

/// One tag insertion recorded in the temporal tree.
///
/// `seq` is a global, monotonically increasing insertion sequence — the
/// tie-break between entries that share a nanosecond.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporalEntry {
    /// Global insertion sequence.
    pub seq: u64,

    /// Owning entity id.
    pub entity_id: String,

    /// Stripped tag value.
    pub value: String,
}

impl Encode for TemporalEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.seq.encode_to(buf)?;
        self.entity_id.encode_to(buf)?;
        self.value.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for TemporalEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (seq, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (entity_id, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (value, n) = String::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                seq,
                entity_id,
                value,
            },
            off,
        ))
    }
}

/// A hit from a temporal range scan: `(ts, entry)` in ascending
/// `(ts, seq)` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporalHit {
    /// Tag creation timestamp.
    pub ts: i64,

    /// Owning entity id.
    pub entity_id: String,

    /// Stripped tag value.
    pub value: String,
}

// ------------------------------------------------------------------------------------------------
// IndexSet
// ------------------------------------------------------------------------------------------------

/// The complete in-memory index state for one open database.
pub struct IndexSet {
    /// id → absolute byte offset of the entity's current record.
    ids: RwLock<HashMap<String, u64>>,

    /// 256 shards of tag value → entity-id set.
    tag_shards: Vec<RwLock<HashMap<String, HashSet<String>>>>,

    /// Negative-lookup short circuit over tag values.
    bloom: RwLock<Bloom<str>>,

    /// ts → insertions at that nanosecond, in seq order.
    temporal: RwLock<BTreeMap<i64, Vec<TemporalEntry>>>,

    /// Global tag insertion sequence.
    next_seq: AtomicU64,

    bloom_expected: usize,
    bloom_fp_rate: f64,
}

impl IndexSet {
    /// Create an empty index set. `bloom_expected` / `bloom_fp_rate`
    /// size the filter.
    pub fn new(bloom_expected: usize, bloom_fp_rate: f64) -> Result<Self, IndexError> {
        let bloom = new_bloom(bloom_expected, bloom_fp_rate)?;
        Ok(Self {
            ids: RwLock::new(HashMap::new()),
            tag_shards: (0..TAG_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            bloom: RwLock::new(bloom),
            temporal: RwLock::new(BTreeMap::new()),
            next_seq: AtomicU64::new(0),
            bloom_expected,
            bloom_fp_rate,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Mutation (writer-lock side)
    // --------------------------------------------------------------------------------------------

    /// Record a freshly created entity at `offset`, indexing every tag.
    pub fn note_created(&self, entity: &Entity, offset: u64) -> Result<(), IndexError> {
        self.set_offset(&entity.id, offset)?;
        self.index_tags(&entity.id, &entity.tags)
    }

    /// Record an update: new current offset plus the tags this update
    /// appended.
    pub fn note_updated(
        &self,
        id: &str,
        added: &[Tag],
        offset: u64,
    ) -> Result<(), IndexError> {
        self.set_offset(id, offset)?;
        self.index_tags(id, added)
    }

    /// Point the id map at a new record offset.
    pub fn set_offset(&self, id: &str, offset: u64) -> Result<(), IndexError> {
        self.ids
            .write()
            .map_err(|_| IndexError::Internal("id index lock poisoned".into()))?
            .insert(id.to_string(), offset);
        Ok(())
    }

    /// Drop a suspect id mapping so reads stop hitting a bad offset.
    pub fn forget_offset(&self, id: &str) {
        if let Ok(mut ids) = self.ids.write() {
            ids.remove(id);
        }
    }

    fn index_tags(&self, id: &str, tags: &[Tag]) -> Result<(), IndexError> {
        for t in tags {
            let shard = &self.tag_shards[shard_of(&t.value)];
            shard
                .write()
                .map_err(|_| IndexError::Internal("tag shard lock poisoned".into()))?
                .entry(t.value.clone())
                .or_default()
                .insert(id.to_string());

            self.bloom
                .write()
                .map_err(|_| IndexError::Internal("bloom lock poisoned".into()))?
                .set(&t.value);

            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            self.temporal
                .write()
                .map_err(|_| IndexError::Internal("temporal lock poisoned".into()))?
                .entry(t.ts)
                .or_default()
                .push(TemporalEntry {
                    seq,
                    entity_id: id.to_string(),
                    value: t.value.clone(),
                });
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Lookup (read side)
    // --------------------------------------------------------------------------------------------

    /// Current record offset for `id`.
    pub fn offset_of(&self, id: &str) -> Option<u64> {
        self.ids.read().ok()?.get(id).copied()
    }

    /// Whether any entity carries this id.
    pub fn contains_id(&self, id: &str) -> bool {
        self.offset_of(id).is_some()
    }

    /// Number of indexed entities.
    pub fn entity_count(&self) -> usize {
        self.ids.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Every indexed id with its offset (used by checkpoint rescans).
    pub fn id_entries(&self) -> Vec<(String, u64)> {
        self.ids
            .read()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default()
    }

    /// Ids of entities carrying `value` as a tag, in no particular
    /// order. The Bloom filter short-circuits values never indexed.
    pub fn ids_for_tag(&self, value: &str) -> Vec<String> {
        match self.bloom.read() {
            Ok(bloom) if !bloom.check(value) => return Vec::new(),
            _ => {}
        }
        let shard = &self.tag_shards[shard_of(value)];
        shard
            .read()
            .ok()
            .and_then(|m| m.get(value).map(|set| set.iter().cloned().collect()))
            .unwrap_or_default()
    }

    /// Temporal range scan: insertions with `ts > since`, ascending by
    /// `(ts, seq)`, truncated to `limit` (0 = unlimited).
    pub fn changes_since(&self, since: i64, limit: usize) -> Vec<TemporalHit> {
        let Ok(tree) = self.temporal.read() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (&ts, entries) in tree.range((
            std::ops::Bound::Excluded(since),
            std::ops::Bound::Unbounded,
        )) {
            let mut sorted: Vec<&TemporalEntry> = entries.iter().collect();
            sorted.sort_by_key(|e| e.seq);
            for e in sorted {
                out.push(TemporalHit {
                    ts,
                    entity_id: e.entity_id.clone(),
                    value: e.value.clone(),
                });
                if limit != 0 && out.len() >= limit {
                    return out;
                }
            }
        }
        out
    }

    // --------------------------------------------------------------------------------------------
    // Persistence
    // --------------------------------------------------------------------------------------------

    /// Encode every non-derived structure, with a trailing CRC32.
    pub fn snapshot(&self) -> Result<Vec<u8>, IndexError> {
        let mut body = Vec::new();

        // Id map, sorted for deterministic snapshots.
        let mut id_entries = self.id_entries();
        id_entries.sort();
        u32::try_from(id_entries.len())
            .map_err(|_| IndexError::Internal("id count overflow".into()))?
            .encode_to(&mut body)?;
        for (id, offset) in &id_entries {
            id.encode_to(&mut body)?;
            offset.encode_to(&mut body)?;
        }

        // Tag index, flattened across shards.
        let mut tag_entries: Vec<(String, Vec<String>)> = Vec::new();
        for shard in &self.tag_shards {
            let guard = shard
                .read()
                .map_err(|_| IndexError::Internal("tag shard lock poisoned".into()))?;
            for (value, ids) in guard.iter() {
                let mut ids: Vec<String> = ids.iter().cloned().collect();
                ids.sort();
                tag_entries.push((value.clone(), ids));
            }
        }
        tag_entries.sort();
        u32::try_from(tag_entries.len())
            .map_err(|_| IndexError::Internal("tag count overflow".into()))?
            .encode_to(&mut body)?;
        for (value, ids) in &tag_entries {
            value.encode_to(&mut body)?;
            encoding::encode_vec(ids, &mut body)?;
        }

        // Temporal tree.
        let tree = self
            .temporal
            .read()
            .map_err(|_| IndexError::Internal("temporal lock poisoned".into()))?;
        u32::try_from(tree.len())
            .map_err(|_| IndexError::Internal("temporal count overflow".into()))?
            .encode_to(&mut body)?;
        for (ts, entries) in tree.iter() {
            ts.encode_to(&mut body)?;
            encoding::encode_vec(entries, &mut body)?;
        }
        drop(tree);

        self.next_seq.load(Ordering::Relaxed).encode_to(&mut body)?;

        let mut hasher = Crc32::new();
        hasher.update(&body);
        hasher.finalize().encode_to(&mut body)?;
        Ok(body)
    }

    /// Decode and verify a snapshot, rebuilding the Bloom filter from
    /// the tag index keys.
    pub fn load(
        bytes: &[u8],
        bloom_expected: usize,
        bloom_fp_rate: f64,
    ) -> Result<Self, IndexError> {
        if bytes.len() < 4 {
            return Err(IndexError::ChecksumMismatch);
        }
        let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let (stored_crc, _) = u32::decode_from(crc_bytes)?;
        let mut hasher = Crc32::new();
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            return Err(IndexError::ChecksumMismatch);
        }

        let set = Self::new(bloom_expected, bloom_fp_rate)?;
        let mut off = 0;

        let (id_count, n) = u32::decode_from(&body[off..])?;
        off += n;
        {
            let mut ids = set
                .ids
                .write()
                .map_err(|_| IndexError::Internal("id index lock poisoned".into()))?;
            for _ in 0..id_count {
                let (id, n) = String::decode_from(&body[off..])?;
                off += n;
                let (offset, n) = u64::decode_from(&body[off..])?;
                off += n;
                ids.insert(id, offset);
            }
        }

        let (tag_count, n) = u32::decode_from(&body[off..])?;
        off += n;
        {
            let mut bloom = set
                .bloom
                .write()
                .map_err(|_| IndexError::Internal("bloom lock poisoned".into()))?;
            for _ in 0..tag_count {
                let (value, n) = String::decode_from(&body[off..])?;
                off += n;
                let (ids, n) = encoding::decode_vec::<String>(&body[off..])?;
                off += n;
                bloom.set(&value);
                let shard = &set.tag_shards[shard_of(&value)];
                shard
                    .write()
                    .map_err(|_| IndexError::Internal("tag shard lock poisoned".into()))?
                    .insert(value, ids.into_iter().collect());
            }
        }

        let (temporal_count, n) = u32::decode_from(&body[off..])?;
        off += n;
        {
            let mut tree = set
                .temporal
                .write()
                .map_err(|_| IndexError::Internal("temporal lock poisoned".into()))?;
            for _ in 0..temporal_count {
                let (ts, n) = i64::decode_from(&body[off..])?;
                off += n;
                let (entries, n) = encoding::decode_vec::<TemporalEntry>(&body[off..])?;
                off += n;
                tree.insert(ts, entries);
            }
        }

        let (next_seq, _) = u64::decode_from(&body[off..])?;
        set.next_seq.store(next_seq, Ordering::Relaxed);

        debug!(
            entities = id_count,
            tags = tag_count,
            timestamps = temporal_count,
            "index snapshot loaded"
        );
        Ok(set)
    }

    /// Rebuild every structure from decoded entities — the fallback when
    /// the persisted snapshot fails validation.
    pub fn rebuild_from(entities: &[(Entity, u64)], bloom_expected: usize, bloom_fp_rate: f64) -> Result<Self, IndexError> {
        warn!(count = entities.len(), "rebuilding indices from data section");
        let set = Self::new(bloom_expected, bloom_fp_rate)?;
        for (entity, offset) in entities {
            set.note_created(entity, *offset)?;
        }
        Ok(set)
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Shard selector: `hash(tag) % 256`.
fn shard_of(value: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    (hasher.finish() % TAG_SHARDS as u64) as usize
}

fn new_bloom(expected: usize, fp_rate: f64) -> Result<Bloom<str>, IndexError> {
    Bloom::new_for_fp_rate(expected.max(1), fp_rate.clamp(1e-6, 0.5))
        .map_err(|e| IndexError::Internal(e.to_string()))
}
