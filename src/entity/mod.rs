//! Entity Model and Record Codec
//!
//! The **entity** is the only first-class record of the database: an opaque
//! id, an ordered list of [temporal tags](crate::tag), and an opaque
//! content blob. This module owns the in-memory model and its on-disk
//! record form inside the data section of the unified file.
//!
//! # On-disk record layout
//!
//! ```text
//! [RECORD_LEN_LE u32]
//! [PAYLOAD]
//!   flags      u8          bit0 = content gzip-compressed
//!   id         [u32 len][bytes]
//!   tag_count  u32
//!   per tag:   ts i64, kind u8 (0 = dictionary id, 1 = inline),
//!              dict_id u32 | value [u32 len][bytes]
//!   content    [u32 len][bytes]
//! [SHA256 of PAYLOAD, 32 bytes]
//! ```
//!
//! The length prefix counts the payload only, and is capped at
//! [`MAX_RECORD_LEN`]; the SHA-256 trailer covers the payload and nothing
//! else. Content at or above the configured threshold is stored
//! gzip-compressed with the flag bit set.
//!
//! # Corruption policy
//!
//! Any failed digest, any length outside documented bounds, and any
//! invalid id or tag makes the record **unreadable, not fatal**: readers
//! report [`EntityError`] and the recovery layer decides what to do. The
//! codec itself never panics and never allocates from an unchecked
//! length field.


use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::tag::{self, Tag, TagError};

// ------------------------------------------------------------------------------------------------
// Limits
// ------------------------------------------------------------------------------------------------

/// Maximum payload length of a single entity record (100 MiB).
///
/// A corrupted length prefix above this is rejected before any
/// allocation happens.
pub const MAX_RECORD_LEN: u32 = 100 * 1024 * 1024;

/// Maximum content blob size (100 MiB, measured uncompressed).
pub const MAX_CONTENT_LEN: usize = 100 * 1024 * 1024;

/// Width of the SHA-256 trailer.
pub const DIGEST_LEN: usize = 32;

const FLAG_CONTENT_GZIP: u8 = 0b0000_0001;

const TAG_KIND_DICT: u8 = 0;
const TAG_KIND_INLINE: u8 = 1;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by the entity codec and validators.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EntityError {
    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Id or tag failed validation.
    #[error("Validation error: {0}")]
    Tag(#[from] TagError),

    /// Compression or decompression I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SHA-256 trailer did not match the payload.
    #[error("Record digest mismatch")]
    DigestMismatch,

    /// Record length prefix outside `1..=`[`MAX_RECORD_LEN`].
    #[error("Record length {0} outside permitted bounds")]
    RecordLength(u64),

    /// Content blob larger than [`MAX_CONTENT_LEN`].
    #[error("Content length {0} exceeds maximum")]
    ContentTooLarge(usize),

    /// A dictionary tag id had no entry in the dictionary.
    #[error("Unknown tag dictionary id {0}")]
    DictionaryMiss(u32),

    /// An unknown tag-kind byte was read.
    #[error("Invalid tag kind byte 0x{0:02X}")]
    InvalidTagKind(u8),
}

// ------------------------------------------------------------------------------------------------
// Entity
// ------------------------------------------------------------------------------------------------

/// A single entity: id, ordered temporal tag history, content blob.
///
/// Tag order is insertion order and is semantically meaningful — it is
/// the tie-break between equal-nanosecond tags everywhere in the engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entity {
    /// Opaque id, 1..=256 bytes of printable ASCII plus `- _ .`.
    pub id: String,

    /// Temporal tag history in insertion order.
    pub tags: Vec<Tag>,

    /// Opaque content blob (stored uncompressed in memory).
    pub content: Vec<u8>,
}

impl Entity {
    /// Build an entity after validating id, tags, and content bounds.
    pub fn new(id: impl Into<String>, tags: Vec<Tag>, content: Vec<u8>) -> Result<Self, EntityError> {
        let entity = Self {
            id: id.into(),
            tags,
            content,
        };
        entity.validate()?;
        Ok(entity)
    }

    /// Re-check every documented bound on this entity.
    pub fn validate(&self) -> Result<(), EntityError> {
        tag::validate_id(&self.id)?;
        for t in &self.tags {
            if t.ts == 0 {
                return Err(TagError::ZeroTimestamp.into());
            }
            tag::validate_value(&t.value)?;
        }
        if self.content.len() > MAX_CONTENT_LEN {
            return Err(EntityError::ContentTooLarge(self.content.len()));
        }
        Ok(())
    }

    /// Stripped tag values in insertion order.
    pub fn tag_values(&self) -> Vec<&str> {
        self.tags.iter().map(|t| t.value.as_str()).collect()
    }

    /// Raw `TIMESTAMP|value` wire forms in insertion order.
    pub fn tags_raw(&self) -> Vec<String> {
        self.tags.iter().map(Tag::raw).collect()
    }

    /// The entity restricted to tags with `ts ≤ at`, preserving order.
    pub fn snapshot_at(&self, at: i64) -> Entity {
        Entity {
            id: self.id.clone(),
            tags: self.tags.iter().filter(|t| t.ts <= at).cloned().collect(),
            content: self.content.clone(),
        }
    }

    /// Timestamp of the earliest tag, if any tag exists.
    pub fn earliest_ts(&self) -> Option<i64> {
        self.tags.iter().map(|t| t.ts).min()
    }

    /// Rough in-memory footprint, used for cache byte accounting.
    pub fn approx_size(&self) -> usize {
        let tags: usize = self.tags.iter().map(|t| t.value.len() + 24).sum();
        self.id.len() + tags + self.content.len() + std::mem::size_of::<Entity>()
    }
}

/// Self-contained inline form used by the WAL: `[id][tags][content]`,
/// tags always inline. The data-section record form lives in
/// [`encode_record`] / [`decode_record`].
impl Encode for Entity {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        encoding::encode_vec(&self.tags, buf)?;
        self.content.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for Entity {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (id, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (tags, n) = encoding::decode_vec::<Tag>(&buf[off..])?;
        off += n;
        let (content, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { id, tags, content }, off))
    }
}

// ------------------------------------------------------------------------------------------------
// Tag dictionary seam
// ------------------------------------------------------------------------------------------------

/// Lookup interface the codec uses to resolve interned tag values.
///
/// The string interner implements this; WAL payloads use
/// [`NoDictionary`] so they stay self-contained.
pub trait TagDictionary {
    /// Dictionary id for `value`, if it is currently interned.
    fn id_of(&self, value: &str) -> Option<u32>;

    /// Interned value for `id`, if present.
    fn value_of(&self, id: u32) -> Option<String>;
}

/// A dictionary that interns nothing — every tag encodes inline.
pub struct NoDictionary;

impl TagDictionary for NoDictionary {
    fn id_of(&self, _value: &str) -> Option<u32> {
        None
    }

    fn value_of(&self, _id: u32) -> Option<String> {
        None
    }
}

// ------------------------------------------------------------------------------------------------
// Record codec
// ------------------------------------------------------------------------------------------------

/// Serialize an entity into its full framed record:
/// `[len][payload][sha256]`.
///
/// Content at or above `compression_threshold` bytes is gzip-compressed.
/// Tags whose value is interned encode as dictionary ids; everything
/// else inlines. The entity is validated before any byte is produced —
/// invalid input never reaches disk.
pub fn encode_record(
    entity: &Entity,
    dict: &dyn TagDictionary,
    compression_threshold: usize,
) -> Result<Vec<u8>, EntityError> {
    entity.validate()?;

    let mut payload = Vec::with_capacity(64 + entity.content.len() / 2);

    let compress = compression_threshold > 0 && entity.content.len() >= compression_threshold;
    let flags: u8 = if compress { FLAG_CONTENT_GZIP } else { 0 };
    flags.encode_to(&mut payload)?;

    entity.id.encode_to(&mut payload)?;

    u32::try_from(entity.tags.len())
        .map_err(|_| EncodingError::LengthOverflow("tag count exceeds u32".into()))?
        .encode_to(&mut payload)?;
    for t in &entity.tags {
        t.ts.encode_to(&mut payload)?;
        match dict.id_of(&t.value) {
            Some(id) => {
                TAG_KIND_DICT.encode_to(&mut payload)?;
                id.encode_to(&mut payload)?;
            }
            None => {
                TAG_KIND_INLINE.encode_to(&mut payload)?;
                t.value.encode_to(&mut payload)?;
            }
        }
    }

    if compress {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&entity.content)?;
        let compressed = encoder.finish()?;
        compressed.encode_to(&mut payload)?;
    } else {
        entity.content.encode_to(&mut payload)?;
    }

    let payload_len = u32::try_from(payload.len())
        .map_err(|_| EntityError::RecordLength(payload.len() as u64))?;
    if payload_len > MAX_RECORD_LEN {
        return Err(EntityError::RecordLength(u64::from(payload_len)));
    }

    let digest = Sha256::digest(&payload);

    let mut record = Vec::with_capacity(4 + payload.len() + DIGEST_LEN);
    payload_len.encode_to(&mut record)?;
    record.extend_from_slice(&payload);
    record.extend_from_slice(&digest);
    Ok(record)
}

/// Decode one framed record starting at `buf[0]`.
///
/// Returns `(entity, bytes_consumed)`. Verifies the length prefix, the
/// SHA-256 trailer, and every field bound before building the entity;
/// a dictionary miss on an interned tag is an error (the dictionary
/// section is loaded before any record is read).
pub fn decode_record(buf: &[u8], dict: &dyn TagDictionary) -> Result<(Entity, usize), EntityError> {
    let (payload_len, header) = u32::decode_from(buf)?;
    if payload_len == 0 || payload_len > MAX_RECORD_LEN {
        return Err(EntityError::RecordLength(u64::from(payload_len)));
    }
    let payload_len = payload_len as usize;

    let total = header + payload_len + DIGEST_LEN;
    if buf.len() < total {
        return Err(EncodingError::UnexpectedEof {
            needed: total,
            available: buf.len(),
        }
        .into());
    }

    let payload = &buf[header..header + payload_len];
    let stored_digest = &buf[header + payload_len..total];

    let digest = Sha256::digest(payload);
    if digest.as_slice() != stored_digest {
        return Err(EntityError::DigestMismatch);
    }

    let mut off = 0;
    let (flags, n) = u8::decode_from(&payload[off..])?;
    off += n;

    let (id, n) = String::decode_from(&payload[off..])?;
    off += n;

    let (tag_count, n) = u32::decode_from(&payload[off..])?;
    off += n;
    if tag_count > encoding::MAX_VEC_ELEMENTS {
        return Err(EncodingError::LengthOverflow(format!(
            "tag count {tag_count} exceeds limit"
        ))
        .into());
    }

    let mut tags = Vec::with_capacity((tag_count as usize).min(1024));
    for _ in 0..tag_count {
        let (ts, n) = i64::decode_from(&payload[off..])?;
        off += n;
        let (kind, n) = u8::decode_from(&payload[off..])?;
        off += n;
        let value = match kind {
            TAG_KIND_DICT => {
                let (dict_id, n) = u32::decode_from(&payload[off..])?;
                off += n;
                dict.value_of(dict_id)
                    .ok_or(EntityError::DictionaryMiss(dict_id))?
            }
            TAG_KIND_INLINE => {
                let (value, n) = String::decode_from(&payload[off..])?;
                off += n;
                value
            }
            other => return Err(EntityError::InvalidTagKind(other)),
        };
        tags.push(Tag::new(ts, value)?);
    }

    let (stored_content, _) = Vec::<u8>::decode_from(&payload[off..])?;

    let content = if flags & FLAG_CONTENT_GZIP != 0 {
        let mut decoder = GzDecoder::new(&stored_content[..]);
        let mut out = Vec::new();
        // take() bounds the expansion so a gzip bomb cannot blow past
        // the content ceiling.
        decoder
            .by_ref()
            .take(MAX_CONTENT_LEN as u64 + 1)
            .read_to_end(&mut out)?;
        if out.len() > MAX_CONTENT_LEN {
            return Err(EntityError::ContentTooLarge(out.len()));
        }
        out
    } else {
        stored_content
    };

    let entity = Entity::new(id, tags, content)?;
    Ok((entity, total))
}

/// Length in bytes a framed record occupies given its payload length.
pub fn framed_len(payload_len: usize) -> usize {
    4 + payload_len + DIGEST_LEN
}
