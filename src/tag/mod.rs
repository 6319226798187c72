//! Temporal Tag Primitives
//!
//! Every attribute of an entity is a **temporal tag**: a nanosecond
//! creation timestamp paired with an opaque string value. Tags are stored
//! on disk — and travel through the WAL — in their canonical wire form
//!
//! ```text
//! TIMESTAMP|value
//! ```
//!
//! where `TIMESTAMP` is a signed 64-bit nanosecond count since the Unix
//! epoch, rendered as a fixed-width decimal. Callers normally see only the
//! stripped `value`; the raw form is exposed behind an opt-in flag.
//!
//! ## Validation boundary
//!
//! All input validation for ids and tag values lives here and runs at the
//! write boundary. The same checks run again during WAL replay: a replayed
//! entry carrying an invalid tag is *skipped* (with a counter bump), never
//! allowed to abort recovery.
//!
//! ## Namespaces
//!
//! Values conventionally use `namespace:subvalue` (`type:user`,
//! `status:active`, `rbac:role:admin`). The engine imposes no schema — the
//! separator is a caller idiom — but the temporal query layer resolves
//! "current value of namespace N" against the prefix before the first `:`.

#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::encoding::{Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Limits
// ------------------------------------------------------------------------------------------------

/// Maximum length of an entity id in bytes.
pub const MAX_ID_LEN: usize = 256;

/// Maximum length of a tag value in bytes.
pub const MAX_TAG_LEN: usize = 1024;

/// Maximum fraction of non-printable bytes tolerated in a tag value.
pub const MAX_NON_PRINTABLE_RATIO: f64 = 0.10;

/// Width of the fixed-width decimal timestamp in the wire form.
///
/// 19 digits covers the full magnitude range of `i64`; negative counts
/// render with a leading sign ahead of the zero padding.
pub const TIMESTAMP_WIDTH: usize = 19;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by tag parsing and validation.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TagError {
    /// Wire form had no `|` separator.
    #[error("missing '|' separator in tag")]
    MissingSeparator,

    /// Timestamp half of the wire form was not a decimal integer.
    #[error("non-numeric timestamp: {0:?}")]
    BadTimestamp(String),

    /// Timestamp was zero — persisted tags must carry a real creation time.
    #[error("zero timestamp")]
    ZeroTimestamp,

    /// Value exceeded [`MAX_TAG_LEN`].
    #[error("tag value length {0} exceeds maximum {MAX_TAG_LEN}")]
    ValueTooLong(usize),

    /// Value was empty.
    #[error("empty tag value")]
    EmptyValue,

    /// Value had too many non-printable bytes.
    #[error("tag value exceeds {:.0}% non-printable bytes", MAX_NON_PRINTABLE_RATIO * 100.0)]
    NonPrintable,

    /// Entity id was empty or longer than [`MAX_ID_LEN`].
    #[error("entity id length {0} outside 1..={MAX_ID_LEN}")]
    IdLength(usize),

    /// Entity id contained a byte outside the permitted set.
    #[error("entity id contains illegal byte 0x{0:02X}")]
    IdCharacter(u8),
}

// ------------------------------------------------------------------------------------------------
// Tag
// ------------------------------------------------------------------------------------------------

/// A single temporal tag: creation timestamp plus opaque value.
///
/// Ordering between tags is by timestamp; equal-nanosecond tags are
/// disambiguated by their insertion index within the owning entity's tag
/// list, which every container in the engine preserves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Nanoseconds since the Unix epoch, signed.
    pub ts: i64,

    /// Opaque caller value, conventionally `namespace:subvalue`.
    pub value: String,
}

impl Tag {
    /// Build a tag after validating the value. Rejects a zero timestamp.
    pub fn new(ts: i64, value: impl Into<String>) -> Result<Self, TagError> {
        let value = value.into();
        if ts == 0 {
            return Err(TagError::ZeroTimestamp);
        }
        validate_value(&value)?;
        Ok(Self { ts, value })
    }

    /// Render the canonical `TIMESTAMP|value` wire form.
    pub fn raw(&self) -> String {
        compose(self.ts, &self.value)
    }

    /// The namespace prefix of the value — everything before the first
    /// `:` — or `None` for values without a separator.
    pub fn namespace(&self) -> Option<&str> {
        namespace_of(&self.value)
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.ts, self.value)
    }
}

/// Self-contained wire form used by the WAL and index snapshots:
/// `[ts i64][value string]`. The framed record codec in
/// [`crate::entity`] uses a dictionary-aware encoding instead.
impl Encode for Tag {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.ts.encode_to(buf)?;
        self.value.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for Tag {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (ts, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (value, n) = String::decode_from(&buf[off..])?;
        off += n;
        // Validation is a write-boundary concern; decode stays raw so
        // replay can count invalid tags instead of failing the frame read.
        Ok((Self { ts, value }, off))
    }
}

// ------------------------------------------------------------------------------------------------
// Wire form
// ------------------------------------------------------------------------------------------------

/// Compose the canonical wire form: fixed-width decimal nanosecond count,
/// a `|`, then the value verbatim.
pub fn compose(ts: i64, value: &str) -> String {
    format!("{ts:019}|{value}")
}

/// Parse a wire-form tag back into `(ts, value)`.
///
/// Splits on the **first** `|` so values containing `|` round-trip. The
/// timestamp half accepts any decimal width (fixed-width is produced, not
/// required). The value is re-validated on the way in.
pub fn parse(raw: &str) -> Result<Tag, TagError> {
    let (ts_part, value) = raw.split_once('|').ok_or(TagError::MissingSeparator)?;
    let ts: i64 = ts_part
        .parse()
        .map_err(|_| TagError::BadTimestamp(ts_part.to_string()))?;
    Tag::new(ts, value)
}

/// Strip a wire-form tag down to its value half.
///
/// A string without a separator is returned unchanged — callers that
/// already hold stripped values can pass them through harmlessly.
pub fn strip(raw: &str) -> &str {
    match raw.split_once('|') {
        Some((ts_part, value)) if is_decimal(ts_part) => value,
        _ => raw,
    }
}

/// Strip a batch of wire-form tags.
pub fn strip_many<'a, I>(raws: I) -> Vec<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    raws.into_iter().map(strip).collect()
}

/// Namespace prefix of a (stripped) value: the text before the first `:`.
pub fn namespace_of(value: &str) -> Option<&str> {
    value.split_once(':').map(|(ns, _)| ns).filter(|ns| !ns.is_empty())
}

fn is_decimal(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

// ------------------------------------------------------------------------------------------------
// Validation
// ------------------------------------------------------------------------------------------------

/// Validate an entity id: 1..=256 bytes, printable ASCII plus `- _ .`.
pub fn validate_id(id: &str) -> Result<(), TagError> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(TagError::IdLength(id.len()));
    }
    for b in id.bytes() {
        if !(0x20..=0x7E).contains(&b) {
            return Err(TagError::IdCharacter(b));
        }
    }
    Ok(())
}

/// Validate a tag value: non-empty, ≤ [`MAX_TAG_LEN`] bytes, and at most
/// [`MAX_NON_PRINTABLE_RATIO`] non-printable bytes.
pub fn validate_value(value: &str) -> Result<(), TagError> {
    if value.is_empty() {
        return Err(TagError::EmptyValue);
    }
    if value.len() > MAX_TAG_LEN {
        return Err(TagError::ValueTooLong(value.len()));
    }
    let non_printable = value
        .bytes()
        .filter(|b| !(0x20..=0x7E).contains(b))
        .count();
    if non_printable as f64 > value.len() as f64 * MAX_NON_PRINTABLE_RATIO {
        return Err(TagError::NonPrintable);
    }
    Ok(())
}

/// Resolve the latest tag of namespace `ns` with `ts ≤ at`.
///
/// `tags` must be in insertion order. Among equal timestamps the later
/// insertion index wins, so a plain left-to-right scan that accepts
/// `candidate.ts >= best.ts` implements the tie-break directly.
pub fn current_value_at<'a>(tags: &'a [Tag], ns: &str, at: i64) -> Option<&'a Tag> {
    let mut best: Option<&Tag> = None;
    for tag in tags {
        if tag.ts > at {
            continue;
        }
        if tag.namespace() != Some(ns) {
            continue;
        }
        match best {
            Some(b) if tag.ts < b.ts => {}
            _ => best = Some(tag),
        }
    }
    best
}
