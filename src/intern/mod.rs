//! Bounded String Interner / Tag Dictionary
//!
//! Tag values repeat heavily (`type:user`, `status:active`, …), so the
//! engine deduplicates them behind stable `u32` dictionary ids. Records
//! in the data section reference interned values by id; everything else
//! falls back to inline storage.
//!
//! # Bounding and pinning
//!
//! The interner is a **strict-LRU cache with both an entry cap and a
//! byte cap** — it must never become an unbounded memoization table.
//! Two rules keep eviction safe against the on-disk format:
//!
//! - An id becomes **pinned** the first time a persisted record embeds
//!   it. Pinned entries survive LRU eviction (they may leave the hot
//!   value→id map, after which new records inline that value), because
//!   a pinned id must stay resolvable for every record already on disk.
//! - Unpinned entries are evicted freely, by LRU order, when either cap
//!   is exceeded or when the memory guardian demands a fraction.
//!
//! The pinned set is exactly what the dictionary section persists at
//! checkpoint and reloads at open.
//!
//! Hit/miss counters are exported through store statistics.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use tracing::debug;

use crate::entity::TagDictionary;

/// Approximate per-entry bookkeeping overhead, added to the string
/// length for byte accounting.
const ENTRY_OVERHEAD: usize = 64;

// ------------------------------------------------------------------------------------------------
// Interner
// ------------------------------------------------------------------------------------------------

struct InternEntry {
    value: String,
    pinned: bool,
}

struct InternerInner {
    /// Hot value→id working set; its order drives eviction.
    lru: LruCache<String, u32>,

    /// Authoritative id→value storage, including pinned entries that
    /// have left the LRU.
    by_id: HashMap<u32, InternEntry>,

    /// Reverse map for values currently resolvable to an id.
    id_by_value: HashMap<String, u32>,

    /// Current byte accounting over `by_id`.
    bytes: usize,

    /// Next id to allocate. Ids start at 1; 0 is never issued.
    next_id: u32,
}

/// Bounded LRU string interner. Thread-safe; all methods take `&self`.
pub struct Interner {
    inner: Mutex<InternerInner>,
    max_entries: usize,
    max_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Interner {
    /// Create an interner bounded by `max_entries` entries and
    /// `max_bytes` of accounted string storage.
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(InternerInner {
                lru: LruCache::new(cap),
                by_id: HashMap::new(),
                id_by_value: HashMap::new(),
                bytes: 0,
                next_id: 1,
            }),
            max_entries,
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get-or-assign the id for `value`, touching its LRU position.
    pub fn intern(&self, value: &str) -> u32 {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };

        if let Some(&id) = inner.lru.get(value) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return id;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // A pinned entry may have left the LRU; revive it rather than
        // allocating a second id for the same value.
        if let Some(&id) = inner.id_by_value.get(value) {
            if let Some((evicted_key, evicted_id)) =
                inner.lru.push(value.to_string(), id)
                && evicted_key != value
            {
                Self::drop_if_unpinned(&mut inner, &evicted_key, evicted_id);
            }
            return id;
        }

        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1).max(1);
        inner.by_id.insert(
            id,
            InternEntry {
                value: value.to_string(),
                pinned: false,
            },
        );
        inner.id_by_value.insert(value.to_string(), id);
        inner.bytes += value.len() + ENTRY_OVERHEAD;

        if let Some((evicted_key, evicted_id)) = inner.lru.push(value.to_string(), id)
            && evicted_key != value
        {
            Self::drop_if_unpinned(&mut inner, &evicted_key, evicted_id);
        }
        self.enforce_bytes(&mut inner);

        id
    }

    /// Mark `id` as referenced by a persisted record. Pinned entries are
    /// never dropped by eviction and are persisted at checkpoint.
    pub fn pin(&self, id: u32) {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if let Some(entry) = inner.by_id.get_mut(&id) {
            entry.pinned = true;
        }
    }

    /// Load the dictionary section contents: every entry arrives pinned.
    pub fn load_pinned(&self, entries: Vec<(u32, String)>) {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        for (id, value) in entries {
            inner.next_id = inner.next_id.max(id.wrapping_add(1).max(1));
            inner.bytes += value.len() + ENTRY_OVERHEAD;
            inner.id_by_value.insert(value.clone(), id);
            inner.lru.push(value.clone(), id);
            inner.by_id.insert(
                id,
                InternEntry {
                    value,
                    pinned: true,
                },
            );
        }
    }

    /// The pinned entries, for persisting as the dictionary section.
    pub fn snapshot_pinned(&self) -> Vec<(u32, String)> {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        let mut out: Vec<(u32, String)> = inner
            .by_id
            .iter()
            .filter(|(_, e)| e.pinned)
            .map(|(id, e)| (*id, e.value.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Evict roughly `fraction` of the LRU working set (unpinned entries
    /// are dropped entirely; pinned entries just leave the hot set).
    /// Returns the number of entries removed from the LRU.
    pub fn evict_fraction(&self, fraction: f64) -> usize {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        let target = ((inner.lru.len() as f64) * fraction.clamp(0.0, 1.0)).ceil() as usize;
        let mut removed = 0;
        for _ in 0..target {
            let Some((key, id)) = inner.lru.pop_lru() else {
                break;
            };
            Self::drop_if_unpinned(&mut inner, &key, id);
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, remaining = inner.lru.len(), "interner eviction");
        }
        removed
    }

    /// Current LRU entry count.
    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(g) => g.lru.len(),
            Err(p) => p.into_inner().lru.len(),
        }
    }

    /// Whether the hot set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accounted bytes across stored strings.
    pub fn bytes(&self) -> usize {
        match self.inner.lock() {
            Ok(g) => g.bytes,
            Err(p) => p.into_inner().bytes,
        }
    }

    /// `(hits, misses)` counters since open.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    fn enforce_bytes(&self, inner: &mut InternerInner) {
        while inner.bytes > self.max_bytes && !inner.lru.is_empty() {
            let Some((key, id)) = inner.lru.pop_lru() else {
                break;
            };
            Self::drop_if_unpinned(inner, &key, id);
        }
        let _ = self.max_entries; // entry cap enforced by the LruCache itself
    }

    fn drop_if_unpinned(inner: &mut InternerInner, key: &str, id: u32) {
        let pinned = inner.by_id.get(&id).map(|e| e.pinned).unwrap_or(false);
        if !pinned {
            if let Some(entry) = inner.by_id.remove(&id) {
                inner.bytes = inner
                    .bytes
                    .saturating_sub(entry.value.len() + ENTRY_OVERHEAD);
            }
            inner.id_by_value.remove(key);
        }
    }
}

impl TagDictionary for Interner {
    /// Resolve a value to an id **without** inserting. Only values still
    /// resolvable (hot, or pinned) encode as dictionary references.
    fn id_of(&self, value: &str) -> Option<u32> {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if let Some(&id) = inner.lru.get(value) {
            return Some(id);
        }
        inner.id_by_value.get(value).copied()
    }

    fn value_of(&self, id: u32) -> Option<String> {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        inner.by_id.get(&id).map(|e| e.value.clone())
    }
}
