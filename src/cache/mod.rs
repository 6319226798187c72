//! Bounded Entity Cache
//!
//! A strict-LRU cache of fully decoded entities, bounded by **both** an
//! entry cap and a byte cap. It sits between the repository read path
//! and the reader pool: a hit skips the pooled read and the record
//! decode entirely.
//!
//! # Consistency
//!
//! The writer repopulates an entry **while holding the writer lock**,
//! before the write returns — the cache can therefore never serve a
//! value older than the latest committed write. Readers that miss fall
//! through to the indices and repopulate; because a slow reader may
//! race a concurrent write, every insert carries the **record offset**
//! it was decoded from, and an insert never replaces an entry with a
//! higher offset. Record offsets only grow within a file, so the
//! freshest version always wins.
//!
//! Entries are `Arc<Entity>` so a hit is a pointer clone, and eviction
//! releases memory as soon as the last reader drops its reference.

#[cfg(test)]
mod tests;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use tracing::debug;

use crate::entity::Entity;

// ------------------------------------------------------------------------------------------------
// Cache
// ------------------------------------------------------------------------------------------------

struct CacheEntry {
    /// Record offset this copy was decoded from — the version stamp.
    offset: u64,
    entity: Arc<Entity>,
}

struct CacheInner {
    lru: LruCache<String, CacheEntry>,
    bytes: usize,
}

/// Bounded LRU cache of decoded entities. Thread-safe.
pub struct EntityCache {
    inner: Mutex<CacheInner>,
    max_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EntityCache {
    /// Create a cache bounded by `max_entries` entries and `max_bytes`
    /// of accounted entity memory.
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                lru: LruCache::new(cap),
                bytes: 0,
            }),
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up an entity by id, touching its LRU position.
    pub fn get(&self, id: &str) -> Option<Arc<Entity>> {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        match inner.lru.get(id) {
            Some(e) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&e.entity))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert the copy of an entity decoded from the record at
    /// `offset`. A stale copy (lower offset than the cached one) is
    /// dropped, so a slow reader can never clobber a concurrent write.
    pub fn insert(&self, offset: u64, entity: Arc<Entity>) {
        let size = entity.approx_size();
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };

        if let Some(existing) = inner.lru.peek(&entity.id)
            && existing.offset > offset
        {
            return;
        }

        if let Some(old) = inner.lru.push(entity.id.clone(), CacheEntry { offset, entity }) {
            // Either a same-key replacement or a capacity eviction.
            inner.bytes = inner.bytes.saturating_sub(old.1.entity.approx_size());
        }
        inner.bytes += size;

        while inner.bytes > self.max_bytes {
            let Some((_, evicted)) = inner.lru.pop_lru() else {
                break;
            };
            inner.bytes = inner.bytes.saturating_sub(evicted.entity.approx_size());
        }
    }

    /// Drop the cached copy of `id`, if any.
    pub fn invalidate(&self, id: &str) {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if let Some(evicted) = inner.lru.pop(id) {
            inner.bytes = inner.bytes.saturating_sub(evicted.entity.approx_size());
        }
    }

    /// Evict roughly `fraction` of entries by LRU order. Returns the
    /// number removed.
    pub fn evict_fraction(&self, fraction: f64) -> usize {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        let target = ((inner.lru.len() as f64) * fraction.clamp(0.0, 1.0)).ceil() as usize;
        let mut removed = 0;
        for _ in 0..target {
            let Some((_, evicted)) = inner.lru.pop_lru() else {
                break;
            };
            inner.bytes = inner.bytes.saturating_sub(evicted.entity.approx_size());
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, remaining = inner.lru.len(), "entity cache eviction");
        }
        removed
    }

    /// Remove everything.
    pub fn clear(&self) {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        inner.lru.clear();
        inner.bytes = 0;
    }

    /// Current entry count.
    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(g) => g.lru.len(),
            Err(p) => p.into_inner().lru.len(),
        }
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accounted bytes across cached entities.
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
}
