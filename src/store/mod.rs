//! # Entity Store
//!
//! The facade every external layer consumes: single-writer CRUD on
//! entities, tag queries, the temporal query engine, and the recovery
//! machinery, all over one unified database file.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       EntityStore                          │
//! │                                                            │
//! │  writes ──► writer mutex ──► WAL ──► data section ──► idx │
//! │                │                         │                 │
//! │                └── intern ── cache ──────┘                 │
//! │                                                            │
//! │  reads ──► cache ──► id index ──► reader pool ──► decode  │
//! │                                                            │
//! │  guardian ──► evicts cache + interner under pressure       │
//! │  checkpoint ─► dict + index sections, WAL truncate         │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency model
//!
//! - **One writer.** Every mutation serializes through a single mutex
//!   (`StoreShared::writer`); no two threads ever hold it at once.
//! - **Bounded readers.** Every read of the database file goes through
//!   the [`ReaderPool`]; nothing else opens handles on the file.
//! - **Monotonic visibility.** A record becomes readable only after it
//!   is fully written and indexed, so readers always observe a prefix
//!   of the writer's commit order.
//!
//! ## Durability
//!
//! WAL-first: a mutation is appended and (by default) fsynced to the
//! embedded WAL before the entity record lands in the data section.
//! A crash between the two is healed by replay at the next open.
//!
//! ## Guarantees
//!
//! - No partial mutation is ever observable or persisted.
//! - Corruption is a state, not an exception: bad records, bad index
//!   entries, and bad WAL frames are counted, skipped, and repaired
//!   where possible; the store only turns read-only when recovery
//!   itself fails.

pub mod recovery;
pub mod temporal;
pub mod writer;

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::EntityCache;
use crate::entity::{self, Entity, EntityError};
use crate::guardian::{GuardianConfig, MemoryGuardian, PressureLevel};
use crate::index::IndexSet;
use crate::intern::Interner;
use crate::pool::{PoolError, ReaderPool};
use crate::tag::{self, Tag, TagError};
use crate::wal::{WalError, WalOp};

pub use temporal::{EntityDiff, TagShadow};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// The error surface promised to the outer HTTP/CLI layer.
///
/// Each variant carries a human message; [`StoreError::code`] yields
/// the short machine code the wire layer serializes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Caller-supplied id, tag, or content violates documented bounds.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Lookup miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// The entity exists but has no tags at or before the requested time.
    #[error("not found at time: {id} has no tags at or before {at}")]
    NotFoundAtTime {
        /// Entity id.
        id: String,
        /// Requested as-of timestamp.
        at: i64,
    },

    /// Id collision on create.
    #[error("conflict: id {0:?} already exists")]
    Conflict(String),

    /// Header, record, or index consistency check failed and recovery
    /// is handling it.
    #[error("corrupt: {0}")]
    Corrupt(String),

    /// Write buffer or WAL capacity exceeded. Retryable.
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// A deadline elapsed while acquiring a resource. Retryable.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Unrecoverable I/O or corruption; the instance is read-only until
    /// restart.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Short machine code for wire serialization.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::InvalidInput(_) => "invalid_input",
            StoreError::NotFound(_) => "not_found",
            StoreError::NotFoundAtTime { .. } => "not_found_at_time",
            StoreError::Conflict(_) => "conflict",
            StoreError::Corrupt(_) => "corrupt",
            StoreError::Backpressure(_) => "backpressure",
            StoreError::Timeout(_) => "timeout",
            StoreError::Fatal(_) => "fatal",
        }
    }

    /// Whether a caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backpressure(_) | StoreError::Timeout(_))
    }
}

impl From<TagError> for StoreError {
    fn from(e: TagError) -> Self {
        StoreError::InvalidInput(e.to_string())
    }
}

impl From<EntityError> for StoreError {
    fn from(e: EntityError) -> Self {
        match e {
            EntityError::Tag(inner) => StoreError::InvalidInput(inner.to_string()),
            EntityError::ContentTooLarge(_) => StoreError::InvalidInput(e.to_string()),
            EntityError::DigestMismatch
            | EntityError::RecordLength(_)
            | EntityError::DictionaryMiss(_)
            | EntityError::InvalidTagKind(_) => StoreError::Corrupt(e.to_string()),
            EntityError::Encoding(_) | EntityError::Io(_) => StoreError::Fatal(e.to_string()),
        }
    }
}

impl From<PoolError> for StoreError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Timeout => StoreError::Timeout("reader pool exhausted".into()),
            other => StoreError::Fatal(other.to_string()),
        }
    }
}

impl From<WalError> for StoreError {
    fn from(e: WalError) -> Self {
        match e {
            WalError::EntryTooLarge(n) => {
                StoreError::InvalidInput(format!("write of {n} bytes exceeds the record limit"))
            }
            other => StoreError::Fatal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Fatal(e.to_string())
    }
}

impl From<crate::index::IndexError> for StoreError {
    fn from(e: crate::index::IndexError) -> Self {
        StoreError::Fatal(e.to_string())
    }
}

impl From<crate::format::FormatError> for StoreError {
    fn from(e: crate::format::FormatError) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

// ------------------------------------------------------------------------------------------------
// Clock and id generation seams
// ------------------------------------------------------------------------------------------------

/// Nanosecond clock source. The outer layer may inject its own (tests
/// inject a fixed one); the default reads the system real-time clock.
pub trait Clock: Send + Sync {
    /// Nanoseconds since the Unix epoch, signed.
    fn now_nanos(&self) -> i64;
}

/// System real-time clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
            // Pre-epoch system clock: negative count.
            Err(e) => -i64::try_from(e.duration().as_nanos()).unwrap_or(i64::MAX),
        }
    }
}

/// Id generator used when a create request carries no id.
pub trait IdGenerator: Send + Sync {
    /// Produce a candidate id (the store retries on collision).
    fn generate(&self) -> String;
}

/// Default generator: a nanosecond prefix plus a process-local counter.
pub struct DefaultIdGenerator {
    counter: AtomicU64,
}

impl DefaultIdGenerator {
    fn new(seed: u64) -> Self {
        Self {
            counter: AtomicU64::new(seed),
        }
    }
}

impl IdGenerator for DefaultIdGenerator {
    fn generate(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("ent-{n:016x}")
    }
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Every option the core reads, once, at open. Runtime changes require
/// a reopen.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Reader-pool size (2..=64). Must stay small: large values
    /// reintroduce descriptor exhaustion.
    pub max_readers: usize,

    /// Deadline for acquiring a pooled read handle.
    pub reader_timeout: Duration,

    /// Soft WAL ceiling beyond which writes fail with `Backpressure`
    /// after an inline checkpoint attempt.
    pub writer_backpressure_bytes: u64,

    /// WAL byte size that triggers a checkpoint.
    pub wal_checkpoint_bytes: u64,

    /// WAL age in seconds that triggers a checkpoint.
    pub wal_checkpoint_seconds: u64,

    /// Entity cache entry cap.
    pub entity_cache_entries: usize,

    /// Entity cache byte cap.
    pub entity_cache_bytes: usize,

    /// String interner entry cap.
    pub string_intern_entries: usize,

    /// String interner byte cap.
    pub string_intern_bytes: usize,

    /// Memory cap for the guardian; 0 disables pressure handling.
    pub memory_cap_bytes: u64,

    /// High-pressure threshold as a fraction of the cap.
    pub memory_high_pct: f64,

    /// Critical-pressure threshold as a fraction of the cap.
    pub memory_critical_pct: f64,

    /// Fsync the WAL and header on every write. Disabling trades
    /// durability-to-disk for durability-to-page-cache.
    pub fsync_on_write: bool,

    /// Content at or above this size is stored gzip-compressed.
    pub compression_threshold_bytes: usize,

    /// Expected distinct tag count for Bloom filter sizing.
    pub bloom_expected_tags: usize,

    /// Bloom filter false-positive rate.
    pub bloom_false_positive_rate: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_readers: 8,
            reader_timeout: Duration::from_secs(5),
            writer_backpressure_bytes: 64 * 1024 * 1024,
            wal_checkpoint_bytes: 16 * 1024 * 1024,
            wal_checkpoint_seconds: 300,
            entity_cache_entries: 10_000,
            entity_cache_bytes: 1024 * 1024 * 1024,
            string_intern_entries: 100_000,
            string_intern_bytes: 100 * 1024 * 1024,
            memory_cap_bytes: 0,
            memory_high_pct: 0.80,
            memory_critical_pct: 0.90,
            fsync_on_write: true,
            compression_threshold_bytes: 1024,
            bloom_expected_tags: 100_000,
            bloom_false_positive_rate: 0.01,
        }
    }
}

impl StoreConfig {
    /// Reject out-of-range options before any file is touched.
    pub fn validate(&self) -> Result<(), StoreError> {
        if !(2..=64).contains(&self.max_readers) {
            return Err(StoreError::InvalidInput(format!(
                "max_readers {} outside 2..=64",
                self.max_readers
            )));
        }
        if !(0.0..1.0).contains(&self.memory_high_pct)
            || !(0.0..=1.0).contains(&self.memory_critical_pct)
            || self.memory_high_pct >= self.memory_critical_pct
        {
            return Err(StoreError::InvalidInput(format!(
                "memory thresholds high={} critical={} invalid",
                self.memory_high_pct, self.memory_critical_pct
            )));
        }
        if !(0.0..0.5).contains(&self.bloom_false_positive_rate)
            || self.bloom_false_positive_rate <= 0.0
        {
            return Err(StoreError::InvalidInput(format!(
                "bloom_false_positive_rate {} outside (0, 0.5)",
                self.bloom_false_positive_rate
            )));
        }
        if self.wal_checkpoint_bytes == 0 {
            return Err(StoreError::InvalidInput(
                "wal_checkpoint_bytes must be non-zero".into(),
            ));
        }
        if self.writer_backpressure_bytes < self.wal_checkpoint_bytes {
            return Err(StoreError::InvalidInput(
                "writer_backpressure_bytes must be >= wal_checkpoint_bytes".into(),
            ));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Request / statistics types
// ------------------------------------------------------------------------------------------------

/// A create request. With `id: None` the configured generator assigns
/// one.
#[derive(Debug, Clone, Default)]
pub struct NewEntity {
    /// Caller-chosen id, or `None` to generate.
    pub id: Option<String>,

    /// Stripped tag values; the store stamps each with the clock.
    pub tags: Vec<String>,

    /// Opaque content blob.
    pub content: Vec<u8>,
}

/// Multi-tag query combinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagQueryMode {
    /// Intersection: ids carrying **every** listed tag.
    All,
    /// Union: ids carrying **any** listed tag.
    Any,
}

/// Snapshot of store statistics.
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// Indexed entity count.
    pub entities: usize,

    /// Data section size in bytes.
    pub data_bytes: u64,

    /// Current WAL size in bytes.
    pub wal_bytes: u64,

    /// WAL frames applied during the last open.
    pub wal_entries_replayed: u64,

    /// WAL frames skipped during the last open.
    pub wal_entries_skipped: u64,

    /// Reader-pool capacity.
    pub pool_capacity: usize,

    /// Reader handles currently leased.
    pub pool_in_use: usize,

    /// Entity cache `(hits, misses)`.
    pub cache_hits: u64,
    /// Entity cache misses.
    pub cache_misses: u64,
    /// Entity cache entry count.
    pub cache_entries: usize,
    /// Entity cache accounted bytes.
    pub cache_bytes: usize,

    /// Interner `(hits, misses)`.
    pub intern_hits: u64,
    /// Interner misses.
    pub intern_misses: u64,
    /// Interner hot-set entry count.
    pub intern_entries: usize,
    /// Interner accounted bytes.
    pub intern_bytes: usize,

    /// Current memory pressure level.
    pub pressure: PressureLevel,
}

// ------------------------------------------------------------------------------------------------
// Store
// ------------------------------------------------------------------------------------------------

pub(crate) struct StoreShared {
    pub(crate) config: StoreConfig,
    pub(crate) path: PathBuf,

    /// The writer lock: all mutation serializes here.
    pub(crate) writer: Mutex<writer::WriterState>,

    pub(crate) pool: ReaderPool,
    pub(crate) index: RwLock<Arc<IndexSet>>,
    pub(crate) interner: Arc<Interner>,
    pub(crate) cache: Arc<EntityCache>,
    pub(crate) guardian: Mutex<MemoryGuardian>,

    /// Absolute end of committed data — the readers' visibility fence
    /// and astronomical-offset guard.
    pub(crate) data_end: AtomicU64,

    pub(crate) read_only: AtomicBool,
    pub(crate) closed: AtomicBool,

    pub(crate) replayed: AtomicU64,
    pub(crate) skipped: AtomicU64,

    pub(crate) clock: Box<dyn Clock>,
    pub(crate) id_gen: Box<dyn IdGenerator>,
}

/// The open database handle. Cloneable and thread-safe; all clones
/// share one writer, one reader pool, one set of caches.
#[derive(Clone)]
pub struct EntityStore {
    shared: Arc<StoreShared>,
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore").finish_non_exhaustive()
    }
}

impl EntityStore {
    /// Open (or create) the database at `path` with the default clock
    /// and id generator.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        let clock: Box<dyn Clock> = Box::new(SystemClock);
        let seed = clock.now_nanos().unsigned_abs();
        Self::open_with(path, config, clock, Box::new(DefaultIdGenerator::new(seed)))
    }

    /// Open with injected clock and id-generator seams.
    pub fn open_with(
        path: impl AsRef<Path>,
        config: StoreConfig,
        clock: Box<dyn Clock>,
        id_gen: Box<dyn IdGenerator>,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();

        let opened = recovery::open_database(&path, &config)?;

        let guardian = MemoryGuardian::start(GuardianConfig {
            cap_bytes: config.memory_cap_bytes,
            high_pct: config.memory_high_pct,
            critical_pct: config.memory_critical_pct,
            period: Duration::from_secs(30),
        });

        let interner = opened.interner;
        let cache = Arc::new(EntityCache::new(
            config.entity_cache_entries,
            config.entity_cache_bytes,
        ));

        // High pressure trims a third of both caches; Critical clears
        // the entity cache outright and halves the interner hot set.
        {
            let cache = Arc::clone(&cache);
            guardian.register_callback(1, move |level| match level {
                PressureLevel::Critical => {
                    cache.clear();
                }
                PressureLevel::High => {
                    cache.evict_fraction(0.35);
                }
                _ => {}
            });
        }
        {
            let interner = Arc::clone(&interner);
            guardian.register_callback(2, move |level| match level {
                PressureLevel::Critical => {
                    interner.evict_fraction(0.5);
                }
                PressureLevel::High => {
                    interner.evict_fraction(0.35);
                }
                _ => {}
            });
        }

        let pool = ReaderPool::open(&path, config.max_readers)?;
        let data_end = opened.writer.data_end();

        let shared = Arc::new(StoreShared {
            config,
            path: path.clone(),
            writer: Mutex::new(opened.writer),
            pool,
            index: RwLock::new(opened.index),
            interner,
            cache,
            guardian: Mutex::new(guardian),
            data_end: AtomicU64::new(data_end),
            read_only: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            replayed: AtomicU64::new(opened.replayed),
            skipped: AtomicU64::new(opened.skipped),
            clock,
            id_gen,
        });

        info!(
            path = %path.display(),
            entities = shared.index.read().map(|i| i.entity_count()).unwrap_or(0),
            replayed = opened.replayed,
            skipped = opened.skipped,
            "entity store opened"
        );

        Ok(Self { shared })
    }

    /// Checkpoint, mark the file cleanly shut down, and release every
    /// resource. Idempotent.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Only checkpoint from a healthy writer; a read-only instance
        // still releases its resources.
        if !self.shared.read_only.load(Ordering::SeqCst) {
            let mut writer = self.lock_writer()?;
            let index = self.index_handle()?;
            if let Err(e) = writer.checkpoint(&self.shared.interner, &index, true) {
                error!(error = %e, "checkpoint on close failed");
            }
            if let Err(e) = writer.unlock_file() {
                warn!(error = %e, "releasing advisory lock failed");
            }
        }

        self.shared.pool.shutdown();
        if let Ok(mut guardian) = self.shared.guardian.lock() {
            guardian.shutdown();
        }

        info!(path = %self.shared.path.display(), "entity store closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // CRUD
    // --------------------------------------------------------------------------------------------

    /// Create a new entity. Every tag is stamped with the current clock
    /// reading. See [`NewEntity`].
    pub fn create(&self, request: NewEntity) -> Result<Arc<Entity>, StoreError> {
        self.ensure_writable()?;

        let now = self.shared.clock.now_nanos();
        let id = match request.id {
            Some(id) => {
                tag::validate_id(&id)?;
                id
            }
            None => self.generate_id()?,
        };

        let tags = stamp_tags(&request.tags, now)?;
        let entity = Entity::new(id, tags, request.content)?;

        let guardian = self.shared.guardian.lock();
        let _depth = guardian
            .as_ref()
            .ok()
            .map(|g| g.write_depth_guard());
        drop(guardian);

        let mut writer = self.lock_writer()?;
        let index = self.index_handle()?;

        if index.contains_id(&entity.id) {
            return Err(StoreError::Conflict(entity.id.clone()));
        }

        self.enforce_backpressure(&mut writer, &index)?;

        let entity = Arc::new(entity);
        let op = WalOp::Create {
            entity: Entity::clone(&entity),
        };
        let offset = match writer.commit(
            &op,
            &entity,
            &self.shared.interner,
            &index,
            &self.shared.config,
        ) {
            Ok(offset) => offset,
            Err(e) => {
                if matches!(e, StoreError::Fatal(_)) {
                    self.mark_read_only("write path failed");
                }
                return Err(e);
            }
        };
        self.shared.data_end.store(writer.data_end(), Ordering::SeqCst);

        index.note_created(&entity, offset)?;
        self.shared.cache.insert(offset, Arc::clone(&entity));

        self.maybe_checkpoint(&mut writer, &index);

        debug!(id = %entity.id, offset, "entity created");
        Ok(entity)
    }

    /// Fetch an entity by id: cache, then index + pooled read.
    pub fn get(&self, id: &str) -> Result<Arc<Entity>, StoreError> {
        self.ensure_open()?;
        tag::validate_id(id)?;

        if let Some(hit) = self.shared.cache.get(id) {
            return Ok(hit);
        }

        let index = self.index_handle()?;
        let Some(offset) = index.offset_of(id) else {
            return Err(StoreError::NotFound(id.to_string()));
        };

        match self.read_entity_at(offset, id) {
            Ok(entity) => {
                self.shared.cache.insert(offset, Arc::clone(&entity));
                Ok(entity)
            }
            Err(StoreError::Corrupt(reason)) => {
                // Runtime corruption: mark the entry suspect and attempt
                // a targeted re-scan of the data section for this id.
                warn!(id, offset, %reason, "record read failed; starting targeted recovery");
                index.forget_offset(id);
                recovery::recover_entity(self, id)
            }
            Err(other) => Err(other),
        }
    }

    /// Append tags (stamped with the clock) and optionally replace the
    /// content. Tag history is preserved — updates are additive.
    pub fn update(
        &self,
        id: &str,
        added_tags: &[String],
        content: Option<Vec<u8>>,
    ) -> Result<Arc<Entity>, StoreError> {
        self.ensure_writable()?;
        tag::validate_id(id)?;
        if let Some(c) = &content
            && c.len() > entity::MAX_CONTENT_LEN
        {
            return Err(StoreError::InvalidInput(format!(
                "content length {} exceeds maximum",
                c.len()
            )));
        }

        let now = self.shared.clock.now_nanos();
        let added = stamp_tags(added_tags, now)?;

        let guardian = self.shared.guardian.lock();
        let _depth = guardian.as_ref().ok().map(|g| g.write_depth_guard());
        drop(guardian);

        let mut writer = self.lock_writer()?;
        let index = self.index_handle()?;

        // Current state, read under the writer lock so the update is
        // applied to the latest committed version.
        let current = match self.shared.cache.get(id) {
            Some(e) => e,
            None => {
                let Some(offset) = index.offset_of(id) else {
                    return Err(StoreError::NotFound(id.to_string()));
                };
                self.read_entity_at(offset, id)?
            }
        };

        self.enforce_backpressure(&mut writer, &index)?;

        let mut next = Entity::clone(&current);
        next.tags.extend(added.iter().cloned());
        if let Some(c) = content.clone() {
            next.content = c;
        }
        next.validate()?;
        let next = Arc::new(next);

        let op = WalOp::Update {
            id: id.to_string(),
            added: added.clone(),
            content,
        };
        let offset = match writer.commit(&op, &next, &self.shared.interner, &index, &self.shared.config)
        {
            Ok(offset) => offset,
            Err(e) => {
                if matches!(e, StoreError::Fatal(_)) {
                    self.mark_read_only("write path failed");
                }
                return Err(e);
            }
        };
        self.shared.data_end.store(writer.data_end(), Ordering::SeqCst);

        index.note_updated(id, &added, offset)?;
        self.shared.cache.insert(offset, Arc::clone(&next));

        self.maybe_checkpoint(&mut writer, &index);

        debug!(id, offset, added = added.len(), "entity updated");
        Ok(next)
    }

    // --------------------------------------------------------------------------------------------
    // Tag queries
    // --------------------------------------------------------------------------------------------

    /// Ids of entities carrying `value` as a tag, in unspecified order.
    pub fn list_by_tag(&self, value: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_open()?;
        tag::validate_value(value)?;
        Ok(self.index_handle()?.ids_for_tag(value))
    }

    /// Multi-tag query. `All` intersects, `Any` unions; results are
    /// sorted by id as the tie-break.
    pub fn list_by_tags(
        &self,
        values: &[String],
        mode: TagQueryMode,
    ) -> Result<Vec<String>, StoreError> {
        self.ensure_open()?;
        if values.is_empty() {
            return Ok(Vec::new());
        }
        for v in values {
            tag::validate_value(v)?;
        }

        let index = self.index_handle()?;
        let mut sets = values.iter().map(|v| {
            index
                .ids_for_tag(v)
                .into_iter()
                .collect::<std::collections::HashSet<String>>()
        });

        let Some(first) = sets.next() else {
            return Ok(Vec::new());
        };
        let combined = match mode {
            TagQueryMode::All => sets.fold(first, |acc, s| &acc & &s),
            TagQueryMode::Any => sets.fold(first, |acc, s| &acc | &s),
        };

        let mut ids: Vec<String> = combined.into_iter().collect();
        ids.sort();
        Ok(ids)
    }

    // --------------------------------------------------------------------------------------------
    // Metrics and statistics
    // --------------------------------------------------------------------------------------------

    /// Record an internal metric as a `type:metric` entity.
    ///
    /// Dropped silently when metric emission is damped by the guardian
    /// or when the caller is already inside a write (recursion breaker).
    pub fn record_metric(&self, name: &str, value: f64) -> Result<(), StoreError> {
        let allowed = match self.shared.guardian.lock() {
            Ok(g) => g.metrics_enabled() && !g.in_write(),
            Err(_) => false,
        };
        if !allowed {
            return Ok(());
        }

        let id = format!("metric-{name}");
        let tag_value = format!("value:{value}");
        match self.update(&id, std::slice::from_ref(&tag_value), None) {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(_)) => self
                .create(NewEntity {
                    id: Some(id),
                    tags: vec!["type:metric".into(), tag_value],
                    content: Vec::new(),
                })
                .map(|_| ()),
            Err(e) => Err(e),
        }
    }

    /// A consistent snapshot of the counters promised to the outer
    /// layer.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        self.ensure_open()?;
        let index = self.index_handle()?;
        let (cache_hits, cache_misses) = self.shared.cache.stats();
        let (intern_hits, intern_misses) = self.shared.interner.stats();

        let (wal_bytes, data_bytes) = {
            let writer = self.lock_writer()?;
            (writer.wal_len(), writer.data_len())
        };

        let pressure = self
            .shared
            .guardian
            .lock()
            .map(|g| g.current_level())
            .unwrap_or(PressureLevel::Low);

        Ok(StoreStats {
            entities: index.entity_count(),
            data_bytes,
            wal_bytes,
            wal_entries_replayed: self.shared.replayed.load(Ordering::Relaxed),
            wal_entries_skipped: self.shared.skipped.load(Ordering::Relaxed),
            pool_capacity: self.shared.pool.capacity(),
            pool_in_use: self.shared.pool.in_use(),
            cache_hits,
            cache_misses,
            cache_entries: self.shared.cache.len(),
            cache_bytes: self.shared.cache.bytes(),
            intern_hits,
            intern_misses,
            intern_entries: self.shared.interner.len(),
            intern_bytes: self.shared.interner.bytes(),
            pressure,
        })
    }

    /// Force a checkpoint now (also exposed to the outer layer for
    /// scheduled maintenance).
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let mut writer = self.lock_writer()?;
        let index = self.index_handle()?;
        writer.checkpoint(&self.shared.interner, &index, false)?;
        self.shared.data_end.store(writer.data_end(), Ordering::SeqCst);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Internal plumbing
    // --------------------------------------------------------------------------------------------

    pub(crate) fn shared(&self) -> &StoreShared {
        &self.shared
    }

    pub(crate) fn ensure_open(&self) -> Result<(), StoreError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Fatal("store is closed".into()));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.shared.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::Fatal(
                "store is read-only after unrecovered corruption".into(),
            ));
        }
        if let Ok(g) = self.shared.guardian.lock()
            && g.writes_rejected()
        {
            return Err(StoreError::Backpressure(
                "writes temporarily rejected under critical memory pressure".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn lock_writer(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, writer::WriterState>, StoreError> {
        self.shared
            .writer
            .lock()
            .map_err(|_| StoreError::Fatal("writer lock poisoned".into()))
    }

    pub(crate) fn index_handle(&self) -> Result<Arc<IndexSet>, StoreError> {
        self.shared
            .index
            .read()
            .map(|g| Arc::clone(&g))
            .map_err(|_| StoreError::Fatal("index lock poisoned".into()))
    }

    pub(crate) fn swap_index(&self, new_index: Arc<IndexSet>) -> Result<(), StoreError> {
        let mut guard = self
            .shared
            .index
            .write()
            .map_err(|_| StoreError::Fatal("index lock poisoned".into()))?;
        *guard = new_index;
        Ok(())
    }

    pub(crate) fn mark_read_only(&self, reason: &str) {
        error!(reason, "store entering read-only mode");
        self.shared.read_only.store(true, Ordering::SeqCst);
    }

    /// Read and decode the record at `offset`, applying the
    /// astronomical-offset guard first.
    pub(crate) fn read_entity_at(
        &self,
        offset: u64,
        expected_id: &str,
    ) -> Result<Arc<Entity>, StoreError> {
        let data_end = self.shared.data_end.load(Ordering::SeqCst);
        let data_start = crate::format::HEADER_LEN as u64;

        if offset < data_start || offset.saturating_add(4) > data_end {
            return Err(StoreError::Corrupt(format!(
                "offset {offset} outside data section [{data_start}, {data_end})"
            )));
        }

        let mut lease = self
            .shared
            .pool
            .acquire(self.shared.config.reader_timeout)?;

        let len_bytes = lease
            .read_at(offset, 4)
            .map_err(|e| StoreError::Corrupt(format!("record length unreadable: {e}")))?;
        let payload_len =
            u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        if payload_len == 0 || payload_len > entity::MAX_RECORD_LEN {
            return Err(StoreError::Corrupt(format!(
                "record length {payload_len} outside bounds at offset {offset}"
            )));
        }
        let framed = entity::framed_len(payload_len as usize);
        if offset.saturating_add(framed as u64) > data_end {
            return Err(StoreError::Corrupt(format!(
                "record at {offset} overruns data end {data_end}"
            )));
        }

        let bytes = lease
            .read_at(offset, framed)
            .map_err(|e| StoreError::Corrupt(format!("record unreadable: {e}")))?;
        drop(lease);

        let (decoded, _) = entity::decode_record(&bytes, self.shared.interner.as_ref())?;
        if decoded.id != expected_id {
            return Err(StoreError::Corrupt(format!(
                "record at {offset} holds id {:?}, index expected {expected_id:?}",
                decoded.id
            )));
        }
        Ok(Arc::new(decoded))
    }

    fn generate_id(&self) -> Result<String, StoreError> {
        let index = self.index_handle()?;
        for _ in 0..64 {
            let candidate = self.shared.id_gen.generate();
            if tag::validate_id(&candidate).is_ok() && !index.contains_id(&candidate) {
                return Ok(candidate);
            }
        }
        Err(StoreError::Fatal(
            "id generator failed to produce a fresh id".into(),
        ))
    }

    fn enforce_backpressure(
        &self,
        writer: &mut writer::WriterState,
        index: &Arc<IndexSet>,
    ) -> Result<(), StoreError> {
        if writer.wal_len() < self.shared.config.writer_backpressure_bytes {
            return Ok(());
        }
        // One inline checkpoint attempt before refusing the write.
        if let Err(e) = writer.checkpoint(&self.shared.interner, index, false) {
            warn!(error = %e, "inline checkpoint under backpressure failed");
        }
        self.shared.data_end.store(writer.data_end(), Ordering::SeqCst);
        if writer.wal_len() >= self.shared.config.writer_backpressure_bytes {
            return Err(StoreError::Backpressure(format!(
                "WAL holds {} bytes, above the {} byte ceiling",
                writer.wal_len(),
                self.shared.config.writer_backpressure_bytes
            )));
        }
        Ok(())
    }

    fn maybe_checkpoint(&self, writer: &mut writer::WriterState, index: &Arc<IndexSet>) {
        let due_bytes = writer.wal_len() >= self.shared.config.wal_checkpoint_bytes;
        let due_age = writer.checkpoint_age().as_secs() >= self.shared.config.wal_checkpoint_seconds
            && !writer.wal_is_empty();
        if !(due_bytes || due_age) {
            return;
        }
        if let Err(e) = writer.checkpoint(&self.shared.interner, index, false) {
            // Background-style maintenance: log and continue. The WAL
            // keeps absorbing writes until backpressure kicks in.
            warn!(error = %e, "checkpoint failed; will retry on a later write");
        }
        self.shared.data_end.store(writer.data_end(), Ordering::SeqCst);
    }
}

impl Drop for EntityStore {
    fn drop(&mut self) {
        // Best-effort close on the last handle.
        if Arc::strong_count(&self.shared) == 1 && !self.shared.closed.load(Ordering::SeqCst) {
            let _ = self.close();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Validate a batch of stripped tag values and stamp each with `now`.
fn stamp_tags(values: &[String], now: i64) -> Result<Vec<Tag>, StoreError> {
    let mut tags = Vec::with_capacity(values.len());
    for v in values {
        tags.push(Tag::new(now, v.clone())?);
    }
    Ok(tags)
}
