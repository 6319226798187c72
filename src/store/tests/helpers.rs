use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use crate::store::{Clock, EntityStore, IdGenerator, NewEntity, StoreConfig};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A manually advanced clock so temporal assertions are exact.
pub struct FixedClock(pub Arc<AtomicI64>);

impl Clock for FixedClock {
    fn now_nanos(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Deterministic id generator: `gen-0`, `gen-1`, …
pub struct SeqIdGenerator(AtomicU64);

impl IdGenerator for SeqIdGenerator {
    fn generate(&self) -> String {
        format!("gen-{}", self.0.fetch_add(1, Ordering::SeqCst))
    }
}

/// Small-bounds config so tests exercise eviction and checkpoint paths
/// without writing megabytes.
pub fn test_config() -> StoreConfig {
    StoreConfig {
        max_readers: 4,
        reader_timeout: Duration::from_secs(2),
        writer_backpressure_bytes: 8 * 1024 * 1024,
        wal_checkpoint_bytes: 4 * 1024 * 1024,
        wal_checkpoint_seconds: 3600,
        entity_cache_entries: 64,
        entity_cache_bytes: 1 << 20,
        string_intern_entries: 1024,
        string_intern_bytes: 1 << 20,
        bloom_expected_tags: 512,
        ..StoreConfig::default()
    }
}

/// A store under test: handle, its clock, and the backing tempdir.
pub struct Fixture {
    pub store: EntityStore,
    pub clock: Arc<AtomicI64>,
    pub dir: TempDir,
}

impl Fixture {
    pub fn path(&self) -> PathBuf {
        self.dir.path().join("db.edb")
    }

    pub fn set_time(&self, nanos: i64) {
        self.clock.store(nanos, Ordering::SeqCst);
    }
}

/// Open a fresh store with a fixed clock starting at t=1000.
pub fn open_fixture() -> Fixture {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(AtomicI64::new(1000));
    let store = open_at(dir.path().join("db.edb"), Arc::clone(&clock));
    Fixture { store, clock, dir }
}

/// Open (or reopen) a store at `path` sharing `clock`.
pub fn open_at(path: impl AsRef<Path>, clock: Arc<AtomicI64>) -> EntityStore {
    EntityStore::open_with(
        path,
        test_config(),
        Box::new(FixedClock(Arc::clone(&clock))),
        Box::new(SeqIdGenerator(AtomicU64::new(0))),
    )
    .unwrap()
}

/// Shorthand for a create request with a caller id.
pub fn new_entity(id: &str, tags: &[&str], content: &[u8]) -> NewEntity {
    NewEntity {
        id: Some(id.to_string()),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        content: content.to_vec(),
    }
}
