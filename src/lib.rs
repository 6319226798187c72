//! # EntityDB
//!
//! A single-node **temporal entity database** in one file. The unit of
//! storage is the entity: an opaque id, an ordered history of
//! nanosecond-timestamped tags, and an opaque content blob. Because
//! every tag carries its creation time, the full history of any
//! attribute is preserved and addressable — as-of, history, diff, and
//! changes-since are first-class queries, not reconstructions.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        EntityStore                          │
//! │                                                             │
//! │   writes ─► writer mutex ─► WAL ─► data section ─► indices │
//! │   reads  ─► entity cache ─► id index ─► reader pool        │
//! │                                                             │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │ one file: [header][data][dict][index][WAL]            │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! │                                                             │
//! │  guardian: RSS sampling ─► coordinated cache eviction       │
//! │  checkpoint: dict+index rewrite, WAL truncate, header sync  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`store`] | The facade — CRUD, tag queries, temporal engine, recovery |
//! | [`entity`] | Entity model and the on-disk record codec |
//! | [`tag`] | Temporal tag primitives and validation |
//! | [`format`] | Unified file header and section layout guards |
//! | [`wal`] | Embedded write-ahead log with skip-and-continue replay |
//! | [`index`] | Id→offset map, sharded tag index, Bloom filter, temporal B-tree |
//! | [`pool`] | Bounded pool of independent read handles |
//! | [`intern`] | Bounded LRU tag-string interner / dictionary |
//! | [`cache`] | Bounded LRU cache of decoded entities |
//! | [`guardian`] | Memory-pressure observer and coordinated eviction |
//! | [`encoding`] | Deterministic little-endian wire format |
//!
//! ## Key Properties
//!
//! - **WAL-first durability** — every mutation is framed, checksummed,
//!   and fsynced into the embedded WAL before it is acknowledged.
//! - **Corruption is a state, not an exception** — bad WAL frames, bad
//!   records, and bad index entries are counted, skipped, and healed;
//!   a single bad byte never takes the store down.
//! - **No shared file positions** — every concurrent reader leases its
//!   own handle from a bounded pool; the writer holds exactly one more.
//! - **Bounded memory** — interner and entity cache carry entry and
//!   byte caps, coordinated by a pressure-driven guardian.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use entitydb::store::{EntityStore, NewEntity, StoreConfig, TagQueryMode};
//!
//! let store = EntityStore::open("/tmp/app.edb", StoreConfig::default()).unwrap();
//!
//! // Create
//! let user = store
//!     .create(NewEntity {
//!         id: Some("u1".into()),
//!         tags: vec!["type:user".into(), "status:active".into()],
//!         content: b"profile".to_vec(),
//!     })
//!     .unwrap();
//!
//! // Read
//! let fetched = store.get("u1").unwrap();
//! assert_eq!(fetched.tag_values(), vec!["type:user", "status:active"]);
//!
//! // Update is additive: history is preserved.
//! store.update("u1", &["status:inactive".into()], None).unwrap();
//!
//! // Temporal queries
//! let then = user.tags[0].ts;
//! let snapshot = store.as_of("u1", then).unwrap();
//! let history = store.history("u1", 0).unwrap();
//! let diff = store.diff("u1", then, i64::MAX).unwrap();
//!
//! // Tag queries
//! let actives = store
//!     .list_by_tags(&["type:user".into(), "status:inactive".into()], TagQueryMode::All)
//!     .unwrap();
//!
//! // Graceful shutdown
//! store.close().unwrap();
//! # let _ = (snapshot, history, diff, actives);
//! ```

pub mod cache;
pub mod encoding;
pub mod entity;
pub mod format;
pub mod guardian;
pub mod index;
pub mod intern;
pub mod pool;
pub mod store;
pub mod tag;
pub mod wal;

pub use entity::Entity;
pub use store::{
    EntityDiff, EntityStore, NewEntity, StoreConfig, StoreError, StoreStats, TagQueryMode,
    TagShadow,
};
pub use tag::Tag;
