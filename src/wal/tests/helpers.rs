use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;

use crate::entity::Entity;
use crate::tag::Tag;
use crate::wal::{Wal, WalOp};

/// Where the embedded WAL section starts in these tests. Non-zero on
/// purpose: replay must seek to the section offset, never to file 0.
pub const WAL_START: u64 = 256;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Open a read/write test file with `WAL_START` bytes of non-zero
/// preamble, mimicking the header + data sections that precede the WAL
/// in a real database file.
pub fn open_wal_file(path: &Path) -> Arc<Mutex<File>> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(path)
        .unwrap();
    file.write_all(&vec![0xEE; WAL_START as usize]).unwrap();
    file.seek(SeekFrom::Start(WAL_START)).unwrap();
    Arc::new(Mutex::new(file))
}

/// A fresh WAL over the section starting at `WAL_START`.
pub fn fresh_wal(path: &Path) -> Wal {
    Wal::new(open_wal_file(path), WAL_START, 0)
}

/// A create op for a small entity with one tag.
pub fn create_op(id: &str, ts: i64, value: &str) -> WalOp {
    WalOp::Create {
        entity: Entity::new(id, vec![Tag::new(ts, value).unwrap()], b"body".to_vec()).unwrap(),
    }
}

/// An update op appending one tag.
pub fn update_op(id: &str, ts: i64, value: &str) -> WalOp {
    WalOp::Update {
        id: id.to_string(),
        added: vec![Tag::new(ts, value).unwrap()],
        content: None,
    }
}

/// Overwrite bytes at an absolute file offset.
pub fn stomp(wal_file: &Arc<Mutex<File>>, offset: u64, bytes: &[u8]) {
    let mut guard = wal_file.lock().unwrap();
    guard.seek(SeekFrom::Start(offset)).unwrap();
    guard.write_all(bytes).unwrap();
    guard.sync_all().unwrap();
}
