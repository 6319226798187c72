//! Corruption recovery tests.
//!
//! Corruption is injected into crash images (file copies) or directly
//! into the live file's regions, then observed through the public
//! surface: reads heal or fail cleanly, opens replay or rebuild, and
//! nothing ever panics.
//!
//! Coverage:
//! - WAL corruption survival: oversize length prefix in a crash image
//! - Index-snapshot corruption → rebuild from the data section at open
//! - Record corruption at runtime → targeted self-heal via rescan
//! - Header corruption → open fails cleanly

#[cfg(test)]
mod tests {
    use crate::format::{FileHeader, HEADER_LEN};
    use crate::store::tests::helpers::*;
    use crate::store::{EntityStore, StoreError};
    use std::fs::{self, OpenOptions};
    use std::io::{Seek, SeekFrom, Write};
    use std::sync::Arc;
    use std::sync::atomic::AtomicI64;

    fn stomp(path: &std::path::Path, offset: u64, bytes: &[u8]) {
        let mut f = OpenOptions::new().read(true).write(true).open(path).unwrap();
        f.seek(SeekFrom::Start(offset)).unwrap();
        f.write_all(bytes).unwrap();
        f.sync_all().unwrap();
    }

    fn read_header(path: &std::path::Path) -> FileHeader {
        FileHeader::decode(&fs::read(path).unwrap()).unwrap()
    }

    /// # Scenario
    /// The end-to-end WAL-corruption-survival property: a crash image
    /// whose first WAL frame claims a 1 GiB length still opens, applies
    /// nothing bogus, and reports the skip.
    ///
    /// # Actions
    /// 1. Create u1 and checkpoint (durable baseline, WAL empty).
    /// 2. Create u2 (one WAL frame).
    /// 3. Copy the file; overwrite the frame's length prefix with 1 GiB.
    /// 4. Open the copy.
    ///
    /// # Expected behavior
    /// Open succeeds; `entries_skipped = 1`; u1 is intact. u2's record
    /// also landed in the data section before the "crash", so it
    /// survives through the index — only the WAL frame was lost.
    #[test]
    fn wal_corruption_survival() {
        let fx = open_fixture();
        let path = fx.path();

        fx.store.create(new_entity("u1", &["type:user"], b"base")).unwrap();
        fx.store.checkpoint().unwrap();
        fx.store.create(new_entity("u2", &["type:user"], b"tail")).unwrap();

        let crash_path = fx.dir.path().join("crash.edb");
        fs::copy(&path, &crash_path).unwrap();

        let wal_offset = read_header(&crash_path).wal.offset;
        stomp(&crash_path, wal_offset, &1_073_741_824u32.to_le_bytes());

        let recovered = open_at(&crash_path, Arc::new(AtomicI64::new(9000)));
        let stats = recovered.stats().unwrap();
        assert_eq!(stats.wal_entries_skipped, 1);
        assert_eq!(stats.wal_entries_replayed, 0);

        assert_eq!(recovered.get("u1").unwrap().content, b"base");
        assert_eq!(recovered.get("u2").unwrap().content, b"tail");
        recovered.close().unwrap();
    }

    /// # Scenario
    /// A corrupted index snapshot is discarded at open and rebuilt by
    /// scanning the data section; every lookup still works.
    #[test]
    fn index_snapshot_corruption_rebuilds() {
        let fx = open_fixture();
        let path = fx.path();

        fx.store
            .create(new_entity("u1", &["type:user", "status:active"], b"x"))
            .unwrap();
        fx.store.create(new_entity("u2", &["type:user"], b"y")).unwrap();
        fx.store.close().unwrap();

        let header = read_header(&path);
        assert!(header.index.size > 0);
        stomp(&path, header.index.offset + header.index.size / 2, &[0xFF; 8]);

        let reopened = open_at(&path, Arc::clone(&fx.clock));
        assert_eq!(reopened.stats().unwrap().entities, 2);
        let mut users = reopened.list_by_tag("type:user").unwrap();
        users.sort();
        assert_eq!(users, vec!["u1", "u2"]);
        assert_eq!(reopened.get("u2").unwrap().content, b"y");
        reopened.close().unwrap();
    }

    /// # Scenario
    /// A record corrupted on disk at runtime: the first read fails its
    /// digest, triggers the targeted rescan, and — because the record
    /// is genuinely gone — the id is reported unrecoverable while other
    /// entities heal and keep serving.
    #[test]
    fn runtime_record_corruption_self_heals() {
        let fx = open_fixture();
        let path = fx.path();

        fx.store.create(new_entity("u1", &["type:user"], b"aaaa")).unwrap();
        fx.store.create(new_entity("u2", &["type:user"], b"bbbb")).unwrap();

        // u2's record sits after u1's. Corrupt u2's payload bytes on
        // disk, then drop the cached copy so the read goes to disk.
        let header = read_header(&path);
        let data_end = header.data.offset + header.data.size;
        stomp(&path, data_end - 8, &[0xEE; 4]);
        fx.store.shared().cache.clear();

        let err = fx.store.get("u2").unwrap_err();
        assert!(matches!(err, StoreError::Fatal(_) | StoreError::Corrupt(_)));

        // The heal rebuilt the index from what still decodes: u1 is
        // alive and well, u2 is now a clean NotFound.
        assert_eq!(fx.store.get("u1").unwrap().content, b"aaaa");
        assert!(matches!(
            fx.store.get("u2").unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    /// # Scenario
    /// A file whose header CRC is broken cannot be opened; the failure
    /// is a clean `Fatal`, not a panic.
    #[test]
    fn header_corruption_fails_open() {
        let fx = open_fixture();
        let path = fx.path();
        fx.store.create(new_entity("u1", &["type:user"], b"")).unwrap();
        fx.store.close().unwrap();

        stomp(&path, 10, &[0x55]);

        let err = EntityStore::open(&path, test_config()).unwrap_err();
        assert!(matches!(err, StoreError::Fatal(_)));
        assert_eq!(err.code(), "fatal");
    }

    /// # Scenario
    /// A header declaring an astronomical section offset is rejected at
    /// open before any read is attempted.
    #[test]
    fn astronomical_offset_fails_open() {
        let fx = open_fixture();
        let path = fx.path();
        fx.store.create(new_entity("u1", &["type:user"], b"")).unwrap();
        fx.store.close().unwrap();

        // Forge a header with a wild WAL offset and a valid CRC.
        let mut header = read_header(&path);
        header.wal = crate::format::SectionSpan::new(u64::MAX - 1024, 512);
        let bytes = header.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        stomp(&path, 0, &bytes);

        let err = EntityStore::open(&path, test_config()).unwrap_err();
        assert!(matches!(err, StoreError::Fatal(_)));
    }
}
