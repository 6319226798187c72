//! Index snapshot persistence tests.
//!
//! Coverage:
//! - Snapshot → load round-trip restores ids, tags, temporal tree, and
//!   the insertion sequence
//! - Bloom filter rebuilt on load (negative lookups still short-circuit)
//! - Corrupted snapshots rejected by CRC
//! - Rebuild-from-entities fallback

#[cfg(test)]
mod tests {
    use crate::entity::Entity;
    use crate::index::{IndexError, IndexSet};
    use crate::tag::Tag;

    fn seeded() -> IndexSet {
        let idx = IndexSet::new(500, 0.01).unwrap();
        for (id, off, tags) in [
            ("u1", 100u64, vec![("type:user", 1000i64), ("status:active", 2000)]),
            ("u2", 200, vec![("type:user", 1500)]),
            ("g1", 300, vec![("type:group", 1200)]),
        ] {
            let e = Entity::new(
                id,
                tags.iter().map(|(v, ts)| Tag::new(*ts, *v).unwrap()).collect(),
                vec![],
            )
            .unwrap();
            idx.note_created(&e, off).unwrap();
        }
        idx
    }

    /// # Scenario
    /// A snapshot taken from a populated index restores every lookup
    /// after `load`.
    #[test]
    fn snapshot_load_round_trip() {
        let idx = seeded();
        let bytes = idx.snapshot().unwrap();

        let loaded = IndexSet::load(&bytes, 500, 0.01).unwrap();

        assert_eq!(loaded.entity_count(), 3);
        assert_eq!(loaded.offset_of("u1"), Some(100));
        assert_eq!(loaded.offset_of("g1"), Some(300));

        let mut users = loaded.ids_for_tag("type:user");
        users.sort();
        assert_eq!(users, vec!["u1", "u2"]);

        let hits = loaded.changes_since(1100, 0);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].value, "type:group");

        // The sequence counter continues rather than restarting, so
        // equal-ts ordering stays correct across restarts.
        let e = Entity::new("u3", vec![Tag::new(2000, "late:tag").unwrap()], vec![]).unwrap();
        loaded.note_created(&e, 400).unwrap();
        let at_2000 = loaded.changes_since(1999, 0);
        assert_eq!(at_2000.last().unwrap().value, "late:tag");
    }

    /// # Scenario
    /// After load, the rebuilt Bloom filter still passes known values
    /// and the tag path still rejects unknown ones.
    #[test]
    fn bloom_rebuilt_on_load() {
        let bytes = seeded().snapshot().unwrap();
        let loaded = IndexSet::load(&bytes, 500, 0.01).unwrap();

        assert!(!loaded.ids_for_tag("type:user").is_empty());
        assert!(loaded.ids_for_tag("never:indexed").is_empty());
    }

    /// # Scenario
    /// Any byte flip in the snapshot is caught by the trailing CRC.
    #[test]
    fn corrupted_snapshot_rejected() {
        let mut bytes = seeded().snapshot().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;

        assert!(matches!(
            IndexSet::load(&bytes, 500, 0.01),
            Err(IndexError::ChecksumMismatch)
        ));

        assert!(matches!(
            IndexSet::load(&[], 500, 0.01),
            Err(IndexError::ChecksumMismatch)
        ));
    }

    /// # Scenario
    /// The rescan fallback builds an equivalent index from decoded
    /// entities.
    #[test]
    fn rebuild_from_entities() {
        let entities = vec![
            (
                Entity::new("u1", vec![Tag::new(1000, "type:user").unwrap()], vec![]).unwrap(),
                100u64,
            ),
            (
                Entity::new("u2", vec![Tag::new(2000, "type:user").unwrap()], vec![]).unwrap(),
                200,
            ),
        ];

        let idx = IndexSet::rebuild_from(&entities, 500, 0.01).unwrap();
        assert_eq!(idx.entity_count(), 2);
        let mut users = idx.ids_for_tag("type:user");
        users.sort();
        assert_eq!(users, vec!["u1", "u2"]);
        assert_eq!(idx.changes_since(0, 0).len(), 2);
    }
}
