//! Entity cache behaviour tests.
//!
//! Coverage:
//! - Hit / miss counters and Arc-sharing on hits
//! - Entry-cap LRU eviction order
//! - Byte-cap eviction
//! - Offset-versioned inserts: stale copies never clobber fresh ones
//! - Invalidation removes exactly the targeted id
//! - Fractional eviction and clear

#[cfg(test)]
mod tests {
    use crate::cache::EntityCache;
    use crate::entity::Entity;
    use crate::tag::Tag;
    use std::sync::Arc;

    fn entity(id: &str, content_len: usize) -> Arc<Entity> {
        Arc::new(
            Entity::new(
                id,
                vec![Tag::new(1, "type:test").unwrap()],
                vec![0u8; content_len],
            )
            .unwrap(),
        )
    }

    fn tagged(id: &str, value: &str) -> Arc<Entity> {
        Arc::new(Entity::new(id, vec![Tag::new(1, value).unwrap()], vec![]).unwrap())
    }

    /// # Scenario
    /// Get after insert hits and returns the same allocation.
    #[test]
    fn hit_returns_shared_entity() {
        let cache = EntityCache::new(10, 1 << 20);
        let e = entity("u1", 10);
        cache.insert(100, Arc::clone(&e));

        let got = cache.get("u1").unwrap();
        assert!(Arc::ptr_eq(&got, &e));

        assert!(cache.get("missing").is_none());
        assert_eq!(cache.stats(), (1, 1));
    }

    /// # Scenario
    /// With an entry cap of 2, inserting a third entity evicts the LRU
    /// one; a `get` refreshes recency.
    #[test]
    fn entry_cap_respects_lru_order() {
        let cache = EntityCache::new(2, 1 << 20);
        cache.insert(100, entity("a", 10));
        cache.insert(200, entity("b", 10));

        // Touch "a" so "b" is now least recently used.
        cache.get("a");
        cache.insert(300, entity("c", 10));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }

    /// # Scenario
    /// The byte cap evicts oldest-first until accounted bytes fit.
    #[test]
    fn byte_cap_enforced() {
        let cache = EntityCache::new(100, 4096);
        for i in 0..10 {
            cache.insert(i * 1000, entity(&format!("e{i}"), 1000));
        }
        assert!(cache.bytes() <= 4096);
        assert!(cache.len() < 10);
        // The newest entry always survives its own insert.
        assert!(cache.get("e9").is_some());
    }

    /// # Scenario
    /// A stale insert (lower record offset) never replaces a fresher
    /// copy — the slow-reader-vs-writer race is decided by version.
    ///
    /// # Actions
    /// 1. Writer caches `u1` decoded from offset 500.
    /// 2. A slow reader tries to cache the copy it decoded earlier from
    ///    offset 100.
    ///
    /// # Expected behavior
    /// The offset-500 copy stays; an offset-600 insert then wins.
    #[test]
    fn stale_insert_is_dropped() {
        let cache = EntityCache::new(10, 1 << 20);

        let fresh = tagged("u1", "status:new");
        cache.insert(500, Arc::clone(&fresh));

        cache.insert(100, tagged("u1", "status:old"));
        assert!(Arc::ptr_eq(&cache.get("u1").unwrap(), &fresh));

        let newest = tagged("u1", "status:newest");
        cache.insert(600, Arc::clone(&newest));
        assert!(Arc::ptr_eq(&cache.get("u1").unwrap(), &newest));
    }

    /// # Scenario
    /// Invalidation drops exactly the targeted id and its bytes.
    #[test]
    fn invalidate_single_id() {
        let cache = EntityCache::new(10, 1 << 20);
        cache.insert(100, entity("u1", 100));
        cache.insert(200, entity("u2", 100));
        let before = cache.bytes();

        cache.invalidate("u1");
        assert!(cache.get("u1").is_none());
        assert!(cache.get("u2").is_some());
        assert!(cache.bytes() < before);

        // Invalidating a missing id is a no-op.
        cache.invalidate("ghost");
        assert_eq!(cache.len(), 1);
    }

    /// # Scenario
    /// Replacing an entity under the same id does not double-count
    /// bytes.
    #[test]
    fn replacement_accounting() {
        let cache = EntityCache::new(10, 1 << 20);
        cache.insert(100, entity("u1", 1000));
        let first = cache.bytes();

        cache.insert(200, entity("u1", 1000));
        assert_eq!(cache.bytes(), first);
        assert_eq!(cache.len(), 1);
    }

    /// # Scenario
    /// Fractional eviction removes the requested share; clear empties
    /// everything.
    #[test]
    fn fractional_eviction_and_clear() {
        let cache = EntityCache::new(100, 1 << 20);
        for i in 0..10 {
            cache.insert(i * 100, entity(&format!("e{i}"), 10));
        }

        let removed = cache.evict_fraction(0.3);
        assert_eq!(removed, 3);
        assert_eq!(cache.len(), 7);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.bytes(), 0);
    }
}
