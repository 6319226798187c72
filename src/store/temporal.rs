//! Temporal query engine: as-of, history, changes-since, diff.
//!
//! Every tag carries its creation timestamp, so an entity's past is
//! fully addressable:
//!
//! - **as-of** — the entity restricted to tags with `ts ≤ T`;
//! - **history** — the tag list ordered ascending by timestamp;
//! - **changes-since** — tag insertions after `T`, for one entity (its
//!   own tag list) or globally (the temporal B-tree);
//! - **diff** — what appeared in `(T1, T2]` and which earlier values
//!   those arrivals shadowed, plus both boundary snapshots.
//!
//! Timestamps compare as signed 64-bit nanoseconds. Tags sharing a
//! nanosecond are ordered by their insertion index within the entity's
//! tag list — sorts here are stable precisely so that order survives.

use crate::entity::Entity;
use crate::index::TemporalHit;
use crate::store::{EntityStore, StoreError};
use crate::tag::{self, Tag};

// ------------------------------------------------------------------------------------------------
// Result types
// ------------------------------------------------------------------------------------------------

/// One pre-T1 tag displaced by a newer arrival inside a diff window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagShadow {
    /// The displaced value (current as of T1).
    pub value: String,

    /// The value that displaced it.
    pub shadowed_by: String,

    /// Timestamp of the displacing tag.
    pub shadowed_at: i64,
}

/// Result of [`EntityStore::diff`].
#[derive(Debug, Clone)]
pub struct EntityDiff {
    /// Tags with `T1 < ts ≤ T2`, in insertion order.
    pub added: Vec<Tag>,

    /// Pre-T1 current values displaced by an arrival in the window.
    pub removed: Vec<TagShadow>,

    /// Snapshot as of T1.
    pub before: Entity,

    /// Snapshot as of T2.
    pub after: Entity,
}

// ------------------------------------------------------------------------------------------------
// Queries
// ------------------------------------------------------------------------------------------------

impl EntityStore {
    /// The entity as it stood at time `at`: exactly the tags with
    /// `ts ≤ at`. Fails with [`StoreError::NotFoundAtTime`] when the
    /// entity's earliest tag is later than `at`.
    pub fn as_of(&self, id: &str, at: i64) -> Result<Entity, StoreError> {
        let entity = self.get(id)?;
        match entity.earliest_ts() {
            Some(earliest) if earliest <= at => Ok(entity.snapshot_at(at)),
            _ => Err(StoreError::NotFoundAtTime {
                id: id.to_string(),
                at,
            }),
        }
    }

    /// The entity's tag history ascending by timestamp (insertion order
    /// within equal nanoseconds), truncated to `limit` entries
    /// (0 = unlimited).
    pub fn history(&self, id: &str, limit: usize) -> Result<Vec<Tag>, StoreError> {
        let entity = self.get(id)?;
        let mut tags = entity.tags.clone();
        // Stable sort: equal timestamps keep their insertion order.
        tags.sort_by_key(|t| t.ts);
        if limit != 0 {
            tags.truncate(limit);
        }
        Ok(tags)
    }

    /// Tag insertions strictly after `since`, ascending by `(ts,
    /// insertion)`, truncated to `limit` (0 = unlimited).
    ///
    /// With an id the walk is over that entity's own tag list; without
    /// one the temporal B-tree serves the global range scan.
    pub fn changes_since(
        &self,
        id: Option<&str>,
        since: i64,
        limit: usize,
    ) -> Result<Vec<TemporalHit>, StoreError> {
        match id {
            Some(id) => {
                let entity = self.get(id)?;
                let mut hits: Vec<TemporalHit> = entity
                    .tags
                    .iter()
                    .filter(|t| t.ts > since)
                    .map(|t| TemporalHit {
                        ts: t.ts,
                        entity_id: entity.id.clone(),
                        value: t.value.clone(),
                    })
                    .collect();
                hits.sort_by_key(|h| h.ts);
                if limit != 0 {
                    hits.truncate(limit);
                }
                Ok(hits)
            }
            None => {
                self.ensure_open()?;
                Ok(self.index_handle()?.changes_since(since, limit))
            }
        }
    }

    /// Difference between the entity at `t1` and at `t2` (`t1 ≤ t2`):
    /// the tags that arrived in `(t1, t2]`, the pre-`t1` current values
    /// they shadowed, and both boundary snapshots.
    pub fn diff(&self, id: &str, t1: i64, t2: i64) -> Result<EntityDiff, StoreError> {
        if t1 > t2 {
            return Err(StoreError::InvalidInput(format!(
                "diff window inverted: {t1} > {t2}"
            )));
        }

        let entity = self.get(id)?;
        let before = entity.snapshot_at(t1);
        let after = entity.snapshot_at(t2);

        let added: Vec<Tag> = entity
            .tags
            .iter()
            .filter(|t| t.ts > t1 && t.ts <= t2)
            .cloned()
            .collect();

        // For each attribute visible at T1, the latest window arrival
        // in the same namespace shadows it. Values without a namespace
        // shadow only their own exact value.
        let mut removed = Vec::new();
        for old in current_values(&before.tags, t1) {
            let old_key = attribute_key(&old.value);
            let shadow = added
                .iter()
                .filter(|t| attribute_key(&t.value) == old_key)
                .max_by_key(|t| t.ts);
            if let Some(shadow) = shadow {
                removed.push(TagShadow {
                    value: old.value.clone(),
                    shadowed_by: shadow.value.clone(),
                    shadowed_at: shadow.ts,
                });
            }
        }

        Ok(EntityDiff {
            added,
            removed,
            before,
            after,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// The attribute an arriving tag competes for: its namespace, or the
/// whole value when it has none.
fn attribute_key(value: &str) -> &str {
    tag::namespace_of(value).unwrap_or(value)
}

/// The current (visible) tag per attribute at time `at`, from a
/// snapshot's tag list. Attribute order follows first appearance; the
/// winner per attribute is the maximal `ts ≤ at`, later insertion
/// breaking ties.
fn current_values(tags: &[Tag], at: i64) -> Vec<&Tag> {
    let mut keys: Vec<&str> = Vec::new();
    for t in tags {
        let key = attribute_key(&t.value);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys.into_iter()
        .filter_map(|key| {
            let mut best: Option<&Tag> = None;
            for t in tags {
                if t.ts > at || attribute_key(&t.value) != key {
                    continue;
                }
                match best {
                    Some(b) if t.ts < b.ts => {}
                    _ => best = Some(t),
                }
            }
            best
        })
        .collect()
}
