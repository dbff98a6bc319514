//! Identity Map: one tracked instance per entity key.
//!
//! The map owns every [`Entry`] of a session and indexes them two ways: by
//! the instance they track and by their [`EntityKey`]. The key index is what
//! makes "same key, same instance" hold: registering a second instance under
//! a key that is already taken is an `IdentityConflict`.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! map.insert(entry)?;
//!
//! // Same key resolves to the same instance
//! assert_eq!(map.find(&key), Some(entity));
//!
//! // A different instance with that key is rejected
//! assert!(map.insert(other_entry).is_err());
//! ```

use crate::entry::{EntityKey, Entry};
use crate::graph::EntityId;
use entrack_core::{Error, Result, TrackingErrorKind};
use std::collections::HashMap;

/// Entries of a session indexed by instance and by key.
#[derive(Debug, Default)]
pub struct IdentityMap {
    /// Map from key to the instance registered under it.
    by_key: HashMap<EntityKey, EntityId>,
    /// Map from instance to its entry.
    entries: HashMap<EntityId, Entry>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry under its key.
    ///
    /// Fails with `IdentityConflict` when a different instance already owns
    /// the key; the map is left unchanged.
    pub fn insert(&mut self, entry: Entry) -> Result<()> {
        if let Some(&existing) = self.by_key.get(&entry.key) {
            if existing != entry.entity {
                return Err(conflict(&entry.key, existing));
            }
        }
        self.by_key.insert(entry.key.clone(), entry.entity);
        self.entries.insert(entry.entity, entry);
        Ok(())
    }

    /// Instance registered under a key.
    pub fn find(&self, key: &EntityKey) -> Option<EntityId> {
        self.by_key.get(key).copied()
    }

    /// Entry of a tracked instance.
    pub fn get(&self, entity: EntityId) -> Option<&Entry> {
        self.entries.get(&entity)
    }

    /// Mutable entry of a tracked instance.
    pub fn get_mut(&mut self, entity: EntityId) -> Option<&mut Entry> {
        self.entries.get_mut(&entity)
    }

    /// Whether the instance is tracked.
    pub fn contains(&self, entity: EntityId) -> bool {
        self.entries.contains_key(&entity)
    }

    /// Stop tracking an instance.
    pub fn remove(&mut self, entity: EntityId) -> Option<Entry> {
        let entry = self.entries.remove(&entity)?;
        if self.by_key.get(&entry.key) == Some(&entity) {
            self.by_key.remove(&entry.key);
        }
        Some(entry)
    }

    /// Move an entry to a new key.
    ///
    /// Fails with `IdentityConflict` when another instance owns the new key.
    pub fn rekey(&mut self, entity: EntityId, key: EntityKey) -> Result<()> {
        if let Some(&existing) = self.by_key.get(&key) {
            if existing != entity {
                return Err(conflict(&key, existing));
            }
        }
        let Some(entry) = self.entries.get_mut(&entity) else {
            return Err(Error::tracking(
                TrackingErrorKind::InvalidState,
                format!("{:?} is not tracked", entity),
            ));
        };
        if self.by_key.get(&entry.key) == Some(&entity) {
            self.by_key.remove(&entry.key);
        }
        entry.key = key.clone();
        self.by_key.insert(key, entity);
        Ok(())
    }

    /// Tracked instances in ascending id order.
    ///
    /// Passes over the map iterate this list so results do not depend on
    /// hash order.
    pub fn ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// All entries, in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Clear all entries from the identity map.
    pub fn clear(&mut self) {
        self.by_key.clear();
        self.entries.clear();
    }

    /// Get the number of entries in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn conflict(key: &EntityKey, existing: EntityId) -> Error {
    tracing::debug!(
        key_hash = key.key_hash(),
        existing = existing.index(),
        "Identity conflict"
    );
    Error::tracking(
        TrackingErrorKind::IdentityConflict,
        format!(
            "another instance ({:?}) is already tracked with key {:?}",
            existing,
            key.values()
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntityState;
    use entrack_core::{EntityTypeId, Value};

    fn entry(id: usize, key: i64) -> Entry {
        Entry::new(
            EntityId(id),
            EntityTypeId(0),
            EntityState::Unchanged,
            EntityKey::new(EntityTypeId(0), vec![Value::BigInt(key)]),
            Vec::new(),
            1,
        )
    }

    fn key(k: i64) -> EntityKey {
        EntityKey::new(EntityTypeId(0), vec![Value::BigInt(k)])
    }

    #[test]
    fn test_identity_map_insert_and_find() {
        let mut map = IdentityMap::new();
        map.insert(entry(0, 1)).unwrap();
        assert_eq!(map.find(&key(1)), Some(EntityId(0)));
        assert_eq!(map.find(&EntityKey::new(EntityTypeId(0), vec![Value::Int(1)])), Some(EntityId(0)));
        assert!(map.contains(EntityId(0)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_identity_map_rejects_second_instance() {
        let mut map = IdentityMap::new();
        map.insert(entry(0, 1)).unwrap();
        let err = map.insert(entry(1, 1)).unwrap_err();
        assert_eq!(err.tracking_kind(), Some(TrackingErrorKind::IdentityConflict));
        assert!(!map.contains(EntityId(1)));
        // Re-registering the same instance is fine
        map.insert(entry(0, 1)).unwrap();
    }

    #[test]
    fn test_identity_map_remove() {
        let mut map = IdentityMap::new();
        map.insert(entry(0, 1)).unwrap();
        assert!(map.remove(EntityId(0)).is_some());
        assert!(map.remove(EntityId(0)).is_none());
        assert_eq!(map.find(&key(1)), None);
        map.insert(entry(1, 1)).unwrap();
        assert_eq!(map.find(&key(1)), Some(EntityId(1)));
    }

    #[test]
    fn test_identity_map_rekey() {
        let mut map = IdentityMap::new();
        map.insert(entry(0, -1)).unwrap();
        map.insert(entry(1, 5)).unwrap();
        map.rekey(EntityId(0), key(10)).unwrap();
        assert_eq!(map.find(&key(-1)), None);
        assert_eq!(map.find(&key(10)), Some(EntityId(0)));
        assert_eq!(map.get(EntityId(0)).unwrap().key(), &key(10));

        let err = map.rekey(EntityId(0), key(5)).unwrap_err();
        assert_eq!(err.tracking_kind(), Some(TrackingErrorKind::IdentityConflict));
    }

    #[test]
    fn test_identity_map_ids_sorted_and_clear() {
        let mut map = IdentityMap::new();
        map.insert(entry(5, 1)).unwrap();
        map.insert(entry(2, 2)).unwrap();
        map.insert(entry(9, 3)).unwrap();
        assert_eq!(map.ids(), vec![EntityId(2), EntityId(5), EntityId(9)]);
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.find(&key(1)), None);
    }
}
