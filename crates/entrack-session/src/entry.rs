//! Tracking entries.
//!
//! Every tracked instance has exactly one [`Entry`]: its lifecycle state,
//! its key as last registered with the identity map, the original values
//! used to decide which properties are modified, storage for shadow
//! properties, and the relationship snapshot the change detector diffs
//! against.

use crate::graph::{EntityId, NavigationValue};
use entrack_core::{EntityTypeId, Value, key_values_eq};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Lifecycle state of an entity with respect to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    /// Not tracked.
    Detached,
    /// Tracked, matches the store.
    Unchanged,
    /// Tracked, will be inserted.
    Added,
    /// Tracked, has pending property or relationship changes.
    Modified,
    /// Tracked, will be deleted.
    Deleted,
}

impl EntityState {
    /// Whether the state produces a write on save.
    pub const fn is_pending(self) -> bool {
        matches!(
            self,
            EntityState::Added | EntityState::Modified | EntityState::Deleted
        )
    }

    /// Whether the entity is tracked and not scheduled for deletion.
    pub const fn is_live(self) -> bool {
        matches!(
            self,
            EntityState::Unchanged | EntityState::Added | EntityState::Modified
        )
    }
}

/// Identity-map key: entity type plus key values.
///
/// Integer widths are normalized, so `Int(7)` and `BigInt(7)` name the same
/// entity.
#[derive(Debug, Clone)]
pub struct EntityKey {
    entity_type: EntityTypeId,
    values: Vec<Value>,
}

impl EntityKey {
    /// Key of `entity_type` with the given key values.
    pub fn new(entity_type: EntityTypeId, values: Vec<Value>) -> Self {
        Self {
            entity_type,
            values,
        }
    }

    /// Entity type.
    pub fn entity_type(&self) -> EntityTypeId {
        self.entity_type
    }

    /// Key values in key-property order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Whether any key value is NULL.
    pub fn has_null(&self) -> bool {
        self.values.iter().any(Value::is_null)
    }

    /// Stable hash of the key values, used in log fields.
    pub fn key_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for v in &self.values {
            v.hash_key(&mut hasher);
        }
        hasher.finish()
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity_type == other.entity_type && key_values_eq(&self.values, &other.values)
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity_type.hash(state);
        for v in &self.values {
            v.hash_key(state);
        }
    }
}

/// Last reconciled property values and navigations of an entry.
#[derive(Debug, Clone)]
pub(crate) struct RelationshipSnapshot {
    /// All property values by property index.
    pub(crate) values: Vec<Value>,
    /// All navigation values by navigation index.
    pub(crate) navigations: Vec<NavigationValue>,
}

/// Tracking record of one instance.
#[derive(Debug, Clone)]
pub struct Entry {
    pub(crate) entity: EntityId,
    pub(crate) entity_type: EntityTypeId,
    pub(crate) state: EntityState,
    pub(crate) key: EntityKey,
    pub(crate) temporary_key: bool,
    pub(crate) shadow_values: Vec<Value>,
    pub(crate) original_values: Vec<Value>,
    pub(crate) modified: Vec<bool>,
    pub(crate) snapshot: Option<RelationshipSnapshot>,
    pub(crate) orphaned: bool,
    pub(crate) cascaded: bool,
}

impl Entry {
    pub(crate) fn new(
        entity: EntityId,
        entity_type: EntityTypeId,
        state: EntityState,
        key: EntityKey,
        shadow_values: Vec<Value>,
        property_count: usize,
    ) -> Self {
        Self {
            entity,
            entity_type,
            state,
            key,
            temporary_key: false,
            shadow_values,
            original_values: vec![Value::Null; property_count],
            modified: vec![false; property_count],
            snapshot: None,
            orphaned: false,
            cascaded: false,
        }
    }

    /// The tracked instance.
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// The instance's entity type.
    pub fn entity_type(&self) -> EntityTypeId {
        self.entity_type
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Key under which the entry is registered.
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Whether the key holds a temporary value awaiting a store-generated one.
    pub fn has_temporary_key(&self) -> bool {
        self.temporary_key
    }

    /// Value a property had when the entry was last accepted.
    pub fn original_value(&self, property: usize) -> Option<&Value> {
        self.original_values.get(property)
    }

    /// Whether a property is flagged modified.
    pub fn is_property_modified(&self, property: usize) -> bool {
        self.modified.get(property).copied().unwrap_or(false)
    }

    /// Indexes of modified properties.
    pub fn modified_properties(&self) -> Vec<usize> {
        self.modified
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.then_some(i))
            .collect()
    }

    /// Whether the entry lost its required principal and awaits deletion.
    pub fn is_orphaned(&self) -> bool {
        self.orphaned
    }

    /// Whether relationship fixup has reconciled the entry at least once.
    pub fn is_reconciled(&self) -> bool {
        self.snapshot.is_some()
    }

    pub(crate) fn clear_modified(&mut self) {
        self.modified.iter_mut().for_each(|m| *m = false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_entity_key_normalizes_integer_widths() {
        let a = EntityKey::new(EntityTypeId(0), vec![Value::Int(7)]);
        let b = EntityKey::new(EntityTypeId(0), vec![Value::BigInt(7)]);
        assert_eq!(a, b);
        assert_eq!(a.key_hash(), b.key_hash());

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_entity_key_distinguishes_types() {
        let a = EntityKey::new(EntityTypeId(0), vec![Value::BigInt(1)]);
        let b = EntityKey::new(EntityTypeId(1), vec![Value::BigInt(1)]);
        assert_ne!(a, b);
        assert!(!a.has_null());
        assert!(EntityKey::new(EntityTypeId(0), vec![Value::Null]).has_null());
    }

    #[test]
    fn test_state_predicates() {
        assert!(EntityState::Added.is_pending());
        assert!(!EntityState::Unchanged.is_pending());
        assert!(EntityState::Modified.is_live());
        assert!(!EntityState::Deleted.is_live());
        assert!(!EntityState::Detached.is_live());
    }

    #[test]
    fn test_entry_modified_flags() {
        let key = EntityKey::new(EntityTypeId(0), vec![Value::BigInt(1)]);
        let mut entry = Entry::new(EntityId(0), EntityTypeId(0), EntityState::Unchanged, key, Vec::new(), 3);
        entry.modified[2] = true;
        assert_eq!(entry.modified_properties(), vec![2]);
        assert!(entry.is_property_modified(2));
        entry.clear_modified();
        assert!(entry.modified_properties().is_empty());
        assert!(!entry.is_reconciled());
    }
}
