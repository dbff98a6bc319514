//! Arena of entity instances.
//!
//! Instances live in a [`Graph`] owned by the session and are addressed by
//! [`EntityId`]. Navigations store ids, never owning pointers, so parent and
//! child can point at each other without reference cycles. An instance
//! exists independently of tracking: a detached instance is simply one with
//! no entry in the identity map.

use entrack_core::{EntityType, EntityTypeId, Error, PropertyStorage, Result, TrackingErrorKind, Value};
use serde::{Deserialize, Serialize};

/// Identity of one entity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub(crate) usize);

impl EntityId {
    /// Position of the instance in the arena.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Current value of one navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationValue {
    /// Reference navigation.
    Reference(Option<EntityId>),
    /// Collection navigation with set semantics by instance identity.
    Collection(Vec<EntityId>),
}

impl NavigationValue {
    /// Members as a list: zero or one for references.
    pub fn members(&self) -> Vec<EntityId> {
        match self {
            NavigationValue::Reference(r) => r.iter().copied().collect(),
            NavigationValue::Collection(c) => c.clone(),
        }
    }

    /// Whether the navigation holds `id`.
    pub fn contains(&self, id: EntityId) -> bool {
        match self {
            NavigationValue::Reference(r) => *r == Some(id),
            NavigationValue::Collection(c) => c.contains(&id),
        }
    }

    /// Whether the navigation is null or empty.
    pub fn is_empty(&self) -> bool {
        match self {
            NavigationValue::Reference(r) => r.is_none(),
            NavigationValue::Collection(c) => c.is_empty(),
        }
    }

    pub(crate) fn add(&mut self, id: EntityId) -> bool {
        match self {
            NavigationValue::Reference(r) => {
                let changed = *r != Some(id);
                *r = Some(id);
                changed
            }
            NavigationValue::Collection(c) => {
                if c.contains(&id) {
                    false
                } else {
                    c.push(id);
                    true
                }
            }
        }
    }

    pub(crate) fn remove(&mut self, id: EntityId) -> bool {
        match self {
            NavigationValue::Reference(r) => {
                if *r == Some(id) {
                    *r = None;
                    true
                } else {
                    false
                }
            }
            NavigationValue::Collection(c) => {
                let before = c.len();
                c.retain(|m| *m != id);
                c.len() != before
            }
        }
    }
}

/// One entity instance.
#[derive(Debug, Clone)]
pub struct Instance {
    pub(crate) entity_type: EntityTypeId,
    pub(crate) values: Vec<Value>,
    pub(crate) navigations: Vec<NavigationValue>,
    pub(crate) loaded: Vec<bool>,
}

impl Instance {
    pub(crate) fn new(ty: &EntityType) -> Self {
        Self {
            entity_type: ty.id,
            values: vec![Value::Null; ty.field_count()],
            navigations: ty
                .navigations()
                .iter()
                .map(|nav| {
                    if nav.is_collection() {
                        NavigationValue::Collection(Vec::new())
                    } else {
                        NavigationValue::Reference(None)
                    }
                })
                .collect(),
            loaded: vec![false; ty.navigations().len()],
        }
    }

    /// The instance's entity type.
    pub fn entity_type(&self) -> EntityTypeId {
        self.entity_type
    }
}

/// Arena of all instances created in a session.
#[derive(Debug, Default)]
pub struct Graph {
    instances: Vec<Instance>,
}

impl Graph {
    pub(crate) fn insert(&mut self, instance: Instance) -> EntityId {
        self.instances.push(instance);
        EntityId(self.instances.len() - 1)
    }

    /// Number of instances ever created.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether no instance was created.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub(crate) fn get(&self, id: EntityId) -> Result<&Instance> {
        self.instances.get(id.0).ok_or_else(|| unknown_instance(id))
    }

    pub(crate) fn get_mut(&mut self, id: EntityId) -> Result<&mut Instance> {
        self.instances.get_mut(id.0).ok_or_else(|| unknown_instance(id))
    }
}

fn unknown_instance(id: EntityId) -> Error {
    Error::tracking(
        TrackingErrorKind::UnknownEntity,
        format!("{:?} does not belong to this session", id),
    )
}

/// Read access to an instance, resolving names through its entity type.
#[derive(Debug, Clone, Copy)]
pub struct EntityRef<'a> {
    pub(crate) id: EntityId,
    pub(crate) instance: &'a Instance,
    pub(crate) entity_type: &'a EntityType,
}

impl<'a> EntityRef<'a> {
    /// The instance id.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// The instance's entity type.
    pub fn entity_type(&self) -> &'a EntityType {
        self.entity_type
    }

    /// Value of a non-shadow property.
    pub fn get(&self, property: &str) -> Result<&'a Value> {
        let info = self.entity_type.property_by_name(property)?;
        match info.storage {
            PropertyStorage::Field(slot) => Ok(&self.instance.values[slot]),
            PropertyStorage::Shadow(_) => Err(shadow_access(self.entity_type, property)),
        }
    }

    /// Current target of a reference navigation.
    pub fn reference(&self, navigation: &str) -> Result<Option<EntityId>> {
        let nav = self.entity_type.navigation_by_name(navigation)?;
        match &self.instance.navigations[nav.id.index()] {
            NavigationValue::Reference(r) => Ok(*r),
            NavigationValue::Collection(_) => Err(wrong_kind(self.entity_type, navigation)),
        }
    }

    /// Current members of a collection navigation.
    pub fn collection(&self, navigation: &str) -> Result<&'a [EntityId]> {
        let nav = self.entity_type.navigation_by_name(navigation)?;
        match &self.instance.navigations[nav.id.index()] {
            NavigationValue::Collection(c) => Ok(c),
            NavigationValue::Reference(_) => Err(wrong_kind(self.entity_type, navigation)),
        }
    }

    /// Whether the navigation is known to be fully loaded.
    pub fn is_loaded(&self, navigation: &str) -> Result<bool> {
        let nav = self.entity_type.navigation_by_name(navigation)?;
        Ok(self.instance.loaded[nav.id.index()])
    }
}

/// Raw write access to an instance.
///
/// Writes made here bypass relationship fixup; the session reconciles them
/// the next time changes are detected.
#[derive(Debug)]
pub struct EntityMut<'a> {
    pub(crate) instance: &'a mut Instance,
    pub(crate) entity_type: &'a EntityType,
}

impl EntityMut<'_> {
    /// Overwrite a non-shadow property.
    pub fn set(&mut self, property: &str, value: impl Into<Value>) -> Result<&mut Self> {
        let info = self.entity_type.property_by_name(property)?;
        match info.storage {
            PropertyStorage::Field(slot) => {
                self.instance.values[slot] = value.into();
                Ok(self)
            }
            PropertyStorage::Shadow(_) => Err(shadow_access(self.entity_type, property)),
        }
    }

    /// Point a reference navigation at `target`.
    pub fn set_reference(&mut self, navigation: &str, target: Option<EntityId>) -> Result<&mut Self> {
        let nav = self.entity_type.navigation_by_name(navigation)?;
        match &mut self.instance.navigations[nav.id.index()] {
            NavigationValue::Reference(r) => {
                *r = target;
                Ok(self)
            }
            NavigationValue::Collection(_) => Err(wrong_kind(self.entity_type, navigation)),
        }
    }

    /// Add `member` to a collection navigation; no-op when present.
    pub fn add_to_collection(&mut self, navigation: &str, member: EntityId) -> Result<&mut Self> {
        let nav = self.entity_type.navigation_by_name(navigation)?;
        match &mut self.instance.navigations[nav.id.index()] {
            value @ NavigationValue::Collection(_) => {
                value.add(member);
                Ok(self)
            }
            NavigationValue::Reference(_) => Err(wrong_kind(self.entity_type, navigation)),
        }
    }

    /// Remove `member` from a collection navigation; no-op when absent.
    pub fn remove_from_collection(&mut self, navigation: &str, member: EntityId) -> Result<&mut Self> {
        let nav = self.entity_type.navigation_by_name(navigation)?;
        match &mut self.instance.navigations[nav.id.index()] {
            value @ NavigationValue::Collection(_) => {
                value.remove(member);
                Ok(self)
            }
            NavigationValue::Reference(_) => Err(wrong_kind(self.entity_type, navigation)),
        }
    }
}

fn shadow_access(ty: &EntityType, property: &str) -> Error {
    Error::tracking_for(
        TrackingErrorKind::InvalidState,
        &ty.name,
        format!(
            "'{}' is a shadow property; read and write it through the session",
            property
        ),
    )
}

pub(crate) fn wrong_kind(ty: &EntityType, navigation: &str) -> Error {
    Error::tracking_for(
        TrackingErrorKind::InvalidState,
        &ty.name,
        format!("navigation '{}' has a different shape", navigation),
    )
}
