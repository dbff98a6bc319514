//! Change tracking and relationship fixup for entrack.
//!
//! `entrack-session` is the **tracking layer**. A [`Session`] owns an arena
//! of entity instances, tracks the ones it has been told about, and keeps
//! both ends of every association consistent as keys, references and
//! collections change.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one tracked instance per entity key.
//! - **Change detection**: diffs instances against their last reconciled
//!   snapshot and feeds the differences to relationship fixup.
//! - **Relationship fixup**: keeps foreign keys, reference navigations,
//!   collections and many-to-many join entries in agreement.
//! - **Cascades**: deletes dependents or orphans according to the model.
//! - **Loading**: explicit and lazy loads through a `QueryExecutor`.
//! - **Saving**: ordered change sets executed by a `QueryExecutor`.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: raw writes through [`EntityMut`] are only
//!   reconciled by [`Session::detect_changes`]; the session-level setters
//!   reconcile immediately.
//! - **Ids, not pointers**: navigations hold [`EntityId`]s into the arena.
//! - **Cancel-correct**: loads and saves use `Cx` + `Outcome`.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(Arc::new(model));
//!
//! let parent = session.create_entity("Parent", &[("Id", Value::BigInt(707))])?;
//! let child = session.create_entity("Child", &[("Id", Value::BigInt(11))])?;
//! session.entity_mut(parent)?.add_to_collection("Children", child)?;
//!
//! // Attach the whole graph; the child's foreign key is fixed up
//! session.attach(parent)?;
//! assert_eq!(session.property(child, "ParentId")?, Value::BigInt(707));
//!
//! // Deleting the parent cascades to the child
//! session.remove(parent)?;
//! assert_eq!(session.state(child), EntityState::Deleted);
//!
//! session.save_changes(&cx, &executor).await;
//! ```

pub mod cascade;
pub mod change_tracker;
pub mod entry;
pub mod fixup;
pub mod flush;
pub mod graph;
pub mod identity_map;
pub mod join;
pub mod lifecycle;
pub mod navigation;
pub mod unit_of_work;

#[cfg(test)]
pub(crate) mod testing;

pub use change_tracker::{
    CollectionChange, Diff, ForeignKeyChange, PropertyChange, ReferenceChange, ReferenceDiff,
};
pub use entry::{EntityKey, EntityState, Entry};
pub use flush::{FlushOrderer, FlushPlan, PendingWrite};
pub use graph::{EntityId, EntityMut, EntityRef, NavigationValue};
pub use identity_map::IdentityMap;
pub use lifecycle::TrackGraphNode;
pub use navigation::{CollectionEntry, NavigationEntry, ReferenceEntry};

use entrack_core::{
    EntityType, EntityTypeId, Error, ForeignKey, ForeignKeyId, NavigationId, PropertyInfo,
    PropertyStorage, RelationshipModel, Result, TrackingErrorKind, Value,
};
use entry::RelationshipSnapshot;
use graph::{Graph, Instance};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Tracking Events
// ============================================================================

/// Fired when an instance starts being tracked.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEvent {
    /// The instance.
    pub entity: EntityId,
    /// Its entity type name.
    pub entity_type: String,
    /// State it was tracked in.
    pub state: EntityState,
    /// Whether it was materialized by a load.
    pub from_query: bool,
}

/// Fired when a tracked instance changes state, including to `Detached`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChangedEvent {
    /// The instance.
    pub entity: EntityId,
    /// Its entity type name.
    pub entity_type: String,
    /// Previous state.
    pub old_state: EntityState,
    /// New state.
    pub new_state: EntityState,
}

type TrackedFn = Box<dyn FnMut(&TrackedEvent) + Send>;
type StateChangedFn = Box<dyn FnMut(&StateChangedEvent) + Send>;

/// Holds registered tracking event callbacks.
#[derive(Default)]
pub struct TrackingEventCallbacks {
    tracked: Vec<TrackedFn>,
    state_changed: Vec<StateChangedFn>,
}

impl std::fmt::Debug for TrackingEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingEventCallbacks")
            .field("tracked", &self.tracked.len())
            .field("state_changed", &self.state_changed.len())
            .finish()
    }
}

impl TrackingEventCallbacks {
    fn fire_tracked(&mut self, event: &TrackedEvent) {
        for cb in &mut self.tracked {
            cb(event);
        }
    }

    fn fire_state_changed(&mut self, event: &StateChangedEvent) {
        for cb in &mut self.state_changed {
            cb(event);
        }
    }
}

// ============================================================================
// Session Configuration
// ============================================================================

/// When cascade deletes and orphan deletes are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CascadeTiming {
    /// As soon as the principal is deleted or the dependent is orphaned.
    Immediate,
    /// During `save_changes` (or an explicit `cascade_changes`).
    OnSaveChanges,
    /// Only when `cascade_changes` is called.
    Never,
}

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whether `save_changes` and `has_changes` detect changes first.
    pub auto_detect_changes: bool,
    /// When dependents of a deleted principal are cascaded.
    pub cascade_delete_timing: CascadeTiming,
    /// When dependents severed from a required principal are deleted.
    pub delete_orphans_timing: CascadeTiming,
    /// Whether `lazy_reference` and `lazy_collection` may query.
    pub lazy_loading_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_detect_changes: true,
            cascade_delete_timing: CascadeTiming::Immediate,
            delete_orphans_timing: CascadeTiming::Immediate,
            lazy_loading_enabled: true,
        }
    }
}

impl SessionConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `auto_detect_changes` (builder pattern).
    #[must_use]
    pub fn auto_detect_changes(mut self, value: bool) -> Self {
        self.auto_detect_changes = value;
        self
    }

    /// Set `cascade_delete_timing` (builder pattern).
    #[must_use]
    pub fn cascade_delete_timing(mut self, timing: CascadeTiming) -> Self {
        self.cascade_delete_timing = timing;
        self
    }

    /// Set `delete_orphans_timing` (builder pattern).
    #[must_use]
    pub fn delete_orphans_timing(mut self, timing: CascadeTiming) -> Self {
        self.delete_orphans_timing = timing;
        self
    }

    /// Set `lazy_loading_enabled` (builder pattern).
    #[must_use]
    pub fn lazy_loading_enabled(mut self, value: bool) -> Self {
        self.lazy_loading_enabled = value;
        self
    }
}

// ============================================================================
// Session
// ============================================================================

/// The Session tracks entity instances and keeps their relationships fixed up.
///
/// It is single-threaded by construction: every operation takes `&mut self`
/// or `&self`, and the executor is passed into the operations that need it.
pub struct Session {
    /// The relationship model shared by all sessions.
    pub(crate) model: Arc<RelationshipModel>,
    /// Configuration.
    pub(crate) config: SessionConfig,
    /// Every instance created in this session.
    pub(crate) graph: Graph,
    /// Identity map: entries of tracked instances.
    pub(crate) identity: IdentityMap,
    /// Tracking event callbacks.
    events: TrackingEventCallbacks,
    /// Last temporary key value handed out.
    next_temporary_key: i64,
    /// Orphans found while a diff pass is running; deleted when it ends.
    pub(crate) deferred_orphans: Option<Vec<EntityId>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("instances", &self.graph.len())
            .field("tracked", &self.identity.len())
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a new session over a relationship model.
    pub fn new(model: Arc<RelationshipModel>) -> Self {
        Self::with_config(model, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(model: Arc<RelationshipModel>, config: SessionConfig) -> Self {
        Self {
            model,
            config,
            graph: Graph::default(),
            identity: IdentityMap::new(),
            events: TrackingEventCallbacks::default(),
            next_temporary_key: 0,
            deferred_orphans: None,
        }
    }

    /// The relationship model.
    pub fn model(&self) -> &RelationshipModel {
        &self.model
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Mutable access to the configuration.
    pub fn config_mut(&mut self) -> &mut SessionConfig {
        &mut self.config
    }

    // ========================================================================
    // Tracking Events
    // ========================================================================

    /// Register a callback fired whenever an instance starts being tracked.
    pub fn on_tracked(&mut self, f: impl FnMut(&TrackedEvent) + Send + 'static) {
        self.events.tracked.push(Box::new(f));
    }

    /// Register a callback fired whenever a tracked instance changes state.
    pub fn on_state_changed(&mut self, f: impl FnMut(&StateChangedEvent) + Send + 'static) {
        self.events.state_changed.push(Box::new(f));
    }

    // ========================================================================
    // Instances
    // ========================================================================

    /// Create a detached instance with the given non-shadow property values.
    ///
    /// Unspecified properties start as NULL and every navigation starts empty
    /// and not loaded.
    pub fn create_entity(&mut self, entity_type: &str, values: &[(&str, Value)]) -> Result<EntityId> {
        let model = Arc::clone(&self.model);
        let ty = model.entity_type_by_name(entity_type)?;
        let mut instance = Instance::new(ty);
        for (name, value) in values {
            let prop = ty.property_by_name(name)?;
            match prop.storage {
                PropertyStorage::Field(slot) => instance.values[slot] = value.clone(),
                PropertyStorage::Shadow(_) => return Err(detached_shadow(ty, name)),
            }
        }
        let id = self.graph.insert(instance);
        tracing::trace!(entity = id.index(), entity_type = %ty.name, "Created instance");
        Ok(id)
    }

    /// Read access to an instance.
    pub fn entity(&self, id: EntityId) -> Result<EntityRef<'_>> {
        let instance = self.graph.get(id)?;
        Ok(EntityRef {
            id,
            instance,
            entity_type: self.model.entity_type(instance.entity_type),
        })
    }

    /// Raw write access to an instance; see [`EntityMut`].
    pub fn entity_mut(&mut self, id: EntityId) -> Result<EntityMut<'_>> {
        let model = &self.model;
        let instance = self.graph.get_mut(id)?;
        let entity_type = model.entity_type(instance.entity_type);
        Ok(EntityMut {
            instance,
            entity_type,
        })
    }

    /// Current value of a property, shadow properties included.
    pub fn property(&self, id: EntityId, name: &str) -> Result<Value> {
        let ty = self.entity_type_of(id)?;
        let prop = ty.property_by_name(name)?;
        if prop.is_shadow() && !self.is_tracked(id) {
            return Err(detached_shadow(ty, name));
        }
        Ok(self.read_value(id, prop))
    }

    /// Set a property and, for tracked instances, reconcile immediately.
    pub fn set_property(&mut self, id: EntityId, name: &str, value: impl Into<Value>) -> Result<()> {
        let model = Arc::clone(&self.model);
        let ty = model.entity_type(self.type_of(id)?);
        let prop = ty.property_by_name(name)?;
        if prop.is_shadow() && !self.is_tracked(id) {
            return Err(detached_shadow(ty, name));
        }
        self.write_value(id, prop, value.into())?;
        if self.is_tracked(id) {
            self.reconcile_entity(id)?;
        }
        Ok(())
    }

    /// Point a reference navigation at `target` and fix up both ends.
    pub fn set_reference(&mut self, id: EntityId, navigation: &str, target: Option<EntityId>) -> Result<()> {
        self.entity_mut(id)?.set_reference(navigation, target)?;
        self.after_navigation_write(id, target)
    }

    /// Add `member` to a collection navigation and fix up both ends.
    pub fn add_to_collection(&mut self, id: EntityId, navigation: &str, member: EntityId) -> Result<()> {
        self.entity_mut(id)?.add_to_collection(navigation, member)?;
        self.after_navigation_write(id, Some(member))
    }

    /// Remove `member` from a collection navigation and fix up both ends.
    pub fn remove_from_collection(&mut self, id: EntityId, navigation: &str, member: EntityId) -> Result<()> {
        self.entity_mut(id)?.remove_from_collection(navigation, member)?;
        self.after_navigation_write(id, None)
    }

    fn after_navigation_write(&mut self, id: EntityId, target: Option<EntityId>) -> Result<()> {
        if self.is_tracked(id) {
            return self.reconcile_entity(id);
        }
        // An untracked owner pointed at a live tracked entity joins the session.
        match target {
            Some(t) if self.state(t).is_live() => self.track_graph(id, EntityState::Added),
            _ => Ok(()),
        }
    }

    // ========================================================================
    // Debug Info
    // ========================================================================

    /// Number of tracked instances.
    pub fn tracked_count(&self) -> usize {
        self.identity.len()
    }

    /// Get a snapshot of the tracker for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        let mut info = SessionDebugInfo {
            tracked: self.identity.len(),
            ..SessionDebugInfo::default()
        };
        for entry in self.identity.entries() {
            match entry.state {
                EntityState::Unchanged => info.unchanged += 1,
                EntityState::Added => info.added += 1,
                EntityState::Modified => info.modified += 1,
                EntityState::Deleted => info.deleted += 1,
                EntityState::Detached => {}
            }
        }
        info
    }

    // ========================================================================
    // Internal: property and navigation access
    // ========================================================================

    pub(crate) fn is_tracked(&self, id: EntityId) -> bool {
        self.identity.contains(id)
    }

    pub(crate) fn type_of(&self, id: EntityId) -> Result<EntityTypeId> {
        Ok(self.graph.get(id)?.entity_type)
    }

    pub(crate) fn entity_type_of(&self, id: EntityId) -> Result<&EntityType> {
        Ok(self.model.entity_type(self.type_of(id)?))
    }

    pub(crate) fn read_value(&self, id: EntityId, prop: &PropertyInfo) -> Value {
        match prop.storage {
            PropertyStorage::Field(slot) => self
                .graph
                .get(id)
                .map(|i| i.values[slot].clone())
                .unwrap_or(Value::Null),
            PropertyStorage::Shadow(slot) => self
                .identity
                .get(id)
                .and_then(|e| e.shadow_values.get(slot).cloned())
                .unwrap_or(Value::Null),
        }
    }

    pub(crate) fn write_value(&mut self, id: EntityId, prop: &PropertyInfo, value: Value) -> Result<()> {
        match prop.storage {
            PropertyStorage::Field(slot) => {
                self.graph.get_mut(id)?.values[slot] = value;
                Ok(())
            }
            PropertyStorage::Shadow(slot) => match self.identity.get_mut(id) {
                Some(entry) => {
                    entry.shadow_values[slot] = value;
                    Ok(())
                }
                None => Err(Error::tracking(
                    TrackingErrorKind::InvalidState,
                    format!("shadow property '{}' needs a tracked instance", prop.name),
                )),
            },
        }
    }

    pub(crate) fn current_values(&self, id: EntityId, ty: &EntityType) -> Vec<Value> {
        ty.properties()
            .iter()
            .map(|p| self.read_value(id, p))
            .collect()
    }

    pub(crate) fn key_values(&self, id: EntityId, ty: &EntityType) -> Vec<Value> {
        ty.key()
            .iter()
            .map(|&k| self.read_value(id, ty.property(k)))
            .collect()
    }

    pub(crate) fn fk_values(&self, id: EntityId, fk: &ForeignKey) -> Vec<Value> {
        let ty = self.model.entity_type(fk.dependent_type);
        fk.properties
            .iter()
            .map(|&p| self.read_value(id, ty.property(p)))
            .collect()
    }

    pub(crate) fn reference_of(&self, id: EntityId, nav: NavigationId) -> Option<EntityId> {
        match self.graph.get(id).ok()?.navigations.get(nav.index())? {
            NavigationValue::Reference(r) => *r,
            NavigationValue::Collection(_) => None,
        }
    }

    pub(crate) fn members_of(&self, id: EntityId, nav: NavigationId) -> Vec<EntityId> {
        self.graph
            .get(id)
            .ok()
            .and_then(|i| i.navigations.get(nav.index()))
            .map(NavigationValue::members)
            .unwrap_or_default()
    }

    /// Add to a navigation, mirroring the change into the snapshot so it is
    /// not reported again as a user change.
    pub(crate) fn nav_add(&mut self, id: EntityId, nav: NavigationId, member: EntityId) -> Result<bool> {
        let changed = self.graph.get_mut(id)?.navigations[nav.index()].add(member);
        if let Some(snapshot) = self.identity.get_mut(id).and_then(|e| e.snapshot.as_mut()) {
            snapshot.navigations[nav.index()].add(member);
        }
        Ok(changed)
    }

    /// Remove from a navigation, mirroring into the snapshot.
    pub(crate) fn nav_remove(&mut self, id: EntityId, nav: NavigationId, member: EntityId) -> Result<bool> {
        let changed = self.graph.get_mut(id)?.navigations[nav.index()].remove(member);
        if let Some(snapshot) = self.identity.get_mut(id).and_then(|e| e.snapshot.as_mut()) {
            snapshot.navigations[nav.index()].remove(member);
        }
        Ok(changed)
    }

    /// Overwrite a reference navigation, mirroring into the snapshot.
    pub(crate) fn nav_set_reference(&mut self, id: EntityId, nav: NavigationId, target: Option<EntityId>) -> Result<()> {
        self.graph.get_mut(id)?.navigations[nav.index()] = NavigationValue::Reference(target);
        if let Some(snapshot) = self.identity.get_mut(id).and_then(|e| e.snapshot.as_mut()) {
            snapshot.navigations[nav.index()] = NavigationValue::Reference(target);
        }
        Ok(())
    }

    /// Write foreign-key values on a dependent and update its tracking.
    ///
    /// With `initial` set, values written over NULL are accepted as original
    /// values instead of being flagged modified; this is how attaching a
    /// graph fills shadow foreign keys without dirtying the entries.
    pub(crate) fn set_foreign_key(
        &mut self,
        dependent: EntityId,
        fk: ForeignKeyId,
        values: &[Value],
        initial: bool,
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let fk = model.foreign_key(fk);
        let ty = model.entity_type(fk.dependent_type);
        for (&p, value) in fk.properties.iter().zip(values) {
            let prop = ty.property(p);
            let current = self.read_value(dependent, prop);
            if current.key_eq(value) {
                continue;
            }
            if prop.is_key && self.state(dependent) != EntityState::Added {
                return Err(key_read_only(ty, prop));
            }
            let accept = initial && current.is_null();
            self.write_value(dependent, prop, value.clone())?;
            if let Some(entry) = self.identity.get_mut(dependent) {
                if accept {
                    entry.original_values[p] = value.clone();
                }
                if let Some(snapshot) = entry.snapshot.as_mut() {
                    snapshot.values[p] = value.clone();
                }
            }
            if !accept {
                self.mark_property(dependent, prop);
            }
        }
        tracing::trace!(
            dependent = dependent.index(),
            foreign_key = fk.id.index(),
            "Foreign key set"
        );
        Ok(())
    }

    /// Recompute the modified flag of one property and promote the entry to
    /// `Modified` when needed.
    pub(crate) fn mark_property(&mut self, id: EntityId, prop: &PropertyInfo) {
        let current = self.read_value(id, prop);
        let Some(entry) = self.identity.get_mut(id) else {
            return;
        };
        if !matches!(entry.state, EntityState::Unchanged | EntityState::Modified) {
            return;
        }
        let modified = !entry.original_values[prop.index].key_eq(&current);
        entry.modified[prop.index] = modified;
        if modified && entry.state == EntityState::Unchanged {
            self.change_state(id, EntityState::Modified);
        }
    }

    /// Replace the relationship snapshot with the instance's current values.
    pub(crate) fn refresh_snapshot(&mut self, id: EntityId) -> Result<()> {
        if !self.is_tracked(id) {
            return Ok(());
        }
        let model = Arc::clone(&self.model);
        let ty = model.entity_type(self.type_of(id)?);
        let values = self.current_values(id, ty);
        let navigations = self.graph.get(id)?.navigations.clone();
        if let Some(entry) = self.identity.get_mut(id) {
            entry.snapshot = Some(RelationshipSnapshot {
                values,
                navigations,
            });
        }
        Ok(())
    }

    pub(crate) fn next_temporary_value(&mut self) -> Value {
        self.next_temporary_key -= 1;
        Value::BigInt(self.next_temporary_key)
    }

    /// Move a tracked entry to a new state and fire the state-changed event.
    pub(crate) fn change_state(&mut self, id: EntityId, new: EntityState) {
        let Some(entry) = self.identity.get_mut(id) else {
            return;
        };
        let old = entry.state;
        if old == new {
            return;
        }
        entry.state = new;
        if new == EntityState::Deleted {
            entry.cascaded = false;
        }
        let entity_type = self.model.entity_type(entry.entity_type).name.clone();
        tracing::trace!(
            entity = id.index(),
            entity_type = %entity_type,
            old = ?old,
            new = ?new,
            "Entity state changed"
        );
        self.events.fire_state_changed(&StateChangedEvent {
            entity: id,
            entity_type,
            old_state: old,
            new_state: new,
        });
    }

    pub(crate) fn fire_tracked(&mut self, id: EntityId, state: EntityState, from_query: bool) {
        let Ok(ty) = self.entity_type_of(id) else {
            return;
        };
        let entity_type = ty.name.clone();
        tracing::trace!(
            entity = id.index(),
            entity_type = %entity_type,
            state = ?state,
            from_query,
            "Entity tracked"
        );
        self.events.fire_tracked(&TrackedEvent {
            entity: id,
            entity_type,
            state,
            from_query,
        });
    }

    pub(crate) fn fire_detached(&mut self, id: EntityId, entity_type: EntityTypeId, old: EntityState) {
        let entity_type = self.model.entity_type(entity_type).name.clone();
        tracing::trace!(
            entity = id.index(),
            entity_type = %entity_type,
            old = ?old,
            "Entity detached"
        );
        self.events.fire_state_changed(&StateChangedEvent {
            entity: id,
            entity_type,
            old_state: old,
            new_state: EntityState::Detached,
        });
    }
}

fn detached_shadow(ty: &EntityType, property: &str) -> Error {
    Error::tracking_for(
        TrackingErrorKind::InvalidState,
        &ty.name,
        format!("shadow property '{}' only exists on tracked instances", property),
    )
}

pub(crate) fn key_read_only(ty: &EntityType, prop: &PropertyInfo) -> Error {
    Error::tracking_for(
        TrackingErrorKind::KeyReadOnly,
        &ty.name,
        format!("key property '{}' cannot change once persisted", prop.name),
    )
}

/// Debug information about tracking state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDebugInfo {
    /// Total tracked instances.
    pub tracked: usize,
    /// Instances pending INSERT.
    pub added: usize,
    /// Instances pending UPDATE.
    pub modified: usize,
    /// Instances pending DELETE.
    pub deleted: usize,
    /// Instances with no pending write.
    pub unchanged: usize,
}

// ============================================================================
// Unit Tests
// ============================================================================
