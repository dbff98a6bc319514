//! Entry lifecycle: tracking, state transitions and detaching.
//!
//! Entry creation validates keys before anything is registered:
//!
//! - a NULL store-generated key is replaced by a temporary value and the
//!   entry becomes `Added`, whatever state was requested;
//! - any other NULL key value is a `MissingKey` error;
//! - a key already owned by a different instance is an `IdentityConflict`.
//!
//! Tracking a graph registers every reachable untracked instance first and
//! only then runs relationship fixup, so fixup always sees the whole graph.
//! Join entities tracked directly are the exception: their fixup is deferred
//! to the next change detection, which lets a join row be added before
//! either endpoint is known to the session.
//!
//! [`Session::track_graph_with`] walks the same graph but lets a callback
//! pick the state of each instance, or leave an instance and everything
//! only reachable through it untracked.

use crate::entry::{EntityKey, EntityState, Entry};
use crate::graph::EntityId;
use crate::Session;
use entrack_core::{EntityType, Error, NavigationInfo, Result, TrackingErrorKind, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// An untracked instance reached by [`Session::track_graph_with`].
#[derive(Debug, Clone, Copy)]
pub struct TrackGraphNode<'a> {
    entity: EntityId,
    entity_type: &'a EntityType,
    inbound: Option<(EntityId, &'a NavigationInfo)>,
    key_set: bool,
}

impl<'a> TrackGraphNode<'a> {
    /// The instance.
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// Its entity type.
    pub fn entity_type(&self) -> &'a EntityType {
        self.entity_type
    }

    /// The instance this one was reached from; `None` for the root.
    pub fn source(&self) -> Option<EntityId> {
        self.inbound.map(|(source, _)| source)
    }

    /// The navigation on [`source`](Self::source) that led here.
    pub fn inbound_navigation(&self) -> Option<&'a NavigationInfo> {
        self.inbound.map(|(_, nav)| nav)
    }

    /// Whether every key property has a value.
    pub fn is_key_set(&self) -> bool {
        self.key_set
    }
}

/// An entry validated but not yet registered.
struct PreparedEntry {
    entry: Entry,
    /// Key property and temporary value to write on registration.
    temporary: Option<(usize, Value)>,
}

impl Session {
    // ========================================================================
    // Tracking
    // ========================================================================

    /// Track `root` and every reachable untracked instance as `Unchanged`.
    ///
    /// Instances with an unset store-generated key are tracked as `Added`.
    pub fn attach(&mut self, root: EntityId) -> Result<()> {
        self.track_graph(root, EntityState::Unchanged)
    }

    /// Track `root` and every reachable untracked instance as `Added`.
    pub fn add(&mut self, root: EntityId) -> Result<()> {
        self.track_graph(root, EntityState::Added)
    }

    /// Track `root` and every reachable untracked instance as `Modified`.
    ///
    /// Instances with an unset store-generated key are tracked as `Added`.
    pub fn update(&mut self, root: EntityId) -> Result<()> {
        self.track_graph(root, EntityState::Modified)
    }

    /// Mark an instance for deletion; `Added` instances are detached instead.
    ///
    /// Dependents follow the model's delete behavior, now or at save time
    /// depending on [`SessionConfig::cascade_delete_timing`](crate::SessionConfig).
    pub fn remove(&mut self, id: EntityId) -> Result<()> {
        self.delete_entity(id)
    }

    /// Current state; `Detached` for untracked instances.
    pub fn state(&self, id: EntityId) -> EntityState {
        self.identity
            .get(id)
            .map_or(EntityState::Detached, Entry::state)
    }

    /// The tracking entry of an instance, if tracked.
    pub fn entry(&self, id: EntityId) -> Option<&Entry> {
        self.identity.get(id)
    }

    /// All tracking entries in ascending instance order.
    pub fn entries(&self) -> Vec<&Entry> {
        self.identity
            .ids()
            .into_iter()
            .filter_map(|id| self.identity.get(id))
            .collect()
    }

    /// The tracked instance with the given key.
    pub fn find(&self, entity_type: &str, key: &[Value]) -> Result<Option<EntityId>> {
        let ty = self.model.entity_type_by_name(entity_type)?;
        Ok(self
            .identity
            .find(&EntityKey::new(ty.id, key.to_vec())))
    }

    /// The entry of an instance, creating one in `state` if it is untracked.
    ///
    /// Only the instance itself is tracked; reachable instances are not.
    pub fn get_or_create_entry(&mut self, id: EntityId, state: EntityState) -> Result<&Entry> {
        if !self.is_tracked(id) {
            if state == EntityState::Detached {
                return Err(Error::tracking(
                    TrackingErrorKind::InvalidState,
                    "cannot create an entry in the Detached state",
                ));
            }
            self.track_single(id, state)?;
        }
        self.identity.get(id).ok_or_else(|| {
            Error::tracking(
                TrackingErrorKind::InvalidState,
                format!("{:?} is not tracked", id),
            )
        })
    }

    /// Move an instance to `state`, applying the side effects of the move.
    ///
    /// - `Detached`: the entry is removed and tracked neighbors forget the
    ///   instance.
    /// - `Deleted`: as [`remove`](Self::remove).
    /// - Tracking states on an untracked instance track only that instance.
    /// - `Unchanged` accepts current values as original values.
    /// - `Modified` flags every non-key property.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn set_state(&mut self, id: EntityId, state: EntityState) -> Result<()> {
        let current = self.state(id);
        if current == state {
            return Ok(());
        }
        match state {
            EntityState::Detached => self.detach_entry(id),
            EntityState::Deleted => self.delete_entity(id),
            _ if current == EntityState::Detached => self.track_single(id, state),
            EntityState::Added => {
                self.change_state(id, EntityState::Added);
                Ok(())
            }
            EntityState::Unchanged | EntityState::Modified => {
                let model = Arc::clone(&self.model);
                let ty = model.entity_type(self.type_of(id)?);
                if self.identity.get(id).is_some_and(Entry::has_temporary_key) {
                    return Err(Error::tracking_for(
                        TrackingErrorKind::InvalidState,
                        &ty.name,
                        format!("{:?} has a temporary key and can only be Added", id),
                    ));
                }
                let values = self.current_values(id, ty);
                if let Some(entry) = self.identity.get_mut(id) {
                    entry.orphaned = false;
                    if state == EntityState::Unchanged {
                        entry.original_values = values;
                        entry.clear_modified();
                    } else {
                        for prop in ty.properties() {
                            entry.modified[prop.index] = !prop.is_key;
                        }
                    }
                }
                self.change_state(id, state);
                Ok(())
            }
        }
    }

    /// Stop tracking every instance. No fixup is performed.
    pub fn clear(&mut self) {
        let ids = self.identity.ids();
        let removed: Vec<Entry> = ids
            .into_iter()
            .filter_map(|id| self.identity.remove(id))
            .collect();
        tracing::debug!(count = removed.len(), "Cleared session");
        for entry in removed {
            self.fire_detached(entry.entity, entry.entity_type, entry.state);
        }
    }

    /// Walk the untracked instances reachable from `root` and track each in
    /// the state `choose` returns for it.
    ///
    /// Every untracked instance is offered to `choose` at most once, parents
    /// before what they reach. Returning `None` (or `Detached`) leaves the
    /// instance untracked and stops the walk there. Tracked instances are
    /// neither offered nor walked through. Returns how many instances were
    /// tracked.
    #[tracing::instrument(level = "debug", skip(self, choose))]
    pub fn track_graph_with<F>(&mut self, root: EntityId, mut choose: F) -> Result<usize>
    where
        F: FnMut(&TrackGraphNode<'_>) -> Option<EntityState>,
    {
        let model = Arc::clone(&self.model);
        let mut chosen = Vec::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<(EntityId, Option<(EntityId, &NavigationInfo)>)> = vec![(root, None)];
        while let Some((id, inbound)) = stack.pop() {
            if self.is_tracked(id) || !seen.insert(id) {
                continue;
            }
            let ty = model.entity_type(self.type_of(id)?);
            let node = TrackGraphNode {
                entity: id,
                entity_type: ty,
                inbound,
                key_set: !self.key_values(id, ty).iter().any(Value::is_null),
            };
            let state = match choose(&node) {
                Some(EntityState::Detached) | None => {
                    tracing::trace!(entity = id.index(), "Graph node skipped");
                    continue;
                }
                Some(state) => state,
            };
            chosen.push((id, state));
            let instance = self.graph.get(id)?;
            for (nav, value) in ty.navigations().iter().zip(&instance.navigations) {
                for member in value.members().into_iter().rev() {
                    if !self.is_tracked(member) && !seen.contains(&member) {
                        stack.push((member, Some((id, nav))));
                    }
                }
            }
        }

        self.track_nodes(&chosen)?;
        tracing::debug!(
            root = root.index(),
            count = chosen.len(),
            "Tracked entity graph with per-node states"
        );
        Ok(chosen.len())
    }

    // ========================================================================
    // Internal
    // ========================================================================

    /// Track every untracked instance reachable from `root`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) fn track_graph(&mut self, root: EntityId, state: EntityState) -> Result<()> {
        if self.is_tracked(root) {
            return self.set_state(root, state);
        }

        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if self.is_tracked(id) || !seen.insert(id) {
                continue;
            }
            order.push((id, state));
            for navigation in &self.graph.get(id)?.navigations {
                for member in navigation.members().into_iter().rev() {
                    if !self.is_tracked(member) && !seen.contains(&member) {
                        stack.push(member);
                    }
                }
            }
        }

        self.track_nodes(&order)?;
        tracing::debug!(
            root = root.index(),
            count = order.len(),
            state = ?state,
            "Tracked entity graph"
        );
        Ok(())
    }

    /// Register every node, then run fixup for each of them.
    ///
    /// Nothing is registered when any node fails key validation.
    fn track_nodes(&mut self, nodes: &[(EntityId, EntityState)]) -> Result<()> {
        let mut prepared = Vec::with_capacity(nodes.len());
        let mut keys = HashSet::with_capacity(nodes.len());
        for &(id, state) in nodes {
            let entry = self.prepare_entry(id, state)?;
            if !keys.insert(entry.entry.key.clone()) {
                return Err(Error::tracking(
                    TrackingErrorKind::IdentityConflict,
                    format!(
                        "two instances in the graph share key {:?}",
                        entry.entry.key.values()
                    ),
                ));
            }
            if let Some(existing) = self.identity.find(&entry.entry.key) {
                return Err(Error::tracking(
                    TrackingErrorKind::IdentityConflict,
                    format!(
                        "another instance ({:?}) is already tracked with key {:?}",
                        existing,
                        entry.entry.key.values()
                    ),
                ));
            }
            prepared.push(entry);
        }

        for entry in prepared {
            self.register(entry, false)?;
        }
        for &(id, _) in nodes {
            self.fixup_new_entry(id, false)?;
        }
        Ok(())
    }

    /// Track one instance without walking its navigations.
    pub(crate) fn track_single(&mut self, id: EntityId, state: EntityState) -> Result<()> {
        let prepared = self.prepare_entry(id, state)?;
        self.register(prepared, false)?;
        self.fixup_new_entry(id, false)
    }

    /// Track an instance materialized by a load as `Unchanged`.
    pub(crate) fn track_materialized(&mut self, id: EntityId, shadow: Vec<Value>) -> Result<()> {
        let mut prepared = self.prepare_entry(id, EntityState::Unchanged)?;
        prepared.entry.shadow_values = shadow;
        self.register(prepared, true)?;
        self.fixup_new_entry(id, true)
    }

    fn prepare_entry(&mut self, id: EntityId, requested: EntityState) -> Result<PreparedEntry> {
        let model = Arc::clone(&self.model);
        let ty = model.entity_type(self.type_of(id)?);
        let mut key = self.key_values(id, ty);
        let mut state = requested;
        let mut temporary = None;
        if key.iter().any(Value::is_null) {
            if !ty.has_generated_key() || requested == EntityState::Deleted {
                return Err(missing_key(ty));
            }
            let value = self.next_temporary_value();
            key = vec![value.clone()];
            temporary = Some((ty.key()[0], value));
            state = EntityState::Added;
        }
        let mut entry = Entry::new(
            id,
            ty.id,
            state,
            EntityKey::new(ty.id, key),
            vec![Value::Null; ty.shadow_count()],
            ty.properties().len(),
        );
        entry.temporary_key = temporary.is_some();
        Ok(PreparedEntry { entry, temporary })
    }

    fn register(&mut self, prepared: PreparedEntry, from_query: bool) -> Result<()> {
        let model = Arc::clone(&self.model);
        let PreparedEntry { entry, temporary } = prepared;
        let (id, state) = (entry.entity, entry.state);
        let ty = model.entity_type(entry.entity_type);
        self.identity.insert(entry)?;
        if let Some((property, value)) = temporary {
            self.write_value(id, ty.property(property), value)?;
        }
        let values = self.current_values(id, ty);
        if let Some(entry) = self.identity.get_mut(id) {
            entry.original_values = values;
            if state == EntityState::Modified {
                for prop in ty.properties() {
                    entry.modified[prop.index] = !prop.is_key;
                }
            }
        }
        self.fire_tracked(id, state, from_query);
        Ok(())
    }

    /// Run initial fixup for a freshly registered entry.
    fn fixup_new_entry(&mut self, id: EntityId, from_query: bool) -> Result<()> {
        if !self.is_tracked(id) {
            return Ok(());
        }
        let is_join = self.entity_type_of(id)?.join_of().is_some();
        if is_join {
            // Directly tracked join rows wait for change detection.
            return if from_query {
                self.reconcile_join_entry(id)
            } else {
                Ok(())
            };
        }
        self.initial_fixup(id)
    }

    /// Remove an entry and make tracked neighbors forget the instance.
    ///
    /// Foreign-key values are left as they are.
    pub(crate) fn detach_entry(&mut self, id: EntityId) -> Result<()> {
        if !self.is_tracked(id) {
            return Ok(());
        }
        let model = Arc::clone(&self.model);
        let ty = model.entity_type(self.type_of(id)?);

        let mut unlinks = Vec::new();
        for nav in ty.navigations() {
            if let Some(inverse) = nav.inverse {
                for member in self.members_of(id, nav.id) {
                    unlinks.push((member, inverse));
                }
            }
        }
        for &fk_id in model.foreign_keys_from(ty.id) {
            let fk = model.foreign_key(fk_id);
            if let (Some(principal), Some(pnav)) = (self.current_principal(id, fk), fk.principal_navigation) {
                unlinks.push((principal, pnav));
            }
        }
        for &fk_id in model.foreign_keys_to(ty.id) {
            let fk = model.foreign_key(fk_id);
            if let Some(dnav) = fk.dependent_navigation {
                for dependent in self.find_dependents(id, fk) {
                    unlinks.push((dependent, dnav));
                }
            }
        }

        let Some(entry) = self.identity.remove(id) else {
            return Ok(());
        };
        for (neighbor, nav) in unlinks {
            if neighbor != id && self.is_tracked(neighbor) {
                self.nav_remove(neighbor, nav, id)?;
            }
        }
        self.fire_detached(id, entry.entity_type, entry.state);
        Ok(())
    }
}

fn missing_key(ty: &EntityType) -> Error {
    Error::tracking_for(
        TrackingErrorKind::MissingKey,
        &ty.name,
        "key has no value and is not store-generated",
    )
}
