//! Change detection against relationship snapshots.
//!
//! Every reconciled entry carries a snapshot of its property values and
//! navigations. [`Session::diff`] compares an instance against that snapshot
//! without side effects; [`Session::detect_changes`] diffs every tracked
//! instance and hands non-empty diffs to relationship fixup, which then
//! refreshes the snapshot.
//!
//! Collection membership is compared by instance identity, never by value.

use crate::entry::{EntityKey, EntityState};
use crate::graph::{EntityId, NavigationValue};
use crate::Session;
use entrack_core::{
    Error, ForeignKeyId, JoinSide, NavigationId, NavigationRole, Result, TrackingErrorKind, Value,
    key_values_eq,
};
use std::sync::Arc;

// ============================================================================
// Diff Types
// ============================================================================

/// A property whose value differs from the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    /// Property index.
    pub property: usize,
    /// Property name.
    pub name: String,
    /// Snapshot value.
    pub old: Value,
    /// Current value.
    pub new: Value,
}

/// A foreign key whose values differ from the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyChange {
    /// The foreign key.
    pub foreign_key: ForeignKeyId,
    /// Snapshot values.
    pub old: Vec<Value>,
    /// Current values.
    pub new: Vec<Value>,
}

/// Comparison of a reference navigation with its snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceDiff {
    /// Same target as the snapshot.
    Unchanged,
    /// The target changed.
    Replaced {
        /// Snapshot target.
        old: Option<EntityId>,
        /// Current target.
        new: Option<EntityId>,
    },
}

/// One reference navigation and how it compares with the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceChange {
    /// The navigation.
    pub navigation: NavigationId,
    /// Navigation name.
    pub name: String,
    /// Comparison result.
    pub diff: ReferenceDiff,
}

/// Members added to and removed from a collection navigation.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionChange {
    /// The navigation.
    pub navigation: NavigationId,
    /// Navigation name.
    pub name: String,
    /// Members not in the snapshot.
    pub added: Vec<EntityId>,
    /// Snapshot members no longer present.
    pub removed: Vec<EntityId>,
}

/// Everything about one instance that differs from its snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Diff {
    /// The instance.
    pub entity: EntityId,
    /// Changed property values.
    pub properties: Vec<PropertyChange>,
    /// Changed foreign keys.
    pub foreign_keys: Vec<ForeignKeyChange>,
    /// Every reference navigation, changed or not.
    pub references: Vec<ReferenceChange>,
    /// Collection navigations with added or removed members.
    pub collections: Vec<CollectionChange>,
}

impl Diff {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
            && self.foreign_keys.is_empty()
            && self.collections.is_empty()
            && self
                .references
                .iter()
                .all(|r| r.diff == ReferenceDiff::Unchanged)
    }

    fn replaces(&self, navigation: NavigationId) -> bool {
        self.references
            .iter()
            .any(|r| r.navigation == navigation && r.diff != ReferenceDiff::Unchanged)
    }
}

// ============================================================================
// Detection
// ============================================================================

impl Session {
    /// Compare a tracked instance with its relationship snapshot.
    ///
    /// Read-only. An entry that was never reconciled compares its foreign
    /// keys against NULL and its navigations against empty ones.
    pub fn diff(&self, id: EntityId) -> Result<Diff> {
        let ty = self.entity_type_of(id)?;
        let entry = self.identity.get(id).ok_or_else(|| {
            Error::tracking_for(
                TrackingErrorKind::InvalidState,
                &ty.name,
                format!("{:?} is not tracked", id),
            )
        })?;
        let current = self.current_values(id, ty);
        let navigations = &self.graph.get(id)?.navigations;

        let empty: Vec<NavigationValue>;
        let (old_values, old_navigations) = match &entry.snapshot {
            Some(snapshot) => (Some(&snapshot.values), &snapshot.navigations),
            None => {
                empty = ty
                    .navigations()
                    .iter()
                    .map(|nav| {
                        if nav.is_collection() {
                            NavigationValue::Collection(Vec::new())
                        } else {
                            NavigationValue::Reference(None)
                        }
                    })
                    .collect();
                (None, &empty)
            }
        };

        let mut properties = Vec::new();
        if let Some(old_values) = old_values {
            for prop in ty.properties() {
                let (old, new) = (&old_values[prop.index], &current[prop.index]);
                if !old.key_eq(new) {
                    properties.push(PropertyChange {
                        property: prop.index,
                        name: prop.name.clone(),
                        old: old.clone(),
                        new: new.clone(),
                    });
                }
            }
        }

        let mut foreign_keys = Vec::new();
        for &fk_id in self.model.foreign_keys_from(ty.id) {
            let fk = self.model.foreign_key(fk_id);
            let new: Vec<Value> = fk.properties.iter().map(|&p| current[p].clone()).collect();
            let old: Vec<Value> = match old_values {
                Some(values) => fk.properties.iter().map(|&p| values[p].clone()).collect(),
                None => vec![Value::Null; fk.properties.len()],
            };
            if !key_values_eq(&old, &new) {
                foreign_keys.push(ForeignKeyChange {
                    foreign_key: fk_id,
                    old,
                    new,
                });
            }
        }

        let mut references = Vec::new();
        let mut collections = Vec::new();
        for nav in ty.navigations() {
            let (old, new) = (&old_navigations[nav.id.index()], &navigations[nav.id.index()]);
            match (old, new) {
                (NavigationValue::Reference(old), NavigationValue::Reference(new)) => {
                    let diff = if old == new {
                        ReferenceDiff::Unchanged
                    } else {
                        ReferenceDiff::Replaced {
                            old: *old,
                            new: *new,
                        }
                    };
                    references.push(ReferenceChange {
                        navigation: nav.id,
                        name: nav.name.clone(),
                        diff,
                    });
                }
                (NavigationValue::Collection(old), NavigationValue::Collection(new)) => {
                    let added: Vec<EntityId> =
                        new.iter().filter(|m| !old.contains(m)).copied().collect();
                    let removed: Vec<EntityId> =
                        old.iter().filter(|m| !new.contains(m)).copied().collect();
                    if !added.is_empty() || !removed.is_empty() {
                        collections.push(CollectionChange {
                            navigation: nav.id,
                            name: nav.name.clone(),
                            added,
                            removed,
                        });
                    }
                }
                _ => {}
            }
        }

        Ok(Diff {
            entity: id,
            properties,
            foreign_keys,
            references,
            collections,
        })
    }

    /// Diff every tracked instance and fix up what changed.
    ///
    /// Instances are visited in ascending id order. Join entries tracked
    /// directly are reconciled here for the first time. Dependents severed
    /// from a required principal are only deleted after the whole pass, so
    /// a dependent moved between two principals survives. A rejected key
    /// change does not stop the pass; the first one is returned at the end.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn detect_changes(&mut self) -> Result<()> {
        self.with_deferred_orphans(|session| {
            let mut changed = 0usize;
            let mut rejected = None;
            for id in session.identity.ids() {
                if !session.is_tracked(id) {
                    continue;
                }
                let diff = session.diff(id)?;
                let reconciled = session.identity.get(id).is_some_and(|e| e.is_reconciled());
                if diff.is_empty() && reconciled {
                    continue;
                }
                match session.fixup_diff(&diff) {
                    Ok(()) => {}
                    Err(e) if e.tracking_kind() == Some(TrackingErrorKind::KeyReadOnly) => {
                        rejected.get_or_insert(e);
                    }
                    Err(e) => return Err(e),
                }
                changed += 1;
            }
            tracing::debug!(changed, "Detected changes");
            rejected.map_or(Ok(()), Err)
        })
    }

    /// Whether any tracked instance has a pending write.
    ///
    /// Detects changes first unless automatic detection is disabled.
    pub fn has_changes(&mut self) -> Result<bool> {
        if self.config.auto_detect_changes {
            self.detect_changes()?;
        }
        Ok(self.identity.entries().any(|e| e.state.is_pending()))
    }

    /// Diff one instance and fix up what changed.
    pub(crate) fn reconcile_entity(&mut self, id: EntityId) -> Result<()> {
        let diff = self.diff(id)?;
        let reconciled = self.identity.get(id).is_some_and(|e| e.is_reconciled());
        if diff.is_empty() && reconciled {
            return Ok(());
        }
        self.apply_diff(&diff)
    }

    // ========================================================================
    // Fixup of a diff
    // ========================================================================

    /// Apply relationship fixup for a diff and refresh the snapshot.
    ///
    /// `diff` is expected to come from [`Session::diff`] on the instance's
    /// current state. Key changes are only accepted on `Added` entries; on
    /// any other entry the key is restored, the rest of the diff is still
    /// applied, and `KeyReadOnly` is returned.
    pub fn apply_diff(&mut self, diff: &Diff) -> Result<()> {
        self.with_deferred_orphans(|session| session.fixup_diff(diff))
    }

    #[tracing::instrument(level = "trace", skip(self, diff), fields(entity = diff.entity.index()))]
    fn fixup_diff(&mut self, diff: &Diff) -> Result<()> {
        let id = diff.entity;
        if !self.is_tracked(id) {
            return Err(Error::tracking(
                TrackingErrorKind::InvalidState,
                "diffs can only be applied to tracked instances",
            ));
        }
        let model = Arc::clone(&self.model);
        let ty = model.entity_type(self.type_of(id)?);

        let key_changes: Vec<_> = diff
            .properties
            .iter()
            .filter(|c| ty.property(c.property).is_key)
            .collect();
        let mut rejected = None;
        let restored;
        let diff = if key_changes.is_empty() {
            diff
        } else if self.state(id) == EntityState::Added {
            self.rekey_entity(id)?;
            diff
        } else {
            for change in &key_changes {
                self.write_value(id, ty.property(change.property), change.old.clone())?;
            }
            rejected = Some(crate::key_read_only(ty, ty.property(key_changes[0].property)));
            restored = self.diff(id)?;
            &restored
        };
        for change in &diff.properties {
            let prop = ty.property(change.property);
            if !prop.is_key {
                self.mark_property(id, prop);
            }
        }

        if let Some(association) = ty.join_of() {
            if !diff.foreign_keys.is_empty() {
                let m2m = model.many_to_many(association);
                let old_endpoint = |fk_id: ForeignKeyId| {
                    let change = diff.foreign_keys.iter().find(|c| c.foreign_key == fk_id);
                    match change {
                        Some(change) => self.principal_by_values(fk_id, &change.old),
                        None => self.find_principal_by_fk(id, model.foreign_key(fk_id)),
                    }
                };
                let left = old_endpoint(m2m.left_foreign_key);
                let right = old_endpoint(m2m.right_foreign_key);
                if let (Some(left), Some(right)) = (left, right) {
                    self.nav_remove(left, m2m.left_navigation, right)?;
                    if let Some(nav) = m2m.right_navigation {
                        self.nav_remove(right, nav, left)?;
                    }
                }
            }
            self.reconcile_join_entry(id)?;
            return rejected.map_or(Ok(()), Err);
        }

        for change in &diff.foreign_keys {
            let fk = model.foreign_key(change.foreign_key);
            if fk.dependent_navigation.is_some_and(|nav| diff.replaces(nav)) {
                continue;
            }
            if let (Some(old), Some(pnav)) = (
                self.principal_by_values(fk.id, &change.old),
                fk.principal_navigation,
            ) {
                self.nav_remove(old, pnav, id)?;
            }
            match self.principal_by_values(fk.id, &change.new) {
                Some(principal) => self.connect(fk.id, principal, id, false)?,
                None => {
                    if let Some(dnav) = fk.dependent_navigation {
                        if self.reference_of(id, dnav).is_some() {
                            self.nav_set_reference(id, dnav, None)?;
                        }
                    }
                    if fk.is_required && change.new.iter().any(Value::is_null) {
                        self.handle_orphan(id)?;
                    }
                }
            }
        }

        for change in &diff.references {
            let ReferenceDiff::Replaced { old, new } = change.diff else {
                continue;
            };
            match ty.navigation(change.navigation).role {
                NavigationRole::Dependent(fk_id) => match (old, new) {
                    (_, Some(principal)) => self.connect(fk_id, principal, id, false)?,
                    (Some(principal), None) => self.sever(fk_id, principal, id)?,
                    (None, None) => {}
                },
                NavigationRole::Principal(fk_id) => {
                    if let Some(previous) = old {
                        self.sever(fk_id, id, previous)?;
                    }
                    if let Some(dependent) = new {
                        self.connect(fk_id, id, dependent, false)?;
                    }
                }
                NavigationRole::ManyToMany { .. } => {}
            }
        }

        for change in &diff.collections {
            match ty.navigation(change.navigation).role {
                NavigationRole::Principal(fk_id) => {
                    for &member in &change.removed {
                        self.sever(fk_id, id, member)?;
                    }
                    for &member in &change.added {
                        self.connect(fk_id, id, member, false)?;
                    }
                }
                NavigationRole::ManyToMany { association, side } => {
                    for &member in &change.removed {
                        let (left, right) = match side {
                            JoinSide::Left => (id, member),
                            JoinSide::Right => (member, id),
                        };
                        self.unlink_many_to_many(association, left, right)?;
                    }
                    for &member in &change.added {
                        self.link_many_to_many(association, side, id, member)?;
                    }
                }
                NavigationRole::Dependent(_) => {}
            }
        }

        self.refresh_snapshot(id)?;
        rejected.map_or(Ok(()), Err)
    }

    /// The tracked principal of `fk` whose key equals `values`.
    fn principal_by_values(&self, fk: ForeignKeyId, values: &[Value]) -> Option<EntityId> {
        if values.iter().any(Value::is_null) {
            return None;
        }
        let fk = self.model.foreign_key(fk);
        self.identity
            .find(&EntityKey::new(fk.principal_type, values.to_vec()))
    }
}
