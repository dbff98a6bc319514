//! Relationship fixup for one-to-many and one-to-one associations.
//!
//! Two primitives carry every relationship change:
//!
//! - [`connect`](Session::connect) makes a dependent point at a principal:
//!   the foreign key takes the principal's key, the dependent's reference
//!   navigation points at the principal, the principal's collection (or
//!   unique reference) holds the dependent, and any previous principal lets
//!   go of it.
//! - [`sever`](Session::sever) breaks the link: navigations on both ends are
//!   cleared and the foreign key is nulled, or, when the association is
//!   required, the dependent becomes an orphan.
//!
//! Navigation writes done here are mirrored into the relationship snapshot
//! of every touched entry, so change detection only ever reports what the
//! caller changed, never what fixup changed on its behalf.

use crate::entry::{EntityKey, EntityState, Entry};
use crate::graph::EntityId;
use crate::Session;
use entrack_core::{
    Error, ForeignKey, ForeignKeyId, NavigationRole, PropertyInfo, Result, TrackingErrorKind,
    Value, key_values_eq,
};
use std::sync::Arc;

impl Session {
    /// The principal a dependent currently points at, by navigation first and
    /// foreign key second.
    pub(crate) fn current_principal(&self, dependent: EntityId, fk: &ForeignKey) -> Option<EntityId> {
        fk.dependent_navigation
            .and_then(|nav| self.reference_of(dependent, nav))
            .or_else(|| self.find_principal_by_fk(dependent, fk))
    }

    /// The tracked principal whose key equals the dependent's foreign key.
    pub(crate) fn find_principal_by_fk(&self, dependent: EntityId, fk: &ForeignKey) -> Option<EntityId> {
        let values = self.fk_values(dependent, fk);
        if values.iter().any(Value::is_null) {
            return None;
        }
        self.identity
            .find(&EntityKey::new(fk.principal_type, values))
    }

    /// Tracked dependents of a principal: those whose foreign key matches its
    /// key plus those held by its principal navigation.
    pub(crate) fn find_dependents(&self, principal: EntityId, fk: &ForeignKey) -> Vec<EntityId> {
        let key = self.key_values(principal, self.model.entity_type(fk.principal_type));
        let mut dependents: Vec<EntityId> = if key.iter().any(Value::is_null) {
            Vec::new()
        } else {
            self.identity
                .entries()
                .filter(|e| e.entity_type == fk.dependent_type)
                .map(Entry::entity)
                .filter(|&d| key_values_eq(&self.fk_values(d, fk), &key))
                .collect()
        };
        if let Some(nav) = fk.principal_navigation {
            dependents.extend(
                self.members_of(principal, nav)
                    .into_iter()
                    .filter(|&m| self.is_tracked(m)),
            );
        }
        dependents.sort_unstable();
        dependents.dedup();
        dependents
    }

    /// Make `dependent` point at `principal` through `fk`.
    ///
    /// Untracked endpoints are tracked as `Added`. A `Deleted` dependent
    /// connected to a live principal outside of initial fixup is restored to
    /// `Modified`: an explicit reassignment wins over an earlier delete.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn connect(
        &mut self,
        fk_id: ForeignKeyId,
        principal: EntityId,
        dependent: EntityId,
        initial: bool,
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let fk = model.foreign_key(fk_id);
        if fk.join_of.is_some() {
            return Ok(());
        }

        match (self.is_tracked(principal), self.is_tracked(dependent)) {
            (false, false) => return Ok(()),
            (false, true) => self.track_graph(principal, EntityState::Added)?,
            (true, false) => self.track_graph(dependent, EntityState::Added)?,
            (true, true) => {}
        }

        if let Some(pnav) = fk.principal_navigation {
            let holders: Vec<EntityId> = self
                .identity
                .entries()
                .filter(|e| e.entity_type == fk.principal_type && e.entity != principal)
                .map(Entry::entity)
                .filter(|&h| self.members_of(h, pnav).contains(&dependent))
                .collect();
            for holder in holders {
                self.nav_remove(holder, pnav, dependent)?;
            }
        }

        if fk.is_unique {
            let previous: Vec<EntityId> = self
                .find_dependents(principal, fk)
                .into_iter()
                .filter(|&d| d != dependent)
                .collect();
            for prev in previous {
                self.sever(fk_id, principal, prev)?;
            }
        }

        if !initial
            && self.state(dependent) == EntityState::Deleted
            && self.state(principal).is_live()
        {
            tracing::debug!(
                dependent = dependent.index(),
                principal = principal.index(),
                "Reassigned deleted dependent is kept"
            );
            self.change_state(dependent, EntityState::Modified);
        }

        let key = self.key_values(principal, model.entity_type(fk.principal_type));
        if !key_values_eq(&self.fk_values(dependent, fk), &key) {
            self.set_foreign_key(dependent, fk_id, &key, initial)?;
        }
        if let Some(dnav) = fk.dependent_navigation {
            if self.reference_of(dependent, dnav) != Some(principal) {
                self.nav_set_reference(dependent, dnav, Some(principal))?;
            }
        }
        if let Some(pnav) = fk.principal_navigation {
            self.nav_add(principal, pnav, dependent)?;
        }
        if let Some(entry) = self.identity.get_mut(dependent) {
            entry.orphaned = false;
        }

        Ok(())
    }

    /// Break the link between `principal` and `dependent` through `fk`.
    ///
    /// The foreign key is only touched while it still points at `principal`.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn sever(&mut self, fk_id: ForeignKeyId, principal: EntityId, dependent: EntityId) -> Result<()> {
        let model = Arc::clone(&self.model);
        let fk = model.foreign_key(fk_id);
        if let Some(pnav) = fk.principal_navigation {
            if self.is_tracked(principal) {
                self.nav_remove(principal, pnav, dependent)?;
            }
        }
        if let Some(dnav) = fk.dependent_navigation {
            if self.reference_of(dependent, dnav) == Some(principal) {
                self.nav_set_reference(dependent, dnav, None)?;
            }
        }

        let key = self.key_values(principal, model.entity_type(fk.principal_type));
        if !key_values_eq(&self.fk_values(dependent, fk), &key) {
            return Ok(());
        }
        if !self.state(dependent).is_live() {
            return Ok(());
        }
        if fk.is_required {
            self.handle_orphan(dependent)
        } else {
            let nulls = vec![Value::Null; fk.properties.len()];
            self.set_foreign_key(dependent, fk_id, &nulls, false)
        }
    }

    /// Set navigations on both ends of an existing foreign-key match without
    /// touching the foreign key.
    pub(crate) fn link_navigations(&mut self, fk_id: ForeignKeyId, principal: EntityId, dependent: EntityId) -> Result<()> {
        if self.state(dependent) == EntityState::Deleted || self.state(principal) == EntityState::Deleted {
            return Ok(());
        }
        let model = Arc::clone(&self.model);
        let fk = model.foreign_key(fk_id);
        if let Some(dnav) = fk.dependent_navigation {
            if self.reference_of(dependent, dnav).is_none() {
                self.nav_set_reference(dependent, dnav, Some(principal))?;
            }
        }
        if let Some(pnav) = fk.principal_navigation {
            self.nav_add(principal, pnav, dependent)?;
        }
        Ok(())
    }

    /// Fix up a newly tracked entry against everything already tracked.
    ///
    /// Navigations pointing at tracked instances win over foreign keys;
    /// foreign keys that match tracked principals fill empty navigations.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn initial_fixup(&mut self, id: EntityId) -> Result<()> {
        let model = Arc::clone(&self.model);
        let ty = model.entity_type(self.type_of(id)?);

        for &fk_id in model.foreign_keys_from(ty.id) {
            let fk = model.foreign_key(fk_id);
            if fk.join_of.is_some() {
                continue;
            }
            match fk.dependent_navigation.and_then(|nav| self.reference_of(id, nav)) {
                Some(principal) if self.is_tracked(principal) => {
                    self.connect(fk_id, principal, id, true)?;
                }
                Some(_) => {}
                None => {
                    if let Some(principal) = self.find_principal_by_fk(id, fk) {
                        self.link_navigations(fk_id, principal, id)?;
                    }
                }
            }
        }

        for &fk_id in model.foreign_keys_to(ty.id) {
            let fk = model.foreign_key(fk_id);
            if let Some((association, side)) = fk.join_of {
                self.link_existing_joins(association, side, id)?;
                continue;
            }
            if let Some(pnav) = fk.principal_navigation {
                for member in self.members_of(id, pnav) {
                    if self.is_tracked(member) {
                        self.connect(fk_id, id, member, true)?;
                    }
                }
            }
            for dependent in self.find_dependents(id, fk) {
                self.link_navigations(fk_id, id, dependent)?;
            }
        }

        for nav in ty.navigations() {
            if let NavigationRole::ManyToMany { association, side } = nav.role {
                for member in self.members_of(id, nav.id) {
                    if self.is_tracked(member) {
                        self.link_many_to_many(association, side, id, member)?;
                    }
                }
            }
        }

        self.refresh_snapshot(id)
    }

    /// Re-register an entry under its current key values and carry the change
    /// to dependents whose foreign keys held the old key.
    pub(crate) fn rekey_entity(&mut self, id: EntityId) -> Result<()> {
        let model = Arc::clone(&self.model);
        let ty = model.entity_type(self.type_of(id)?);
        let Some(old) = self.identity.get(id).map(|e| e.key.values().to_vec()) else {
            return Ok(());
        };
        let new = self.key_values(id, ty);
        if key_values_eq(&old, &new) {
            return Ok(());
        }
        if new.iter().any(Value::is_null) {
            return Err(Error::tracking_for(
                TrackingErrorKind::MissingKey,
                &ty.name,
                "key was set to NULL",
            ));
        }
        self.identity
            .rekey(id, EntityKey::new(ty.id, new.clone()))?;
        if let Some(entry) = self.identity.get_mut(id) {
            entry.temporary_key = false;
        }
        tracing::debug!(
            entity = id.index(),
            entity_type = %ty.name,
            "Entry rekeyed"
        );
        self.propagate_key_change(id, &old, &new)
    }

    fn propagate_key_change(&mut self, principal: EntityId, old: &[Value], new: &[Value]) -> Result<()> {
        let model = Arc::clone(&self.model);
        let ty = model.entity_type(self.type_of(principal)?);
        for &fk_id in model.foreign_keys_to(ty.id) {
            let fk = model.foreign_key(fk_id);
            let dependent_type = model.entity_type(fk.dependent_type);
            let dependents: Vec<EntityId> = self
                .identity
                .entries()
                .filter(|e| e.entity_type == fk.dependent_type)
                .map(Entry::entity)
                .filter(|&d| key_values_eq(&self.fk_values(d, fk), old))
                .collect();
            for dependent in dependents {
                for (&p, value) in fk.properties.iter().zip(new) {
                    self.write_tracked_value(dependent, dependent_type.property(p), value.clone())?;
                }
                if fk
                    .properties
                    .iter()
                    .any(|&p| dependent_type.property(p).is_key)
                {
                    self.rekey_entity(dependent)?;
                }
            }
        }
        Ok(())
    }

    /// Write a value on a tracked instance, keeping snapshot and modified
    /// flags in step.
    fn write_tracked_value(&mut self, id: EntityId, prop: &PropertyInfo, value: Value) -> Result<()> {
        self.write_value(id, prop, value.clone())?;
        if let Some(snapshot) = self.identity.get_mut(id).and_then(|e| e.snapshot.as_mut()) {
            snapshot.values[prop.index] = value;
        }
        self.mark_property(id, prop);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{blog_model, one_to_one_model, parent_child_model, parent_child_with};
    use crate::{EntityState, Session};
    use entrack_core::{DeleteBehavior, Value};

    #[test]
    fn test_attach_fills_shadow_fk_without_dirtying() {
        let mut session = Session::new(blog_model());
        let blog = session.create_entity("Blog", &[("Id", Value::BigInt(1))]).unwrap();
        let post = session.create_entity("Post", &[("Id", Value::BigInt(5))]).unwrap();
        session.entity_mut(post).unwrap().set_reference("Blog", Some(blog)).unwrap();
        session.attach(post).unwrap();

        assert_eq!(session.property(post, "BlogId").unwrap(), Value::BigInt(1));
        assert_eq!(session.state(post), EntityState::Unchanged);
        assert_eq!(session.entity(blog).unwrap().collection("Posts").unwrap(), &[post]);
    }

    #[test]
    fn test_fk_match_links_navigations_on_attach() {
        let mut session = Session::new(parent_child_model());
        let child = session
            .create_entity("Child", &[("Id", Value::BigInt(11)), ("ParentId", Value::BigInt(707))])
            .unwrap();
        session.attach(child).unwrap();
        let parent = session.create_entity("Parent", &[("Id", Value::BigInt(707))]).unwrap();
        session.attach(parent).unwrap();

        assert_eq!(session.entity(child).unwrap().reference("Parent").unwrap(), Some(parent));
        assert_eq!(session.entity(parent).unwrap().collection("Children").unwrap(), &[child]);
    }

    #[test]
    fn test_set_reference_moves_child_between_parents() {
        let mut session = Session::new(parent_child_model());
        let p1 = session.create_entity("Parent", &[("Id", Value::BigInt(1))]).unwrap();
        let p2 = session.create_entity("Parent", &[("Id", Value::BigInt(2))]).unwrap();
        let child = session
            .create_entity("Child", &[("Id", Value::BigInt(11)), ("ParentId", Value::BigInt(1))])
            .unwrap();
        session.attach(p1).unwrap();
        session.attach(p2).unwrap();
        session.attach(child).unwrap();

        session.set_reference(child, "Parent", Some(p2)).unwrap();

        assert_eq!(session.property(child, "ParentId").unwrap(), Value::BigInt(2));
        assert!(session.entity(p1).unwrap().collection("Children").unwrap().is_empty());
        assert_eq!(session.entity(p2).unwrap().collection("Children").unwrap(), &[child]);
        assert_eq!(session.state(child), EntityState::Modified);
    }

    #[test]
    fn test_connect_promotes_untracked_principal() {
        let mut session = Session::new(parent_child_model());
        let child = session
            .create_entity("Child", &[("Id", Value::BigInt(11)), ("ParentId", Value::BigInt(1))])
            .unwrap();
        session.attach(child).unwrap();
        let parent = session.create_entity("Parent", &[]).unwrap();

        session.set_reference(child, "Parent", Some(parent)).unwrap();

        assert_eq!(session.state(parent), EntityState::Added);
        let temporary = session.property(parent, "Id").unwrap();
        assert_eq!(session.property(child, "ParentId").unwrap(), temporary);
    }

    #[test]
    fn test_optional_sever_nulls_fk() {
        let mut session = Session::new(parent_child_with(DeleteBehavior::ClientSetNull));
        let parent = session.create_entity("Parent", &[("Id", Value::BigInt(1))]).unwrap();
        let child = session
            .create_entity("Child", &[("Id", Value::BigInt(11)), ("ParentId", Value::BigInt(1))])
            .unwrap();
        session.attach(parent).unwrap();
        session.attach(child).unwrap();

        session.remove_from_collection(parent, "Children", child).unwrap();

        assert_eq!(session.property(child, "ParentId").unwrap(), Value::Null);
        assert_eq!(session.entity(child).unwrap().reference("Parent").unwrap(), None);
        assert_eq!(session.state(child), EntityState::Modified);
    }

    #[test]
    fn test_required_sever_deletes_orphan() {
        let mut session = Session::new(parent_child_model());
        let parent = session.create_entity("Parent", &[("Id", Value::BigInt(1))]).unwrap();
        let child = session
            .create_entity("Child", &[("Id", Value::BigInt(11)), ("ParentId", Value::BigInt(1))])
            .unwrap();
        session.attach(parent).unwrap();
        session.attach(child).unwrap();

        session.set_reference(child, "Parent", None).unwrap();

        assert_eq!(session.state(child), EntityState::Deleted);
        assert!(session.entity(parent).unwrap().collection("Children").unwrap().is_empty());
    }

    #[test]
    fn test_one_to_one_replacement_severs_previous() {
        let mut session = Session::new(one_to_one_model());
        let person = session.create_entity("Person", &[("Id", Value::BigInt(1))]).unwrap();
        let old = session
            .create_entity("Passport", &[("Id", Value::BigInt(10)), ("PersonId", Value::BigInt(1))])
            .unwrap();
        session.attach(person).unwrap();
        session.attach(old).unwrap();
        assert_eq!(session.entity(person).unwrap().reference("Passport").unwrap(), Some(old));

        let new = session.create_entity("Passport", &[]).unwrap();
        session.set_reference(person, "Passport", Some(new)).unwrap();

        assert_eq!(session.state(new), EntityState::Added);
        assert_eq!(session.property(new, "PersonId").unwrap(), Value::BigInt(1));
        assert_eq!(session.state(old), EntityState::Deleted);
        assert_eq!(session.entity(new).unwrap().reference("Owner").unwrap(), Some(person));
    }

    #[test]
    fn test_added_principal_rekey_propagates() {
        let mut session = Session::new(parent_child_model());
        let parent = session.create_entity("Parent", &[]).unwrap();
        let child = session.create_entity("Child", &[]).unwrap();
        session.entity_mut(parent).unwrap().add_to_collection("Children", child).unwrap();
        session.add(parent).unwrap();

        session.set_property(parent, "Id", 50i64).unwrap();

        assert_eq!(session.property(child, "ParentId").unwrap(), Value::BigInt(50));
        assert!(!session.entry(parent).unwrap().has_temporary_key());
        assert_eq!(session.find("Parent", &[Value::BigInt(50)]).unwrap(), Some(parent));
    }
}
