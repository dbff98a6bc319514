//! Deletes, cascades and orphans.
//!
//! Deleting an instance unlinks it from the collections that hold it and
//! retires every join entry it takes part in. What happens to its dependents
//! depends on each foreign key's [`DeleteBehavior`]:
//!
//! | Behavior                    | Tracked dependents                        |
//! |-----------------------------|-------------------------------------------|
//! | `Cascade`                   | deleted                                   |
//! | `SetNull` / `ClientSetNull` | foreign key nulled, or orphaned if required |
//! | `Restrict` / `NoAction`     | left alone                                |
//!
//! Cascades run immediately or are deferred according to
//! [`SessionConfig::cascade_delete_timing`](crate::SessionConfig); orphans
//! follow [`SessionConfig::delete_orphans_timing`](crate::SessionConfig).

use crate::entry::{EntityState, Entry};
use crate::graph::EntityId;
use crate::{CascadeTiming, Session};
use entrack_core::{DeleteBehavior, JoinSide, NavigationRole, Result, Value, key_values_eq};
use std::sync::Arc;

impl Session {
    /// Apply every deferred cascade and orphan delete now, whatever the
    /// configured timing.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn cascade_changes(&mut self) -> Result<()> {
        self.run_pending_cascades(true)
    }

    /// Run deferred cascades until nothing is left to do.
    ///
    /// Without `force`, only work whose timing is `OnSaveChanges` runs.
    pub(crate) fn run_pending_cascades(&mut self, force: bool) -> Result<()> {
        let cascades = force || self.config.cascade_delete_timing == CascadeTiming::OnSaveChanges;
        let orphans = force || self.config.delete_orphans_timing == CascadeTiming::OnSaveChanges;
        loop {
            let mut progressed = false;
            for id in self.identity.ids() {
                let Some(entry) = self.identity.get(id) else {
                    continue;
                };
                let (state, cascaded, orphaned) = (entry.state, entry.cascaded, entry.orphaned);
                if cascades && state == EntityState::Deleted && !cascaded {
                    self.cascade_delete(id)?;
                    progressed = true;
                } else if orphans && orphaned && state.is_live() {
                    self.delete_entity(id)?;
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Mark an instance `Deleted`, or detach it if it was never saved.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) fn delete_entity(&mut self, id: EntityId) -> Result<()> {
        match self.state(id) {
            EntityState::Deleted => return Ok(()),
            EntityState::Detached => self.track_single(id, EntityState::Unchanged)?,
            _ => {}
        }
        let model = Arc::clone(&self.model);
        let ty = model.entity_type(self.type_of(id)?);

        if let Some(association) = ty.join_of() {
            let m2m = model.many_to_many(association);
            let left = self.find_principal_by_fk(id, model.foreign_key(m2m.left_foreign_key));
            let right = self.find_principal_by_fk(id, model.foreign_key(m2m.right_foreign_key));
            if let (Some(left), Some(right)) = (left, right) {
                self.nav_remove(left, m2m.left_navigation, right)?;
                if let Some(nav) = m2m.right_navigation {
                    self.nav_remove(right, nav, left)?;
                }
            }
            return self.retire_join_entry(id);
        }

        self.unlink_deleted(id)?;
        if self.state(id) == EntityState::Added {
            self.cascade_delete(id)?;
            return self.detach_entry(id);
        }
        self.change_state(id, EntityState::Deleted);
        tracing::debug!(entity = id.index(), entity_type = %ty.name, "Entity deleted");
        if self.config.cascade_delete_timing == CascadeTiming::Immediate {
            self.cascade_delete(id)?;
        }
        Ok(())
    }

    /// Take a deleted instance out of its principals' collections and retire
    /// its many-to-many edges.
    fn unlink_deleted(&mut self, id: EntityId) -> Result<()> {
        let model = Arc::clone(&self.model);
        let ty = model.entity_type(self.type_of(id)?);

        for &fk_id in model.foreign_keys_from(ty.id) {
            let fk = model.foreign_key(fk_id);
            if fk.join_of.is_some() {
                continue;
            }
            if let (Some(principal), Some(pnav)) = (self.current_principal(id, fk), fk.principal_navigation) {
                if self.is_tracked(principal) {
                    self.nav_remove(principal, pnav, id)?;
                }
            }
        }

        for nav in ty.navigations() {
            if let NavigationRole::ManyToMany { association, side } = nav.role {
                for member in self.members_of(id, nav.id) {
                    let (left, right) = match side {
                        JoinSide::Left => (id, member),
                        JoinSide::Right => (member, id),
                    };
                    self.unlink_many_to_many(association, left, right)?;
                }
            }
        }

        // Join entries nobody's collection knows about yet.
        let key = self.key_values(id, ty);
        for &fk_id in model.foreign_keys_to(ty.id) {
            let fk = model.foreign_key(fk_id);
            let Some((association, side)) = fk.join_of else {
                continue;
            };
            let m2m = model.many_to_many(association);
            let other_fk = model.foreign_key(m2m.foreign_key(side.other()));
            let joins: Vec<EntityId> = self
                .identity
                .entries()
                .filter(|e| e.entity_type == m2m.join_type && e.state.is_live())
                .map(Entry::entity)
                .filter(|&j| key_values_eq(&self.fk_values(j, fk), &key))
                .collect();
            for join in joins {
                if let (Some(other), Some(nav)) = (
                    self.find_principal_by_fk(join, other_fk),
                    m2m.navigation(side.other()),
                ) {
                    self.nav_remove(other, nav, id)?;
                }
                self.retire_join_entry(join)?;
            }
        }
        Ok(())
    }

    /// Apply delete behaviors to the tracked dependents of a deleted
    /// principal.
    pub(crate) fn cascade_delete(&mut self, principal: EntityId) -> Result<()> {
        if let Some(entry) = self.identity.get_mut(principal) {
            entry.cascaded = true;
        }
        let model = Arc::clone(&self.model);
        let ty = model.entity_type(self.type_of(principal)?);
        for &fk_id in model.foreign_keys_to(ty.id) {
            let fk = model.foreign_key(fk_id);
            if fk.join_of.is_some() {
                continue;
            }
            let dependents: Vec<EntityId> = self
                .find_dependents(principal, fk)
                .into_iter()
                .filter(|&d| d != principal && self.state(d).is_live())
                .collect();
            for dependent in dependents {
                tracing::trace!(
                    principal = principal.index(),
                    dependent = dependent.index(),
                    behavior = ?fk.delete_behavior,
                    "Cascading delete"
                );
                match fk.delete_behavior {
                    DeleteBehavior::Cascade => self.delete_entity(dependent)?,
                    DeleteBehavior::SetNull | DeleteBehavior::ClientSetNull => {
                        self.sever(fk_id, principal, dependent)?;
                    }
                    DeleteBehavior::Restrict | DeleteBehavior::NoAction => {}
                }
            }
        }
        Ok(())
    }

    /// A dependent lost its required principal.
    pub(crate) fn handle_orphan(&mut self, dependent: EntityId) -> Result<()> {
        if !self.state(dependent).is_live() {
            return Ok(());
        }
        if let Some(entry) = self.identity.get_mut(dependent) {
            entry.orphaned = true;
        }
        tracing::debug!(entity = dependent.index(), "Dependent orphaned");
        if self.config.delete_orphans_timing != CascadeTiming::Immediate {
            return Ok(());
        }
        match self.deferred_orphans.as_mut() {
            Some(pending) => pending.push(dependent),
            None => self.delete_entity(dependent)?,
        }
        Ok(())
    }

    /// Run `f` as one diff pass: orphans it finds are only deleted once it
    /// returns, and only if nothing reconnected them in the meantime.
    pub(crate) fn with_deferred_orphans(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        if self.deferred_orphans.is_some() {
            return f(self);
        }
        self.deferred_orphans = Some(Vec::new());
        let result = f(self);
        let pending = self.deferred_orphans.take().unwrap_or_default();
        for orphan in pending {
            let still_orphaned = self
                .identity
                .get(orphan)
                .is_some_and(|e| e.orphaned && e.state.is_live());
            if still_orphaned {
                self.delete_entity(orphan)?;
            } else {
                tracing::trace!(entity = orphan.index(), "Orphan reconnected in the same pass");
            }
        }
        result
    }

    /// Tracked dependents still referencing a deleted principal through a
    /// `Restrict` foreign key.
    pub(crate) fn restricted_dependents(&self, principal: EntityId) -> Vec<EntityId> {
        let Ok(ty) = self.entity_type_of(principal) else {
            return Vec::new();
        };
        let key = self.key_values(principal, ty);
        let key = &key;
        self.model
            .foreign_keys_to(ty.id)
            .iter()
            .map(|&fk_id| self.model.foreign_key(fk_id))
            .filter(|fk| fk.delete_behavior == DeleteBehavior::Restrict)
            .flat_map(|fk| {
                self.identity
                    .entries()
                    .filter(move |e| e.entity_type == fk.dependent_type && e.state.is_live())
                    .map(Entry::entity)
                    .filter(move |&d| {
                        let values = self.fk_values(d, fk);
                        !values.iter().any(Value::is_null) && key_values_eq(&values, key)
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{blog_model, parent_child_model, parent_child_with};
    use crate::{CascadeTiming, EntityId, EntityState, Session, SessionConfig};
    use entrack_core::{DeleteBehavior, Value};

    fn family(session: &mut Session) -> (EntityId, EntityId, EntityId) {
        let parent = session.create_entity("Parent", &[("Id", Value::BigInt(707))]).unwrap();
        let a = session.create_entity("Child", &[("Id", Value::BigInt(11))]).unwrap();
        let b = session.create_entity("Child", &[("Id", Value::BigInt(12))]).unwrap();
        session
            .entity_mut(parent)
            .unwrap()
            .add_to_collection("Children", a)
            .unwrap()
            .add_to_collection("Children", b)
            .unwrap();
        session.attach(parent).unwrap();
        (parent, a, b)
    }

    #[test]
    fn test_immediate_cascade_deletes_children() {
        let mut session = Session::new(parent_child_model());
        let (parent, a, b) = family(&mut session);

        session.remove(parent).unwrap();

        assert_eq!(session.state(a), EntityState::Deleted);
        assert_eq!(session.state(b), EntityState::Deleted);
        assert!(session.entity(parent).unwrap().collection("Children").unwrap().is_empty());
    }

    #[test]
    fn test_deferred_cascade_runs_on_request() {
        let config = SessionConfig::new().cascade_delete_timing(CascadeTiming::Never);
        let mut session = Session::with_config(parent_child_model(), config);
        let (parent, a, b) = family(&mut session);

        session.remove(parent).unwrap();
        assert_eq!(session.state(a), EntityState::Unchanged);

        session.cascade_changes().unwrap();
        assert_eq!(session.state(a), EntityState::Deleted);
        assert_eq!(session.state(b), EntityState::Deleted);
    }

    #[test]
    fn test_set_null_behavior_nulls_foreign_keys() {
        let mut session = Session::new(parent_child_with(DeleteBehavior::ClientSetNull));
        let (parent, a, _) = family(&mut session);

        session.remove(parent).unwrap();

        assert_eq!(session.state(a), EntityState::Modified);
        assert_eq!(session.property(a, "ParentId").unwrap(), Value::Null);
        assert_eq!(session.entity(a).unwrap().reference("Parent").unwrap(), None);
    }

    #[test]
    fn test_restrict_leaves_dependents() {
        let mut session = Session::new(parent_child_with(DeleteBehavior::Restrict));
        let (parent, a, _) = family(&mut session);

        session.remove(parent).unwrap();

        assert_eq!(session.state(a), EntityState::Unchanged);
        assert_eq!(session.restricted_dependents(parent).len(), 2);
    }

    #[test]
    fn test_deferred_orphan_is_flagged_then_deleted() {
        let config = SessionConfig::new().delete_orphans_timing(CascadeTiming::OnSaveChanges);
        let mut session = Session::with_config(parent_child_model(), config);
        let (parent, a, _) = family(&mut session);

        session.remove_from_collection(parent, "Children", a).unwrap();
        assert!(session.entry(a).unwrap().is_orphaned());
        assert_eq!(session.state(a), EntityState::Unchanged);

        session.run_pending_cascades(false).unwrap();
        assert_eq!(session.state(a), EntityState::Deleted);
    }

    #[test]
    fn test_reassigning_deleted_child_keeps_it() {
        let config = SessionConfig::new().delete_orphans_timing(CascadeTiming::Immediate);
        let mut session = Session::with_config(parent_child_model(), config);
        let (parent, a, _) = family(&mut session);
        let other = session.create_entity("Parent", &[("Id", Value::BigInt(808))]).unwrap();
        session.attach(other).unwrap();

        session.remove_from_collection(parent, "Children", a).unwrap();
        assert_eq!(session.state(a), EntityState::Deleted);

        session.add_to_collection(other, "Children", a).unwrap();
        assert_eq!(session.state(a), EntityState::Modified);
        assert_eq!(session.property(a, "ParentId").unwrap(), Value::BigInt(808));
    }

    #[test]
    fn test_deleting_added_entity_detaches_it() {
        let mut session = Session::new(parent_child_model());
        let parent = session.create_entity("Parent", &[]).unwrap();
        let child = session.create_entity("Child", &[]).unwrap();
        session.entity_mut(parent).unwrap().add_to_collection("Children", child).unwrap();
        session.add(parent).unwrap();

        session.remove(parent).unwrap();

        assert_eq!(session.state(parent), EntityState::Detached);
        assert_eq!(session.state(child), EntityState::Detached);
        assert_eq!(session.tracked_count(), 0);
    }

    #[test]
    fn test_deleting_endpoint_deletes_join_entries() {
        let mut session = Session::new(blog_model());
        let post = session.create_entity("Post", &[("Id", Value::BigInt(11))]).unwrap();
        let tag = session.create_entity("Tag", &[("Id", Value::BigInt(21))]).unwrap();
        let join = session
            .create_entity("PostTag", &[("PostId", Value::BigInt(11)), ("TagId", Value::BigInt(21))])
            .unwrap();
        for id in [post, tag, join] {
            session.attach(id).unwrap();
        }
        session.detect_changes().unwrap();

        session.remove(tag).unwrap();

        assert_eq!(session.state(join), EntityState::Deleted);
        assert!(session.entity(post).unwrap().collection("Tags").unwrap().is_empty());
        assert_eq!(session.state(post), EntityState::Unchanged);
    }
}
