//! Many-to-many fixup through join entries.
//!
//! Every edge of a many-to-many association is one join entry whose foreign
//! keys hold the keys of both endpoints. Collection changes create, restore
//! or retire join entries; join entries tracked on their own are reconciled
//! into the collections of both endpoints.
//!
//! A join entry tracked without touching either collection is left dangling
//! until the next change detection, which is when the collections catch up.

use crate::entry::{EntityKey, EntityState, Entry};
use crate::graph::{EntityId, Instance};
use crate::Session;
use entrack_core::{
    Error, JoinSide, ManyToMany, ManyToManyId, PropertyStorage, Result, TrackingErrorKind, Value,
    key_values_eq,
};
use std::sync::Arc;

impl Session {
    /// Join-type property values for the edge `(left, right)`.
    fn join_values(&self, m2m: &ManyToMany, left: EntityId, right: EntityId) -> Vec<Value> {
        let join_type = self.model.entity_type(m2m.join_type);
        let mut values = vec![Value::Null; join_type.properties().len()];
        for (side, endpoint) in [(JoinSide::Left, left), (JoinSide::Right, right)] {
            let fk = self.model.foreign_key(m2m.foreign_key(side));
            let key = self.key_values(endpoint, self.model.entity_type(fk.principal_type));
            for (&p, value) in fk.properties.iter().zip(key) {
                values[p] = value;
            }
        }
        values
    }

    /// The tracked join entry for the edge `(left, right)`.
    pub(crate) fn find_join_entry(&self, association: ManyToManyId, left: EntityId, right: EntityId) -> Option<EntityId> {
        let m2m = self.model.many_to_many(association);
        let join_type = self.model.entity_type(m2m.join_type);
        let values = self.join_values(m2m, left, right);
        let left_fk = self.model.foreign_key(m2m.left_foreign_key);
        let right_fk = self.model.foreign_key(m2m.right_foreign_key);

        let keyed_by_fks = join_type
            .key()
            .iter()
            .all(|k| left_fk.properties.contains(k) || right_fk.properties.contains(k));
        if keyed_by_fks {
            let key: Vec<Value> = join_type.key().iter().map(|&k| values[k].clone()).collect();
            if key.iter().any(Value::is_null) {
                return None;
            }
            return self.identity.find(&EntityKey::new(join_type.id, key));
        }

        let pick = |props: &[usize]| -> Vec<Value> { props.iter().map(|&p| values[p].clone()).collect() };
        let (left_key, right_key) = (pick(&left_fk.properties), pick(&right_fk.properties));
        self.identity
            .entries()
            .filter(|e| e.entity_type == join_type.id)
            .map(Entry::entity)
            .filter(|&j| {
                key_values_eq(&self.fk_values(j, left_fk), &left_key)
                    && key_values_eq(&self.fk_values(j, right_fk), &right_key)
            })
            .min()
    }

    /// Link `owner` and `member` through the association, `owner` being on
    /// `side`.
    ///
    /// Both collections gain the other endpoint. A deleted join entry for the
    /// edge is restored to `Unchanged`; a missing one is created as `Added`.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn link_many_to_many(
        &mut self,
        association: ManyToManyId,
        side: JoinSide,
        owner: EntityId,
        member: EntityId,
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let m2m = model.many_to_many(association);
        let (left, right) = match side {
            JoinSide::Left => (owner, member),
            JoinSide::Right => (member, owner),
        };

        match (self.is_tracked(left), self.is_tracked(right)) {
            (false, false) => return Ok(()),
            (false, true) => self.track_graph(left, EntityState::Added)?,
            (true, false) => self.track_graph(right, EntityState::Added)?,
            (true, true) => {}
        }
        if self.state(left) == EntityState::Deleted || self.state(right) == EntityState::Deleted {
            return Ok(());
        }

        self.nav_add(left, m2m.left_navigation, right)?;
        if let Some(nav) = m2m.right_navigation {
            self.nav_add(right, nav, left)?;
        }

        match self.find_join_entry(association, left, right) {
            Some(join) => {
                if self.state(join) == EntityState::Deleted {
                    tracing::debug!(join = join.index(), "Restored deleted join entry");
                    self.change_state(join, EntityState::Unchanged);
                }
            }
            None => {
                self.create_join_entry(association, left, right, EntityState::Added, false)?;
            }
        }
        Ok(())
    }

    /// Remove the edge `(left, right)` from both collections and retire its
    /// join entry.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn unlink_many_to_many(&mut self, association: ManyToManyId, left: EntityId, right: EntityId) -> Result<()> {
        let model = Arc::clone(&self.model);
        let m2m = model.many_to_many(association);
        if self.is_tracked(left) {
            self.nav_remove(left, m2m.left_navigation, right)?;
        }
        if let Some(nav) = m2m.right_navigation {
            if self.is_tracked(right) {
                self.nav_remove(right, nav, left)?;
            }
        }
        if let Some(join) = self.find_join_entry(association, left, right) {
            self.retire_join_entry(join)?;
        }
        Ok(())
    }

    /// `Added` join entries are detached, persisted ones become `Deleted`.
    pub(crate) fn retire_join_entry(&mut self, join: EntityId) -> Result<()> {
        match self.state(join) {
            EntityState::Added => self.detach_entry(join),
            EntityState::Unchanged | EntityState::Modified => {
                self.change_state(join, EntityState::Deleted);
                Ok(())
            }
            EntityState::Deleted | EntityState::Detached => Ok(()),
        }
    }

    /// Bring both endpoint collections in line with a join entry's state.
    pub(crate) fn reconcile_join_entry(&mut self, join: EntityId) -> Result<()> {
        let model = Arc::clone(&self.model);
        let join_type = model.entity_type(self.type_of(join)?);
        let Some(association) = join_type.join_of() else {
            return Ok(());
        };
        let m2m = model.many_to_many(association);
        let left = self.find_principal_by_fk(join, model.foreign_key(m2m.left_foreign_key));
        let right = self.find_principal_by_fk(join, model.foreign_key(m2m.right_foreign_key));

        if let (Some(left), Some(right)) = (left, right) {
            if self.state(join) == EntityState::Deleted {
                self.nav_remove(left, m2m.left_navigation, right)?;
                if let Some(nav) = m2m.right_navigation {
                    self.nav_remove(right, nav, left)?;
                }
            } else if self.state(left).is_live() && self.state(right).is_live() {
                self.nav_add(left, m2m.left_navigation, right)?;
                if let Some(nav) = m2m.right_navigation {
                    self.nav_add(right, nav, left)?;
                }
            }
            tracing::trace!(
                join = join.index(),
                left = left.index(),
                right = right.index(),
                "Join entry reconciled"
            );
        }
        self.refresh_snapshot(join)
    }

    /// Fill collections from join entries already tracked for a newly
    /// tracked endpoint on `side`.
    pub(crate) fn link_existing_joins(&mut self, association: ManyToManyId, side: JoinSide, id: EntityId) -> Result<()> {
        let model = Arc::clone(&self.model);
        let m2m = model.many_to_many(association);
        let own_fk = model.foreign_key(m2m.foreign_key(side));
        let other_fk = model.foreign_key(m2m.foreign_key(side.other()));
        let key = self.key_values(id, model.entity_type(own_fk.principal_type));
        if key.iter().any(Value::is_null) {
            return Ok(());
        }

        let mut joins: Vec<EntityId> = self
            .identity
            .entries()
            .filter(|e| e.entity_type == m2m.join_type && e.state.is_live())
            .map(Entry::entity)
            .filter(|&j| key_values_eq(&self.fk_values(j, own_fk), &key))
            .collect();
        joins.sort_unstable();

        for join in joins {
            let Some(other) = self.find_principal_by_fk(join, other_fk) else {
                continue;
            };
            if !self.state(id).is_live() || !self.state(other).is_live() {
                continue;
            }
            let (left, right) = match side {
                JoinSide::Left => (id, other),
                JoinSide::Right => (other, id),
            };
            self.nav_add(left, m2m.left_navigation, right)?;
            if let Some(nav) = m2m.right_navigation {
                self.nav_add(right, nav, left)?;
            }
        }
        Ok(())
    }

    /// Create and track the join entry for the edge `(left, right)`.
    pub(crate) fn create_join_entry(
        &mut self,
        association: ManyToManyId,
        left: EntityId,
        right: EntityId,
        state: EntityState,
        from_query: bool,
    ) -> Result<EntityId> {
        let model = Arc::clone(&self.model);
        let m2m = model.many_to_many(association);
        let join_type = model.entity_type(m2m.join_type);
        let mut values = self.join_values(m2m, left, right);

        let mut state = state;
        let mut temporary = false;
        if join_type.key().iter().any(|&k| values[k].is_null()) {
            if !join_type.has_generated_key() {
                return Err(Error::tracking_for(
                    TrackingErrorKind::MissingKey,
                    &join_type.name,
                    "join entry key has no value and is not store-generated",
                ));
            }
            values[join_type.key()[0]] = self.next_temporary_value();
            temporary = true;
            state = EntityState::Added;
        }

        let mut instance = Instance::new(join_type);
        let mut shadow = vec![Value::Null; join_type.shadow_count()];
        for prop in join_type.properties() {
            match prop.storage {
                PropertyStorage::Field(slot) => instance.values[slot] = values[prop.index].clone(),
                PropertyStorage::Shadow(slot) => shadow[slot] = values[prop.index].clone(),
            }
        }
        let key: Vec<Value> = join_type.key().iter().map(|&k| values[k].clone()).collect();
        let id = self.graph.insert(instance);

        let mut entry = Entry::new(
            id,
            join_type.id,
            state,
            EntityKey::new(join_type.id, key),
            shadow,
            join_type.properties().len(),
        );
        entry.temporary_key = temporary;
        entry.original_values = values;
        self.identity.insert(entry)?;
        self.fire_tracked(id, state, from_query);
        tracing::debug!(
            join = id.index(),
            join_type = %join_type.name,
            left = left.index(),
            right = right.index(),
            state = ?state,
            "Join entry created"
        );
        self.refresh_snapshot(id)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::blog_model;
    use crate::{EntityId, EntityState, Session};
    use entrack_core::Value;

    fn post_and_tag(session: &mut Session) -> (EntityId, EntityId) {
        let post = session.create_entity("Post", &[("Id", Value::BigInt(11))]).unwrap();
        let tag = session.create_entity("Tag", &[("Id", Value::BigInt(21))]).unwrap();
        session.attach(post).unwrap();
        session.attach(tag).unwrap();
        (post, tag)
    }

    fn join_count(session: &Session, state: EntityState) -> usize {
        session
            .entries()
            .into_iter()
            .filter(|e| session.model().entity_type(e.entity_type()).name == "PostTag")
            .filter(|e| e.state() == state)
            .count()
    }

    #[test]
    fn test_collection_add_creates_join_entry_and_inverse() {
        let mut session = Session::new(blog_model());
        let (post, tag) = post_and_tag(&mut session);

        session.add_to_collection(post, "Tags", tag).unwrap();

        assert_eq!(session.entity(tag).unwrap().collection("Posts").unwrap(), &[post]);
        assert_eq!(join_count(&session, EntityState::Added), 1);
        let join = session
            .find("PostTag", &[Value::BigInt(11), Value::BigInt(21)])
            .unwrap();
        assert!(join.is_some());
    }

    #[test]
    fn test_collection_add_twice_is_idempotent() {
        let mut session = Session::new(blog_model());
        let (post, tag) = post_and_tag(&mut session);

        session.add_to_collection(post, "Tags", tag).unwrap();
        session.add_to_collection(post, "Tags", tag).unwrap();
        session.add_to_collection(tag, "Posts", post).unwrap();

        assert_eq!(join_count(&session, EntityState::Added), 1);
        assert_eq!(session.entity(post).unwrap().collection("Tags").unwrap(), &[tag]);
    }

    #[test]
    fn test_remove_added_join_detaches_it() {
        let mut session = Session::new(blog_model());
        let (post, tag) = post_and_tag(&mut session);
        session.add_to_collection(post, "Tags", tag).unwrap();

        session.remove_from_collection(tag, "Posts", post).unwrap();

        assert_eq!(join_count(&session, EntityState::Added), 0);
        assert_eq!(join_count(&session, EntityState::Deleted), 0);
        assert!(session.entity(post).unwrap().collection("Tags").unwrap().is_empty());
    }

    #[test]
    fn test_remove_then_readd_restores_unchanged_join() {
        let mut session = Session::new(blog_model());
        let (post, tag) = post_and_tag(&mut session);
        let join = session
            .create_entity("PostTag", &[("PostId", Value::BigInt(11)), ("TagId", Value::BigInt(21))])
            .unwrap();
        session.attach(join).unwrap();
        session.detect_changes().unwrap();
        assert_eq!(session.entity(post).unwrap().collection("Tags").unwrap(), &[tag]);

        session.remove_from_collection(post, "Tags", tag).unwrap();
        assert_eq!(session.state(join), EntityState::Deleted);

        session.add_to_collection(post, "Tags", tag).unwrap();
        assert_eq!(session.state(join), EntityState::Unchanged);
        assert_eq!(session.entity(tag).unwrap().collection("Posts").unwrap(), &[post]);
    }

    #[test]
    fn test_join_tracked_before_endpoints() {
        let mut session = Session::new(blog_model());
        let join = session
            .create_entity("PostTag", &[("PostId", Value::BigInt(11)), ("TagId", Value::BigInt(21))])
            .unwrap();
        session.attach(join).unwrap();
        session.detect_changes().unwrap();

        let (post, tag) = post_and_tag(&mut session);
        assert_eq!(session.entity(post).unwrap().collection("Tags").unwrap(), &[tag]);
        assert_eq!(session.entity(tag).unwrap().collection("Posts").unwrap(), &[post]);
    }
}
