//! Explicit and lazy loading of navigations.
//!
//! A navigation is loaded by asking the [`QueryExecutor`] for the entities
//! related to the owner through it. Loaded rows go through identity
//! resolution first: an instance already tracked under a row's key is used
//! as is and the row is discarded. The rest are tracked as `Unchanged` and
//! fixed up like any other newly tracked entity, which is what fills the
//! navigation.
//!
//! Loading is skipped when the navigation is already loaded or its owner is
//! `Deleted`. When the key or foreign key to query by is NULL or temporary,
//! nothing is queried and the navigation is marked loaded as it is.
//!
//! # Example
//!
//! ```ignore
//! let mut children = session.collection(parent, "Children")?;
//! children.load(&cx, &executor).await;
//! assert!(children.is_loaded());
//! ```

use crate::entry::{EntityKey, EntityState};
use crate::graph::{EntityId, Instance, wrong_kind};
use crate::Session;
use entrack_core::{
    Cx, EntityType, EntityTypeId, Error, JoinPath, JoinSide, ManyToManyId, NavigationId, NavigationInfo,
    NavigationRole, Outcome, PropertyStorage, QueryError, QueryErrorKind, QueryExecutor,
    RelatedQuery, RelatedRows, Result, Row, TrackingErrorKind, Value, key_values_eq,
};
use std::sync::Arc;

/// What loading a navigation requires.
enum LoadPlan {
    /// Nothing to do.
    Skip,
    /// Nothing to query; mark loaded.
    Empty,
    /// Run the query and apply its rows.
    Query(RelatedQuery),
}

// ============================================================================
// Navigation entries
// ============================================================================

/// Loading handle for a reference navigation.
#[derive(Debug)]
pub struct ReferenceEntry<'s> {
    session: &'s mut Session,
    entity: EntityId,
    navigation: NavigationId,
}

/// Loading handle for a collection navigation.
#[derive(Debug)]
pub struct CollectionEntry<'s> {
    session: &'s mut Session,
    entity: EntityId,
    navigation: NavigationId,
}

/// Loading handle for a navigation resolved by name.
#[derive(Debug)]
pub enum NavigationEntry<'s> {
    /// A reference navigation.
    Reference(ReferenceEntry<'s>),
    /// A collection navigation.
    Collection(CollectionEntry<'s>),
}

impl ReferenceEntry<'_> {
    /// The owning instance.
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// Whether the navigation is loaded.
    pub fn is_loaded(&self) -> bool {
        self.session.is_navigation_loaded(self.entity, self.navigation)
    }

    /// Declare the navigation loaded, or not loaded.
    ///
    /// Clearing the flag on a reference that holds an entity fails with
    /// `ReferenceMustBeLoaded`.
    pub fn set_is_loaded(&mut self, loaded: bool) -> Result<()> {
        if !loaded && self.current().is_some() {
            let ty = self.session.entity_type_of(self.entity)?;
            return Err(Error::tracking_for(
                TrackingErrorKind::ReferenceMustBeLoaded,
                &ty.name,
                format!(
                    "reference '{}' holds an entity and cannot be marked not loaded",
                    ty.navigation(self.navigation).name
                ),
            ));
        }
        self.session.set_navigation_loaded(self.entity, self.navigation, loaded)
    }

    /// The referenced instance.
    pub fn current(&self) -> Option<EntityId> {
        self.session.reference_of(self.entity, self.navigation)
    }

    /// The query that would load the navigation; `None` when there is
    /// nothing to query by.
    pub fn query(&self) -> Result<Option<RelatedQuery>> {
        self.session.related_query(self.entity, self.navigation)
    }

    /// Load the navigation through an executor.
    pub async fn load<E: QueryExecutor>(&mut self, cx: &Cx, executor: &E) -> Outcome<(), Error> {
        self.session
            .load_navigation(cx, executor, self.entity, self.navigation)
            .await
    }

    /// Load the navigation from rows fetched by the caller.
    pub fn load_from(&mut self, rows: RelatedRows) -> Result<()> {
        self.session.load_navigation_from(self.entity, self.navigation, rows)
    }
}

impl CollectionEntry<'_> {
    /// The owning instance.
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// Whether the navigation is loaded.
    pub fn is_loaded(&self) -> bool {
        self.session.is_navigation_loaded(self.entity, self.navigation)
    }

    /// Declare the navigation loaded, or not loaded.
    pub fn set_is_loaded(&mut self, loaded: bool) -> Result<()> {
        self.session.set_navigation_loaded(self.entity, self.navigation, loaded)
    }

    /// Current members.
    pub fn current(&self) -> Vec<EntityId> {
        self.session.members_of(self.entity, self.navigation)
    }

    /// The query that would load the navigation; `None` when there is
    /// nothing to query by.
    pub fn query(&self) -> Result<Option<RelatedQuery>> {
        self.session.related_query(self.entity, self.navigation)
    }

    /// Load the navigation through an executor.
    pub async fn load<E: QueryExecutor>(&mut self, cx: &Cx, executor: &E) -> Outcome<(), Error> {
        self.session
            .load_navigation(cx, executor, self.entity, self.navigation)
            .await
    }

    /// Load the navigation from rows fetched by the caller.
    pub fn load_from(&mut self, rows: RelatedRows) -> Result<()> {
        self.session.load_navigation_from(self.entity, self.navigation, rows)
    }
}

impl NavigationEntry<'_> {
    /// Whether the navigation is loaded.
    pub fn is_loaded(&self) -> bool {
        match self {
            NavigationEntry::Reference(r) => r.is_loaded(),
            NavigationEntry::Collection(c) => c.is_loaded(),
        }
    }

    /// Declare the navigation loaded, or not loaded.
    pub fn set_is_loaded(&mut self, loaded: bool) -> Result<()> {
        match self {
            NavigationEntry::Reference(r) => r.set_is_loaded(loaded),
            NavigationEntry::Collection(c) => c.set_is_loaded(loaded),
        }
    }

    /// Current targets, as a list for both shapes.
    pub fn current(&self) -> Vec<EntityId> {
        match self {
            NavigationEntry::Reference(r) => r.current().into_iter().collect(),
            NavigationEntry::Collection(c) => c.current(),
        }
    }

    /// The query that would load the navigation.
    pub fn query(&self) -> Result<Option<RelatedQuery>> {
        match self {
            NavigationEntry::Reference(r) => r.query(),
            NavigationEntry::Collection(c) => c.query(),
        }
    }

    /// Load the navigation through an executor.
    pub async fn load<E: QueryExecutor>(&mut self, cx: &Cx, executor: &E) -> Outcome<(), Error> {
        match self {
            NavigationEntry::Reference(r) => r.load(cx, executor).await,
            NavigationEntry::Collection(c) => c.load(cx, executor).await,
        }
    }

    /// Load the navigation from rows fetched by the caller.
    pub fn load_from(&mut self, rows: RelatedRows) -> Result<()> {
        match self {
            NavigationEntry::Reference(r) => r.load_from(rows),
            NavigationEntry::Collection(c) => c.load_from(rows),
        }
    }
}

// ============================================================================
// Session API
// ============================================================================

impl Session {
    /// Loading handle for a reference navigation.
    pub fn reference(&mut self, id: EntityId, navigation: &str) -> Result<ReferenceEntry<'_>> {
        let ty = self.entity_type_of(id)?;
        let nav = ty.navigation_by_name(navigation)?;
        if nav.is_collection() {
            return Err(wrong_kind(ty, navigation));
        }
        let navigation = nav.id;
        Ok(ReferenceEntry {
            session: self,
            entity: id,
            navigation,
        })
    }

    /// Loading handle for a collection navigation.
    pub fn collection(&mut self, id: EntityId, navigation: &str) -> Result<CollectionEntry<'_>> {
        let ty = self.entity_type_of(id)?;
        let nav = ty.navigation_by_name(navigation)?;
        if !nav.is_collection() {
            return Err(wrong_kind(ty, navigation));
        }
        let navigation = nav.id;
        Ok(CollectionEntry {
            session: self,
            entity: id,
            navigation,
        })
    }

    /// Loading handle for any navigation, resolved by name.
    pub fn navigation(&mut self, id: EntityId, navigation: &str) -> Result<NavigationEntry<'_>> {
        let is_collection = self
            .entity_type_of(id)?
            .navigation_by_name(navigation)?
            .is_collection();
        if is_collection {
            self.collection(id, navigation).map(NavigationEntry::Collection)
        } else {
            self.reference(id, navigation).map(NavigationEntry::Reference)
        }
    }

    /// Load a reference navigation on first access and return its target.
    ///
    /// Does not query when lazy loading is disabled or the owner is
    /// `Detached` or `Deleted`. A reference fixup already filled is marked
    /// loaded instead of queried.
    #[tracing::instrument(level = "debug", skip(self, cx, executor))]
    pub async fn lazy_reference<E: QueryExecutor>(
        &mut self,
        cx: &Cx,
        executor: &E,
        id: EntityId,
        navigation: &str,
    ) -> Outcome<Option<EntityId>, Error> {
        let nav = match self.reference(id, navigation) {
            Ok(entry) => entry.navigation,
            Err(e) => return Outcome::Err(e),
        };
        if !self.lazy_load_allowed(id) {
            return Outcome::Ok(self.reference_of(id, nav));
        }
        if self.reference_of(id, nav).is_some() {
            if !self.is_navigation_loaded(id, nav) {
                tracing::trace!(entity = id.index(), navigation, "Reference already fixed up");
                if let Err(e) = self.set_navigation_loaded(id, nav, true) {
                    return Outcome::Err(e);
                }
            }
        } else {
            match self.load_navigation(cx, executor, id, nav).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(self.reference_of(id, nav))
    }

    /// Load a collection navigation on first access and return its members.
    ///
    /// Does not query when lazy loading is disabled or the owner is
    /// `Detached` or `Deleted`.
    #[tracing::instrument(level = "debug", skip(self, cx, executor))]
    pub async fn lazy_collection<E: QueryExecutor>(
        &mut self,
        cx: &Cx,
        executor: &E,
        id: EntityId,
        navigation: &str,
    ) -> Outcome<Vec<EntityId>, Error> {
        let nav = match self.collection(id, navigation) {
            Ok(entry) => entry.navigation,
            Err(e) => return Outcome::Err(e),
        };
        if self.lazy_load_allowed(id) {
            match self.load_navigation(cx, executor, id, nav).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(self.members_of(id, nav))
    }

    fn lazy_load_allowed(&self, id: EntityId) -> bool {
        self.config.lazy_loading_enabled
            && !matches!(self.state(id), EntityState::Detached | EntityState::Deleted)
    }

    // ========================================================================
    // Internal
    // ========================================================================

    pub(crate) fn is_navigation_loaded(&self, id: EntityId, nav: NavigationId) -> bool {
        self.graph
            .get(id)
            .ok()
            .and_then(|i| i.loaded.get(nav.index()).copied())
            .unwrap_or(false)
    }

    pub(crate) fn set_navigation_loaded(&mut self, id: EntityId, nav: NavigationId, loaded: bool) -> Result<()> {
        self.graph.get_mut(id)?.loaded[nav.index()] = loaded;
        Ok(())
    }

    /// The query for the entities related to `id` through `nav`.
    pub(crate) fn related_query(&self, id: EntityId, nav_id: NavigationId) -> Result<Option<RelatedQuery>> {
        let model = &self.model;
        let ty = self.entity_type_of(id)?;
        let nav = ty.navigation(nav_id);
        let target = model.entity_type(nav.target_type);

        let (conditions, through) = match nav.role {
            NavigationRole::Dependent(fk_id) => {
                let fk = model.foreign_key(fk_id);
                if !self.is_tracked(id) && model.has_shadow_properties(fk_id) {
                    return Err(Error::tracking_for(
                        TrackingErrorKind::CannotLoadDetachedShadowProperty,
                        &ty.name,
                        format!(
                            "'{}' is backed by a shadow foreign key and the entity is detached",
                            nav.name
                        ),
                    ));
                }
                let values = self.fk_values(id, fk);
                if values.iter().any(Value::is_null) || self.holds_temporary_key(fk.principal_type, &values) {
                    return Ok(None);
                }
                (named(target, target.key(), values), None)
            }
            NavigationRole::Principal(fk_id) => {
                let fk = model.foreign_key(fk_id);
                let Some(key) = self.queryable_key(id, ty) else {
                    return Ok(None);
                };
                (named(target, &fk.properties, key), None)
            }
            NavigationRole::ManyToMany { association, side } => {
                let m2m = model.many_to_many(association);
                let join_type = model.entity_type(m2m.join_type);
                let own_fk = model.foreign_key(m2m.foreign_key(side));
                let other_fk = model.foreign_key(m2m.foreign_key(side.other()));
                let Some(key) = self.queryable_key(id, ty) else {
                    return Ok(None);
                };
                let target_columns = other_fk
                    .properties
                    .iter()
                    .zip(target.key())
                    .map(|(&j, &t)| {
                        (
                            join_type.property(j).name.clone(),
                            target.property(t).name.clone(),
                        )
                    })
                    .collect();
                (
                    named(join_type, &own_fk.properties, key),
                    Some(JoinPath {
                        join_type: join_type.name.clone(),
                        target_columns,
                    }),
                )
            }
        };

        Ok(Some(RelatedQuery {
            entity_type: target.name.clone(),
            navigation: nav.name.clone(),
            conditions,
            through,
        }))
    }

    /// Key of `id` when it can be queried by: non-NULL and not temporary.
    fn queryable_key(&self, id: EntityId, ty: &EntityType) -> Option<Vec<Value>> {
        if self.identity.get(id).is_some_and(|e| e.has_temporary_key()) {
            return None;
        }
        let key = self.key_values(id, ty);
        (!key.iter().any(Value::is_null)).then_some(key)
    }

    /// Whether `values` is the temporary key of a tracked instance.
    fn holds_temporary_key(&self, entity_type: EntityTypeId, values: &[Value]) -> bool {
        self.identity
            .find(&EntityKey::new(entity_type, values.to_vec()))
            .and_then(|id| self.identity.get(id))
            .is_some_and(|e| e.has_temporary_key())
    }

    fn plan_load(&self, id: EntityId, nav: NavigationId) -> Result<LoadPlan> {
        if self.is_navigation_loaded(id, nav) || self.state(id) == EntityState::Deleted {
            return Ok(LoadPlan::Skip);
        }
        Ok(match self.related_query(id, nav)? {
            Some(query) => LoadPlan::Query(query),
            None => LoadPlan::Empty,
        })
    }

    #[tracing::instrument(level = "debug", skip(self, cx, executor))]
    pub(crate) async fn load_navigation<E: QueryExecutor>(
        &mut self,
        cx: &Cx,
        executor: &E,
        id: EntityId,
        nav: NavigationId,
    ) -> Outcome<(), Error> {
        let query = match self.plan_load(id, nav) {
            Ok(LoadPlan::Skip) => {
                tracing::trace!("Already loaded");
                return Outcome::Ok(());
            }
            Ok(LoadPlan::Empty) => {
                tracing::trace!("Nothing to query by");
                return match self.set_navigation_loaded(id, nav, true) {
                    Ok(()) => Outcome::Ok(()),
                    Err(e) => Outcome::Err(e),
                };
            }
            Ok(LoadPlan::Query(query)) => query,
            Err(e) => return Outcome::Err(e),
        };

        tracing::debug!(
            entity_type = %query.entity_type,
            navigation = %query.navigation,
            conditions = query.conditions.len(),
            "Loading navigation"
        );

        let rows = match executor.fetch_related(cx, &query).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        match self.apply_loaded(id, nav, rows) {
            Ok(()) => Outcome::Ok(()),
            Err(e) => Outcome::Err(e),
        }
    }

    pub(crate) fn load_navigation_from(&mut self, id: EntityId, nav: NavigationId, rows: RelatedRows) -> Result<()> {
        match self.plan_load(id, nav)? {
            LoadPlan::Skip => Ok(()),
            LoadPlan::Empty => self.set_navigation_loaded(id, nav, true),
            LoadPlan::Query(_) => self.apply_loaded(id, nav, rows),
        }
    }

    /// Materialize loaded rows, fix them up and mark the navigation loaded.
    fn apply_loaded(&mut self, id: EntityId, nav_id: NavigationId, rows: RelatedRows) -> Result<()> {
        let model = Arc::clone(&self.model);
        let ty = model.entity_type(self.type_of(id)?);
        let nav = ty.navigation(nav_id);
        let target = model.entity_type(nav.target_type);
        let tracking = self.is_tracked(id);

        let mut targets = Vec::with_capacity(rows.entities.len());
        for row in &rows.entities {
            targets.push(self.materialize(target, row, tracking)?);
        }

        if tracking {
            self.fix_up_loaded(id, nav, &targets, &rows.join_entries)?;
        } else {
            for &t in &targets {
                self.graph.get_mut(id)?.navigations[nav_id.index()].add(t);
                if let Some(inverse) = nav.inverse {
                    self.graph.get_mut(t)?.navigations[inverse.index()].add(id);
                }
            }
        }
        self.set_navigation_loaded(id, nav_id, true)?;

        tracing::debug!(
            entity = id.index(),
            navigation = %nav.name,
            loaded = targets.len(),
            tracking,
            "Navigation loaded"
        );
        Ok(())
    }

    /// Link loaded targets to a tracked owner.
    ///
    /// Tracked instances whose foreign keys disagree with the store are left
    /// where the session has them.
    fn fix_up_loaded(&mut self, id: EntityId, nav: &NavigationInfo, targets: &[EntityId], join_rows: &[Row]) -> Result<()> {
        let model = Arc::clone(&self.model);
        match nav.role {
            NavigationRole::Dependent(fk_id) => {
                let fk = model.foreign_key(fk_id);
                for &principal in targets {
                    let key = self.key_values(principal, model.entity_type(fk.principal_type));
                    if key_values_eq(&self.fk_values(id, fk), &key) {
                        self.link_navigations(fk_id, principal, id)?;
                    }
                }
            }
            NavigationRole::Principal(fk_id) => {
                let fk = model.foreign_key(fk_id);
                let key = self.key_values(id, model.entity_type(fk.principal_type));
                for &dependent in targets {
                    if key_values_eq(&self.fk_values(dependent, fk), &key) {
                        self.link_navigations(fk_id, id, dependent)?;
                    }
                }
            }
            NavigationRole::ManyToMany { association, side } => {
                self.load_join_entries(association, side, id, targets, join_rows)?;
            }
        }
        self.refresh_snapshot(id)
    }

    fn load_join_entries(
        &mut self,
        association: ManyToManyId,
        side: JoinSide,
        id: EntityId,
        targets: &[EntityId],
        join_rows: &[Row],
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let m2m = model.many_to_many(association);
        if !join_rows.is_empty() {
            let join_type = model.entity_type(m2m.join_type);
            for row in join_rows {
                let join = self.materialize(join_type, row, true)?;
                self.reconcile_join_entry(join)?;
            }
            return Ok(());
        }
        for &target in targets {
            let (left, right) = match side {
                JoinSide::Left => (id, target),
                JoinSide::Right => (target, id),
            };
            let join = match self.find_join_entry(association, left, right) {
                Some(join) => join,
                None => self.create_join_entry(association, left, right, EntityState::Unchanged, true)?,
            };
            self.reconcile_join_entry(join)?;
        }
        Ok(())
    }

    /// Turn a row into an instance, resolving identity when tracking.
    fn materialize(&mut self, ty: &EntityType, row: &Row, tracking: bool) -> Result<EntityId> {
        let key: Vec<Value> = ty
            .key()
            .iter()
            .map(|&k| row.get_by_name(&ty.property(k).name).cloned().unwrap_or(Value::Null))
            .collect();
        if key.iter().any(Value::is_null) {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::InvalidResult,
                message: format!("loaded '{}' row has no key", ty.name),
                source: None,
            }));
        }
        if tracking {
            if let Some(existing) = self.identity.find(&EntityKey::new(ty.id, key)) {
                tracing::trace!(entity = existing.index(), "Loaded row resolved to tracked instance");
                return Ok(existing);
            }
        }

        let mut instance = Instance::new(ty);
        let mut shadow = vec![Value::Null; ty.shadow_count()];
        for prop in ty.properties() {
            let value = row.get_by_name(&prop.name).cloned().unwrap_or(Value::Null);
            match prop.storage {
                PropertyStorage::Field(slot) => instance.values[slot] = value,
                PropertyStorage::Shadow(slot) => shadow[slot] = value,
            }
        }
        let id = self.graph.insert(instance);
        if tracking {
            self.track_materialized(id, shadow)?;
        }
        Ok(id)
    }
}

/// `(property name, value)` pairs for the given properties of `ty`.
fn named(ty: &EntityType, properties: &[usize], values: Vec<Value>) -> Vec<(String, Value)> {
    properties
        .iter()
        .zip(values)
        .map(|(&p, v)| (ty.property(p).name.clone(), v))
        .collect()
}
