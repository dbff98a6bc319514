//! The save pass.
//!
//! Saving turns the tracked entries into one ordered [`ChangeSet`]:
//! - `Added` entries become inserts
//! - `Modified` entries become updates of their modified properties
//! - `Deleted` entries become deletes
//!
//! Before anything is written, deferred cascades run and the graph is
//! validated: a live entity may not hold a NULL required foreign key (or be
//! an orphan awaiting deletion), and a deleted principal may not leave
//! dependents behind through a `Restrict` foreign key.
//!
//! When every write succeeds, store-generated values are written back
//! (temporary keys replaced and propagated to dependents) and all changes
//! are accepted. A failed write, an error or a cancellation leaves the
//! session exactly as it was.

use crate::entry::EntityState;
use crate::flush::{FlushOrderer, FlushPlan, PendingWrite};
use crate::graph::EntityId;
use crate::Session;
use entrack_core::{
    Cx, EntryCommand, EntryOperation, Error, Outcome, QueryError, QueryErrorKind, QueryExecutor,
    Result, SaveResult, TrackingErrorKind, Value,
};
use std::sync::Arc;

impl Session {
    /// Save every pending change through an executor.
    ///
    /// Returns the number of entries written.
    #[tracing::instrument(level = "info", skip(self, cx, executor))]
    pub async fn save_changes<E: QueryExecutor>(&mut self, cx: &Cx, executor: &E) -> Outcome<usize, Error> {
        let plan = match self.prepare_save() {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };
        if plan.is_empty() {
            tracing::debug!("Nothing to save");
            return Outcome::Ok(0);
        }

        tracing::info!(
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            deletes = plan.deletes.len(),
            "Saving changes"
        );

        let results = match executor.execute_save(cx, &plan.to_change_set()).await {
            Outcome::Ok(results) => results,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        match self.complete_save(&plan, results) {
            Ok(saved) => {
                tracing::info!(saved, "Changes saved");
                Outcome::Ok(saved)
            }
            Err(e) => Outcome::Err(e),
        }
    }

    /// Run deferred work, validate the graph and order the pending writes.
    pub fn prepare_save(&mut self) -> Result<FlushPlan> {
        if self.config.auto_detect_changes {
            self.detect_changes()?;
        }
        self.run_pending_cascades(false)?;
        self.validate_save()?;

        let mut writes = Vec::new();
        for id in self.identity.ids() {
            if let Some(write) = self.pending_write(id)? {
                writes.push(write);
            }
        }
        Ok(FlushOrderer::from_model(&self.model).order(writes))
    }

    /// Mark every pending change as saved.
    ///
    /// `Added` and `Modified` entries become `Unchanged` with their current
    /// values as originals; `Deleted` entries stop being tracked.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn accept_all_changes(&mut self) -> Result<()> {
        let model = Arc::clone(&self.model);
        let mut accepted = 0usize;
        for id in self.identity.ids() {
            match self.state(id) {
                EntityState::Added | EntityState::Modified => {
                    let ty = model.entity_type(self.type_of(id)?);
                    let values = self.current_values(id, ty);
                    if let Some(entry) = self.identity.get_mut(id) {
                        entry.original_values = values;
                        entry.clear_modified();
                        entry.temporary_key = false;
                        entry.orphaned = false;
                    }
                    self.change_state(id, EntityState::Unchanged);
                    self.refresh_snapshot(id)?;
                    accepted += 1;
                }
                EntityState::Deleted => {
                    self.detach_entry(id)?;
                    accepted += 1;
                }
                EntityState::Unchanged | EntityState::Detached => {}
            }
        }
        tracing::debug!(accepted, "Accepted all changes");
        Ok(())
    }

    // ========================================================================
    // Internal
    // ========================================================================

    fn validate_save(&self) -> Result<()> {
        for id in self.identity.ids() {
            let Some(entry) = self.identity.get(id) else {
                continue;
            };
            let ty = self.model.entity_type(entry.entity_type);
            if entry.state.is_live() {
                if entry.orphaned {
                    return Err(Error::tracking_for(
                        TrackingErrorKind::RelationshipSevered,
                        &ty.name,
                        "entity was severed from its required principal",
                    ));
                }
                for &fk_id in self.model.foreign_keys_from(ty.id) {
                    let fk = self.model.foreign_key(fk_id);
                    if fk.is_required && self.fk_values(id, fk).iter().any(Value::is_null) {
                        return Err(Error::tracking_for(
                            TrackingErrorKind::RelationshipSevered,
                            &ty.name,
                            "required foreign key has no value",
                        ));
                    }
                }
            } else if entry.state == EntityState::Deleted {
                let restricted = self.restricted_dependents(id);
                if !restricted.is_empty() {
                    return Err(Error::tracking_for(
                        TrackingErrorKind::DeleteRestricted,
                        &ty.name,
                        format!(
                            "{} tracked dependent(s) still reference the deleted entity",
                            restricted.len()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn pending_write(&self, id: EntityId) -> Result<Option<PendingWrite>> {
        let Some(entry) = self.identity.get(id) else {
            return Ok(None);
        };
        let operation = match entry.state {
            EntityState::Added => EntryOperation::Insert,
            EntityState::Modified => EntryOperation::Update,
            EntityState::Deleted => EntryOperation::Delete,
            EntityState::Unchanged | EntityState::Detached => return Ok(None),
        };
        let ty = self.model.entity_type(entry.entity_type);

        let key = ty
            .key()
            .iter()
            .map(|&k| {
                let prop = ty.property(k);
                // Deletes target the row as it was loaded.
                let value = match operation {
                    EntryOperation::Delete => entry.original_values[k].clone(),
                    _ => self.read_value(id, prop),
                };
                (prop.name.clone(), value)
            })
            .collect();
        let values = ty
            .properties()
            .iter()
            .map(|p| (p.name.clone(), self.read_value(id, p)))
            .collect();
        let modified = match operation {
            EntryOperation::Update => entry
                .modified_properties()
                .into_iter()
                .map(|p| ty.property(p).name.clone())
                .collect(),
            _ => Vec::new(),
        };

        Ok(Some(PendingWrite {
            entity: id,
            entity_type: ty.id,
            command: EntryCommand {
                entity_type: ty.name.clone(),
                operation,
                key,
                values,
                modified,
                temporary_key: entry.temporary_key,
            },
        }))
    }

    /// Check the executor's results, write back generated values and accept.
    fn complete_save(&mut self, plan: &FlushPlan, results: Vec<SaveResult>) -> Result<usize> {
        if results.len() != plan.len() {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::InvalidResult,
                message: format!(
                    "executor returned {} results for {} commands",
                    results.len(),
                    plan.len()
                ),
                source: None,
            }));
        }
        if let Some((write, message)) = plan.writes().zip(&results).find_map(|(w, r)| match r {
            SaveResult::Failed(message) => Some((w, message)),
            SaveResult::Saved(_) => None,
        }) {
            tracing::warn!(
                entity = write.entity.index(),
                entity_type = %write.command.entity_type,
                error = %message,
                "Save failed"
            );
            return Err(Error::tracking_for(
                TrackingErrorKind::SaveFailed,
                &write.command.entity_type,
                message.clone(),
            ));
        }

        for (write, result) in plan.writes().zip(results) {
            if let SaveResult::Saved(generated) = result {
                if !generated.is_empty() && !write.is_delete() {
                    self.apply_generated(write.entity, generated)?;
                }
            }
        }
        self.accept_all_changes()?;
        Ok(plan.len())
    }

    /// Write store-generated values; a changed key is re-registered and
    /// carried to dependents.
    fn apply_generated(&mut self, id: EntityId, generated: Vec<(String, Value)>) -> Result<()> {
        let model = Arc::clone(&self.model);
        let ty = model.entity_type(self.type_of(id)?);
        let mut key_changed = false;
        for (name, value) in generated {
            let prop = ty.property_by_name(&name)?;
            key_changed |= prop.is_key;
            self.write_value(id, prop, value)?;
        }
        if key_changed {
            self.rekey_entity(id)?;
        }
        Ok(())
    }
}
