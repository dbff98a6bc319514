//! Write ordering for the save pass.
//!
//! Pending writes are ordered so the store never sees a dangling foreign key:
//! - INSERT parent-first
//! - UPDATE parent-first
//! - DELETE child-first
//!
//! Join entity types depend on both endpoints, so join rows are inserted
//! after and deleted before the entities they link.

use crate::graph::EntityId;
use entrack_core::{ChangeSet, EntityTypeId, EntryCommand, EntryOperation, RelationshipModel};

/// One entry's write, tagged with the instance it came from.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    /// The instance being written.
    pub entity: EntityId,
    /// Its entity type.
    pub entity_type: EntityTypeId,
    /// The command handed to the executor.
    pub command: EntryCommand,
}

impl PendingWrite {
    /// Check if this is an insert.
    pub fn is_insert(&self) -> bool {
        self.command.operation == EntryOperation::Insert
    }

    /// Check if this is an update.
    pub fn is_update(&self) -> bool {
        self.command.operation == EntryOperation::Update
    }

    /// Check if this is a delete.
    pub fn is_delete(&self) -> bool {
        self.command.operation == EntryOperation::Delete
    }
}

/// Orders writes by foreign-key depth.
///
/// A type's depth is one more than the deepest of its principal types;
/// types with no principals have depth zero. Self-references are ignored.
#[derive(Debug, Clone, Default)]
pub struct FlushOrderer {
    depths: Vec<usize>,
}

impl FlushOrderer {
    /// Compute type depths from a relationship model.
    pub fn from_model(model: &RelationshipModel) -> Self {
        let count = model.entity_types().len();
        let mut depths: Vec<Option<usize>> = vec![None; count];
        let mut visiting = vec![false; count];
        for ty in 0..count {
            depth_of(model, ty, &mut depths, &mut visiting);
        }
        Self {
            depths: depths.into_iter().map(|d| d.unwrap_or(0)).collect(),
        }
    }

    /// Foreign-key depth of a type.
    pub fn depth(&self, entity_type: EntityTypeId) -> usize {
        self.depths.get(entity_type.index()).copied().unwrap_or(0)
    }

    /// Order writes into a flush plan.
    ///
    /// Ties are broken by instance id so plans are deterministic.
    pub fn order(&self, writes: Vec<PendingWrite>) -> FlushPlan {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();

        for write in writes {
            match write.command.operation {
                EntryOperation::Insert => inserts.push(write),
                EntryOperation::Update => updates.push(write),
                EntryOperation::Delete => deletes.push(write),
            }
        }

        // Parents first
        inserts.sort_by_key(|w| (self.depth(w.entity_type), w.entity));
        updates.sort_by_key(|w| (self.depth(w.entity_type), w.entity));
        // Children first
        deletes.sort_by(|a, b| {
            self.depth(b.entity_type)
                .cmp(&self.depth(a.entity_type))
                .then(a.entity.cmp(&b.entity))
        });

        FlushPlan {
            inserts,
            updates,
            deletes,
        }
    }
}

fn depth_of(
    model: &RelationshipModel,
    ty: usize,
    depths: &mut [Option<usize>],
    visiting: &mut [bool],
) -> usize {
    if let Some(depth) = depths[ty] {
        return depth;
    }
    // Cycle between types: cut it here.
    if visiting[ty] {
        return 0;
    }
    visiting[ty] = true;

    let id = model.entity_types()[ty].id;
    let mut depth = 0;
    for &fk_id in model.foreign_keys_from(id) {
        let principal = model.foreign_key(fk_id).principal_type.index();
        if principal != ty {
            depth = depth.max(depth_of(model, principal, depths, visiting) + 1);
        }
    }

    visiting[ty] = false;
    depths[ty] = Some(depth);
    depth
}

/// Ordered writes for one save pass.
#[derive(Debug, Clone, Default)]
pub struct FlushPlan {
    /// Inserts, parents first.
    pub inserts: Vec<PendingWrite>,
    /// Updates, parents first.
    pub updates: Vec<PendingWrite>,
    /// Deletes, children first.
    pub deletes: Vec<PendingWrite>,
}

impl FlushPlan {
    /// Check if the plan has any writes.
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Total number of writes in the plan.
    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    /// All writes in execution order: inserts, updates, deletes.
    pub fn writes(&self) -> impl Iterator<Item = &PendingWrite> {
        self.inserts
            .iter()
            .chain(self.updates.iter())
            .chain(self.deletes.iter())
    }

    /// Instances in execution order; position `i` matches command `i`.
    pub fn entities(&self) -> Vec<EntityId> {
        self.writes().map(|w| w.entity).collect()
    }

    /// The commands handed to the executor.
    pub fn to_change_set(&self) -> ChangeSet {
        ChangeSet {
            commands: self.writes().map(|w| w.command.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{blog_model, parent_child_model};
    use entrack_core::Value;

    fn write(model: &RelationshipModel, ty: &str, entity: usize, operation: EntryOperation) -> PendingWrite {
        let entity_type = model.entity_type_by_name(ty).unwrap().id;
        PendingWrite {
            entity: EntityId(entity),
            entity_type,
            command: EntryCommand {
                entity_type: ty.to_string(),
                operation,
                key: vec![("Id".to_string(), Value::BigInt(entity as i64))],
                values: Vec::new(),
                modified: Vec::new(),
                temporary_key: false,
            },
        }
    }

    #[test]
    fn test_depths_follow_foreign_keys() {
        let model = blog_model();
        let orderer = FlushOrderer::from_model(&model);
        let depth = |name: &str| orderer.depth(model.entity_type_by_name(name).unwrap().id);
        assert_eq!(depth("Blog"), 0);
        assert_eq!(depth("Post"), 1);
        assert_eq!(depth("Tag"), 0);
        assert_eq!(depth("PostTag"), 2);
    }

    #[test]
    fn test_inserts_parent_first_deletes_child_first() {
        let model = parent_child_model();
        let orderer = FlushOrderer::from_model(&model);
        let plan = orderer.order(vec![
            write(&model, "Child", 0, EntryOperation::Insert),
            write(&model, "Parent", 1, EntryOperation::Insert),
            write(&model, "Parent", 2, EntryOperation::Delete),
            write(&model, "Child", 3, EntryOperation::Delete),
            write(&model, "Child", 4, EntryOperation::Update),
        ]);

        assert_eq!(plan.len(), 5);
        assert_eq!(
            plan.entities(),
            vec![EntityId(1), EntityId(0), EntityId(4), EntityId(3), EntityId(2)]
        );
        assert!(plan.inserts.iter().all(PendingWrite::is_insert));
        assert!(plan.deletes.iter().all(PendingWrite::is_delete));
    }

    #[test]
    fn test_ties_are_ordered_by_instance() {
        let model = parent_child_model();
        let plan = FlushOrderer::from_model(&model).order(vec![
            write(&model, "Child", 7, EntryOperation::Update),
            write(&model, "Child", 3, EntryOperation::Update),
        ]);
        assert_eq!(plan.entities(), vec![EntityId(3), EntityId(7)]);
        assert!(plan.updates.iter().all(PendingWrite::is_update));
    }

    #[test]
    fn test_change_set_matches_plan_order() {
        let model = blog_model();
        let plan = FlushOrderer::from_model(&model).order(vec![
            write(&model, "PostTag", 0, EntryOperation::Insert),
            write(&model, "Post", 1, EntryOperation::Insert),
            write(&model, "Tag", 2, EntryOperation::Insert),
        ]);
        let names: Vec<String> = plan
            .to_change_set()
            .commands
            .into_iter()
            .map(|c| c.entity_type)
            .collect();
        assert_eq!(names, vec!["Tag", "Post", "PostTag"]);
    }

    #[test]
    fn test_empty_plan() {
        let plan = FlushPlan::default();
        assert!(plan.is_empty());
        assert!(plan.to_change_set().is_empty());
    }
}
