#![allow(dead_code)]

use asupersync::{Cx, Outcome};
use entrack_core::{
    ChangeSet, DeleteBehavior, EntityTypeBuilder, Error, ForeignKeyBuilder, ManyToManyBuilder,
    ModelBuilder, QueryExecutor, RelatedQuery, RelatedRows, RelationshipModel, SaveResult, Value,
};
use entrack_session::{EntityId, Session};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

/// Parent 1..n Child through `Child.ParentId`.
pub fn family_model(behavior: DeleteBehavior) -> Arc<RelationshipModel> {
    let child = EntityTypeBuilder::new("Child").generated_key("Id");
    let child = if behavior.sets_null() {
        child.nullable("ParentId")
    } else {
        child.property("ParentId")
    };
    Arc::new(
        ModelBuilder::new()
            .entity(EntityTypeBuilder::new("Parent").generated_key("Id").nullable("Name"))
            .entity(child)
            .foreign_key(
                ForeignKeyBuilder::new("Parent", "Child", &["ParentId"])
                    .principal_navigation("Children")
                    .dependent_navigation("Parent")
                    .delete_behavior(behavior),
            )
            .build()
            .expect("valid family model"),
    )
}

/// Parent 1..n Child 1..n Toy, both cascading, and Child n..n Tag.
pub fn nursery_model() -> Arc<RelationshipModel> {
    Arc::new(
        ModelBuilder::new()
            .entity(EntityTypeBuilder::new("Parent").generated_key("Id"))
            .entity(EntityTypeBuilder::new("Child").generated_key("Id").property("ParentId"))
            .entity(EntityTypeBuilder::new("Toy").generated_key("Id").property("ChildId"))
            .entity(EntityTypeBuilder::new("Tag").property("Id").key(&["Id"]))
            .foreign_key(
                ForeignKeyBuilder::new("Parent", "Child", &["ParentId"])
                    .principal_navigation("Children")
                    .dependent_navigation("Parent")
                    .delete_behavior(DeleteBehavior::Cascade),
            )
            .foreign_key(
                ForeignKeyBuilder::new("Child", "Toy", &["ChildId"])
                    .principal_navigation("Toys")
                    .dependent_navigation("Owner")
                    .delete_behavior(DeleteBehavior::Cascade),
            )
            .many_to_many(ManyToManyBuilder::new("Child", "Tags", "Tag").inverse("Children"))
            .build()
            .expect("valid nursery model"),
    )
}

/// Blog 1..n Post through a shadow key, Post n..n Tag.
pub fn blog_model() -> Arc<RelationshipModel> {
    Arc::new(
        ModelBuilder::new()
            .entity(EntityTypeBuilder::new("Blog").generated_key("Id"))
            .entity(
                EntityTypeBuilder::new("Post")
                    .generated_key("Id")
                    .nullable("Title")
                    .shadow("BlogId", true),
            )
            .entity(EntityTypeBuilder::new("Tag").property("Id").key(&["Id"]))
            .foreign_key(
                ForeignKeyBuilder::new("Blog", "Post", &["BlogId"])
                    .principal_navigation("Posts")
                    .dependent_navigation("Blog"),
            )
            .many_to_many(ManyToManyBuilder::new("Post", "Tags", "Tag").inverse("Posts"))
            .build()
            .expect("valid blog model"),
    )
}

/// Student n..n Course through the declared `Enrollment` type, keyed by its
/// own generated `Id` and carrying a `Grade`.
pub fn enrollment_model() -> Arc<RelationshipModel> {
    Arc::new(
        ModelBuilder::new()
            .entity(EntityTypeBuilder::new("Student").generated_key("Id"))
            .entity(EntityTypeBuilder::new("Course").generated_key("Id"))
            .entity(
                EntityTypeBuilder::new("Enrollment")
                    .generated_key("Id")
                    .property("StudentId")
                    .property("CourseId")
                    .nullable("Grade"),
            )
            .many_to_many(
                ManyToManyBuilder::new("Student", "Courses", "Course")
                    .inverse("Students")
                    .using("Enrollment", &["StudentId"], &["CourseId"]),
            )
            .build()
            .expect("valid enrollment model"),
    )
}

/// Attach `Parent{id}` holding one child per id in `children`.
pub fn attach_family(session: &mut Session, id: i64, children: &[i64]) -> (EntityId, Vec<EntityId>) {
    let parent = session
        .create_entity("Parent", &[("Id", Value::BigInt(id))])
        .expect("create parent");
    let mut ids = Vec::new();
    for &child_id in children {
        let child = session
            .create_entity("Child", &[("Id", Value::BigInt(child_id))])
            .expect("create child");
        session
            .entity_mut(parent)
            .expect("parent")
            .add_to_collection("Children", child)
            .expect("add child");
        ids.push(child);
    }
    session.attach(parent).expect("attach family");
    (parent, ids)
}

/// Tracked instances of one entity type.
pub fn tracked_of(session: &Session, entity_type: &str) -> Vec<EntityId> {
    let ty = session
        .model()
        .entity_type_by_name(entity_type)
        .expect("entity type")
        .id;
    session
        .entries()
        .into_iter()
        .filter(|e| e.entity_type() == ty)
        .map(|e| e.entity())
        .collect()
}

// ============================================================================
// Mock executor
// ============================================================================

#[derive(Debug, Default)]
pub struct MockState {
    pub queries: Vec<RelatedQuery>,
    pub responses: HashMap<String, RelatedRows>,
    pub saves: Vec<ChangeSet>,
    pub fail_with: Option<String>,
    pub next_key: i64,
}

#[derive(Debug, Clone)]
pub struct MockExecutor {
    pub state: Arc<Mutex<MockState>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_key: 1000,
                ..MockState::default()
            })),
        }
    }

    pub fn respond(&self, navigation: &str, rows: RelatedRows) {
        self.state
            .lock()
            .expect("lock poisoned")
            .responses
            .insert(navigation.to_string(), rows);
    }
}

#[allow(clippy::manual_async_fn)]
impl QueryExecutor for MockExecutor {
    fn fetch_related(
        &self,
        _cx: &Cx,
        query: &RelatedQuery,
    ) -> impl Future<Output = Outcome<RelatedRows, Error>> + Send {
        let state = Arc::clone(&self.state);
        let query = query.clone();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.queries.push(query.clone());
            Outcome::Ok(
                guard
                    .responses
                    .get(&query.navigation)
                    .cloned()
                    .unwrap_or_default(),
            )
        }
    }

    fn execute_save(
        &self,
        _cx: &Cx,
        changes: &ChangeSet,
    ) -> impl Future<Output = Outcome<Vec<SaveResult>, Error>> + Send {
        let state = Arc::clone(&self.state);
        let changes = changes.clone();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.saves.push(changes.clone());
            if let Some(message) = guard.fail_with.clone() {
                let mut results = vec![SaveResult::saved(); changes.len()];
                if let Some(last) = results.last_mut() {
                    *last = SaveResult::Failed(message);
                }
                return Outcome::Ok(results);
            }
            let mut results = Vec::with_capacity(changes.len());
            for command in &changes.commands {
                if command.temporary_key {
                    let key = guard.next_key;
                    guard.next_key += 1;
                    let generated = command
                        .key
                        .iter()
                        .map(|(name, _)| (name.clone(), Value::BigInt(key)))
                        .collect();
                    results.push(SaveResult::Saved(generated));
                } else {
                    results.push(SaveResult::saved());
                }
            }
            Outcome::Ok(results)
        }
    }
}
