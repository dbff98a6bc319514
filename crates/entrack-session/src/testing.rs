//! Shared models and a mock executor for unit tests.

use entrack_core::{
    ChangeSet, Cx, DeleteBehavior, EntityTypeBuilder, Error, ForeignKeyBuilder,
    ManyToManyBuilder, ModelBuilder, Outcome, QueryExecutor, RelatedQuery, RelatedRows,
    RelationshipModel, SaveResult, Value,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Parent 1..n Child through the required `Child.ParentId`.
pub(crate) fn parent_child_model() -> Arc<RelationshipModel> {
    parent_child_with(DeleteBehavior::Cascade)
}

pub(crate) fn parent_child_with(behavior: DeleteBehavior) -> Arc<RelationshipModel> {
    let required = !behavior.sets_null();
    let child = EntityTypeBuilder::new("Child").generated_key("Id");
    let child = if required {
        child.property("ParentId")
    } else {
        child.nullable("ParentId")
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
            .unwrap(),
    )
}

/// Blog 1..n Post through an optional shadow key, Post n..n Tag.
pub(crate) fn blog_model() -> Arc<RelationshipModel> {
    Arc::new(
        ModelBuilder::new()
            .entity(EntityTypeBuilder::new("Blog").generated_key("Id").nullable("Name"))
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
            .unwrap(),
    )
}

/// Person 1..1 Passport through the required `Passport.PersonId`.
pub(crate) fn one_to_one_model() -> Arc<RelationshipModel> {
    Arc::new(
        ModelBuilder::new()
            .entity(EntityTypeBuilder::new("Person").generated_key("Id"))
            .entity(
                EntityTypeBuilder::new("Passport")
                    .generated_key("Id")
                    .property("PersonId"),
            )
            .foreign_key(
                ForeignKeyBuilder::new("Person", "Passport", &["PersonId"])
                    .principal_navigation("Passport")
                    .dependent_navigation("Owner")
                    .unique(),
            )
            .build()
            .unwrap(),
    )
}

// ============================================================================
// Mock executor
// ============================================================================

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub(crate) fetch_calls: usize,
    pub(crate) queries: Vec<RelatedQuery>,
    /// Rows returned per navigation name.
    pub(crate) responses: HashMap<String, RelatedRows>,
    pub(crate) fail_fetch: bool,
    pub(crate) saves: Vec<ChangeSet>,
    /// Results returned by the next save; every command succeeds when unset.
    pub(crate) save_results: Option<Vec<SaveResult>>,
    pub(crate) fail_save: bool,
    /// Store-generated key handed to inserts with temporary keys.
    pub(crate) next_key: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct MockExecutor {
    pub(crate) state: Arc<Mutex<MockState>>,
}

impl MockExecutor {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_key: 100,
                ..MockState::default()
            })),
        }
    }

    pub(crate) fn respond(&self, navigation: &str, rows: RelatedRows) {
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
        cx: &Cx,
        query: &RelatedQuery,
    ) -> impl Future<Output = Outcome<RelatedRows, Error>> + Send {
        let state = Arc::clone(&self.state);
        let query = query.clone();
        let cancelled = cx.cancel_reason();
        async move {
            if let Some(reason) = cancelled {
                return Outcome::Cancelled(reason);
            }
            let mut guard = state.lock().expect("lock poisoned");
            guard.fetch_calls += 1;
            guard.queries.push(query.clone());
            if guard.fail_fetch {
                return Outcome::Err(Error::Custom("fetch failed".to_string()));
            }
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
        cx: &Cx,
        changes: &ChangeSet,
    ) -> impl Future<Output = Outcome<Vec<SaveResult>, Error>> + Send {
        let state = Arc::clone(&self.state);
        let changes = changes.clone();
        let cancelled = cx.cancel_reason();
        async move {
            if let Some(reason) = cancelled {
                return Outcome::Cancelled(reason);
            }
            let mut guard = state.lock().expect("lock poisoned");
            guard.saves.push(changes.clone());
            if guard.fail_save {
                return Outcome::Err(Error::Custom("connection lost".to_string()));
            }
            if let Some(results) = guard.save_results.take() {
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

pub(crate) fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}
