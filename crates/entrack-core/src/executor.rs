//! The boundary to the query/command executor.
//!
//! The session never builds SQL. Loads are described as [`RelatedQuery`]
//! values and saves as a [`ChangeSet`]; an implementation of
//! [`QueryExecutor`] turns those into store operations and hands back rows
//! and per-entry results.

use crate::{Error, Row, Value};
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Join-table hop for many-to-many loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPath {
    /// Join entity type name.
    pub join_type: String,
    /// `(join property, target key property)` pairs linking join rows to targets.
    pub target_columns: Vec<(String, String)>,
}

/// A query for the entities related to one owner through one navigation.
///
/// Without `through`, `conditions` are equality filters on `entity_type`.
/// With `through`, they filter the join type and targets are reached via
/// [`JoinPath::target_columns`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedQuery {
    /// Target entity type name.
    pub entity_type: String,
    /// Navigation being loaded.
    pub navigation: String,
    /// `(property, value)` equality filters.
    pub conditions: Vec<(String, Value)>,
    /// Join-table hop for many-to-many navigations.
    pub through: Option<JoinPath>,
}

/// Rows answering a [`RelatedQuery`].
#[derive(Debug, Clone, Default)]
pub struct RelatedRows {
    /// Target entity rows, one per related entity.
    pub entities: Vec<Row>,
    /// Join entity rows; may be left empty when the join key consists of
    /// the two foreign keys, in which case join entries are synthesized.
    pub join_entries: Vec<Row>,
}

impl RelatedRows {
    /// Rows for a non-join load.
    pub fn entities(entities: Vec<Row>) -> Self {
        Self {
            entities,
            join_entries: Vec::new(),
        }
    }
}

/// Kind of write for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryOperation {
    /// INSERT the entity.
    Insert,
    /// UPDATE the modified properties.
    Update,
    /// DELETE by key.
    Delete,
}

/// The write for one tracked entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryCommand {
    /// Entity type name.
    pub entity_type: String,
    /// Kind of write.
    pub operation: EntryOperation,
    /// Key `(property, value)` pairs.
    pub key: Vec<(String, Value)>,
    /// All `(property, value)` pairs, shadow properties included.
    pub values: Vec<(String, Value)>,
    /// Properties changed since the entry was last saved.
    pub modified: Vec<String>,
    /// Whether the key holds temporary values the store must replace.
    pub temporary_key: bool,
}

/// Ordered writes for one save pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Commands in execution order.
    pub commands: Vec<EntryCommand>,
}

impl ChangeSet {
    /// Number of commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Result of one [`EntryCommand`], matched by position.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveResult {
    /// The write succeeded; carries store-generated `(property, value)` pairs.
    Saved(Vec<(String, Value)>),
    /// The write failed.
    Failed(String),
}

impl SaveResult {
    /// A successful write with no generated values.
    pub fn saved() -> Self {
        SaveResult::Saved(Vec::new())
    }
}

/// Executes loads and saves on behalf of a session.
pub trait QueryExecutor: Send + Sync {
    /// Fetch the entities related through one navigation.
    fn fetch_related(
        &self,
        cx: &Cx,
        query: &RelatedQuery,
    ) -> impl Future<Output = Outcome<RelatedRows, Error>> + Send;

    /// Execute the writes of a save pass, one result per command.
    fn execute_save(
        &self,
        cx: &Cx,
        changes: &ChangeSet,
    ) -> impl Future<Output = Outcome<Vec<SaveResult>, Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_set_serializes() {
        let changes = ChangeSet {
            commands: vec![EntryCommand {
                entity_type: "Child".to_string(),
                operation: EntryOperation::Delete,
                key: vec![("Id".to_string(), Value::BigInt(11))],
                values: vec![
                    ("Id".to_string(), Value::BigInt(11)),
                    ("ParentId".to_string(), Value::BigInt(707)),
                ],
                modified: Vec::new(),
                temporary_key: false,
            }],
        };
        let json = serde_json::to_string(&changes).unwrap();
        let back: ChangeSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, changes);
        assert_eq!(back.len(), 1);
    }

    #[test]
    fn test_related_rows_entities() {
        let rows = RelatedRows::entities(vec![Row::from_pairs([("Id", 1i64)])]);
        assert_eq!(rows.entities.len(), 1);
        assert!(rows.join_entries.is_empty());
        assert_eq!(SaveResult::saved(), SaveResult::Saved(Vec::new()));
    }
}
