//! Core types for entrack.
//!
//! This crate provides the pieces shared by the session and its
//! collaborators:
//!
//! - `Value` and `Row` for property data
//! - `RelationshipModel` describing entity types, keys and associations
//! - `QueryExecutor`, the boundary to whatever runs loads and saves
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod error;
pub mod executor;
pub mod model;
pub mod relationship;
pub mod row;
pub mod value;

pub use error::{
    Error, QueryError, QueryErrorKind, Result, SchemaError, SchemaErrorKind, TrackingError,
    TrackingErrorKind,
};
pub use executor::{
    ChangeSet, EntryCommand, EntryOperation, JoinPath, QueryExecutor, RelatedQuery, RelatedRows,
    SaveResult,
};
pub use model::{
    EntityType, EntityTypeBuilder, EntityTypeId, ModelBuilder, PropertyDef, PropertyInfo,
    PropertyStorage, RelationshipModel,
};
pub use relationship::{
    DeleteBehavior, ForeignKey, ForeignKeyBuilder, ForeignKeyId, JoinSide, ManyToMany,
    ManyToManyBuilder, ManyToManyId, NavigationId, NavigationInfo, NavigationKind,
    NavigationRole,
};
pub use row::{ColumnInfo, Row};
pub use value::{Value, key_values_eq};
