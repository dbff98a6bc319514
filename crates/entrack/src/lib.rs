//! entrack - change tracking and relationship fixup for object graphs.
//!
//! entrack keeps an in-memory graph of entities consistent with the
//! relational model behind it:
//!
//! - One tracked instance per entity key (identity map)
//! - Foreign keys, references, collections and many-to-many joins kept in
//!   agreement as any of them changes (relationship fixup)
//! - Snapshot-based change detection
//! - Cascade and orphan deletes following each association's delete behavior
//! - Explicit and lazy navigation loading through a pluggable executor
//! - Ordered, all-or-nothing save passes
//!
//! # Quick Start
//!
//! ```ignore
//! use entrack::prelude::*;
//!
//! let model = ModelBuilder::new()
//!     .entity(EntityTypeBuilder::new("Blog").generated_key("Id"))
//!     .entity(EntityTypeBuilder::new("Post").generated_key("Id").shadow("BlogId", true))
//!     .entity(EntityTypeBuilder::new("Tag").property("Id").key(&["Id"]))
//!     .foreign_key(
//!         ForeignKeyBuilder::new("Blog", "Post", &["BlogId"])
//!             .principal_navigation("Posts")
//!             .dependent_navigation("Blog"),
//!     )
//!     .many_to_many(ManyToManyBuilder::new("Post", "Tags", "Tag").inverse("Posts"))
//!     .build()?;
//!
//! let mut session = Session::new(Arc::new(model));
//! let blog = session.create_entity("Blog", &[])?;
//! let post = session.create_entity("Post", &[])?;
//! session.entity_mut(blog)?.add_to_collection("Posts", post)?;
//! session.add(blog)?;
//!
//! // The post's shadow foreign key now holds the blog's temporary key
//! let saved = session.save_changes(&cx, &executor).await;
//! ```
//!
//! # Features
//!
//! - **Ids, not pointers**: instances live in a session-owned arena and
//!   navigations hold [`EntityId`]s.
//! - **Structured concurrency**: loads and saves take a `Cx` and return an
//!   `Outcome`, built on asupersync.
//! - **No SQL**: the [`QueryExecutor`] decides how loads and writes reach
//!   the store.

pub use entrack_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Core types
    ChangeSet,
    DeleteBehavior,
    EntityType,
    EntityTypeBuilder,
    EntityTypeId,
    EntryCommand,
    EntryOperation,
    Error,
    ForeignKey,
    ForeignKeyBuilder,
    ForeignKeyId,
    JoinPath,
    JoinSide,
    ManyToMany,
    ManyToManyBuilder,
    ManyToManyId,
    ModelBuilder,
    NavigationId,
    NavigationInfo,
    NavigationKind,
    NavigationRole,
    PropertyDef,
    PropertyInfo,
    PropertyStorage,
    QueryError,
    QueryErrorKind,
    QueryExecutor,
    RelatedQuery,
    RelatedRows,
    RelationshipModel,
    Result,
    Row,
    SaveResult,
    SchemaError,
    SchemaErrorKind,
    TrackingError,
    TrackingErrorKind,
    Value,
};

// Session management
pub use entrack_session::{
    CascadeTiming, CollectionChange, CollectionEntry, Diff, EntityId, EntityKey, EntityMut,
    EntityRef, EntityState, Entry, FlushOrderer, FlushPlan, ForeignKeyChange, IdentityMap,
    NavigationEntry, NavigationValue, PendingWrite, PropertyChange, ReferenceChange,
    ReferenceDiff, ReferenceEntry, Session, SessionConfig, SessionDebugInfo, StateChangedEvent,
    TrackGraphNode, TrackedEvent,
};

// ============================================================================
// Prelude
// ============================================================================

/// Commonly used types, for glob import.
pub mod prelude {
    pub use crate::{
        // asupersync
        Cx,
        Outcome,
        // Model
        DeleteBehavior,
        EntityTypeBuilder,
        ForeignKeyBuilder,
        ManyToManyBuilder,
        ModelBuilder,
        PropertyDef,
        RelationshipModel,
        // Executor boundary
        ChangeSet,
        QueryExecutor,
        RelatedQuery,
        RelatedRows,
        SaveResult,
        // Session
        CascadeTiming,
        EntityId,
        EntityState,
        Session,
        SessionConfig,
        // Values and errors
        Error,
        Result,
        Row,
        TrackingErrorKind,
        Value,
    };
    pub use std::sync::Arc;
}
