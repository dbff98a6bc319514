//! Error types for entrack operations.

use std::fmt;

/// The primary error type for all entrack operations.
#[derive(Debug)]
pub enum Error {
    /// Entity state and relationship tracking errors
    Tracking(TrackingError),
    /// Errors reported by the query/command executor
    Query(QueryError),
    /// Relationship model errors
    Schema(SchemaError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct TrackingError {
    pub kind: TrackingErrorKind,
    /// Entity type involved, if any
    pub entity_type: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingErrorKind {
    /// Two different instances resolve to the same key in one session
    IdentityConflict,
    /// A navigation backed by a shadow foreign key was loaded for a detached entity
    CannotLoadDetachedShadowProperty,
    /// `IsLoaded` was cleared on a reference that currently holds an entity
    ReferenceMustBeLoaded,
    /// Entity type is not part of the relationship model
    UnknownEntity,
    /// Navigation name is not declared on the entity type
    UnknownNavigation,
    /// Property name is not declared on the entity type
    UnknownProperty,
    /// A key property of a persisted entity was changed
    KeyReadOnly,
    /// A non-generated key has no value
    MissingKey,
    /// The requested operation is not valid in the entity's current state
    InvalidState,
    /// A required relationship was severed and the dependent is not deleted
    RelationshipSevered,
    /// A principal with restricted deletes still has tracked dependents
    DeleteRestricted,
    /// The executor reported failures for one or more entries
    SaveFailed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Optimistic concurrency check failed
    Concurrency,
    /// The executor returned rows the session could not use
    InvalidResult,
    /// Other store error
    Database,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Entity type declared twice
    DuplicateEntity,
    /// Entity type referenced but never declared
    EntityNotFound,
    /// Property declared twice or referenced but never declared
    Property,
    /// Navigation name clashes with another navigation on the same type
    DuplicateNavigation,
    /// Invalid key or foreign-key definition
    Invalid,
}

impl Error {
    /// Build a tracking error.
    pub fn tracking(kind: TrackingErrorKind, message: impl Into<String>) -> Self {
        Error::Tracking(TrackingError {
            kind,
            entity_type: None,
            message: message.into(),
        })
    }

    /// Build a tracking error attributed to an entity type.
    pub fn tracking_for(
        kind: TrackingErrorKind,
        entity_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Tracking(TrackingError {
            kind,
            entity_type: Some(entity_type.into()),
            message: message.into(),
        })
    }

    /// Build a schema error.
    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
        })
    }

    /// The tracking error kind, if this is a tracking error.
    pub fn tracking_kind(&self) -> Option<TrackingErrorKind> {
        match self {
            Error::Tracking(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Is this a usage error the caller can fix without touching the store?
    pub fn is_usage_error(&self) -> bool {
        match self {
            Error::Tracking(t) => matches!(
                t.kind,
                TrackingErrorKind::ReferenceMustBeLoaded
                    | TrackingErrorKind::UnknownEntity
                    | TrackingErrorKind::UnknownNavigation
                    | TrackingErrorKind::UnknownProperty
                    | TrackingErrorKind::KeyReadOnly
                    | TrackingErrorKind::MissingKey
                    | TrackingErrorKind::InvalidState
            ),
            Error::Schema(_) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Tracking(e) => write!(f, "Tracking error: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for TrackingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(entity_type) = &self.entity_type {
            write!(f, "{:?} on '{}': {}", self.kind, entity_type, self.message)
        } else {
            write!(f, "{:?}: {}", self.kind, self.message)
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<TrackingError> for Error {
    fn from(err: TrackingError) -> Self {
        Error::Tracking(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

/// Result type alias for entrack operations.
pub type Result<T> = std::result::Result<T, Error>;
