//! Association metadata: foreign keys, navigations and many-to-many joins.
//!
//! Associations are declared with [`ForeignKeyBuilder`] and
//! [`ManyToManyBuilder`] and resolved into the read-only
//! [`RelationshipModel`](crate::model::RelationshipModel) by
//! [`ModelBuilder::build`](crate::model::ModelBuilder::build). Once built,
//! every navigation knows which association it belongs to and which
//! navigation on the other side is its inverse.

use crate::model::EntityTypeId;

/// Identifies a foreign key within a relationship model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForeignKeyId(pub(crate) usize);

impl ForeignKeyId {
    /// Position of the foreign key in the model.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Identifies a many-to-many association within a relationship model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManyToManyId(pub(crate) usize);

impl ManyToManyId {
    /// Position of the association in the model.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Identifies a navigation within its declaring entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NavigationId(pub(crate) usize);

impl NavigationId {
    /// Position of the navigation in its declaring type.
    pub fn index(self) -> usize {
        self.0
    }
}

/// What happens to tracked dependents when their principal is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteBehavior {
    /// Delete the dependents too.
    Cascade,
    /// Null the foreign key; the store does the same.
    SetNull,
    /// Null the foreign key of tracked dependents; the store is left alone.
    ClientSetNull,
    /// Refuse to save while tracked dependents still reference the principal.
    Restrict,
    /// Leave tracked dependents untouched.
    NoAction,
}

impl DeleteBehavior {
    /// Whether this behavior nulls the foreign key of tracked dependents.
    pub const fn sets_null(self) -> bool {
        matches!(self, DeleteBehavior::SetNull | DeleteBehavior::ClientSetNull)
    }
}

/// Shape of a navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationKind {
    /// Holds at most one related entity.
    Reference,
    /// Holds a set of related entities.
    Collection,
}

/// Side of a many-to-many association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinSide {
    /// The side that declared the association.
    Left,
    /// The other side.
    Right,
}

impl JoinSide {
    /// The opposite side.
    pub const fn other(self) -> Self {
        match self {
            JoinSide::Left => JoinSide::Right,
            JoinSide::Right => JoinSide::Left,
        }
    }
}

/// Which end of which association a navigation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationRole {
    /// Reference from a dependent to its principal.
    Dependent(ForeignKeyId),
    /// Collection (or unique reference) from a principal to its dependents.
    Principal(ForeignKeyId),
    /// Collection on one side of a many-to-many association.
    ManyToMany {
        /// The association.
        association: ManyToManyId,
        /// Which side declares this navigation.
        side: JoinSide,
    },
}

/// A resolved navigation.
#[derive(Debug, Clone)]
pub struct NavigationInfo {
    /// Navigation name, unique within the declaring type.
    pub name: String,
    /// Position within the declaring type.
    pub id: NavigationId,
    /// Type that declares the navigation.
    pub declaring_type: EntityTypeId,
    /// Type the navigation points at.
    pub target_type: EntityTypeId,
    /// Reference or collection.
    pub kind: NavigationKind,
    /// Association end.
    pub role: NavigationRole,
    /// Paired navigation on the target type, if declared.
    pub inverse: Option<NavigationId>,
}

impl NavigationInfo {
    /// Whether this is a collection navigation.
    pub fn is_collection(&self) -> bool {
        self.kind == NavigationKind::Collection
    }
}

/// A resolved foreign key between a principal and a dependent type.
#[derive(Debug, Clone)]
pub struct ForeignKey {
    /// Position in the model.
    pub id: ForeignKeyId,
    /// Principal (referenced) type.
    pub principal_type: EntityTypeId,
    /// Dependent (referencing) type.
    pub dependent_type: EntityTypeId,
    /// Foreign-key properties on the dependent, in principal-key order.
    pub properties: Vec<usize>,
    /// Whether the foreign key may not be null.
    pub is_required: bool,
    /// One-to-one: at most one dependent per principal.
    pub is_unique: bool,
    /// What happens to dependents when the principal is deleted.
    pub delete_behavior: DeleteBehavior,
    /// Navigation on the principal pointing at dependents.
    pub principal_navigation: Option<NavigationId>,
    /// Navigation on the dependent pointing at the principal.
    pub dependent_navigation: Option<NavigationId>,
    /// The many-to-many association this foreign key belongs to, for join types.
    pub join_of: Option<(ManyToManyId, JoinSide)>,
}

/// A resolved many-to-many association mediated by a join entity type.
#[derive(Debug, Clone)]
pub struct ManyToMany {
    /// Position in the model.
    pub id: ManyToManyId,
    /// Left entity type.
    pub left_type: EntityTypeId,
    /// Right entity type.
    pub right_type: EntityTypeId,
    /// Collection navigation on the left type.
    pub left_navigation: NavigationId,
    /// Collection navigation on the right type, if the association is bidirectional.
    pub right_navigation: Option<NavigationId>,
    /// Join entity type.
    pub join_type: EntityTypeId,
    /// Foreign key from the join type to the left type.
    pub left_foreign_key: ForeignKeyId,
    /// Foreign key from the join type to the right type.
    pub right_foreign_key: ForeignKeyId,
    /// Whether the join type was synthesized as a property bag.
    pub synthesized: bool,
}

impl ManyToMany {
    /// Entity type on the given side.
    pub fn entity_type(&self, side: JoinSide) -> EntityTypeId {
        match side {
            JoinSide::Left => self.left_type,
            JoinSide::Right => self.right_type,
        }
    }

    /// Collection navigation on the given side.
    pub fn navigation(&self, side: JoinSide) -> Option<NavigationId> {
        match side {
            JoinSide::Left => Some(self.left_navigation),
            JoinSide::Right => self.right_navigation,
        }
    }

    /// Join-type foreign key pointing at the given side.
    pub fn foreign_key(&self, side: JoinSide) -> ForeignKeyId {
        match side {
            JoinSide::Left => self.left_foreign_key,
            JoinSide::Right => self.right_foreign_key,
        }
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Declares a one-to-many (or one-to-one) association.
#[derive(Debug, Clone)]
pub struct ForeignKeyBuilder {
    pub(crate) principal: String,
    pub(crate) dependent: String,
    pub(crate) properties: Vec<String>,
    pub(crate) principal_navigation: Option<String>,
    pub(crate) dependent_navigation: Option<String>,
    pub(crate) required: Option<bool>,
    pub(crate) unique: bool,
    pub(crate) delete_behavior: Option<DeleteBehavior>,
}

impl ForeignKeyBuilder {
    /// Foreign key from `dependent.properties` to the primary key of `principal`.
    pub fn new(principal: &str, dependent: &str, properties: &[&str]) -> Self {
        Self {
            principal: principal.to_string(),
            dependent: dependent.to_string(),
            properties: properties.iter().map(|p| (*p).to_string()).collect(),
            principal_navigation: None,
            dependent_navigation: None,
            required: None,
            unique: false,
            delete_behavior: None,
        }
    }

    /// Name the navigation on the principal (a collection unless [`unique`](Self::unique)).
    #[must_use]
    pub fn principal_navigation(mut self, name: &str) -> Self {
        self.principal_navigation = Some(name.to_string());
        self
    }

    /// Name the reference navigation on the dependent.
    #[must_use]
    pub fn dependent_navigation(mut self, name: &str) -> Self {
        self.dependent_navigation = Some(name.to_string());
        self
    }

    /// Override requiredness; by default it follows the nullability of the
    /// foreign-key properties.
    #[must_use]
    pub fn required(mut self, value: bool) -> Self {
        self.required = Some(value);
        self
    }

    /// Make the association one-to-one.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Set the delete behavior; defaults to `Cascade` for required
    /// associations and `ClientSetNull` for optional ones.
    #[must_use]
    pub fn delete_behavior(mut self, behavior: DeleteBehavior) -> Self {
        self.delete_behavior = Some(behavior);
        self
    }
}

/// Declares a many-to-many association.
#[derive(Debug, Clone)]
pub struct ManyToManyBuilder {
    pub(crate) left: String,
    pub(crate) left_navigation: String,
    pub(crate) right: String,
    pub(crate) right_navigation: Option<String>,
    pub(crate) join: Option<JoinTypeSpec>,
}

#[derive(Debug, Clone)]
pub(crate) struct JoinTypeSpec {
    pub(crate) name: String,
    pub(crate) left_properties: Vec<String>,
    pub(crate) right_properties: Vec<String>,
}

impl ManyToManyBuilder {
    /// `left.left_navigation` holds a collection of `right` entities.
    pub fn new(left: &str, left_navigation: &str, right: &str) -> Self {
        Self {
            left: left.to_string(),
            left_navigation: left_navigation.to_string(),
            right: right.to_string(),
            right_navigation: None,
            join: None,
        }
    }

    /// Name the inverse collection on the right type.
    #[must_use]
    pub fn inverse(mut self, name: &str) -> Self {
        self.right_navigation = Some(name.to_string());
        self
    }

    /// Use a declared entity type as the join type instead of synthesizing one.
    #[must_use]
    pub fn using(
        mut self,
        join_type: &str,
        left_properties: &[&str],
        right_properties: &[&str],
    ) -> Self {
        self.join = Some(JoinTypeSpec {
            name: join_type.to_string(),
            left_properties: left_properties.iter().map(|p| (*p).to_string()).collect(),
            right_properties: right_properties.iter().map(|p| (*p).to_string()).collect(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreign_key_builder_defaults() {
        let fk = ForeignKeyBuilder::new("Parent", "Child", &["ParentId"]);
        assert_eq!(fk.properties, vec!["ParentId".to_string()]);
        assert!(fk.required.is_none());
        assert!(fk.delete_behavior.is_none());
        assert!(!fk.unique);
    }

    #[test]
    fn test_foreign_key_builder_chain() {
        let fk = ForeignKeyBuilder::new("Parent", "Child", &["ParentId"])
            .principal_navigation("Children")
            .dependent_navigation("Parent")
            .required(true)
            .delete_behavior(DeleteBehavior::Restrict);
        assert_eq!(fk.principal_navigation.as_deref(), Some("Children"));
        assert_eq!(fk.dependent_navigation.as_deref(), Some("Parent"));
        assert_eq!(fk.required, Some(true));
        assert_eq!(fk.delete_behavior, Some(DeleteBehavior::Restrict));
    }

    #[test]
    fn test_many_to_many_builder() {
        let m2m = ManyToManyBuilder::new("Post", "Tags", "Tag")
            .inverse("Posts")
            .using("PostTag", &["PostId"], &["TagId"]);
        assert_eq!(m2m.right_navigation.as_deref(), Some("Posts"));
        let join = m2m.join.expect("join type");
        assert_eq!(join.name, "PostTag");
        assert_eq!(join.right_properties, vec!["TagId".to_string()]);
    }

    #[test]
    fn test_delete_behavior_sets_null() {
        assert!(DeleteBehavior::SetNull.sets_null());
        assert!(DeleteBehavior::ClientSetNull.sets_null());
        assert!(!DeleteBehavior::Cascade.sets_null());
        assert_eq!(JoinSide::Left.other(), JoinSide::Right);
    }
}
