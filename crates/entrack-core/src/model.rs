//! The read-only relationship model.
//!
//! A [`RelationshipModel`] describes every entity type the session can
//! track: its properties (including shadow properties that only exist in
//! tracking storage), its primary key, and the navigations that pair it with
//! other types through foreign keys or many-to-many joins. The model is
//! assembled once with [`ModelBuilder`] and shared immutably afterwards.
//!
//! # Example
//!
//! ```
//! use entrack_core::model::{EntityTypeBuilder, ModelBuilder};
//! use entrack_core::relationship::ForeignKeyBuilder;
//!
//! let model = ModelBuilder::new()
//!     .entity(EntityTypeBuilder::new("Parent").generated_key("Id"))
//!     .entity(
//!         EntityTypeBuilder::new("Child")
//!             .generated_key("Id")
//!             .property("ParentId"),
//!     )
//!     .foreign_key(
//!         ForeignKeyBuilder::new("Parent", "Child", &["ParentId"])
//!             .principal_navigation("Children")
//!             .dependent_navigation("Parent"),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let parent = model.find_entity_type("Parent").unwrap();
//! assert!(parent.find_navigation("Children").unwrap().is_collection());
//! ```

use crate::error::{Error, Result, SchemaErrorKind, TrackingErrorKind};
use crate::relationship::{
    DeleteBehavior, ForeignKey, ForeignKeyBuilder, ForeignKeyId, JoinSide, ManyToMany,
    ManyToManyBuilder, ManyToManyId, NavigationId, NavigationInfo, NavigationKind,
    NavigationRole,
};
use std::collections::HashMap;

/// Identifies an entity type within a relationship model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityTypeId(pub usize);

impl EntityTypeId {
    /// Position of the entity type in the model.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Where a property's value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyStorage {
    /// Slot in the entity instance.
    Field(usize),
    /// Slot in the tracking entry; absent while the entity is detached.
    Shadow(usize),
}

/// A resolved scalar property.
#[derive(Debug, Clone)]
pub struct PropertyInfo {
    /// Property name, unique within the type.
    pub name: String,
    /// Position within the type's property list.
    pub index: usize,
    /// Storage slot.
    pub storage: PropertyStorage,
    /// Whether the property accepts NULL.
    pub nullable: bool,
    /// Whether the store generates the value on insert.
    pub value_generated: bool,
    /// Whether the property is part of the primary key.
    pub is_key: bool,
}

impl PropertyInfo {
    /// Whether the property is a shadow property.
    pub fn is_shadow(&self) -> bool {
        matches!(self.storage, PropertyStorage::Shadow(_))
    }
}

/// Declaration of a single property.
#[derive(Debug, Clone)]
pub struct PropertyDef {
    name: String,
    shadow: bool,
    nullable: bool,
    generated: bool,
}

impl PropertyDef {
    /// A non-nullable, caller-assigned property.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            shadow: false,
            nullable: false,
            generated: false,
        }
    }

    /// Store the value in the tracking entry instead of the instance.
    #[must_use]
    pub fn shadow(mut self) -> Self {
        self.shadow = true;
        self
    }

    /// Allow NULL.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// The store generates the value on insert.
    #[must_use]
    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }
}

/// Declares an entity type.
#[derive(Debug, Clone)]
pub struct EntityTypeBuilder {
    name: String,
    properties: Vec<PropertyDef>,
    key: Vec<String>,
}

impl EntityTypeBuilder {
    /// Start declaring an entity type.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            properties: Vec::new(),
            key: Vec::new(),
        }
    }

    /// Add a property declaration.
    #[must_use]
    pub fn with(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    /// Add a non-nullable property.
    #[must_use]
    pub fn property(self, name: &str) -> Self {
        self.with(PropertyDef::new(name))
    }

    /// Add a nullable property.
    #[must_use]
    pub fn nullable(self, name: &str) -> Self {
        self.with(PropertyDef::new(name).nullable())
    }

    /// Add a shadow property.
    #[must_use]
    pub fn shadow(self, name: &str, nullable: bool) -> Self {
        let def = PropertyDef::new(name).shadow();
        self.with(if nullable { def.nullable() } else { def })
    }

    /// Add a store-generated single-property key.
    #[must_use]
    pub fn generated_key(self, name: &str) -> Self {
        self.with(PropertyDef::new(name).generated()).key(&[name])
    }

    /// Set the primary key from declared properties.
    #[must_use]
    pub fn key(mut self, names: &[&str]) -> Self {
        self.key = names.iter().map(|n| (*n).to_string()).collect();
        self
    }
}

/// A resolved entity type.
#[derive(Debug, Clone)]
pub struct EntityType {
    /// Position in the model.
    pub id: EntityTypeId,
    /// Type name.
    pub name: String,
    properties: Vec<PropertyInfo>,
    key: Vec<usize>,
    navigations: Vec<NavigationInfo>,
    property_index: HashMap<String, usize>,
    navigation_index: HashMap<String, NavigationId>,
    field_count: usize,
    shadow_count: usize,
    join_of: Option<ManyToManyId>,
}

impl EntityType {
    /// All properties in declaration order.
    pub fn properties(&self) -> &[PropertyInfo] {
        &self.properties
    }

    /// Property by position.
    pub fn property(&self, index: usize) -> &PropertyInfo {
        &self.properties[index]
    }

    /// Property by name.
    pub fn find_property(&self, name: &str) -> Option<&PropertyInfo> {
        self.property_index.get(name).map(|&i| &self.properties[i])
    }

    /// Property by name, or an `UnknownProperty` error.
    pub fn property_by_name(&self, name: &str) -> Result<&PropertyInfo> {
        self.find_property(name).ok_or_else(|| {
            Error::tracking_for(
                TrackingErrorKind::UnknownProperty,
                &self.name,
                format!("no property named '{}'", name),
            )
        })
    }

    /// Key property positions.
    pub fn key(&self) -> &[usize] {
        &self.key
    }

    /// Whether the key is a single store-generated property.
    pub fn has_generated_key(&self) -> bool {
        self.key.len() == 1 && self.properties[self.key[0]].value_generated
    }

    /// All navigations in declaration order.
    pub fn navigations(&self) -> &[NavigationInfo] {
        &self.navigations
    }

    /// Navigation by id.
    pub fn navigation(&self, id: NavigationId) -> &NavigationInfo {
        &self.navigations[id.0]
    }

    /// Navigation by name.
    pub fn find_navigation(&self, name: &str) -> Option<&NavigationInfo> {
        self.navigation_index
            .get(name)
            .map(|id| &self.navigations[id.0])
    }

    /// Navigation by name, or an `UnknownNavigation` error.
    pub fn navigation_by_name(&self, name: &str) -> Result<&NavigationInfo> {
        self.find_navigation(name).ok_or_else(|| {
            Error::tracking_for(
                TrackingErrorKind::UnknownNavigation,
                &self.name,
                format!("no navigation named '{}'", name),
            )
        })
    }

    /// Number of instance slots.
    pub fn field_count(&self) -> usize {
        self.field_count
    }

    /// Number of shadow slots.
    pub fn shadow_count(&self) -> usize {
        self.shadow_count
    }

    /// The many-to-many association this type joins, if any.
    pub fn join_of(&self) -> Option<ManyToManyId> {
        self.join_of
    }
}

/// Assembles a [`RelationshipModel`].
#[derive(Debug, Clone, Default)]
pub struct ModelBuilder {
    entities: Vec<EntityTypeBuilder>,
    foreign_keys: Vec<ForeignKeyBuilder>,
    many_to_many: Vec<ManyToManyBuilder>,
}

impl ModelBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an entity type.
    #[must_use]
    pub fn entity(mut self, entity: EntityTypeBuilder) -> Self {
        self.entities.push(entity);
        self
    }

    /// Declare a one-to-many or one-to-one association.
    #[must_use]
    pub fn foreign_key(mut self, fk: ForeignKeyBuilder) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Declare a many-to-many association.
    #[must_use]
    pub fn many_to_many(mut self, m2m: ManyToManyBuilder) -> Self {
        self.many_to_many.push(m2m);
        self
    }

    /// Resolve names, synthesize join types and validate the model.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn build(self) -> Result<RelationshipModel> {
        let mut model = RelationshipModel::default();

        for entity in &self.entities {
            model.add_entity_type(entity)?;
        }

        let mut join_types = Vec::with_capacity(self.many_to_many.len());
        for m2m in &self.many_to_many {
            let join = match &m2m.join {
                Some(join) => join.clone(),
                None => model.synthesize_join_type(m2m)?,
            };
            join_types.push(join);
        }

        for fk in &self.foreign_keys {
            let principal = model.type_id(&fk.principal)?;
            let dependent = model.type_id(&fk.dependent)?;
            let properties: Vec<&str> = fk.properties.iter().map(String::as_str).collect();
            let props = model.resolve_fk_properties(principal, dependent, &properties)?;
            let is_required = fk.required.unwrap_or_else(|| {
                props
                    .iter()
                    .all(|&p| !model.entity_types[dependent.0].properties[p].nullable)
            });
            let delete_behavior = fk.delete_behavior.unwrap_or(if is_required {
                DeleteBehavior::Cascade
            } else {
                DeleteBehavior::ClientSetNull
            });
            if is_required && delete_behavior == DeleteBehavior::SetNull {
                return Err(Error::schema(
                    SchemaErrorKind::Invalid,
                    format!(
                        "required foreign key {}.{:?} cannot use SetNull",
                        fk.dependent, fk.properties
                    ),
                ));
            }
            let id = model.push_foreign_key(ForeignKey {
                id: ForeignKeyId(model.foreign_keys.len()),
                principal_type: principal,
                dependent_type: dependent,
                properties: props,
                is_required,
                is_unique: fk.unique,
                delete_behavior,
                principal_navigation: None,
                dependent_navigation: None,
                join_of: None,
            });
            model.add_foreign_key_navigations(
                id,
                fk.principal_navigation.as_deref(),
                fk.dependent_navigation.as_deref(),
            )?;
        }

        for (m2m, join) in self.many_to_many.iter().zip(join_types) {
            model.add_many_to_many(m2m, &join)?;
        }

        tracing::debug!(
            entity_types = model.entity_types.len(),
            foreign_keys = model.foreign_keys.len(),
            many_to_many = model.many_to_many.len(),
            "Relationship model built"
        );
        Ok(model)
    }
}

/// The read-only description of all entity types and associations.
#[derive(Debug, Clone, Default)]
pub struct RelationshipModel {
    entity_types: Vec<EntityType>,
    type_index: HashMap<String, EntityTypeId>,
    foreign_keys: Vec<ForeignKey>,
    many_to_many: Vec<ManyToMany>,
    principal_of: Vec<Vec<ForeignKeyId>>,
    dependent_of: Vec<Vec<ForeignKeyId>>,
}

impl RelationshipModel {
    /// All entity types.
    pub fn entity_types(&self) -> &[EntityType] {
        &self.entity_types
    }

    /// Entity type by id.
    pub fn entity_type(&self, id: EntityTypeId) -> &EntityType {
        &self.entity_types[id.0]
    }

    /// Entity type by name.
    pub fn find_entity_type(&self, name: &str) -> Option<&EntityType> {
        self.type_index.get(name).map(|id| &self.entity_types[id.0])
    }

    /// Entity type by name, or an `UnknownEntity` error.
    pub fn entity_type_by_name(&self, name: &str) -> Result<&EntityType> {
        self.find_entity_type(name).ok_or_else(|| {
            Error::tracking(
                TrackingErrorKind::UnknownEntity,
                format!("entity type '{}' is not part of the model", name),
            )
        })
    }

    /// Foreign key by id.
    pub fn foreign_key(&self, id: ForeignKeyId) -> &ForeignKey {
        &self.foreign_keys[id.0]
    }

    /// All foreign keys.
    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    /// Many-to-many association by id.
    pub fn many_to_many(&self, id: ManyToManyId) -> &ManyToMany {
        &self.many_to_many[id.0]
    }

    /// Foreign keys in which the type is the principal.
    pub fn foreign_keys_to(&self, principal: EntityTypeId) -> &[ForeignKeyId] {
        &self.principal_of[principal.0]
    }

    /// Foreign keys declared on the type as dependent.
    pub fn foreign_keys_from(&self, dependent: EntityTypeId) -> &[ForeignKeyId] {
        &self.dependent_of[dependent.0]
    }

    /// Navigation on a type by id.
    pub fn navigation(&self, entity_type: EntityTypeId, id: NavigationId) -> &NavigationInfo {
        self.entity_types[entity_type.0].navigation(id)
    }

    /// The paired navigation on the other side, if declared.
    pub fn inverse(&self, navigation: &NavigationInfo) -> Option<&NavigationInfo> {
        navigation
            .inverse
            .map(|id| self.navigation(navigation.target_type, id))
    }

    /// Whether any foreign-key property is a shadow property.
    pub fn has_shadow_properties(&self, fk: ForeignKeyId) -> bool {
        let fk = self.foreign_key(fk);
        let dependent = self.entity_type(fk.dependent_type);
        fk.properties
            .iter()
            .any(|&p| dependent.property(p).is_shadow())
    }

    fn type_id(&self, name: &str) -> Result<EntityTypeId> {
        self.type_index.get(name).copied().ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::EntityNotFound,
                format!("entity type '{}' is not declared", name),
            )
        })
    }

    fn add_entity_type(&mut self, entity: &EntityTypeBuilder) -> Result<EntityTypeId> {
        if self.type_index.contains_key(&entity.name) {
            return Err(Error::schema(
                SchemaErrorKind::DuplicateEntity,
                format!("entity type '{}' declared twice", entity.name),
            ));
        }
        let id = EntityTypeId(self.entity_types.len());
        let mut properties = Vec::with_capacity(entity.properties.len());
        let mut property_index = HashMap::new();
        let (mut field_count, mut shadow_count) = (0, 0);
        for def in &entity.properties {
            if property_index.contains_key(&def.name) {
                return Err(Error::schema(
                    SchemaErrorKind::Property,
                    format!("property '{}.{}' declared twice", entity.name, def.name),
                ));
            }
            let storage = if def.shadow {
                shadow_count += 1;
                PropertyStorage::Shadow(shadow_count - 1)
            } else {
                field_count += 1;
                PropertyStorage::Field(field_count - 1)
            };
            property_index.insert(def.name.clone(), properties.len());
            properties.push(PropertyInfo {
                name: def.name.clone(),
                index: properties.len(),
                storage,
                nullable: def.nullable,
                value_generated: def.generated,
                is_key: false,
            });
        }

        if entity.key.is_empty() {
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                format!("entity type '{}' has no key", entity.name),
            ));
        }
        let mut key = Vec::with_capacity(entity.key.len());
        for name in &entity.key {
            let index = *property_index.get(name).ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::Property,
                    format!("key property '{}.{}' is not declared", entity.name, name),
                )
            })?;
            properties[index].is_key = true;
            properties[index].nullable = false;
            key.push(index);
        }

        self.type_index.insert(entity.name.clone(), id);
        self.entity_types.push(EntityType {
            id,
            name: entity.name.clone(),
            properties,
            key,
            navigations: Vec::new(),
            property_index,
            navigation_index: HashMap::new(),
            field_count,
            shadow_count,
            join_of: None,
        });
        self.principal_of.push(Vec::new());
        self.dependent_of.push(Vec::new());
        Ok(id)
    }

    /// Declare a property-bag join type keyed by both foreign-key sets.
    fn synthesize_join_type(
        &mut self,
        m2m: &ManyToManyBuilder,
    ) -> Result<crate::relationship::JoinTypeSpec> {
        let left = self.entity_type(self.type_id(&m2m.left)?).clone();
        let right = self.entity_type(self.type_id(&m2m.right)?).clone();

        let mut name = format!("{}{}", left.name, right.name);
        if self.type_index.contains_key(&name) {
            name = format!("{}{}{}", left.name, m2m.left_navigation, right.name);
        }

        let key_names = |prefix: &str, ty: &EntityType| -> Vec<String> {
            ty.key()
                .iter()
                .map(|&k| format!("{}{}", prefix, ty.property(k).name))
                .collect()
        };
        let mut left_properties = key_names(&left.name, &left);
        let mut right_properties = key_names(&right.name, &right);
        if left_properties == right_properties {
            let inverse = m2m
                .right_navigation
                .clone()
                .unwrap_or_else(|| format!("Inverse{}", m2m.left_navigation));
            left_properties = key_names(&inverse, &left);
            right_properties = key_names(&m2m.left_navigation, &right);
        }

        let all: Vec<&str> = left_properties
            .iter()
            .chain(&right_properties)
            .map(String::as_str)
            .collect();
        let mut join = EntityTypeBuilder::new(&name);
        for property in &all {
            join = join.property(property);
        }
        self.add_entity_type(&join.key(&all))?;
        tracing::trace!(join_type = %name, "Synthesized join entity type");

        Ok(crate::relationship::JoinTypeSpec {
            name,
            left_properties,
            right_properties,
        })
    }

    fn resolve_fk_properties(
        &self,
        principal: EntityTypeId,
        dependent: EntityTypeId,
        names: &[&str],
    ) -> Result<Vec<usize>> {
        let principal_type = self.entity_type(principal);
        let dependent_type = self.entity_type(dependent);
        if names.len() != principal_type.key().len() {
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                format!(
                    "foreign key {}.{:?} has {} properties but the key of '{}' has {}",
                    dependent_type.name,
                    names,
                    names.len(),
                    principal_type.name,
                    principal_type.key().len()
                ),
            ));
        }
        names
            .iter()
            .map(|name| {
                dependent_type
                    .find_property(name)
                    .map(|p| p.index)
                    .ok_or_else(|| {
                        Error::schema(
                            SchemaErrorKind::Property,
                            format!(
                                "foreign key property '{}.{}' is not declared",
                                dependent_type.name, name
                            ),
                        )
                    })
            })
            .collect()
    }

    fn push_foreign_key(&mut self, fk: ForeignKey) -> ForeignKeyId {
        let id = fk.id;
        self.principal_of[fk.principal_type.0].push(id);
        self.dependent_of[fk.dependent_type.0].push(id);
        self.foreign_keys.push(fk);
        id
    }

    fn add_navigation(
        &mut self,
        declaring: EntityTypeId,
        name: &str,
        target: EntityTypeId,
        kind: NavigationKind,
        role: NavigationRole,
    ) -> Result<NavigationId> {
        let ty = &mut self.entity_types[declaring.0];
        if ty.navigation_index.contains_key(name) || ty.property_index.contains_key(name) {
            return Err(Error::schema(
                SchemaErrorKind::DuplicateNavigation,
                format!("'{}.{}' is already declared", ty.name, name),
            ));
        }
        let id = NavigationId(ty.navigations.len());
        ty.navigation_index.insert(name.to_string(), id);
        ty.navigations.push(NavigationInfo {
            name: name.to_string(),
            id,
            declaring_type: declaring,
            target_type: target,
            kind,
            role,
            inverse: None,
        });
        Ok(id)
    }

    fn pair_navigations(
        &mut self,
        a: (EntityTypeId, Option<NavigationId>),
        b: (EntityTypeId, Option<NavigationId>),
    ) {
        if let (Some(a_nav), Some(b_nav)) = (a.1, b.1) {
            self.entity_types[a.0.0].navigations[a_nav.0].inverse = Some(b_nav);
            self.entity_types[b.0.0].navigations[b_nav.0].inverse = Some(a_nav);
        }
    }

    fn add_foreign_key_navigations(
        &mut self,
        id: ForeignKeyId,
        principal_navigation: Option<&str>,
        dependent_navigation: Option<&str>,
    ) -> Result<()> {
        let (principal, dependent, unique) = {
            let fk = &self.foreign_keys[id.0];
            (fk.principal_type, fk.dependent_type, fk.is_unique)
        };
        let principal_nav = match principal_navigation {
            Some(name) => Some(self.add_navigation(
                principal,
                name,
                dependent,
                if unique {
                    NavigationKind::Reference
                } else {
                    NavigationKind::Collection
                },
                NavigationRole::Principal(id),
            )?),
            None => None,
        };
        let dependent_nav = match dependent_navigation {
            Some(name) => Some(self.add_navigation(
                dependent,
                name,
                principal,
                NavigationKind::Reference,
                NavigationRole::Dependent(id),
            )?),
            None => None,
        };
        self.pair_navigations((principal, principal_nav), (dependent, dependent_nav));
        let fk = &mut self.foreign_keys[id.0];
        fk.principal_navigation = principal_nav;
        fk.dependent_navigation = dependent_nav;
        Ok(())
    }

    fn add_many_to_many(
        &mut self,
        m2m: &ManyToManyBuilder,
        join: &crate::relationship::JoinTypeSpec,
    ) -> Result<()> {
        let id = ManyToManyId(self.many_to_many.len());
        let left = self.type_id(&m2m.left)?;
        let right = self.type_id(&m2m.right)?;
        let join_type = self.type_id(&join.name)?;
        if self.entity_types[join_type.0].join_of.is_some() {
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                format!("'{}' already joins another association", join.name),
            ));
        }

        let mut fk_ids = [ForeignKeyId(0); 2];
        for (slot, (side, principal, names)) in [
            (JoinSide::Left, left, &join.left_properties),
            (JoinSide::Right, right, &join.right_properties),
        ]
        .into_iter()
        .enumerate()
        {
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            let properties = self.resolve_fk_properties(principal, join_type, &names)?;
            fk_ids[slot] = self.push_foreign_key(ForeignKey {
                id: ForeignKeyId(self.foreign_keys.len()),
                principal_type: principal,
                dependent_type: join_type,
                properties,
                is_required: true,
                is_unique: false,
                delete_behavior: DeleteBehavior::Cascade,
                principal_navigation: None,
                dependent_navigation: None,
                join_of: Some((id, side)),
            });
        }

        let left_navigation = self.add_navigation(
            left,
            &m2m.left_navigation,
            right,
            NavigationKind::Collection,
            NavigationRole::ManyToMany {
                association: id,
                side: JoinSide::Left,
            },
        )?;
        let right_navigation = match &m2m.right_navigation {
            Some(name) => Some(self.add_navigation(
                right,
                name,
                left,
                NavigationKind::Collection,
                NavigationRole::ManyToMany {
                    association: id,
                    side: JoinSide::Right,
                },
            )?),
            None => None,
        };
        self.pair_navigations((left, Some(left_navigation)), (right, right_navigation));
        self.entity_types[join_type.0].join_of = Some(id);

        self.many_to_many.push(ManyToMany {
            id,
            left_type: left,
            right_type: right,
            left_navigation,
            right_navigation,
            join_type,
            left_foreign_key: fk_ids[0],
            right_foreign_key: fk_ids[1],
            synthesized: m2m.join.is_none(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blog_model() -> RelationshipModel {
        ModelBuilder::new()
            .entity(EntityTypeBuilder::new("Blog").generated_key("Id").property("Name"))
            .entity(
                EntityTypeBuilder::new("Post")
                    .generated_key("Id")
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
            .unwrap()
    }

    #[test]
    fn test_navigations_are_paired() {
        let model = blog_model();
        let blog = model.find_entity_type("Blog").unwrap();
        let posts = blog.find_navigation("Posts").unwrap();
        assert!(posts.is_collection());
        let inverse = model.inverse(posts).unwrap();
        assert_eq!(inverse.name, "Blog");
        assert_eq!(inverse.kind, NavigationKind::Reference);
    }

    #[test]
    fn test_optional_fk_defaults_to_client_set_null() {
        let model = blog_model();
        let fk = &model.foreign_keys()[0];
        assert!(!fk.is_required);
        assert_eq!(fk.delete_behavior, DeleteBehavior::ClientSetNull);
        assert!(model.has_shadow_properties(fk.id));
    }

    #[test]
    fn test_synthesized_join_type() {
        let model = blog_model();
        let join = model.find_entity_type("PostTag").unwrap();
        let names: Vec<&str> = join.properties().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["PostId", "TagId"]);
        assert_eq!(join.key(), &[0, 1]);
        let m2m = model.many_to_many(join.join_of().unwrap());
        assert!(m2m.synthesized);
        assert_eq!(model.foreign_key(m2m.left_foreign_key).principal_type, m2m.left_type);
        assert!(model.foreign_key(m2m.right_foreign_key).is_required);
    }

    #[test]
    fn test_self_referencing_join_property_names() {
        let model = ModelBuilder::new()
            .entity(EntityTypeBuilder::new("Person").generated_key("Id"))
            .many_to_many(ManyToManyBuilder::new("Person", "Friends", "Person").inverse("FriendOf"))
            .build()
            .unwrap();
        let join = model.find_entity_type("PersonPerson").unwrap();
        let names: Vec<&str> = join.properties().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["FriendOfId", "FriendsId"]);
    }

    #[test]
    fn test_rejects_set_null_on_required() {
        let err = ModelBuilder::new()
            .entity(EntityTypeBuilder::new("Parent").generated_key("Id"))
            .entity(EntityTypeBuilder::new("Child").generated_key("Id").property("ParentId"))
            .foreign_key(
                ForeignKeyBuilder::new("Parent", "Child", &["ParentId"])
                    .delete_behavior(DeleteBehavior::SetNull),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Schema(ref s) if s.kind == SchemaErrorKind::Invalid));
    }

    #[test]
    fn test_rejects_missing_key_and_unknown_types() {
        let err = ModelBuilder::new()
            .entity(EntityTypeBuilder::new("Keyless").property("Name"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));

        let err = ModelBuilder::new()
            .entity(EntityTypeBuilder::new("Child").generated_key("Id").property("ParentId"))
            .foreign_key(ForeignKeyBuilder::new("Parent", "Child", &["ParentId"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Schema(ref s) if s.kind == SchemaErrorKind::EntityNotFound));
    }

    #[test]
    fn test_unknown_lookups_are_tracking_errors() {
        let model = blog_model();
        let err = model.entity_type_by_name("Nope").unwrap_err();
        assert_eq!(err.tracking_kind(), Some(TrackingErrorKind::UnknownEntity));
        let blog = model.find_entity_type("Blog").unwrap();
        let err = blog.navigation_by_name("Nope").unwrap_err();
        assert_eq!(err.tracking_kind(), Some(TrackingErrorKind::UnknownNavigation));
        assert!(blog.property_by_name("Name").is_ok());
    }

    #[test]
    fn test_storage_slots() {
        let model = blog_model();
        let post = model.find_entity_type("Post").unwrap();
        assert_eq!(post.field_count(), 1);
        assert_eq!(post.shadow_count(), 1);
        assert_eq!(
            post.find_property("BlogId").unwrap().storage,
            PropertyStorage::Shadow(0)
        );
        assert!(post.has_generated_key());
    }
}
