//! Static entity metadata and the registry that validates it.
//!
//! Entity types are declared once, as `static` descriptors built with const
//! builder methods, and registered in an [`EntityRegistry`] at startup:
//!
//! ```ignore
//! static PARENT: EntityDescriptor = EntityDescriptor::new("Parent", "Id", &["Id", "Name"])
//!     .navigations(&[
//!         NavigationInfo::new("Children", "Child", NavigationKind::OneToMany)
//!             .foreign_key("ParentId"),
//!     ]);
//! static CHILD: EntityDescriptor =
//!     EntityDescriptor::new("Child", "Id", &["Id", "Name", "ParentId"]);
//!
//! let registry = EntityRegistry::builder().register(&PARENT).register(&CHILD).build()?;
//! ```

use crate::error::{Error, Result, SchemaErrorKind};
use std::collections::{HashMap, HashSet};

/// The relational shape of a navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NavigationKind {
    /// Single reference; the foreign key lives on the declaring entity.
    ManyToOne,
    /// Single reference; the foreign key lives on the target entity.
    OneToOne,
    /// Collection; the foreign key lives on the target entity.
    OneToMany,
}

/// How many related entities a navigation holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    One,
    Many,
}

/// Metadata about a navigation property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationInfo {
    /// Name of the navigation slot on the declaring entity.
    pub name: &'static str,
    /// Name of the related entity descriptor.
    pub target: &'static str,
    /// Relationship kind.
    pub kind: NavigationKind,
    /// Foreign key field. Declared on this entity for `ManyToOne`, on the
    /// target otherwise.
    pub foreign_key: &'static str,
    /// Loaded with every query unless auto-includes are ignored.
    pub auto_include: bool,
    /// Owned navigations are always loaded with their owner.
    pub owned: bool,
}

impl NavigationInfo {
    /// Create a navigation with no foreign key set yet.
    pub const fn new(name: &'static str, target: &'static str, kind: NavigationKind) -> Self {
        Self {
            name,
            target,
            kind,
            foreign_key: "",
            auto_include: false,
            owned: false,
        }
    }

    /// Set the foreign key field.
    pub const fn foreign_key(mut self, field: &'static str) -> Self {
        self.foreign_key = field;
        self
    }

    /// Load this navigation by default.
    pub const fn auto_include(mut self, value: bool) -> Self {
        self.auto_include = value;
        self
    }

    /// Mark the target as owned by the declaring entity.
    pub const fn owned(mut self, value: bool) -> Self {
        self.owned = value;
        self
    }

    /// Cardinality derived from the kind.
    pub const fn cardinality(&self) -> Cardinality {
        match self.kind {
            NavigationKind::OneToMany => Cardinality::Many,
            NavigationKind::ManyToOne | NavigationKind::OneToOne => Cardinality::One,
        }
    }

    /// Is this a collection navigation?
    pub const fn is_many(&self) -> bool {
        matches!(self.kind, NavigationKind::OneToMany)
    }

    /// Does the foreign key live on the target entity?
    pub const fn key_on_target(&self) -> bool {
        !matches!(self.kind, NavigationKind::ManyToOne)
    }

    /// Is this navigation part of the default load graph?
    pub const fn loads_by_default(&self, ignore_auto_includes: bool) -> bool {
        self.owned || (self.auto_include && !ignore_auto_includes)
    }
}

/// Static metadata for one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDescriptor {
    /// Entity name; also the store's table name.
    pub name: &'static str,
    /// Primary key field.
    pub key: &'static str,
    /// Scalar fields, key included.
    pub fields: &'static [&'static str],
    /// Navigation properties.
    pub navigations: &'static [NavigationInfo],
    /// The store assigns keys when an insert carries a NULL key.
    pub generated_key: bool,
}

impl EntityDescriptor {
    /// Create a descriptor with no navigations.
    pub const fn new(
        name: &'static str,
        key: &'static str,
        fields: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            key,
            fields,
            navigations: &[],
            generated_key: true,
        }
    }

    /// Set the navigation properties.
    pub const fn navigations(mut self, navigations: &'static [NavigationInfo]) -> Self {
        self.navigations = navigations;
        self
    }

    /// Whether the store assigns keys for NULL-keyed inserts.
    pub const fn generated_key(mut self, value: bool) -> Self {
        self.generated_key = value;
        self
    }

    /// Find a navigation by name.
    pub fn navigation(&self, name: &str) -> Option<&'static NavigationInfo> {
        self.navigations.iter().find(|n| n.name == name)
    }

    /// Is `name` a declared scalar field?
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains(&name)
    }

    /// Scalar fields other than the key.
    pub fn value_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().copied().filter(|f| *f != self.key)
    }
}

/// A foreign key column, derived from navigation metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    /// Entity holding the foreign key field.
    pub dependent: &'static str,
    /// The foreign key field on the dependent.
    pub field: &'static str,
    /// Entity whose key the field references.
    pub principal: &'static str,
}

/// Validated set of entity descriptors.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    descriptors: HashMap<&'static str, &'static EntityDescriptor>,
    /// Registration order.
    order: Vec<&'static str>,
    foreign_keys: Vec<ForeignKey>,
    /// Longest chain of principals above each entity.
    depths: HashMap<&'static str, usize>,
}

/// Collects descriptors before validation.
#[derive(Debug, Default)]
pub struct EntityRegistryBuilder {
    descriptors: Vec<&'static EntityDescriptor>,
}

impl EntityRegistryBuilder {
    /// Add a descriptor.
    #[must_use]
    pub fn register(mut self, descriptor: &'static EntityDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Validate the descriptors and build the registry.
    pub fn build(self) -> Result<EntityRegistry> {
        let mut descriptors = HashMap::new();
        let mut order = Vec::new();
        for d in &self.descriptors {
            if descriptors.insert(d.name, *d).is_some() {
                return Err(Error::schema(
                    SchemaErrorKind::Invalid,
                    format!("entity '{}' registered twice", d.name),
                ));
            }
            order.push(d.name);
        }

        let mut foreign_keys: Vec<ForeignKey> = Vec::new();
        for d in &self.descriptors {
            if !d.has_field(d.key) {
                return Err(Error::schema(
                    SchemaErrorKind::Invalid,
                    format!("key '{}' is not a field of '{}'", d.key, d.name),
                ));
            }
            for nav in d.navigations {
                let target = descriptors.get(nav.target).ok_or_else(|| {
                    Error::schema(
                        SchemaErrorKind::UnknownEntity,
                        format!(
                            "navigation '{}.{}' targets unregistered entity '{}'",
                            d.name, nav.name, nav.target
                        ),
                    )
                })?;
                if d.has_field(nav.name) {
                    return Err(Error::schema(
                        SchemaErrorKind::Invalid,
                        format!("'{}.{}' is both a field and a navigation", d.name, nav.name),
                    ));
                }
                let fk = if nav.key_on_target() {
                    ForeignKey {
                        dependent: target.name,
                        field: nav.foreign_key,
                        principal: d.name,
                    }
                } else {
                    ForeignKey {
                        dependent: d.name,
                        field: nav.foreign_key,
                        principal: target.name,
                    }
                };
                let holder = if nav.key_on_target() { *target } else { *d };
                if !holder.has_field(fk.field) {
                    return Err(Error::schema(
                        SchemaErrorKind::Invalid,
                        format!(
                            "foreign key '{}' of navigation '{}.{}' is not a field of '{}'",
                            fk.field, d.name, nav.name, holder.name
                        ),
                    ));
                }
                if !foreign_keys.contains(&fk) {
                    foreign_keys.push(fk);
                }
            }
        }

        let mut registry = EntityRegistry {
            descriptors,
            order,
            foreign_keys,
            depths: HashMap::new(),
        };
        let depths = registry
            .order
            .iter()
            .map(|name| (*name, registry.compute_depth(name, &mut HashSet::new())))
            .collect();
        registry.depths = depths;

        tracing::debug!(
            entities = registry.order.len(),
            foreign_keys = registry.foreign_keys.len(),
            "Entity registry built"
        );
        Ok(registry)
    }
}

impl EntityRegistry {
    /// Start building a registry.
    pub fn builder() -> EntityRegistryBuilder {
        EntityRegistryBuilder::default()
    }

    /// Look up a descriptor by name.
    pub fn get(&self, name: &str) -> Option<&'static EntityDescriptor> {
        self.descriptors.get(name).copied()
    }

    /// Look up a descriptor by name, failing if it is not registered.
    pub fn descriptor(&self, name: &str) -> Result<&'static EntityDescriptor> {
        self.get(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownEntity,
                format!("entity '{}' is not registered", name),
            )
        })
    }

    /// Descriptor reached through a navigation.
    pub fn target_of(&self, navigation: &NavigationInfo) -> Result<&'static EntityDescriptor> {
        self.descriptor(navigation.target)
    }

    /// Registered descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &'static EntityDescriptor> + '_ {
        self.order.iter().filter_map(|name| self.get(name))
    }

    /// Foreign keys held by `dependent`.
    pub fn foreign_keys_of<'a>(&'a self, dependent: &'a str) -> impl Iterator<Item = &'a ForeignKey> {
        self.foreign_keys
            .iter()
            .filter(move |fk| fk.dependent == dependent)
    }

    /// Foreign keys referencing `principal`.
    pub fn references_to<'a>(&'a self, principal: &'a str) -> impl Iterator<Item = &'a ForeignKey> {
        self.foreign_keys
            .iter()
            .filter(move |fk| fk.principal == principal)
    }

    /// Number of principal levels above `name` (0 for roots).
    ///
    /// Inserts run in ascending depth, deletes in descending depth.
    pub fn depth(&self, name: &str) -> usize {
        self.depths.get(name).copied().unwrap_or(0)
    }

    fn compute_depth(&self, name: &'static str, visiting: &mut HashSet<&'static str>) -> usize {
        if !visiting.insert(name) {
            return 0;
        }
        let principals: Vec<&'static str> = self
            .foreign_keys_of(name)
            .map(|fk| fk.principal)
            .filter(|p| *p != name)
            .collect();
        let depth = principals
            .into_iter()
            .map(|p| self.compute_depth(p, visiting) + 1)
            .max()
            .unwrap_or(0);
        visiting.remove(name);
        depth
    }
}
