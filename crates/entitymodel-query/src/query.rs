//! The query builder.

use crate::include::{Includes, apply_default_includes};
use entitymodel_core::{
    EntityDescriptor, EntityRegistry, Error, Filter, NavigationErrorKind, NavigationTree, Result,
    SchemaErrorKind, TrackingMode, Value,
};

/// Fields to keep when materializing a projected query.
///
/// Projected results carry only the listed fields and only the listed
/// navigations (plus the navigations leading to them), and are never
/// tracked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    root: Option<Vec<String>>,
    navigations: Vec<(String, Vec<String>)>,
}

impl Projection {
    /// Fields kept on root entities; `None` keeps them all.
    pub fn root_fields(&self) -> Option<&[String]> {
        self.root.as_deref()
    }

    /// Fields kept on entities reached through the dotted `path`; `None`
    /// when the path is not projected.
    pub fn fields_at(&self, path: &str) -> Option<&[String]> {
        self.navigations
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, fields)| fields.as_slice())
    }

    /// Is the node at `path` (or a node below it) projected?
    pub fn covers(&self, path: &str) -> bool {
        self.navigations.iter().any(|(p, _)| {
            p == path
                || p.strip_prefix(path)
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }
}

/// A query against one entity type.
///
/// # Example
///
/// ```ignore
/// let query = Query::new(&PARENT)
///     .filter(Filter::eq("Name", "Parent"))
///     .include("Children")
///     .as_no_tracking();
/// let parents = session.query(&cx, &query).await;
/// ```
#[derive(Debug, Clone)]
pub struct Query {
    root: &'static EntityDescriptor,
    filter: Filter,
    includes: Includes,
    tracking: Option<TrackingMode>,
    ignore_auto_includes: bool,
    limit: Option<usize>,
    projection: Option<Projection>,
}

impl Query {
    /// Query every row of `root`.
    pub fn new(root: &'static EntityDescriptor) -> Self {
        Self {
            root,
            filter: Filter::All,
            includes: Includes::new(),
            tracking: None,
            ignore_auto_includes: false,
            limit: None,
            projection: None,
        }
    }

    /// Root entity type.
    pub fn root(&self) -> &'static EntityDescriptor {
        self.root
    }

    /// Add a predicate; repeated calls are combined with AND.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = std::mem::replace(&mut self.filter, Filter::All).and(filter);
        self
    }

    /// Restrict to the row with the given key.
    #[must_use]
    pub fn key(self, key: impl Into<Value>) -> Self {
        let field = self.root.key;
        self.filter(Filter::eq(field, key))
    }

    /// Eagerly load a root-relative navigation path.
    #[must_use]
    pub fn include(mut self, path: impl Into<String>) -> Self {
        self.includes = self.includes.include(path);
        self
    }

    /// Eagerly load a path continuing from the previous include.
    #[must_use]
    pub fn then_include(mut self, path: impl Into<String>) -> Self {
        self.includes = self.includes.then_include(path);
        self
    }

    /// Track results regardless of the session default.
    #[must_use]
    pub fn as_tracking(mut self) -> Self {
        self.tracking = Some(TrackingMode::Tracked);
        self
    }

    /// Return fresh, untracked instances.
    #[must_use]
    pub fn as_no_tracking(mut self) -> Self {
        self.tracking = Some(TrackingMode::Untracked);
        self
    }

    /// Return untracked instances de-duplicated within this query.
    #[must_use]
    pub fn as_no_tracking_with_identity_resolution(mut self) -> Self {
        self.tracking = Some(TrackingMode::UntrackedWithIdentity);
        self
    }

    /// Skip auto-included navigations (owned navigations still load).
    #[must_use]
    pub fn ignore_auto_includes(mut self) -> Self {
        self.ignore_auto_includes = true;
        self
    }

    /// Return at most `n` root rows.
    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Keep only these root fields.
    #[must_use]
    pub fn select_fields(mut self, fields: &[&str]) -> Self {
        let projection = self.projection.get_or_insert_with(Projection::default);
        projection.root = Some(fields.iter().map(|f| (*f).to_string()).collect());
        self
    }

    /// Keep only these fields on entities reached through the dotted
    /// navigation `path`, which must also be included.
    #[must_use]
    pub fn select_navigation_fields(mut self, path: &str, fields: &[&str]) -> Self {
        let projection = self.projection.get_or_insert_with(Projection::default);
        let fields = fields.iter().map(|f| (*f).to_string()).collect();
        if let Some(slot) = projection.navigations.iter_mut().find(|(p, _)| p == path) {
            slot.1 = fields;
        } else {
            projection.navigations.push((path.to_string(), fields));
        }
        self
    }

    /// Per-query tracking override, if any.
    pub fn tracking(&self) -> Option<TrackingMode> {
        self.tracking
    }

    /// Resolve includes and validate names against the registry.
    ///
    /// Runs before any store I/O; every path or name error surfaces here.
    pub fn resolve(
        &self,
        registry: &EntityRegistry,
        default_tracking: TrackingMode,
        auto_includes: &[String],
    ) -> Result<ResolvedQuery> {
        let root = registry.descriptor(self.root.name)?;
        let mut tree = self.includes.resolve(root, registry)?;
        apply_default_includes(&mut tree, registry, self.ignore_auto_includes, auto_includes)?;
        self.filter.validate(root, registry)?;
        if let Some(projection) = &self.projection {
            validate_projection(projection, &tree)?;
        }
        let tracking = if self.projection.is_some() {
            TrackingMode::Untracked
        } else {
            self.tracking.unwrap_or(default_tracking)
        };
        Ok(ResolvedQuery {
            tree,
            filter: self.filter.clone(),
            limit: self.limit,
            tracking,
            projection: self.projection.clone(),
        })
    }
}

fn validate_projection(projection: &Projection, tree: &NavigationTree) -> Result<()> {
    let check = |entity: &EntityDescriptor, fields: &[String]| {
        match fields.iter().find(|f| !entity.has_field(f)) {
            Some(field) => Err(Error::schema(
                SchemaErrorKind::UnknownField,
                format!("cannot select unknown field '{}.{}'", entity.name, field),
            )),
            None => Ok(()),
        }
    };
    if let Some(fields) = &projection.root {
        check(tree.root(), fields)?;
    }
    for (path, fields) in &projection.navigations {
        let segments: Vec<&str> = path.split('.').collect();
        let node = tree.find(&segments).ok_or_else(|| {
            Error::navigation(
                NavigationErrorKind::UnknownNavigation,
                path.as_str(),
                "projected navigation is not included",
            )
        })?;
        check(node.target(), fields)?;
    }
    Ok(())
}

/// A query ready for the store: resolved tree plus effective options.
#[derive(Debug, Clone)]
pub struct ResolvedQuery {
    pub tree: NavigationTree,
    pub filter: Filter,
    pub limit: Option<usize>,
    pub tracking: TrackingMode,
    pub projection: Option<Projection>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitymodel_core::{NavigationInfo, NavigationKind};

    static PARENT: EntityDescriptor = EntityDescriptor::new("Parent", "Id", &["Id", "Name"])
        .navigations(&[
            NavigationInfo::new("Child", "Child", NavigationKind::OneToOne)
                .foreign_key("ParentId")
                .auto_include(true),
        ]);
    static CHILD: EntityDescriptor =
        EntityDescriptor::new("Child", "Id", &["Id", "Name", "ParentId"]);

    fn registry() -> EntityRegistry {
        EntityRegistry::builder()
            .register(&PARENT)
            .register(&CHILD)
            .build()
            .unwrap()
    }

    #[test]
    fn overrides_win_over_session_default() {
        let registry = registry();
        let resolved = Query::new(&PARENT)
            .as_no_tracking()
            .resolve(&registry, TrackingMode::Tracked, &[])
            .unwrap();
        assert_eq!(resolved.tracking, TrackingMode::Untracked);
        let resolved = Query::new(&PARENT)
            .as_tracking()
            .resolve(&registry, TrackingMode::Untracked, &[])
            .unwrap();
        assert_eq!(resolved.tracking, TrackingMode::Tracked);
        let resolved = Query::new(&PARENT)
            .resolve(&registry, TrackingMode::UntrackedWithIdentity, &[])
            .unwrap();
        assert_eq!(resolved.tracking, TrackingMode::UntrackedWithIdentity);
    }

    #[test]
    fn auto_includes_are_applied_unless_ignored() {
        let registry = registry();
        let resolved = Query::new(&PARENT)
            .resolve(&registry, TrackingMode::Tracked, &[])
            .unwrap();
        assert!(resolved.tree.child("Child").is_some());
        let resolved = Query::new(&PARENT)
            .ignore_auto_includes()
            .resolve(&registry, TrackingMode::Tracked, &[])
            .unwrap();
        assert!(resolved.tree.is_empty());
    }

    #[test]
    fn filters_combine_and_are_validated() {
        let registry = registry();
        let query = Query::new(&PARENT).key(1).filter(Filter::eq("Name", "Parent"));
        let resolved = query
            .resolve(&registry, TrackingMode::Tracked, &[])
            .unwrap();
        assert_eq!(
            resolved.filter,
            Filter::And(vec![Filter::eq("Id", 1), Filter::eq("Name", "Parent")])
        );
        let err = Query::new(&PARENT)
            .filter(Filter::eq("Nope", 1))
            .resolve(&registry, TrackingMode::Tracked, &[])
            .unwrap_err();
        assert_eq!(err.schema_kind(), Some(SchemaErrorKind::UnknownField));
    }

    #[test]
    fn projection_forces_untracked_and_checks_names() {
        let registry = registry();
        let resolved = Query::new(&PARENT)
            .select_fields(&["Id"])
            .select_navigation_fields("Child", &["Id"])
            .resolve(&registry, TrackingMode::Tracked, &[])
            .unwrap();
        assert_eq!(resolved.tracking, TrackingMode::Untracked);
        let projection = resolved.projection.unwrap();
        assert_eq!(projection.root_fields(), Some(&["Id".to_string()][..]));
        assert!(projection.covers("Child"));
        assert!(!projection.covers("Chi"));

        let err = Query::new(&PARENT)
            .ignore_auto_includes()
            .select_navigation_fields("Child", &["Id"])
            .resolve(&registry, TrackingMode::Tracked, &[])
            .unwrap_err();
        assert_eq!(
            err.navigation_kind(),
            Some(NavigationErrorKind::UnknownNavigation)
        );
        let err = Query::new(&PARENT)
            .select_fields(&["Nope"])
            .resolve(&registry, TrackingMode::Tracked, &[])
            .unwrap_err();
        assert_eq!(err.schema_kind(), Some(SchemaErrorKind::UnknownField));
    }

    #[test]
    fn include_errors_surface_at_resolve() {
        let err = Query::new(&PARENT)
            .then_include("Child")
            .resolve(&registry(), TrackingMode::Tracked, &[])
            .unwrap_err();
        assert_eq!(
            err.navigation_kind(),
            Some(NavigationErrorKind::NoPreviousInclude)
        );
    }
}
