//! Graph materialization: row groups plus a navigation tree in, wired
//! entity graph out.

use crate::change_tracker::{ChangeTracker, EntityState};
use crate::fixup::{fix_up, inverse_of, link_inverse};
use crate::identity_map::{IdentityMap, ObjectKey};
use entitymodel_core::{
    Entity, EntityDescriptor, EntityRef, EntityRegistry, Error, Navigation, NavigationNode,
    NavigationTree, QueryError, QueryErrorKind, Result, RowGroup, TrackingMode, Value,
};
use entitymodel_query::Projection;
use std::collections::{BTreeMap, HashMap};

/// Builds entities from fetched rows according to a tracking mode.
pub struct Materializer<'a> {
    registry: &'a EntityRegistry,
    identity: &'a mut IdentityMap,
    tracker: &'a mut ChangeTracker,
    mode: TrackingMode,
    projection: Option<&'a Projection>,
    /// Instances seen in this pass, for `UntrackedWithIdentity`.
    pass: HashMap<ObjectKey, Vec<(Value, EntityRef)>>,
    /// Tracked instances produced by this pass, for fix-up.
    touched: Vec<EntityRef>,
}

impl<'a> Materializer<'a> {
    pub fn new(
        registry: &'a EntityRegistry,
        identity: &'a mut IdentityMap,
        tracker: &'a mut ChangeTracker,
        mode: TrackingMode,
    ) -> Self {
        Self {
            registry,
            identity,
            tracker,
            mode,
            projection: None,
            pass: HashMap::new(),
            touched: Vec::new(),
        }
    }

    /// Restrict materialized fields and navigations.
    #[must_use]
    pub fn with_projection(mut self, projection: Option<&'a Projection>) -> Self {
        self.projection = projection;
        self
    }

    /// One root entity per row group, in store order.
    #[tracing::instrument(level = "debug", skip_all, fields(root = tree.root().name, rows = groups.len(), mode = ?self.mode))]
    pub fn materialize(mut self, tree: &NavigationTree, groups: &[RowGroup]) -> Result<Vec<EntityRef>> {
        let root_fields = self.projection.and_then(Projection::root_fields);
        let mut roots = Vec::with_capacity(groups.len());
        for group in groups {
            roots.push(self.build(tree.root(), tree.children(), group, "", root_fields)?);
        }
        if self.mode == TrackingMode::Tracked {
            for entity in &self.touched {
                fix_up(self.registry, self.identity, self.tracker, entity);
            }
        }
        tracing::debug!(
            roots = roots.len(),
            tracked = self.touched.len(),
            "Materialized entities"
        );
        Ok(roots)
    }

    fn build(
        &mut self,
        descriptor: &'static EntityDescriptor,
        nodes: &[NavigationNode],
        group: &RowGroup,
        path: &str,
        keep: Option<&[String]>,
    ) -> Result<EntityRef> {
        let values: BTreeMap<String, Value> = group
            .row
            .iter()
            .filter(|(name, _)| descriptor.has_field(name))
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        let instance = self.instance(descriptor, &values, keep)?;

        for node in nodes {
            let child_path = if path.is_empty() {
                node.name().to_string()
            } else {
                format!("{}.{}", path, node.name())
            };
            if let Some(projection) = self.projection {
                if !projection.covers(&child_path) {
                    continue;
                }
            }
            let child_keep = self.projection.and_then(|p| p.fields_at(&child_path));
            let mut related = Vec::new();
            for child_group in group.navigation(node.name()).unwrap_or(&[]) {
                related.push(self.build(
                    node.target(),
                    node.children(),
                    child_group,
                    &child_path,
                    child_keep,
                )?);
            }
            self.populate(&instance, node, related);
        }
        Ok(instance)
    }

    /// Resolve or create the instance for one row.
    fn instance(
        &mut self,
        descriptor: &'static EntityDescriptor,
        values: &BTreeMap<String, Value>,
        keep: Option<&[String]>,
    ) -> Result<EntityRef> {
        let key = values.get(descriptor.key).filter(|v| !v.is_null()).cloned();
        let fresh = |values: &BTreeMap<String, Value>| {
            let mut entity = Entity::new(descriptor);
            for (name, value) in values {
                if keep.is_none_or(|k| k.iter().any(|f| f == name)) {
                    entity.set(name, value.clone());
                }
            }
            entity.into_ref()
        };

        match self.mode {
            TrackingMode::Untracked => Ok(fresh(values)),
            TrackingMode::UntrackedWithIdentity => {
                let key = key.ok_or_else(|| missing_key(descriptor))?;
                let bucket = self.pass.entry(ObjectKey::new(descriptor, &key)).or_default();
                if let Some((_, existing)) = bucket.iter().find(|(k, _)| k.key_eq(&key)) {
                    return Ok(existing.clone());
                }
                let instance = fresh(values);
                bucket.push((key, instance.clone()));
                Ok(instance)
            }
            TrackingMode::Tracked => {
                let key = key.ok_or_else(|| missing_key(descriptor))?;
                // A resident entry keeps its current values and snapshot.
                if let Some(existing) = self.identity.resolve(descriptor, &key) {
                    if !self.touched.iter().any(|e| e.ptr_eq(&existing)) {
                        self.touched.push(existing.clone());
                    }
                    return Ok(existing);
                }
                let instance = fresh(values);
                self.identity.register(&instance)?;
                self.tracker.track(&instance, EntityState::Unchanged);
                self.touched.push(instance.clone());
                Ok(instance)
            }
        }
    }

    /// Fill a requested navigation slot with the fetched related entities.
    ///
    /// Collections already populated on a reused instance keep their
    /// entries; fetched entities are appended once.
    fn populate(&self, holder: &EntityRef, node: &NavigationNode, related: Vec<EntityRef>) {
        let info = node.info();
        let slot = match holder.navigation(info.name) {
            Some(Navigation::Many(mut existing)) if info.is_many() => {
                for entity in related {
                    if !existing.iter().any(|e| e.ptr_eq(&entity)) {
                        existing.push(entity);
                    }
                }
                Navigation::Many(existing)
            }
            _ if info.is_many() => {
                let mut unique: Vec<EntityRef> = Vec::with_capacity(related.len());
                for entity in related {
                    if !unique.iter().any(|e| e.ptr_eq(&entity)) {
                        unique.push(entity);
                    }
                }
                Navigation::Many(unique)
            }
            _ => Navigation::Single(related.into_iter().next()),
        };
        let children = slot.entities();
        holder.write().set_navigation(info.name, slot);

        if self.projection.is_some() {
            return;
        }
        let holder_descriptor = holder.descriptor();
        if let Some(inverse) = inverse_of(self.registry, holder_descriptor, info) {
            for child in &children {
                link_inverse(child, inverse, holder);
            }
        }
    }
}

fn missing_key(descriptor: &EntityDescriptor) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Store,
        entity: Some(descriptor.name.to_string()),
        key: None,
        message: format!("store returned a '{}' row without a key", descriptor.name),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitymodel_core::{NavigationInfo, NavigationKind, Row};

    static PARENT: EntityDescriptor = EntityDescriptor::new("Parent", "Id", &["Id", "Name"])
        .navigations(&[
            NavigationInfo::new("Children", "Child", NavigationKind::OneToMany)
                .foreign_key("ParentId"),
        ]);
    static CHILD: EntityDescriptor =
        EntityDescriptor::new("Child", "Id", &["Id", "Name", "ParentId"]).navigations(&[
            NavigationInfo::new("Parent", "Parent", NavigationKind::ManyToOne)
                .foreign_key("ParentId"),
        ]);

    fn registry() -> EntityRegistry {
        EntityRegistry::builder()
            .register(&PARENT)
            .register(&CHILD)
            .build()
            .unwrap()
    }

    fn row(fields: &[(&str, Value)]) -> Row {
        Row::new(
            fields.iter().map(|(n, _)| (*n).to_string()).collect(),
            fields.iter().map(|(_, v)| v.clone()).collect(),
        )
    }

    fn parent_group(children: &[i32]) -> RowGroup {
        RowGroup::new(row(&[("Id", Value::Int(1)), ("Name", Value::from("Parent"))]))
            .with_navigation(
                "Children",
                children
                    .iter()
                    .map(|id| {
                        RowGroup::new(row(&[
                            ("Id", Value::Int(*id)),
                            ("Name", Value::from(format!("Child{id}"))),
                            ("ParentId", Value::Int(1)),
                        ]))
                    })
                    .collect(),
            )
    }

    fn tree() -> NavigationTree {
        let mut tree = NavigationTree::new(&PARENT);
        tree.ensure_child(&[], PARENT.navigation("Children").unwrap(), &CHILD)
            .unwrap();
        tree
    }

    #[test]
    fn tracked_mode_reuses_instances_and_keeps_current_values() {
        let registry = registry();
        let mut identity = IdentityMap::new();
        let mut tracker = ChangeTracker::new();
        let first = Materializer::new(&registry, &mut identity, &mut tracker, TrackingMode::Tracked)
            .materialize(&tree(), &[parent_group(&[11, 12])])
            .unwrap();
        first[0].set("Name", "Changed");
        let second = Materializer::new(&registry, &mut identity, &mut tracker, TrackingMode::Tracked)
            .materialize(&tree(), &[parent_group(&[11, 12])])
            .unwrap();
        assert!(first[0].ptr_eq(&second[0]));
        assert_eq!(second[0].get("Name"), Some(Value::from("Changed")));
        assert_eq!(second[0].many("Children").unwrap().len(), 2);
        assert_eq!(tracker.len(), 3);
        let child = &second[0].many("Children").unwrap()[0];
        assert!(child.one("Parent").unwrap().unwrap().ptr_eq(&second[0]));
    }

    #[test]
    fn tracked_hit_ignores_newer_store_values() {
        let registry = registry();
        let mut identity = IdentityMap::new();
        let mut tracker = ChangeTracker::new();
        let first = Materializer::new(&registry, &mut identity, &mut tracker, TrackingMode::Tracked)
            .materialize(&NavigationTree::new(&PARENT), &[parent_group(&[])])
            .unwrap();
        let newer = RowGroup::new(row(&[("Id", Value::Int(1)), ("Name", Value::from("Bye"))]));
        let second = Materializer::new(&registry, &mut identity, &mut tracker, TrackingMode::Tracked)
            .materialize(&NavigationTree::new(&PARENT), &[newer])
            .unwrap();
        assert!(first[0].ptr_eq(&second[0]));
        assert_eq!(second[0].get("Name"), Some(Value::from("Parent")));
        assert_eq!(tracker.detect_changes(), 0);
        assert_eq!(tracker.state(&second[0]), EntityState::Unchanged);
    }

    #[test]
    fn untracked_mode_creates_fresh_instances() {
        let registry = registry();
        let mut identity = IdentityMap::new();
        let mut tracker = ChangeTracker::new();
        let groups = [parent_group(&[11]), parent_group(&[11])];
        let roots = Materializer::new(&registry, &mut identity, &mut tracker, TrackingMode::Untracked)
            .materialize(&tree(), &groups)
            .unwrap();
        assert!(!roots[0].ptr_eq(&roots[1]));
        assert!(tracker.is_empty());
        assert!(identity.is_empty());
    }

    #[test]
    fn identity_resolution_within_one_pass() {
        let registry = registry();
        let mut identity = IdentityMap::new();
        let mut tracker = ChangeTracker::new();
        let groups = [parent_group(&[11, 12]), parent_group(&[12, 13])];
        let roots = Materializer::new(
            &registry,
            &mut identity,
            &mut tracker,
            TrackingMode::UntrackedWithIdentity,
        )
        .materialize(&tree(), &groups)
        .unwrap();
        assert!(roots[0].ptr_eq(&roots[1]));
        let ids: Vec<i32> = roots[0]
            .many("Children")
            .unwrap()
            .iter()
            .map(|c| c.get_as("Id").unwrap())
            .collect();
        assert_eq!(ids, vec![11, 12, 13]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn unrequested_navigations_stay_unpopulated() {
        let registry = registry();
        let mut identity = IdentityMap::new();
        let mut tracker = ChangeTracker::new();
        let roots = Materializer::new(&registry, &mut identity, &mut tracker, TrackingMode::Untracked)
            .materialize(&NavigationTree::new(&PARENT), &[parent_group(&[11])])
            .unwrap();
        assert!(roots[0].navigation("Children").is_none());
        let roots = Materializer::new(&registry, &mut identity, &mut tracker, TrackingMode::Untracked)
            .materialize(&tree(), &[parent_group(&[])])
            .unwrap();
        assert_eq!(roots[0].many("Children").map(|c| c.len()), Some(0));
    }

    #[test]
    fn tracked_rows_need_keys() {
        let registry = registry();
        let mut identity = IdentityMap::new();
        let mut tracker = ChangeTracker::new();
        let group = RowGroup::new(row(&[("Name", Value::from("x"))]));
        let err = Materializer::new(&registry, &mut identity, &mut tracker, TrackingMode::Tracked)
            .materialize(&NavigationTree::new(&PARENT), &[group])
            .unwrap_err();
        assert!(matches!(err, Error::Query(QueryError { kind: QueryErrorKind::Store, .. })));
    }
}
