//! Live entity instances and their navigation slots.
//!
//! An [`Entity`] holds scalar field values keyed by field name plus a set of
//! navigation slots. A missing field means "no value" (distinct from
//! `Value::Null`); a missing navigation slot means "not loaded" (distinct
//! from an empty collection).
//!
//! Instances are shared through [`EntityRef`], a cheap handle with reference
//! identity: two handles denote the same instance iff [`EntityRef::ptr_eq`].
//!
//! Slot entries are either strong or back references. Back references are
//! held as [`WeakEntityRef`] and do not keep their target alive; a dropped
//! target disappears from a collection and turns a single reference back
//! into "not loaded".

use crate::descriptor::EntityDescriptor;
use crate::error::{Error, Result, SchemaErrorKind};
use crate::row::FromValue;
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// A populated navigation slot.
#[derive(Clone)]
pub enum Navigation {
    /// Single reference, possibly known to be absent.
    Single(Option<EntityRef>),
    /// Ordered collection, possibly known to be empty.
    Many(Vec<EntityRef>),
}

impl Navigation {
    /// All entities referenced by this slot.
    pub fn entities(&self) -> Vec<EntityRef> {
        match self {
            Navigation::Single(one) => one.iter().cloned().collect(),
            Navigation::Many(many) => many.clone(),
        }
    }

    /// Does this slot reference `entity`?
    pub fn contains(&self, entity: &EntityRef) -> bool {
        match self {
            Navigation::Single(one) => one.as_ref().is_some_and(|e| e.ptr_eq(entity)),
            Navigation::Many(many) => many.iter().any(|e| e.ptr_eq(entity)),
        }
    }

    /// Number of referenced entities.
    pub fn len(&self) -> usize {
        match self {
            Navigation::Single(one) => usize::from(one.is_some()),
            Navigation::Many(many) => many.len(),
        }
    }

    /// True for `Single(None)` and `Many([])`.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One stored slot entry.
#[derive(Clone)]
enum Link {
    Strong(EntityRef),
    Back(WeakEntityRef),
}

impl Link {
    fn get(&self) -> Option<EntityRef> {
        match self {
            Link::Strong(e) => Some(e.clone()),
            Link::Back(w) => w.upgrade(),
        }
    }

    fn points_to(&self, entity: &EntityRef) -> bool {
        match self {
            Link::Strong(e) => e.ptr_eq(entity),
            Link::Back(w) => w.points_to(entity),
        }
    }

    fn is_live(&self) -> bool {
        match self {
            Link::Strong(_) => true,
            Link::Back(w) => w.0.strong_count() > 0,
        }
    }
}

/// Stored form of a navigation slot.
#[derive(Clone)]
enum Slot {
    Single(Option<Link>),
    Many(Vec<Link>),
}

impl Slot {
    fn strong(navigation: Navigation) -> Self {
        match navigation {
            Navigation::Single(one) => Slot::Single(one.map(Link::Strong)),
            Navigation::Many(many) => Slot::Many(many.into_iter().map(Link::Strong).collect()),
        }
    }

    fn back(navigation: &Navigation) -> Self {
        match navigation {
            Navigation::Single(one) => {
                Slot::Single(one.as_ref().map(|e| Link::Back(e.downgrade())))
            }
            Navigation::Many(many) => {
                Slot::Many(many.iter().map(|e| Link::Back(e.downgrade())).collect())
            }
        }
    }

    /// Live view of the slot; `None` when a single back reference is gone.
    fn view(&self) -> Option<Navigation> {
        match self {
            Slot::Single(None) => Some(Navigation::Single(None)),
            Slot::Single(Some(link)) => link.get().map(|e| Navigation::Single(Some(e))),
            Slot::Many(links) => Some(Navigation::Many(
                links.iter().filter_map(Link::get).collect(),
            )),
        }
    }

    fn links_mut(&mut self) -> &mut [Link] {
        match self {
            Slot::Single(one) => one.as_mut_slice(),
            Slot::Many(many) => many.as_mut_slice(),
        }
    }
}

impl fmt::Debug for Navigation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Navigation::Single(None) => write!(f, "Single(None)"),
            Navigation::Single(Some(e)) => write!(f, "Single({})", e.label()),
            Navigation::Many(many) => {
                let labels: Vec<String> = many.iter().map(EntityRef::label).collect();
                write!(f, "Many({})", labels.join(", "))
            }
        }
    }
}

/// One entity instance.
#[derive(Clone)]
pub struct Entity {
    descriptor: &'static EntityDescriptor,
    fields: BTreeMap<String, Value>,
    navigations: BTreeMap<String, Slot>,
}

impl Entity {
    /// Create an entity with no field values and no loaded navigations.
    pub fn new(descriptor: &'static EntityDescriptor) -> Self {
        Self {
            descriptor,
            fields: BTreeMap::new(),
            navigations: BTreeMap::new(),
        }
    }

    /// Set a field value (builder form).
    #[must_use]
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    /// Populate a single-valued navigation (builder form).
    #[must_use]
    pub fn with_one(mut self, navigation: &str, entity: Option<EntityRef>) -> Self {
        self.navigations
            .insert(navigation.to_string(), Slot::Single(entity.map(Link::Strong)));
        self
    }

    /// Populate a collection navigation (builder form).
    #[must_use]
    pub fn with_many(mut self, navigation: &str, entities: Vec<EntityRef>) -> Self {
        self.navigations.insert(
            navigation.to_string(),
            Slot::Many(entities.into_iter().map(Link::Strong).collect()),
        );
        self
    }

    /// Wrap this entity in a shared handle.
    pub fn into_ref(self) -> EntityRef {
        EntityRef::new(self)
    }

    /// The entity's descriptor.
    pub fn descriptor(&self) -> &'static EntityDescriptor {
        self.descriptor
    }

    /// The key value, if assigned (missing and NULL keys both count as unassigned).
    pub fn key(&self) -> Option<&Value> {
        self.fields
            .get(self.descriptor.key)
            .filter(|v| !v.is_null())
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Get a typed field value.
    pub fn get_as<T: FromValue>(&self, field: &str) -> Result<T> {
        T::from_value(self.fields.get(field).unwrap_or(&Value::Null))
    }

    /// Set a field value.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.fields.insert(field.to_string(), value.into());
    }

    /// Remove a field value, returning it.
    pub fn unset(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// All field values.
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Fail if any field is not declared on the descriptor.
    pub fn check_fields(&self) -> Result<()> {
        if let Some(unknown) = self.fields.keys().find(|f| !self.descriptor.has_field(f)) {
            return Err(Error::schema(
                SchemaErrorKind::UnknownField,
                format!("'{}' has no field '{}'", self.descriptor.name, unknown),
            ));
        }
        if let Some(unknown) = self
            .navigations
            .keys()
            .find(|n| self.descriptor.navigation(n).is_none())
        {
            return Err(Error::schema(
                SchemaErrorKind::UnknownNavigation,
                format!("'{}' has no navigation '{}'", self.descriptor.name, unknown),
            ));
        }
        Ok(())
    }

    /// Get a navigation slot; `None` means not loaded.
    pub fn navigation(&self, name: &str) -> Option<Navigation> {
        self.navigations.get(name)?.view()
    }

    /// Replace a navigation slot with strong references.
    pub fn set_navigation(&mut self, name: &str, navigation: Navigation) {
        self.navigations
            .insert(name.to_string(), Slot::strong(navigation));
    }

    /// Replace a navigation slot with back references.
    pub fn set_back_navigation(&mut self, name: &str, navigation: &Navigation) {
        self.navigations
            .insert(name.to_string(), Slot::back(navigation));
    }

    /// Add a back reference to `target` unless the slot already refers to
    /// it. A live single reference to another entity is left in place; an
    /// unloaded slot becomes loaded.
    pub fn link_back(&mut self, name: &str, many: bool, target: &EntityRef) {
        let link = Link::Back(target.downgrade());
        match self.navigations.get_mut(name) {
            Some(Slot::Many(links)) => {
                if !links.iter().any(|l| l.points_to(target)) {
                    links.push(link);
                }
            }
            Some(Slot::Single(one)) => {
                if !one.as_ref().is_some_and(Link::is_live) {
                    *one = Some(link);
                }
            }
            None => {
                let slot = if many {
                    Slot::Many(vec![link])
                } else {
                    Slot::Single(Some(link))
                };
                self.navigations.insert(name.to_string(), slot);
            }
        }
    }

    /// Turn a strong reference to `target` in one slot into a back
    /// reference. Returns whether the slot refers to `target` at all.
    pub fn weaken(&mut self, name: &str, target: &EntityRef) -> bool {
        let Some(slot) = self.navigations.get_mut(name) else {
            return false;
        };
        let mut found = false;
        for link in slot.links_mut() {
            if link.points_to(target) {
                found = true;
                if let Link::Strong(e) = link {
                    let back = e.downgrade();
                    *link = Link::Back(back);
                }
            }
        }
        found
    }

    /// Forget a navigation slot, returning it to the not-loaded state.
    pub fn clear_navigation(&mut self, name: &str) -> Option<Navigation> {
        self.navigations.remove(name)?.view()
    }

    /// Every live entity referenced from any loaded slot.
    pub fn related_entities(&self) -> Vec<EntityRef> {
        self.navigations
            .values()
            .filter_map(Slot::view)
            .flat_map(|n| n.entities())
            .collect()
    }

    /// Copy the given fields onto this entity, leaving the others untouched.
    ///
    /// The key field is never overwritten.
    pub fn set_values<I, K, V>(&mut self, values: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        for (field, value) in values {
            let field = field.into();
            if field != self.descriptor.key {
                self.fields.insert(field, value.into());
            }
        }
    }

    /// Copy every declared field from `source`.
    ///
    /// Fields `source` has no value for are set to NULL. The key field is
    /// never overwritten.
    pub fn set_values_from(&mut self, source: &Entity) {
        for field in self.descriptor.value_fields() {
            let value = source.fields.get(field).cloned().unwrap_or(Value::Null);
            self.fields.insert(field.to_string(), value);
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let navigations: BTreeMap<&str, Option<Navigation>> = self
            .navigations
            .iter()
            .map(|(name, slot)| (name.as_str(), slot.view()))
            .collect();
        f.debug_struct(self.descriptor.name)
            .field("fields", &self.fields)
            .field("navigations", &navigations)
            .finish()
    }
}

/// Shared handle to an [`Entity`].
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<Entity>>);

impl EntityRef {
    /// Wrap an entity.
    pub fn new(entity: Entity) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    /// Lock for reading.
    ///
    /// A poisoned lock is recovered; entity state has no invariants a
    /// panicking writer could break halfway.
    pub fn read(&self) -> RwLockReadGuard<'_, Entity> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Do both handles denote the same instance?
    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// A back reference to this instance.
    pub fn downgrade(&self) -> WeakEntityRef {
        WeakEntityRef(Arc::downgrade(&self.0))
    }

    /// Stable address of the instance, used as a tracking key.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// The entity's descriptor.
    pub fn descriptor(&self) -> &'static EntityDescriptor {
        self.read().descriptor
    }

    /// The key value, if assigned.
    pub fn key(&self) -> Option<Value> {
        self.read().key().cloned()
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<Value> {
        self.read().get(field).cloned()
    }

    /// Get a typed field value.
    pub fn get_as<T: FromValue>(&self, field: &str) -> Result<T> {
        self.read().get_as(field)
    }

    /// Set a field value.
    pub fn set(&self, field: &str, value: impl Into<Value>) {
        self.write().set(field, value);
    }

    /// Get a navigation slot; `None` means not loaded.
    pub fn navigation(&self, name: &str) -> Option<Navigation> {
        self.read().navigation(name)
    }

    /// The loaded single reference; `None` when not loaded.
    pub fn one(&self, name: &str) -> Option<Option<EntityRef>> {
        match self.navigation(name)? {
            Navigation::Single(one) => Some(one),
            Navigation::Many(_) => None,
        }
    }

    /// The loaded collection; `None` when not loaded.
    pub fn many(&self, name: &str) -> Option<Vec<EntityRef>> {
        match self.navigation(name)? {
            Navigation::Many(many) => Some(many),
            Navigation::Single(_) => None,
        }
    }

    /// Snapshot of the current field values.
    pub fn field_values(&self) -> BTreeMap<String, Value> {
        self.read().fields.clone()
    }

    /// `Entity(key)` label for logs and debug output.
    pub fn label(&self) -> String {
        let entity = self.read();
        match entity.key() {
            Some(key) => format!("{}({})", entity.descriptor.name, key),
            None => format!("{}(<new>)", entity.descriptor.name),
        }
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Non-owning handle to an [`Entity`].
#[derive(Clone)]
pub struct WeakEntityRef(Weak<RwLock<Entity>>);

impl WeakEntityRef {
    /// The instance, if something still holds it.
    pub fn upgrade(&self) -> Option<EntityRef> {
        self.0.upgrade().map(EntityRef)
    }

    fn points_to(&self, entity: &EntityRef) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&entity.0))
    }
}

impl fmt::Debug for WeakEntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(e) => write!(f, "Weak({})", e.label()),
            None => write!(f, "Weak(<dropped>)"),
        }
    }
}

impl From<Entity> for EntityRef {
    fn from(entity: Entity) -> Self {
        EntityRef::new(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{NavigationInfo, NavigationKind};

    static MY_ENTITY: EntityDescriptor =
        EntityDescriptor::new("MyEntity", "Id", &["Id", "Name", "StartDate", "EndDate"]);
    static PARENT: EntityDescriptor = EntityDescriptor::new("Parent", "Id", &["Id", "Name"])
        .navigations(&[
            NavigationInfo::new("Children", "Child", NavigationKind::OneToMany)
                .foreign_key("ParentId"),
        ]);
    static CHILD: EntityDescriptor =
        EntityDescriptor::new("Child", "Id", &["Id", "Name", "ParentId"]);

    #[test]
    fn missing_field_differs_from_null() {
        let e = Entity::new(&MY_ENTITY).with("Id", 1).with("StartDate", Value::Null);
        assert_eq!(e.get("StartDate"), Some(&Value::Null));
        assert_eq!(e.get("Name"), None);
        assert_eq!(e.get_as::<Option<String>>("Name").unwrap(), None);
    }

    #[test]
    fn unloaded_navigation_differs_from_empty() {
        let loaded = Entity::new(&PARENT).with("Id", 1).with_many("Children", vec![]);
        let unloaded = Entity::new(&PARENT).with("Id", 1);
        assert!(loaded.navigation("Children").is_some_and(|n| n.is_empty()));
        assert!(unloaded.navigation("Children").is_none());
    }

    #[test]
    fn key_ignores_null() {
        assert!(Entity::new(&MY_ENTITY).with("Id", Value::Null).key().is_none());
        assert_eq!(
            Entity::new(&MY_ENTITY).with("Id", 7).key(),
            Some(&Value::Int(7))
        );
    }

    #[test]
    fn partial_set_values_keeps_other_fields() {
        let mut e = Entity::new(&MY_ENTITY)
            .with("Id", 1)
            .with("Name", "Hello")
            .with("StartDate", "06/08/2021");
        e.set_values([("Id", Value::Int(99)), ("Name", Value::from("Bye"))]);
        assert_eq!(e.get("Name"), Some(&Value::from("Bye")));
        assert_eq!(e.get("StartDate"), Some(&Value::from("06/08/2021")));
        assert_eq!(e.get("Id"), Some(&Value::Int(1)));
    }

    #[test]
    fn complete_set_values_nulls_missing_fields() {
        let mut e = Entity::new(&MY_ENTITY)
            .with("Id", 1)
            .with("Name", "Hello")
            .with("StartDate", "06/08/2021");
        let dto = Entity::new(&MY_ENTITY).with("Id", 1).with("Name", "Bye");
        e.set_values_from(&dto);
        assert_eq!(e.get("Name"), Some(&Value::from("Bye")));
        assert_eq!(e.get("StartDate"), Some(&Value::Null));
        assert_eq!(e.get("EndDate"), Some(&Value::Null));
    }

    #[test]
    fn ref_identity_and_shared_mutation() {
        let a = Entity::new(&CHILD).with("Id", 11).into_ref();
        let b = a.clone();
        let c = Entity::new(&CHILD).with("Id", 11).into_ref();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        b.set("Name", "Child1");
        assert_eq!(a.get("Name"), Some(Value::from("Child1")));
        assert_eq!(a.addr(), b.addr());
    }

    #[test]
    fn check_fields_rejects_undeclared() {
        let e = Entity::new(&CHILD).with("Id", 11).with("Nope", 1);
        assert_eq!(
            e.check_fields().unwrap_err().schema_kind(),
            Some(SchemaErrorKind::UnknownField)
        );
        let e = Entity::new(&CHILD).with("Id", 11).with_one("Nope", None);
        assert_eq!(
            e.check_fields().unwrap_err().schema_kind(),
            Some(SchemaErrorKind::UnknownNavigation)
        );
    }

    #[test]
    fn back_references_do_not_keep_targets_alive() {
        let child = Entity::new(&CHILD).with("Id", 11).into_ref();
        let parent = Entity::new(&PARENT)
            .with("Id", 1)
            .with_many("Children", vec![child.clone()])
            .into_ref();
        child.write().link_back("Parent", false, &parent);
        child.write().link_back("Parent", false, &parent);
        assert!(child.one("Parent").flatten().unwrap().ptr_eq(&parent));

        let weak = parent.downgrade();
        drop(parent);
        assert!(weak.upgrade().is_none());
        assert!(child.navigation("Parent").is_none());
    }

    #[test]
    fn weaken_breaks_a_strong_cycle() {
        let child = Entity::new(&CHILD).with("Id", 11).into_ref();
        let parent = Entity::new(&PARENT)
            .with("Id", 1)
            .with_many("Children", vec![child.clone()])
            .into_ref();
        child
            .write()
            .set_navigation("Parent", Navigation::Single(Some(parent.clone())));
        assert!(child.write().weaken("Parent", &parent));
        assert!(!child.write().weaken("Children", &parent));
        assert_eq!(child.read().related_entities().len(), 1);

        let weak_parent = parent.downgrade();
        let weak_child = child.downgrade();
        drop(parent);
        drop(child);
        assert!(weak_parent.upgrade().is_none());
        assert!(weak_child.upgrade().is_none());
    }

    #[test]
    fn back_reference_collections_skip_dropped_entries() {
        let parent = Entity::new(&PARENT).with("Id", 1).into_ref();
        let kept = Entity::new(&CHILD).with("Id", 11).into_ref();
        let dropped = Entity::new(&CHILD).with("Id", 12).into_ref();
        parent.write().link_back("Children", true, &kept);
        parent.write().link_back("Children", true, &dropped);
        assert_eq!(parent.many("Children").map(|c| c.len()), Some(2));
        drop(dropped);
        let children = parent.many("Children").unwrap();
        assert_eq!(children.len(), 1);
        assert!(children[0].ptr_eq(&kept));
    }

    #[test]
    fn debug_output_does_not_recurse() {
        let child = Entity::new(&CHILD).with("Id", 11).into_ref();
        let parent = Entity::new(&PARENT)
            .with("Id", 1)
            .with_many("Children", vec![child.clone()])
            .into_ref();
        child.write().set_navigation("Parent", Navigation::Single(Some(parent.clone())));
        let rendered = format!("{:?}", parent.read());
        assert!(rendered.contains("Child(11)"));
    }
}
