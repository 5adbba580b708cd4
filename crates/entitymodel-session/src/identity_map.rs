//! Identity Map: one live instance per (entity type, key) within a session.
//!
//! Every read of the same key through a session yields the same
//! [`EntityRef`]. The map never owns query results on its own; entries are
//! added by the session as instances become tracked and dropped when they
//! are detached or the session is cleared.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! map.register(&parent)?;
//!
//! let again = map.resolve(&PARENT, &Value::Int(1)).unwrap();
//! assert!(again.ptr_eq(&parent));
//! ```

use entitymodel_core::{EntityDescriptor, EntityRef, Error, Result, TrackingErrorKind, Value};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Hash a key value.
///
/// Integer widths hash alike so that `Int(1)` and `BigInt(1)` address the
/// same entry, matching [`Value::key_eq`].
fn hash_key(value: &Value) -> u64 {
    use std::collections::hash_map::DefaultHasher;

    let mut hasher = DefaultHasher::new();
    match value {
        Value::Null => 0u8.hash(&mut hasher),
        Value::Bool(b) => {
            1u8.hash(&mut hasher);
            b.hash(&mut hasher);
        }
        Value::Int(_) | Value::BigInt(_) => {
            2u8.hash(&mut hasher);
            value.integer_key().hash(&mut hasher);
        }
        Value::Double(f) => {
            3u8.hash(&mut hasher);
            f.to_bits().hash(&mut hasher);
        }
        Value::Text(s) => {
            4u8.hash(&mut hasher);
            s.hash(&mut hasher);
        }
        Value::Bytes(b) => {
            5u8.hash(&mut hasher);
            b.hash(&mut hasher);
        }
        Value::Timestamp(ts) => {
            6u8.hash(&mut hasher);
            ts.hash(&mut hasher);
        }
        Value::Json(j) => {
            7u8.hash(&mut hasher);
            j.to_string().hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// Identity of one entity instance: its type plus a hash of its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    entity: &'static str,
    key_hash: u64,
}

impl ObjectKey {
    /// Build the identity for a key of `entity`.
    pub fn new(entity: &EntityDescriptor, key: &Value) -> Self {
        Self {
            entity: entity.name,
            key_hash: hash_key(key),
        }
    }

    /// Identity of a live instance; `None` when its key is unassigned.
    pub fn of(entity: &EntityRef) -> Option<Self> {
        let key = entity.key()?;
        Some(Self::new(entity.descriptor(), &key))
    }

    /// Entity type name.
    pub fn entity(&self) -> &'static str {
        self.entity
    }
}

struct IdentityEntry {
    key: Value,
    instance: EntityRef,
}

/// Identity Map for one session.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<ObjectKey, Vec<IdentityEntry>>,
}

impl IdentityMap {
    /// Create an empty identity map.
    pub fn new() -> Self {
        Self::default()
    }

    /// The instance registered for `key`, if any.
    pub fn resolve(&self, entity: &EntityDescriptor, key: &Value) -> Option<EntityRef> {
        self.entries
            .get(&ObjectKey::new(entity, key))?
            .iter()
            .find(|e| e.key.key_eq(key))
            .map(|e| e.instance.clone())
    }

    /// Register an instance under its key.
    ///
    /// Registering the same instance twice is a no-op. Registering a
    /// different instance for a key that is already present fails with a
    /// tracking conflict and leaves the map unchanged. Instances without a
    /// key are ignored.
    pub fn register(&mut self, instance: &EntityRef) -> Result<()> {
        let Some(key) = instance.key() else {
            return Ok(());
        };
        let descriptor = instance.descriptor();
        let bucket = self
            .entries
            .entry(ObjectKey::new(descriptor, &key))
            .or_default();
        if let Some(existing) = bucket.iter().find(|e| e.key.key_eq(&key)) {
            if existing.instance.ptr_eq(instance) {
                return Ok(());
            }
            return Err(Error::tracking(
                TrackingErrorKind::Conflict,
                descriptor.name,
                format!("another instance of '{}' is already tracked", descriptor.name),
            )
            .with_key(key));
        }
        bucket.push(IdentityEntry {
            key,
            instance: instance.clone(),
        });
        Ok(())
    }

    /// Would registering `instance` conflict with a different instance?
    pub fn conflicts(&self, instance: &EntityRef) -> bool {
        let Some(key) = instance.key() else {
            return false;
        };
        self.resolve(instance.descriptor(), &key)
            .is_some_and(|existing| !existing.ptr_eq(instance))
    }

    /// Remove the entry for `key`, returning the instance.
    pub fn remove(&mut self, entity: &EntityDescriptor, key: &Value) -> Option<EntityRef> {
        let object_key = ObjectKey::new(entity, key);
        let bucket = self.entries.get_mut(&object_key)?;
        let index = bucket.iter().position(|e| e.key.key_eq(key))?;
        let removed = bucket.swap_remove(index);
        if bucket.is_empty() {
            self.entries.remove(&object_key);
        }
        Some(removed.instance)
    }

    /// Remove `instance` if it is the one registered under its key.
    pub fn forget(&mut self, instance: &EntityRef) {
        let Some(key) = instance.key() else {
            return;
        };
        let descriptor = instance.descriptor();
        if self
            .resolve(descriptor, &key)
            .is_some_and(|existing| existing.ptr_eq(instance))
        {
            self.remove(descriptor, &key);
        }
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
