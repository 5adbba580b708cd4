//! Unit of Work: turns tracked entries into pending writes.
//!
//! The unit of work reads the change tracker and produces one
//! [`PendingOp`] per entry that needs a write:
//! - `Added` entries become inserts carrying every field with a value;
//! - `Modified` entries become field-level updates;
//! - `Deleted` entries become deletes.
//!
//! Foreign keys follow the navigation structure: a dependent reachable from
//! a principal's navigation receives the principal's key, either directly
//! (when the key is known) or through a key link resolved by the store when
//! the principal's insert assigns it.

use crate::change_tracker::{ChangeTracker, EntityState, TrackedEntry};
use entitymodel_core::{
    EntityDescriptor, EntityRef, EntityRegistry, Error, NavigationKind, Result,
    TrackingErrorKind, Value,
};
use std::collections::HashSet;

/// A write computed from one tracked entry.
#[derive(Debug, Clone)]
pub enum PendingOp {
    Insert {
        entity: EntityRef,
        values: Vec<(String, Value)>,
        /// Foreign key fields filled from principals inserted in the same
        /// batch without a key yet.
        links: Vec<(String, EntityRef)>,
    },
    Update {
        entity: EntityRef,
        key: Value,
        values: Vec<(String, Value)>,
    },
    Delete {
        entity: EntityRef,
        key: Value,
    },
}

impl PendingOp {
    /// The entity this op writes.
    pub fn entity(&self) -> &EntityRef {
        match self {
            PendingOp::Insert { entity, .. }
            | PendingOp::Update { entity, .. }
            | PendingOp::Delete { entity, .. } => entity,
        }
    }

    /// Descriptor of the entity this op writes.
    pub fn descriptor(&self) -> &'static EntityDescriptor {
        self.entity().descriptor()
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, PendingOp::Insert { .. })
    }

    pub fn is_update(&self) -> bool {
        matches!(self, PendingOp::Update { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, PendingOp::Delete { .. })
    }
}

/// A foreign key relation observed through a populated navigation.
#[derive(Debug, Clone)]
pub struct PrincipalLink {
    pub dependent: EntityRef,
    pub field: &'static str,
    pub principal: EntityRef,
}

/// View over a session's change tracker that computes pending writes.
pub struct UnitOfWork<'a> {
    registry: &'a EntityRegistry,
    tracker: &'a ChangeTracker,
}

impl<'a> UnitOfWork<'a> {
    pub fn new(registry: &'a EntityRegistry, tracker: &'a ChangeTracker) -> Self {
        Self { registry, tracker }
    }

    /// Count entries by pending write kind.
    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for entry in self.tracker.iter() {
            match entry.state() {
                EntityState::Added => counts.new += 1,
                EntityState::Modified => counts.dirty += 1,
                EntityState::Deleted => counts.deleted += 1,
                EntityState::Unchanged | EntityState::Detached => {}
            }
        }
        counts
    }

    /// Every (dependent, foreign key, principal) relation visible through
    /// populated navigations of live tracked entities.
    pub fn principal_links(&self) -> Vec<PrincipalLink> {
        let mut seen: HashSet<(usize, &'static str)> = HashSet::new();
        let mut links = Vec::new();
        let mut push = |dependent: EntityRef, field: &'static str, principal: EntityRef| {
            if seen.insert((dependent.addr(), field)) {
                links.push(PrincipalLink {
                    dependent,
                    field,
                    principal,
                });
            }
        };
        for entry in self.live_entries() {
            let holder = entry.entity();
            let descriptor = holder.descriptor();
            for info in descriptor.navigations {
                let Some(slot) = holder.navigation(info.name) else {
                    continue;
                };
                match info.kind {
                    NavigationKind::ManyToOne => {
                        for principal in slot.entities() {
                            push(holder.clone(), info.foreign_key, principal);
                        }
                    }
                    NavigationKind::OneToOne | NavigationKind::OneToMany => {
                        for dependent in slot.entities() {
                            push(dependent, info.foreign_key, holder.clone());
                        }
                    }
                }
            }
        }
        links
    }

    /// Copy known principal keys into dependents' foreign keys.
    ///
    /// New dependents always receive the key; existing ones only when their
    /// foreign key has no value. Returns the number of fields set.
    pub fn sync_foreign_keys(&self) -> usize {
        let mut synced = 0;
        for link in self.principal_links() {
            let Some(key) = link.principal.key() else {
                continue;
            };
            let current = link.dependent.get(link.field);
            if current.as_ref().is_some_and(|v| v.key_eq(&key)) {
                continue;
            }
            let is_new = self.tracker.state(&link.dependent) == EntityState::Added;
            if is_new || current.is_none_or(|v| v.is_null()) {
                link.dependent.set(link.field, key);
                synced += 1;
            }
        }
        if synced > 0 {
            tracing::debug!(synced, "Synchronized foreign keys from navigations");
        }
        synced
    }

    /// Compute the pending writes, in tracking order.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn collect(&self) -> Result<Vec<PendingOp>> {
        let links = self.principal_links();
        let mut ops = Vec::new();
        for entry in self.tracker.iter() {
            let entity = entry.entity();
            if entry.state() != EntityState::Unchanged {
                self.registry.descriptor(entity.descriptor().name)?;
            }
            match entry.state() {
                EntityState::Added => {
                    let values: Vec<(String, Value)> = entity
                        .field_values()
                        .into_iter()
                        .filter(|(name, value)| {
                            !(value.is_null() && name == entity.descriptor().key)
                        })
                        .collect();
                    let pending_links = links
                        .iter()
                        .filter(|l| l.dependent.ptr_eq(entity))
                        .filter(|l| {
                            l.principal.key().is_none()
                                && self.tracker.state(&l.principal) == EntityState::Added
                        })
                        .map(|l| (l.field.to_string(), l.principal.clone()))
                        .collect();
                    ops.push(PendingOp::Insert {
                        entity: entity.clone(),
                        values,
                        links: pending_links,
                    });
                }
                EntityState::Modified => {
                    let values = entry.write_set();
                    if values.is_empty() {
                        continue;
                    }
                    ops.push(PendingOp::Update {
                        key: required_key(entity, "update")?,
                        entity: entity.clone(),
                        values,
                    });
                }
                EntityState::Deleted => ops.push(PendingOp::Delete {
                    key: required_key(entity, "delete")?,
                    entity: entity.clone(),
                }),
                EntityState::Unchanged | EntityState::Detached => {}
            }
        }
        tracing::debug!(ops = ops.len(), "Collected pending writes");
        Ok(ops)
    }

    fn live_entries(&self) -> impl Iterator<Item = &'a TrackedEntry> + 'a {
        self.tracker
            .iter()
            .filter(|e| e.state() != EntityState::Deleted)
    }
}

fn required_key(entity: &EntityRef, action: &str) -> Result<Value> {
    entity.key().ok_or_else(|| {
        Error::tracking(
            TrackingErrorKind::InvalidState,
            entity.descriptor().name,
            format!("cannot {} a '{}' without a key", action, entity.descriptor().name),
        )
    })
}

/// Count of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Entities pending insert.
    pub new: usize,
    /// Entities pending update.
    pub dirty: usize,
    /// Entities pending delete.
    pub deleted: usize,
}

impl PendingCounts {
    /// Total number of pending operations.
    #[must_use]
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    /// Check if there are no pending operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new == 0 && self.dirty == 0 && self.deleted == 0
    }
}
