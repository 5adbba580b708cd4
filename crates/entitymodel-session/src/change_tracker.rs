//! Change tracking and dirty detection for the session.
//!
//! Each tracked instance has a [`TrackedEntry`]: its state, a snapshot of
//! its field values at the last sync with the store, and the set of fields
//! explicitly marked modified. Entries are kept in the order they started
//! being tracked.

use entitymodel_core::{
    EntityRef, Error, Result, TrackingErrorKind, Value,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Lifecycle state of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// New; inserted on commit.
    Added,
    /// Matches the store as far as the session knows.
    Unchanged,
    /// Has pending field changes; updated on commit.
    Modified,
    /// Removed; deleted on commit.
    Deleted,
    /// Not tracked by the session.
    Detached,
}

/// Which fields an update writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateMode {
    /// Fields that differ from the snapshot plus marked fields.
    #[default]
    Diff,
    /// Marked fields only.
    MarkedOnly,
}

/// Field values of an entity at a point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    values: BTreeMap<String, Value>,
}

impl Snapshot {
    /// Create a snapshot of the given values.
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    /// Snapshot values.
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// A field's value at snapshot time; `None` if it had no value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }
}

/// One tracked entity.
#[derive(Debug, Clone)]
pub struct TrackedEntry {
    entity: EntityRef,
    state: EntityState,
    snapshot: Snapshot,
    marked: BTreeSet<String>,
    update_mode: UpdateMode,
}

impl TrackedEntry {
    fn new(entity: &EntityRef, state: EntityState) -> Self {
        Self {
            snapshot: Snapshot::new(entity.field_values()),
            entity: entity.clone(),
            state,
            marked: BTreeSet::new(),
            update_mode: UpdateMode::Diff,
        }
    }

    /// The tracked instance.
    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Fields explicitly marked modified.
    pub fn marked(&self) -> &BTreeSet<String> {
        &self.marked
    }

    pub fn update_mode(&self) -> UpdateMode {
        self.update_mode
    }

    /// Fields whose current value differs from the snapshot.
    ///
    /// A field that gained a value counts as changed; a field with no
    /// current value never does.
    pub fn changed_fields(&self) -> Vec<String> {
        let entity = self.entity.read();
        entity
            .fields()
            .iter()
            .filter(|(name, value)| self.snapshot.get(name) != Some(*value))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Fields an update of this entry writes, with their current values.
    ///
    /// The key field is never written.
    pub fn write_set(&self) -> Vec<(String, Value)> {
        let entity = self.entity.read();
        let key = entity.descriptor().key;
        let mut names: BTreeSet<String> = self.marked.clone();
        if self.update_mode == UpdateMode::Diff {
            names.extend(
                entity
                    .fields()
                    .iter()
                    .filter(|(name, value)| self.snapshot.get(name) != Some(*value))
                    .map(|(name, _)| name.clone()),
            );
        }
        names
            .into_iter()
            .filter(|name| name != key)
            .filter_map(|name| {
                let value = entity.get(&name)?.clone();
                Some((name, value))
            })
            .collect()
    }

    /// Fields reported as modified: marked fields plus (in `Diff` mode)
    /// changed fields.
    pub fn modified_fields(&self) -> Vec<String> {
        self.write_set().into_iter().map(|(name, _)| name).collect()
    }
}

/// Tracks entity states and snapshots for one session.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    entries: BTreeMap<u64, TrackedEntry>,
    by_addr: HashMap<usize, u64>,
    next_seq: u64,
}

impl ChangeTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `entity` in `state` with a fresh snapshot of its
    /// current values. An existing entry for the same instance is replaced.
    #[tracing::instrument(level = "trace", skip(self, entity), fields(entity = entity.descriptor().name))]
    pub fn track(&mut self, entity: &EntityRef, state: EntityState) {
        let entry = TrackedEntry::new(entity, state);
        if let Some(seq) = self.by_addr.get(&entity.addr()) {
            tracing::trace!(?state, "Re-tracking entity");
            self.entries.insert(*seq, entry);
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_addr.insert(entity.addr(), seq);
        self.entries.insert(seq, entry);
        tracing::trace!(?state, tracked = self.entries.len(), "Tracking entity");
    }

    /// Is this instance tracked?
    pub fn is_tracked(&self, entity: &EntityRef) -> bool {
        self.by_addr.contains_key(&entity.addr())
    }

    /// The entry for an instance.
    pub fn entry(&self, entity: &EntityRef) -> Option<&TrackedEntry> {
        self.entries.get(self.by_addr.get(&entity.addr())?)
    }

    fn entry_mut(&mut self, entity: &EntityRef) -> Option<&mut TrackedEntry> {
        let seq = self.by_addr.get(&entity.addr())?;
        self.entries.get_mut(seq)
    }

    fn tracked_mut(&mut self, entity: &EntityRef) -> Result<&mut TrackedEntry> {
        let name = entity.descriptor().name;
        self.entry_mut(entity).ok_or_else(|| {
            Error::tracking(
                TrackingErrorKind::NotTracked,
                name,
                format!("this '{}' instance is not tracked by this session", name),
            )
        })
    }

    /// State of an instance (`Detached` when untracked).
    pub fn state(&self, entity: &EntityRef) -> EntityState {
        self.entry(entity).map_or(EntityState::Detached, TrackedEntry::state)
    }

    /// Change the state of a tracked instance.
    pub fn set_state(&mut self, entity: &EntityRef, state: EntityState) -> Result<()> {
        self.tracked_mut(entity)?.state = state;
        Ok(())
    }

    /// Stop tracking an instance.
    pub fn remove(&mut self, entity: &EntityRef) -> Option<TrackedEntry> {
        let seq = self.by_addr.remove(&entity.addr())?;
        self.entries.remove(&seq)
    }

    /// Entries in tracking order.
    pub fn iter(&self) -> impl Iterator<Item = &TrackedEntry> {
        self.entries.values()
    }

    /// Tracked instances of one entity type, in tracking order.
    pub fn entities_of<'a>(&'a self, entity: &'a str) -> impl Iterator<Item = &'a EntityRef> + 'a {
        self.entries
            .values()
            .filter(move |e| e.state != EntityState::Deleted && e.entity.descriptor().name == entity)
            .map(TrackedEntry::entity)
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        tracing::debug!(dropped = self.entries.len(), "Clearing change tracker");
        self.entries.clear();
        self.by_addr.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move `Unchanged` entries whose values differ from their snapshot to
    /// `Modified`. Returns how many entries changed state.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn detect_changes(&mut self) -> usize {
        let mut changed = 0;
        for entry in self.entries.values_mut() {
            if entry.state == EntityState::Unchanged && !entry.changed_fields().is_empty() {
                entry.state = EntityState::Modified;
                changed += 1;
            }
        }
        tracing::debug!(changed, "Detected changes");
        changed
    }

    /// Explicitly mark a field modified.
    ///
    /// The field is written on commit even if its value is unchanged. An
    /// `Unchanged` entry becomes `Modified`.
    pub fn mark(&mut self, entity: &EntityRef, field: &str) -> Result<()> {
        let descriptor = entity.descriptor();
        if !descriptor.has_field(field) {
            return Err(Error::tracking(
                TrackingErrorKind::UnknownField,
                descriptor.name,
                format!("'{}' has no field '{}'", descriptor.name, field),
            ));
        }
        let entry = self.tracked_mut(entity)?;
        entry.marked.insert(field.to_string());
        if entry.state == EntityState::Unchanged {
            entry.state = EntityState::Modified;
        }
        tracing::trace!(entity = descriptor.name, field, "Marked field modified");
        Ok(())
    }

    /// Mark every non-key field modified.
    pub fn mark_all(&mut self, entity: &EntityRef) -> Result<()> {
        let descriptor = entity.descriptor();
        let entry = self.tracked_mut(entity)?;
        entry
            .marked
            .extend(descriptor.value_fields().map(str::to_string));
        Ok(())
    }

    /// Choose which fields updates of this entry write.
    pub fn set_update_mode(&mut self, entity: &EntityRef, mode: UpdateMode) -> Result<()> {
        self.tracked_mut(entity)?.update_mode = mode;
        Ok(())
    }

    /// Record a successful write: the current values become the snapshot,
    /// marks are cleared and the entry becomes `Unchanged`.
    pub fn accept_changes(&mut self, entity: &EntityRef) {
        if let Some(entry) = self.entry_mut(entity) {
            entry.snapshot = Snapshot::new(entity.field_values());
            entry.marked.clear();
            entry.state = EntityState::Unchanged;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitymodel_core::{Entity, EntityDescriptor};

    static MY_ENTITY: EntityDescriptor =
        EntityDescriptor::new("MyEntity", "Id", &["Id", "Name", "StartDate", "EndDate"]);

    fn loaded() -> EntityRef {
        Entity::new(&MY_ENTITY)
            .with("Id", 1)
            .with("Name", "Hello")
            .with("StartDate", "06/08/2021")
            .with("EndDate", "06/08/2022")
            .into_ref()
    }

    #[test]
    fn diff_mode_writes_changed_fields_only() {
        let mut tracker = ChangeTracker::new();
        let e = loaded();
        tracker.track(&e, EntityState::Unchanged);
        e.set("Name", "Updated");
        assert_eq!(tracker.detect_changes(), 1);
        assert_eq!(tracker.state(&e), EntityState::Modified);
        let entry = tracker.entry(&e).unwrap();
        assert_eq!(
            entry.write_set(),
            vec![("Name".to_string(), Value::from("Updated"))]
        );
        assert_eq!(entry.snapshot().get("Name"), Some(&Value::from("Hello")));
    }

    #[test]
    fn marked_field_is_written_even_if_unchanged() {
        let mut tracker = ChangeTracker::new();
        let e = loaded();
        tracker.track(&e, EntityState::Unchanged);
        tracker.mark(&e, "Name").unwrap();
        assert_eq!(tracker.state(&e), EntityState::Modified);
        assert_eq!(tracker.entry(&e).unwrap().modified_fields(), vec!["Name"]);
    }

    #[test]
    fn marked_only_mode_ignores_other_changes() {
        let mut tracker = ChangeTracker::new();
        let e = Entity::new(&MY_ENTITY)
            .with("Id", 1)
            .with("Name", "Updated")
            .with("StartDate", "NewDate")
            .into_ref();
        tracker.track(&e, EntityState::Unchanged);
        tracker.set_update_mode(&e, UpdateMode::MarkedOnly).unwrap();
        tracker.mark(&e, "Name").unwrap();
        e.set("StartDate", "Other");
        assert_eq!(
            tracker.entry(&e).unwrap().write_set(),
            vec![("Name".to_string(), Value::from("Updated"))]
        );
    }

    #[test]
    fn fields_without_value_are_never_written() {
        let mut tracker = ChangeTracker::new();
        let e = Entity::new(&MY_ENTITY).with("Id", 1).into_ref();
        tracker.track(&e, EntityState::Unchanged);
        tracker.mark(&e, "Name").unwrap();
        assert!(tracker.entry(&e).unwrap().write_set().is_empty());
        e.set("Name", "Updated");
        assert_eq!(tracker.entry(&e).unwrap().modified_fields(), vec!["Name"]);
    }

    #[test]
    fn mark_errors() {
        let mut tracker = ChangeTracker::new();
        let e = loaded();
        let err = tracker.mark(&e, "Name").unwrap_err();
        assert_eq!(err.tracking_kind(), Some(TrackingErrorKind::NotTracked));
        tracker.track(&e, EntityState::Unchanged);
        let err = tracker.mark(&e, "Nope").unwrap_err();
        assert_eq!(err.tracking_kind(), Some(TrackingErrorKind::UnknownField));
    }

    #[test]
    fn accept_changes_resets_entry() {
        let mut tracker = ChangeTracker::new();
        let e = loaded();
        tracker.track(&e, EntityState::Added);
        tracker.mark(&e, "Name").unwrap();
        e.set("Name", "Bye");
        tracker.accept_changes(&e);
        let entry = tracker.entry(&e).unwrap();
        assert_eq!(entry.state(), EntityState::Unchanged);
        assert!(entry.marked().is_empty());
        assert!(entry.changed_fields().is_empty());
    }

    #[test]
    fn entries_keep_tracking_order() {
        let mut tracker = ChangeTracker::new();
        let a = loaded();
        let b = Entity::new(&MY_ENTITY).with("Id", 2).into_ref();
        tracker.track(&b, EntityState::Added);
        tracker.track(&a, EntityState::Unchanged);
        tracker.track(&b, EntityState::Modified);
        let order: Vec<_> = tracker.iter().map(|e| e.entity().key()).collect();
        assert_eq!(order, vec![Some(Value::Int(2)), Some(Value::Int(1))]);
        assert_eq!(tracker.entities_of("MyEntity").count(), 2);
        tracker.remove(&b);
        assert_eq!(tracker.state(&b), EntityState::Detached);
        tracker.clear();
        assert!(tracker.is_empty());
    }
}
