//! Sessions for EntityModel.
//!
//! `entitymodel-session` is the **unit-of-work layer**. A [`Session`] binds a
//! store handle to one identity map and one change tracker:
//!
//! - **Identity map**: one live instance per (entity type, key) in a session.
//! - **Change tracking**: snapshots of loaded values, diffed on commit.
//! - **Graph materialization**: fetched row groups become wired entity graphs,
//!   tracked or untracked according to the query.
//!
//! Sessions are independent: two sessions loading the same key produce two
//! distinct instances. All store I/O goes through `Cx` + `Outcome`.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(store, registry);
//!
//! let parents = session
//!     .query(&cx, &Query::new(&PARENT).include("Children"))
//!     .await;
//!
//! parents[0].set("Name", "Updated");
//! session.commit(&cx).await;
//! ```

pub mod change_tracker;
pub mod fixup;
pub mod flush;
pub mod identity_map;
pub mod materialize;
pub mod unit_of_work;

pub use change_tracker::{ChangeTracker, EntityState, Snapshot, TrackedEntry, UpdateMode};
pub use flush::{FlushOrderer, FlushPlan, FlushResult};
pub use identity_map::{IdentityMap, ObjectKey};
pub use materialize::Materializer;
pub use unit_of_work::{PendingCounts, PendingOp, UnitOfWork};

use entitymodel_core::{
    ConfigError, Cx, EntityDescriptor, EntityRef, EntityRegistry, Error, Filter, Navigation,
    NavigationErrorKind, Outcome, Result, SchemaErrorKind, Store, TrackingErrorKind, TrackingMode,
    Value, WriteOp,
};
use entitymodel_query::{Query, validate_auto_includes};
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

// ============================================================================
// Session Configuration
// ============================================================================

/// Placeholder for field values in log events.
const REDACTED: &str = "<redacted>";

/// Configuration for session behavior.
///
/// ```ignore
/// let config = SessionConfig::from_json(r#"{"tracking": "untracked"}"#)?;
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Default tracking mode for queries without an override.
    pub tracking: TrackingMode,
    /// Whether field and key values may appear in log events.
    pub sensitive_data_logging: bool,
    /// Extra navigations loaded by default, as `"Entity.Navigation"`.
    pub auto_include: Vec<String>,
}

impl SessionConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON. Unknown keys are rejected.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid session configuration: {}", e),
                source: Some(Box::new(e)),
            })
        })
    }

    /// Set the default tracking mode.
    pub fn tracking(mut self, mode: TrackingMode) -> Self {
        self.tracking = mode;
        self
    }

    /// Allow field values in log events.
    pub fn sensitive_data_logging(mut self, enabled: bool) -> Self {
        self.sensitive_data_logging = enabled;
        self
    }

    /// Load `"Entity.Navigation"` by default.
    pub fn auto_include(mut self, navigation: impl Into<String>) -> Self {
        self.auto_include.push(navigation.into());
        self
    }

    /// Render a value for a log event.
    fn render(&self, value: &Value) -> String {
        if self.sensitive_data_logging {
            value.to_string()
        } else {
            REDACTED.to_string()
        }
    }

    fn render_key(&self, key: Option<&Value>) -> String {
        key.map_or_else(|| "none".to_string(), |k| self.render(k))
    }

    fn render_fields(&self, values: &[(String, Value)]) -> String {
        values
            .iter()
            .map(|(field, value)| format!("{}={}", field, self.render(value)))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// ============================================================================
// Session
// ============================================================================

/// The unit-of-work scope over one store.
///
/// Every mutating operation takes `&mut self`; a session is driven by a
/// single logical thread of control.
pub struct Session<S: Store> {
    store: Arc<S>,
    registry: Arc<EntityRegistry>,
    config: SessionConfig,
    identity: IdentityMap,
    tracker: ChangeTracker,
}

impl<S: Store> Session<S> {
    /// Create a session with the default configuration.
    pub fn new(store: Arc<S>, registry: Arc<EntityRegistry>) -> Self {
        Self {
            store,
            registry,
            config: SessionConfig::default(),
            identity: IdentityMap::new(),
            tracker: ChangeTracker::new(),
        }
    }

    /// Create a session with a custom configuration.
    ///
    /// Fails if a configured auto-include does not name a declared
    /// navigation.
    pub fn with_config(
        store: Arc<S>,
        registry: Arc<EntityRegistry>,
        config: SessionConfig,
    ) -> Result<Self> {
        validate_auto_includes(&registry, &config.auto_include)?;
        Ok(Self {
            config,
            ..Self::new(store, registry)
        })
    }

    /// A sibling session on the same store with nothing tracked.
    pub fn fork(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            identity: IdentityMap::new(),
            tracker: ChangeTracker::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity
    }

    pub fn change_tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Track `entity` and every untracked entity reachable from it through
    /// populated navigations as `Added`.
    ///
    /// Foreign keys are copied from principals with known keys, and
    /// navigations are fixed up against entities already tracked. Nothing
    /// changes if any entity of the graph conflicts with a tracked key.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = entity.descriptor().name))]
    pub fn add(&mut self, entity: &EntityRef) -> Result<()> {
        let graph = self.untracked_graph(entity);
        let mut scratch = IdentityMap::new();
        for member in &graph {
            self.check_registered(member)?;
            member.read().check_fields()?;
            if self.identity.conflicts(member) {
                return Err(self.conflict(member));
            }
            scratch.register(member)?;
        }

        for member in &graph {
            self.tracker.track(member, EntityState::Added);
            self.identity.register(member)?;
        }
        UnitOfWork::new(&self.registry, &self.tracker).sync_foreign_keys();
        for member in &graph {
            self.link_inverses(member);
            fixup::fix_up(&self.registry, &self.identity, &self.tracker, member);
        }
        tracing::debug!(added = graph.len(), "Added entity graph");
        Ok(())
    }

    /// Point the inverse navigations of related entities back at `holder`.
    fn link_inverses(&self, holder: &EntityRef) {
        let descriptor = holder.descriptor();
        for info in descriptor.navigations {
            let Some(slot) = holder.navigation(info.name) else {
                continue;
            };
            let Some(inverse) = fixup::inverse_of(&self.registry, descriptor, info) else {
                continue;
            };
            for related in slot.entities() {
                fixup::link(&related, inverse, holder);
            }
        }
    }

    /// Untracked entities reachable from `root`, root first. Traversal does
    /// not continue through tracked entities other than the root.
    fn untracked_graph(&self, root: &EntityRef) -> Vec<EntityRef> {
        let mut seen: HashSet<usize> = HashSet::new();
        let mut queue = VecDeque::from([root.clone()]);
        let mut graph = Vec::new();
        seen.insert(root.addr());
        while let Some(current) = queue.pop_front() {
            let tracked = self.tracker.is_tracked(&current);
            if tracked && !current.ptr_eq(root) {
                continue;
            }
            if !tracked {
                graph.push(current.clone());
            }
            for next in current.read().related_entities() {
                if seen.insert(next.addr()) {
                    queue.push_back(next);
                }
            }
        }
        graph
    }

    /// Start tracking one entity in a caller-chosen state.
    ///
    /// The snapshot is taken from the entity's current values. Attaching as
    /// `Modified` marks every non-key field.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = entity.descriptor().name))]
    pub fn attach(&mut self, entity: &EntityRef, state: EntityState) -> Result<()> {
        self.check_registered(entity)?;
        entity.read().check_fields()?;
        if state == EntityState::Detached {
            return Err(Error::tracking(
                TrackingErrorKind::InvalidState,
                entity.descriptor().name,
                "cannot attach an entity as Detached",
            ));
        }
        if self.identity.conflicts(entity) {
            return Err(self.conflict(entity));
        }
        if state != EntityState::Added && entity.key().is_none() {
            return Err(Error::tracking(
                TrackingErrorKind::InvalidState,
                entity.descriptor().name,
                format!(
                    "cannot attach a '{}' as {:?} without a key",
                    entity.descriptor().name,
                    state
                ),
            ));
        }
        self.tracker.track(entity, state);
        self.identity.register(entity)?;
        if state == EntityState::Modified {
            self.tracker.mark_all(entity)?;
        }
        fixup::fix_up(&self.registry, &self.identity, &self.tracker, entity);
        tracing::debug!(
            ?state,
            key = %entity.key().map_or_else(|| "none".to_string(), |k| self.config.render(&k)),
            "Attached entity"
        );
        Ok(())
    }

    /// Set the state of an entity, attaching it if untracked.
    ///
    /// `Modified` marks every field, `Unchanged` accepts the current values
    /// as the snapshot, `Detached` stops tracking.
    pub fn set_state(&mut self, entity: &EntityRef, state: EntityState) -> Result<()> {
        if !self.tracker.is_tracked(entity) {
            if state == EntityState::Detached {
                return Ok(());
            }
            return self.attach(entity, state);
        }
        match state {
            EntityState::Detached => {
                self.detach(entity);
            }
            EntityState::Unchanged => self.tracker.accept_changes(entity),
            EntityState::Modified => {
                self.tracker.set_state(entity, EntityState::Modified)?;
                self.tracker.mark_all(entity)?;
            }
            EntityState::Added | EntityState::Deleted => self.tracker.set_state(entity, state)?,
        }
        Ok(())
    }

    /// Schedule an entity for deletion.
    ///
    /// Removing an `Added` entity detaches it; removing an untracked entity
    /// attaches it as `Deleted`.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = entity.descriptor().name))]
    pub fn remove(&mut self, entity: &EntityRef) -> Result<()> {
        match self.tracker.state(entity) {
            EntityState::Added => {
                self.detach(entity);
                Ok(())
            }
            EntityState::Detached => self.attach(entity, EntityState::Deleted),
            _ => self.tracker.set_state(entity, EntityState::Deleted),
        }
    }

    /// Stop tracking one entity. Returns whether it was tracked.
    pub fn detach(&mut self, entity: &EntityRef) -> bool {
        let removed = self.tracker.remove(entity).is_some();
        if removed {
            self.identity.forget(entity);
            tracing::trace!(
                entity = entity.descriptor().name,
                key = %self.config.render_key(entity.key().as_ref()),
                "Detached entity"
            );
        }
        removed
    }

    /// Mark one field modified: it is written on commit even if unchanged.
    pub fn mark_modified(&mut self, entity: &EntityRef, field: &str) -> Result<()> {
        self.tracker.mark(entity, field)
    }

    /// Choose whether updates write changed and marked fields or marked
    /// fields only.
    pub fn set_update_mode(&mut self, entity: &EntityRef, mode: UpdateMode) -> Result<()> {
        self.tracker.set_update_mode(entity, mode)
    }

    /// Copy the given fields onto a tracked entity. Other fields keep their
    /// values.
    pub fn set_values<I, K, V>(&mut self, entity: &EntityRef, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.require_tracked(entity)?;
        let descriptor = entity.descriptor();
        let values: Vec<(String, Value)> = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if let Some((unknown, _)) = values.iter().find(|(f, _)| !descriptor.has_field(f)) {
            return Err(Error::tracking(
                TrackingErrorKind::UnknownField,
                descriptor.name,
                format!("'{}' has no field '{}'", descriptor.name, unknown),
            ));
        }
        entity.write().set_values(values);
        Ok(())
    }

    /// Copy every field of `source` onto a tracked entity; fields `source`
    /// lacks become NULL.
    pub fn set_values_from(&mut self, entity: &EntityRef, source: &EntityRef) -> Result<()> {
        self.require_tracked(entity)?;
        if entity.ptr_eq(source) {
            return Ok(());
        }
        let source = source.read().clone();
        entity.write().set_values_from(&source);
        Ok(())
    }

    /// Tracking state of an entity (`Detached` when untracked).
    pub fn state_of(&self, entity: &EntityRef) -> EntityState {
        self.tracker.state(entity)
    }

    /// Snapshot value of a field of a tracked entity.
    pub fn original_value(&self, entity: &EntityRef, field: &str) -> Option<Value> {
        self.tracker.entry(entity)?.snapshot().get(field).cloned()
    }

    /// Current value of a field of a tracked entity.
    pub fn current_value(&self, entity: &EntityRef, field: &str) -> Option<Value> {
        if !self.tracker.is_tracked(entity) {
            return None;
        }
        entity.get(field)
    }

    /// Fields an update of this entity would write.
    pub fn modified_fields(&self, entity: &EntityRef) -> Vec<String> {
        self.tracker
            .entry(entity)
            .map(TrackedEntry::modified_fields)
            .unwrap_or_default()
    }

    /// Track new keyless entities reachable from tracked ones, then move
    /// changed `Unchanged` entries to `Modified`.
    ///
    /// Returns how many entries changed state.
    pub fn detect_changes(&mut self) -> Result<usize> {
        let reachable: Vec<EntityRef> = self
            .tracker
            .iter()
            .filter(|e| e.state() != EntityState::Deleted)
            .flat_map(|e| e.entity().read().related_entities())
            .filter(|e| !self.tracker.is_tracked(e) && e.key().is_none())
            .collect();
        for entity in &reachable {
            if !self.tracker.is_tracked(entity) {
                self.add(entity)?;
            }
        }
        Ok(self.tracker.detect_changes())
    }

    /// Drop every tracked entry and empty the identity map.
    pub fn clear(&mut self) {
        tracing::debug!(dropped = self.tracker.len(), "Clearing session");
        self.tracker.clear();
        self.identity.clear();
    }

    /// Number of tracked entries.
    pub fn tracked_count(&self) -> usize {
        self.tracker.len()
    }

    /// Pending writes by kind, after detecting changes.
    pub fn pending_counts(&mut self) -> Result<PendingCounts> {
        self.detect_changes()?;
        Ok(UnitOfWork::new(&self.registry, &self.tracker).pending_counts())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Run a query and materialize its results.
    #[tracing::instrument(level = "debug", skip(self, cx, query), fields(root = query.root().name))]
    pub async fn query(&mut self, cx: &Cx, query: &Query) -> Outcome<Vec<EntityRef>, Error> {
        let resolved =
            match query.resolve(&self.registry, self.config.tracking, &self.config.auto_include) {
                Ok(resolved) => resolved,
                Err(e) => return Outcome::Err(e),
            };
        let groups = match self
            .store
            .query(cx, &resolved.tree, &resolved.filter, resolved.limit)
            .await
        {
            Outcome::Ok(groups) => groups,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let materialized = Materializer::new(
            &self.registry,
            &mut self.identity,
            &mut self.tracker,
            resolved.tracking,
        )
        .with_projection(resolved.projection.as_ref())
        .materialize(&resolved.tree, &groups);
        match materialized {
            Ok(entities) => Outcome::Ok(entities),
            Err(e) => Outcome::Err(e),
        }
    }

    /// The first result of a query, if any.
    pub async fn first(&mut self, cx: &Cx, query: &Query) -> Outcome<Option<EntityRef>, Error> {
        let limited = query.clone().limit(1);
        match self.query(cx, &limited).await {
            Outcome::Ok(entities) => Outcome::Ok(entities.into_iter().next()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Count rows matching a query's filter.
    pub async fn count(&mut self, cx: &Cx, query: &Query) -> Outcome<u64, Error> {
        let resolved =
            match query.resolve(&self.registry, self.config.tracking, &self.config.auto_include) {
                Ok(resolved) => resolved,
                Err(e) => return Outcome::Err(e),
            };
        self.store
            .count(cx, resolved.tree.root(), &resolved.filter)
            .await
    }

    /// Find an entity by key.
    ///
    /// A tracked instance is returned without I/O; otherwise the store is
    /// queried and the result tracked. A miss returns `None`.
    #[tracing::instrument(level = "debug", skip(self, cx, entity, key), fields(entity = entity.name))]
    pub async fn find(
        &mut self,
        cx: &Cx,
        entity: &'static EntityDescriptor,
        key: impl Into<Value>,
    ) -> Outcome<Option<EntityRef>, Error> {
        let key = key.into();
        if let Some(found) = self.identity.resolve(entity, &key) {
            tracing::trace!(key = %self.config.render(&key), "Found in identity map");
            return Outcome::Ok(Some(found));
        }
        let query = Query::new(entity).key(key).as_tracking();
        self.first(cx, &query).await
    }

    /// Load one navigation of a materialized entity, optionally filtered,
    /// populate its slot and return the loaded entities.
    #[tracing::instrument(level = "debug", skip(self, cx, entity, filter), fields(entity = entity.descriptor().name))]
    pub async fn load_navigation(
        &mut self,
        cx: &Cx,
        entity: &EntityRef,
        navigation: &str,
        filter: Option<Filter>,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let descriptor = entity.descriptor();
        let Some(info) = descriptor.navigation(navigation) else {
            return Outcome::Err(Error::navigation(
                NavigationErrorKind::UnknownNavigation,
                navigation,
                format!("'{}' has no navigation '{}'", descriptor.name, navigation),
            ));
        };
        let target = match self.registry.target_of(info) {
            Ok(target) => target,
            Err(e) => return Outcome::Err(e),
        };

        let related = if info.key_on_target() {
            entity.key().map(|key| Filter::eq(info.foreign_key, key))
        } else {
            entity
                .get(info.foreign_key)
                .filter(|v| !v.is_null())
                .map(|fk| Filter::eq(target.key, fk))
        };
        let Some(related) = related else {
            let empty = if info.is_many() {
                Navigation::Many(Vec::new())
            } else {
                Navigation::Single(None)
            };
            entity.write().set_navigation(info.name, empty);
            return Outcome::Ok(Vec::new());
        };

        let mut query = Query::new(target).filter(related);
        if let Some(filter) = filter {
            query = query.filter(filter);
        }
        query = if self.tracker.is_tracked(entity) {
            query.as_tracking()
        } else {
            query.as_no_tracking()
        };
        let loaded = match self.query(cx, &query).await {
            Outcome::Ok(loaded) => loaded,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let slot = if info.is_many() {
            Navigation::Many(loaded.clone())
        } else {
            Navigation::Single(loaded.first().cloned())
        };
        entity.write().set_navigation(info.name, slot);
        if let Some(inverse) = fixup::inverse_of(&self.registry, descriptor, info) {
            for related in &loaded {
                fixup::link_inverse(related, inverse, entity);
            }
        }
        tracing::debug!(navigation, loaded = loaded.len(), "Loaded navigation");
        Outcome::Ok(loaded)
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Write every pending change to the store as one batch.
    ///
    /// On success inserted entities receive their store keys, written
    /// entities become `Unchanged` and deleted ones stop being tracked. On
    /// failure tracker states are left exactly as they were.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let ops = match self.pending_ops() {
            Ok(ops) => ops,
            Err(e) => return Outcome::Err(e),
        };
        let plan = FlushOrderer::new(&self.registry).order(ops);
        if plan.is_empty() {
            self.accept_unwritten();
            tracing::debug!("Nothing to commit");
            return Outcome::Ok(FlushResult::new());
        }

        let (batch, entities) = plan.to_batch();
        for op in &batch.ops {
            match op {
                WriteOp::Insert { entity, values, .. } => {
                    tracing::trace!(entity = entity.name, values = %self.config.render_fields(values), "INSERT");
                }
                WriteOp::Update {
                    entity,
                    key,
                    values,
                } => {
                    tracing::trace!(
                        entity = entity.name,
                        key = %self.config.render(key),
                        values = %self.config.render_fields(values),
                        "UPDATE"
                    );
                }
                WriteOp::Delete { entity, key } => {
                    tracing::trace!(entity = entity.name, key = %self.config.render(key), "DELETE");
                }
            }
        }

        let applied = match self.store.apply(cx, &batch).await {
            Outcome::Ok(applied) => applied,
            Outcome::Err(e) => {
                tracing::warn!(
                    error = %e,
                    key = %self.config.render_key(e.key()),
                    "Commit failed; tracked entries unchanged"
                );
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        for (index, (op, entity)) in batch.ops.iter().zip(&entities).enumerate() {
            match op {
                WriteOp::Insert { key_links, .. } => {
                    if entity.key().is_none() {
                        if let Some(Some(key)) = applied.assigned_keys.get(index) {
                            entity.set(entity.descriptor().key, key.clone());
                        }
                    }
                    for link in key_links {
                        if let Some(Some(key)) = applied.assigned_keys.get(link.source) {
                            entity.set(&link.field, key.clone());
                        }
                    }
                    if let Err(e) = self.identity.register(entity) {
                        tracing::warn!(
                            error = %e,
                            key = %self.config.render_key(e.key()),
                            "Inserted entity conflicts with a tracked key"
                        );
                    }
                    self.tracker.accept_changes(entity);
                }
                WriteOp::Update { .. } => self.tracker.accept_changes(entity),
                WriteOp::Delete { .. } => {
                    self.tracker.remove(entity);
                    self.identity.forget(entity);
                }
            }
        }
        self.accept_unwritten();

        let result = FlushResult {
            inserted: applied.inserted,
            updated: applied.updated,
            deleted: applied.deleted,
        };
        tracing::info!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Committed"
        );
        Outcome::Ok(result)
    }

    /// Synchronize navigations into foreign keys, detect changes and
    /// collect the resulting writes.
    fn pending_ops(&mut self) -> Result<Vec<PendingOp>> {
        self.detect_changes()?;
        UnitOfWork::new(&self.registry, &self.tracker).sync_foreign_keys();
        self.tracker.detect_changes();
        UnitOfWork::new(&self.registry, &self.tracker).collect()
    }

    /// `Modified` entries with nothing to write become `Unchanged`.
    fn accept_unwritten(&mut self) {
        let modified: Vec<EntityRef> = self
            .tracker
            .iter()
            .filter(|e| e.state() == EntityState::Modified)
            .map(|e| e.entity().clone())
            .collect();
        for entity in &modified {
            self.tracker.accept_changes(entity);
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn check_registered(&self, entity: &EntityRef) -> Result<()> {
        match self.registry.get(entity.descriptor().name) {
            Some(_) => Ok(()),
            None => Err(Error::schema(
                SchemaErrorKind::UnknownEntity,
                format!("entity '{}' is not registered", entity.descriptor().name),
            )),
        }
    }

    fn require_tracked(&self, entity: &EntityRef) -> Result<()> {
        if self.tracker.is_tracked(entity) {
            Ok(())
        } else {
            Err(Error::tracking(
                TrackingErrorKind::NotTracked,
                entity.descriptor().name,
                format!(
                    "this '{}' instance is not tracked by this session",
                    entity.descriptor().name
                ),
            ))
        }
    }

    fn conflict(&self, entity: &EntityRef) -> Error {
        let error = Error::tracking(
            TrackingErrorKind::Conflict,
            entity.descriptor().name,
            format!(
                "another '{}' instance with the same key is already tracked",
                entity.descriptor().name
            ),
        );
        match entity.key() {
            Some(key) => error.with_key(key),
            None => error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use entitymodel_core::{Entity, NavigationInfo, NavigationKind};
    use entitymodel_memory::MemoryStore;

    static PARENT: EntityDescriptor = EntityDescriptor::new("Parent", "Id", &["Id", "Name"])
        .navigations(&[
            NavigationInfo::new("Children", "Child", NavigationKind::OneToMany)
                .foreign_key("ParentId"),
        ])
        .generated_key(true);
    static CHILD: EntityDescriptor =
        EntityDescriptor::new("Child", "Id", &["Id", "Name", "ParentId"]).navigations(&[
            NavigationInfo::new("Parent", "Parent", NavigationKind::ManyToOne)
                .foreign_key("ParentId"),
        ])
        .generated_key(true);

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn session() -> Session<MemoryStore> {
        let registry = Arc::new(
            EntityRegistry::builder()
                .register(&PARENT)
                .register(&CHILD)
                .build()
                .unwrap(),
        );
        let store = Arc::new(MemoryStore::new(Arc::clone(&registry)));
        Session::new(store, registry)
    }

    fn family() -> EntityRef {
        let children = ["Child1", "Child2"]
            .into_iter()
            .map(|name| Entity::new(&CHILD).with("Name", name).into_ref())
            .collect();
        Entity::new(&PARENT)
            .with("Name", "Parent")
            .with_many("Children", children)
            .into_ref()
    }

    #[test]
    fn config_from_json() {
        let config =
            SessionConfig::from_json(r#"{"tracking": "untracked", "sensitive_data_logging": true}"#)
                .unwrap();
        assert_eq!(config.tracking, TrackingMode::Untracked);
        assert!(config.sensitive_data_logging);
        assert_eq!(config.render(&Value::Int(3)), "3");
        assert_eq!(SessionConfig::new().render(&Value::Int(3)), REDACTED);

        let err = SessionConfig::from_json(r#"{"auto_flush": true}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn with_config_rejects_unknown_auto_include() {
        let base = session();
        let config = SessionConfig::new().auto_include("Parent.Nope");
        let result = Session::with_config(
            Arc::clone(base.store()),
            Arc::new(EntityRegistry::builder().register(&PARENT).register(&CHILD).build().unwrap()),
            config,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn commit_assigns_keys_through_the_graph() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut session = session();

        rt.block_on(async {
            let parent = family();
            session.add(&parent).unwrap();
            assert_eq!(session.tracked_count(), 3);
            assert_eq!(session.pending_counts().unwrap().new, 3);

            let result = unwrap_outcome(session.commit(&cx).await);
            assert_eq!(result.inserted, 3);
            assert_eq!(result.total(), 3);

            let key = parent.key().unwrap();
            for child in parent.many("Children").unwrap() {
                assert!(child.get("ParentId").unwrap().key_eq(&key));
                assert_eq!(session.state_of(&child), EntityState::Unchanged);
                assert!(child.one("Parent").unwrap().unwrap().ptr_eq(&parent));
            }
            assert!(session.pending_counts().unwrap().is_empty());
        });
    }

    #[test]
    fn find_uses_identity_map_and_fork_is_isolated() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut session = session();

        rt.block_on(async {
            let parent = family();
            session.add(&parent).unwrap();
            unwrap_outcome(session.commit(&cx).await);
            let key = parent.key().unwrap();

            let found = unwrap_outcome(session.find(&cx, &PARENT, key.clone()).await).unwrap();
            assert!(found.ptr_eq(&parent));

            let mut other = session.fork();
            assert_eq!(other.tracked_count(), 0);
            let theirs = unwrap_outcome(other.find(&cx, &PARENT, key).await).unwrap();
            assert!(!theirs.ptr_eq(&parent));
            assert!(theirs.many("Children").is_none());

            assert!(unwrap_outcome(session.find(&cx, &PARENT, 999).await).is_none());
        });
    }

    #[test]
    fn failed_commit_leaves_states_alone() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut session = session();

        rt.block_on(async {
            let orphan = Entity::new(&CHILD)
                .with("Name", "Orphan")
                .with("ParentId", 42)
                .into_ref();
            session.add(&orphan).unwrap();
            let outcome = session.commit(&cx).await;
            assert!(matches!(outcome, Outcome::Err(ref e) if e.is_constraint_violation()));
            assert_eq!(session.state_of(&orphan), EntityState::Added);
            assert!(orphan.key().is_none());
        });
    }

    #[test]
    fn attach_conflict_and_not_tracked_errors() {
        let mut session = session();
        let a = Entity::new(&PARENT).with("Id", 1).into_ref();
        let b = Entity::new(&PARENT).with("Id", 1).into_ref();
        session.attach(&a, EntityState::Unchanged).unwrap();
        let err = session.attach(&b, EntityState::Unchanged).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(session.state_of(&b), EntityState::Detached);

        let err = session.mark_modified(&b, "Name").unwrap_err();
        assert_eq!(err.tracking_kind(), Some(TrackingErrorKind::NotTracked));
        let err = session.mark_modified(&a, "Nope").unwrap_err();
        assert_eq!(err.tracking_kind(), Some(TrackingErrorKind::UnknownField));

        session.clear();
        assert_eq!(session.tracked_count(), 0);
        session.attach(&b, EntityState::Unchanged).unwrap();
    }

    #[test]
    fn remove_added_detaches() {
        let mut session = session();
        let parent = Entity::new(&PARENT).with("Name", "New").into_ref();
        session.add(&parent).unwrap();
        session.remove(&parent).unwrap();
        assert_eq!(session.state_of(&parent), EntityState::Detached);
        assert_eq!(session.tracked_count(), 0);
    }
}
