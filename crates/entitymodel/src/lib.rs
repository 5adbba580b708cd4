//! EntityModel - identity map, change tracking and eager loading for entity
//! graphs.
//!
//! EntityModel keeps a session-scoped view over a store:
//!
//! - Explicit static descriptors for entity types and their navigations
//! - One live instance per key within a session (identity map)
//! - Snapshot-based change tracking with field-level updates on commit
//! - Eager loading of navigation paths with `include` / `then_include`
//! - Tracked, untracked and untracked-with-identity queries
//!
//! # Quick Start
//!
//! ```ignore
//! use entitymodel::prelude::*;
//!
//! static PARENT: EntityDescriptor = EntityDescriptor::new("Parent", "Id", &["Id", "Name"])
//!     .navigations(&[NavigationInfo::new("Children", "Child", NavigationKind::OneToMany)
//!         .foreign_key("ParentId")])
//!     .generated_key(true);
//! static CHILD: EntityDescriptor =
//!     EntityDescriptor::new("Child", "Id", &["Id", "Name", "ParentId"]).generated_key(true);
//!
//! async fn example(cx: &Cx, registry: EntityRegistry) -> Result<()> {
//!     let mut session = SessionBuilder::new(registry).in_memory()?;
//!
//!     let parent = Entity::new(&PARENT).with("Name", "Parent").into_ref();
//!     session.add(&parent)?;
//!     let _ = session.commit(cx).await;
//!
//!     let loaded = session
//!         .query(cx, &Query::new(&PARENT).include("Children").as_no_tracking())
//!         .await;
//!     Ok(())
//! }
//! ```

pub use entitymodel_core::{
    BatchResult, Cardinality, ColumnInfo, Cx, Entity, EntityDescriptor, EntityRef, EntityRegistry,
    EntityRegistryBuilder, Error, Filter, FilterTarget, ForeignKey, FromValue, KeyLink,
    Navigation, NavigationError, NavigationErrorKind, NavigationInfo, NavigationKind,
    NavigationNode, NavigationTree, Outcome, QueryError, QueryErrorKind, Result, Row, RowGroup,
    SchemaError, SchemaErrorKind, Store, TrackingError, TrackingErrorKind, TrackingMode, Value,
    WeakEntityRef, WriteBatch, WriteOp,
};
pub use entitymodel_memory::{MemoryStore, StoreOp};
pub use entitymodel_query::{IncludeDirective, Includes, Projection, Query, ResolvedQuery};
pub use entitymodel_session::{
    ChangeTracker, EntityState, FlushResult, IdentityMap, PendingCounts, Session, SessionConfig,
    UpdateMode,
};

pub use asupersync::runtime::RuntimeBuilder;

use std::sync::Arc;

/// Builds sessions over a shared registry.
///
/// ```ignore
/// let mut session = SessionBuilder::new(registry)
///     .tracking(TrackingMode::Untracked)
///     .in_memory()?;
/// ```
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    registry: Arc<EntityRegistry>,
    config: SessionConfig,
}

impl SessionBuilder {
    /// Create a builder with the default configuration.
    pub fn new(registry: EntityRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            config: SessionConfig::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Default tracking mode for queries.
    pub fn tracking(mut self, mode: TrackingMode) -> Self {
        self.config = self.config.tracking(mode);
        self
    }

    /// Allow field values in log events.
    pub fn sensitive_data_logging(mut self, enabled: bool) -> Self {
        self.config = self.config.sensitive_data_logging(enabled);
        self
    }

    /// Load `"Entity.Navigation"` by default.
    pub fn auto_include(mut self, navigation: impl Into<String>) -> Self {
        self.config = self.config.auto_include(navigation);
        self
    }

    /// The shared registry.
    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    /// Open a session on an existing store.
    pub fn open<S: Store>(&self, store: Arc<S>) -> Result<Session<S>> {
        Session::with_config(store, Arc::clone(&self.registry), self.config.clone())
    }

    /// A fresh in-memory store for this registry.
    pub fn memory_store(&self) -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(Arc::clone(&self.registry)))
    }

    /// Open a session on a fresh in-memory store.
    pub fn in_memory(&self) -> Result<Session<MemoryStore>> {
        self.open(self.memory_store())
    }
}

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        // asupersync
        Cx,
        Outcome,
        RuntimeBuilder,
        // Descriptors and entities
        Entity,
        EntityDescriptor,
        EntityRef,
        EntityRegistry,
        Navigation,
        NavigationInfo,
        NavigationKind,
        // Errors
        Error,
        Result,
        // Queries
        Filter,
        Query,
        TrackingMode,
        // Sessions and stores
        EntityState,
        MemoryStore,
        Session,
        SessionBuilder,
        SessionConfig,
        Store,
        UpdateMode,
        Value,
    };
}
