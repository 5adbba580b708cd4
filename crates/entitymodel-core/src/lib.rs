//! Core types and traits for EntityModel.
//!
//! This crate provides the foundational abstractions shared by the query,
//! session and store crates:
//!
//! - `Value` and `Row` for dynamically-typed field data
//! - `EntityDescriptor` / `NavigationInfo` static metadata and the `EntityRegistry`
//! - `Entity` / `EntityRef` live instances with navigation slots
//! - `NavigationTree` describing which relationships to load eagerly
//! - `Filter` predicates evaluated by store adapters
//! - `Store` trait for pluggable store adapters
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod descriptor;
pub mod entity;
pub mod error;
pub mod filter;
pub mod navigation;
pub mod row;
pub mod store;
pub mod value;

pub use descriptor::{
    Cardinality, EntityDescriptor, EntityRegistry, EntityRegistryBuilder, ForeignKey,
    NavigationInfo, NavigationKind,
};
pub use entity::{Entity, EntityRef, Navigation, WeakEntityRef};
pub use error::{
    ConfigError, Error, NavigationError, NavigationErrorKind, QueryError, QueryErrorKind, Result,
    SchemaError, SchemaErrorKind, TrackingError, TrackingErrorKind, TypeError,
};
pub use filter::{Filter, FilterTarget};
pub use navigation::{NavigationNode, NavigationTree};
pub use row::{ColumnInfo, FromValue, Row};
pub use store::{BatchResult, KeyLink, RowGroup, Store, TrackingMode, WriteBatch, WriteOp};
pub use value::Value;
