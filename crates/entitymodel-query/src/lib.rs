//! Query construction for EntityModel.
//!
//! `entitymodel-query` turns caller directives into something a store adapter
//! can execute:
//!
//! - **Includes**: `include` / `then_include` directives resolved into a
//!   `NavigationTree`, with path grammar checked before any I/O.
//! - **Default loads**: owned and auto-included navigations added per query.
//! - **Query**: filter, tracking override, limit and projection options,
//!   resolved against an `EntityRegistry` into a `ResolvedQuery`.
//!
//! Queries execute through a `Session` from `entitymodel-session`.

pub mod include;
pub mod query;

pub use include::{IncludeDirective, Includes, apply_default_includes, validate_auto_includes};
pub use query::{Projection, Query, ResolvedQuery};
