//! In-memory store adapter for EntityModel.
//!
//! `entitymodel-memory` implements the `Store` trait from `entitymodel-core`
//! over plain tables held in memory. It is the reference adapter: sessions,
//! materialization and flush ordering are exercised against it.
//!
//! - Rows keep insertion order; every declared field is present (NULL when
//!   never written).
//! - Entities declared with generated keys receive the next integer key when
//!   an insert carries no key.
//! - Duplicate keys and foreign keys naming a missing principal are
//!   constraint violations.
//! - `apply` is atomic: a failing batch leaves every table as it was.
//!
//! # Thread Safety
//!
//! `MemoryStore` is `Send + Sync` and cheap to clone; clones share tables
//! through an `Arc<Mutex<_>>`.

pub mod store;

pub use store::{MemoryStore, StoreOp};
