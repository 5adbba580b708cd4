//! The store adapter contract.
//!
//! A store adapter persists rows for registered entity types and answers
//! path-aware fetches. Everything above it (identity, tracking, graph
//! wiring) lives in the session crate; the adapter only sees field values,
//! filters and navigation trees.

use crate::descriptor::EntityDescriptor;
use crate::error::{Error, QueryError, QueryErrorKind};
use crate::filter::Filter;
use crate::navigation::NavigationTree;
use crate::row::Row;
use crate::value::Value;
use crate::{Cx, Outcome};
use serde::Deserialize;
use std::future::Future;

/// How query results are associated with a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    /// Results are identity-resolved against and registered in the session.
    #[default]
    Tracked,
    /// Results are fresh instances, never registered.
    Untracked,
    /// Results are de-duplicated within one fetch, never registered.
    UntrackedWithIdentity,
}

/// The rows fetched for one entity plus, per requested navigation, the
/// row groups of its related entities.
#[derive(Debug, Clone)]
pub struct RowGroup {
    pub row: Row,
    pub navigations: Vec<(String, Vec<RowGroup>)>,
}

impl RowGroup {
    /// A row group with no navigation rows.
    pub fn new(row: Row) -> Self {
        Self {
            row,
            navigations: Vec::new(),
        }
    }

    /// Attach the row groups fetched through a navigation.
    #[must_use]
    pub fn with_navigation(mut self, name: impl Into<String>, groups: Vec<RowGroup>) -> Self {
        self.navigations.push((name.into(), groups));
        self
    }

    /// Row groups fetched through `name`; `None` if the adapter sent none.
    pub fn navigation(&self, name: &str) -> Option<&[RowGroup]> {
        self.navigations
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, groups)| groups.as_slice())
    }
}

/// Copies a key assigned by an earlier insert into a field of a later one.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyLink {
    /// Field of the inserting row that receives the key.
    pub field: String,
    /// Index in the batch of the insert whose key is copied.
    pub source: usize,
}

/// One write in a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert {
        entity: &'static EntityDescriptor,
        values: Vec<(String, Value)>,
        key_links: Vec<KeyLink>,
    },
    Update {
        entity: &'static EntityDescriptor,
        key: Value,
        values: Vec<(String, Value)>,
    },
    Delete {
        entity: &'static EntityDescriptor,
        key: Value,
    },
}

impl WriteOp {
    /// Entity the write targets.
    pub fn entity(&self) -> &'static EntityDescriptor {
        match self {
            WriteOp::Insert { entity, .. }
            | WriteOp::Update { entity, .. }
            | WriteOp::Delete { entity, .. } => entity,
        }
    }

    /// Check if this is an insert operation.
    pub fn is_insert(&self) -> bool {
        matches!(self, WriteOp::Insert { .. })
    }
}

/// An ordered set of writes submitted as one logical unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Resolve key links of the insert at `index` against keys assigned so far.
    pub fn linked_values(&self, index: usize, assigned: &[Option<Value>]) -> Vec<(String, Value)> {
        let Some(WriteOp::Insert {
            values, key_links, ..
        }) = self.ops.get(index)
        else {
            return Vec::new();
        };
        let mut values = values.clone();
        for link in key_links {
            let Some(Some(key)) = assigned.get(link.source) else {
                continue;
            };
            if let Some(slot) = values.iter_mut().find(|(f, _)| *f == link.field) {
                slot.1 = key.clone();
            } else {
                values.push((link.field.clone(), key.clone()));
            }
        }
        values
    }
}

/// Outcome of a successfully applied batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    /// Per batch op: the key assigned by an insert, `None` for other ops.
    pub assigned_keys: Vec<Option<Value>>,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// A pluggable store adapter.
///
/// All operations are cancel-correct: they take a `Cx` and return an
/// asupersync `Outcome`.
pub trait Store: Send + Sync {
    /// Insert a row and return its key (assigned by the store when the
    /// values carry a NULL or missing key and the entity has generated keys).
    fn insert(
        &self,
        cx: &Cx,
        entity: &'static EntityDescriptor,
        values: &[(String, Value)],
    ) -> impl Future<Output = Outcome<Value, Error>> + Send;

    /// Update the given fields of one row. Returns `false` if no row has `key`.
    fn update(
        &self,
        cx: &Cx,
        entity: &'static EntityDescriptor,
        key: &Value,
        values: &[(String, Value)],
    ) -> impl Future<Output = Outcome<bool, Error>> + Send;

    /// Delete one row. Returns `false` if no row has `key`.
    fn delete(
        &self,
        cx: &Cx,
        entity: &'static EntityDescriptor,
        key: &Value,
    ) -> impl Future<Output = Outcome<bool, Error>> + Send;

    /// Fetch root rows of `tree.root()` matching `filter`, in store order,
    /// each with the row groups of every navigation in `tree`.
    fn query(
        &self,
        cx: &Cx,
        tree: &NavigationTree,
        filter: &Filter,
        limit: Option<usize>,
    ) -> impl Future<Output = Outcome<Vec<RowGroup>, Error>> + Send;

    /// Count rows of `entity` matching `filter`.
    fn count(
        &self,
        cx: &Cx,
        entity: &'static EntityDescriptor,
        filter: &Filter,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Apply a batch in order.
    ///
    /// The default applies each op through `insert`/`update`/`delete`,
    /// resolving key links as it goes, and stops at the first failure.
    /// Adapters with transactions should override this to make the batch
    /// atomic.
    fn apply(
        &self,
        cx: &Cx,
        batch: &WriteBatch,
    ) -> impl Future<Output = Outcome<BatchResult, Error>> + Send {
        async move {
            let mut result = BatchResult {
                assigned_keys: vec![None; batch.len()],
                ..BatchResult::default()
            };
            for (index, op) in batch.ops.iter().enumerate() {
                match op {
                    WriteOp::Insert { entity, .. } => {
                        let values = batch.linked_values(index, &result.assigned_keys);
                        match self.insert(cx, entity, &values).await {
                            Outcome::Ok(key) => {
                                result.assigned_keys[index] = Some(key);
                                result.inserted += 1;
                            }
                            Outcome::Err(e) => return Outcome::Err(e),
                            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                            Outcome::Panicked(p) => return Outcome::Panicked(p),
                        }
                    }
                    WriteOp::Update {
                        entity,
                        key,
                        values,
                    } => match self.update(cx, entity, key, values).await {
                        Outcome::Ok(true) => result.updated += 1,
                        Outcome::Ok(false) => return Outcome::Err(row_not_found(entity, key)),
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    },
                    WriteOp::Delete { entity, key } => match self.delete(cx, entity, key).await {
                        Outcome::Ok(true) => result.deleted += 1,
                        Outcome::Ok(false) => return Outcome::Err(row_not_found(entity, key)),
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    },
                }
            }
            Outcome::Ok(result)
        }
    }
}

/// Error for a tracked write whose row no longer exists.
pub fn row_not_found(entity: &EntityDescriptor, key: &Value) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::NotFound,
        entity: Some(entity.name.to_string()),
        key: Some(key.clone()),
        message: format!("expected a '{}' row, found none", entity.name),
        source: None,
    })
}
