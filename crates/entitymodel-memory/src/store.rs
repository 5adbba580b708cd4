//! In-memory tables behind the `Store` trait.
//!
//! Synchronous `*_sync` methods do the work under one mutex; the async
//! trait methods wrap their results.

use entitymodel_core::{
    BatchResult, ColumnInfo, Cx, EntityDescriptor, EntityRegistry, Error, Filter, FilterTarget,
    NavigationInfo, NavigationNode, NavigationTree, Outcome, Row, RowGroup, SchemaErrorKind, Store,
    Value, WriteBatch, WriteOp,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// One write or read seen by the store, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Insert {
        entity: &'static str,
        key: Value,
        fields: Vec<String>,
    },
    Update {
        entity: &'static str,
        key: Value,
        fields: Vec<String>,
    },
    Delete {
        entity: &'static str,
        key: Value,
    },
    Query {
        entity: &'static str,
    },
    Count {
        entity: &'static str,
    },
}

impl StoreOp {
    pub fn entity(&self) -> &'static str {
        match self {
            StoreOp::Insert { entity, .. }
            | StoreOp::Update { entity, .. }
            | StoreOp::Delete { entity, .. }
            | StoreOp::Query { entity }
            | StoreOp::Count { entity } => entity,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            StoreOp::Insert { .. } | StoreOp::Update { .. } | StoreOp::Delete { .. }
        )
    }
}

#[derive(Debug, Clone)]
struct Table {
    descriptor: &'static EntityDescriptor,
    columns: Arc<ColumnInfo>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    fn new(descriptor: &'static EntityDescriptor) -> Self {
        let names = descriptor.fields.iter().map(|f| (*f).to_string()).collect();
        Self {
            descriptor,
            columns: Arc::new(ColumnInfo::new(names)),
            rows: Vec::new(),
        }
    }

    fn index_of(&self, field: &str) -> Option<usize> {
        self.columns.index_of(field)
    }

    fn value<'r>(&self, row: &'r [Value], field: &str) -> Option<&'r Value> {
        row.get(self.index_of(field)?)
    }

    fn position(&self, key: &Value) -> Option<usize> {
        let index = self.index_of(self.descriptor.key)?;
        self.rows.iter().position(|row| row[index].key_eq(key))
    }

    fn contains(&self, key: &Value) -> bool {
        self.position(key).is_some()
    }

    fn next_key(&self) -> Value {
        let max = self
            .index_of(self.descriptor.key)
            .map(|index| {
                self.rows
                    .iter()
                    .filter_map(|row| row[index].integer_key())
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        let next = max + 1;
        match i32::try_from(next) {
            Ok(small) => Value::Int(small),
            Err(_) => Value::BigInt(next),
        }
    }

    fn to_row(&self, row: &[Value]) -> Row {
        Row::with_columns(Arc::clone(&self.columns), row.to_vec())
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryInner {
    tables: HashMap<&'static str, Table>,
    log: Vec<StoreOp>,
}

impl MemoryInner {
    fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    fn table_mut(&mut self, descriptor: &'static EntityDescriptor) -> &mut Table {
        self.tables
            .entry(descriptor.name)
            .or_insert_with(|| Table::new(descriptor))
    }

    fn row_count(&self, name: &str) -> usize {
        self.table(name).map_or(0, |t| t.rows.len())
    }
}

/// A row seen by filter evaluation, with access to related tables for
/// `Filter::Any`.
struct RowView<'a> {
    inner: &'a MemoryInner,
    table: &'a Table,
    row: &'a [Value],
}

impl FilterTarget for RowView<'_> {
    fn field(&self, name: &str) -> Option<&Value> {
        self.table.value(self.row, name)
    }

    fn any_related(&self, navigation: &str, filter: &Filter) -> bool {
        let Some(info) = self.table.descriptor.navigation(navigation) else {
            return false;
        };
        let Some(target) = self.inner.table(info.target) else {
            return false;
        };
        related_rows(self.table, self.row, info, target).any(|row| {
            filter.matches(&RowView {
                inner: self.inner,
                table: target,
                row,
            })
        })
    }
}

/// Rows of `target` related to `row` through one navigation.
fn related_rows<'t>(
    table: &Table,
    row: &[Value],
    info: &NavigationInfo,
    target: &'t Table,
) -> impl Iterator<Item = &'t [Value]> + 't {
    let (match_field, value) = if info.key_on_target() {
        (info.foreign_key, table.value(row, table.descriptor.key))
    } else {
        (target.descriptor.key, table.value(row, info.foreign_key))
    };
    let value = value.filter(|v| !v.is_null()).cloned();
    let index = target.index_of(match_field);
    target.rows.iter().filter_map(move |candidate| {
        let value = value.as_ref()?;
        let field = candidate.get(index?)?;
        field.key_eq(value).then_some(candidate.as_slice())
    })
}

/// In-memory store adapter.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    registry: Arc<EntityRegistry>,
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// Create an empty store for the registered entity types.
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self {
            registry,
            inner: Arc::new(Mutex::new(MemoryInner::default())),
        }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// All rows of one entity, in insertion order.
    pub fn rows(&self, entity: &EntityDescriptor) -> Vec<Row> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .table(entity.name)
            .map(|t| t.rows.iter().map(|r| t.to_row(r)).collect())
            .unwrap_or_default()
    }

    /// The row with `key`, if any.
    pub fn row(&self, entity: &EntityDescriptor, key: impl Into<Value>) -> Option<Row> {
        let key = key.into();
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let table = inner.table(entity.name)?;
        let position = table.position(&key)?;
        Some(table.to_row(&table.rows[position]))
    }

    /// Number of rows of one entity.
    pub fn len(&self, entity: &EntityDescriptor) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.row_count(entity.name)
    }

    /// Every operation seen so far.
    pub fn ops(&self) -> Vec<StoreOp> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.log.clone()
    }

    /// Return and forget the operations seen so far.
    pub fn take_ops(&self) -> Vec<StoreOp> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut inner.log)
    }

    fn check_fields(entity: &EntityDescriptor, values: &[(String, Value)]) -> Result<(), Error> {
        match values.iter().find(|(field, _)| !entity.has_field(field)) {
            Some((field, _)) => Err(Error::schema(
                SchemaErrorKind::UnknownField,
                format!("'{}' has no field '{}'", entity.name, field),
            )),
            None => Ok(()),
        }
    }

    /// Every non-null foreign key among `values` must name an existing
    /// principal row.
    fn check_principals(
        &self,
        inner: &MemoryInner,
        entity: &EntityDescriptor,
        values: &[(String, Value)],
    ) -> Result<(), Error> {
        for fk in self.registry.foreign_keys_of(entity.name) {
            let Some((_, value)) = values.iter().find(|(f, v)| f == fk.field && !v.is_null())
            else {
                continue;
            };
            let exists = inner
                .table(fk.principal)
                .is_some_and(|principal| principal.contains(value));
            if !exists {
                return Err(Error::constraint(
                    entity.name,
                    format!(
                        "'{}.{}' references a missing '{}' row",
                        entity.name, fk.field, fk.principal
                    ),
                )
                .with_key(value.clone()));
            }
        }
        Ok(())
    }

    fn insert_locked(
        &self,
        inner: &mut MemoryInner,
        entity: &'static EntityDescriptor,
        values: &[(String, Value)],
    ) -> Result<Value, Error> {
        Self::check_fields(entity, values)?;
        self.check_principals(inner, entity, values)?;
        let table = inner.table_mut(entity);

        let given = values
            .iter()
            .find(|(f, v)| f == entity.key && !v.is_null())
            .map(|(_, v)| v.clone());
        let key = match given {
            Some(key) => key,
            None if entity.generated_key => table.next_key(),
            None => {
                return Err(Error::constraint(
                    entity.name,
                    format!("insert into '{}' requires a key", entity.name),
                ));
            }
        };
        if table.contains(&key) {
            return Err(Error::constraint(
                entity.name,
                format!("duplicate key for '{}'", entity.name),
            )
            .with_key(key));
        }

        let mut row = vec![Value::Null; table.columns.len()];
        for (field, value) in values {
            if let Some(index) = table.index_of(field) {
                row[index] = value.clone();
            }
        }
        if let Some(index) = table.index_of(entity.key) {
            row[index] = key.clone();
        }
        table.rows.push(row);
        inner.log.push(StoreOp::Insert {
            entity: entity.name,
            key: key.clone(),
            fields: values.iter().map(|(f, _)| f.clone()).collect(),
        });
        tracing::trace!(entity = entity.name, "Inserted row");
        Ok(key)
    }

    fn update_locked(
        &self,
        inner: &mut MemoryInner,
        entity: &'static EntityDescriptor,
        key: &Value,
        values: &[(String, Value)],
    ) -> Result<bool, Error> {
        Self::check_fields(entity, values)?;
        if values
            .iter()
            .any(|(f, v)| f == entity.key && !v.key_eq(key))
        {
            return Err(Error::constraint(
                entity.name,
                format!("the key of '{}' cannot be changed", entity.name),
            ));
        }
        self.check_principals(inner, entity, values)?;
        let table = inner.table_mut(entity);
        let Some(position) = table.position(key) else {
            return Ok(false);
        };
        for (field, value) in values {
            if let Some(index) = table.index_of(field) {
                table.rows[position][index] = value.clone();
            }
        }
        inner.log.push(StoreOp::Update {
            entity: entity.name,
            key: key.clone(),
            fields: values.iter().map(|(f, _)| f.clone()).collect(),
        });
        Ok(true)
    }

    fn delete_locked(
        inner: &mut MemoryInner,
        entity: &'static EntityDescriptor,
        key: &Value,
    ) -> bool {
        let table = inner.table_mut(entity);
        let Some(position) = table.position(key) else {
            return false;
        };
        table.rows.remove(position);
        inner.log.push(StoreOp::Delete {
            entity: entity.name,
            key: key.clone(),
        });
        true
    }

    /// Insert one row and return its key.
    pub fn insert_sync(
        &self,
        entity: &'static EntityDescriptor,
        values: &[(String, Value)],
    ) -> Result<Value, Error> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.insert_locked(&mut inner, entity, values)
    }

    /// Update one row; `false` if no row has `key`.
    pub fn update_sync(
        &self,
        entity: &'static EntityDescriptor,
        key: &Value,
        values: &[(String, Value)],
    ) -> Result<bool, Error> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.update_locked(&mut inner, entity, key, values)
    }

    /// Delete one row; `false` if no row has `key`.
    pub fn delete_sync(&self, entity: &'static EntityDescriptor, key: &Value) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::delete_locked(&mut inner, entity, key)
    }

    /// Fetch matching root rows with the row groups of every node in `tree`.
    pub fn query_sync(
        &self,
        tree: &NavigationTree,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<RowGroup>, Error> {
        let root = tree.root();
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.log.push(StoreOp::Query { entity: root.name });
        let inner = &*guard;
        let Some(table) = inner.table(root.name) else {
            return Ok(Vec::new());
        };
        let groups: Vec<RowGroup> = table
            .rows
            .iter()
            .filter(|row| {
                filter.matches(&RowView {
                    inner,
                    table,
                    row: row.as_slice(),
                })
            })
            .take(limit.unwrap_or(usize::MAX))
            .map(|row| group(inner, table, row, tree.children()))
            .collect();
        tracing::debug!(entity = root.name, rows = groups.len(), "Queried rows");
        Ok(groups)
    }

    /// Count rows matching `filter`.
    pub fn count_sync(&self, entity: &'static EntityDescriptor, filter: &Filter) -> u64 {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.log.push(StoreOp::Count {
            entity: entity.name,
        });
        let inner = &*guard;
        let Some(table) = inner.table(entity.name) else {
            return 0;
        };
        let count = table
            .rows
            .iter()
            .filter(|row| {
                filter.matches(&RowView {
                    inner,
                    table,
                    row: row.as_slice(),
                })
            })
            .count();
        u64::try_from(count).unwrap_or(u64::MAX)
    }

    /// Apply a batch atomically: on the first failure every table is
    /// restored.
    pub fn apply_sync(&self, batch: &WriteBatch) -> Result<BatchResult, Error> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let saved = inner.clone();
        match self.apply_locked(&mut inner, batch) {
            Ok(result) => {
                tracing::debug!(
                    inserted = result.inserted,
                    updated = result.updated,
                    deleted = result.deleted,
                    "Applied batch"
                );
                Ok(result)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Batch failed; rolling back");
                *inner = saved;
                Err(e)
            }
        }
    }

    fn apply_locked(
        &self,
        inner: &mut MemoryInner,
        batch: &WriteBatch,
    ) -> Result<BatchResult, Error> {
        let mut result = BatchResult {
            assigned_keys: vec![None; batch.len()],
            ..BatchResult::default()
        };
        for (index, op) in batch.ops.iter().enumerate() {
            match op {
                WriteOp::Insert { entity, .. } => {
                    let values = batch.linked_values(index, &result.assigned_keys);
                    let key = self.insert_locked(inner, entity, &values)?;
                    result.assigned_keys[index] = Some(key);
                    result.inserted += 1;
                }
                WriteOp::Update {
                    entity,
                    key,
                    values,
                } => {
                    if !self.update_locked(inner, entity, key, values)? {
                        return Err(entitymodel_core::store::row_not_found(entity, key));
                    }
                    result.updated += 1;
                }
                WriteOp::Delete { entity, key } => {
                    if !Self::delete_locked(inner, entity, key) {
                        return Err(entitymodel_core::store::row_not_found(entity, key));
                    }
                    result.deleted += 1;
                }
            }
        }
        Ok(result)
    }
}

/// One row plus the row groups of every navigation node below it.
fn group(inner: &MemoryInner, table: &Table, row: &[Value], nodes: &[NavigationNode]) -> RowGroup {
    let mut result = RowGroup::new(table.to_row(row));
    for node in nodes {
        let related: Vec<RowGroup> = match inner.table(node.target().name) {
            Some(target) => related_rows(table, row, node.info(), target)
                .map(|r| group(inner, target, r, node.children()))
                .collect(),
            None => Vec::new(),
        };
        result = result.with_navigation(node.name(), related);
    }
    result
}

impl Store for MemoryStore {
    fn insert(
        &self,
        _cx: &Cx,
        entity: &'static EntityDescriptor,
        values: &[(String, Value)],
    ) -> impl Future<Output = Outcome<Value, Error>> + Send {
        let result = self.insert_sync(entity, values);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn update(
        &self,
        _cx: &Cx,
        entity: &'static EntityDescriptor,
        key: &Value,
        values: &[(String, Value)],
    ) -> impl Future<Output = Outcome<bool, Error>> + Send {
        let result = self.update_sync(entity, key, values);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn delete(
        &self,
        _cx: &Cx,
        entity: &'static EntityDescriptor,
        key: &Value,
    ) -> impl Future<Output = Outcome<bool, Error>> + Send {
        let result = self.delete_sync(entity, key);
        async move { Outcome::Ok(result) }
    }

    fn query(
        &self,
        _cx: &Cx,
        tree: &NavigationTree,
        filter: &Filter,
        limit: Option<usize>,
    ) -> impl Future<Output = Outcome<Vec<RowGroup>, Error>> + Send {
        let result = self.query_sync(tree, filter, limit);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn count(
        &self,
        _cx: &Cx,
        entity: &'static EntityDescriptor,
        filter: &Filter,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.count_sync(entity, filter);
        async move { Outcome::Ok(result) }
    }

    fn apply(
        &self,
        _cx: &Cx,
        batch: &WriteBatch,
    ) -> impl Future<Output = Outcome<BatchResult, Error>> + Send {
        let result = self.apply_sync(batch);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }
}
