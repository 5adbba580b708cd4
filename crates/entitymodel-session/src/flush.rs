//! Flush operation ordering and batching for the session.
//!
//! Pending writes are ordered so that foreign keys stay satisfiable:
//! - DELETE dependent-first (deeper entities first)
//! - INSERT principal-first (shallower entities first, and every insert
//!   after the inserts it takes keys from)
//! - UPDATE in tracking order
//!
//! The ordered plan is submitted to the store as one [`WriteBatch`].

use crate::unit_of_work::PendingOp;
use entitymodel_core::{EntityRef, EntityRegistry, KeyLink, WriteBatch, WriteOp};
use std::collections::{HashMap, HashSet};

/// Orders pending writes using foreign-key depths from the registry.
#[derive(Debug)]
pub struct FlushOrderer<'a> {
    registry: &'a EntityRegistry,
}

impl<'a> FlushOrderer<'a> {
    pub fn new(registry: &'a EntityRegistry) -> Self {
        Self { registry }
    }

    fn depth(&self, op: &PendingOp) -> usize {
        self.registry.depth(op.descriptor().name)
    }

    /// Order operations into a flush plan.
    pub fn order(&self, ops: Vec<PendingOp>) -> FlushPlan {
        let mut deletes = Vec::new();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();

        for op in ops {
            match op {
                PendingOp::Delete { .. } => deletes.push(op),
                PendingOp::Insert { .. } => inserts.push(op),
                PendingOp::Update { .. } => updates.push(op),
            }
        }

        // Dependents first; stable within one depth.
        deletes.sort_by_key(|op| std::cmp::Reverse(self.depth(op)));

        inserts.sort_by_key(|op| self.depth(op));
        let inserts = order_by_links(inserts);

        FlushPlan {
            deletes,
            inserts,
            updates,
        }
    }
}

/// Move each insert after the inserts whose keys it links to.
///
/// Inserts whose principals are never emitted (a cycle) keep their
/// relative order at the end.
fn order_by_links(inserts: Vec<PendingOp>) -> Vec<PendingOp> {
    let pending: HashSet<usize> = inserts.iter().map(|op| op.entity().addr()).collect();
    let mut emitted: HashSet<usize> = HashSet::new();
    let mut remaining = inserts;
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let ready = |op: &PendingOp| match op {
            PendingOp::Insert { links, .. } => links.iter().all(|(_, principal)| {
                let addr = principal.addr();
                !pending.contains(&addr) || emitted.contains(&addr)
            }),
            _ => true,
        };
        let Some(index) = remaining.iter().position(ready) else {
            tracing::warn!(
                count = remaining.len(),
                "Insert dependencies form a cycle; keeping tracking order"
            );
            ordered.append(&mut remaining);
            break;
        };
        let op = remaining.remove(index);
        emitted.insert(op.entity().addr());
        ordered.push(op);
    }
    ordered
}

/// A plan for executing flush operations.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// Delete operations (ordered dependent-first).
    pub deletes: Vec<PendingOp>,
    /// Insert operations (ordered principal-first).
    pub inserts: Vec<PendingOp>,
    /// Update operations (tracking order).
    pub updates: Vec<PendingOp>,
}

impl FlushPlan {
    /// Create an empty flush plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the plan has any operations.
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty() && self.updates.is_empty()
    }

    /// Total number of operations in the plan.
    pub fn len(&self) -> usize {
        self.deletes.len() + self.inserts.len() + self.updates.len()
    }

    /// Build the store batch: deletes, then inserts, then updates.
    ///
    /// Returns the batch plus, per batch op, the entity it writes.
    pub fn to_batch(&self) -> (WriteBatch, Vec<EntityRef>) {
        let mut batch = WriteBatch::new();
        let mut entities = Vec::with_capacity(self.len());
        let mut insert_index: HashMap<usize, usize> = HashMap::new();

        for op in self.deletes.iter().chain(&self.inserts).chain(&self.updates) {
            let entity = op.descriptor();
            let write = match op {
                PendingOp::Delete { key, .. } => WriteOp::Delete {
                    entity,
                    key: key.clone(),
                },
                PendingOp::Insert { values, links, .. } => WriteOp::Insert {
                    entity,
                    values: values.clone(),
                    key_links: links
                        .iter()
                        .filter_map(|(field, principal)| {
                            Some(KeyLink {
                                field: field.clone(),
                                source: *insert_index.get(&principal.addr())?,
                            })
                        })
                        .collect(),
                },
                PendingOp::Update { key, values, .. } => WriteOp::Update {
                    entity,
                    key: key.clone(),
                    values: values.clone(),
                },
            };
            let index = batch.push(write);
            if op.is_insert() {
                insert_index.insert(op.entity().addr(), index);
            }
            entities.push(op.entity().clone());
        }
        (batch, entities)
    }
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
}

impl FlushResult {
    /// Create a new empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of operations performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}
