//! Row predicates evaluated by store adapters.

use crate::descriptor::{EntityDescriptor, EntityRegistry};
use crate::error::{Error, Result, SchemaErrorKind};
use crate::value::Value;
use std::cmp::Ordering;
use std::fmt;

/// A predicate over one entity's fields and related rows.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every row.
    All,
    /// Field equals value. A missing field compares as NULL.
    Eq(String, Value),
    /// Field differs from value.
    Ne(String, Value),
    /// Field ordered before value.
    Lt(String, Value),
    /// Field ordered at or before value.
    Le(String, Value),
    /// Field ordered after value.
    Gt(String, Value),
    /// Field ordered at or after value.
    Ge(String, Value),
    /// Field is NULL or missing.
    IsNull(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    /// At least one row reachable through `navigation` matches `filter`.
    Any {
        navigation: String,
        filter: Box<Filter>,
    },
}

/// Access to the row a filter is evaluated against.
pub trait FilterTarget {
    /// Current value of a field.
    fn field(&self, name: &str) -> Option<&Value>;

    /// Does any row related through `navigation` match `filter`?
    fn any_related(&self, navigation: &str, filter: &Filter) -> bool;
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ne(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt(field.into(), value.into())
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Le(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt(field.into(), value.into())
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ge(field.into(), value.into())
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Filter::IsNull(field.into())
    }

    /// Existence of a related row matching `filter`.
    pub fn any(navigation: impl Into<String>, filter: Filter) -> Self {
        Filter::Any {
            navigation: navigation.into(),
            filter: Box::new(filter),
        }
    }

    /// Conjunction, flattening nested `And`s and dropping `All`.
    #[must_use]
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut a), Filter::And(b)) => {
                a.extend(b);
                Filter::And(a)
            }
            (Filter::And(mut a), f) => {
                a.push(f);
                Filter::And(a)
            }
            (f, Filter::And(mut b)) => {
                b.insert(0, f);
                Filter::And(b)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    /// Disjunction.
    #[must_use]
    pub fn or(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, _) | (_, Filter::All) => Filter::All,
            (Filter::Or(mut a), f) => {
                a.push(f);
                Filter::Or(a)
            }
            (a, b) => Filter::Or(vec![a, b]),
        }
    }

    /// Negation.
    #[must_use]
    pub fn negate(self) -> Self {
        match self {
            Filter::Not(inner) => *inner,
            f => Filter::Not(Box::new(f)),
        }
    }

    /// Is this the match-everything filter?
    pub fn is_all(&self) -> bool {
        matches!(self, Filter::All)
    }

    /// Evaluate against one row.
    pub fn matches<T: FilterTarget + ?Sized>(&self, target: &T) -> bool {
        let field = |name: &str| target.field(name).unwrap_or(&Value::Null);
        let ordered = |name: &str, value: &Value, accept: fn(Ordering) -> bool| {
            field(name).compare(value).is_some_and(accept)
        };
        match self {
            Filter::All => true,
            Filter::Eq(name, value) => field(name).key_eq(value),
            Filter::Ne(name, value) => !field(name).key_eq(value),
            Filter::Lt(name, value) => ordered(name, value, Ordering::is_lt),
            Filter::Le(name, value) => ordered(name, value, Ordering::is_le),
            Filter::Gt(name, value) => ordered(name, value, Ordering::is_gt),
            Filter::Ge(name, value) => ordered(name, value, Ordering::is_ge),
            Filter::IsNull(name) => field(name).is_null(),
            Filter::And(filters) => filters.iter().all(|f| f.matches(target)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(target)),
            Filter::Not(inner) => !inner.matches(target),
            Filter::Any { navigation, filter } => target.any_related(navigation, filter),
        }
    }

    /// Check every field and navigation name against the descriptors.
    pub fn validate(&self, entity: &EntityDescriptor, registry: &EntityRegistry) -> Result<()> {
        let check_field = |name: &str| {
            if entity.has_field(name) {
                Ok(())
            } else {
                Err(Error::schema(
                    SchemaErrorKind::UnknownField,
                    format!("filter on unknown field '{}.{}'", entity.name, name),
                ))
            }
        };
        match self {
            Filter::All => Ok(()),
            Filter::Eq(name, _)
            | Filter::Ne(name, _)
            | Filter::Lt(name, _)
            | Filter::Le(name, _)
            | Filter::Gt(name, _)
            | Filter::Ge(name, _)
            | Filter::IsNull(name) => check_field(name),
            Filter::And(filters) | Filter::Or(filters) => filters
                .iter()
                .try_for_each(|f| f.validate(entity, registry)),
            Filter::Not(inner) => inner.validate(entity, registry),
            Filter::Any { navigation, filter } => {
                let nav = entity.navigation(navigation).ok_or_else(|| {
                    Error::schema(
                        SchemaErrorKind::UnknownNavigation,
                        format!("filter on unknown navigation '{}.{}'", entity.name, navigation),
                    )
                })?;
                filter.validate(registry.target_of(nav)?, registry)
            }
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, filters: &[Filter], op: &str| {
            write!(f, "(")?;
            for (i, filter) in filters.iter().enumerate() {
                if i > 0 {
                    write!(f, " {op} ")?;
                }
                write!(f, "{filter}")?;
            }
            write!(f, ")")
        };
        match self {
            Filter::All => write!(f, "TRUE"),
            Filter::Eq(n, v) => write!(f, "{n} = {v}"),
            Filter::Ne(n, v) => write!(f, "{n} <> {v}"),
            Filter::Lt(n, v) => write!(f, "{n} < {v}"),
            Filter::Le(n, v) => write!(f, "{n} <= {v}"),
            Filter::Gt(n, v) => write!(f, "{n} > {v}"),
            Filter::Ge(n, v) => write!(f, "{n} >= {v}"),
            Filter::IsNull(n) => write!(f, "{n} IS NULL"),
            Filter::And(filters) => join(f, filters, "AND"),
            Filter::Or(filters) => join(f, filters, "OR"),
            Filter::Not(inner) => write!(f, "NOT {inner}"),
            Filter::Any { navigation, filter } => write!(f, "ANY {navigation} ({filter})"),
        }
    }
}
