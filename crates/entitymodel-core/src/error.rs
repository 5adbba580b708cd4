//! Error types for EntityModel operations.

use crate::value::Value;
use std::fmt;

/// The primary error type for all EntityModel operations.
#[derive(Debug)]
pub enum Error {
    /// Store-level failures (constraint violations, missing rows)
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Descriptor and registry errors
    Schema(SchemaError),
    /// Navigation path grammar violations
    Navigation(NavigationError),
    /// Change tracker usage errors
    Tracking(TrackingError),
    /// Configuration errors
    Config(ConfigError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// Entity the failing operation targeted, if known.
    pub entity: Option<String>,
    /// Key of the offending row. Never part of the message.
    pub key: Option<Value>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (duplicate key, missing referenced row, dependent rows)
    Constraint,
    /// Update or delete addressed a row that does not exist
    NotFound,
    /// Other store failure
    Store,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub field: Option<String>,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// No descriptor registered under that name
    UnknownEntity,
    /// Field is not declared on the descriptor
    UnknownField,
    /// Navigation is not declared on the descriptor
    UnknownNavigation,
    /// Descriptor metadata is inconsistent
    Invalid,
}

#[derive(Debug)]
pub struct NavigationError {
    pub kind: NavigationErrorKind,
    /// The directive path as written by the caller.
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationErrorKind {
    /// Navigation name not declared on the entity reached at that step
    UnknownNavigation,
    /// Dotted member access through a collection-valued navigation
    ThroughCollection,
    /// `then_include` issued before any `include`
    NoPreviousInclude,
    /// Segment does not match the path grammar
    InvalidSegment,
    /// Empty path
    Empty,
}

#[derive(Debug)]
pub struct TrackingError {
    pub kind: TrackingErrorKind,
    pub entity: &'static str,
    /// Key of the offending instance. Never part of the message.
    pub key: Option<Value>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingErrorKind {
    /// A different instance is already tracked for the same key
    Conflict,
    /// Operation requires a tracked instance
    NotTracked,
    /// Field name not declared on the entity
    UnknownField,
    /// Requested state transition is not allowed
    InvalidState,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a constraint violation raised by a store adapter.
    pub fn constraint(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind: QueryErrorKind::Constraint,
            entity: Some(entity.into()),
            key: None,
            message: message.into(),
            source: None,
        })
    }

    /// Build a tracking error for the given entity.
    pub fn tracking(
        kind: TrackingErrorKind,
        entity: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Error::Tracking(TrackingError {
            kind,
            entity,
            key: None,
            message: message.into(),
        })
    }

    /// Attach the offending key to a query or tracking error.
    #[must_use]
    pub fn with_key(mut self, key: Value) -> Self {
        match &mut self {
            Error::Query(e) => e.key = Some(key),
            Error::Tracking(e) => e.key = Some(key),
            _ => {}
        }
        self
    }

    /// The offending key, if the error carries one.
    pub fn key(&self) -> Option<&Value> {
        match self {
            Error::Query(e) => e.key.as_ref(),
            Error::Tracking(e) => e.key.as_ref(),
            _ => None,
        }
    }

    /// Build a navigation path error.
    pub fn navigation(
        kind: NavigationErrorKind,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Navigation(NavigationError {
            kind,
            path: path.into(),
            message: message.into(),
        })
    }

    /// Build a schema error.
    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
        })
    }

    /// Is this a store constraint violation?
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::Query(q) if q.kind == QueryErrorKind::Constraint)
    }

    /// Is this a tracking conflict (two instances for one key)?
    pub fn is_conflict(&self) -> bool {
        self.tracking_kind() == Some(TrackingErrorKind::Conflict)
    }

    /// The tracking error kind, if this is a tracking error.
    pub fn tracking_kind(&self) -> Option<TrackingErrorKind> {
        match self {
            Error::Tracking(t) => Some(t.kind),
            _ => None,
        }
    }

    /// The navigation error kind, if this is a path error.
    pub fn navigation_kind(&self) -> Option<NavigationErrorKind> {
        match self {
            Error::Navigation(n) => Some(n.kind),
            _ => None,
        }
    }

    /// The schema error kind, if this is a schema error.
    pub fn schema_kind(&self) -> Option<SchemaErrorKind> {
        match self {
            Error::Schema(s) => Some(s.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Query(e) => {
                if let Some(entity) = &e.entity {
                    write!(f, "Query error on '{}': {}", entity, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => {
                if let Some(field) = &e.field {
                    write!(
                        f,
                        "Type error in field '{}': expected {}, found {}",
                        field, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Navigation(e) => write!(f, "Navigation error in '{}': {}", e.path, e.message),
            Error::Tracking(e) => write!(f, "Tracking error on '{}': {}", e.entity, e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(field) = &self.field {
            write!(
                f,
                "expected {} for field '{}', found {}",
                self.expected, field, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for NavigationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl fmt::Display for TrackingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<NavigationError> for Error {
    fn from(err: NavigationError) -> Self {
        Error::Navigation(err)
    }
}

impl From<TrackingError> for Error {
    fn from(err: TrackingError) -> Self {
        Error::Tracking(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for EntityModel operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_helpers() {
        let err = Error::constraint("Child", "duplicate key").with_key(Value::Int(11));
        assert!(err.is_constraint_violation());
        assert!(!err.is_conflict());
        assert_eq!(err.key(), Some(&Value::Int(11)));
        assert_eq!(err.to_string(), "Query error on 'Child': duplicate key");
    }

    #[test]
    fn kind_accessors() {
        let err = Error::tracking(TrackingErrorKind::Conflict, "Parent", "already tracked");
        assert!(err.is_conflict());
        assert_eq!(err.tracking_kind(), Some(TrackingErrorKind::Conflict));
        assert_eq!(err.navigation_kind(), None);

        let err = Error::navigation(
            NavigationErrorKind::ThroughCollection,
            "Parent.Child2.Baby",
            "'Child2' is a collection",
        );
        assert_eq!(
            err.navigation_kind(),
            Some(NavigationErrorKind::ThroughCollection)
        );
        assert!(err.to_string().contains("Parent.Child2.Baby"));
    }

    #[test]
    fn config_error_exposes_source() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = Error::Config(ConfigError {
            message: "invalid session config".to_string(),
            source: Some(Box::new(json_err)),
        });
        assert!(std::error::Error::source(&err).is_some());
    }
}
