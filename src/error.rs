use std::fmt;

use thiserror::Error;

use crate::database::HandleState;
use crate::types::RowValues;

/// Broad category an adapter assigns to an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// A constraint (unique, foreign key, not null, check) rejected the statement.
    Constraint,
    /// The engine was busy or locked.
    Busy,
    /// The statement could not be parsed or referenced unknown schema objects.
    Syntax,
    /// The session is gone (worker stopped, handle closed).
    Closed,
    /// Anything else.
    Other,
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DriverErrorKind::Constraint => "constraint",
            DriverErrorKind::Busy => "busy",
            DriverErrorKind::Syntax => "syntax",
            DriverErrorKind::Closed => "closed",
            DriverErrorKind::Other => "other",
        };
        f.write_str(label)
    }
}

/// Engine failure as reported by a backend adapter.
#[derive(Debug, Error)]
#[error("{kind} driver error: {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Closed, message)
    }
}

/// Malformed template or builder input.
///
/// `position` is the zero-based index of the offending interpolation when one can be
/// blamed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct CompilationError {
    pub position: Option<usize>,
    pub message: String,
}

impl CompilationError {
    pub fn at(position: usize, message: impl Into<String>) -> Self {
        Self {
            position: Some(position),
            message: message.into(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self {
            position: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for CompilationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(position) => write!(f, "interpolation #{position}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Compilation error: {0}")]
    Compilation(#[from] CompilationError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("[{db_name}] query failed: {sql} (params: {params:?})")]
    Query {
        db_name: String,
        sql: String,
        params: Vec<RowValues>,
        #[source]
        source: Box<DbError>,
    },

    #[error("Duplicate migration id {id}: '{first}' and '{second}'")]
    DuplicateMigration {
        id: i64,
        first: String,
        second: String,
    },

    #[error("Migration {id} ('{name}') failed")]
    MigrationFailed {
        id: i64,
        name: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Live query {subscription} failed to refresh: {sql}")]
    ReactiveReexecution {
        subscription: u64,
        sql: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Database '{db_name}' is {state} and does not accept queries")]
    InvalidState { db_name: String, state: HandleState },

    #[error("Query cancelled")]
    Cancelled,

    #[error("Transaction {0} already completed")]
    TransactionFinished(u64),

    #[error("Plugin '{0}' is not registered on this database")]
    PluginMissing(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("SQL execution error: {0}")]
    ExecutionError(String),
}

impl DbError {
    /// Walk the `Query`/`MigrationFailed`/`ReactiveReexecution` wrappers down to the
    /// adapter error, if there is one.
    #[must_use]
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            DbError::Driver(err) => Some(err),
            DbError::Query { source, .. }
            | DbError::MigrationFailed { source, .. }
            | DbError::ReactiveReexecution { source, .. } => source.driver_error(),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DbError::Cancelled)
    }
}
