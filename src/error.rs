//! Error types for the data-access layer
//!
//! Every failure surfaces to the immediate caller as a [`DataAccessError`].
//! Statement-level variants carry the SQL template text; bound parameter
//! values are never included in messages.

use std::fmt;

use rusqlite::ErrorCode;
use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T, E = DataAccessError> = std::result::Result<T, E>;

/// Sub-kind of an [`DataAccessError::Execution`] failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionFailure {
    /// Uniqueness, foreign key, not-null or check constraint violation
    Constraint,
    /// Lock contention (single-writer lock or engine busy/locked)
    Busy,
    /// Write attempted through a read-only connection or read transaction
    ReadOnly,
    /// The transaction was rolled back instead of committed
    RolledBack,
    /// Any other runtime failure reported by the engine
    Engine,
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionFailure::Constraint => "constraint",
            ExecutionFailure::Busy => "busy",
            ExecutionFailure::ReadOnly => "read-only",
            ExecutionFailure::RolledBack => "rolled back",
            ExecutionFailure::Engine => "engine",
        };
        f.write_str(s)
    }
}

/// Error taxonomy of the data-access layer
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataAccessError {
    #[error("connection error ({location}): {message}")]
    Connection { location: String, message: String },

    #[error("syntax error in `{sql}`: {message}")]
    Syntax { sql: String, message: String },

    #[error("bind error in `{sql}`: {message}")]
    Bind { sql: String, message: String },

    #[error("execution error ({kind}) in `{sql}`: {message}")]
    Execution {
        sql: String,
        kind: ExecutionFailure,
        message: String,
    },

    #[error("query `{sql}` returned no rows")]
    EmptyResult { sql: String },

    #[error("cannot map column `{column}`: {message}")]
    TypeMapping { column: String, message: String },

    #[error("missing value for non-nullable field `{field}`")]
    MissingField { field: String },

    #[error("malformed JSON in `{field}`: {message}")]
    MalformedJson { field: String, message: String },

    #[error("migration to version {version} ({description}) failed: {message}")]
    Migration {
        version: u32,
        description: String,
        message: String,
    },

    #[error("connection owned by thread {owner} used from thread {current}")]
    ThreadAffinity { owner: String, current: String },

    #[error("unknown field `{field}` for table `{table}`")]
    UnknownField { table: String, field: String },
}

impl DataAccessError {
    pub(crate) fn connection(location: impl fmt::Display, message: impl fmt::Display) -> Self {
        DataAccessError::Connection {
            location: location.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn execution(sql: &str, kind: ExecutionFailure, message: impl fmt::Display) -> Self {
        DataAccessError::Execution {
            sql: sql.to_string(),
            kind,
            message: message.to_string(),
        }
    }

    pub(crate) fn bind(sql: &str, message: impl fmt::Display) -> Self {
        DataAccessError::Bind {
            sql: sql.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn type_mapping(column: &str, message: impl fmt::Display) -> Self {
        DataAccessError::TypeMapping {
            column: column.to_string(),
            message: message.to_string(),
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DataAccessError::Execution {
                kind: ExecutionFailure::Busy,
                ..
            }
        )
    }

    /// The SQL template that caused the failure, if any
    pub fn sql(&self) -> Option<&str> {
        match self {
            DataAccessError::Syntax { sql, .. }
            | DataAccessError::Bind { sql, .. }
            | DataAccessError::Execution { sql, .. }
            | DataAccessError::EmptyResult { sql } => Some(sql),
            _ => None,
        }
    }
}

fn failure_code(err: &rusqlite::Error) -> Option<ErrorCode> {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => Some(e.code),
        _ => None,
    }
}

/// Classify an error raised while compiling a statement
pub(crate) fn classify_prepare(sql: &str, err: rusqlite::Error) -> DataAccessError {
    match failure_code(&err) {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            DataAccessError::execution(sql, ExecutionFailure::Busy, err)
        }
        Some(ErrorCode::NotADatabase) | Some(ErrorCode::DatabaseCorrupt) => {
            DataAccessError::execution(sql, ExecutionFailure::Engine, err)
        }
        _ => DataAccessError::Syntax {
            sql: sql.to_string(),
            message: err.to_string(),
        },
    }
}

/// Classify an error raised while stepping or executing a statement
pub(crate) fn classify_execution(sql: &str, err: rusqlite::Error) -> DataAccessError {
    let kind = match failure_code(&err) {
        Some(ErrorCode::ConstraintViolation) => ExecutionFailure::Constraint,
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => ExecutionFailure::Busy,
        Some(ErrorCode::ReadOnly) => ExecutionFailure::ReadOnly,
        _ => ExecutionFailure::Engine,
    };
    match err {
        rusqlite::Error::InvalidParameterCount(given, expected) => DataAccessError::bind(
            sql,
            format!("expected {} parameters, got {}", expected, given),
        ),
        other => DataAccessError::execution(sql, kind, other),
    }
}

/// Classify an error from a multi-statement script
///
/// Scripts are compiled and run statement by statement, so a generic engine
/// error is most likely a malformed statement.
pub(crate) fn classify_batch(sql: &str, err: rusqlite::Error) -> DataAccessError {
    match failure_code(&err) {
        Some(ErrorCode::Unknown) => classify_prepare(sql, err),
        _ => classify_execution(sql, err),
    }
}
