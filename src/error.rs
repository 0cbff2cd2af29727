//! Crate-wide error taxonomy.
//!
//! Each subsystem has its own error enum named for what it reports, rather
//! than a single monolithic error type.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the Database Engine (C3).
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("insufficient memory")]
    InsufficientMemory,

    /// Wraps the underlying SQL engine's numeric code, message, and (when
    /// known) the SQL fragment that triggered it.
    #[error("database error {code}: {message}{}", sql.as_ref().map(|s| format!(" (sql: {})", s)).unwrap_or_default())]
    Sqlite {
        code: i32,
        message: String,
        sql: Option<String>,
    },

    #[error("operation timed out")]
    Timeout,

    #[error("operation interrupted")]
    Interrupted,

    #[error("missing table '{0}'")]
    MissingTable(String),
    #[error("obsolete table '{0}'")]
    ObsoleteTable(String),
    #[error("missing column '{0}'")]
    MissingColumn(String),
    #[error("obsolete column '{0}'")]
    ObsoleteColumn(String),
    #[error("type mismatch for column '{0}'")]
    TypeMismatch(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(ffi_err, message) => DatabaseError::Sqlite {
                code: ffi_err.extended_code,
                message: message.clone().unwrap_or_else(|| err.to_string()),
                sql: None,
            },
            other => DatabaseError::Sqlite {
                code: -1,
                message: other.to_string(),
                sql: None,
            },
        }
    }
}

/// Errors from the Catalog Index (C4) specifically — migration and compare.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("migration from version {0} has no registered handler")]
    NoMigrationPath(u32),

    #[error("row callback aborted migration: {0}")]
    CallbackAborted(String),
}

/// Errors from the Job & Schedule Engine (C5).
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("could not connect to slave")]
    Connect,

    #[error("slave authentication failed")]
    Auth,

    #[error("slave disconnected")]
    Disconnected,

    #[error("slave command timed out")]
    SlaveCommandTimeout,

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}
