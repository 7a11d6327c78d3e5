//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the error is a SQLite lock contention that may succeed on retry.
    pub fn is_sqlite_busy(&self) -> bool {
        let Error::DatabaseSqlx(sqlx_err) = self else {
            return false;
        };

        let sqlx::Error::Database(db_err) = sqlx_err else {
            let msg = sqlx_err.to_string().to_ascii_lowercase();
            return msg.contains("database is locked") || msg.contains("database is busy");
        };

        if matches!(db_err.code().as_deref(), Some("5") | Some("6")) {
            return true;
        }

        let msg = db_err.message().to_ascii_lowercase();
        msg.contains("database is locked") || msg.contains("database is busy")
    }

    /// Whether the error comes from an I/O or pool-level fault rather than bad data.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(_) | Error::IoPath { .. } => true,
            Error::DatabaseSqlx(
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed,
            ) => true,
            _ => self.is_sqlite_busy(),
        }
    }
}
