//! Error types for the migration engine.
//!
//! Every failure the engine can hit maps onto one of these variants. The
//! [`Severity`] of a variant decides what the pipeline does with it: warnings
//! are logged and counted, job-fatal errors abort the current file/job only,
//! run-fatal errors stop the run before (or instead of) touching anything else.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the migrator.
#[derive(Debug, Error)]
pub enum MigrateError {
    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Job-fatal errors
    #[error("Unreadable row store {path}: {message}")]
    UnreadableStore {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("Unreadable file {path}: {message}")]
    UnreadableFile {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Field-level warnings
    #[error("Unparseable path field {table}.{column} (row {row}): {reason}")]
    UnparseablePathField {
        table: String,
        column: String,
        row: i64,
        reason: String,
    },

    #[error("Unparseable identifier field {table}.{column} (row {row}): {reason}")]
    UnparseableIdentifierField {
        table: String,
        column: String,
        row: i64,
        reason: String,
    },

    #[error("Missing table or column {table}{} in {path}", column_suffix(.column))]
    MissingTableOrColumn {
        path: PathBuf,
        table: String,
        column: Option<String>,
    },

    // Identifier map integrity
    #[error("Identifier collision: {message}")]
    IdentifierCollision { message: String },

    #[error("Timestamp sync failed for {path}: {message}")]
    TimestampSync { path: String, message: String },

    // Plumbing
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Migration cancelled")]
    Cancelled,
}

fn column_suffix(column: &Option<String>) -> String {
    column.as_ref().map(|c| format!(".{c}")).unwrap_or_default()
}

/// Result type alias for migrator operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

/// How far an error propagates through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Logged and counted; the field/row/file is left as it was.
    Warning,
    /// Aborts the current file or job; other jobs still run.
    JobFatal,
    /// Aborts the whole run.
    RunFatal,
}

impl From<std::io::Error> for MigrateError {
    fn from(err: std::io::Error) -> Self {
        MigrateError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MigrateError {
    fn from(err: serde_json::Error) -> Self {
        MigrateError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for MigrateError {
    fn from(err: rusqlite::Error) -> Self {
        MigrateError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl MigrateError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        MigrateError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        MigrateError::Config {
            message: message.into(),
        }
    }

    /// Wrap an error raised while opening or validating a row store.
    pub fn unreadable_store(path: impl Into<PathBuf>, err: rusqlite::Error) -> Self {
        MigrateError::UnreadableStore {
            path: path.into(),
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// Wrap an error raised while reading a source or target file.
    pub fn unreadable_file(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        MigrateError::UnreadableFile {
            path: path.into(),
            message: err.to_string(),
            source: Some(err),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            MigrateError::Config { .. } | MigrateError::Cancelled => Severity::RunFatal,

            MigrateError::UnparseablePathField { .. }
            | MigrateError::UnparseableIdentifierField { .. }
            | MigrateError::MissingTableOrColumn { .. }
            | MigrateError::TimestampSync { .. } => Severity::Warning,

            // Collisions need manual resolution; they fail the item, never the run.
            MigrateError::IdentifierCollision { .. }
            | MigrateError::UnreadableStore { .. }
            | MigrateError::UnreadableFile { .. }
            | MigrateError::Database { .. }
            | MigrateError::Io { .. }
            | MigrateError::Json { .. } => Severity::JobFatal,
        }
    }

    /// Check if this error is transient lock contention worth retrying.
    pub fn is_retryable(&self) -> bool {
        let source = match self {
            MigrateError::Database { source, .. } | MigrateError::UnreadableStore { source, .. } => {
                source.as_ref()
            }
            _ => None,
        };
        matches!(
            source,
            Some(rusqlite::Error::SqliteFailure(e, _))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        )
    }
}
