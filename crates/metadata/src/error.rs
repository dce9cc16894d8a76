//! Metadata store error types.

use thiserror::Error;

/// Metadata store and reconciliation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Core(#[from] stockroom_core::Error),

    /// A record points at a parent that the parent level did not produce.
    #[error("{level}: unresolved reference for {key}: {reason}")]
    Referential {
        level: &'static str,
        key: String,
        reason: String,
    },

    /// The store returned a different number of rows than were written.
    #[error("{level}: batch insert returned {actual} ids for {expected} rows")]
    Consistency {
        level: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A namespace was wired before its parent path was seen.
    #[error("namespace '{path}' has no parent namespace '{parent}' in its datastore")]
    TreeInconsistency { path: String, parent: String },

    /// A scanned size does not fit a stored integer column.
    #[error("{level}: {field} {value} of {key} is out of range")]
    OutOfRange {
        level: &'static str,
        key: String,
        field: &'static str,
        value: u64,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    pub(crate) fn referential(
        level: &'static str,
        key: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::Referential {
            level,
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Convert a scanned size for an INTEGER column.
pub(crate) fn stored_size(
    level: &'static str,
    key: impl std::fmt::Display,
    field: &'static str,
    value: u64,
) -> MetadataResult<i64> {
    i64::try_from(value).map_err(|_| MetadataError::OutOfRange {
        level,
        key: key.to_string(),
        field,
        value,
    })
}

impl From<std::io::Error> for MetadataError {
    fn from(e: std::io::Error) -> Self {
        MetadataError::Config(e.to_string())
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
