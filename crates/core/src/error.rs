//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot decode index file {path}: {reason}")]
    Decode { path: String, reason: String },

    #[error("path does not match {grammar} layout: {path}")]
    Grammar {
        grammar: &'static str,
        path: String,
    },

    #[error("unknown archive extension '{extension}' in {path}")]
    UnknownArchiveExtension { path: String, extension: String },

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid backup timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("malformed discovery listing: {0}")]
    Listing(String),
}

impl Error {
    /// Build a decode error for an optional source path.
    pub(crate) fn decode(path: Option<&str>, reason: impl Into<String>) -> Self {
        Self::Decode {
            path: path.unwrap_or("<memory>").to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
