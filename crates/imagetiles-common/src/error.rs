//! Unified error type for imagetiles.
//!
//! Store operations funnel every failure into [`Error`]. Validation and
//! not-found errors are recoverable by the caller; migration conflicts are
//! fatal and need an operator.

use std::fmt;

/// Unified error type covering all failure modes of the metadata store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "image file").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Write data failed validation. Nothing was persisted.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The physical schema disagrees with the migration ledger.
    #[error("Migration conflict: {0}")]
    MigrationConflict(String),

    /// The store has not reached the current schema version.
    #[error("Store not ready: {0}")]
    StoreNotReady(String),

    /// Another instance holds the migration lock.
    #[error("Migration lock unavailable: {0}")]
    MigrationLocked(String),

    /// A database operation failed.
    #[error("Database error: {source}")]
    Database {
        /// The underlying database error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::Validation`].
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Convenience constructor for [`Error::MigrationConflict`].
    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::MigrationConflict(msg.into())
    }

    /// Convenience constructor for [`Error::StoreNotReady`].
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Error::StoreNotReady(msg.into())
    }

    /// Whether the caller can recover by fixing input or treating the
    /// record as absent.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::NotFound { .. })
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
