//! Core error types.

use thiserror::Error;

/// Errors raised by the catalog, changelog, RefLog and state store.
#[derive(Debug, Error)]
pub enum Error {
    /// A lookup did not match anything.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// What was looked up (table, column, version, ...).
        kind: &'static str,
        /// The name or id that was looked up.
        name: String,
    },

    /// An insertion collided with an existing entry.
    #[error("{kind} already exists: {name}")]
    AlreadyExists {
        /// What was inserted.
        kind: &'static str,
        /// The colliding name or id.
        name: String,
    },

    /// An argument violated a structural invariant.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Shorthand for a [`Error::NotFound`].
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Shorthand for an [`Error::AlreadyExists`].
    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind,
            name: name.into(),
        }
    }
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
