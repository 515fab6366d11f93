//! PostgreSQL backend error types.

use thiserror::Error;

/// Errors raised while connecting or introspecting.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection could not be established.
    #[error("connection error: {0}")]
    Connection(String),

    /// Runtime could not be created.
    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    /// A statement failed.
    #[error("sql error: {0}")]
    Sql(#[from] ghostshift_core::SqlError),

    /// Introspected schema could not be represented.
    #[error("introspection error: {0}")]
    Introspection(String),

    /// Catalog error.
    #[error(transparent)]
    Core(#[from] ghostshift_core::Error),
}

/// Result alias for the PostgreSQL backend.
pub type Result<T> = std::result::Result<T, Error>;
