//! PostgreSQL backend for Ghostshift.
//!
//! [`PgExecutor`] runs the statements generated by `ghostshift-core` over a single
//! connection, and [`load_catalog`] introspects the current schema into a catalog.

pub mod error;
pub mod executor;
pub mod introspect;

pub use error::{Error, Result};
pub use executor::PgExecutor;
pub use introspect::load_catalog;
