//! Versioned mapping of logical tables and columns onto physical tables.
//!
//! A [`RefLog`] records, for every schema version, which physical table (the ref id)
//! a logical table name resolves to, and keeps a lineage graph between columns so any
//! two physical versions of a table can be mapped onto each other.

mod reflog;
mod refs;

pub use reflog::RefLog;
pub use refs::{ColumnKey, ColumnRef, Direction, NewColumn, SyncKey, SyncRef, TableKey, TableRef};
