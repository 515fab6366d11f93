//! Physical catalog model.
//!
//! The catalog describes tables, columns, foreign keys, indexes and sequences by
//! their physical names. Logical names and versions live in the RefLog.

mod catalog;
mod column;
mod constraint;
mod table;
mod types;

pub use catalog::Catalog;
pub use column::{ColumnDef, ColumnHint};
pub use constraint::{ForeignKey, ForeignKeyAction, IndexDef};
pub use table::TableDef;
pub use types::{ColumnType, ValueKind};
