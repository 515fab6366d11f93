//! Ghostshift Core - RefLog, migration planner and batched data migrator.
//!
//! This crate evolves a live PostgreSQL schema between versions without downtime.
//! It produces SQL text and drives it through a caller-supplied [`SqlExecutor`];
//! it never opens database connections itself.

pub mod catalog;
pub mod error;
pub mod migration;
pub mod naming;
pub mod reflog;
pub mod sql;
pub mod state;
pub mod util;
pub mod versioning;

pub use catalog::{
    Catalog, ColumnDef, ColumnHint, ColumnType, ForeignKey, ForeignKeyAction, IndexDef, TableDef,
    ValueKind,
};
pub use error::{Error, Result};
pub use migration::{
    BackfillConfig, BackfillExecutor, Cursor, MigrationConfig, MigrationError, MigrationExecutor,
    MigrationRun, MigrationStatus, NullRecords, Operation, Plan, RunStore, SyncFunction,
};
pub use naming::{NameAllocator, RandomNameAllocator, SequentialNameAllocator};
pub use reflog::{Direction, RefLog};
pub use sql::{Row, SqlError, SqlExecutor};
pub use state::{State, StateStore};
pub use versioning::{ChangeSet, Changelog, SchemaOperation, Version, VersionId};
