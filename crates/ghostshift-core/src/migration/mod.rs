//! Zero-downtime migration engine.
//!
//! A migration from one version to another runs expand-contract style:
//!
//! 1. **Plan**: the schema operations between the two versions are applied to the
//!    catalog and RefLog, producing ghost tables, and the greedy planner orders the
//!    work of filling them into `ADD_NULL`, `COPY` and `DROP_NULL` steps.
//! 2. **Expand**: ghost tables, their sequences and deferrable foreign keys are created.
//! 3. **Backfill**: each `COPY` step installs or widens the forward sync trigger of the
//!    table and then copies existing rows in batches with generated migrator functions.
//! 4. **Synchronize**: indexes are built and backward sync triggers are installed so
//!    both versions observe each other's writes.
//!
//! Retiring a version afterwards (`MigrationExecutor::drop_version`) removes the
//! tables only that version uses and stitches the sync triggers around them.
//!
//! # Example
//!
//! ```ignore
//! use ghostshift_core::migration::{MigrationConfig, MigrationExecutor};
//! use tokio_util::sync::CancellationToken;
//!
//! let mut executor = MigrationExecutor::new(&mut connection, &mut names, MigrationConfig::default());
//! let plan = executor.migrate(&mut state, &from, &to, &CancellationToken::new())?;
//! println!("{}", plan);
//! ```

pub mod backfill;
pub mod cursor;
pub mod error;
pub mod executor;
mod expand;
pub mod graph;
pub mod migrator_function;
pub mod null_records;
pub mod operation;
pub mod plan;
pub mod planner;
pub mod state;
pub mod sync_function;
pub mod validator;

pub use backfill::{BackfillConfig, BackfillExecutor, BackfillJob, BackfillProgress};
pub use cursor::Cursor;
pub use error::MigrationError;
pub use executor::{MigrationConfig, MigrationExecutor};
pub use migrator_function::{MigratorFunction, MigratorSpec, Stage};
pub use null_records::{Identity, NullRecords};
pub use operation::{Operation, OperationKind};
pub use plan::{NewSequence, Plan, Step, StepId};
pub use planner::plan;
pub use state::{MigrationRun, MigrationStatus, RunStore, StepProgress, StepStatus};
pub use sync_function::{SyncExpressions, SyncFunction};
pub use validator::validate;

use crate::sql::{Row, SqlExecutor};
use tracing::debug;

/// Execute one statement, attaching it to the error on failure.
pub(crate) fn execute(executor: &mut dyn SqlExecutor, statement: &str) -> Result<u64, MigrationError> {
    debug!(statement = %statement, "Executing");
    executor
        .execute(statement)
        .map_err(|e| MigrationError::sql(statement, e))
}

/// Run one query, attaching it to the error on failure.
pub(crate) fn query(executor: &mut dyn SqlExecutor, statement: &str) -> Result<Vec<Row>, MigrationError> {
    debug!(statement = %statement, "Querying");
    executor
        .query(statement)
        .map_err(|e| MigrationError::sql(statement, e))
}
