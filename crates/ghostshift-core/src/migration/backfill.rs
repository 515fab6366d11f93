//! Batched backfill of existing rows into ghost tables.
//!
//! Rows are copied by generated migrator functions, one bounded batch per call, so
//! no statement holds locks on the source table for long. The loop stops when the
//! returned cursor reaches the source's highest identity as read before the first
//! batch; rows inserted later are covered by the sync trigger.

use super::cursor::Cursor;
use super::error::MigrationError;
use super::migrator_function::{MigratorFunction, MigratorSpec, Stage};
use super::null_records::NullRecords;
use super::{execute, query};
use crate::catalog::TableDef;
use crate::naming::{NameAllocator, MIGRATOR_PREFIX};
use crate::sql::SqlExecutor;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for backfill execution.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Number of rows per batch.
    pub batch_size: usize,
    /// Delay between batches in milliseconds (for yielding to writes).
    pub batch_delay_ms: u64,
}

impl BackfillConfig {
    pub const DEFAULT_BATCH_SIZE: usize = 2000;
    pub const DEFAULT_BATCH_DELAY_MS: u64 = 50;
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::DEFAULT_BATCH_SIZE,
            batch_delay_ms: Self::DEFAULT_BATCH_DELAY_MS,
        }
    }
}

/// One source table copied into one ghost table for a set of columns.
#[derive(Debug, Clone, Copy)]
pub struct BackfillJob<'a> {
    pub source: &'a TableDef,
    pub target: &'a TableDef,
    /// `(source column, target column)` pairs.
    pub mapping: &'a [(String, String)],
    /// Target columns copied by earlier steps.
    pub migrated: &'a BTreeSet<String>,
    /// Target columns to copy now.
    pub columns: &'a BTreeSet<String>,
    pub null_records: &'a NullRecords,
}

/// Outcome of a backfill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillProgress {
    /// Migrator calls that processed at least one row.
    pub batches: u64,
    /// Cursor of the last processed batch.
    pub cursor: Option<Cursor>,
}

/// Drives migrator functions until a source table is fully copied.
pub struct BackfillExecutor<'a> {
    config: BackfillConfig,
    cancel: &'a CancellationToken,
}

impl<'a> BackfillExecutor<'a> {
    pub fn new(config: BackfillConfig, cancel: &'a CancellationToken) -> Self {
        Self { config, cancel }
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    /// Copy `job` in batches. With `start` the copy resumes after that cursor.
    /// `on_batch` observes the cursor of every completed batch.
    pub fn migrate(
        &self,
        executor: &mut dyn SqlExecutor,
        job: BackfillJob<'_>,
        names: &mut dyn NameAllocator,
        start: Option<Cursor>,
        on_batch: &mut dyn FnMut(&Cursor),
    ) -> Result<BackfillProgress, MigrationError> {
        let spec = MigratorSpec {
            source: job.source,
            target: job.target,
            mapping: job.mapping,
            migrated: job.migrated,
            columns: job.columns,
            null_records: job.null_records,
            batch_size: self.config.batch_size.max(1),
        };
        let identity = spec.identity();

        let highest = match query(executor, &spec.highest_identity_query())?.first() {
            Some(row) => Cursor::from_row(row, &identity),
            None => {
                debug!(table = %job.source.name, "Source table is empty, nothing to backfill");
                return Ok(BackfillProgress::default());
            }
        };

        let mut taken = BTreeSet::new();
        let mut allocate = |names: &mut dyn NameAllocator| {
            let name = names.allocate(MIGRATOR_PREFIX, &|candidate| taken.contains(candidate));
            taken.insert(name.clone());
            name
        };
        let initial_name = allocate(names);
        let consecutive_name = allocate(names);
        let Some(initial) = spec.build(&initial_name, Stage::Initial)? else {
            debug!(table = %job.target.name, "No columns to copy");
            return Ok(BackfillProgress::default());
        };
        let Some(consecutive) = spec.build(&consecutive_name, Stage::Consecutive)? else {
            return Ok(BackfillProgress::default());
        };

        let functions = [initial, consecutive];
        let mut created = Vec::new();
        let mut result = Ok(BackfillProgress::default());
        for function in &functions {
            if let Err(e) = execute(executor, &function.create_statement) {
                result = Err(e);
                break;
            }
            created.push(function);
        }
        if result.is_ok() {
            result = self.run_batches(executor, &job, &functions, &identity, &highest, start, on_batch);
        }

        for function in created {
            if let Err(e) = execute(executor, &function.drop_statement) {
                warn!(function = %function.name, error = %e, "Failed to drop migrator function");
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn run_batches(
        &self,
        executor: &mut dyn SqlExecutor,
        job: &BackfillJob<'_>,
        functions: &[MigratorFunction; 2],
        identity: &[(String, crate::catalog::ColumnType)],
        highest: &Cursor,
        start: Option<Cursor>,
        on_batch: &mut dyn FnMut(&Cursor),
    ) -> Result<BackfillProgress, MigrationError> {
        let [initial, consecutive] = functions;
        let mut progress = BackfillProgress {
            batches: 0,
            cursor: start,
        };
        info!(
            source = %job.source.name,
            target = %job.target.name,
            highest = %highest,
            "Starting backfill"
        );

        loop {
            if let Some(cursor) = &progress.cursor {
                if cursor.is_at_or_past(highest, job.source)? {
                    break;
                }
            }
            if self.cancel.is_cancelled() {
                return Err(MigrationError::Cancelled {
                    table: job.target.name.clone(),
                    cursor: progress
                        .cursor
                        .as_ref()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                });
            }

            let function = match progress.cursor {
                Some(_) => consecutive,
                None => initial,
            };
            let statement = function.call_statement(progress.cursor.as_ref());
            let rows = executor
                .query(&statement)
                .map_err(|e| MigrationError::BackfillFailed {
                    table: job.target.name.clone(),
                    function: function.name.clone(),
                    reason: e.to_string(),
                })?;
            let Some(text) = rows.first().and_then(|row| row.get(0)) else {
                break;
            };

            let cursor = Cursor::parse(text, identity)?;
            progress.batches += 1;
            info!(
                target = %job.target.name,
                batch = progress.batches,
                cursor = %cursor,
                "Migrated batch"
            );
            on_batch(&cursor);
            progress.cursor = Some(cursor);

            if self.config.batch_delay_ms > 0 {
                std::thread::sleep(Duration::from_millis(self.config.batch_delay_ms));
            }
        }

        Ok(progress)
    }
}
