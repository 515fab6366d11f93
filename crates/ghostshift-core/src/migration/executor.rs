//! Migration executor - orchestrates the migration workflow.
//!
//! Coordinates the expand, backfill and synchronize phases of a migration run, and
//! the retirement of versions once no client uses them anymore.

use super::backfill::{BackfillConfig, BackfillExecutor, BackfillJob};
use super::execute;
use super::error::MigrationError;
use super::null_records::NullRecords;
use super::operation::Operation;
use super::plan::Plan;
use super::planner;
use super::state::{MigrationRun, MigrationStatus, RunStore};
use super::sync_function::{self, SyncFunction};
use super::validator;
use crate::catalog::Catalog;
use crate::error::Error;
use crate::naming::{NameAllocator, SYNC_FUNCTION_PREFIX, TRIGGER_PREFIX};
use crate::reflog::{ColumnKey, RefLog, TableKey};
use crate::sql::{ddl, SqlExecutor};
use crate::state::State;
use crate::versioning::VersionId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Migration executor configuration.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Backfill configuration.
    pub backfill: BackfillConfig,
    /// Write sync functions as `INSERT ... ON CONFLICT` instead of update-then-insert.
    pub use_upsert: bool,
    /// Plan and validate only; no statement is executed.
    pub dry_run: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            backfill: BackfillConfig::default(),
            use_upsert: true,
            dry_run: false,
        }
    }
}

/// Migration executor - orchestrates the migration workflow.
pub struct MigrationExecutor<'a> {
    executor: &'a mut dyn SqlExecutor,
    names: &'a mut dyn NameAllocator,
    config: MigrationConfig,
    run_store: Option<&'a RunStore>,
    /// Ghost tables created by the last `migrate` call that failed.
    leftover_tables: Vec<String>,
}

/// Per-run bookkeeping while steps execute.
#[derive(Default)]
struct RunContext {
    null_records: NullRecords,
    /// Forward syncs installed so far, by `(source, target)` physical names.
    syncs: HashMap<(String, String), SyncFunction>,
    /// Target columns copied so far, per ghost table.
    migrated: HashMap<String, BTreeSet<String>>,
    /// Source tables feeding each ghost table.
    sources: BTreeMap<TableKey, BTreeSet<TableKey>>,
}

impl<'a> MigrationExecutor<'a> {
    /// Create a new migration executor.
    pub fn new(
        executor: &'a mut dyn SqlExecutor,
        names: &'a mut dyn NameAllocator,
        config: MigrationConfig,
    ) -> Self {
        Self {
            executor,
            names,
            config,
            run_store: None,
            leftover_tables: Vec::new(),
        }
    }

    /// Record run progress in `store`.
    pub fn with_run_store(mut self, store: &'a RunStore) -> Self {
        self.run_store = Some(store);
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Ghost tables the last failed run created and left behind. The RefLog does
    /// not know them, so they must be dropped by hand before retrying.
    pub fn leftover_tables(&self) -> &[String] {
        &self.leftover_tables
    }

    /// Migrate from `from` to `to`. `state` is only updated when the run succeeds;
    /// a failed run leaves its database artifacts in place and a failed run record.
    pub fn migrate(
        &mut self,
        state: &mut State,
        from: &VersionId,
        to: &VersionId,
        cancel: &CancellationToken,
    ) -> Result<Plan, MigrationError> {
        self.leftover_tables.clear();
        let mut working = state.clone();
        let mut plan = planner::plan(&mut working, from, to, &mut *self.names)?;
        validator::validate(&plan, &working.catalog)?;

        if self.config.dry_run {
            info!(from = %plan.from, to = %plan.to, steps = plan.len(), "Dry run, nothing executed");
            return Ok(plan);
        }

        let mut run = MigrationRun::new(&plan);
        run.start();
        self.save_run(&run);
        info!(
            run = %run.id_hex(),
            from = %plan.from,
            to = %plan.to,
            steps = plan.len(),
            "Starting migration"
        );

        match self.execute_plan(&mut working, &mut plan, &mut run, cancel) {
            Ok(()) => {
                self.leftover_tables.clear();
                run.complete();
                self.save_run(&run);
                *state = working;
                info!(run = %run.id_hex(), to = %plan.to, "Migration complete");
                Ok(plan)
            }
            Err(error) => {
                run.fail(&error);
                self.save_run(&run);
                warn!(run = %run.id_hex(), error = %error, "Migration aborted");
                if !self.leftover_tables.is_empty() {
                    warn!(
                        run = %run.id_hex(),
                        tables = ?self.leftover_tables,
                        "Ghost tables left in place, drop them before retrying"
                    );
                }
                Err(error)
            }
        }
    }

    fn execute_plan(
        &mut self,
        state: &mut State,
        plan: &mut Plan,
        run: &mut MigrationRun,
        cancel: &CancellationToken,
    ) -> Result<(), MigrationError> {
        self.expand(&state.catalog, plan)?;

        run.set_status(MigrationStatus::Backfilling);
        self.save_run(run);
        let mut context = RunContext {
            sources: ghost_sources(&state.reflog, plan)?,
            ..RunContext::default()
        };

        while let Some(step) = plan.next_step() {
            let position = plan.position(step);
            let operation = plan.step(step).operation().clone();
            info!(step = position, operation = %operation, "Executing step");
            if let Some(progress) = run.step_mut(position) {
                progress.start();
            }
            self.save_run(run);

            let result = self.execute_step(state, &operation, &mut context, run, position, cancel);
            match result {
                Ok(()) => {
                    plan.mark_as_executed(step)?;
                    if let Some(progress) = run.step_mut(position) {
                        progress.complete();
                    }
                    self.save_run(run);
                }
                Err(error) => {
                    if let Some(progress) = run.step_mut(position) {
                        progress.fail(error.to_string());
                    }
                    return Err(error);
                }
            }
        }
        if !plan.is_executed() {
            return Err(MigrationError::planning("plan has steps that can never execute"));
        }

        run.set_status(MigrationStatus::Synchronizing);
        self.save_run(run);
        self.create_indexes(&state.catalog, plan)?;
        self.synchronize_backwards(state, &plan.from, &plan.to)?;
        state.reflog.set_version_state(&plan.to, true);
        Ok(())
    }

    /// Create sequences, ghost tables and their foreign keys.
    fn expand(&mut self, catalog: &Catalog, plan: &Plan) -> Result<(), MigrationError> {
        for sequence in plan.new_sequences() {
            execute(self.executor, &ddl::create_sequence(&sequence.name))?;
        }
        for table in plan.ghost_tables() {
            info!(table = %table, "Creating ghost table");
            execute(self.executor, &ddl::create_table(catalog.table(table)?))?;
            self.leftover_tables.push(table.clone());
        }
        for sequence in plan.new_sequences() {
            execute(
                self.executor,
                &ddl::own_sequence(&sequence.name, &sequence.table, &sequence.column),
            )?;
        }
        for table in plan.ghost_tables() {
            for foreign_key in &catalog.table(table)?.foreign_keys {
                execute(self.executor, &ddl::add_foreign_key(table, foreign_key))?;
            }
        }
        Ok(())
    }

    fn create_indexes(&mut self, catalog: &Catalog, plan: &Plan) -> Result<(), MigrationError> {
        for table in plan.ghost_tables() {
            for index in &catalog.table(table)?.indexes {
                debug!(table = %table, index = %index.name, "Creating index");
                execute(self.executor, &ddl::create_index(table, index))?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_step(
        &mut self,
        state: &mut State,
        operation: &Operation,
        context: &mut RunContext,
        run: &mut MigrationRun,
        position: usize,
        cancel: &CancellationToken,
    ) -> Result<(), MigrationError> {
        match operation {
            Operation::AddNull { tables } => {
                context.null_records.insert(&mut *self.executor, &state.catalog, tables)?;
                Ok(())
            }
            Operation::DropNull { tables } => {
                context.null_records.delete(&mut *self.executor, &state.catalog, tables)?;
                Ok(())
            }
            Operation::Copy { table, columns } => {
                let columns: BTreeSet<String> = columns.iter().cloned().collect();
                self.copy(state, table, &columns, context, run, position, cancel)
            }
        }
    }

    /// Install or widen the forward sync of `table`, then backfill `columns`.
    #[allow(clippy::too_many_arguments)]
    fn copy(
        &mut self,
        state: &mut State,
        table: &str,
        columns: &BTreeSet<String>,
        context: &mut RunContext,
        run: &mut MigrationRun,
        position: usize,
        cancel: &CancellationToken,
    ) -> Result<(), MigrationError> {
        let target_key = state.reflog.get_table_ref_by_id(table)?;
        let migrated = context.migrated.get(table).cloned().unwrap_or_default();
        let combined: BTreeSet<String> = migrated.union(columns).cloned().collect();
        let sources = context.sources.get(&target_key).cloned().unwrap_or_default();
        if sources.is_empty() {
            debug!(table = %table, "Ghost table has no source, nothing to copy");
        }

        for source_key in sources {
            let source_name = state.reflog.table(source_key)?.ref_id().to_string();
            let mapping = sync_function::column_names(
                &state.reflog,
                &state.reflog.column_mapping(source_key, target_key)?,
            )?;
            if mapping.is_empty() {
                continue;
            }

            self.ensure_forward_sync(state, source_key, target_key, &mapping, &combined, context)?;

            let source = state.catalog.table(&source_name)?;
            let target = state.catalog.table(table)?;
            let job = BackfillJob {
                source,
                target,
                mapping: &mapping,
                migrated: &migrated,
                columns,
                null_records: &context.null_records,
            };
            let backfill = BackfillExecutor::new(self.config.backfill.clone(), cancel);
            let progress = backfill.migrate(&mut *self.executor, job, &mut *self.names, None, &mut |cursor| {
                if let Some(step) = run.step_mut(position) {
                    step.record_batch(cursor.to_string());
                }
            })?;
            info!(
                source = %source_name,
                target = %table,
                batches = progress.batches,
                "Backfilled columns"
            );
        }

        context.migrated.insert(table.to_string(), combined);
        Ok(())
    }

    fn ensure_forward_sync(
        &mut self,
        state: &mut State,
        source_key: TableKey,
        target_key: TableKey,
        mapping: &[(String, String)],
        columns: &BTreeSet<String>,
        context: &mut RunContext,
    ) -> Result<(), MigrationError> {
        let source_name = state.reflog.table(source_key)?.ref_id().to_string();
        let target_name = state.reflog.table(target_key)?.ref_id().to_string();
        let source = state.catalog.table(&source_name)?;
        let target = state.catalog.table(&target_name)?;
        let key = (source_name.clone(), target_name.clone());

        if let Some(sync) = context.syncs.get_mut(&key) {
            sync.set_columns_to_migrate(source, target, columns, &context.null_records)?;
            execute(self.executor, &sync.create_function_statement(self.config.use_upsert))?;
            debug!(function = %sync.function_name, "Widened sync function");
            return Ok(());
        }

        let (function_name, trigger_name) = allocate_sync_names(&state.reflog, &mut *self.names);
        let mut sync = SyncFunction::new(
            source,
            target,
            mapping.to_vec(),
            function_name,
            trigger_name,
            &context.null_records,
        )?;
        sync.set_columns_to_migrate(source, target, columns, &context.null_records)?;
        execute(self.executor, &sync.create_function_statement(self.config.use_upsert))?;
        execute(self.executor, &sync.create_trigger_statement())?;
        let column_mapping = state.reflog.column_mapping(source_key, target_key)?;
        state
            .reflog
            .add_sync(&sync.trigger_name, &sync.function_name, column_mapping)?;
        info!(
            source = %source_name,
            target = %target_name,
            function = %sync.function_name,
            "Installed forward sync"
        );
        context.syncs.insert(key, sync);
        Ok(())
    }

    /// Install syncs from every ghost table back into the tables of `from` it
    /// replaces. Tables still present at `to` only receive forward syncs.
    fn synchronize_backwards(
        &mut self,
        state: &mut State,
        from: &VersionId,
        to: &VersionId,
    ) -> Result<(), MigrationError> {
        let mapping = state.reflog.table_mapping(to, from, true)?;
        for (source_key, targets) in mapping {
            for target_key in targets {
                if state.reflog.table(target_key)?.is_present(to) {
                    continue;
                }
                let columns = state.reflog.column_mapping(source_key, target_key)?;
                if columns.is_empty() {
                    continue;
                }
                self.install_sync(state, source_key, target_key, columns, "backward")?;
            }
        }
        Ok(())
    }

    /// Create a sync replicating all mapped columns and register it in the RefLog.
    fn install_sync(
        &mut self,
        state: &mut State,
        source_key: TableKey,
        target_key: TableKey,
        column_mapping: BTreeMap<ColumnKey, ColumnKey>,
        kind: &str,
    ) -> Result<(), MigrationError> {
        let source = state.catalog.table(state.reflog.table(source_key)?.ref_id())?;
        let target = state.catalog.table(state.reflog.table(target_key)?.ref_id())?;
        let mapping = sync_function::column_names(&state.reflog, &column_mapping)?;
        let columns: BTreeSet<String> = mapping.iter().map(|(_, to)| to.clone()).collect();

        let (function_name, trigger_name) = allocate_sync_names(&state.reflog, &mut *self.names);
        let null_records = NullRecords::new();
        let mut sync = SyncFunction::new(source, target, mapping, function_name, trigger_name, &null_records)?;
        sync.set_columns_to_migrate(source, target, &columns, &null_records)?;
        execute(self.executor, &sync.create_function_statement(self.config.use_upsert))?;
        execute(self.executor, &sync.create_trigger_statement())?;
        state
            .reflog
            .add_sync(&sync.trigger_name, &sync.function_name, column_mapping)?;
        info!(
            source = %sync.source,
            target = %sync.target,
            function = %sync.function_name,
            kind = %kind,
            "Installed sync"
        );
        Ok(())
    }

    /// Retire `version`: drop the tables no other active version uses, connecting
    /// the syncs that ran through them directly, and mark the version inactive.
    pub fn drop_version(&mut self, state: &mut State, version: &VersionId) -> Result<(), MigrationError> {
        if !state.reflog.contains_version(version) {
            return Err(Error::not_found("version", version.as_str()).into());
        }
        if !state.reflog.is_active(version) {
            return Err(Error::InvalidArgument(format!(
                "version {} is not active",
                version
            ))
            .into());
        }
        let others: Vec<VersionId> = state
            .reflog
            .active_versions()
            .iter()
            .filter(|v| *v != version)
            .cloned()
            .collect();
        if others.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "version {} is the only active version",
                version
            ))
            .into());
        }

        let mut working = state.clone();
        let mut doomed = BTreeSet::new();
        for key in working.reflog.table_refs_at(version) {
            let table = working.reflog.table(key)?;
            if !others.iter().any(|v| table.is_present(v)) {
                doomed.insert(key);
            }
        }
        info!(version = %version, tables = doomed.len(), "Dropping version");

        execute(self.executor, "BEGIN;")?;
        let result = self.retire_tables(&mut working, &doomed);
        match result {
            Ok(()) => {
                execute(self.executor, "COMMIT;")?;
                working.reflog.set_version_state(version, false);
                *state = working;
                Ok(())
            }
            Err(error) => {
                if let Err(rollback) = execute(self.executor, "ROLLBACK;") {
                    warn!(error = %rollback, "Rollback of version drop failed");
                }
                Err(error)
            }
        }
    }

    fn retire_tables(&mut self, state: &mut State, doomed: &BTreeSet<TableKey>) -> Result<(), MigrationError> {
        // Syncs running through a doomed table, composed into direct ones.
        let mut composed = Vec::new();
        let mut obsolete = BTreeSet::new();
        for key in doomed {
            let table = state.reflog.table(*key)?;
            obsolete.extend(table.inbound_syncs().iter().copied());
            obsolete.extend(table.outbound_syncs().iter().copied());

            for inbound in table.inbound_syncs() {
                for outbound in table.outbound_syncs() {
                    let (into, out_of) = (state.reflog.sync(*inbound)?, state.reflog.sync(*outbound)?);
                    let (source, target) = (into.source(), out_of.target());
                    if source == target || doomed.contains(&source) || doomed.contains(&target) {
                        continue;
                    }
                    if state.reflog.direction(*inbound)? != state.reflog.direction(*outbound)? {
                        continue;
                    }
                    let mapping: BTreeMap<ColumnKey, ColumnKey> = into
                        .column_mapping()
                        .iter()
                        .filter_map(|(from, via)| {
                            out_of.column_mapping().get(via).map(|to| (*from, *to))
                        })
                        .collect();
                    if !mapping.is_empty() {
                        composed.push((source, target, mapping));
                    }
                }
            }
        }

        for sync_key in &obsolete {
            let sync = state.reflog.sync(*sync_key)?;
            let source = state.reflog.table(sync.source())?.ref_id().to_string();
            for statement in sync_function::drop_statements(sync.name(), sync.function_name(), &source) {
                execute(self.executor, &statement)?;
            }
            state.reflog.drop_sync(*sync_key)?;
        }

        let doomed_names: BTreeSet<String> = doomed
            .iter()
            .map(|key| state.reflog.table(*key).map(|t| t.ref_id().to_string()))
            .collect::<Result<_, _>>()?;
        self.reassign_sequences(&mut state.catalog, &doomed_names)?;

        for key in doomed {
            let name = state.reflog.table(*key)?.ref_id().to_string();
            info!(table = %name, "Dropping table");
            execute(self.executor, &ddl::drop_table(&name))?;
            if state.catalog.contains_table(&name) {
                state.catalog.remove_table(&name)?;
            }
            state.reflog.drop_table_ref(*key)?;
        }

        for (source, target, mapping) in composed {
            self.install_sync(state, source, target, mapping, "composed")?;
        }
        Ok(())
    }

    /// Hand sequences owned by doomed tables to a surviving column using them.
    fn reassign_sequences(&mut self, catalog: &mut Catalog, doomed: &BTreeSet<String>) -> Result<(), MigrationError> {
        let mut owned = BTreeSet::new();
        for name in doomed {
            if let Ok(table) = catalog.table(name) {
                owned.extend(table.columns.iter().filter_map(|c| c.sequence.clone()));
            }
        }

        for sequence in owned {
            let heir = catalog
                .tables()
                .filter(|t| !doomed.contains(&t.name))
                .find_map(|t| {
                    t.columns
                        .iter()
                        .find(|c| c.sequence.as_deref() == Some(sequence.as_str()))
                        .map(|c| (t.name.clone(), c.name.clone()))
                });
            match heir {
                Some((table, column)) => {
                    debug!(sequence = %sequence, table = %table, "Reassigning sequence");
                    execute(self.executor, &ddl::own_sequence(&sequence, &table, &column))?;
                }
                None => {
                    catalog.remove_sequence(&sequence);
                }
            }
        }
        Ok(())
    }

    fn save_run(&self, run: &MigrationRun) {
        if let Some(store) = self.run_store {
            if let Err(e) = store.save(run) {
                warn!(run = %run.id_hex(), error = %e, "Failed to save run record");
            }
        }
    }
}

/// For every ghost table of `plan`, the tables of `plan.from` it evolves from.
fn ghost_sources(reflog: &RefLog, plan: &Plan) -> Result<BTreeMap<TableKey, BTreeSet<TableKey>>, MigrationError> {
    let mut sources: BTreeMap<TableKey, BTreeSet<TableKey>> = BTreeMap::new();
    for (source, targets) in reflog.table_mapping(&plan.from, &plan.to, true)? {
        for target in targets {
            if plan.ghost_tables().contains(reflog.table(target)?.ref_id()) {
                sources.entry(target).or_default().insert(source);
            }
        }
    }
    Ok(sources)
}

fn allocate_sync_names(reflog: &RefLog, names: &mut dyn NameAllocator) -> (String, String) {
    let functions: BTreeSet<String> = reflog.syncs().map(|(_, s)| s.function_name().to_string()).collect();
    let triggers: BTreeSet<String> = reflog.syncs().map(|(_, s)| s.name().to_string()).collect();
    let function_name = names.allocate(SYNC_FUNCTION_PREFIX, &|c| functions.contains(c));
    let trigger_name = names.allocate(TRIGGER_PREFIX, &|c| triggers.contains(c));
    (function_name, trigger_name)
}
