//! Greedy migration planner.
//!
//! Ghost tables are filled in foreign key order: tables referring to no other pending
//! ghost table go first. When the remaining tables form a cycle, the table referred
//! to by the most NOT NULL foreign keys is copied partially, without the columns that
//! point at pending tables, and completed once those tables have been copied. Rows
//! whose NOT NULL foreign keys cannot be satisfied yet point at null records.

use super::error::MigrationError;
use super::expand::Expansion;
use super::graph::Graph;
use super::operation::{Operation, OperationKind};
use super::plan::{Plan, StepId};
use crate::catalog::{Catalog, TableDef};
use crate::naming::NameAllocator;
use crate::reflog::RefLog;
use crate::state::State;
use crate::versioning::VersionId;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, info};

/// Fork every version between `from` and `to`, apply their schema operations, and
/// plan how to fill the resulting ghost tables.
///
/// Versions the RefLog already knows are not applied again. When such a version is
/// active the plan starts from it, since its tables already exist.
pub fn plan(
    state: &mut State,
    from: &VersionId,
    to: &VersionId,
    names: &mut dyn NameAllocator,
) -> Result<Plan, MigrationError> {
    if !state.reflog.contains_version(from) {
        return Err(crate::error::Error::not_found("version", from.as_str()).into());
    }
    let path = state.changelog.path(from, to).map_err(|_| MigrationError::NoPath {
        from: from.clone(),
        to: to.clone(),
    })?;

    let mut source = from.clone();
    let mut parent = from.clone();
    let mut expansion = Expansion::new();
    for version in path {
        if state.reflog.contains_version(&version) {
            if state.reflog.is_active(&version) {
                source = version.clone();
            }
            parent = version;
            continue;
        }

        state.reflog.fork(&parent, &version)?;
        if let Some(operation) = &state.changelog.version(&version)?.operation {
            expansion.apply(&mut state.catalog, &mut state.reflog, &version, operation, names)?;
        }
        parent = version;
    }

    info!(from = %source, to = %to, "Planning migration");
    let planner = GreedyPlanner::new(state, expansion, source, to.clone(), names)?;
    planner.run()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableProgress {
    Pending,
    Partial,
    Done,
}

/// Columns of each ghost table already assigned to a COPY step.
#[derive(Debug, Default)]
struct ColumnProgress {
    migrated: BTreeMap<String, BTreeSet<String>>,
}

impl ColumnProgress {
    fn of(&self, catalog: &Catalog, table: &str) -> TableProgress {
        let Some(migrated) = self.migrated.get(table).filter(|m| !m.is_empty()) else {
            return TableProgress::Pending;
        };
        let done = catalog
            .table(table)
            .map(|t| t.columns.iter().all(|c| migrated.contains(&c.name)))
            .unwrap_or(false);
        if done {
            TableProgress::Done
        } else {
            TableProgress::Partial
        }
    }

    fn mark(&mut self, table: &str, columns: &[String]) {
        self.migrated
            .entry(table.to_string())
            .or_default()
            .extend(columns.iter().cloned());
    }

    fn with_progress(&self, catalog: &Catalog, progress: TableProgress) -> BTreeSet<String> {
        self.migrated
            .keys()
            .filter(|table| self.of(catalog, table) == progress)
            .cloned()
            .collect()
    }

    fn migrated_columns(&self, table: &str) -> BTreeSet<String> {
        self.migrated.get(table).cloned().unwrap_or_default()
    }

    /// Columns not yet assigned, in table order.
    fn remaining(&self, table: &TableDef) -> Vec<String> {
        let migrated = self.migrated.get(&table.name);
        table
            .columns
            .iter()
            .filter(|c| migrated.map(|m| !m.contains(&c.name)).unwrap_or(true))
            .map(|c| c.name.clone())
            .collect()
    }
}

/// Why planning stopped early.
enum Interrupt {
    /// The ghost table set grew; plan again from scratch.
    Reset,
    Failed(MigrationError),
}

impl From<MigrationError> for Interrupt {
    fn from(error: MigrationError) -> Self {
        Interrupt::Failed(error)
    }
}

impl From<crate::error::Error> for Interrupt {
    fn from(error: crate::error::Error) -> Self {
        Interrupt::Failed(error.into())
    }
}

type Planned<T> = std::result::Result<T, Interrupt>;

struct GreedyPlanner<'a> {
    catalog: &'a mut Catalog,
    reflog: &'a mut RefLog,
    names: &'a mut dyn NameAllocator,
    expansion: Expansion,
    from: VersionId,
    to: VersionId,
    ghost_tables: BTreeSet<String>,
    graph: Graph,
    progress: ColumnProgress,
    plan: Plan,
    null_records: BTreeSet<String>,
}

impl<'a> GreedyPlanner<'a> {
    fn new(
        state: &'a mut State,
        expansion: Expansion,
        from: VersionId,
        to: VersionId,
        names: &'a mut dyn NameAllocator,
    ) -> Result<Self, MigrationError> {
        let mut planner = Self {
            catalog: &mut state.catalog,
            reflog: &mut state.reflog,
            names,
            expansion,
            plan: Plan::new(from.clone(), to.clone()),
            from,
            to,
            ghost_tables: BTreeSet::new(),
            graph: Graph::default(),
            progress: ColumnProgress::default(),
            null_records: BTreeSet::new(),
        };
        planner.reset()?;
        Ok(planner)
    }

    fn reset(&mut self) -> Result<(), MigrationError> {
        let before: BTreeSet<String> = self.ref_ids_at(&self.from)?;
        let after: BTreeSet<String> = self.ref_ids_at(&self.to)?;
        self.ghost_tables = after.difference(&before).cloned().collect();
        self.graph = Graph::from_catalog(self.catalog, &self.ghost_tables)?;
        self.progress = ColumnProgress::default();
        self.plan = Plan::new(self.from.clone(), self.to.clone());
        self.null_records.clear();
        debug!(ghost_tables = ?self.ghost_tables, "Planning ghost tables");
        Ok(())
    }

    fn ref_ids_at(&self, version: &VersionId) -> Result<BTreeSet<String>, MigrationError> {
        let mut ids = BTreeSet::new();
        for key in self.reflog.table_refs_at(version) {
            ids.insert(self.reflog.table(key)?.ref_id().to_string());
        }
        Ok(ids)
    }

    fn run(mut self) -> Result<Plan, MigrationError> {
        loop {
            let to_do = self.to_do();
            if to_do.is_empty() {
                break;
            }

            let least = self.graph.least_outgoing_foreign_keys(&to_do);
            let outcome = if least.count == 0 {
                self.migrate_tables(least.tables.into_iter().collect(), false)
            } else {
                let most = self
                    .graph
                    .most_incoming_foreign_keys(self.catalog, &least.tables);
                self.migrate_tables(most.tables.into_iter().collect(), most.count == 0)
            };

            match outcome {
                Ok(()) => {}
                Err(Interrupt::Reset) => self.reset()?,
                Err(Interrupt::Failed(error)) => return Err(error),
            }
        }

        self.add_drop_nulls_step()?;

        let sequences = self.expansion.finish(self.catalog, self.reflog, &self.to)?;
        let mut plan = self.plan;
        plan.set_new_sequences(
            sequences
                .into_iter()
                .filter(|s| self.ghost_tables.contains(&s.table))
                .collect(),
        );
        plan.set_ghost_tables(self.ghost_tables);
        info!(steps = plan.len(), ghost_tables = plan.ghost_tables().len(), "Planned migration");
        Ok(plan)
    }

    fn to_do(&self) -> BTreeSet<String> {
        self.graph
            .tables()
            .into_iter()
            .filter(|table| self.progress.of(self.catalog, table) == TableProgress::Pending)
            .collect()
    }

    fn is_ready(&self, referred_table: &str) -> bool {
        !self.graph.contains(referred_table)
            || self.progress.of(self.catalog, referred_table) != TableProgress::Pending
    }

    /// Copy the given tables, each without the columns referring to pending tables
    /// unless `all_columns` is set.
    fn migrate_tables(&mut self, tables: Vec<String>, all_columns: bool) -> Planned<()> {
        debug!(tables = ?tables, "Migrating tables");
        let mut queue: VecDeque<String> = tables.into();
        let mut requeues = 0;
        let limit = (self.graph.tables().len() + 1).pow(2);

        while let Some(table_id) = queue.pop_front() {
            let table = self.catalog.table(&table_id)?.clone();
            let columns: Vec<String> = table
                .columns
                .iter()
                .filter(|column| {
                    all_columns
                        || table
                            .outgoing_foreign_key(&column.name)
                            .map(|fk| self.is_ready(&fk.referred_table))
                            .unwrap_or(true)
                })
                .map(|column| column.name.clone())
                .collect();

            let missing_identity = table
                .identity_column_names()
                .iter()
                .any(|identity| !columns.contains(identity));
            if missing_identity {
                requeues += 1;
                if requeues > limit {
                    return Err(MigrationError::planning(format!(
                        "cannot order the identity columns of table {}",
                        table_id
                    ))
                    .into());
                }

                queue.push_front(table_id.clone());
                let mut parents = Vec::new();
                for identity in table.identity_column_names() {
                    if let Some(fk) = table.outgoing_foreign_key(&identity) {
                        if self.graph.contains(&fk.referred_table) && !parents.contains(&fk.referred_table) {
                            parents.push(fk.referred_table.clone());
                        }
                    }
                }
                for parent in parents {
                    queue.retain(|queued| *queued != parent);
                    queue.push_front(parent);
                }
                continue;
            }

            let dependencies = self.copy_dependencies(&table, &columns);
            let step = self.copy(&table_id, &columns)?;
            for dependency in dependencies {
                self.plan.make_dependent_on(step, dependency)?;
            }
            self.apply_rules(step)?;
        }
        Ok(())
    }

    /// First COPY steps of the tables referred to through `columns`, without those
    /// already implied by another.
    fn copy_dependencies(&self, table: &TableDef, columns: &[String]) -> BTreeSet<StepId> {
        let referred: BTreeSet<&String> = table
            .foreign_keys
            .iter()
            .filter(|fk| fk.referencing_columns.iter().any(|c| columns.contains(c)))
            .map(|fk| &fk.referred_table)
            .collect();

        let mut dependencies: BTreeSet<StepId> = referred
            .into_iter()
            .filter_map(|referred| self.find_first_copy(referred))
            .collect();

        let mut implied: Vec<(StepId, BTreeSet<StepId>)> = dependencies
            .iter()
            .map(|step| (*step, self.plan.transitive_dependencies(*step)))
            .collect();
        implied.sort_by_key(|(_, transitive)| Reverse(transitive.len()));
        for (_, transitive) in implied {
            for step in transitive {
                dependencies.remove(&step);
            }
        }
        dependencies
    }

    fn find_first_copy(&self, table: &str) -> Option<StepId> {
        self.plan
            .steps()
            .find(|(_, step)| matches!(step.operation(), Operation::Copy { table: copied, .. } if copied == table))
            .map(|(id, _)| id)
    }

    fn find_add_null(&self, table: &str) -> Option<StepId> {
        self.plan
            .steps()
            .find(|(_, step)| matches!(step.operation(), Operation::AddNull { tables } if tables.contains(table)))
            .map(|(id, _)| id)
    }

    /// Append a COPY step for the columns of `table` not copied yet. When none are
    /// left, the last COPY step of the table is returned instead.
    fn copy(&mut self, table: &str, columns: &[String]) -> Planned<StepId> {
        let remaining = self.progress.remaining(self.catalog.table(table)?);
        let filtered: Vec<String> = columns
            .iter()
            .filter(|column| remaining.contains(column))
            .cloned()
            .collect();

        if filtered.is_empty() {
            let last = self
                .plan
                .steps()
                .filter(|(_, step)| matches!(step.operation(), Operation::Copy { table: copied, .. } if copied == table))
                .map(|(id, _)| id)
                .last();
            return last.ok_or_else(|| {
                MigrationError::planning(format!("no columns of table {} left to copy", table)).into()
            });
        }

        self.progress.mark(table, &filtered);
        Ok(self.plan.push_back(Operation::Copy {
            table: table.to_string(),
            columns: filtered,
        }))
    }

    /// The plan holds at most one ADD_NULL step. Further null records join it.
    fn add_null_record(&mut self, table: &str) -> Planned<StepId> {
        if let Some(existing) = self.find_add_null(table) {
            return Ok(existing);
        }
        self.null_records.insert(table.to_string());
        let step = match self.plan.steps_of_kind(OperationKind::AddNull).first() {
            Some(&existing) => {
                if let Operation::AddNull { tables } = self.plan.operation_mut(existing) {
                    tables.insert(table.to_string());
                }
                existing
            }
            None => self.plan.push_front(Operation::AddNull {
                tables: BTreeSet::from([table.to_string()]),
            }),
        };
        self.apply_dependency_rule(step)?;
        Ok(step)
    }

    fn add_drop_nulls_step(&mut self) -> Result<(), MigrationError> {
        if self.null_records.is_empty() {
            return Ok(());
        }
        let sinks = self.plan.sinks();
        let step = self.plan.push_back(Operation::DropNull {
            tables: self.null_records.clone(),
        });
        for sink in sinks {
            self.plan.make_dependent_on(step, sink)?;
        }
        Ok(())
    }

    fn apply_rules(&mut self, step: StepId) -> Planned<()> {
        self.apply_dependency_rule(step)?;
        self.apply_completion_rule(step)
    }

    /// Make sure every NOT NULL foreign key a step cannot fill from source rows can
    /// point at a null record inserted before it.
    fn apply_dependency_rule(&mut self, step: StepId) -> Planned<()> {
        match self.plan.step(step).operation().clone() {
            Operation::DropNull { .. } => Ok(()),
            Operation::Copy { table, .. } => {
                let definition = self.catalog.table(&table)?.clone();
                let covered = self.progress.migrated_columns(&table);
                for fk in definition.not_nullable_foreign_keys() {
                    if fk.referencing_columns.iter().all(|c| covered.contains(c)) {
                        continue;
                    }
                    if !self.graph.contains(&fk.referred_table) {
                        self.expand(&fk.referred_table)?;
                        return Err(Interrupt::Reset);
                    }
                    let add_null = self.add_null_record(&fk.referred_table)?;
                    self.plan.make_dependent_on(step, add_null)?;
                }
                Ok(())
            }
            Operation::AddNull { .. } => loop {
                let tables = self.plan.step(step).operation().tables();
                let mut added = false;
                for table in &tables {
                    let definition = self.catalog.table(table)?.clone();
                    for fk in definition.not_nullable_foreign_keys() {
                        let referred = &fk.referred_table;
                        if self.plan.step(step).operation().touches(referred) {
                            continue;
                        }
                        if !self.graph.contains(referred) {
                            self.expand(referred)?;
                            return Err(Interrupt::Reset);
                        }
                        if let Operation::AddNull { tables } = self.plan.operation_mut(step) {
                            tables.insert(referred.clone());
                        }
                        self.null_records.insert(referred.clone());
                        added = true;
                    }
                }
                if !added {
                    return Ok(());
                }
            },
        }
    }

    /// Complete partially copied tables whose referred tables are no longer pending.
    fn apply_completion_rule(&mut self, step: StepId) -> Planned<()> {
        if !matches!(self.plan.step(step).operation(), Operation::Copy { .. }) {
            return Ok(());
        }

        let partial = self
            .progress
            .with_progress(self.catalog, TableProgress::Partial);
        for table_id in partial {
            let table = self.catalog.table(&table_id)?.clone();
            let remaining = self.progress.remaining(&table);
            if remaining.is_empty() {
                continue;
            }
            let ready = table
                .foreign_keys
                .iter()
                .all(|fk| self.is_ready(&fk.referred_table));
            if !ready {
                continue;
            }

            let mut dependencies = self.copy_dependencies(&table, &remaining);
            dependencies.extend(self.find_first_copy(&table_id));
            let dependent = self.copy(&table_id, &remaining)?;
            for dependency in dependencies {
                if dependency != dependent {
                    self.plan.make_dependent_on(dependent, dependency)?;
                }
            }
            self.apply_rules(dependent)?;
        }
        Ok(())
    }

    /// Ghost a live table referred to by a ghost table, so its null record never
    /// becomes visible to the source version.
    fn expand(&mut self, table: &str) -> Planned<()> {
        let key = self.reflog.get_table_ref_by_id(table)?;
        let name = self.reflog.table(key)?.name().to_string();
        let before = self.expansion.created().len();
        info!(table = %name, ref_id = %table, "Expanding migration with referred table");

        self.expansion
            .mirror(self.catalog, self.reflog, &self.to, &name, None, &mut *self.names)?;
        if self.expansion.created().len() == before {
            return Err(MigrationError::planning(format!(
                "expanding the migration with table {} created no ghost table",
                name
            ))
            .into());
        }
        Ok(())
    }
}
