//! Structural checks run on a plan before any DDL executes.

use super::error::MigrationError;
use super::operation::{Operation, OperationKind};
use super::plan::{Plan, StepId};
use crate::catalog::Catalog;
use std::collections::{BTreeMap, BTreeSet};

/// Validate `plan` against the catalog holding its ghost tables.
pub fn validate(plan: &Plan, catalog: &Catalog) -> Result<(), MigrationError> {
    verify_acyclic(plan)?;
    verify_add_null_dependencies(plan)?;
    verify_null_records_added_and_dropped(plan)?;
    verify_drop_null_is_last(plan)?;
    verify_columns_covered_once(plan, catalog)?;
    verify_identities_copied_first(plan, catalog)?;
    verify_not_nullable_foreign_keys(plan, catalog)?;
    Ok(())
}

fn verify_acyclic(plan: &Plan) -> Result<(), MigrationError> {
    let mut remaining: BTreeMap<StepId, BTreeSet<StepId>> = plan
        .steps()
        .map(|(id, step)| (id, step.dependencies().clone()))
        .collect();

    while !remaining.is_empty() {
        let ready: Vec<StepId> = remaining
            .iter()
            .filter(|(_, dependencies)| dependencies.is_empty())
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            return Err(MigrationError::validation("the step graph contains a cycle"));
        }
        for id in ready {
            remaining.remove(&id);
            for dependencies in remaining.values_mut() {
                dependencies.remove(&id);
            }
        }
    }
    Ok(())
}

/// Null records go in before anything else, so an ADD_NULL step waits for nothing.
fn verify_add_null_dependencies(plan: &Plan) -> Result<(), MigrationError> {
    for id in plan.steps_of_kind(OperationKind::AddNull) {
        let step = plan.step(id);
        if !step.dependencies().is_empty() {
            return Err(MigrationError::validation(format!(
                "ADD_NULL step {} ({}) has dependencies",
                plan.position(id),
                step.operation()
            )));
        }
    }
    Ok(())
}

fn tables_of_kind(plan: &Plan, kind: OperationKind) -> Result<BTreeSet<String>, MigrationError> {
    let mut tables = BTreeSet::new();
    for id in plan.steps_of_kind(kind) {
        for table in plan.step(id).operation().tables() {
            if !tables.insert(table.clone()) {
                return Err(MigrationError::validation(format!(
                    "table {} appears in more than one {} step",
                    table, kind
                )));
            }
        }
    }
    Ok(tables)
}

fn verify_null_records_added_and_dropped(plan: &Plan) -> Result<(), MigrationError> {
    let added = tables_of_kind(plan, OperationKind::AddNull)?;
    let dropped = tables_of_kind(plan, OperationKind::DropNull)?;

    if let Some(table) = added.difference(&dropped).next() {
        return Err(MigrationError::validation(format!(
            "there is no DROP_NULL operation for table {}",
            table
        )));
    }
    if let Some(table) = dropped.difference(&added).next() {
        return Err(MigrationError::validation(format!(
            "there is no ADD_NULL operation for table {}",
            table
        )));
    }
    Ok(())
}

fn verify_drop_null_is_last(plan: &Plan) -> Result<(), MigrationError> {
    if plan.steps_of_kind(OperationKind::AddNull).is_empty() {
        return Ok(());
    }

    let sinks = plan.sinks();
    if sinks.len() != 1 {
        return Err(MigrationError::validation(format!(
            "expected a single last step, found {}",
            sinks.len()
        )));
    }
    let Some(last) = sinks.into_iter().next() else {
        return Err(MigrationError::validation("the plan has no last step"));
    };
    if plan.step(last).operation().kind() != OperationKind::DropNull {
        return Err(MigrationError::validation("the last step is not a DROP_NULL step"));
    }

    let before = plan.transitive_dependencies(last);
    let dropped = plan.step(last).operation().tables();
    for id in plan.steps_of_kind(OperationKind::Copy) {
        let touches_dropped = dropped.iter().any(|t| plan.step(id).operation().touches(t));
        if touches_dropped && !before.contains(&id) {
            return Err(MigrationError::validation(format!(
                "DROP_NULL may run before step {} ({})",
                plan.position(id),
                plan.step(id).operation()
            )));
        }
    }
    Ok(())
}

fn verify_columns_covered_once(plan: &Plan, catalog: &Catalog) -> Result<(), MigrationError> {
    let mut copied: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (_, step) in plan.steps() {
        if let Operation::Copy { table, columns } = step.operation() {
            let seen = copied.entry(table.as_str()).or_default();
            for column in columns {
                if !seen.insert(column.as_str()) {
                    return Err(MigrationError::validation(format!(
                        "column {}.{} is copied more than once",
                        table, column
                    )));
                }
            }
        }
    }

    for table in plan.ghost_tables() {
        let definition = catalog.table(table)?;
        let seen = copied.remove(table.as_str()).unwrap_or_default();
        for column in &definition.columns {
            if !seen.contains(column.name.as_str()) {
                return Err(MigrationError::validation(format!(
                    "column {}.{} is never copied",
                    table, column.name
                )));
            }
        }
        if let Some(unknown) = seen.iter().find(|c| !definition.has_column(c)) {
            return Err(MigrationError::validation(format!(
                "column {}.{} does not exist",
                table, unknown
            )));
        }
    }
    if let Some(table) = copied.keys().next() {
        return Err(MigrationError::validation(format!(
            "table {} is copied but is not a ghost table",
            table
        )));
    }
    Ok(())
}

fn copies_columns(operation: &Operation, table: &str, required: &BTreeSet<String>) -> bool {
    match operation {
        Operation::Copy {
            table: copied,
            columns,
        } => copied == table && required.iter().all(|c| columns.contains(c)),
        _ => false,
    }
}

fn verify_identities_copied_first(plan: &Plan, catalog: &Catalog) -> Result<(), MigrationError> {
    for id in plan.steps_of_kind(OperationKind::Copy) {
        let operation = plan.step(id).operation();
        let Operation::Copy { table, .. } = operation else {
            continue;
        };
        let identities: BTreeSet<String> = catalog
            .table(table)?
            .identity_column_names()
            .into_iter()
            .collect();
        if copies_columns(operation, table, &identities) {
            continue;
        }

        let satisfied = plan
            .transitive_dependencies(id)
            .into_iter()
            .any(|d| copies_columns(plan.step(d).operation(), table, &identities));
        if !satisfied {
            return Err(MigrationError::validation(format!(
                "identities of table {} are not copied before step {}",
                table,
                plan.position(id)
            )));
        }
    }
    Ok(())
}

fn verify_not_nullable_foreign_keys(plan: &Plan, catalog: &Catalog) -> Result<(), MigrationError> {
    for id in plan.steps_of_kind(OperationKind::Copy) {
        let Operation::Copy { table, .. } = plan.step(id).operation() else {
            continue;
        };
        let definition = catalog.table(table)?;

        let mut required: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        for fk in definition.not_nullable_foreign_keys() {
            if plan.ghost_tables().contains(&fk.referred_table) {
                required
                    .entry(fk.referred_table.as_str())
                    .or_default()
                    .extend(fk.referred_columns.iter().cloned());
            }
        }
        if required.is_empty() {
            continue;
        }

        let dependencies = plan.transitive_dependencies(id);
        for (referred, columns) in required {
            let satisfied = dependencies.iter().any(|d| {
                let operation = plan.step(*d).operation();
                match operation {
                    Operation::AddNull { tables } => tables.contains(referred),
                    _ => copies_columns(operation, referred, &columns),
                }
            });
            if !satisfied {
                return Err(MigrationError::validation(format!(
                    "identities of table {} must exist before step {} copies {}",
                    referred,
                    plan.position(id),
                    table
                )));
            }
        }
    }
    Ok(())
}
