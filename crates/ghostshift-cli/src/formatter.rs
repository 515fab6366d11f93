//! Output formatters for plans, versions and run records.

use clap::ValueEnum;
use comfy_table::{Cell, Table};
use ghostshift_core::migration::{StepId, StepStatus};
use ghostshift_core::{MigrationRun, Plan, State, VersionId};
use std::collections::BTreeSet;

/// Output format for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// One row of the version listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSummary {
    pub id: String,
    pub active: bool,
    pub operation: Option<String>,
    /// `(logical name, physical name)` of each table in the version.
    pub tables: Vec<(String, String)>,
}

impl VersionSummary {
    /// Summaries of every version, oldest first.
    pub fn collect(state: &State) -> Vec<Self> {
        state
            .changelog
            .iter()
            .map(|version| {
                let operation = version.operation.as_ref().map(|op| op.description());
                Self::of(state, &version.id, operation)
            })
            .collect()
    }

    fn of(state: &State, id: &VersionId, operation: Option<String>) -> Self {
        let mut tables: Vec<(String, String)> = state
            .reflog
            .table_refs_at(id)
            .into_iter()
            .filter_map(|key| state.reflog.table(key).ok())
            .map(|table| (table.name().to_string(), table.ref_id().to_string()))
            .collect();
        tables.sort();

        Self {
            id: id.to_string(),
            active: state.reflog.is_active(id),
            operation,
            tables,
        }
    }
}

/// Trait for formatting output.
pub trait Formatter {
    /// Format a migration plan.
    fn format_plan(&self, plan: &Plan) -> String;

    /// Format the version listing.
    fn format_versions(&self, versions: &[VersionSummary]) -> String;

    /// Format migration run records.
    fn format_runs(&self, runs: &[MigrationRun]) -> String;

    /// Format a simple message.
    fn format_message(&self, message: &str) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_plan(&self, plan: &Plan) -> String {
        if plan.is_empty() {
            return format!("No steps between {} and {}", plan.from, plan.to);
        }

        let mut table = Table::new();
        table.set_header(vec!["#", "Operation", "Depends on"]);
        for (id, step) in plan.steps() {
            table.add_row(vec![
                Cell::new(plan.position(id)),
                Cell::new(step.operation()),
                Cell::new(dependency_positions(plan, step.dependencies())),
            ]);
        }

        let ghosts: Vec<&str> = plan.ghost_tables().iter().map(String::as_str).collect();
        format!(
            "Plan {} -> {}\n{}\nGhost tables: {}",
            plan.from,
            plan.to,
            table,
            if ghosts.is_empty() { "-".to_string() } else { ghosts.join(", ") }
        )
    }

    fn format_versions(&self, versions: &[VersionSummary]) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Version", "Active", "Operation", "Tables"]);
        for version in versions {
            let tables: Vec<String> = version
                .tables
                .iter()
                .map(|(name, physical)| {
                    if name == physical {
                        name.clone()
                    } else {
                        format!("{} -> {}", name, physical)
                    }
                })
                .collect();
            table.add_row(vec![
                Cell::new(&version.id),
                Cell::new(if version.active { "yes" } else { "" }),
                Cell::new(version.operation.as_deref().unwrap_or("(root)")),
                Cell::new(tables.join("\n")),
            ]);
        }
        table.to_string()
    }

    fn format_runs(&self, runs: &[MigrationRun]) -> String {
        if runs.is_empty() {
            return "No migration runs".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec!["Run", "From", "To", "Status", "Steps", "Error"]);
        for run in runs {
            let done = run
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Complete)
                .count();
            table.add_row(vec![
                Cell::new(run.id_hex()),
                Cell::new(&run.from_version),
                Cell::new(&run.to_version),
                Cell::new(run.status),
                Cell::new(format!("{}/{}", done, run.steps.len())),
                Cell::new(run.error.as_deref().unwrap_or("")),
            ]);
        }
        table.to_string()
    }

    fn format_message(&self, message: &str) -> String {
        message.to_string()
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_plan(&self, plan: &Plan) -> String {
        let steps: Vec<serde_json::Value> = plan
            .steps()
            .map(|(id, step)| {
                serde_json::json!({
                    "position": plan.position(id),
                    "operation": step.operation().to_string(),
                    "depends_on": dependency_list(plan, step.dependencies()),
                })
            })
            .collect();

        serde_json::json!({
            "from": plan.from.to_string(),
            "to": plan.to.to_string(),
            "steps": steps,
            "ghost_tables": plan.ghost_tables(),
        })
        .to_string()
    }

    fn format_versions(&self, versions: &[VersionSummary]) -> String {
        let versions: Vec<serde_json::Value> = versions
            .iter()
            .map(|v| {
                let tables: serde_json::Map<String, serde_json::Value> = v
                    .tables
                    .iter()
                    .map(|(name, physical)| (name.clone(), serde_json::Value::from(physical.as_str())))
                    .collect();
                serde_json::json!({
                    "id": v.id,
                    "active": v.active,
                    "operation": v.operation,
                    "tables": tables,
                })
            })
            .collect();
        serde_json::Value::Array(versions).to_string()
    }

    fn format_runs(&self, runs: &[MigrationRun]) -> String {
        let runs: Vec<serde_json::Value> = runs
            .iter()
            .map(|run| {
                let steps: Vec<serde_json::Value> = run
                    .steps
                    .iter()
                    .map(|s| {
                        serde_json::json!({
                            "operation": s.operation,
                            "status": s.status.to_string(),
                            "batches": s.batches,
                            "last_cursor": s.last_cursor,
                            "error": s.error,
                        })
                    })
                    .collect();
                serde_json::json!({
                    "id": run.id_hex(),
                    "from": run.from_version,
                    "to": run.to_version,
                    "status": run.status.to_string(),
                    "started_at": run.started_at,
                    "completed_at": run.completed_at,
                    "error": run.error,
                    "ghost_tables": run.ghost_tables,
                    "steps": steps,
                })
            })
            .collect();
        serde_json::Value::Array(runs).to_string()
    }

    fn format_message(&self, message: &str) -> String {
        serde_json::json!({ "message": message }).to_string()
    }
}

fn dependency_list(plan: &Plan, dependencies: &BTreeSet<StepId>) -> Vec<usize> {
    let mut positions: Vec<usize> = dependencies.iter().map(|d| plan.position(*d)).collect();
    positions.sort_unstable();
    positions
}

fn dependency_positions(plan: &Plan, dependencies: &BTreeSet<StepId>) -> String {
    dependency_list(plan, dependencies)
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghostshift_core::migration::Operation;

    fn plan() -> Plan {
        let mut plan = Plan::new(VersionId::from("v1"), VersionId::from("v2"));
        let first = plan.push_back(Operation::AddNull {
            tables: ["orders".to_string()].into(),
        });
        let copy = plan.push_back(Operation::Copy {
            table: "table_abc".to_string(),
            columns: vec!["id".to_string(), "email".to_string()],
        });
        plan.make_dependent_on(copy, first).unwrap();
        plan
    }

    #[test]
    fn test_table_plan_lists_steps() {
        let output = TableFormatter.format_plan(&plan());
        assert!(output.contains("Plan v1 -> v2"));
        assert!(output.contains("COPY [table_abc] [id, email]"));
    }

    #[test]
    fn test_json_plan_dependencies() {
        let output = JsonFormatter.format_plan(&plan());
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["steps"][1]["depends_on"], serde_json::json!([1]));
        assert_eq!(value["from"], "v1");
    }

    #[test]
    fn test_empty_plan() {
        let plan = Plan::new(VersionId::from("v1"), VersionId::from("v1"));
        assert_eq!(TableFormatter.format_plan(&plan), "No steps between v1 and v1");
    }

    #[test]
    fn test_versions_table_marks_renamed_tables() {
        let versions = vec![VersionSummary {
            id: "v2".to_string(),
            active: true,
            operation: None,
            tables: vec![("customers".to_string(), "table_x1".to_string())],
        }];
        let output = TableFormatter.format_versions(&versions);
        assert!(output.contains("customers -> table_x1"));
        assert!(output.contains("(root)"));
    }

    #[test]
    fn test_no_runs() {
        assert_eq!(TableFormatter.format_runs(&[]), "No migration runs");
        assert_eq!(JsonFormatter.format_runs(&[]), "[]");
    }
}
