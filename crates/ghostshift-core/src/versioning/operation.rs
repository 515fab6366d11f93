//! Schema operations recorded in the changelog.

use crate::catalog::{ColumnDef, ColumnHint, ColumnType, ForeignKeyAction};
use serde::{Deserialize, Serialize};

/// A structural change to one or more logical tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum SchemaOperation {
    /// Create a new table.
    CreateTable {
        /// Logical table name.
        table: String,
        /// Column definitions.
        columns: Vec<ColumnDef>,
    },
    /// Remove a table from the version.
    DropTable {
        /// Logical table name.
        table: String,
    },
    /// Bind a table to a new logical name.
    RenameTable {
        /// Current logical name.
        table: String,
        /// New logical name.
        new_name: String,
    },
    /// Duplicate a table, structure and data, under a new logical name.
    CopyTable {
        /// Source logical name.
        source: String,
        /// Target logical name.
        target: String,
    },
    /// Add a column.
    AddColumn {
        /// Logical table name.
        table: String,
        /// The new column.
        column: ColumnDef,
    },
    /// Drop a column.
    DropColumn {
        /// Logical table name.
        table: String,
        /// Column name.
        column: String,
    },
    /// Change a column's name, type, hints or default.
    AlterColumn {
        /// Logical table name.
        table: String,
        /// Column name.
        column: String,
        /// New column name.
        #[serde(default)]
        new_name: Option<String>,
        /// New column type.
        #[serde(default)]
        new_type: Option<ColumnType>,
        /// Hints to add.
        #[serde(default)]
        add_hints: Vec<ColumnHint>,
        /// Hints to remove.
        #[serde(default)]
        drop_hints: Vec<ColumnHint>,
        /// New default expression; an empty string removes the default.
        #[serde(default)]
        new_default: Option<String>,
    },
    /// Add a foreign key.
    AddForeignKey {
        /// Logical name of the referencing table.
        table: String,
        /// Constraint name.
        name: String,
        /// Referencing columns.
        columns: Vec<String>,
        /// Logical name of the referred table.
        referred_table: String,
        /// Referred columns.
        referred_columns: Vec<String>,
        /// `ON UPDATE` action.
        #[serde(default)]
        on_update: ForeignKeyAction,
        /// `ON DELETE` action.
        #[serde(default)]
        on_delete: ForeignKeyAction,
    },
    /// Drop a foreign key by constraint name.
    DropForeignKey {
        /// Logical name of the referencing table.
        table: String,
        /// Constraint name.
        name: String,
    },
    /// Create an index.
    CreateIndex {
        /// Logical table name.
        table: String,
        /// Index name.
        name: String,
        /// Indexed columns.
        columns: Vec<String>,
        /// Whether the index is unique.
        #[serde(default)]
        unique: bool,
    },
    /// Drop an index by name.
    DropIndex {
        /// Logical table name.
        table: String,
        /// Index name.
        name: String,
    },
}

impl SchemaOperation {
    /// Short operation name.
    pub fn kind(&self) -> &'static str {
        match self {
            SchemaOperation::CreateTable { .. } => "create_table",
            SchemaOperation::DropTable { .. } => "drop_table",
            SchemaOperation::RenameTable { .. } => "rename_table",
            SchemaOperation::CopyTable { .. } => "copy_table",
            SchemaOperation::AddColumn { .. } => "add_column",
            SchemaOperation::DropColumn { .. } => "drop_column",
            SchemaOperation::AlterColumn { .. } => "alter_column",
            SchemaOperation::AddForeignKey { .. } => "add_foreign_key",
            SchemaOperation::DropForeignKey { .. } => "drop_foreign_key",
            SchemaOperation::CreateIndex { .. } => "create_index",
            SchemaOperation::DropIndex { .. } => "drop_index",
        }
    }

    /// Human-readable one-line description.
    pub fn description(&self) -> String {
        match self {
            SchemaOperation::CreateTable { table, columns } => {
                format!("Create table '{}' with {} columns", table, columns.len())
            }
            SchemaOperation::DropTable { table } => format!("Drop table '{}'", table),
            SchemaOperation::RenameTable { table, new_name } => {
                format!("Rename table '{}' to '{}'", table, new_name)
            }
            SchemaOperation::CopyTable { source, target } => {
                format!("Copy table '{}' to '{}'", source, target)
            }
            SchemaOperation::AddColumn { table, column } => {
                format!("Add column '{}.{}' ({})", table, column.name, column.column_type)
            }
            SchemaOperation::DropColumn { table, column } => {
                format!("Drop column '{}.{}'", table, column)
            }
            SchemaOperation::AlterColumn { table, column, .. } => {
                format!("Alter column '{}.{}'", table, column)
            }
            SchemaOperation::AddForeignKey {
                table,
                name,
                referred_table,
                ..
            } => format!(
                "Add foreign key '{}' from '{}' to '{}'",
                name, table, referred_table
            ),
            SchemaOperation::DropForeignKey { table, name } => {
                format!("Drop foreign key '{}' on '{}'", name, table)
            }
            SchemaOperation::CreateIndex { table, name, .. } => {
                format!("Create index '{}' on '{}'", name, table)
            }
            SchemaOperation::DropIndex { table, name } => {
                format!("Drop index '{}' on '{}'", name, table)
            }
        }
    }
}

impl std::fmt::Display for SchemaOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
