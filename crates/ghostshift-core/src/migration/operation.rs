//! Structural operations executed by a migration plan.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Kind of a plan operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    AddNull,
    DropNull,
    Copy,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::AddNull => write!(f, "ADD_NULL"),
            OperationKind::DropNull => write!(f, "DROP_NULL"),
            OperationKind::Copy => write!(f, "COPY"),
        }
    }
}

/// One unit of work in a plan. Tables are physical (ref id) names of ghost tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    /// Insert placeholder rows into the tables, in one deferred transaction.
    AddNull {
        /// Ghost tables receiving a null record.
        tables: BTreeSet<String>,
    },
    /// Remove the placeholder rows again.
    DropNull {
        /// Ghost tables holding a null record.
        tables: BTreeSet<String>,
    },
    /// Backfill a subset of a ghost table's columns.
    Copy {
        /// Ghost table.
        table: String,
        /// Columns to backfill, in table order, without duplicates.
        columns: Vec<String>,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::AddNull { .. } => OperationKind::AddNull,
            Operation::DropNull { .. } => OperationKind::DropNull,
            Operation::Copy { .. } => OperationKind::Copy,
        }
    }

    /// Tables touched by the operation.
    pub fn tables(&self) -> BTreeSet<String> {
        match self {
            Operation::AddNull { tables } | Operation::DropNull { tables } => tables.clone(),
            Operation::Copy { table, .. } => BTreeSet::from([table.clone()]),
        }
    }

    pub fn touches(&self, table: &str) -> bool {
        match self {
            Operation::AddNull { tables } | Operation::DropNull { tables } => tables.contains(table),
            Operation::Copy { table: copied, .. } => copied == table,
        }
    }

    /// Columns copied; empty for null record operations.
    pub fn columns(&self) -> &[String] {
        match self {
            Operation::Copy { columns, .. } => columns,
            _ => &[],
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables: Vec<String> = self.tables().into_iter().collect();
        write!(f, "{} [{}]", self.kind(), tables.join(", "))?;
        if !self.columns().is_empty() {
            write!(f, " [{}]", self.columns().join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let copy = Operation::Copy {
            table: "table_1".to_string(),
            columns: vec!["id".to_string(), "name".to_string()],
        };
        assert_eq!(copy.to_string(), "COPY [table_1] [id, name]");

        let add = Operation::AddNull {
            tables: BTreeSet::from(["table_2".to_string(), "table_1".to_string()]),
        };
        assert_eq!(add.to_string(), "ADD_NULL [table_1, table_2]");
    }

    #[test]
    fn test_touches() {
        let add = Operation::AddNull {
            tables: BTreeSet::from(["table_1".to_string()]),
        };
        assert!(add.touches("table_1"));
        assert!(!add.touches("table_2"));
        assert!(add.columns().is_empty());
    }
}
