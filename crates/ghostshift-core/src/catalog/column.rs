//! Column definitions for tables.

use super::types::ColumnType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Structural hints attached to a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnHint {
    /// Part of the primary key.
    Identity,
    /// Rejects NULL values.
    NotNull,
    /// Filled from a sequence when omitted.
    AutoIncrement,
}

/// A column definition within a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// SQL type.
    pub column_type: ColumnType,
    /// Default value expression, verbatim SQL.
    #[serde(default)]
    pub default_expression: Option<String>,
    /// Structural hints.
    #[serde(default)]
    pub hints: BTreeSet<ColumnHint>,
    /// Sequence backing an auto-increment column.
    #[serde(default)]
    pub sequence: Option<String>,
}

impl ColumnDef {
    /// Create a nullable column without hints.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            default_expression: None,
            hints: BTreeSet::new(),
            sequence: None,
        }
    }

    /// Mark the column as part of the primary key. Identity columns are NOT NULL.
    pub fn identity(mut self) -> Self {
        self.hints.insert(ColumnHint::Identity);
        self.hints.insert(ColumnHint::NotNull);
        self
    }

    /// Mark the column as NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.hints.insert(ColumnHint::NotNull);
        self
    }

    /// Mark the column as auto-incrementing.
    pub fn auto_increment(mut self) -> Self {
        self.hints.insert(ColumnHint::AutoIncrement);
        self
    }

    /// Bind the column to an existing sequence.
    pub fn with_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.hints.insert(ColumnHint::AutoIncrement);
        self.sequence = Some(sequence.into());
        self
    }

    /// Set the default value expression.
    pub fn with_default(mut self, expression: impl Into<String>) -> Self {
        self.default_expression = Some(expression.into());
        self
    }

    pub fn is_identity(&self) -> bool {
        self.hints.contains(&ColumnHint::Identity)
    }

    pub fn is_not_null(&self) -> bool {
        self.hints.contains(&ColumnHint::NotNull)
    }

    pub fn is_auto_increment(&self) -> bool {
        self.hints.contains(&ColumnHint::AutoIncrement)
    }

    /// The default expression, or `NULL` when none is declared.
    pub fn default_or_null(&self) -> String {
        self.default_expression
            .clone()
            .filter(|expr| !expr.trim().is_empty())
            .unwrap_or_else(|| "NULL".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_implies_not_null() {
        let column = ColumnDef::new("id", ColumnType::BigInt).identity();
        assert!(column.is_identity());
        assert!(column.is_not_null());
        assert!(!column.is_auto_increment());
    }

    #[test]
    fn test_default_or_null() {
        let plain = ColumnDef::new("name", ColumnType::Text);
        assert_eq!(plain.default_or_null(), "NULL");

        let defaulted = ColumnDef::new("active", ColumnType::Boolean).with_default("true");
        assert_eq!(defaulted.default_or_null(), "true");
    }
}
