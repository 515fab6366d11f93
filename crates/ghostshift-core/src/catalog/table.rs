//! Table definitions.

use super::column::ColumnDef;
use super::constraint::{ForeignKey, IndexDef};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A physical table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    /// Physical table name (the ref id for tables managed by a RefLog).
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnDef>,
    /// Outgoing foreign keys.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    /// Secondary indexes.
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

impl TableDef {
    /// Create an empty table definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Add a column.
    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Add multiple columns.
    pub fn with_columns(mut self, columns: impl IntoIterator<Item = ColumnDef>) -> Self {
        self.columns.extend(columns);
        self
    }

    /// Add a foreign key.
    pub fn with_foreign_key(mut self, foreign_key: ForeignKey) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    /// Add an index.
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Copy the table under a new physical name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Get a column by name, failing when absent.
    pub fn require_column(&self, name: &str) -> Result<&ColumnDef> {
        self.column(name)
            .ok_or_else(|| Error::not_found("column", format!("{}.{}", self.name, name)))
    }

    /// Get a mutable column by name.
    pub fn column_mut(&mut self, name: &str) -> Result<&mut ColumnDef> {
        let table = self.name.clone();
        self.columns
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::not_found("column", format!("{}.{}", table, name)))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Column names in declaration order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Primary key columns in declaration order.
    pub fn identity_columns(&self) -> Vec<&ColumnDef> {
        self.columns.iter().filter(|c| c.is_identity()).collect()
    }

    /// Primary key column names in declaration order.
    pub fn identity_column_names(&self) -> Vec<String> {
        self.identity_columns()
            .into_iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// The foreign key a column takes part in, if any.
    pub fn outgoing_foreign_key(&self, column: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.involves(column))
    }

    /// Whether every referencing column of `foreign_key` is NOT NULL.
    pub fn is_not_nullable(&self, foreign_key: &ForeignKey) -> bool {
        foreign_key.referencing_columns.iter().all(|name| {
            self.column(name)
                .map(|column| column.is_not_null())
                .unwrap_or(false)
        })
    }

    /// NOT NULL foreign keys of this table.
    pub fn not_nullable_foreign_keys(&self) -> impl Iterator<Item = &ForeignKey> {
        self.foreign_keys
            .iter()
            .filter(move |fk| self.is_not_nullable(fk))
    }

    /// Add a column, failing on a duplicate name.
    pub fn add_column(&mut self, column: ColumnDef) -> Result<()> {
        if self.has_column(&column.name) {
            return Err(Error::already_exists(
                "column",
                format!("{}.{}", self.name, column.name),
            ));
        }
        self.columns.push(column);
        Ok(())
    }

    /// Remove a column together with the foreign keys and indexes that use it.
    pub fn remove_column(&mut self, name: &str) -> Result<ColumnDef> {
        let position = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| Error::not_found("column", format!("{}.{}", self.name, name)))?;
        let removed = self.columns.remove(position);
        self.foreign_keys.retain(|fk| !fk.involves(name));
        self.indexes.retain(|index| !index.columns.iter().any(|c| c == name));
        Ok(removed)
    }

    /// Rename a column, rewriting foreign keys and indexes that use it.
    pub fn rename_column(&mut self, name: &str, new_name: &str) -> Result<()> {
        if self.has_column(new_name) {
            return Err(Error::already_exists(
                "column",
                format!("{}.{}", self.name, new_name),
            ));
        }
        self.column_mut(name)?.name = new_name.to_string();
        for fk in &mut self.foreign_keys {
            for column in &mut fk.referencing_columns {
                if column == name {
                    *column = new_name.to_string();
                }
            }
        }
        for index in &mut self.indexes {
            for column in &mut index.columns {
                if column == name {
                    *column = new_name.to_string();
                }
            }
        }
        Ok(())
    }
}
