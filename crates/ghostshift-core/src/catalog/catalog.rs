//! Catalog of physical tables and sequences.

use super::constraint::ForeignKey;
use super::table::TableDef;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The physical structure of a database: every table by physical name plus its sequences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    /// Catalog (database) name.
    pub name: String,
    tables: BTreeMap<String, TableDef>,
    sequences: BTreeSet<String>,
}

impl Catalog {
    /// Create an empty catalog.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: BTreeMap::new(),
            sequences: BTreeSet::new(),
        }
    }

    /// Add a table, failing if the physical name is taken.
    pub fn add_table(&mut self, table: TableDef) -> Result<()> {
        if self.tables.contains_key(&table.name) {
            return Err(Error::already_exists("table", table.name));
        }
        for column in &table.columns {
            if let Some(sequence) = &column.sequence {
                self.sequences.insert(sequence.clone());
            }
        }
        self.tables.insert(table.name.clone(), table);
        Ok(())
    }

    /// Builder-style variant of [`Catalog::add_table`].
    pub fn with_table(mut self, table: TableDef) -> Result<Self> {
        self.add_table(table)?;
        Ok(self)
    }

    /// Get a table by physical name.
    pub fn table(&self, name: &str) -> Result<&TableDef> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::not_found("table", name))
    }

    /// Get a mutable table by physical name.
    pub fn table_mut(&mut self, name: &str) -> Result<&mut TableDef> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::not_found("table", name))
    }

    pub fn contains_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Remove a table.
    pub fn remove_table(&mut self, name: &str) -> Result<TableDef> {
        self.tables
            .remove(name)
            .ok_or_else(|| Error::not_found("table", name))
    }

    /// All tables ordered by physical name.
    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }

    /// Register a sequence.
    pub fn add_sequence(&mut self, name: impl Into<String>) {
        self.sequences.insert(name.into());
    }

    /// Forget a sequence.
    pub fn remove_sequence(&mut self, name: &str) -> bool {
        self.sequences.remove(name)
    }

    pub fn contains_sequence(&self, name: &str) -> bool {
        self.sequences.contains(name)
    }

    pub fn sequences(&self) -> impl Iterator<Item = &String> {
        self.sequences.iter()
    }

    /// Every foreign key with the name of its owning table.
    pub fn foreign_keys(&self) -> impl Iterator<Item = (&str, &ForeignKey)> {
        self.tables.values().flat_map(|table| {
            table
                .foreign_keys
                .iter()
                .map(move |fk| (table.name.as_str(), fk))
        })
    }

    /// Physical names of the tables holding a foreign key to `name`, excluding `name` itself.
    pub fn tables_referencing(&self, name: &str) -> BTreeSet<String> {
        self.foreign_keys()
            .filter(|(owner, fk)| fk.referred_table == name && *owner != name)
            .map(|(owner, _)| owner.to_string())
            .collect()
    }

    /// Number of distinct tables referencing `name` through a NOT NULL foreign key.
    pub fn not_nullable_incoming(&self, name: &str) -> usize {
        self.tables
            .values()
            .filter(|table| {
                table
                    .not_nullable_foreign_keys()
                    .any(|fk| fk.referred_table == name)
            })
            .count()
    }
}
