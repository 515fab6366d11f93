//! Nodes of the RefLog graph.
//!
//! Nodes live in arenas owned by [`super::RefLog`] and refer to each other through
//! copyable keys, so lineage edges in both directions never form owning cycles.

use crate::versioning::VersionId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Handle to a [`TableRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableKey(pub(crate) usize);

/// Handle to a [`ColumnRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnKey(pub(crate) usize);

/// Handle to a [`SyncRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncKey(pub(crate) usize);

impl std::fmt::Display for TableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "table#{}", self.0)
    }
}

impl std::fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "column#{}", self.0)
    }
}

impl std::fmt::Display for SyncKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sync#{}", self.0)
    }
}

/// A logical table name bound to a physical table (its ref id) across a set of versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub(super) name: String,
    pub(super) ref_id: String,
    pub(super) versions: BTreeSet<VersionId>,
    pub(super) columns: Vec<ColumnKey>,
    pub(super) inbound_syncs: BTreeSet<SyncKey>,
    pub(super) outbound_syncs: BTreeSet<SyncKey>,
}

impl TableRef {
    /// Logical table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Physical table name.
    pub fn ref_id(&self) -> &str {
        &self.ref_id
    }

    /// Versions this table is present in.
    pub fn versions(&self) -> &BTreeSet<VersionId> {
        &self.versions
    }

    pub fn is_present(&self, version: &VersionId) -> bool {
        self.versions.contains(version)
    }

    /// Columns in creation order.
    pub fn columns(&self) -> &[ColumnKey] {
        &self.columns
    }

    /// Syncs writing into this table.
    pub fn inbound_syncs(&self) -> &BTreeSet<SyncKey> {
        &self.inbound_syncs
    }

    /// Syncs fed by this table.
    pub fn outbound_syncs(&self) -> &BTreeSet<SyncKey> {
        &self.outbound_syncs
    }
}

/// A logical column and its lineage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    pub(super) name: String,
    pub(super) table: TableKey,
    pub(super) based_on: BTreeSet<ColumnKey>,
    pub(super) basis_for: BTreeSet<ColumnKey>,
}

impl ColumnRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning table.
    pub fn table(&self) -> TableKey {
        self.table
    }

    /// Columns this column derives from.
    pub fn based_on(&self) -> &BTreeSet<ColumnKey> {
        &self.based_on
    }

    /// Columns derived from this column.
    pub fn basis_for(&self) -> &BTreeSet<ColumnKey> {
        &self.basis_for
    }
}

/// An installed trigger and function pair replicating one table into another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRef {
    pub(super) name: String,
    pub(super) function_name: String,
    pub(super) column_mapping: BTreeMap<ColumnKey, ColumnKey>,
    pub(super) source: TableKey,
    pub(super) target: TableKey,
}

impl SyncRef {
    /// Trigger name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Trigger function name.
    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Source column to target column.
    pub fn column_mapping(&self) -> &BTreeMap<ColumnKey, ColumnKey> {
        &self.column_mapping
    }

    pub fn source(&self) -> TableKey {
        self.source
    }

    pub fn target(&self) -> TableKey {
        self.target
    }
}

/// Whether a sync or walk moves towards newer or older versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forwards,
    Backwards,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Forwards => write!(f, "forwards"),
            Direction::Backwards => write!(f, "backwards"),
        }
    }
}

/// A column to create in a new table, with the columns it derives from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewColumn {
    pub name: String,
    pub based_on: BTreeSet<ColumnKey>,
}

impl NewColumn {
    /// A column without lineage.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            based_on: BTreeSet::new(),
        }
    }

    /// A column derived from `basis`.
    pub fn based_on(name: impl Into<String>, basis: impl IntoIterator<Item = ColumnKey>) -> Self {
        Self {
            name: name.into(),
            based_on: basis.into_iter().collect(),
        }
    }
}
