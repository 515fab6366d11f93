//! The versioned table/column lineage graph.

use super::refs::{
    ColumnKey, ColumnRef, Direction, NewColumn, SyncKey, SyncRef, TableKey, TableRef,
};
use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::versioning::VersionId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

/// Tracks which physical tables back which logical tables at every version, and how
/// columns evolve from one physical table into another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefLog {
    tables: Vec<Option<TableRef>>,
    columns: Vec<Option<ColumnRef>>,
    syncs: Vec<Option<SyncRef>>,
    by_version: BTreeMap<VersionId, BTreeSet<TableKey>>,
    positions: BTreeMap<VersionId, usize>,
    active_versions: BTreeSet<VersionId>,
}

impl RefLog {
    /// Create an empty RefLog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a RefLog mirroring `catalog` at the root `version`.
    pub fn init(catalog: &Catalog, version: &VersionId) -> Result<Self> {
        let mut reflog = Self::new();
        reflog.bootstrap(catalog, version)?;
        Ok(reflog)
    }

    /// Register every catalog table under its own name as ref id, at the root `version`.
    pub fn bootstrap(&mut self, catalog: &Catalog, version: &VersionId) -> Result<()> {
        if !self.positions.is_empty() {
            return Err(Error::InvalidArgument(
                "the RefLog has already been bootstrapped".to_string(),
            ));
        }

        self.positions.insert(version.clone(), 0);
        self.by_version.insert(version.clone(), BTreeSet::new());

        for table in catalog.tables() {
            let columns = table.columns.iter().map(|c| NewColumn::new(c.name.clone()));
            self.add_table(&table.name, &table.name, version, columns)?;
        }

        self.set_version_state(version, true);
        Ok(())
    }

    /// Make every table present in `parent` present in `version` as well.
    pub fn fork(&mut self, parent: &VersionId, version: &VersionId) -> Result<()> {
        let position = self.position(parent)?;
        if self.positions.contains_key(version) {
            return Err(Error::already_exists("version", version.as_str()));
        }

        self.positions.insert(version.clone(), position + 1);
        self.by_version.insert(version.clone(), BTreeSet::new());

        let inherited: Vec<TableKey> = self.table_refs_at(parent);
        for key in inherited {
            self.mark_present(key, version)?;
        }
        Ok(())
    }

    pub fn contains_version(&self, version: &VersionId) -> bool {
        self.positions.contains_key(version)
    }

    /// Position of `version` in the version chain; the root is 0.
    pub fn position(&self, version: &VersionId) -> Result<usize> {
        self.positions
            .get(version)
            .copied()
            .ok_or_else(|| Error::not_found("version", version.as_str()))
    }

    /// Known versions, oldest first.
    pub fn versions(&self) -> Vec<VersionId> {
        let mut versions: Vec<_> = self.positions.iter().collect();
        versions.sort_by_key(|(_, position)| **position);
        versions.into_iter().map(|(v, _)| v.clone()).collect()
    }

    /// Mark a version as (in)active.
    pub fn set_version_state(&mut self, version: &VersionId, active: bool) {
        if active {
            self.active_versions.insert(version.clone());
        } else {
            self.active_versions.remove(version);
        }
    }

    pub fn is_active(&self, version: &VersionId) -> bool {
        self.active_versions.contains(version)
    }

    pub fn active_versions(&self) -> &BTreeSet<VersionId> {
        &self.active_versions
    }

    // Lookups

    pub fn table(&self, key: TableKey) -> Result<&TableRef> {
        self.tables
            .get(key.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::not_found("table ref", key.to_string()))
    }

    fn table_mut(&mut self, key: TableKey) -> Result<&mut TableRef> {
        self.tables
            .get_mut(key.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::not_found("table ref", key.to_string()))
    }

    pub fn column(&self, key: ColumnKey) -> Result<&ColumnRef> {
        self.columns
            .get(key.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::not_found("column ref", key.to_string()))
    }

    fn column_mut(&mut self, key: ColumnKey) -> Result<&mut ColumnRef> {
        self.columns
            .get_mut(key.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::not_found("column ref", key.to_string()))
    }

    pub fn sync(&self, key: SyncKey) -> Result<&SyncRef> {
        self.syncs
            .get(key.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::not_found("sync ref", key.to_string()))
    }

    fn sync_mut(&mut self, key: SyncKey) -> Result<&mut SyncRef> {
        self.syncs
            .get_mut(key.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::not_found("sync ref", key.to_string()))
    }

    /// Every registered table.
    pub fn table_refs(&self) -> impl Iterator<Item = (TableKey, &TableRef)> {
        self.tables
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|t| (TableKey(i), t)))
    }

    /// Tables present in `version`.
    pub fn table_refs_at(&self, version: &VersionId) -> Vec<TableKey> {
        self.by_version
            .get(version)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The table bound to `name` at `version`.
    pub fn get_table_ref(&self, version: &VersionId, name: &str) -> Result<TableKey> {
        self.by_version
            .get(version)
            .into_iter()
            .flatten()
            .copied()
            .find(|key| self.table(*key).map(|t| t.name == name).unwrap_or(false))
            .ok_or_else(|| Error::not_found("table ref", format!("{}@{}", name, version)))
    }

    /// The table with physical name `ref_id`.
    pub fn get_table_ref_by_id(&self, ref_id: &str) -> Result<TableKey> {
        self.table_refs()
            .find(|(_, table)| table.ref_id == ref_id)
            .map(|(key, _)| key)
            .ok_or_else(|| Error::not_found("table ref", ref_id))
    }

    /// Physical names of every registered table.
    pub fn ref_ids(&self) -> BTreeSet<String> {
        self.table_refs().map(|(_, t)| t.ref_id.clone()).collect()
    }

    /// The column of `table` named `name`, if any.
    pub fn find_column(&self, table: TableKey, name: &str) -> Option<ColumnKey> {
        let table = self.table(table).ok()?;
        table
            .columns
            .iter()
            .copied()
            .find(|key| self.column(*key).map(|c| c.name == name).unwrap_or(false))
    }

    /// The column of `table` named `name`.
    pub fn column_named(&self, table: TableKey, name: &str) -> Result<ColumnKey> {
        self.find_column(table, name).ok_or_else(|| {
            let table_name = self
                .table(table)
                .map(|t| t.ref_id.clone())
                .unwrap_or_else(|_| table.to_string());
            Error::not_found("column ref", format!("{}.{}", table_name, name))
        })
    }

    /// Every registered sync.
    pub fn syncs(&self) -> impl Iterator<Item = (SyncKey, &SyncRef)> {
        self.syncs
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (SyncKey(i), s)))
    }

    /// The sync whose trigger is named `name`.
    pub fn sync_by_name(&self, name: &str) -> Result<SyncKey> {
        self.syncs()
            .find(|(_, sync)| sync.name == name)
            .map(|(key, _)| key)
            .ok_or_else(|| Error::not_found("sync ref", name))
    }

    /// Tables whose columns feed columns of `table`.
    pub fn based_on_tables(&self, table: TableKey) -> Result<BTreeSet<TableKey>> {
        self.neighbour_tables(table, Direction::Backwards)
    }

    /// Tables whose columns derive from columns of `table`.
    pub fn basis_for_tables(&self, table: TableKey) -> Result<BTreeSet<TableKey>> {
        self.neighbour_tables(table, Direction::Forwards)
    }

    fn neighbour_tables(&self, table: TableKey, direction: Direction) -> Result<BTreeSet<TableKey>> {
        let mut result = BTreeSet::new();
        for column in &self.table(table)?.columns {
            for neighbour in self.column_neighbours(*column, direction)? {
                result.insert(self.column(*neighbour)?.table);
            }
        }
        Ok(result)
    }

    fn column_neighbours(&self, column: ColumnKey, direction: Direction) -> Result<&BTreeSet<ColumnKey>> {
        let column = self.column(column)?;
        Ok(match direction {
            Direction::Forwards => &column.basis_for,
            Direction::Backwards => &column.based_on,
        })
    }

    /// Lowest version position `table` is present in.
    pub fn earliest_position(&self, table: TableKey) -> Result<usize> {
        let table_ref = self.table(table)?;
        table_ref
            .versions
            .iter()
            .filter_map(|v| self.positions.get(v).copied())
            .min()
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "table ref {} is not present in any version",
                    table_ref.ref_id
                ))
            })
    }

    // Mutations

    fn mark_present(&mut self, key: TableKey, version: &VersionId) -> Result<()> {
        let table = self.table_mut(key)?;
        table.versions.insert(version.clone());
        debug!(table = %table.name, ref_id = %table.ref_id, version = %version, "Marked table ref as present");
        self.by_version.entry(version.clone()).or_default().insert(key);
        Ok(())
    }

    fn mark_absent(&mut self, key: TableKey, version: &VersionId) -> Result<()> {
        let table = self.table_mut(key)?;
        table.versions.remove(version);
        debug!(table = %table.name, ref_id = %table.ref_id, version = %version, "Marked table ref as absent");
        if let Some(keys) = self.by_version.get_mut(version) {
            keys.remove(&key);
        }
        Ok(())
    }

    fn check_new_table(&self, name: &str, ref_id: &str, version: &VersionId) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("a table name is required".to_string()));
        }
        if ref_id.is_empty() {
            return Err(Error::InvalidArgument("a ref id is required".to_string()));
        }
        self.position(version)?;
        if self.get_table_ref(version, name).is_ok() {
            return Err(Error::already_exists(
                "table ref",
                format!("{}@{}", name, version),
            ));
        }
        if self.get_table_ref_by_id(ref_id).is_ok() {
            return Err(Error::already_exists("ref id", ref_id));
        }
        Ok(())
    }

    fn check_new_columns(&self, columns: &[NewColumn]) -> Result<()> {
        let mut names = BTreeSet::new();
        for column in columns {
            if !names.insert(column.name.as_str()) {
                return Err(Error::already_exists("column ref", column.name.clone()));
            }
            for basis in &column.based_on {
                self.column(*basis)?;
            }
        }
        Ok(())
    }

    fn insert_table(
        &mut self,
        name: &str,
        ref_id: &str,
        version: &VersionId,
        columns: Vec<NewColumn>,
    ) -> Result<TableKey> {
        let key = TableKey(self.tables.len());
        self.tables.push(Some(TableRef {
            name: name.to_string(),
            ref_id: ref_id.to_string(),
            versions: BTreeSet::new(),
            columns: Vec::new(),
            inbound_syncs: BTreeSet::new(),
            outbound_syncs: BTreeSet::new(),
        }));
        for column in columns {
            self.insert_column(key, column)?;
        }
        self.mark_present(key, version)?;
        Ok(key)
    }

    fn insert_column(&mut self, table: TableKey, column: NewColumn) -> Result<ColumnKey> {
        let key = ColumnKey(self.columns.len());
        for basis in &column.based_on {
            self.column_mut(*basis)?.basis_for.insert(key);
        }
        self.columns.push(Some(ColumnRef {
            name: column.name,
            table,
            based_on: column.based_on,
            basis_for: BTreeSet::new(),
        }));
        self.table_mut(table)?.columns.push(key);
        Ok(key)
    }

    /// Register a new table bound to `name` at `version`.
    pub fn add_table(
        &mut self,
        name: &str,
        ref_id: &str,
        version: &VersionId,
        columns: impl IntoIterator<Item = NewColumn>,
    ) -> Result<TableKey> {
        let columns: Vec<NewColumn> = columns.into_iter().collect();
        self.check_new_table(name, ref_id, version)?;
        self.check_new_columns(&columns)?;

        let key = self.insert_table(name, ref_id, version, columns)?;
        debug!(table = %name, ref_id = %ref_id, version = %version, "Added table ref");
        Ok(key)
    }

    /// Replace the table bound to `old_name` at `version` by a new physical table bound to
    /// `new_name`, whose columns derive one-to-one from the old table's columns.
    pub fn replace_table(
        &mut self,
        version: &VersionId,
        old_name: &str,
        new_name: &str,
        new_ref_id: &str,
    ) -> Result<TableKey> {
        if new_name.is_empty() {
            return Err(Error::InvalidArgument("a table name is required".to_string()));
        }
        if new_ref_id.is_empty() {
            return Err(Error::InvalidArgument("a ref id is required".to_string()));
        }
        let old = self.get_table_ref(version, old_name)?;
        if old_name != new_name && self.get_table_ref(version, new_name).is_ok() {
            return Err(Error::already_exists(
                "table ref",
                format!("{}@{}", new_name, version),
            ));
        }
        if self.get_table_ref_by_id(new_ref_id).is_ok() {
            return Err(Error::already_exists("ref id", new_ref_id));
        }

        let mut seeds = Vec::new();
        for column in &self.table(old)?.columns {
            seeds.push(NewColumn::based_on(self.column(*column)?.name.clone(), [*column]));
        }

        self.mark_absent(old, version)?;
        let replacement = self.insert_table(new_name, new_ref_id, version, seeds)?;
        if self.table(old)?.versions.is_empty() {
            self.drop_table_ref(old)?;
        }

        debug!(
            version = %version,
            from = %old_name,
            to = %new_name,
            ref_id = %new_ref_id,
            "Replaced table ref"
        );
        Ok(replacement)
    }

    /// Ghost the table bound to `name` at `version` into a new physical table.
    pub fn ghost_table(&mut self, version: &VersionId, name: &str, new_ref_id: &str) -> Result<TableKey> {
        self.replace_table(version, name, name, new_ref_id)
    }

    /// Bind a table to a new logical name in every version it is present in.
    pub fn rename_table(&mut self, key: TableKey, new_name: &str) -> Result<()> {
        if new_name.is_empty() {
            return Err(Error::InvalidArgument("a table name is required".to_string()));
        }
        let versions = self.table(key)?.versions.clone();
        for version in &versions {
            if let Ok(existing) = self.get_table_ref(version, new_name) {
                if existing != key {
                    return Err(Error::already_exists(
                        "table ref",
                        format!("{}@{}", new_name, version),
                    ));
                }
            }
        }
        let table = self.table_mut(key)?;
        debug!(from = %table.name, to = %new_name, ref_id = %table.ref_id, "Renamed table ref");
        table.name = new_name.to_string();
        Ok(())
    }

    /// Register a new table bound to `target_name` whose columns derive from the table
    /// bound to `source_name`, leaving the source in place.
    pub fn copy_table(
        &mut self,
        version: &VersionId,
        source_name: &str,
        target_name: &str,
        ref_id: &str,
    ) -> Result<TableKey> {
        let source = self.get_table_ref(version, source_name)?;
        let mut seeds = Vec::new();
        for column in &self.table(source)?.columns {
            seeds.push(NewColumn::based_on(self.column(*column)?.name.clone(), [*column]));
        }
        self.add_table(target_name, ref_id, version, seeds)
    }

    /// Detach the table bound to `name` from `version`, dropping it entirely when no
    /// version refers to it anymore.
    pub fn drop_table(&mut self, version: &VersionId, name: &str) -> Result<TableKey> {
        let key = self.get_table_ref(version, name)?;
        self.mark_absent(key, version)?;
        if self.table(key)?.versions.is_empty() {
            self.drop_table_ref(key)?;
        }
        Ok(key)
    }

    /// Drop a table regardless of the versions it is present in. Lineage through its
    /// columns is preserved by linking their bases directly to their derivatives.
    pub fn drop_table_ref(&mut self, key: TableKey) -> Result<TableRef> {
        let (versions, columns, syncs) = {
            let table = self.table(key)?;
            let syncs: Vec<SyncKey> = table
                .inbound_syncs
                .iter()
                .chain(table.outbound_syncs.iter())
                .copied()
                .collect();
            (table.versions.clone(), table.columns.clone(), syncs)
        };

        for version in &versions {
            if let Some(keys) = self.by_version.get_mut(version) {
                keys.remove(&key);
            }
        }
        for sync in syncs {
            if self.sync(sync).is_ok() {
                self.drop_sync(sync)?;
            }
        }
        for column in columns {
            self.detach_column(column)?;
        }

        let table = self
            .tables
            .get_mut(key.0)
            .and_then(Option::take)
            .ok_or_else(|| Error::not_found("table ref", key.to_string()))?;
        debug!(table = %table.name, ref_id = %table.ref_id, "Dropped table ref");
        Ok(table)
    }

    fn detach_column(&mut self, key: ColumnKey) -> Result<ColumnRef> {
        let column = self
            .columns
            .get_mut(key.0)
            .and_then(Option::take)
            .ok_or_else(|| Error::not_found("column ref", key.to_string()))?;

        for from in &column.based_on {
            if let Ok(basis) = self.column_mut(*from) {
                basis.basis_for.remove(&key);
            }
        }
        for to in &column.basis_for {
            if let Ok(derived) = self.column_mut(*to) {
                derived.based_on.remove(&key);
            }
        }
        for from in &column.based_on {
            for to in &column.basis_for {
                if from == to {
                    continue;
                }
                if self.column(*from).is_ok() && self.column(*to).is_ok() {
                    self.column_mut(*from)?.basis_for.insert(*to);
                    self.column_mut(*to)?.based_on.insert(*from);
                }
            }
        }

        for sync in self.syncs.iter_mut().flatten() {
            sync.column_mapping
                .retain(|source, target| *source != key && *target != key);
        }
        Ok(column)
    }

    /// Add a column to `table`.
    pub fn add_column(&mut self, table: TableKey, column: NewColumn) -> Result<ColumnKey> {
        if self.find_column(table, &column.name).is_some() {
            return Err(Error::already_exists("column ref", column.name));
        }
        self.check_new_columns(std::slice::from_ref(&column))?;
        self.insert_column(table, column)
    }

    /// Remove a column from `table`.
    pub fn drop_column(&mut self, table: TableKey, name: &str) -> Result<()> {
        let key = self.column_named(table, name)?;
        self.table_mut(table)?.columns.retain(|c| *c != key);
        self.detach_column(key)?;
        Ok(())
    }

    /// Rename a column of `table`.
    pub fn rename_column(&mut self, table: TableKey, old_name: &str, new_name: &str) -> Result<()> {
        if self.find_column(table, new_name).is_some() {
            return Err(Error::already_exists("column ref", new_name));
        }
        let key = self.column_named(table, old_name)?;
        self.column_mut(key)?.name = new_name.to_string();
        Ok(())
    }

    /// Register a sync replicating one table into another. The mapping also becomes
    /// part of the column lineage.
    pub fn add_sync(
        &mut self,
        name: &str,
        function_name: &str,
        column_mapping: BTreeMap<ColumnKey, ColumnKey>,
    ) -> Result<SyncKey> {
        if self.sync_by_name(name).is_ok() {
            return Err(Error::already_exists("sync ref", name));
        }
        if column_mapping.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "sync {} needs at least one mapped column",
                name
            )));
        }

        let mut sources = BTreeSet::new();
        let mut targets = BTreeSet::new();
        for (from, to) in &column_mapping {
            sources.insert(self.column(*from)?.table);
            targets.insert(self.column(*to)?.table);
        }
        if sources.len() != 1 {
            return Err(Error::InvalidArgument(format!(
                "sync {} must have exactly one source table",
                name
            )));
        }
        if targets.len() != 1 {
            return Err(Error::InvalidArgument(format!(
                "sync {} must have exactly one target table",
                name
            )));
        }
        let source = sources.into_iter().next().ok_or_else(|| {
            Error::InvalidArgument(format!("sync {} has no source table", name))
        })?;
        let target = targets.into_iter().next().ok_or_else(|| {
            Error::InvalidArgument(format!("sync {} has no target table", name))
        })?;
        if source == target {
            return Err(Error::InvalidArgument(format!(
                "sync {} cannot replicate a table into itself",
                name
            )));
        }

        let key = SyncKey(self.syncs.len());
        for (from, to) in &column_mapping {
            self.link(*from, *to)?;
        }
        self.syncs.push(Some(SyncRef {
            name: name.to_string(),
            function_name: function_name.to_string(),
            column_mapping,
            source,
            target,
        }));
        self.table_mut(source)?.outbound_syncs.insert(key);
        self.table_mut(target)?.inbound_syncs.insert(key);

        debug!(sync = %name, function = %function_name, "Added sync ref");
        Ok(key)
    }

    /// Extend an existing sync with one more column pair.
    pub fn add_sync_mapping(&mut self, sync: SyncKey, from: ColumnKey, to: ColumnKey) -> Result<()> {
        let (source, target) = {
            let sync = self.sync(sync)?;
            (sync.source, sync.target)
        };
        if self.column(from)?.table != source || self.column(to)?.table != target {
            return Err(Error::InvalidArgument(format!(
                "column pair {} -> {} does not match the sync's tables",
                from, to
            )));
        }
        self.link(from, to)?;
        self.sync_mut(sync)?.column_mapping.insert(from, to);
        Ok(())
    }

    fn link(&mut self, from: ColumnKey, to: ColumnKey) -> Result<()> {
        self.column(to)?;
        self.column_mut(from)?.basis_for.insert(to);
        self.column_mut(to)?.based_on.insert(from);
        Ok(())
    }

    /// Unregister a sync. Lineage edges it introduced are kept.
    pub fn drop_sync(&mut self, key: SyncKey) -> Result<SyncRef> {
        let sync = self
            .syncs
            .get_mut(key.0)
            .and_then(Option::take)
            .ok_or_else(|| Error::not_found("sync ref", key.to_string()))?;
        if let Ok(source) = self.table_mut(sync.source) {
            source.outbound_syncs.remove(&key);
        }
        if let Ok(target) = self.table_mut(sync.target) {
            target.inbound_syncs.remove(&key);
        }
        debug!(sync = %sync.name, "Dropped sync ref");
        Ok(sync)
    }

    /// Whether a sync feeds a newer or an older table.
    pub fn direction(&self, sync: SyncKey) -> Result<Direction> {
        let sync = self.sync(sync)?;
        self.direction_between(sync.source, sync.target)
    }

    fn direction_between(&self, from: TableKey, to: TableKey) -> Result<Direction> {
        if self.earliest_position(from)? <= self.earliest_position(to)? {
            Ok(Direction::Forwards)
        } else {
            Ok(Direction::Backwards)
        }
    }

    fn follows(direction: Direction, current: usize, next: usize) -> bool {
        match direction {
            Direction::Forwards => next >= current,
            Direction::Backwards => next <= current,
        }
    }

    /// For every table present at `from`, the tables present at `to` it evolves into,
    /// including copies of tables that are themselves still present at `to`. With
    /// `filter_unchanged`, a table present in both versions is not mapped onto itself.
    pub fn table_mapping(
        &self,
        from: &VersionId,
        to: &VersionId,
        filter_unchanged: bool,
    ) -> Result<BTreeMap<TableKey, BTreeSet<TableKey>>> {
        let direction = if self.position(from)? <= self.position(to)? {
            Direction::Forwards
        } else {
            Direction::Backwards
        };

        let mut mapping = BTreeMap::new();
        for start in self.table_refs_at(from) {
            let mut targets = BTreeSet::new();
            let mut visited = BTreeSet::from([start]);
            let mut queue = VecDeque::from([start]);

            while let Some(pointer) = queue.pop_front() {
                if self.table(pointer)?.is_present(to) && (!filter_unchanged || pointer != start) {
                    targets.insert(pointer);
                }
                let current = self.earliest_position(pointer)?;
                for next in self.neighbour_tables(pointer, direction)? {
                    if visited.insert(next)
                        && Self::follows(direction, current, self.earliest_position(next)?)
                    {
                        queue.push_back(next);
                    }
                }
            }

            if !targets.is_empty() {
                mapping.insert(start, targets);
            }
        }
        Ok(mapping)
    }

    /// Map every column of `from` onto the column of `to` it evolves into. Columns
    /// without a counterpart in `to` are left out.
    pub fn column_mapping(&self, from: TableKey, to: TableKey) -> Result<BTreeMap<ColumnKey, ColumnKey>> {
        let mut mapping = BTreeMap::new();
        if from == to {
            for column in &self.table(from)?.columns {
                mapping.insert(*column, *column);
            }
            return Ok(mapping);
        }

        let direction = self.direction_between(from, to)?;
        for column in &self.table(from)?.columns {
            let mut visited = BTreeSet::from([*column]);
            let mut queue = VecDeque::from([*column]);

            while let Some(pointer) = queue.pop_front() {
                let table = self.column(pointer)?.table;
                if table == to {
                    mapping.insert(*column, pointer);
                    break;
                }
                let current = self.earliest_position(table)?;
                for next in self.column_neighbours(pointer, direction)? {
                    if !visited.insert(*next) {
                        continue;
                    }
                    let next_table = self.column(*next)?.table;
                    if Self::follows(direction, current, self.earliest_position(next_table)?) {
                        queue.push_back(*next);
                    }
                }
            }
        }
        Ok(mapping)
    }

    /// Check the structural invariants: symmetric lineage edges, a version index that
    /// agrees with every table's version set, and syncs between two distinct live tables.
    pub fn verify(&self) -> Result<()> {
        for (i, column) in self.columns.iter().enumerate() {
            let Some(column) = column else { continue };
            let key = ColumnKey(i);
            for basis in &column.based_on {
                if !self.column(*basis)?.basis_for.contains(&key) {
                    return Err(Error::InvalidArgument(format!(
                        "asymmetric lineage: {} is based on {} but not its basis",
                        key, basis
                    )));
                }
            }
            for derived in &column.basis_for {
                if !self.column(*derived)?.based_on.contains(&key) {
                    return Err(Error::InvalidArgument(format!(
                        "asymmetric lineage: {} is basis for {} but not its base",
                        key, derived
                    )));
                }
            }
            if !self.table(column.table)?.columns.contains(&key) {
                return Err(Error::InvalidArgument(format!(
                    "{} is not listed by its table",
                    key
                )));
            }
        }

        for (key, table) in self.table_refs() {
            for version in &table.versions {
                let indexed = self
                    .by_version
                    .get(version)
                    .map(|keys| keys.contains(&key))
                    .unwrap_or(false);
                if !indexed {
                    return Err(Error::InvalidArgument(format!(
                        "table ref {} is missing from the index of version {}",
                        table.ref_id, version
                    )));
                }
            }
        }
        for (version, keys) in &self.by_version {
            for key in keys {
                if !self.table(*key)?.versions.contains(version) {
                    return Err(Error::InvalidArgument(format!(
                        "version {} indexes {} which is not present in it",
                        version, key
                    )));
                }
            }
        }

        for (key, sync) in self.syncs() {
            if sync.source == sync.target {
                return Err(Error::InvalidArgument(format!("{} is recursive", key)));
            }
            if !self.table(sync.source)?.outbound_syncs.contains(&key)
                || !self.table(sync.target)?.inbound_syncs.contains(&key)
            {
                return Err(Error::InvalidArgument(format!(
                    "{} is not registered with its tables",
                    key
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, ColumnType, TableDef};

    fn root() -> VersionId {
        VersionId::from("v0")
    }

    fn next() -> VersionId {
        VersionId::from("v1")
    }

    fn create_reflog() -> RefLog {
        let catalog = Catalog::new("test-db")
            .with_table(
                TableDef::new("users")
                    .with_column(ColumnDef::new("id", ColumnType::BigInt).identity())
                    .with_column(ColumnDef::new("name", ColumnType::Varchar(Some(255)))),
            )
            .unwrap();
        RefLog::init(&catalog, &root()).unwrap()
    }

    fn column_names(reflog: &RefLog, table: TableKey) -> Vec<String> {
        reflog
            .table(table)
            .unwrap()
            .columns()
            .iter()
            .map(|c| reflog.column(*c).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn test_bootstrap() {
        let reflog = create_reflog();
        let refs: Vec<_> = reflog.table_refs().collect();
        assert_eq!(refs.len(), 1);

        let (key, table) = refs[0];
        assert_eq!(table.name(), "users");
        assert_eq!(table.ref_id(), "users");
        assert_eq!(column_names(&reflog, key), vec!["id", "name"]);
        assert!(reflog.is_active(&root()));
        reflog.verify().unwrap();
    }

    #[test]
    fn test_bootstrap_twice_fails() {
        let mut reflog = create_reflog();
        let result = reflog.bootstrap(&Catalog::new("other"), &next());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_fork() {
        let mut reflog = create_reflog();
        reflog.fork(&root(), &next()).unwrap();

        let key = reflog.get_table_ref(&next(), "users").unwrap();
        assert_eq!(key, reflog.get_table_ref(&root(), "users").unwrap());
        assert_eq!(reflog.table(key).unwrap().versions().len(), 2);
        assert_eq!(reflog.position(&next()).unwrap(), 1);
        reflog.verify().unwrap();
    }

    #[test]
    fn test_fork_from_unknown_version_fails() {
        let mut reflog = create_reflog();
        let result = reflog.fork(&VersionId::from("ghost"), &next());
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_replace_table_in_root_drops_old() {
        let mut reflog = create_reflog();
        reflog.replace_table(&root(), "users", "users", "table_1").unwrap();

        let refs: Vec<_> = reflog.table_refs().collect();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].1.ref_id(), "table_1");
        assert_eq!(column_names(&reflog, refs[0].0), vec!["id", "name"]);
        reflog.verify().unwrap();
    }

    #[test]
    fn test_replace_table_in_next_version_links_lineage() {
        let mut reflog = create_reflog();
        reflog.fork(&root(), &next()).unwrap();
        let ghost = reflog.ghost_table(&next(), "users", "table_1").unwrap();
        let original = reflog.get_table_ref(&root(), "users").unwrap();

        assert_eq!(reflog.get_table_ref(&next(), "users").unwrap(), ghost);
        assert!(!reflog.table(original).unwrap().is_present(&next()));

        let old_id = reflog.column_named(original, "id").unwrap();
        let new_id = reflog.column_named(ghost, "id").unwrap();
        assert_eq!(reflog.column(old_id).unwrap().basis_for(), &BTreeSet::from([new_id]));
        assert_eq!(reflog.column(new_id).unwrap().based_on(), &BTreeSet::from([old_id]));
        reflog.verify().unwrap();
    }

    #[test]
    fn test_add_duplicate_table_fails() {
        let mut reflog = create_reflog();
        let result = reflog.add_table("users", "table_1", &root(), [NewColumn::new("id")]);
        assert!(matches!(result, Err(Error::AlreadyExists { .. })));
    }

    #[test]
    fn test_drop_intermediate_table_keeps_transitive_lineage() {
        let mut reflog = create_reflog();
        let v2 = VersionId::from("v2");
        reflog.fork(&root(), &next()).unwrap();
        let middle = reflog.ghost_table(&next(), "users", "table_1").unwrap();
        reflog.fork(&next(), &v2).unwrap();
        let last = reflog.ghost_table(&v2, "users", "table_2").unwrap();
        let first = reflog.get_table_ref(&root(), "users").unwrap();

        reflog.drop_table(&next(), "users").unwrap();
        assert!(reflog.table(middle).is_err());

        let mapping = reflog.column_mapping(first, last).unwrap();
        assert_eq!(mapping.len(), 2);
        for (from, to) in &mapping {
            assert_eq!(reflog.column(*to).unwrap().table(), last);
            assert_eq!(
                reflog.column(*from).unwrap().name(),
                reflog.column(*to).unwrap().name()
            );
        }
        reflog.verify().unwrap();
    }

    #[test]
    fn test_add_sync_validations() {
        let mut reflog = create_reflog();
        reflog.fork(&root(), &next()).unwrap();
        let ghost = reflog.ghost_table(&next(), "users", "table_1").unwrap();
        let original = reflog.get_table_ref(&root(), "users").unwrap();

        let recursive = BTreeMap::from([(
            reflog.column_named(original, "id").unwrap(),
            reflog.column_named(original, "name").unwrap(),
        )]);
        assert!(reflog.add_sync("trig_1", "sync_1", recursive).is_err());
        assert!(reflog.add_sync("trig_1", "sync_1", BTreeMap::new()).is_err());

        let mapping = reflog.column_mapping(original, ghost).unwrap();
        let sync = reflog.add_sync("trig_1", "sync_1", mapping.clone()).unwrap();
        assert_eq!(reflog.direction(sync).unwrap(), Direction::Forwards);
        assert!(reflog.table(original).unwrap().outbound_syncs().contains(&sync));
        assert!(reflog.table(ghost).unwrap().inbound_syncs().contains(&sync));

        let duplicate = reflog.add_sync("trig_1", "sync_2", mapping);
        assert!(matches!(duplicate, Err(Error::AlreadyExists { .. })));
        reflog.verify().unwrap();
    }

    #[test]
    fn test_backward_sync_does_not_confuse_mappings() {
        let mut reflog = create_reflog();
        reflog.fork(&root(), &next()).unwrap();
        let ghost = reflog.ghost_table(&next(), "users", "table_1").unwrap();
        let original = reflog.get_table_ref(&root(), "users").unwrap();

        let backward = reflog.column_mapping(ghost, original).unwrap();
        let sync = reflog.add_sync("trig_b", "sync_b", backward).unwrap();
        assert_eq!(reflog.direction(sync).unwrap(), Direction::Backwards);

        let forward = reflog.column_mapping(original, ghost).unwrap();
        assert_eq!(forward.len(), 2);
        assert!(forward.values().all(|c| reflog.column(*c).unwrap().table() == ghost));

        let tables = reflog.table_mapping(&root(), &next(), true).unwrap();
        assert_eq!(tables.get(&original), Some(&BTreeSet::from([ghost])));
        let back = reflog.table_mapping(&next(), &root(), true).unwrap();
        assert_eq!(back.get(&ghost), Some(&BTreeSet::from([original])));
        reflog.verify().unwrap();
    }

    #[test]
    fn test_table_mapping_filters_unchanged() {
        let mut reflog = create_reflog();
        reflog.fork(&root(), &next()).unwrap();
        let key = reflog.get_table_ref(&root(), "users").unwrap();

        assert!(reflog.table_mapping(&root(), &next(), true).unwrap().is_empty());
        let unfiltered = reflog.table_mapping(&root(), &next(), false).unwrap();
        assert_eq!(unfiltered.get(&key), Some(&BTreeSet::from([key])));
    }

    #[test]
    fn test_dropped_column_is_unmapped() {
        let mut reflog = create_reflog();
        reflog.fork(&root(), &next()).unwrap();
        let ghost = reflog.ghost_table(&next(), "users", "table_1").unwrap();
        reflog.drop_column(ghost, "name").unwrap();
        reflog
            .add_column(ghost, NewColumn::new("date_of_birth"))
            .unwrap();

        let original = reflog.get_table_ref(&root(), "users").unwrap();
        let mapping = reflog.column_mapping(original, ghost).unwrap();
        let names: Vec<_> = mapping
            .values()
            .map(|c| reflog.column(*c).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["id"]);
        reflog.verify().unwrap();
    }

    #[test]
    fn test_drop_table_ref_drops_syncs() {
        let mut reflog = create_reflog();
        reflog.fork(&root(), &next()).unwrap();
        let ghost = reflog.ghost_table(&next(), "users", "table_1").unwrap();
        let original = reflog.get_table_ref(&root(), "users").unwrap();
        let mapping = reflog.column_mapping(original, ghost).unwrap();
        reflog.add_sync("trig_1", "sync_1", mapping).unwrap();

        reflog.drop_table_ref(original).unwrap();
        assert_eq!(reflog.syncs().count(), 0);
        assert!(reflog.table(ghost).unwrap().inbound_syncs().is_empty());
        assert!(reflog.table_refs_at(&root()).is_empty());
        reflog.verify().unwrap();
    }

    #[test]
    fn test_table_mapping_reaches_copies() {
        let mut reflog = create_reflog();
        reflog.fork(&root(), &next()).unwrap();
        let original = reflog.get_table_ref(&root(), "users").unwrap();
        let copy = reflog.copy_table(&next(), "users", "members", "table_1").unwrap();

        let tables = reflog.table_mapping(&root(), &next(), true).unwrap();
        assert_eq!(tables.get(&original), Some(&BTreeSet::from([copy])));
        reflog.verify().unwrap();
    }

    #[test]
    fn test_rename_table_applies_to_all_versions() {
        let mut reflog = create_reflog();
        reflog.fork(&root(), &next()).unwrap();
        let ghost = reflog.ghost_table(&next(), "users", "table_1").unwrap();
        reflog.rename_table(ghost, "accounts").unwrap();

        assert_eq!(reflog.get_table_ref(&next(), "accounts").unwrap(), ghost);
        assert!(reflog.get_table_ref(&next(), "users").is_err());
        assert!(reflog.get_table_ref(&root(), "users").is_ok());

        let original = reflog.get_table_ref(&root(), "users").unwrap();
        let result = reflog.rename_table(original, "users");
        assert!(result.is_ok());
    }

    #[test]
    fn test_json_round_trip() {
        let mut reflog = create_reflog();
        reflog.fork(&root(), &next()).unwrap();
        reflog.ghost_table(&next(), "users", "table_1").unwrap();

        let json = serde_json::to_string(&reflog).unwrap();
        let restored: RefLog = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, reflog);
    }
}
