//! Application of schema operations to the catalog and RefLog.
//!
//! Every operation that changes the physical shape of a table ghosts it: a copy of
//! its definition is registered under a fresh ref id and the logical name is rebound
//! to the copy at the version being built. Tables referencing a ghosted table are
//! ghosted along with it, so the live tables of the source version keep their
//! foreign keys pointing at each other while the ghosts point at ghosts.

use super::plan::NewSequence;
use crate::catalog::{Catalog, ColumnDef, ColumnHint, ForeignKey, IndexDef, TableDef};
use crate::error::{Error, Result};
use crate::naming::{NameAllocator, SEQUENCE_PREFIX, TABLE_PREFIX};
use crate::reflog::{NewColumn, RefLog};
use crate::versioning::{SchemaOperation, VersionId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

/// Ghost tables and sequences created while building the versions of one migration.
#[derive(Debug, Default)]
pub(crate) struct Expansion {
    /// Ref ids of tables created by this expansion. These are modified in place.
    created: BTreeSet<String>,
    /// Old ref id to the ref id that replaced it.
    replaced: BTreeMap<String, String>,
    /// Sequences allocated for auto-increment columns of new tables.
    sequences: BTreeSet<String>,
}

impl Expansion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> &BTreeSet<String> {
        &self.created
    }

    /// Apply `operation` at `version`, which must already be forked from its parent.
    pub fn apply(
        &mut self,
        catalog: &mut Catalog,
        reflog: &mut RefLog,
        version: &VersionId,
        operation: &SchemaOperation,
        names: &mut dyn NameAllocator,
    ) -> Result<()> {
        debug!(version = %version, operation = %operation.kind(), "Applying schema operation");

        match operation {
            SchemaOperation::CreateTable { table, columns } => {
                self.create_table(catalog, reflog, version, table, columns, names)?;
            }
            SchemaOperation::DropTable { table } => {
                self.drop_table(catalog, reflog, version, table, names)?;
            }
            SchemaOperation::RenameTable { table, new_name } => {
                self.mirror(catalog, reflog, version, table, Some(new_name.as_str()), names)?;
            }
            SchemaOperation::CopyTable { source, target } => {
                let source_id = reflog
                    .table(reflog.get_table_ref(version, source)?)?
                    .ref_id()
                    .to_string();
                let ref_id = allocate_table_id(catalog, reflog, names);
                reflog.copy_table(version, source, target, &ref_id)?;
                let copy = catalog.table(&source_id)?.renamed(ref_id.clone());
                catalog.add_table(copy)?;
                self.created.insert(ref_id);
            }
            SchemaOperation::AddColumn { table, column } => {
                let ref_id = self.mirror(catalog, reflog, version, table, None, names)?;
                let key = reflog.get_table_ref(version, table)?;
                let mut column = column.clone();
                self.allocate_sequence(catalog, &mut column, names);
                if let Some(sequence) = &column.sequence {
                    catalog.add_sequence(sequence.clone());
                }
                let name = column.name.clone();
                catalog.table_mut(&ref_id)?.add_column(column)?;
                reflog.add_column(key, NewColumn::new(name))?;
            }
            SchemaOperation::DropColumn { table, column } => {
                let current = reflog.table(reflog.get_table_ref(version, table)?)?.ref_id().to_string();
                if catalog.table(&current)?.require_column(column)?.is_identity() {
                    return Err(Error::InvalidArgument(format!(
                        "cannot drop identity column {}.{}",
                        table, column
                    )));
                }

                let ref_id = self.mirror(catalog, reflog, version, table, None, names)?;
                let key = reflog.get_table_ref(version, table)?;
                catalog.table_mut(&ref_id)?.remove_column(column)?;
                reflog.drop_column(key, column)?;
                for referencing in self.created.clone() {
                    if let Ok(def) = catalog.table_mut(&referencing) {
                        def.foreign_keys.retain(|fk| {
                            fk.referred_table != ref_id || !fk.referred_columns.contains(column)
                        });
                    }
                }
            }
            SchemaOperation::AlterColumn {
                table,
                column,
                new_name,
                new_type,
                add_hints,
                drop_hints,
                new_default,
            } => {
                let ref_id = self.mirror(catalog, reflog, version, table, None, names)?;
                let key = reflog.get_table_ref(version, table)?;
                {
                    let definition = catalog.table_mut(&ref_id)?.column_mut(column)?;
                    if let Some(column_type) = new_type {
                        definition.column_type = column_type.clone();
                    }
                    for hint in add_hints {
                        definition.hints.insert(*hint);
                        if *hint == ColumnHint::Identity {
                            definition.hints.insert(ColumnHint::NotNull);
                        }
                    }
                    for hint in drop_hints {
                        definition.hints.remove(hint);
                    }
                    if let Some(default) = new_default {
                        definition.default_expression =
                            Some(default.clone()).filter(|d| !d.trim().is_empty());
                    }
                }

                if let Some(new_name) = new_name {
                    catalog.table_mut(&ref_id)?.rename_column(column, new_name)?;
                    reflog.rename_column(key, column, new_name)?;
                    for referencing in self.created.clone() {
                        let Ok(def) = catalog.table_mut(&referencing) else {
                            continue;
                        };
                        for fk in def.foreign_keys.iter_mut().filter(|fk| fk.referred_table == ref_id) {
                            for referred in fk.referred_columns.iter_mut() {
                                if *referred == *column {
                                    *referred = new_name.clone();
                                }
                            }
                        }
                    }
                }
            }
            SchemaOperation::AddForeignKey {
                table,
                name,
                columns,
                referred_table,
                referred_columns,
                on_update,
                on_delete,
            } => {
                let ref_id = self.mirror(catalog, reflog, version, table, None, names)?;
                let referred_id = reflog
                    .table(reflog.get_table_ref(version, referred_table)?)?
                    .ref_id()
                    .to_string();

                if columns.is_empty() || columns.len() != referred_columns.len() {
                    return Err(Error::InvalidArgument(format!(
                        "foreign key {} needs matching referencing and referred columns",
                        name
                    )));
                }
                for referred in referred_columns {
                    catalog.table(&referred_id)?.require_column(referred)?;
                }

                let def = catalog.table_mut(&ref_id)?;
                for column in columns {
                    def.require_column(column)?;
                }
                if def.foreign_keys.iter().any(|fk| fk.name == *name) {
                    return Err(Error::already_exists("foreign key", name.clone()));
                }
                def.foreign_keys.push(
                    ForeignKey::new(name.clone(), columns.clone(), referred_id, referred_columns.clone())
                        .with_on_update(*on_update)
                        .with_on_delete(*on_delete),
                );
            }
            SchemaOperation::DropForeignKey { table, name } => {
                let ref_id = self.mirror(catalog, reflog, version, table, None, names)?;
                let def = catalog.table_mut(&ref_id)?;
                let before = def.foreign_keys.len();
                def.foreign_keys.retain(|fk| fk.name != *name);
                if def.foreign_keys.len() == before {
                    return Err(Error::not_found("foreign key", name.clone()));
                }
            }
            SchemaOperation::CreateIndex {
                table,
                name,
                columns,
                unique,
            } => {
                let ref_id = self.mirror(catalog, reflog, version, table, None, names)?;
                let def = catalog.table_mut(&ref_id)?;
                for column in columns {
                    def.require_column(column)?;
                }
                if columns.is_empty() {
                    return Err(Error::InvalidArgument(format!("index {} has no columns", name)));
                }
                if def.indexes.iter().any(|index| index.name == *name) {
                    return Err(Error::already_exists("index", name.clone()));
                }
                def.indexes.push(if *unique {
                    IndexDef::unique(name.clone(), columns.clone())
                } else {
                    IndexDef::new(name.clone(), columns.clone())
                });
            }
            SchemaOperation::DropIndex { table, name } => {
                let ref_id = self.mirror(catalog, reflog, version, table, None, names)?;
                let def = catalog.table_mut(&ref_id)?;
                let before = def.indexes.len();
                def.indexes.retain(|index| index.name != *name);
                if def.indexes.len() == before {
                    return Err(Error::not_found("index", name.clone()));
                }
            }
        }

        self.rewire(catalog, reflog, version)
    }

    /// Ghost the table bound to `name` at `version` together with every table that
    /// transitively references it, then rebind the foreign keys of the ghosts. Tables
    /// created by this expansion are reused. Returns the ref id bound to the table
    /// afterwards; with `new_name` the table is bound under that name instead.
    pub fn mirror(
        &mut self,
        catalog: &mut Catalog,
        reflog: &mut RefLog,
        version: &VersionId,
        name: &str,
        new_name: Option<&str>,
        names: &mut dyn NameAllocator,
    ) -> Result<String> {
        let key = reflog.get_table_ref(version, name)?;
        let ref_id = reflog.table(key)?.ref_id().to_string();
        if self.created.contains(&ref_id) {
            if let Some(new_name) = new_name {
                reflog.rename_table(key, new_name)?;
            }
            return Ok(ref_id);
        }

        let mut ghost = None;
        let mut seen = BTreeSet::from([key]);
        let mut queue = VecDeque::from([key]);
        while let Some(current) = queue.pop_front() {
            let (current_name, current_id) = {
                let table = reflog.table(current)?;
                (table.name().to_string(), table.ref_id().to_string())
            };

            for referencing in catalog.tables_referencing(&current_id) {
                if self.created.contains(&referencing) {
                    continue;
                }
                let Ok(referencing_key) = reflog.get_table_ref_by_id(&referencing) else {
                    continue;
                };
                if reflog.table(referencing_key)?.is_present(version) && seen.insert(referencing_key) {
                    queue.push_back(referencing_key);
                }
            }

            let target_name = match new_name {
                Some(new_name) if current == key => new_name.to_string(),
                _ => current_name.clone(),
            };
            let new_id = allocate_table_id(catalog, reflog, names);
            reflog.replace_table(version, &current_name, &target_name, &new_id)?;
            let copy = catalog.table(&current_id)?.renamed(new_id.clone());
            catalog.add_table(copy)?;

            debug!(
                table = %current_name,
                source = %current_id,
                ghost = %new_id,
                version = %version,
                "Planned ghost table"
            );
            self.created.insert(new_id.clone());
            self.replaced.insert(current_id, new_id.clone());
            if current == key {
                ghost = Some(new_id);
            }
        }

        self.rewire(catalog, reflog, version)?;
        ghost.ok_or_else(|| Error::not_found("table ref", format!("{}@{}", name, version)))
    }

    fn create_table(
        &mut self,
        catalog: &mut Catalog,
        reflog: &mut RefLog,
        version: &VersionId,
        table: &str,
        columns: &[ColumnDef],
        names: &mut dyn NameAllocator,
    ) -> Result<()> {
        if columns.is_empty() {
            return Err(Error::InvalidArgument(format!("table {} has no columns", table)));
        }

        let ref_id = allocate_table_id(catalog, reflog, names);
        let mut columns = columns.to_vec();
        for column in &mut columns {
            self.allocate_sequence(catalog, column, names);
        }

        reflog.add_table(
            table,
            &ref_id,
            version,
            columns.iter().map(|c| NewColumn::new(c.name.clone())),
        )?;
        catalog.add_table(TableDef::new(ref_id.clone()).with_columns(columns))?;
        debug!(table = %table, ref_id = %ref_id, version = %version, "Planned new table");
        self.created.insert(ref_id);
        Ok(())
    }

    fn drop_table(
        &mut self,
        catalog: &mut Catalog,
        reflog: &mut RefLog,
        version: &VersionId,
        table: &str,
        names: &mut dyn NameAllocator,
    ) -> Result<()> {
        let key = reflog.get_table_ref(version, table)?;
        let ref_id = reflog.table(key)?.ref_id().to_string();

        for referencing in catalog.tables_referencing(&ref_id) {
            let Ok(referencing_key) = reflog.get_table_ref_by_id(&referencing) else {
                continue;
            };
            let referencing_ref = reflog.table(referencing_key)?;
            if referencing_ref.is_present(version) {
                let referencing_name = referencing_ref.name().to_string();
                self.mirror(catalog, reflog, version, &referencing_name, None, names)?;
            }
        }

        reflog.drop_table(version, table)?;
        if reflog.get_table_ref_by_id(&ref_id).is_err() && self.created.remove(&ref_id) {
            catalog.remove_table(&ref_id)?;
        }
        Ok(())
    }

    fn allocate_sequence(&mut self, catalog: &Catalog, column: &mut ColumnDef, names: &mut dyn NameAllocator) {
        if !column.is_auto_increment() || column.sequence.is_some() {
            return;
        }
        let taken = &self.sequences;
        let sequence = names.allocate(SEQUENCE_PREFIX, &|candidate| {
            taken.contains(candidate) || catalog.contains_sequence(candidate)
        });
        column.sequence = Some(sequence.clone());
        self.sequences.insert(sequence);
    }

    /// Point foreign keys of created tables at the table that replaced their referred
    /// table, dropping those whose referred table is gone from `version`.
    fn rewire(&self, catalog: &mut Catalog, reflog: &RefLog, version: &VersionId) -> Result<()> {
        for key in reflog.table_refs_at(version) {
            let ref_id = reflog.table(key)?.ref_id().to_string();
            if !self.created.contains(&ref_id) {
                continue;
            }

            let foreign_keys = std::mem::take(&mut catalog.table_mut(&ref_id)?.foreign_keys);
            let mut rewired = Vec::with_capacity(foreign_keys.len());
            for mut fk in foreign_keys {
                match self.resolve(reflog, &fk.referred_table, version) {
                    Some(target) => {
                        if target != fk.referred_table {
                            debug!(table = %ref_id, foreign_key = %fk.name, from = %fk.referred_table, to = %target, "Rewired foreign key");
                            fk.referred_table = target;
                        }
                        rewired.push(fk);
                    }
                    None => {
                        debug!(table = %ref_id, foreign_key = %fk.name, referred = %fk.referred_table, "Dropped dangling foreign key");
                    }
                }
            }
            catalog.table_mut(&ref_id)?.foreign_keys = rewired;
        }
        Ok(())
    }

    fn resolve(&self, reflog: &RefLog, ref_id: &str, version: &VersionId) -> Option<String> {
        let mut current = ref_id.to_string();
        let mut hops = 0;
        loop {
            if let Ok(key) = reflog.get_table_ref_by_id(&current) {
                if reflog.table(key).map(|t| t.is_present(version)).unwrap_or(false) {
                    return Some(current);
                }
            }
            current = self.replaced.get(&current)?.clone();
            hops += 1;
            if hops > self.replaced.len() {
                return None;
            }
        }
    }

    /// Drop created tables that did not survive to `to`, and list the sequences the
    /// surviving ones need.
    pub fn finish(&mut self, catalog: &mut Catalog, reflog: &mut RefLog, to: &VersionId) -> Result<Vec<NewSequence>> {
        for ref_id in self.created.clone() {
            let present = match reflog.get_table_ref_by_id(&ref_id) {
                Ok(key) => {
                    if reflog.table(key)?.is_present(to) {
                        true
                    } else {
                        reflog.drop_table_ref(key)?;
                        false
                    }
                }
                Err(_) => false,
            };
            if !present {
                debug!(ref_id = %ref_id, "Discarded table not present in the target version");
                if catalog.contains_table(&ref_id) {
                    catalog.remove_table(&ref_id)?;
                }
                self.created.remove(&ref_id);
            }
        }

        let mut new_sequences = Vec::new();
        for sequence in &self.sequences {
            let owner = self.created.iter().find_map(|ref_id| {
                catalog.table(ref_id).ok().and_then(|table| {
                    table
                        .columns
                        .iter()
                        .find(|c| c.sequence.as_deref() == Some(sequence.as_str()))
                        .map(|c| (ref_id.clone(), c.name.clone()))
                })
            });
            match owner {
                Some((table, column)) => new_sequences.push(NewSequence {
                    name: sequence.clone(),
                    table,
                    column,
                }),
                None => {
                    catalog.remove_sequence(sequence);
                }
            }
        }
        Ok(new_sequences)
    }
}

fn allocate_table_id(catalog: &Catalog, reflog: &RefLog, names: &mut dyn NameAllocator) -> String {
    let taken = reflog.ref_ids();
    names.allocate(TABLE_PREFIX, &|candidate| {
        taken.contains(candidate) || catalog.contains_table(candidate)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnType;
    use crate::naming::SequentialNameAllocator;

    fn root() -> VersionId {
        VersionId::from("v0")
    }

    fn next() -> VersionId {
        VersionId::from("v1")
    }

    fn create_catalog() -> Catalog {
        let customers = TableDef::new("customers")
            .with_column(
                ColumnDef::new("id", ColumnType::BigInt)
                    .identity()
                    .with_sequence("customers_id_seq"),
            )
            .with_column(ColumnDef::new("name", ColumnType::Text).not_null());
        let orders = TableDef::new("orders")
            .with_column(ColumnDef::new("id", ColumnType::BigInt).identity())
            .with_column(ColumnDef::new("customer_id", ColumnType::BigInt).not_null())
            .with_foreign_key(ForeignKey::new("orders_customer_fk", ["customer_id"], "customers", ["id"]));
        let products = TableDef::new("products")
            .with_column(ColumnDef::new("sku", ColumnType::Text).identity());
        Catalog::new("shop")
            .with_table(customers)
            .unwrap()
            .with_table(orders)
            .unwrap()
            .with_table(products)
            .unwrap()
    }

    fn setup() -> (Catalog, RefLog, SequentialNameAllocator) {
        let catalog = create_catalog();
        let mut reflog = RefLog::init(&catalog, &root()).unwrap();
        reflog.fork(&root(), &next()).unwrap();
        (catalog, reflog, SequentialNameAllocator::new())
    }

    fn ref_id(reflog: &RefLog, version: &VersionId, name: &str) -> String {
        let key = reflog.get_table_ref(version, name).unwrap();
        reflog.table(key).unwrap().ref_id().to_string()
    }

    #[test]
    fn test_add_column_mirrors_referencing_tables() {
        let (mut catalog, mut reflog, mut names) = setup();
        let mut expansion = Expansion::new();
        let operation = SchemaOperation::AddColumn {
            table: "customers".to_string(),
            column: ColumnDef::new("date_of_birth", ColumnType::Date),
        };
        expansion
            .apply(&mut catalog, &mut reflog, &next(), &operation, &mut names)
            .unwrap();

        let customers = ref_id(&reflog, &next(), "customers");
        let orders = ref_id(&reflog, &next(), "orders");
        assert_ne!(customers, "customers");
        assert_ne!(orders, "orders");
        assert_eq!(ref_id(&reflog, &next(), "products"), "products");
        assert_eq!(expansion.created().len(), 2);

        assert!(catalog.table(&customers).unwrap().has_column("date_of_birth"));
        assert!(!catalog.table("customers").unwrap().has_column("date_of_birth"));
        assert_eq!(catalog.table(&orders).unwrap().foreign_keys[0].referred_table, customers);
        assert_eq!(catalog.table("orders").unwrap().foreign_keys[0].referred_table, "customers");
        reflog.verify().unwrap();
    }

    #[test]
    fn test_second_operation_reuses_ghost() {
        let (mut catalog, mut reflog, mut names) = setup();
        let mut expansion = Expansion::new();
        let add = SchemaOperation::AddColumn {
            table: "products".to_string(),
            column: ColumnDef::new("price", ColumnType::Numeric),
        };
        let index = SchemaOperation::CreateIndex {
            table: "products".to_string(),
            name: "price_idx".to_string(),
            columns: vec!["price".to_string()],
            unique: false,
        };
        expansion.apply(&mut catalog, &mut reflog, &next(), &add, &mut names).unwrap();
        let ghost = ref_id(&reflog, &next(), "products");
        expansion.apply(&mut catalog, &mut reflog, &next(), &index, &mut names).unwrap();

        assert_eq!(ref_id(&reflog, &next(), "products"), ghost);
        assert_eq!(catalog.table(&ghost).unwrap().indexes.len(), 1);
        assert_eq!(expansion.created().len(), 1);
    }

    #[test]
    fn test_rename_table_rebinds_name() {
        let (mut catalog, mut reflog, mut names) = setup();
        let mut expansion = Expansion::new();
        let operation = SchemaOperation::RenameTable {
            table: "customers".to_string(),
            new_name: "clients".to_string(),
        };
        expansion
            .apply(&mut catalog, &mut reflog, &next(), &operation, &mut names)
            .unwrap();

        assert!(reflog.get_table_ref(&next(), "customers").is_err());
        let clients = ref_id(&reflog, &next(), "clients");
        assert_eq!(ref_id(&reflog, &root(), "customers"), "customers");
        let orders = ref_id(&reflog, &next(), "orders");
        assert_eq!(catalog.table(&orders).unwrap().foreign_keys[0].referred_table, clients);
    }

    #[test]
    fn test_drop_table_removes_dangling_foreign_keys() {
        let (mut catalog, mut reflog, mut names) = setup();
        let mut expansion = Expansion::new();
        let operation = SchemaOperation::DropTable {
            table: "customers".to_string(),
        };
        expansion
            .apply(&mut catalog, &mut reflog, &next(), &operation, &mut names)
            .unwrap();

        assert!(reflog.get_table_ref(&next(), "customers").is_err());
        let orders = ref_id(&reflog, &next(), "orders");
        assert!(catalog.table(&orders).unwrap().foreign_keys.is_empty());
        assert_eq!(catalog.table("orders").unwrap().foreign_keys.len(), 1);
    }

    #[test]
    fn test_create_table_allocates_sequence() {
        let (mut catalog, mut reflog, mut names) = setup();
        let mut expansion = Expansion::new();
        let operation = SchemaOperation::CreateTable {
            table: "invoices".to_string(),
            columns: vec![
                ColumnDef::new("id", ColumnType::BigInt).identity().auto_increment(),
                ColumnDef::new("total", ColumnType::Numeric),
            ],
        };
        expansion
            .apply(&mut catalog, &mut reflog, &next(), &operation, &mut names)
            .unwrap();
        let sequences = expansion.finish(&mut catalog, &mut reflog, &next()).unwrap();

        let invoices = ref_id(&reflog, &next(), "invoices");
        assert_eq!(sequences.len(), 1);
        assert_eq!(sequences[0].table, invoices);
        assert_eq!(sequences[0].column, "id");
        assert!(sequences[0].name.starts_with(SEQUENCE_PREFIX));
        assert!(catalog.contains_sequence(&sequences[0].name));
    }

    #[test]
    fn test_rename_column_updates_referencing_ghosts() {
        let (mut catalog, mut reflog, mut names) = setup();
        let mut expansion = Expansion::new();
        let operation = SchemaOperation::AlterColumn {
            table: "customers".to_string(),
            column: "id".to_string(),
            new_name: Some("customer_id".to_string()),
            new_type: None,
            add_hints: vec![],
            drop_hints: vec![],
            new_default: None,
        };
        expansion
            .apply(&mut catalog, &mut reflog, &next(), &operation, &mut names)
            .unwrap();

        let customers = ref_id(&reflog, &next(), "customers");
        let orders = ref_id(&reflog, &next(), "orders");
        assert!(catalog.table(&customers).unwrap().has_column("customer_id"));
        assert_eq!(
            catalog.table(&orders).unwrap().foreign_keys[0].referred_columns,
            vec!["customer_id".to_string()]
        );

        let old = reflog.get_table_ref(&root(), "customers").unwrap();
        let new = reflog.get_table_ref(&next(), "customers").unwrap();
        let mapping = reflog.column_mapping(old, new).unwrap();
        let id = reflog.column_named(old, "id").unwrap();
        let renamed = reflog.column_named(new, "customer_id").unwrap();
        assert_eq!(mapping.get(&id), Some(&renamed));
    }

    #[test]
    fn test_drop_identity_column_rejected() {
        let (mut catalog, mut reflog, mut names) = setup();
        let mut expansion = Expansion::new();
        let operation = SchemaOperation::DropColumn {
            table: "customers".to_string(),
            column: "id".to_string(),
        };
        let result = expansion.apply(&mut catalog, &mut reflog, &next(), &operation, &mut names);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
