//! Schema introspection into a [`Catalog`].

use crate::error::{Error, Result};
use ghostshift_core::{
    Catalog, ColumnDef, ColumnType, ForeignKey, ForeignKeyAction, IndexDef, Row, SqlExecutor,
    TableDef,
};
use std::collections::BTreeMap;
use tracing::debug;

const TABLES_QUERY: &str = "SELECT table_name FROM information_schema.tables \
     WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' \
     ORDER BY table_name;";

const COLUMNS_QUERY: &str = "SELECT table_name, column_name, data_type, character_maximum_length, \
     is_nullable, column_default FROM information_schema.columns \
     WHERE table_schema = current_schema() \
     ORDER BY table_name, ordinal_position;";

const PRIMARY_KEYS_QUERY: &str = "SELECT tc.table_name, kcu.column_name \
     FROM information_schema.table_constraints tc \
     JOIN information_schema.key_column_usage kcu \
       ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
     WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = current_schema() \
     ORDER BY tc.table_name, kcu.ordinal_position;";

const FOREIGN_KEYS_QUERY: &str = "SELECT c.conname, cl.relname, ref.relname, a.attname, ra.attname, \
       c.confupdtype, c.confdeltype \
     FROM pg_constraint c \
     JOIN pg_class cl ON cl.oid = c.conrelid \
     JOIN pg_class ref ON ref.oid = c.confrelid \
     JOIN pg_namespace n ON n.oid = cl.relnamespace \
     CROSS JOIN LATERAL unnest(c.conkey, c.confkey) WITH ORDINALITY AS k(attnum, refnum, ord) \
     JOIN pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = k.attnum \
     JOIN pg_attribute ra ON ra.attrelid = c.confrelid AND ra.attnum = k.refnum \
     WHERE c.contype = 'f' AND n.nspname = current_schema() \
     ORDER BY cl.relname, c.conname, k.ord;";

const INDEXES_QUERY: &str = "SELECT t.relname, i.relname, ix.indisunique, a.attname \
     FROM pg_index ix \
     JOIN pg_class t ON t.oid = ix.indrelid \
     JOIN pg_class i ON i.oid = ix.indexrelid \
     JOIN pg_namespace n ON n.oid = t.relnamespace \
     CROSS JOIN LATERAL unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ord) \
     JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum \
     WHERE n.nspname = current_schema() AND NOT ix.indisprimary \
     ORDER BY t.relname, i.relname, k.ord;";

const SEQUENCES_QUERY: &str = "SELECT sequence_name FROM information_schema.sequences \
     WHERE sequence_schema = current_schema() ORDER BY sequence_name;";

/// Read the tables, columns, keys, indexes and sequences of the current schema.
pub fn load_catalog(executor: &mut dyn SqlExecutor, name: &str) -> Result<Catalog> {
    let mut tables: BTreeMap<String, TableDef> = BTreeMap::new();
    for row in executor.query(TABLES_QUERY)? {
        let table = required(&row, 0, "table_name")?;
        tables.insert(table.to_string(), TableDef::new(table));
    }

    for row in executor.query(COLUMNS_QUERY)? {
        let Some(table) = tables.get_mut(required(&row, 0, "table_name")?) else {
            continue;
        };
        table.columns.push(column_from_row(&row)?);
    }

    for row in executor.query(PRIMARY_KEYS_QUERY)? {
        let table_name = required(&row, 0, "table_name")?;
        let column_name = required(&row, 1, "column_name")?;
        if let Some(table) = tables.get_mut(table_name) {
            let column = table.column_mut(column_name)?;
            *column = column.clone().identity();
        }
    }

    for (table, foreign_key) in group_foreign_keys(executor.query(FOREIGN_KEYS_QUERY)?)? {
        if let Some(table) = tables.get_mut(&table) {
            table.foreign_keys.push(foreign_key);
        }
    }

    for (table, index) in group_indexes(executor.query(INDEXES_QUERY)?)? {
        if let Some(table) = tables.get_mut(&table) {
            table.indexes.push(index);
        }
    }

    let mut catalog = Catalog::new(name);
    for row in executor.query(SEQUENCES_QUERY)? {
        catalog.add_sequence(required(&row, 0, "sequence_name")?);
    }
    for table in tables.into_values() {
        debug!(table = %table.name, columns = table.columns.len(), "Introspected table");
        catalog.add_table(table)?;
    }
    Ok(catalog)
}

fn required<'r>(row: &'r Row, index: usize, column: &str) -> Result<&'r str> {
    row.get(index)
        .ok_or_else(|| Error::Introspection(format!("missing value for {}", column)))
}

fn column_from_row(row: &Row) -> Result<ColumnDef> {
    let name = required(row, 1, "column_name")?;
    let data_type = required(row, 2, "data_type")?;
    let max_length = row.get(3).and_then(|l| l.parse::<u32>().ok());
    let column_type = ColumnType::from_sql(data_type, max_length).ok_or_else(|| {
        Error::Introspection(format!("unsupported type {} of column {}", data_type, name))
    })?;

    let mut column = ColumnDef::new(name, column_type);
    if row.get(4) == Some("NO") {
        column = column.not_null();
    }
    if let Some(default) = row.get(5) {
        column = match sequence_of(default) {
            Some(sequence) => column.with_sequence(sequence),
            None => column.with_default(default),
        };
    }
    Ok(column)
}

/// Sequence name in a `nextval('name'::regclass)` default.
fn sequence_of(default: &str) -> Option<String> {
    let inner = default.trim().strip_prefix("nextval('")?;
    let end = inner.find('\'')?;
    let name = &inner[..end];
    Some(name.trim_matches('"').to_string())
}

fn group_foreign_keys(rows: Vec<Row>) -> Result<Vec<(String, ForeignKey)>> {
    let mut grouped: Vec<(String, ForeignKey)> = Vec::new();
    for row in rows {
        let name = required(&row, 0, "conname")?;
        let table = required(&row, 1, "relname")?;
        let referred_table = required(&row, 2, "referred relname")?;
        let column = required(&row, 3, "attname")?;
        let referred_column = required(&row, 4, "referred attname")?;

        match grouped.last_mut() {
            Some((owner, fk)) if owner == table && fk.name == name => {
                fk.referencing_columns.push(column.to_string());
                fk.referred_columns.push(referred_column.to_string());
            }
            _ => {
                let fk = ForeignKey::new(name, [column], referred_table, [referred_column])
                    .with_on_update(ForeignKeyAction::from_pg_code(row.get(5).unwrap_or("a")))
                    .with_on_delete(ForeignKeyAction::from_pg_code(row.get(6).unwrap_or("a")));
                grouped.push((table.to_string(), fk));
            }
        }
    }
    Ok(grouped)
}

fn group_indexes(rows: Vec<Row>) -> Result<Vec<(String, IndexDef)>> {
    let mut grouped: Vec<(String, IndexDef)> = Vec::new();
    for row in rows {
        let table = required(&row, 0, "relname")?;
        let name = required(&row, 1, "index relname")?;
        let column = required(&row, 3, "attname")?;

        match grouped.last_mut() {
            Some((owner, index)) if owner == table && index.name == name => {
                index.columns.push(column.to_string());
            }
            _ => {
                let index = if matches!(row.get(2), Some("t") | Some("true")) {
                    IndexDef::unique(name, [column])
                } else {
                    IndexDef::new(name, [column])
                };
                grouped.push((table.to_string(), index));
            }
        }
    }
    Ok(grouped)
}
