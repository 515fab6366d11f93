//! DDL statements for ghost tables and their cleanup.

use super::{quoted, quoted_list, string_literal};
use crate::catalog::{ColumnDef, ForeignKey, IndexDef, TableDef};

/// `CREATE SEQUENCE`.
pub fn create_sequence(sequence: &str) -> String {
    format!("CREATE SEQUENCE {};", quoted(sequence))
}

/// Bind a sequence to the column it serves, so it is dropped along with it.
pub fn own_sequence(sequence: &str, table: &str, column: &str) -> String {
    format!(
        "ALTER SEQUENCE {} OWNED BY {}.{};",
        quoted(sequence),
        quoted(table),
        quoted(column)
    )
}

fn column_definition(column: &ColumnDef) -> String {
    let mut definition = format!("{} {}", quoted(&column.name), column.column_type.sql());
    if column.is_not_null() {
        definition.push_str(" NOT NULL");
    }
    let default = column
        .default_expression
        .as_ref()
        .filter(|expr| !expr.trim().is_empty())
        .cloned()
        .or_else(|| {
            column
                .sequence
                .as_ref()
                .map(|sequence| format!("nextval({})", string_literal(sequence)))
        });
    if let Some(default) = default {
        definition.push_str(" DEFAULT ");
        definition.push_str(&default);
    }
    definition
}

/// `CREATE TABLE` with columns and primary key. Foreign keys and indexes are
/// created separately.
pub fn create_table(table: &TableDef) -> String {
    let mut parts: Vec<String> = table.columns.iter().map(column_definition).collect();
    let identity = table.identity_column_names();
    if !identity.is_empty() {
        parts.push(format!("PRIMARY KEY ({})", quoted_list(&identity)));
    }
    format!("CREATE TABLE {} ({});", quoted(&table.name), parts.join(", "))
}

/// Add a foreign key as a deferrable constraint.
pub fn add_foreign_key(table: &str, foreign_key: &ForeignKey) -> String {
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON UPDATE {} ON DELETE {} DEFERRABLE;",
        quoted(table),
        quoted(&foreign_key.name),
        quoted_list(&foreign_key.referencing_columns),
        quoted(&foreign_key.referred_table),
        quoted_list(&foreign_key.referred_columns),
        foreign_key.on_update,
        foreign_key.on_delete,
    )
}

/// Index names are schema-wide, so the physical name is prefixed with the table's.
pub fn create_index(table: &str, index: &IndexDef) -> String {
    format!(
        "CREATE {}INDEX {} ON {} ({});",
        if index.unique { "UNIQUE " } else { "" },
        quoted(&format!("{}_{}", table, index.name)),
        quoted(table),
        quoted_list(&index.columns)
    )
}

pub fn drop_table(table: &str) -> String {
    format!("DROP TABLE {} CASCADE;", quoted(table))
}

pub fn drop_trigger(trigger: &str, table: &str) -> String {
    format!("DROP TRIGGER {} ON {};", quoted(trigger), quoted(table))
}

/// `DROP FUNCTION` with its argument type signature.
pub fn drop_function(function: &str, argument_types: &[String]) -> String {
    format!("DROP FUNCTION {}({});", quoted(function), argument_types.join(", "))
}
