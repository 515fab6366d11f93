//! Trigger functions replicating writes from one version of a table into another.
//!
//! A sync function is installed on the source table and mirrors every INSERT, UPDATE
//! and DELETE into the target table for a growing set of target columns. Triggers only
//! fire for writes made directly by clients (`pg_trigger_depth() = 0`), so a forward
//! and a backward sync on the same pair of tables never feed each other.

use super::error::MigrationError;
use super::null_records::NullRecords;
use crate::catalog::TableDef;
use crate::error::Error;
use crate::reflog::{ColumnKey, RefLog};
use crate::sql::{ddl, literal, quoted, quoted_list};
use std::collections::{BTreeMap, BTreeSet};

/// Resolve a RefLog column mapping into `(source column, target column)` names.
pub fn column_names(
    reflog: &RefLog,
    mapping: &BTreeMap<ColumnKey, ColumnKey>,
) -> Result<Vec<(String, String)>, MigrationError> {
    let mut names = Vec::with_capacity(mapping.len());
    for (from, to) in mapping {
        names.push((
            reflog.column(*from)?.name().to_string(),
            reflog.column(*to)?.name().to_string(),
        ));
    }
    Ok(names)
}

/// Expressions a sync function writes with. Every entry is a `(target column, SQL
/// expression)` pair, in target table column order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncExpressions {
    /// Values written into the target row.
    pub values: Vec<(String, String)>,
    /// Target identity columns matched against the new source row.
    pub new_identity: Vec<(String, String)>,
    /// Target identity columns matched against the old source row.
    pub old_identity: Vec<(String, String)>,
}

impl SyncExpressions {
    /// Compute the expressions for syncing `columns` of `target`. Identity columns are
    /// always synced. NOT NULL foreign keys of the target that the synced columns do
    /// not fill point at the referred table's null record, or fall back to the
    /// column default.
    pub fn compute(
        source: &TableDef,
        target: &TableDef,
        mapping: &[(String, String)],
        columns: &BTreeSet<String>,
        null_records: &NullRecords,
    ) -> Result<Self, MigrationError> {
        let synced: BTreeMap<&str, &str> = mapping
            .iter()
            .filter(|(from, to)| {
                columns.contains(to)
                    || source.column(from).map(|c| c.is_identity()).unwrap_or(false)
                    || target.column(to).map(|c| c.is_identity()).unwrap_or(false)
            })
            .map(|(from, to)| (to.as_str(), from.as_str()))
            .collect();

        let mut values = Vec::new();
        for column in &target.columns {
            if let Some(from) = synced.get(column.name.as_str()) {
                values.push((column.name.clone(), format!("NEW.{}", quoted(from))));
            }
        }

        for fk in target.not_nullable_foreign_keys() {
            if fk.referencing_columns.iter().all(|c| synced.contains_key(c.as_str())) {
                continue;
            }
            let identity = null_records.identity(&fk.referred_table);
            for (column_name, referred_column) in fk.column_pairs() {
                if values.iter().any(|(name, _)| name == column_name) {
                    continue;
                }
                let column = target.require_column(column_name)?;
                let value = match identity.and_then(|i| i.get(referred_column)) {
                    Some(value) => literal(value, &column.column_type),
                    None => column.default_or_null(),
                };
                values.push((column_name.to_string(), value));
            }
        }

        let mut new_identity = Vec::new();
        let mut old_identity = Vec::new();
        for column in target.identity_columns() {
            let from = synced.get(column.name.as_str()).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "identity column {}.{} has no counterpart in {}",
                    target.name, column.name, source.name
                ))
            })?;
            new_identity.push((column.name.clone(), format!("NEW.{}", quoted(from))));
            old_identity.push((column.name.clone(), format!("OLD.{}", quoted(from))));
        }
        if new_identity.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "table {} has no identity columns to sync by",
                target.name
            ))
            .into());
        }

        Ok(Self {
            values,
            new_identity,
            old_identity,
        })
    }

    fn target_columns(&self) -> Vec<&str> {
        self.values.iter().map(|(c, _)| c.as_str()).collect()
    }

    fn value_list(&self) -> String {
        self.values
            .iter()
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn assignments(&self) -> String {
        self.values
            .iter()
            .map(|(c, v)| format!("{} = {}", quoted(c), v))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn conditions(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(c, v)| format!("{} = {}", quoted(c), v))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn row_of(pairs: &[(String, String)]) -> String {
    let values: Vec<&str> = pairs.iter().map(|(_, v)| v.as_str()).collect();
    format!("ROW({})", values.join(", "))
}

/// A sync trigger and its function, replicating `source` into `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFunction {
    /// Physical source table.
    pub source: String,
    /// Physical target table.
    pub target: String,
    /// Trigger function name.
    pub function_name: String,
    /// Trigger name.
    pub trigger_name: String,
    mapping: Vec<(String, String)>,
    expressions: SyncExpressions,
}

impl SyncFunction {
    /// A sync for `mapping`, syncing only identity columns until
    /// [`SyncFunction::set_columns_to_migrate`] widens it.
    pub fn new(
        source: &TableDef,
        target: &TableDef,
        mapping: Vec<(String, String)>,
        function_name: impl Into<String>,
        trigger_name: impl Into<String>,
        null_records: &NullRecords,
    ) -> Result<Self, MigrationError> {
        let expressions =
            SyncExpressions::compute(source, target, &mapping, &BTreeSet::new(), null_records)?;
        Ok(Self {
            source: source.name.clone(),
            target: target.name.clone(),
            function_name: function_name.into(),
            trigger_name: trigger_name.into(),
            mapping,
            expressions,
        })
    }

    /// Replace the synced column set. Nothing from previous calls is kept.
    pub fn set_columns_to_migrate(
        &mut self,
        source: &TableDef,
        target: &TableDef,
        columns: &BTreeSet<String>,
        null_records: &NullRecords,
    ) -> Result<(), MigrationError> {
        self.expressions =
            SyncExpressions::compute(source, target, &self.mapping, columns, null_records)?;
        Ok(())
    }

    pub fn expressions(&self) -> &SyncExpressions {
        &self.expressions
    }

    pub fn mapping(&self) -> &[(String, String)] {
        &self.mapping
    }

    /// `CREATE OR REPLACE FUNCTION` for the trigger function. With `use_upsert` the
    /// row is written with `INSERT ... ON CONFLICT` on the identity columns; otherwise
    /// an UPDATE is attempted first and the INSERT treats `unique_violation` as a
    /// concurrent writer having inserted the row already.
    pub fn create_function_statement(&self, use_upsert: bool) -> String {
        let e = &self.expressions;
        let target = quoted(&self.target);
        let identity: Vec<&str> = e.new_identity.iter().map(|(c, _)| c.as_str()).collect();
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            target,
            quoted_list(&e.target_columns()),
            e.value_list()
        );
        let update = format!(
            "UPDATE {} SET {} WHERE {};",
            target,
            e.assignments(),
            conditions(&e.new_identity)
        );

        let mut lines = vec![
            format!("CREATE OR REPLACE FUNCTION {}()", quoted(&self.function_name)),
            "RETURNS TRIGGER AS $$".to_string(),
            "BEGIN".to_string(),
            "  IF TG_OP = 'INSERT' OR TG_OP = 'UPDATE' THEN".to_string(),
            format!(
                "    IF TG_OP = 'UPDATE' AND {} IS DISTINCT FROM {} THEN",
                row_of(&e.old_identity),
                row_of(&e.new_identity)
            ),
            format!("      DELETE FROM {} WHERE {};", target, conditions(&e.old_identity)),
            "    END IF;".to_string(),
        ];

        if use_upsert {
            let updates: Vec<String> = e
                .values
                .iter()
                .filter(|(c, _)| !identity.contains(&c.as_str()))
                .map(|(c, _)| format!("{} = EXCLUDED.{}", quoted(c), quoted(c)))
                .collect();
            lines.push(format!("    {}", insert));
            if updates.is_empty() {
                lines.push(format!("      ON CONFLICT ({}) DO NOTHING;", quoted_list(&identity)));
            } else {
                lines.push(format!(
                    "      ON CONFLICT ({}) DO UPDATE SET {};",
                    quoted_list(&identity),
                    updates.join(", ")
                ));
            }
        } else {
            lines.push(format!("    {}", update));
            lines.push("    IF NOT found THEN".to_string());
            lines.push("      BEGIN".to_string());
            lines.push(format!("        {};", insert));
            lines.push("      EXCEPTION WHEN unique_violation THEN".to_string());
            lines.push(format!("        {}", update));
            lines.push("      END;".to_string());
            lines.push("    END IF;".to_string());
        }

        lines.push("  ELSIF TG_OP = 'DELETE' THEN".to_string());
        lines.push(format!("    DELETE FROM {} WHERE {};", target, conditions(&e.old_identity)));
        lines.push("  END IF;".to_string());
        lines.push("  RETURN NEW;".to_string());
        lines.push("END;".to_string());
        lines.push("$$ LANGUAGE plpgsql;".to_string());
        lines.join("\n")
    }

    /// `CREATE TRIGGER` firing the function after every row change on the source.
    pub fn create_trigger_statement(&self) -> String {
        [
            format!("CREATE TRIGGER {}", quoted(&self.trigger_name)),
            "AFTER INSERT OR UPDATE OR DELETE".to_string(),
            format!("ON {}", quoted(&self.source)),
            "FOR EACH ROW".to_string(),
            "WHEN (pg_trigger_depth() = 0)".to_string(),
            format!("EXECUTE PROCEDURE {}();", quoted(&self.function_name)),
        ]
        .join("\n")
    }

    /// Statements removing the trigger and then its function.
    pub fn drop_statements(&self) -> [String; 2] {
        drop_statements(&self.trigger_name, &self.function_name, &self.source)
    }
}

/// Statements removing a sync trigger and its function.
pub fn drop_statements(trigger_name: &str, function_name: &str, source: &str) -> [String; 2] {
    [
        ddl::drop_trigger(trigger_name, source),
        ddl::drop_function(function_name, &[]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, ColumnType, ForeignKey};
    use crate::migration::null_records::Identity;

    fn source() -> TableDef {
        TableDef::new("orders")
            .with_column(ColumnDef::new("id", ColumnType::BigInt).identity())
            .with_column(ColumnDef::new("customer_id", ColumnType::BigInt).not_null())
            .with_column(ColumnDef::new("note", ColumnType::Text))
    }

    fn target() -> TableDef {
        TableDef::new("table_o")
            .with_column(ColumnDef::new("id", ColumnType::BigInt).identity())
            .with_column(ColumnDef::new("customer_id", ColumnType::BigInt).not_null())
            .with_column(ColumnDef::new("remark", ColumnType::Text))
            .with_foreign_key(ForeignKey::new("customer_fk", ["customer_id"], "table_c", ["id"]))
    }

    fn mapping() -> Vec<(String, String)> {
        vec![
            ("id".to_string(), "id".to_string()),
            ("customer_id".to_string(), "customer_id".to_string()),
            ("note".to_string(), "remark".to_string()),
        ]
    }

    fn columns(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn create_sync() -> SyncFunction {
        SyncFunction::new(&source(), &target(), mapping(), "sync_1", "trig_1", &NullRecords::new()).unwrap()
    }

    #[test]
    fn test_identity_always_synced() {
        let sync = create_sync();
        let e = sync.expressions();
        assert_eq!(e.values[0], ("id".to_string(), "NEW.\"id\"".to_string()));
        assert_eq!(e.new_identity, vec![("id".to_string(), "NEW.\"id\"".to_string())]);
        assert_eq!(e.old_identity, vec![("id".to_string(), "OLD.\"id\"".to_string())]);
    }

    #[test]
    fn test_unfilled_foreign_key_falls_back_to_default() {
        let sync = create_sync();
        assert!(sync
            .expressions()
            .values
            .contains(&("customer_id".to_string(), "NULL".to_string())));
    }

    #[test]
    fn test_unfilled_foreign_key_uses_null_record() {
        let mut null_records = NullRecords::new();
        null_records.insert_identity("table_c", Identity::new().with("id", "7"));
        let mut sync = create_sync();
        sync.set_columns_to_migrate(&source(), &target(), &columns(&["remark"]), &null_records)
            .unwrap();

        let values = &sync.expressions().values;
        assert!(values.contains(&("customer_id".to_string(), "7".to_string())));
        assert!(values.contains(&("remark".to_string(), "NEW.\"note\"".to_string())));
    }

    #[test]
    fn test_set_columns_replaces_previous_state() {
        let mut sync = create_sync();
        let nulls = NullRecords::new();
        sync.set_columns_to_migrate(&source(), &target(), &columns(&["id", "customer_id", "remark"]), &nulls)
            .unwrap();
        assert_eq!(sync.expressions().values.len(), 3);

        sync.set_columns_to_migrate(&source(), &target(), &columns(&["remark"]), &nulls)
            .unwrap();
        let values = &sync.expressions().values;
        assert!(values.contains(&("customer_id".to_string(), "NULL".to_string())));
        assert!(!values.contains(&("customer_id".to_string(), "NEW.\"customer_id\"".to_string())));
    }

    #[test]
    fn test_upsert_function() {
        let mut sync = create_sync();
        sync.set_columns_to_migrate(
            &source(),
            &target(),
            &columns(&["id", "customer_id", "remark"]),
            &NullRecords::new(),
        )
        .unwrap();

        let sql = sync.create_function_statement(true);
        assert!(sql.starts_with("CREATE OR REPLACE FUNCTION \"sync_1\"()"));
        assert!(sql.contains(
            "INSERT INTO \"table_o\" (\"id\", \"customer_id\", \"remark\") VALUES (NEW.\"id\", NEW.\"customer_id\", NEW.\"note\")"
        ));
        assert!(sql.contains(
            "ON CONFLICT (\"id\") DO UPDATE SET \"customer_id\" = EXCLUDED.\"customer_id\", \"remark\" = EXCLUDED.\"remark\";"
        ));
        assert!(sql.contains("IF TG_OP = 'UPDATE' AND ROW(OLD.\"id\") IS DISTINCT FROM ROW(NEW.\"id\") THEN"));
        assert!(sql.contains("DELETE FROM \"table_o\" WHERE \"id\" = OLD.\"id\";"));
        assert!(sql.ends_with("$$ LANGUAGE plpgsql;"));
    }

    #[test]
    fn test_update_then_insert_function() {
        let sync = create_sync();
        let sql = sync.create_function_statement(false);
        assert!(sql.contains("UPDATE \"table_o\" SET \"id\" = NEW.\"id\", \"customer_id\" = NULL WHERE \"id\" = NEW.\"id\";"));
        assert!(sql.contains("EXCEPTION WHEN unique_violation THEN"));
        assert!(!sql.contains("ON CONFLICT"));
    }

    #[test]
    fn test_trigger_guarded_by_depth() {
        let sync = create_sync();
        let sql = sync.create_trigger_statement();
        assert!(sql.contains("ON \"orders\""));
        assert!(sql.contains("WHEN (pg_trigger_depth() = 0)"));
        assert!(sql.ends_with("EXECUTE PROCEDURE \"sync_1\"();"));
        assert_eq!(
            sync.drop_statements(),
            [
                "DROP TRIGGER \"trig_1\" ON \"orders\";".to_string(),
                "DROP FUNCTION \"sync_1\"();".to_string(),
            ]
        );
    }

    #[test]
    fn test_unmapped_identity_rejected() {
        let mapping = vec![("note".to_string(), "remark".to_string())];
        let result = SyncFunction::new(&source(), &target(), mapping, "sync_1", "trig_1", &NullRecords::new());
        assert!(result.is_err());
    }
}
