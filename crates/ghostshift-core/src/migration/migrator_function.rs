//! Generated PL/pgSQL functions copying one batch of rows per call.
//!
//! The `Initial` function starts at the lowest identity. The `Consecutive` function
//! takes the previous batch's cursor as parameters and resumes strictly after it.
//! Both return the text form of the last identity they processed, or NULL when the
//! batch was empty.

use super::error::MigrationError;
use super::null_records::NullRecords;
use super::Cursor;
use crate::catalog::{ColumnType, TableDef, ValueKind};
use crate::error::Error;
use crate::sql::{ddl, literal, quoted, quoted_list};
use std::collections::BTreeSet;

/// Which part of the table a migrator function covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// First batch, from the start of the table.
    Initial,
    /// Every later batch, after a given cursor.
    Consecutive,
}

/// A generated migrator function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratorFunction {
    pub name: String,
    pub stage: Stage,
    /// Cursor parameters, `q0..qn`, one per source identity column.
    pub parameters: Vec<(String, ColumnType)>,
    pub create_statement: String,
    pub drop_statement: String,
}

/// What a batch writes into the target table.
enum Write {
    /// Insert whole rows; used when the target table is still empty of these columns.
    Insert {
        columns: Vec<String>,
        values: Vec<String>,
    },
    /// Update already present rows, matched by identity.
    Update {
        assignments: Vec<(String, String)>,
        identity: Vec<(String, String)>,
    },
}

/// Inputs for generating the migrator functions of one source/target table pair.
pub struct MigratorSpec<'a> {
    pub source: &'a TableDef,
    pub target: &'a TableDef,
    /// `(source column, target column)` pairs.
    pub mapping: &'a [(String, String)],
    /// Target columns copied by earlier steps.
    pub migrated: &'a BTreeSet<String>,
    /// Target columns this step copies.
    pub columns: &'a BTreeSet<String>,
    pub null_records: &'a NullRecords,
    pub batch_size: usize,
}

impl MigratorSpec<'_> {
    /// Source identity columns with their types, in declaration order.
    pub fn identity(&self) -> Vec<(String, ColumnType)> {
        self.source
            .identity_columns()
            .into_iter()
            .map(|c| (c.name.clone(), c.column_type.clone()))
            .collect()
    }

    /// Build the function for `stage`, or `None` when the step copies nothing.
    pub fn build(&self, name: &str, stage: Stage) -> Result<Option<MigratorFunction>, MigrationError> {
        let Some(write) = self.write()? else {
            return Ok(None);
        };
        let identity = self.identity();
        if identity.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "table {} has no identity columns to migrate by",
                self.source.name
            ))
            .into());
        }

        let parameters: Vec<(String, ColumnType)> = match stage {
            Stage::Initial => Vec::new(),
            Stage::Consecutive => identity
                .iter()
                .enumerate()
                .map(|(i, (_, t))| (format!("q{}", i), t.clone()))
                .collect(),
        };
        let signature = parameters
            .iter()
            .map(|(p, t)| format!("{} {}", p, t.sql()))
            .collect::<Vec<_>>()
            .join(", ");
        let drop_types: Vec<String> = parameters.iter().map(|(_, t)| t.base_sql()).collect();

        let mut select = format!("SELECT * FROM {} r_src", quoted(&self.source.name));
        if stage == Stage::Consecutive {
            select.push_str(&format!(" WHERE {}", after_cursor(&identity)));
        }
        let order: Vec<String> = identity
            .iter()
            .map(|(c, t)| format!("{} ASC", with_collation(&format!("r_src.{}", quoted(c)), t)))
            .collect();
        let returned: Vec<String> = identity.iter().map(|(c, _)| format!("r.{}", quoted(c))).collect();

        let lines = vec![
            format!(
                "CREATE OR REPLACE FUNCTION {}({})",
                quoted(name),
                signature
            ),
            "RETURNS text AS $$".to_string(),
            "DECLARE".to_string(),
            "  r record;".to_string(),
            "  n bigint := 0;".to_string(),
            "BEGIN".to_string(),
            format!(
                "  FOR r IN {} ORDER BY {} LIMIT {}",
                select,
                order.join(", "),
                self.batch_size
            ),
            "  LOOP".to_string(),
            "    n := n + 1;".to_string(),
            "    BEGIN".to_string(),
            format!("      {}", write.statement(&self.target.name)),
            "    EXCEPTION WHEN unique_violation THEN".to_string(),
            "    END;".to_string(),
            "  END LOOP;".to_string(),
            "  IF n = 0 THEN".to_string(),
            "    RETURN NULL;".to_string(),
            "  END IF;".to_string(),
            format!("  RETURN ROW({})::text;", returned.join(", ")),
            "END;".to_string(),
            "$$ LANGUAGE plpgsql;".to_string(),
        ];

        Ok(Some(MigratorFunction {
            name: name.to_string(),
            stage,
            parameters,
            create_statement: lines.join("\n"),
            drop_statement: ddl::drop_function(name, &drop_types),
        }))
    }

    /// Query returning the identity of the last row in the source, or no rows.
    pub fn highest_identity_query(&self) -> String {
        let identity = self.identity();
        let columns: Vec<&str> = identity.iter().map(|(c, _)| c.as_str()).collect();
        let order: Vec<String> = identity
            .iter()
            .map(|(c, t)| format!("{} DESC", with_collation(&quoted(c), t)))
            .collect();
        format!(
            "SELECT {} FROM {} ORDER BY {} LIMIT 1;",
            quoted_list(&columns),
            quoted(&self.source.name),
            order.join(", ")
        )
    }

    fn write(&self) -> Result<Option<Write>, MigrationError> {
        if self.migrated.is_empty() {
            let mut columns = Vec::new();
            let mut values = Vec::new();
            for (from, to) in self.mapping {
                let is_identity = self.target.column(to).map(|c| c.is_identity()).unwrap_or(false);
                if self.columns.contains(to) || is_identity {
                    columns.push(to.clone());
                    values.push(format!("r.{}", quoted(from)));
                }
            }
            for (column, value) in self.foreign_key_fallbacks(&columns)? {
                columns.push(column);
                values.push(value);
            }
            if columns.is_empty() {
                return Ok(None);
            }
            return Ok(Some(Write::Insert { columns, values }));
        }

        let mut assignments = Vec::new();
        let mut identity = Vec::new();
        for (from, to) in self.mapping {
            let column = self.target.require_column(to)?;
            if column.is_identity() {
                identity.push((to.clone(), format!("r.{}", quoted(from))));
            } else if self.columns.contains(to) && !self.migrated.contains(to) {
                assignments.push((to.clone(), format!("r.{}", quoted(from))));
            }
        }
        if assignments.is_empty() {
            return Ok(None);
        }
        if identity.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "table {} has no identity columns mapped from {}",
                self.target.name, self.source.name
            ))
            .into());
        }
        Ok(Some(Write::Update {
            assignments,
            identity,
        }))
    }

    /// NOT NULL foreign key columns of the target that `covered` does not fill.
    fn foreign_key_fallbacks(&self, covered: &[String]) -> Result<Vec<(String, String)>, MigrationError> {
        let mut fallbacks = Vec::new();
        for fk in self.target.not_nullable_foreign_keys() {
            let identity = self.null_records.identity(&fk.referred_table);
            for (column_name, referred_column) in fk.column_pairs() {
                if covered.iter().any(|c| c == column_name)
                    || fallbacks.iter().any(|(c, _): &(String, String)| c == column_name)
                {
                    continue;
                }
                let column = self.target.require_column(column_name)?;
                let value = match identity.and_then(|i| i.get(referred_column)) {
                    Some(value) => literal(value, &column.column_type),
                    None => column.default_or_null(),
                };
                fallbacks.push((column_name.to_string(), value));
            }
        }
        Ok(fallbacks)
    }
}

impl Write {
    fn statement(&self, target: &str) -> String {
        match self {
            Write::Insert { columns, values } => format!(
                "INSERT INTO {} ({}) VALUES ({});",
                quoted(target),
                quoted_list(columns),
                values.join(", ")
            ),
            Write::Update {
                assignments,
                identity,
            } => format!(
                "UPDATE {} SET {} WHERE {};",
                quoted(target),
                assignments
                    .iter()
                    .map(|(c, v)| format!("{} = {}", quoted(c), v))
                    .collect::<Vec<_>>()
                    .join(", "),
                identity
                    .iter()
                    .map(|(c, v)| format!("{} = {}", quoted(c), v))
                    .collect::<Vec<_>>()
                    .join(" AND ")
            ),
        }
    }
}

impl MigratorFunction {
    /// `SELECT` calling the function, with `cursor` as arguments for `Consecutive`.
    pub fn call_statement(&self, cursor: Option<&Cursor>) -> String {
        let arguments = match (self.stage, cursor) {
            (Stage::Consecutive, Some(cursor)) => cursor.literals().join(", "),
            _ => String::new(),
        };
        format!("SELECT {}({});", quoted(&self.name), arguments)
    }
}

fn with_collation(expression: &str, column_type: &ColumnType) -> String {
    if column_type.value_kind() == ValueKind::Text {
        format!("{} COLLATE \"C\"", expression)
    } else {
        expression.to_string()
    }
}

/// `(a > q0) OR (a = q0 AND b > q1) OR ...` over the identity columns.
fn after_cursor(identity: &[(String, ColumnType)]) -> String {
    let mut disjuncts = Vec::with_capacity(identity.len());
    for i in 0..identity.len() {
        let mut terms = Vec::with_capacity(i + 1);
        for (j, (column, column_type)) in identity.iter().enumerate().take(i + 1) {
            let left = with_collation(&format!("r_src.{}", quoted(column)), column_type);
            let op = if j == i { ">" } else { "=" };
            terms.push(format!("{} {} q{}", left, op, j));
        }
        disjuncts.push(format!("({})", terms.join(" AND ")));
    }
    disjuncts.join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, ForeignKey};
    use crate::migration::null_records::Identity;

    fn source() -> TableDef {
        TableDef::new("users")
            .with_column(ColumnDef::new("id", ColumnType::BigInt).identity())
            .with_column(ColumnDef::new("name", ColumnType::Text))
            .with_column(ColumnDef::new("team_id", ColumnType::BigInt))
    }

    fn target() -> TableDef {
        TableDef::new("table_u")
            .with_column(ColumnDef::new("id", ColumnType::BigInt).identity())
            .with_column(ColumnDef::new("full_name", ColumnType::Text))
            .with_column(ColumnDef::new("team_id", ColumnType::BigInt).not_null())
            .with_foreign_key(ForeignKey::new("team_fk", ["team_id"], "table_t", ["id"]))
    }

    fn mapping() -> Vec<(String, String)> {
        vec![
            ("id".to_string(), "id".to_string()),
            ("name".to_string(), "full_name".to_string()),
            ("team_id".to_string(), "team_id".to_string()),
        ]
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_initial_insert_with_null_record_fallback() {
        let source = source();
        let target = target();
        let mapping = mapping();
        let mut null_records = NullRecords::new();
        null_records.insert_identity("table_t", Identity::new().with("id", "-5"));
        let migrated = BTreeSet::new();
        let columns = set(&["full_name"]);
        let spec = MigratorSpec {
            source: &source,
            target: &target,
            mapping: &mapping,
            migrated: &migrated,
            columns: &columns,
            null_records: &null_records,
            batch_size: 100,
        };

        let function = spec.build("migrator_1", Stage::Initial).unwrap().unwrap();
        assert!(function.parameters.is_empty());
        let sql = &function.create_statement;
        assert!(sql.starts_with("CREATE OR REPLACE FUNCTION \"migrator_1\"()"));
        assert!(sql.contains("FOR r IN SELECT * FROM \"users\" r_src ORDER BY r_src.\"id\" ASC LIMIT 100"));
        assert!(sql.contains("INSERT INTO \"table_u\" (\"id\", \"full_name\", \"team_id\") VALUES (r.\"id\", r.\"name\", -5);"));
        assert!(sql.contains("EXCEPTION WHEN unique_violation THEN"));
        assert!(sql.contains("RETURN ROW(r.\"id\")::text;"));
        assert_eq!(function.drop_statement, "DROP FUNCTION \"migrator_1\"();");
        assert_eq!(function.call_statement(None), "SELECT \"migrator_1\"();");
    }

    #[test]
    fn test_consecutive_update_resumes_after_cursor() {
        let source = source();
        let target = target();
        let mapping = mapping();
        let null_records = NullRecords::new();
        let migrated = set(&["full_name"]);
        let columns = set(&["team_id"]);
        let spec = MigratorSpec {
            source: &source,
            target: &target,
            mapping: &mapping,
            migrated: &migrated,
            columns: &columns,
            null_records: &null_records,
            batch_size: 10,
        };

        let function = spec.build("migrator_2", Stage::Consecutive).unwrap().unwrap();
        let sql = &function.create_statement;
        assert!(sql.starts_with("CREATE OR REPLACE FUNCTION \"migrator_2\"(q0 bigint)"));
        assert!(sql.contains("WHERE (r_src.\"id\" > q0)"));
        assert!(sql.contains("UPDATE \"table_u\" SET \"team_id\" = r.\"team_id\" WHERE \"id\" = r.\"id\";"));
        assert_eq!(function.drop_statement, "DROP FUNCTION \"migrator_2\"(bigint);");

        let cursor = Cursor::parse("(17)", &spec.identity()).unwrap();
        assert_eq!(function.call_statement(Some(&cursor)), "SELECT \"migrator_2\"(17);");
    }

    #[test]
    fn test_nothing_to_update() {
        let source = source();
        let target = target();
        let mapping = mapping();
        let null_records = NullRecords::new();
        let migrated = set(&["full_name"]);
        let columns = set(&["full_name"]);
        let spec = MigratorSpec {
            source: &source,
            target: &target,
            mapping: &mapping,
            migrated: &migrated,
            columns: &columns,
            null_records: &null_records,
            batch_size: 10,
        };
        assert!(spec.build("migrator_3", Stage::Initial).unwrap().is_none());
    }

    #[test]
    fn test_text_identity_uses_c_collation() {
        let source = TableDef::new("codes")
            .with_column(ColumnDef::new("region", ColumnType::Varchar(Some(8))).identity())
            .with_column(ColumnDef::new("code", ColumnType::Integer).identity());
        let target = source.renamed("table_c");
        let mapping = vec![
            ("region".to_string(), "region".to_string()),
            ("code".to_string(), "code".to_string()),
        ];
        let null_records = NullRecords::new();
        let migrated = BTreeSet::new();
        let columns = set(&["region", "code"]);
        let spec = MigratorSpec {
            source: &source,
            target: &target,
            mapping: &mapping,
            migrated: &migrated,
            columns: &columns,
            null_records: &null_records,
            batch_size: 10,
        };

        let function = spec.build("migrator_4", Stage::Consecutive).unwrap().unwrap();
        assert!(function.create_statement.contains(
            "WHERE (r_src.\"region\" COLLATE \"C\" > q0) OR (r_src.\"region\" COLLATE \"C\" = q0 AND r_src.\"code\" > q1)"
        ));
        assert!(function.create_statement.starts_with(
            "CREATE OR REPLACE FUNCTION \"migrator_4\"(q0 varchar(8), q1 integer)"
        ));
        assert_eq!(function.drop_statement, "DROP FUNCTION \"migrator_4\"(varchar, integer);");
        assert_eq!(
            spec.highest_identity_query(),
            "SELECT \"region\", \"code\" FROM \"codes\" ORDER BY \"region\" COLLATE \"C\" DESC, \"code\" DESC LIMIT 1;"
        );
    }
}
