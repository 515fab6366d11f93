//! Placeholder rows that let ghost rows satisfy NOT NULL foreign keys before the
//! rows they really refer to have been copied.

use super::error::MigrationError;
use super::{execute, query};
use crate::catalog::{Catalog, ColumnDef, ColumnType, TableDef};
use crate::error::Error;
use crate::sql::{literal, quoted, quoted_list, string_literal, SqlExecutor};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Identity column values of one row, in identity column order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    values: Vec<(String, String)>,
}

impl Identity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column value.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.push((column.into(), value.into()));
        self
    }

    /// Text value of `column`.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(c, v)| (c.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.iter().map(|(c, v)| format!("{}={}", c, v)).collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// Null records currently present in ghost tables, keyed by ref id.
#[derive(Debug, Clone, Default)]
pub struct NullRecords {
    identities: HashMap<String, Identity>,
}

impl NullRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity of the null record in `table`, if it has one.
    pub fn identity(&self, table: &str) -> Option<&Identity> {
        self.identities.get(table)
    }

    pub fn contains(&self, table: &str) -> bool {
        self.identities.contains_key(table)
    }

    /// Register a null record that already exists in the database.
    pub fn insert_identity(&mut self, table: impl Into<String>, identity: Identity) {
        self.identities.insert(table.into(), identity);
    }

    /// Insert one null record into each of `tables`, in a single transaction with
    /// deferred constraints so the records may refer to each other.
    pub fn insert(
        &mut self,
        executor: &mut dyn SqlExecutor,
        catalog: &Catalog,
        tables: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Identity>, MigrationError> {
        if let Some(table) = tables.iter().find(|t| self.contains(t)) {
            return Err(Error::already_exists("null record", table.as_str()).into());
        }

        debug!(tables = ?tables, "Inserting null records");
        let mut generated = HashMap::new();
        let result = in_deferred_transaction(executor, |executor| {
            let mut persisted = BTreeMap::new();
            for table in tables {
                let definition = catalog.table(table)?;
                let identity = self.insert_one(executor, catalog, definition, &mut generated)?;
                persisted.insert(table.clone(), identity);
            }
            Ok(persisted)
        })?;

        for (table, identity) in &result {
            self.identities.insert(table.clone(), identity.clone());
        }
        Ok(result)
    }

    /// Delete the null records of `tables` again.
    pub fn delete(
        &mut self,
        executor: &mut dyn SqlExecutor,
        catalog: &Catalog,
        tables: &BTreeSet<String>,
    ) -> Result<(), MigrationError> {
        if let Some(table) = tables.iter().find(|t| !self.contains(t)) {
            return Err(Error::not_found("null record", table.as_str()).into());
        }

        debug!(tables = ?tables, "Deleting null records");
        in_deferred_transaction(executor, |executor| {
            for table in tables {
                let definition = catalog.table(table)?;
                if let Some(identity) = self.identities.get(table) {
                    execute(executor, &delete_statement(definition, identity)?)?;
                }
            }
            Ok(())
        })?;

        for table in tables {
            self.identities.remove(table);
        }
        Ok(())
    }

    fn insert_one(
        &self,
        executor: &mut dyn SqlExecutor,
        catalog: &Catalog,
        table: &TableDef,
        generated: &mut HashMap<String, Identity>,
    ) -> Result<Identity, MigrationError> {
        let identity = self.identity_for(executor, catalog, table, generated, &mut BTreeSet::new())?;

        let mut columns = Vec::new();
        let mut values = Vec::new();
        for column in table.columns.iter().filter(|c| c.is_identity() || c.is_not_null()) {
            let value = if let Some(value) = identity.get(&column.name) {
                literal(value, &column.column_type)
            } else if let Some(fk) = table.outgoing_foreign_key(&column.name) {
                let referred = catalog.table(&fk.referred_table)?;
                let referred_identity =
                    self.identity_for(executor, catalog, referred, generated, &mut BTreeSet::new())?;
                let referred_column = fk.referred_column_for(&column.name).unwrap_or_default();
                let value = referred_identity.get(referred_column).ok_or_else(|| {
                    Error::not_found("identity column", format!("{}.{}", fk.referred_table, referred_column))
                })?;
                literal(value, &column.column_type)
            } else if let Some(default) = column.default_expression.as_deref().filter(|d| !d.trim().is_empty()) {
                default.to_string()
            } else {
                literal(&placeholder(&column.column_type), &column.column_type)
            };
            columns.push(column.name.clone());
            values.push(value);
        }

        let statement = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES;", quoted(&table.name))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({});",
                quoted(&table.name),
                quoted_list(&columns),
                values.join(", ")
            )
        };
        execute(executor, &statement)?;
        debug!(table = %table.name, identity = %identity, "Inserted null record");
        Ok(identity)
    }

    /// The identity a null record in `table` gets. Identity columns referring to another
    /// table reuse that table's null record identity.
    fn identity_for(
        &self,
        executor: &mut dyn SqlExecutor,
        catalog: &Catalog,
        table: &TableDef,
        generated: &mut HashMap<String, Identity>,
        visiting: &mut BTreeSet<String>,
    ) -> Result<Identity, MigrationError> {
        if let Some(identity) = self.identities.get(&table.name).or_else(|| generated.get(&table.name)) {
            return Ok(identity.clone());
        }
        if !visiting.insert(table.name.clone()) {
            return Err(Error::InvalidArgument(format!(
                "identity columns of table {} refer to themselves",
                table.name
            ))
            .into());
        }

        let mut identity = Identity::new();
        for column in table.identity_columns() {
            let value = if column.is_auto_increment() {
                next_value(executor, table, column)?
            } else if let Some(fk) = table.outgoing_foreign_key(&column.name) {
                let referred = catalog.table(&fk.referred_table)?;
                let referred_identity = self.identity_for(executor, catalog, referred, generated, visiting)?;
                let referred_column = fk.referred_column_for(&column.name).unwrap_or_default();
                referred_identity
                    .get(referred_column)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        Error::not_found("identity column", format!("{}.{}", fk.referred_table, referred_column))
                    })?
            } else {
                unique_placeholder(&column.column_type)
            };
            identity = identity.with(column.name.clone(), value);
        }

        generated.insert(table.name.clone(), identity.clone());
        Ok(identity)
    }
}

fn next_value(
    executor: &mut dyn SqlExecutor,
    table: &TableDef,
    column: &ColumnDef,
) -> Result<String, MigrationError> {
    let sequence = column.sequence.as_deref().ok_or_else(|| {
        Error::not_found("sequence of column", format!("{}.{}", table.name, column.name))
    })?;
    let statement = format!("SELECT nextval({}) AS val;", string_literal(sequence));
    let rows = query(executor, &statement)?;
    rows.first()
        .and_then(|row| row.get(0))
        .map(str::to_string)
        .ok_or_else(|| Error::not_found("next value of sequence", sequence).into())
}

fn delete_statement(table: &TableDef, identity: &Identity) -> Result<String, MigrationError> {
    if identity.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "table {} has no identity to delete its null record by",
            table.name
        ))
        .into());
    }
    let mut conditions = Vec::new();
    for (column, value) in identity.iter() {
        let column_type = &table.require_column(column)?.column_type;
        conditions.push(format!("{} = {}", quoted(column), literal(value, column_type)));
    }
    Ok(format!(
        "DELETE FROM {} WHERE {};",
        quoted(&table.name),
        conditions.join(" AND ")
    ))
}

fn in_deferred_transaction<T>(
    executor: &mut dyn SqlExecutor,
    body: impl FnOnce(&mut dyn SqlExecutor) -> Result<T, MigrationError>,
) -> Result<T, MigrationError> {
    execute(executor, "BEGIN;")?;
    let result = execute(executor, "SET CONSTRAINTS ALL DEFERRED;").and_then(|_| body(executor));
    match result {
        Ok(value) => {
            execute(executor, "COMMIT;")?;
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback) = execute(executor, "ROLLBACK;") {
                warn!(error = %rollback, "Rollback of null record transaction failed");
            }
            Err(error)
        }
    }
}

/// A value of `column_type` for a NOT NULL column nobody reads.
fn placeholder(column_type: &ColumnType) -> String {
    match column_type {
        ColumnType::SmallInt
        | ColumnType::Integer
        | ColumnType::BigInt
        | ColumnType::Real
        | ColumnType::DoublePrecision
        | ColumnType::Numeric => "0".to_string(),
        ColumnType::Boolean => "false".to_string(),
        ColumnType::Uuid => random_uuid(),
        ColumnType::Date => chrono::Utc::now().format("%Y-%m-%d").to_string(),
        ColumnType::Timestamp | ColumnType::TimestampTz => {
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
        }
        ColumnType::Bytea => "\\x".to_string(),
        ColumnType::Json | ColumnType::Jsonb => "{}".to_string(),
        ColumnType::Text | ColumnType::Varchar(_) | ColumnType::Char(_) => String::new(),
    }
}

/// A placeholder for an identity column, unlikely to collide with real rows.
fn unique_placeholder(column_type: &ColumnType) -> String {
    let mut rng = rand::thread_rng();
    match column_type {
        ColumnType::SmallInt => (-rng.gen_range(1..=i16::MAX as i64)).to_string(),
        ColumnType::Integer => (-rng.gen_range(1..=i32::MAX as i64)).to_string(),
        ColumnType::BigInt | ColumnType::Numeric => (-rng.gen_range(1..=i64::MAX)).to_string(),
        ColumnType::Varchar(Some(length)) | ColumnType::Char(length) => {
            let mut token = hex::encode(rng.gen::<[u8; 8]>());
            token.truncate(*length as usize);
            token
        }
        ColumnType::Text | ColumnType::Varchar(None) => hex::encode(rng.gen::<[u8; 8]>()),
        other => placeholder(other),
    }
}

fn random_uuid() -> String {
    let mut bytes: [u8; 16] = rand::thread_rng().gen();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ForeignKey;
    use crate::sql::{Row, SqlError};

    #[derive(Default)]
    struct Recorder {
        statements: Vec<String>,
        fail_on: Option<&'static str>,
    }

    impl SqlExecutor for Recorder {
        fn execute(&mut self, sql: &str) -> Result<u64, SqlError> {
            self.statements.push(sql.to_string());
            match self.fail_on {
                Some(needle) if sql.contains(needle) => Err(SqlError::new("boom")),
                _ => Ok(1),
            }
        }

        fn query(&mut self, sql: &str) -> Result<Vec<Row>, SqlError> {
            self.statements.push(sql.to_string());
            Ok(vec![vec![Some("42")].into_iter().collect()])
        }
    }

    fn create_catalog() -> Catalog {
        let customers = TableDef::new("table_c")
            .with_column(
                ColumnDef::new("id", ColumnType::BigInt)
                    .identity()
                    .with_sequence("customers_id_seq"),
            )
            .with_column(ColumnDef::new("name", ColumnType::Text).not_null())
            .with_column(ColumnDef::new("note", ColumnType::Text));
        let orders = TableDef::new("table_o")
            .with_column(ColumnDef::new("id", ColumnType::Uuid).identity())
            .with_column(ColumnDef::new("customer_id", ColumnType::BigInt).not_null())
            .with_column(ColumnDef::new("paid", ColumnType::Boolean).not_null().with_default("false"))
            .with_foreign_key(ForeignKey::new("customer_fk", ["customer_id"], "table_c", ["id"]));
        Catalog::new("shop")
            .with_table(customers)
            .unwrap()
            .with_table(orders)
            .unwrap()
    }

    fn tables(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_insert_in_deferred_transaction() {
        let catalog = create_catalog();
        let mut executor = Recorder::default();
        let mut records = NullRecords::new();

        let inserted = records
            .insert(&mut executor, &catalog, &tables(&["table_c", "table_o"]))
            .unwrap();

        assert_eq!(executor.statements[0], "BEGIN;");
        assert_eq!(executor.statements[1], "SET CONSTRAINTS ALL DEFERRED;");
        assert_eq!(executor.statements[2], "SELECT nextval('customers_id_seq') AS val;");
        assert_eq!(
            executor.statements[3],
            "INSERT INTO \"table_c\" (\"id\", \"name\") VALUES (42, '');"
        );
        assert!(executor.statements[4].starts_with("INSERT INTO \"table_o\" (\"id\", \"customer_id\", \"paid\") VALUES ('"));
        assert!(executor.statements[4].ends_with("', 42, false);"));
        assert_eq!(executor.statements.last().unwrap(), "COMMIT;");

        assert_eq!(inserted["table_c"].get("id"), Some("42"));
        assert_eq!(records.identity("table_c").unwrap().get("id"), Some("42"));
        assert_eq!(records.identity("table_o").unwrap().get("id").unwrap().len(), 36);
    }

    #[test]
    fn test_existing_null_record_reused_for_foreign_keys() {
        let catalog = create_catalog();
        let mut executor = Recorder::default();
        let mut records = NullRecords::new();
        records.insert(&mut executor, &catalog, &tables(&["table_c"])).unwrap();
        executor.statements.clear();

        records.insert(&mut executor, &catalog, &tables(&["table_o"])).unwrap();
        assert!(!executor.statements.iter().any(|s| s.contains("nextval")));
        assert!(executor.statements.iter().any(|s| s.contains("', 42, false);")));
    }

    #[test]
    fn test_delete_by_identity() {
        let catalog = create_catalog();
        let mut executor = Recorder::default();
        let mut records = NullRecords::new();
        records.insert(&mut executor, &catalog, &tables(&["table_c"])).unwrap();
        executor.statements.clear();

        records.delete(&mut executor, &catalog, &tables(&["table_c"])).unwrap();
        assert_eq!(
            executor.statements,
            vec![
                "BEGIN;".to_string(),
                "SET CONSTRAINTS ALL DEFERRED;".to_string(),
                "DELETE FROM \"table_c\" WHERE \"id\" = 42;".to_string(),
                "COMMIT;".to_string(),
            ]
        );
        assert!(!records.contains("table_c"));
    }

    #[test]
    fn test_failed_insert_rolls_back() {
        let catalog = create_catalog();
        let mut executor = Recorder {
            fail_on: Some("INSERT INTO \"table_c\""),
            ..Recorder::default()
        };
        let mut records = NullRecords::new();

        let result = records.insert(&mut executor, &catalog, &tables(&["table_c"]));
        assert!(matches!(result, Err(MigrationError::Sql { .. })));
        assert_eq!(executor.statements.last().unwrap(), "ROLLBACK;");
        assert!(!records.contains("table_c"));
    }

    #[test]
    fn test_double_insert_and_unknown_delete_rejected() {
        let catalog = create_catalog();
        let mut executor = Recorder::default();
        let mut records = NullRecords::new();
        records.insert(&mut executor, &catalog, &tables(&["table_c"])).unwrap();

        assert!(records.insert(&mut executor, &catalog, &tables(&["table_c"])).is_err());
        assert!(records.delete(&mut executor, &catalog, &tables(&["table_o"])).is_err());
    }

    #[test]
    fn test_random_uuid_shape() {
        let uuid = random_uuid();
        assert_eq!(uuid.len(), 36);
        assert_eq!(&uuid[14..15], "4");
    }
}
