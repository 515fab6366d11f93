//! Statement execution over a single PostgreSQL connection.
//!
//! Statements run through the simple query protocol, so PL/pgSQL bodies and
//! multi-statement batches pass through unchanged and every result value arrives
//! in text form.

use crate::error::{Error, Result};
use ghostshift_core::{Row, SqlError, SqlExecutor};
use sqlx::postgres::{PgConnection, PgRow, PgValueFormat};
use sqlx::{Connection, Row as _, ValueRef as _};
use tokio::runtime::Runtime;
use tracing::{debug, info};

/// A blocking [`SqlExecutor`] backed by one connection.
///
/// A single connection, rather than a pool, keeps `BEGIN` / `COMMIT` pairs issued
/// as separate statements on the same session.
pub struct PgExecutor {
    connection: PgConnection,
    rt: Runtime,
}

impl PgExecutor {
    /// Connect to `database_url`.
    pub fn connect(database_url: &str) -> Result<Self> {
        let rt = Runtime::new()?;
        let connection = rt
            .block_on(PgConnection::connect(database_url))
            .map_err(|e| Error::Connection(e.to_string()))?;
        info!("Connected to PostgreSQL");
        Ok(Self { connection, rt })
    }

    /// Connect using the `DATABASE_URL` environment variable.
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| Error::Connection("DATABASE_URL environment variable not set".to_string()))?;
        Self::connect(&database_url)
    }

    /// Close the connection gracefully.
    pub fn close(self) -> Result<()> {
        let Self { connection, rt } = self;
        rt.block_on(connection.close())
            .map_err(|e| Error::Connection(e.to_string()))
    }
}

impl SqlExecutor for PgExecutor {
    fn execute(&mut self, sql: &str) -> std::result::Result<u64, SqlError> {
        debug!(statement = %sql, "Executing statement");
        let connection = &mut self.connection;
        let result = self
            .rt
            .block_on(async move { sqlx::raw_sql(sql).execute(connection).await })
            .map_err(to_sql_error)?;
        Ok(result.rows_affected())
    }

    fn query(&mut self, sql: &str) -> std::result::Result<Vec<Row>, SqlError> {
        debug!(statement = %sql, "Running query");
        let connection = &mut self.connection;
        let rows = self
            .rt
            .block_on(async move { sqlx::raw_sql(sql).fetch_all(connection).await })
            .map_err(to_sql_error)?;
        rows.iter().map(to_row).collect()
    }
}

fn to_row(row: &PgRow) -> std::result::Result<Row, SqlError> {
    let mut values = Vec::with_capacity(row.len());
    for index in 0..row.len() {
        let value = row.try_get_raw(index).map_err(to_sql_error)?;
        if value.is_null() {
            values.push(None);
            continue;
        }
        if value.format() != PgValueFormat::Text {
            return Err(SqlError::new(format!(
                "column {} was returned in binary format",
                index
            )));
        }
        let bytes = value
            .as_bytes()
            .map_err(|e| SqlError::new(e.to_string()))?;
        values.push(Some(String::from_utf8_lossy(bytes).into_owned()));
    }
    Ok(Row::new(values))
}

/// Keep the SQLSTATE so callers can recognise unique violations.
fn to_sql_error(error: sqlx::Error) -> SqlError {
    match &error {
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => SqlError::with_code(code.into_owned(), db.message()),
            None => SqlError::new(db.message()),
        },
        _ => SqlError::new(error.to_string()),
    }
}
