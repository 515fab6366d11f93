//! SQL execution boundary and SQL text helpers.
//!
//! The core never opens connections. Every statement it produces is handed to a
//! caller-supplied [`SqlExecutor`], which returns rows as text values.

pub mod ddl;

use crate::catalog::ColumnType;
use thiserror::Error;

/// SQLSTATE of a unique constraint violation.
pub const UNIQUE_VIOLATION: &str = "23505";

/// A database error reported by a [`SqlExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SqlError {
    /// SQLSTATE code, when the driver reports one.
    pub code: Option<String>,
    /// Driver message.
    pub message: String,
}

impl SqlError {
    /// An error without SQLSTATE code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// An error carrying a SQLSTATE code.
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        self.code.as_deref() == Some(UNIQUE_VIOLATION)
    }
}

/// A result row. Every value is rendered as text; SQL NULL is `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    values: Vec<Option<String>>,
}

impl Row {
    pub fn new(values: Vec<Option<String>>) -> Self {
        Self { values }
    }

    /// Value at `index`; `None` for SQL NULL or an out of range index.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<S: Into<String>> FromIterator<Option<S>> for Row {
    fn from_iter<I: IntoIterator<Item = Option<S>>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(|v| v.map(Into::into)).collect())
    }
}

/// Runs SQL statements against a live database connection.
pub trait SqlExecutor {
    /// Execute a statement (or a batch of statements), returning the affected row count.
    fn execute(&mut self, sql: &str) -> Result<u64, SqlError>;

    /// Run a query and return all rows.
    fn query(&mut self, sql: &str) -> Result<Vec<Row>, SqlError>;
}

impl<T: SqlExecutor + ?Sized> SqlExecutor for &mut T {
    fn execute(&mut self, sql: &str) -> Result<u64, SqlError> {
        (**self).execute(sql)
    }

    fn query(&mut self, sql: &str) -> Result<Vec<Row>, SqlError> {
        (**self).query(sql)
    }
}

/// Quote an identifier, doubling embedded double quotes.
pub fn quoted(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Quote and comma-join identifiers.
pub fn quoted_list<S: AsRef<str>>(identifiers: &[S]) -> String {
    identifiers
        .iter()
        .map(|i| quoted(i.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Single-quote a string literal, doubling embedded quotes.
pub fn string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render a text value as a literal of `column_type`: numbers bare, booleans as
/// keywords, everything else single-quoted.
pub fn literal(value: &str, column_type: &ColumnType) -> String {
    match column_type {
        ColumnType::Boolean => match value {
            "t" | "true" | "TRUE" => "true".to_string(),
            "f" | "false" | "FALSE" => "false".to_string(),
            other => string_literal(other),
        },
        other if !other.requires_quotes() => value.to_string(),
        _ => string_literal(value),
    }
}
