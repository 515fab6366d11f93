//! Backfill cursors: the identity of the last row a migrator batch processed.

use super::error::MigrationError;
use crate::catalog::{ColumnType, TableDef, ValueKind};
use crate::sql::{literal, Row};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::cmp::Ordering;
use std::fmt;

/// One component of a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub column: String,
    pub column_type: ColumnType,
    /// Text form of the value, `None` for SQL NULL.
    pub value: Option<String>,
}

/// Position in a table's identity order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    components: Vec<Component>,
}

impl Cursor {
    pub fn new(components: Vec<Component>) -> Self {
        Self { components }
    }

    /// Read a cursor from the first columns of `row`, one per identity column.
    pub fn from_row(row: &Row, identity: &[(String, ColumnType)]) -> Self {
        let components = identity
            .iter()
            .enumerate()
            .map(|(i, (column, column_type))| Component {
                column: column.clone(),
                column_type: column_type.clone(),
                value: row.get(i).map(str::to_string),
            })
            .collect();
        Self { components }
    }

    /// Parse the text form of a row value, e.g. `(42,"a ""b""")`, as returned by
    /// a migrator function.
    pub fn parse(text: &str, identity: &[(String, ColumnType)]) -> Result<Self, MigrationError> {
        let fields = parse_composite(text)?;
        if fields.len() != identity.len() {
            return Err(MigrationError::Deserialization(format!(
                "cursor {} has {} fields, expected {}",
                text,
                fields.len(),
                identity.len()
            )));
        }
        let components = identity
            .iter()
            .zip(fields)
            .map(|((column, column_type), value)| Component {
                column: column.clone(),
                column_type: column_type.clone(),
                value,
            })
            .collect();
        Ok(Self { components })
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// SQL literals for each component, used as migrator function arguments.
    pub fn literals(&self) -> Vec<String> {
        self.components
            .iter()
            .map(|c| match &c.value {
                Some(value) => literal(value, &c.column_type),
                None => "NULL".to_string(),
            })
            .collect()
    }

    /// Whether this cursor has reached `limit` in lexicographic identity order.
    pub fn is_at_or_past(&self, limit: &Cursor, table: &TableDef) -> Result<bool, MigrationError> {
        for (mine, theirs) in self.components.iter().zip(&limit.components) {
            let (Some(a), Some(b)) = (&mine.value, &theirs.value) else {
                return Err(MigrationError::NullIdentity {
                    table: table.name.clone(),
                    column: mine.column.clone(),
                });
            };
            match compare(a, b, mine.column_type.value_kind()) {
                Ordering::Equal => continue,
                Ordering::Greater => return Ok(true),
                Ordering::Less => return Ok(false),
            }
        }
        Ok(true)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<&str> = self
            .components
            .iter()
            .map(|c| c.value.as_deref().unwrap_or("NULL"))
            .collect();
        write!(f, "({})", values.join(", "))
    }
}

fn compare(a: &str, b: &str, kind: ValueKind) -> Ordering {
    match kind {
        ValueKind::Numeric => {
            if let (Ok(x), Ok(y)) = (a.parse::<i128>(), b.parse::<i128>()) {
                return x.cmp(&y);
            }
            if let (Ok(x), Ok(y)) = (a.parse::<f64>(), b.parse::<f64>()) {
                return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
            }
            a.cmp(b)
        }
        ValueKind::Temporal => match (parse_temporal(a), parse_temporal(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => a.cmp(b),
        },
        ValueKind::Boolean => parse_bool(a).cmp(&parse_bool(b)),
        ValueKind::Uuid => a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()),
        ValueKind::Text | ValueKind::Other => a.cmp(b),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "t" | "true" | "TRUE" | "1")
}

fn parse_temporal(value: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.naive_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(dt);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Split Postgres composite text output into fields. An unquoted empty field is NULL.
fn parse_composite(text: &str) -> Result<Vec<Option<String>>, MigrationError> {
    let inner = text
        .trim()
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .ok_or_else(|| MigrationError::Deserialization(format!("malformed cursor: {}", text)))?;

    let mut fields = Vec::new();
    let mut chars = inner.chars().peekable();
    loop {
        let mut value = String::new();
        let mut quoted = false;
        let mut in_quotes = false;
        while let Some(c) = chars.next() {
            match c {
                '"' if in_quotes => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        value.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                '"' => {
                    in_quotes = true;
                    quoted = true;
                }
                '\\' if in_quotes => {
                    if let Some(escaped) = chars.next() {
                        value.push(escaped);
                    }
                }
                ',' if !in_quotes => break,
                other => value.push(other),
            }
        }
        if in_quotes {
            return Err(MigrationError::Deserialization(format!(
                "unterminated quote in cursor: {}",
                text
            )));
        }
        fields.push(if value.is_empty() && !quoted { None } else { Some(value) });
        if chars.peek().is_none() {
            break;
        }
    }
    // A trailing comma leaves an empty last field.
    if inner.ends_with(',') {
        fields.push(None);
    }
    Ok(fields)
}
