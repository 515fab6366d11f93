//! Column type definitions for the catalog.

use serde::{Deserialize, Serialize};

/// SQL column types understood by the migrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "length")]
pub enum ColumnType {
    /// 16-bit integer.
    SmallInt,
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    BigInt,
    /// Single precision float.
    Real,
    /// Double precision float.
    DoublePrecision,
    /// Arbitrary precision number.
    Numeric,
    /// Boolean value.
    Boolean,
    /// Unbounded text.
    Text,
    /// Variable length text with an optional limit.
    Varchar(Option<u32>),
    /// Fixed length text.
    Char(u32),
    /// 128-bit UUID.
    Uuid,
    /// Calendar date.
    Date,
    /// Timestamp without time zone.
    Timestamp,
    /// Timestamp with time zone.
    TimestampTz,
    /// Binary data.
    Bytea,
    /// JSON document.
    Json,
    /// Binary JSON document.
    Jsonb,
}

/// How cursor values of a column type are parsed and compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Integers and floats, compared numerically.
    Numeric,
    /// Text, compared lexically.
    Text,
    /// Dates and timestamps in ISO form, compared chronologically.
    Temporal,
    /// `t`/`f` or `true`/`false`.
    Boolean,
    /// UUIDs, compared case-insensitively.
    Uuid,
    /// Anything else, compared as raw text.
    Other,
}

impl ColumnType {
    /// The SQL spelling used in DDL and function signatures.
    pub fn sql(&self) -> String {
        match self {
            ColumnType::SmallInt => "smallint".to_string(),
            ColumnType::Integer => "integer".to_string(),
            ColumnType::BigInt => "bigint".to_string(),
            ColumnType::Real => "real".to_string(),
            ColumnType::DoublePrecision => "double precision".to_string(),
            ColumnType::Numeric => "numeric".to_string(),
            ColumnType::Boolean => "boolean".to_string(),
            ColumnType::Text => "text".to_string(),
            ColumnType::Varchar(Some(len)) => format!("varchar({})", len),
            ColumnType::Varchar(None) => "varchar".to_string(),
            ColumnType::Char(len) => format!("char({})", len),
            ColumnType::Uuid => "uuid".to_string(),
            ColumnType::Date => "date".to_string(),
            ColumnType::Timestamp => "timestamp".to_string(),
            ColumnType::TimestampTz => "timestamptz".to_string(),
            ColumnType::Bytea => "bytea".to_string(),
            ColumnType::Json => "json".to_string(),
            ColumnType::Jsonb => "jsonb".to_string(),
        }
    }

    /// The type name without length modifiers, as used in `DROP FUNCTION` signatures.
    pub fn base_sql(&self) -> String {
        match self {
            ColumnType::Varchar(_) => "varchar".to_string(),
            ColumnType::Char(_) => "char".to_string(),
            other => other.sql(),
        }
    }

    /// Whether literal values of this type must be single-quoted.
    pub fn requires_quotes(&self) -> bool {
        !matches!(
            self,
            ColumnType::SmallInt
                | ColumnType::Integer
                | ColumnType::BigInt
                | ColumnType::Real
                | ColumnType::DoublePrecision
                | ColumnType::Numeric
                | ColumnType::Boolean
        )
    }

    /// Whether the type can be served by a sequence.
    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            ColumnType::SmallInt | ColumnType::Integer | ColumnType::BigInt
        )
    }

    /// The kind used to parse and compare cursor components.
    pub fn value_kind(&self) -> ValueKind {
        match self {
            ColumnType::SmallInt
            | ColumnType::Integer
            | ColumnType::BigInt
            | ColumnType::Real
            | ColumnType::DoublePrecision
            | ColumnType::Numeric => ValueKind::Numeric,
            ColumnType::Text | ColumnType::Varchar(_) | ColumnType::Char(_) => ValueKind::Text,
            ColumnType::Date | ColumnType::Timestamp | ColumnType::TimestampTz => {
                ValueKind::Temporal
            }
            ColumnType::Boolean => ValueKind::Boolean,
            ColumnType::Uuid => ValueKind::Uuid,
            ColumnType::Bytea | ColumnType::Json | ColumnType::Jsonb => ValueKind::Other,
        }
    }

    /// Parse an `information_schema.columns.data_type` value.
    pub fn from_sql(data_type: &str, max_length: Option<u32>) -> Option<Self> {
        let normalized = data_type.trim().to_ascii_lowercase();
        let column_type = match normalized.as_str() {
            "smallint" | "int2" | "smallserial" => ColumnType::SmallInt,
            "integer" | "int" | "int4" | "serial" => ColumnType::Integer,
            "bigint" | "int8" | "bigserial" => ColumnType::BigInt,
            "real" | "float4" => ColumnType::Real,
            "double precision" | "float8" => ColumnType::DoublePrecision,
            "numeric" | "decimal" => ColumnType::Numeric,
            "boolean" | "bool" => ColumnType::Boolean,
            "text" => ColumnType::Text,
            "character varying" | "varchar" => ColumnType::Varchar(max_length),
            "character" | "char" | "bpchar" => ColumnType::Char(max_length.unwrap_or(1)),
            "uuid" => ColumnType::Uuid,
            "date" => ColumnType::Date,
            "timestamp" | "timestamp without time zone" => ColumnType::Timestamp,
            "timestamptz" | "timestamp with time zone" => ColumnType::TimestampTz,
            "bytea" => ColumnType::Bytea,
            "json" => ColumnType::Json,
            "jsonb" => ColumnType::Jsonb,
            _ => return None,
        };
        Some(column_type)
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sql())
    }
}
