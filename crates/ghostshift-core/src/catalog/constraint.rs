//! Foreign key and index definitions.

use serde::{Deserialize, Serialize};

/// Referential action for `ON UPDATE` / `ON DELETE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKeyAction {
    /// `NO ACTION`
    #[default]
    NoAction,
    /// `RESTRICT`
    Restrict,
    /// `CASCADE`
    Cascade,
    /// `SET NULL`
    SetNull,
    /// `SET DEFAULT`
    SetDefault,
}

impl ForeignKeyAction {
    /// Parse the single-letter code stored in `pg_constraint.confupdtype` / `confdeltype`.
    pub fn from_pg_code(code: &str) -> Self {
        match code {
            "r" => ForeignKeyAction::Restrict,
            "c" => ForeignKeyAction::Cascade,
            "n" => ForeignKeyAction::SetNull,
            "d" => ForeignKeyAction::SetDefault,
            _ => ForeignKeyAction::NoAction,
        }
    }
}

impl std::fmt::Display for ForeignKeyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForeignKeyAction::NoAction => write!(f, "NO ACTION"),
            ForeignKeyAction::Restrict => write!(f, "RESTRICT"),
            ForeignKeyAction::Cascade => write!(f, "CASCADE"),
            ForeignKeyAction::SetNull => write!(f, "SET NULL"),
            ForeignKeyAction::SetDefault => write!(f, "SET DEFAULT"),
        }
    }
}

/// A foreign key owned by the referencing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Constraint name.
    pub name: String,
    /// Columns of the owning table, in constraint order.
    pub referencing_columns: Vec<String>,
    /// Physical name of the referred table.
    pub referred_table: String,
    /// Columns of the referred table, aligned with `referencing_columns`.
    pub referred_columns: Vec<String>,
    /// Action on update of the referred row.
    #[serde(default)]
    pub on_update: ForeignKeyAction,
    /// Action on delete of the referred row.
    #[serde(default)]
    pub on_delete: ForeignKeyAction,
}

impl ForeignKey {
    /// Create a foreign key with `NO ACTION` semantics.
    pub fn new(
        name: impl Into<String>,
        referencing_columns: impl IntoIterator<Item = impl Into<String>>,
        referred_table: impl Into<String>,
        referred_columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            referencing_columns: referencing_columns.into_iter().map(Into::into).collect(),
            referred_table: referred_table.into(),
            referred_columns: referred_columns.into_iter().map(Into::into).collect(),
            on_update: ForeignKeyAction::NoAction,
            on_delete: ForeignKeyAction::NoAction,
        }
    }

    pub fn with_on_update(mut self, action: ForeignKeyAction) -> Self {
        self.on_update = action;
        self
    }

    pub fn with_on_delete(mut self, action: ForeignKeyAction) -> Self {
        self.on_delete = action;
        self
    }

    /// Pairs of (referencing column, referred column).
    pub fn column_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.referencing_columns
            .iter()
            .map(String::as_str)
            .zip(self.referred_columns.iter().map(String::as_str))
    }

    /// The referred column paired with `column`, if it takes part in this key.
    pub fn referred_column_for(&self, column: &str) -> Option<&str> {
        self.column_pairs()
            .find(|(referencing, _)| *referencing == column)
            .map(|(_, referred)| referred)
    }

    /// Whether `column` takes part in this key.
    pub fn involves(&self, column: &str) -> bool {
        self.referencing_columns.iter().any(|c| c == column)
    }

    /// Whether the key points back at its owning table.
    pub fn is_self_referencing(&self, owner: &str) -> bool {
        self.referred_table == owner
    }
}

/// An index on a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name.
    pub name: String,
    /// Indexed columns in order.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    #[serde(default)]
    pub unique: bool,
}

impl IndexDef {
    /// Create a non-unique index.
    pub fn new(name: impl Into<String>, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Create a unique index.
    pub fn unique(
        name: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            unique: true,
            ..Self::new(name, columns)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_pairs() {
        let fk = ForeignKey::new(
            "orders_customer_fk",
            ["customer_id", "region"],
            "customers",
            ["id", "region"],
        );
        assert_eq!(fk.referred_column_for("customer_id"), Some("id"));
        assert_eq!(fk.referred_column_for("region"), Some("region"));
        assert_eq!(fk.referred_column_for("total"), None);
        assert!(fk.involves("region"));
    }

    #[test]
    fn test_action_from_pg_code() {
        assert_eq!(ForeignKeyAction::from_pg_code("c"), ForeignKeyAction::Cascade);
        assert_eq!(ForeignKeyAction::from_pg_code("a"), ForeignKeyAction::NoAction);
        assert_eq!(ForeignKeyAction::SetNull.to_string(), "SET NULL");
    }
}
