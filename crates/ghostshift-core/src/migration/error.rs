//! Migration-specific error types.

use crate::sql::SqlError;
use crate::versioning::VersionId;
use thiserror::Error;

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Catalog, RefLog, changelog or store error.
    #[error(transparent)]
    Core(#[from] crate::error::Error),

    /// A statement was rejected by the database.
    #[error("statement failed: {source}; statement: {statement}")]
    Sql {
        /// The statement that failed.
        statement: String,
        /// The database error.
        #[source]
        source: SqlError,
    },

    /// The generated plan violates a structural rule.
    #[error("plan validation failed: {message}")]
    PlanValidation {
        /// Description of the violated rule.
        message: String,
    },

    /// The planner could not make progress.
    #[error("planning failed: {message}")]
    Planning {
        /// Description of the failure.
        message: String,
    },

    /// The target version is not reachable from the source version.
    #[error("no migration path from version {from} to version {to}")]
    NoPath {
        /// Source version.
        from: VersionId,
        /// Target version.
        to: VersionId,
    },

    /// A plan step failed.
    #[error("step {step} failed: {message}")]
    StepFailed {
        /// 1-based step number.
        step: usize,
        /// Error message.
        message: String,
    },

    /// Backfill operation failed.
    #[error("backfill of {table} via {function} failed: {reason}")]
    BackfillFailed {
        /// Target table being backfilled.
        table: String,
        /// Migrator function being called.
        function: String,
        /// The reason for failure.
        reason: String,
    },

    /// A primary key component came back NULL while comparing cursors.
    #[error("NULL identity value in {table}.{column}")]
    NullIdentity {
        /// Source table.
        table: String,
        /// Identity column.
        column: String,
    },

    /// The backfill was interrupted between batches.
    #[error("backfill of {table} cancelled at cursor {cursor}")]
    Cancelled {
        /// Target table being backfilled.
        table: String,
        /// Last cursor reached, `-` when no batch completed.
        cursor: String,
    },

    /// A step was marked as executed twice.
    #[error("step {step} has already been executed")]
    AlreadyExecuted {
        /// 1-based step number.
        step: usize,
    },

    /// A dependency would close a cycle in the step graph.
    #[error("step {step} cannot depend on step {dependency}: cyclic dependency")]
    CyclicDependency {
        /// 1-based step number.
        step: usize,
        /// 1-based step number of the dependency.
        dependency: usize,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl MigrationError {
    /// Wrap a failed statement.
    pub fn sql(statement: impl Into<String>, source: SqlError) -> Self {
        MigrationError::Sql {
            statement: statement.into(),
            source,
        }
    }

    /// Shorthand for a [`MigrationError::Planning`].
    pub fn planning(message: impl Into<String>) -> Self {
        MigrationError::Planning {
            message: message.into(),
        }
    }

    /// Shorthand for a [`MigrationError::PlanValidation`].
    pub fn validation(message: impl Into<String>) -> Self {
        MigrationError::PlanValidation {
            message: message.into(),
        }
    }

    /// Whether the run stopped because it was asked to.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MigrationError::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrationError::BackfillFailed {
            table: "table_abc".to_string(),
            function: "migrator_1".to_string(),
            reason: "connection reset".to_string(),
        };
        assert!(err.to_string().contains("table_abc via migrator_1"));
    }

    #[test]
    fn test_cancelled_is_distinct() {
        let err = MigrationError::Cancelled {
            table: "table_abc".to_string(),
            cursor: "(42)".to_string(),
        };
        assert!(err.is_cancelled());
        assert!(!MigrationError::planning("stuck").is_cancelled());
    }

    #[test]
    fn test_core_error_is_transparent() {
        let err: MigrationError = crate::error::Error::not_found("table", "users").into();
        assert_eq!(err.to_string(), "table not found: users");
    }
}
