//! End-to-end migrations against a scripted in-memory database.

use ghostshift_core::migration::{OperationKind, StepStatus};
use ghostshift_core::{
    BackfillConfig, Catalog, ColumnDef, ColumnType, ForeignKey, MigrationConfig, MigrationError,
    MigrationExecutor, MigrationStatus, Row, RunStore, SchemaOperation, SequentialNameAllocator,
    SqlError, SqlExecutor, State, StateStore, TableDef, VersionId,
};
use tokio_util::sync::CancellationToken;

/// Records every statement and answers the few queries a migration issues.
#[derive(Default)]
struct Scripted {
    statements: Vec<String>,
    /// Statements containing this text fail.
    fail_on: Option<&'static str>,
    /// Highest identity of every source table; `None` makes tables look empty.
    highest: Option<&'static str>,
}

impl Scripted {
    fn new() -> Self {
        Self {
            highest: Some("3"),
            ..Self::default()
        }
    }

    fn record(&mut self, sql: &str) -> Result<(), SqlError> {
        self.statements.push(sql.to_string());
        match self.fail_on {
            Some(needle) if sql.contains(needle) => Err(SqlError::new("permission denied")),
            _ => Ok(()),
        }
    }

    fn count(&self, prefix: &str) -> usize {
        self.statements.iter().filter(|s| s.starts_with(prefix)).count()
    }

    fn position(&self, prefix: &str) -> Option<usize> {
        self.statements.iter().position(|s| s.starts_with(prefix))
    }
}

impl SqlExecutor for Scripted {
    fn execute(&mut self, sql: &str) -> Result<u64, SqlError> {
        self.record(sql)?;
        Ok(0)
    }

    fn query(&mut self, sql: &str) -> Result<Vec<Row>, SqlError> {
        self.record(sql)?;
        if sql.contains("DESC LIMIT 1") {
            return Ok(self
                .highest
                .map(|h| vec![Row::new(vec![Some(h.to_string())])])
                .unwrap_or_default());
        }
        if sql.starts_with("SELECT \"migrator_") {
            return Ok(vec![Row::new(vec![self.highest.map(|h| format!("({})", h))])]);
        }
        if sql.contains("nextval") {
            return Ok(vec![Row::new(vec![Some("100".to_string())])]);
        }
        Ok(Vec::new())
    }
}

fn customers() -> TableDef {
    TableDef::new("customers")
        .with_column(ColumnDef::new("id", ColumnType::BigInt).identity())
        .with_column(ColumnDef::new("email", ColumnType::Text))
}

fn orders() -> TableDef {
    TableDef::new("orders")
        .with_column(ColumnDef::new("id", ColumnType::BigInt).identity())
        .with_column(ColumnDef::new("customer_id", ColumnType::BigInt).not_null())
        .with_foreign_key(ForeignKey::new(
            "orders_customer_fk",
            ["customer_id"],
            "customers",
            ["id"],
        ))
}

fn create_state(tables: Vec<TableDef>) -> (State, SequentialNameAllocator) {
    let mut catalog = Catalog::new("shop");
    for table in tables {
        catalog.add_table(table).unwrap();
    }
    let mut names = SequentialNameAllocator::new();
    let state = State::bootstrap(catalog, &mut names).unwrap();
    (state, names)
}

fn add_column(
    state: &mut State,
    names: &mut SequentialNameAllocator,
    table: &str,
    column: ColumnDef,
) -> (VersionId, VersionId) {
    let from = state.changelog.last().clone();
    state
        .changelog
        .add_change_set(
            "tester",
            None,
            vec![SchemaOperation::AddColumn {
                table: table.to_string(),
                column,
            }],
            names,
        )
        .unwrap();
    (from, state.changelog.last().clone())
}

fn config() -> MigrationConfig {
    MigrationConfig {
        backfill: BackfillConfig {
            batch_size: 100,
            batch_delay_ms: 0,
        },
        ..MigrationConfig::default()
    }
}

fn physical(state: &State, version: &VersionId, name: &str) -> String {
    let key = state.reflog.get_table_ref(version, name).unwrap();
    state.reflog.table(key).unwrap().ref_id().to_string()
}

#[test]
fn test_add_column_migration() {
    let (mut state, mut names) = create_state(vec![customers()]);
    let (from, to) = add_column(
        &mut state,
        &mut names,
        "customers",
        ColumnDef::new("nickname", ColumnType::Text),
    );
    let store = StateStore::temporary().unwrap();
    let runs = RunStore::open(store.db()).unwrap();

    let mut db = Scripted::new();
    let plan = {
        let mut executor = MigrationExecutor::new(&mut db, &mut names, config()).with_run_store(&runs);
        executor
            .migrate(&mut state, &from, &to, &CancellationToken::new())
            .unwrap()
    };

    let ghost = physical(&state, &to, "customers");
    assert_ne!(ghost, "customers");
    assert_eq!(plan.steps_of_kind(OperationKind::Copy).len(), 1);
    assert!(state.catalog.table(&ghost).unwrap().has_column("nickname"));
    assert!(state.reflog.is_active(&from));
    assert!(state.reflog.is_active(&to));

    // Ghost table first, then the forward sync, then the backfill.
    let create_table = db.position("CREATE TABLE").unwrap();
    let forward_sync = db.position("CREATE OR REPLACE FUNCTION \"sync_").unwrap();
    let backfill = db.position("CREATE OR REPLACE FUNCTION \"migrator_").unwrap();
    assert!(create_table < forward_sync && forward_sync < backfill);

    // Forward and backward syncs, each with a trigger.
    assert_eq!(db.count("CREATE OR REPLACE FUNCTION \"sync_"), 2);
    assert_eq!(db.count("CREATE TRIGGER"), 2);
    assert_eq!(state.reflog.syncs().count(), 2);

    // Migrator functions are temporary.
    assert_eq!(db.count("CREATE OR REPLACE FUNCTION \"migrator_"), 2);
    assert_eq!(db.count("DROP FUNCTION \"migrator_"), 2);

    let recorded = runs.list().unwrap();
    assert_eq!(recorded.len(), 1);
    let run = &recorded[0];
    assert_eq!(run.status, MigrationStatus::Complete);
    assert_eq!(run.ghost_tables, vec![ghost]);
    assert_eq!(run.steps[0].status, StepStatus::Complete);
    assert_eq!(run.steps[0].batches, 1);
    assert_eq!(run.steps[0].last_cursor.as_deref(), Some("(3)"));
}

#[test]
fn test_referencing_tables_are_mirrored() {
    let (mut state, mut names) = create_state(vec![customers(), orders()]);
    let (from, to) = add_column(
        &mut state,
        &mut names,
        "customers",
        ColumnDef::new("nickname", ColumnType::Text),
    );

    let mut db = Scripted::new();
    let plan = MigrationExecutor::new(&mut db, &mut names, config())
        .migrate(&mut state, &from, &to, &CancellationToken::new())
        .unwrap();

    assert_eq!(plan.ghost_tables().len(), 2);
    let ghost_customers = physical(&state, &to, "customers");
    let ghost_orders = physical(&state, &to, "orders");
    let foreign_key = &state.catalog.table(&ghost_orders).unwrap().foreign_keys[0];
    assert_eq!(foreign_key.referred_table, ghost_customers);

    assert_eq!(db.count("ALTER TABLE"), 1);
    assert!(db.statements.iter().any(|s| s.ends_with("DEFERRABLE;")));
    assert_eq!(state.reflog.syncs().count(), 4);
}

#[test]
fn test_self_reference_uses_null_records() {
    let employees = TableDef::new("employees")
        .with_column(ColumnDef::new("id", ColumnType::BigInt).identity())
        .with_column(ColumnDef::new("manager_id", ColumnType::BigInt).not_null())
        .with_foreign_key(ForeignKey::new("manager_fk", ["manager_id"], "employees", ["id"]));
    let (mut state, mut names) = create_state(vec![employees]);
    let (from, to) = add_column(
        &mut state,
        &mut names,
        "employees",
        ColumnDef::new("title", ColumnType::Text),
    );

    let mut db = Scripted::new();
    MigrationExecutor::new(&mut db, &mut names, config())
        .migrate(&mut state, &from, &to, &CancellationToken::new())
        .unwrap();

    let ghost = physical(&state, &to, "employees");
    let insert = format!("INSERT INTO \"{}\"", ghost);
    let delete = format!("DELETE FROM \"{}\"", ghost);
    assert_eq!(db.count(&insert), 1);
    assert_eq!(db.count(&delete), 1);
    assert!(db.position(&insert) < db.position(&delete));
    assert_eq!(db.count("SET CONSTRAINTS ALL DEFERRED;"), 2);
}

#[test]
fn test_dry_run_executes_nothing() {
    let (mut state, mut names) = create_state(vec![customers()]);
    let (from, to) = add_column(
        &mut state,
        &mut names,
        "customers",
        ColumnDef::new("nickname", ColumnType::Text),
    );
    let before = state.clone();

    let mut db = Scripted::new();
    let dry_run = MigrationConfig {
        dry_run: true,
        ..config()
    };
    let plan = MigrationExecutor::new(&mut db, &mut names, dry_run)
        .migrate(&mut state, &from, &to, &CancellationToken::new())
        .unwrap();

    assert_eq!(plan.len(), 1);
    assert!(db.statements.is_empty());
    assert_eq!(state, before);
}

#[test]
fn test_failed_migration_leaves_state_untouched() {
    let (mut state, mut names) = create_state(vec![customers()]);
    let (from, to) = add_column(
        &mut state,
        &mut names,
        "customers",
        ColumnDef::new("nickname", ColumnType::Text),
    );
    let before = state.clone();
    let store = StateStore::temporary().unwrap();
    let runs = RunStore::open(store.db()).unwrap();

    let mut db = Scripted {
        fail_on: Some("CREATE TRIGGER"),
        ..Scripted::new()
    };
    let mut executor = MigrationExecutor::new(&mut db, &mut names, config()).with_run_store(&runs);
    let result = executor.migrate(&mut state, &from, &to, &CancellationToken::new());

    assert!(matches!(result, Err(MigrationError::Sql { .. })));
    assert_eq!(state, before);
    assert!(!state.reflog.is_active(&to));

    // The ghost table exists in the database but not in the RefLog.
    let leftovers = executor.leftover_tables().to_vec();
    assert_eq!(leftovers.len(), 1);
    assert!(state.reflog.get_table_ref_by_id(&leftovers[0]).is_err());
    assert_eq!(db.count(&format!("CREATE TABLE \"{}\"", leftovers[0])), 1);

    let run = &runs.list().unwrap()[0];
    assert_eq!(run.status, MigrationStatus::Failed);
    assert_eq!(run.steps[0].status, StepStatus::Failed);
    assert!(run.error.is_some());
}

#[test]
fn test_cancelled_migration() {
    let (mut state, mut names) = create_state(vec![customers()]);
    let (from, to) = add_column(
        &mut state,
        &mut names,
        "customers",
        ColumnDef::new("nickname", ColumnType::Text),
    );
    let store = StateStore::temporary().unwrap();
    let runs = RunStore::open(store.db()).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut db = Scripted::new();
    let result = MigrationExecutor::new(&mut db, &mut names, config())
        .with_run_store(&runs)
        .migrate(&mut state, &from, &to, &cancel);

    assert!(result.unwrap_err().is_cancelled());
    assert_eq!(runs.list().unwrap()[0].status, MigrationStatus::Cancelled);
    // No batch ran, and the migrators were cleaned up.
    assert_eq!(db.count("SELECT \"migrator_"), 0);
    assert_eq!(db.count("DROP FUNCTION \"migrator_"), 2);
}

#[test]
fn test_empty_source_skips_backfill() {
    let (mut state, mut names) = create_state(vec![customers()]);
    let (from, to) = add_column(
        &mut state,
        &mut names,
        "customers",
        ColumnDef::new("nickname", ColumnType::Text),
    );

    let mut db = Scripted {
        highest: None,
        ..Scripted::default()
    };
    MigrationExecutor::new(&mut db, &mut names, config())
        .migrate(&mut state, &from, &to, &CancellationToken::new())
        .unwrap();

    assert_eq!(db.count("CREATE OR REPLACE FUNCTION \"migrator_"), 0);
    assert!(state.reflog.is_active(&to));
}

#[test]
fn test_drop_old_version_after_migration() {
    let (mut state, mut names) = create_state(vec![customers()]);
    let (from, to) = add_column(
        &mut state,
        &mut names,
        "customers",
        ColumnDef::new("nickname", ColumnType::Text),
    );

    let mut db = Scripted::new();
    MigrationExecutor::new(&mut db, &mut names, config())
        .migrate(&mut state, &from, &to, &CancellationToken::new())
        .unwrap();
    let ghost = physical(&state, &to, "customers");

    let mut db = Scripted::new();
    MigrationExecutor::new(&mut db, &mut names, config())
        .drop_version(&mut state, &from)
        .unwrap();

    assert!(!state.reflog.is_active(&from));
    assert!(state.reflog.is_active(&to));
    assert!(!state.catalog.contains_table("customers"));
    assert!(state.catalog.contains_table(&ghost));
    assert_eq!(state.reflog.syncs().count(), 0);

    assert_eq!(db.statements.first().map(String::as_str), Some("BEGIN;"));
    assert_eq!(db.statements.last().map(String::as_str), Some("COMMIT;"));
    assert_eq!(db.count("DROP TRIGGER"), 2);
    assert_eq!(db.count("DROP TABLE \"customers\" CASCADE;"), 1);

    // The remaining version can no longer be dropped.
    let mut db = Scripted::new();
    let result = MigrationExecutor::new(&mut db, &mut names, config()).drop_version(&mut state, &to);
    assert!(result.is_err());
    assert!(db.statements.is_empty());
}

#[test]
fn test_failed_drop_rolls_back() {
    let (mut state, mut names) = create_state(vec![customers()]);
    let (from, to) = add_column(
        &mut state,
        &mut names,
        "customers",
        ColumnDef::new("nickname", ColumnType::Text),
    );
    let mut db = Scripted::new();
    MigrationExecutor::new(&mut db, &mut names, config())
        .migrate(&mut state, &from, &to, &CancellationToken::new())
        .unwrap();
    let before = state.clone();

    let mut db = Scripted {
        fail_on: Some("DROP TABLE"),
        ..Scripted::new()
    };
    let result = MigrationExecutor::new(&mut db, &mut names, config()).drop_version(&mut state, &from);

    assert!(result.is_err());
    assert_eq!(db.statements.last().map(String::as_str), Some("ROLLBACK;"));
    assert_eq!(state, before);
}
