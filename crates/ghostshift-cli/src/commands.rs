//! Operator command handling.

use crate::config::{CliConfig, Command, DATABASE_URL_ENV};
use crate::formatter::{Formatter, VersionSummary};
use ghostshift_core::migration::{self, MigrationError};
use ghostshift_core::{
    MigrationExecutor, RandomNameAllocator, RunStore, SchemaOperation, State, StateStore,
    VersionId,
};
use ghostshift_postgres::PgExecutor;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Number of run records shown by `status`.
const RECENT_RUNS: usize = 10;

/// Errors surfaced to the operator.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// No database URL was configured.
    #[error("no database URL given; pass --database-url or set {0}")]
    MissingDatabaseUrl(&'static str),

    /// The state store already holds a bootstrapped state.
    #[error("state at {0} is already initialised")]
    AlreadyInitialised(String),

    /// The state store was never initialised.
    #[error("state at {0} is not initialised; run `ghostshift init` first")]
    NotInitialised(String),

    /// No active version exists to migrate from.
    #[error("no active version to migrate from")]
    NoActiveVersion,

    /// A change set file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A change set file is not a JSON list of schema operations.
    #[error("invalid change set {path}: {source}")]
    InvalidChangeSet {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Core(#[from] ghostshift_core::Error),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Postgres(#[from] ghostshift_postgres::Error),
}

/// Run one command and return its rendered output.
pub fn run(
    command: Command,
    config: &CliConfig,
    formatter: &dyn Formatter,
    cancel: &CancellationToken,
) -> Result<String, CommandError> {
    let store = StateStore::open_path(&config.state_path)?;
    match command {
        Command::Init => init(&store, config, formatter),
        Command::Changeset {
            file,
            author,
            description,
        } => changeset(&store, config, &file, author, description, formatter),
        Command::Plan { from, to } => plan(&store, config, &from, &to, formatter),
        Command::Fork { to, from, dry_run } => {
            fork(&store, config, from.as_deref(), &to, dry_run, formatter, cancel)
        }
        Command::Drop { version } => drop_version(&store, config, &version, formatter),
        Command::Status => status(&store, config, formatter),
    }
}

fn connect(config: &CliConfig) -> Result<PgExecutor, CommandError> {
    let url = config
        .resolve_database_url()
        .ok_or(CommandError::MissingDatabaseUrl(DATABASE_URL_ENV))?;
    Ok(PgExecutor::connect(&url)?)
}

fn load_state(store: &StateStore, config: &CliConfig) -> Result<State, CommandError> {
    store
        .load()?
        .ok_or_else(|| CommandError::NotInitialised(config.state_path.display().to_string()))
}

fn init(
    store: &StateStore,
    config: &CliConfig,
    formatter: &dyn Formatter,
) -> Result<String, CommandError> {
    if store.load()?.is_some() {
        return Err(CommandError::AlreadyInitialised(
            config.state_path.display().to_string(),
        ));
    }

    let mut connection = connect(config)?;
    let catalog = ghostshift_postgres::load_catalog(&mut connection, "public")?;
    connection.close()?;

    let tables = catalog.tables().count();
    let state = State::bootstrap(catalog, &mut RandomNameAllocator::new())?;
    store.save(&state)?;

    let root = state.changelog.root();
    info!(version = %root, tables, "Initialised state");
    Ok(formatter.format_message(&format!(
        "Initialised root version {} with {} table(s)",
        root, tables
    )))
}

/// Parse a change set file: a JSON list of schema operations.
pub fn read_change_set(path: &Path) -> Result<Vec<SchemaOperation>, CommandError> {
    let display = path.display().to_string();
    let content = std::fs::read_to_string(path).map_err(|source| CommandError::Io {
        path: display.clone(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| CommandError::InvalidChangeSet {
        path: display,
        source,
    })
}

fn changeset(
    store: &StateStore,
    config: &CliConfig,
    file: &Path,
    author: String,
    description: Option<String>,
    formatter: &dyn Formatter,
) -> Result<String, CommandError> {
    let operations = read_change_set(file)?;
    let mut state = load_state(store, config)?;

    let change_set = state.changelog.add_change_set(
        author,
        description,
        operations,
        &mut RandomNameAllocator::new(),
    )?;
    let versions: Vec<String> = change_set.versions.iter().map(|v| v.to_string()).collect();
    let id = change_set.id.clone();
    store.save(&state)?;

    info!(change_set = %id, versions = versions.len(), "Recorded change set");
    Ok(formatter.format_message(&format!(
        "Change set {} added version(s): {}",
        id,
        versions.join(", ")
    )))
}

fn plan(
    store: &StateStore,
    config: &CliConfig,
    from: &str,
    to: &str,
    formatter: &dyn Formatter,
) -> Result<String, CommandError> {
    let mut working = load_state(store, config)?;
    let plan = migration::plan(
        &mut working,
        &VersionId::from(from),
        &VersionId::from(to),
        &mut RandomNameAllocator::new(),
    )?;
    migration::validate(&plan, &working.catalog)?;
    Ok(formatter.format_plan(&plan))
}

/// The active version furthest along the changelog.
fn newest_active(state: &State) -> Result<VersionId, CommandError> {
    let mut newest: Option<(usize, &VersionId)> = None;
    for version in state.reflog.active_versions() {
        let position = state.changelog.position(version)?;
        if newest.map_or(true, |(best, _)| position > best) {
            newest = Some((position, version));
        }
    }
    newest
        .map(|(_, version)| version.clone())
        .ok_or(CommandError::NoActiveVersion)
}

fn fork(
    store: &StateStore,
    config: &CliConfig,
    from: Option<&str>,
    to: &str,
    dry_run: bool,
    formatter: &dyn Formatter,
    cancel: &CancellationToken,
) -> Result<String, CommandError> {
    let mut state = load_state(store, config)?;
    let from = match from {
        Some(from) => VersionId::from(from),
        None => newest_active(&state)?,
    };
    let to = VersionId::from(to);

    let runs = RunStore::open(store.db())?;
    let mut connection = connect(config)?;
    let mut names = RandomNameAllocator::new();
    let plan = {
        let mut executor = MigrationExecutor::new(
            &mut connection,
            &mut names,
            config.migration_config(dry_run),
        )
        .with_run_store(&runs);
        executor.migrate(&mut state, &from, &to, cancel)?
    };
    connection.close()?;

    let outcome = if dry_run {
        format!("Dry run, version {} not migrated", to)
    } else {
        store.save(&state)?;
        format!("Version {} is active", to)
    };
    Ok(format!(
        "{}\n{}",
        formatter.format_plan(&plan),
        formatter.format_message(&outcome)
    ))
}

fn drop_version(
    store: &StateStore,
    config: &CliConfig,
    version: &str,
    formatter: &dyn Formatter,
) -> Result<String, CommandError> {
    let mut state = load_state(store, config)?;
    let version = VersionId::from(version);

    let mut connection = connect(config)?;
    let mut names = RandomNameAllocator::new();
    MigrationExecutor::new(&mut connection, &mut names, config.migration_config(false))
        .drop_version(&mut state, &version)?;
    store.save(&state)?;
    connection.close()?;

    Ok(formatter.format_message(&format!("Version {} dropped", version)))
}

fn status(
    store: &StateStore,
    config: &CliConfig,
    formatter: &dyn Formatter,
) -> Result<String, CommandError> {
    let state = load_state(store, config)?;
    let versions = VersionSummary::collect(&state);

    let mut runs = RunStore::open(store.db())?.list()?;
    let skip = runs.len().saturating_sub(RECENT_RUNS);
    runs.drain(..skip);

    Ok(format!(
        "{}\n{}",
        formatter.format_versions(&versions),
        formatter.format_runs(&runs)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::TableFormatter;
    use ghostshift_core::{Catalog, ColumnDef, ColumnType, TableDef};
    use std::io::Write;

    fn config(dir: &tempfile::TempDir) -> CliConfig {
        CliConfig::new(dir.path().join("state"))
    }

    fn seed(config: &CliConfig) -> StateStore {
        let catalog = Catalog::new("public")
            .with_table(
                TableDef::new("customers")
                    .with_column(ColumnDef::new("id", ColumnType::BigInt).identity())
                    .with_column(ColumnDef::new("email", ColumnType::Text)),
            )
            .unwrap();
        let store = StateStore::open_path(&config.state_path).unwrap();
        let state = State::bootstrap(catalog, &mut RandomNameAllocator::new()).unwrap();
        store.save(&state).unwrap();
        store
    }

    fn change_set_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("changes.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"[{{"operation": "add_column", "table": "customers",
                 "column": {{"name": "nickname", "column_type": {{"type": "text"}}}}}}]"#
        )
        .unwrap();
        path
    }

    #[test]
    fn test_changeset_then_plan() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let store = seed(&config);
        let path = change_set_file(&dir);

        let output = changeset(&store, &config, &path, "ops".to_string(), None, &TableFormatter).unwrap();
        assert!(output.contains("added version(s)"));

        let state = store.require().unwrap();
        let root = state.changelog.root().to_string();
        let last = state.changelog.last().to_string();
        assert_ne!(root, last);

        let output = plan(&store, &config, &root, &last, &TableFormatter).unwrap();
        assert!(output.contains("COPY"));

        // Planning leaves the stored state untouched.
        assert_eq!(store.require().unwrap(), state);
    }

    #[test]
    fn test_invalid_change_set_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{\"not\": \"a list\"}").unwrap();
        assert!(matches!(
            read_change_set(&path),
            Err(CommandError::InvalidChangeSet { .. })
        ));
        assert!(matches!(
            read_change_set(&dir.path().join("missing.json")),
            Err(CommandError::Io { .. })
        ));
    }

    #[test]
    fn test_status_lists_root_version() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let store = seed(&config);

        let output = status(&store, &config, &TableFormatter).unwrap();
        assert!(output.contains("customers"));
        assert!(output.contains("No migration runs"));
    }

    #[test]
    fn test_newest_active_is_root_after_init() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let state = seed(&config).require().unwrap();
        assert_eq!(&newest_active(&state).unwrap(), state.changelog.root());
    }

    #[test]
    fn test_uninitialised_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let store = StateStore::open_path(&config.state_path).unwrap();
        assert!(matches!(
            status(&store, &config, &TableFormatter),
            Err(CommandError::NotInitialised(_))
        ));
    }

    #[test]
    fn test_missing_database_url() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        if config.resolve_database_url().is_none() {
            assert!(matches!(
                connect(&config),
                Err(CommandError::MissingDatabaseUrl(_))
            ));
        }
    }
}
