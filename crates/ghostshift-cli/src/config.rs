//! CLI configuration.

use crate::formatter::OutputFormat;
use clap::{Parser, Subcommand};
use ghostshift_core::{BackfillConfig, MigrationConfig};
use std::path::PathBuf;

/// Default directory of the sled state store.
pub const DEFAULT_STATE_PATH: &str = "./.ghostshift";

/// Default rows copied per backfill batch.
pub const DEFAULT_BATCH_SIZE: usize = BackfillConfig::DEFAULT_BATCH_SIZE;

/// Default pause between backfill batches in milliseconds.
pub const DEFAULT_BATCH_DELAY_MS: u64 = BackfillConfig::DEFAULT_BATCH_DELAY_MS;

/// Environment variable consulted when no database URL is given.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Ghostshift CLI configuration.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// PostgreSQL connection URL.
    pub database_url: Option<String>,

    /// Path to the state store directory.
    pub state_path: PathBuf,

    /// Rows copied per backfill batch.
    pub batch_size: usize,

    /// Pause between backfill batches in milliseconds.
    pub batch_delay_ms: u64,

    /// Generate `INSERT ... ON CONFLICT` sync functions.
    pub use_upsert: bool,

    /// Output format for reports.
    pub format: OutputFormat,
}

impl CliConfig {
    /// Create a configuration with the given state path.
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            database_url: None,
            state_path: state_path.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay_ms: DEFAULT_BATCH_DELAY_MS,
            use_upsert: true,
            format: OutputFormat::Table,
        }
    }

    /// Set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Set the backfill batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the pause between backfill batches.
    pub fn with_batch_delay_ms(mut self, delay: u64) -> Self {
        self.batch_delay_ms = delay;
        self
    }

    /// Generate update-then-insert sync functions instead of upserts.
    pub fn without_upsert(mut self) -> Self {
        self.use_upsert = false;
        self
    }

    /// Set the output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// The database URL, falling back to `DATABASE_URL`.
    pub fn resolve_database_url(&self) -> Option<String> {
        self.database_url
            .clone()
            .or_else(|| std::env::var(DATABASE_URL_ENV).ok())
            .filter(|url| !url.trim().is_empty())
    }

    /// Executor settings for a migration run.
    pub fn migration_config(&self, dry_run: bool) -> MigrationConfig {
        MigrationConfig {
            backfill: BackfillConfig {
                batch_size: self.batch_size,
                batch_delay_ms: self.batch_delay_ms,
            },
            use_upsert: self.use_upsert,
            dry_run,
        }
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_PATH)
    }
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "ghostshift")]
#[command(version, about = "Zero-downtime schema migrations for PostgreSQL", long_about = None)]
pub struct Args {
    /// PostgreSQL connection URL (defaults to $DATABASE_URL).
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Path to the state store directory.
    #[arg(long, global = true, default_value = DEFAULT_STATE_PATH)]
    pub state_path: PathBuf,

    /// Rows copied per backfill batch.
    #[arg(long, global = true, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Pause between backfill batches in milliseconds.
    #[arg(long, global = true, default_value_t = DEFAULT_BATCH_DELAY_MS)]
    pub batch_delay_ms: u64,

    /// Generate update-then-insert sync functions instead of upserts.
    #[arg(long, global = true)]
    pub no_upsert: bool,

    /// Output format.
    #[arg(long, global = true, default_value = "table", value_enum)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Operator commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Introspect the database and record its schema as the root version.
    Init,
    /// Append a change set read from a JSON file of schema operations.
    Changeset {
        /// JSON file holding a list of schema operations.
        #[arg(long)]
        file: PathBuf,
        /// Author recorded with the change set.
        #[arg(long, default_value = "ghostshift")]
        author: String,
        /// Free-form description.
        #[arg(long)]
        description: Option<String>,
    },
    /// Print the migration plan between two versions without executing it.
    Plan {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// Migrate to a version, keeping the source version usable.
    Fork {
        /// Target version.
        #[arg(long)]
        to: String,
        /// Source version (defaults to the newest active version).
        #[arg(long)]
        from: Option<String>,
        /// Plan and validate against the database without executing anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Retire a version and the tables only it uses.
    Drop {
        #[arg(long)]
        version: String,
    },
    /// Show versions, their tables and recent migration runs.
    Status,
}

impl Args {
    /// Split the arguments into the configuration and the command to run.
    pub fn into_config(self) -> (CliConfig, Command) {
        let mut config = CliConfig::new(self.state_path)
            .with_batch_size(self.batch_size)
            .with_batch_delay_ms(self.batch_delay_ms)
            .with_format(self.format);

        if let Some(url) = self.database_url {
            config = config.with_database_url(url);
        }
        if self.no_upsert {
            config = config.without_upsert();
        }

        (config, self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CliConfig::default();
        assert_eq!(config.state_path, PathBuf::from(DEFAULT_STATE_PATH));
        assert_eq!(config.batch_size, 2000);
        assert_eq!(config.batch_delay_ms, 50);
        assert!(config.use_upsert);
    }

    #[test]
    fn test_args_into_config() {
        let args = Args::parse_from([
            "ghostshift",
            "--database-url",
            "postgres://localhost/shop",
            "--batch-size",
            "500",
            "--no-upsert",
            "fork",
            "--to",
            "v2",
        ]);
        let (config, command) = args.into_config();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/shop"));
        assert_eq!(config.batch_size, 500);
        assert!(!config.use_upsert);
        assert_eq!(
            command,
            Command::Fork {
                to: "v2".to_string(),
                from: None,
                dry_run: false,
            }
        );

        let migration = config.migration_config(false);
        assert_eq!(migration.backfill.batch_size, 500);
        assert!(!migration.use_upsert);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::parse_from(["ghostshift", "status", "--state-path", "/tmp/gs"]);
        let (config, command) = args.into_config();
        assert_eq!(config.state_path, PathBuf::from("/tmp/gs"));
        assert_eq!(command, Command::Status);
    }

    #[test]
    fn test_batch_size_floor() {
        assert_eq!(CliConfig::default().with_batch_size(0).batch_size, 1);
    }
}
