use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "mutatio", author, version, about = "Versioned SQL change manager", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Named config to run against (defaults to the active config)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<String>,

    /// Stage from the settings file; selects the stage's config
    #[arg(long, global = true, conflicts_with = "config")]
    pub stage: Option<String>,

    /// Project directory holding mutatio.toml
    #[arg(long, short = 'p', global = true, default_value = ".")]
    pub project: PathBuf,

    /// Dialect of --database
    #[arg(long, global = true, default_value = "sqlite")]
    pub dialect: String,

    /// Connect to this URL directly instead of a stored config
    #[arg(long, global = true, env = "MUTATIO_DATABASE_URL", hide_env_values = true)]
    pub database: Option<String>,

    /// Encrypted state file (defaults to <project>/.mutatio/state.json)
    #[arg(long, global = true)]
    pub state: Option<PathBuf>,

    /// Key for the state file
    #[arg(long, global = true, env = "MUTATIO_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,

    /// Identity recorded in the ledger and on locks (defaults to $USER)
    #[arg(long = "as", global = true, env = "MUTATIO_USER")]
    pub user: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply, revert and inspect change folders
    #[command(subcommand)]
    Change(ChangeCommand),
    /// Inspect and manage the per-config lock
    #[command(subcommand)]
    Lock(LockCommand),
    /// Execute build files
    #[command(subcommand)]
    Run(RunCommand),
    /// Database-wide operations
    #[command(subcommand)]
    Db(DbCommand),
    /// Manage named configs in the state file
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
pub enum ChangeCommand {
    /// Apply every pending change in order
    Ff {
        #[arg(long)]
        dry_run: bool,
        /// Keep going after a change fails
        #[arg(long)]
        continue_on_error: bool,
    },
    /// Apply one change
    Run {
        name: String,
        #[arg(long)]
        force: bool,
    },
    /// Revert one applied change
    Revert {
        name: String,
        /// Revert even if the change is not currently applied
        #[arg(long)]
        force: bool,
    },
    /// Revert the most recently applied changes
    Rewind {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Show change operations, newest first
    History {
        #[arg(long)]
        count: Option<usize>,
    },
    /// List changes on disk and in the ledger
    List,
}

#[derive(Subcommand, Debug)]
pub enum LockCommand {
    Status,
    Acquire {
        /// Seconds until the lock expires
        #[arg(long, default_value_t = 900)]
        ttl: u64,
        #[arg(long)]
        reason: Option<String>,
    },
    Release,
    /// Remove the lock whoever holds it
    Force,
}

#[derive(Subcommand, Debug)]
pub enum RunCommand {
    /// Run every build file that is new, changed or previously failed
    Build {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
        /// Keep going after a file fails
        #[arg(long)]
        continue_on_error: bool,
        /// Threads used to hash files
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
        /// Only run files under these prefixes
        #[arg(long = "only")]
        include: Vec<String>,
    },
    /// Run a single file
    File {
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum DbCommand {
    /// Drop every user table and mark history stale
    Teardown {
        /// Required unless the config is marked as a test config
        #[arg(long)]
        yes: bool,
    },
    /// Show metadata versions for every layer
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    Add {
        name: String,
        #[arg(long)]
        dialect: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        protected: bool,
        #[arg(long)]
        test: bool,
    },
    List,
    /// Make a config the active one
    Use { name: String },
}

impl Commands {
    /// Commands that change the target database and so run under the lock.
    pub fn mutates(&self) -> bool {
        match self {
            Commands::Change(cmd) => !matches!(
                cmd,
                ChangeCommand::History { .. } | ChangeCommand::List | ChangeCommand::Ff { dry_run: true, .. }
            ),
            Commands::Run(RunCommand::Build { dry_run, .. }) => !dry_run,
            Commands::Run(RunCommand::File { .. }) => true,
            Commands::Db(DbCommand::Teardown { .. }) => true,
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Commands::Change(ChangeCommand::Ff { .. }) => "change ff",
            Commands::Change(ChangeCommand::Run { .. }) => "change run",
            Commands::Change(ChangeCommand::Revert { .. }) => "change revert",
            Commands::Change(ChangeCommand::Rewind { .. }) => "change rewind",
            Commands::Change(ChangeCommand::History { .. }) => "change history",
            Commands::Change(ChangeCommand::List) => "change list",
            Commands::Lock(_) => "lock",
            Commands::Run(RunCommand::Build { .. }) => "run build",
            Commands::Run(RunCommand::File { .. }) => "run file",
            Commands::Db(DbCommand::Teardown { .. }) => "db teardown",
            Commands::Db(DbCommand::Version) => "db version",
            Commands::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "mutatio", "change", "revert", "001_users", "--force", "--json", "--config", "dev",
        ])
        .unwrap();
        assert!(cli.global.json);
        assert_eq!(cli.global.config.as_deref(), Some("dev"));
        match cli.command {
            Commands::Change(ChangeCommand::Revert { name, force }) => {
                assert_eq!(name, "001_users");
                assert!(force);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn lock_acquire_defaults_to_fifteen_minutes() {
        let cli = Cli::try_parse_from(["mutatio", "lock", "acquire", "--reason", "deploy"]).unwrap();
        match cli.command {
            Commands::Lock(LockCommand::Acquire { ttl, reason }) => {
                assert_eq!(ttl, 900);
                assert_eq!(reason.as_deref(), Some("deploy"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn stage_and_config_conflict() {
        assert!(Cli::try_parse_from(["mutatio", "db", "version", "--stage", "prod", "--config", "dev"]).is_err());
    }

    #[test]
    fn which_commands_take_the_lock() {
        let mutates = |args: &[&str]| Cli::try_parse_from(args).unwrap().command.mutates();
        assert!(mutates(&["mutatio", "change", "ff"]));
        assert!(!mutates(&["mutatio", "change", "ff", "--dry-run"]));
        assert!(!mutates(&["mutatio", "change", "list"]));
        assert!(mutates(&["mutatio", "run", "build"]));
        assert!(!mutates(&["mutatio", "run", "build", "--dry-run"]));
        assert!(mutates(&["mutatio", "db", "teardown", "--yes"]));
        assert!(!mutates(&["mutatio", "lock", "status"]));
    }
}
