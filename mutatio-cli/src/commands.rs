//! Command handlers. Each returns a [`Report`]; errors bubble up to `main`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use mutatio::dialect::Connection;
use mutatio::lock::DEFAULT_TTL;
use mutatio::settings::BuildSettings;
use mutatio::state::ConfigEntry;
use mutatio::teardown::teardown;
use mutatio::version::schema::SchemaMigrator;
use mutatio::version::{self, VersionCheck};
use mutatio::{
    CancelToken, ChangeManager, ChangeTracker, Dialect, Error, Hooks, LockManager, OperationTracker,
    RunOptions, Runner, TargetConfig,
};
use serde_json::json;

use crate::cli::{ChangeCommand, Commands, ConfigCommand, DbCommand, LockCommand, RunCommand};
use crate::context::Context;
use crate::output::{self, Report};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Owned copies of what handlers need once the connection has borrowed the context.
struct Scope {
    target: TargetConfig,
    entry: Option<ConfigEntry>,
    hooks: Hooks,
    user: String,
    cancel: CancelToken,
    sql_dir: PathBuf,
    changes_dir: PathBuf,
    build: BuildSettings,
    state_version: u32,
    settings_version: u32,
}

impl Scope {
    fn from_context(ctx: &Context) -> std::result::Result<Self, Error> {
        let target = ctx.target()?;
        Ok(Self {
            entry: ctx.entry(&target).cloned(),
            target,
            hooks: ctx.hooks.clone(),
            user: ctx.user.clone(),
            cancel: ctx.cancel.clone(),
            sql_dir: ctx.sql_dir(),
            changes_dir: ctx.changes_dir(),
            build: ctx.settings.build.clone(),
            state_version: ctx.state.version,
            settings_version: ctx.settings.version,
        })
    }

    fn options(&self) -> RunOptions {
        RunOptions {
            executed_by: self.user.clone(),
            ..RunOptions::default()
        }
    }

    fn changes(&self, options: RunOptions) -> ChangeManager {
        ChangeManager::new(
            ChangeTracker::new(&self.target.name, self.hooks.clone()),
            self.changes_dir.clone(),
            self.sql_dir.clone(),
            options,
        )
        .with_cancel(self.cancel.clone())
    }

    fn runner(&self, options: RunOptions) -> Runner {
        Runner::new(OperationTracker::new(&self.target.name, self.hooks.clone()), options)
            .with_cancel(self.cancel.clone())
    }

    fn locks(&self) -> LockManager {
        LockManager::new(self.hooks.clone())
    }
}

pub fn execute(ctx: &mut Context, command: Commands) -> Result<Report> {
    if let Commands::Config(cmd) = command {
        return config(ctx, cmd);
    }

    ctx.remember_user()?;
    let scope = Scope::from_context(ctx)?;
    let mutates = command.mutates();
    let label = command.label();
    let (conn, schema) = ctx.connect(&scope.target)?;
    if !schema.migrations_run.is_empty() {
        tracing::info!(
            config = %scope.target.name,
            from = schema.from_version,
            to = schema.to_version,
            "Tracking tables migrated"
        );
    }

    if !mutates {
        return dispatch(conn, &scope, command);
    }
    with_lock(conn, &scope, label, |conn| dispatch(conn, &scope, command))
}

/// Hold the config lock for the duration of `f`. A lock the user already held beforehand is
/// left in place.
fn with_lock<T>(
    conn: &mut dyn Connection,
    scope: &Scope,
    label: &str,
    f: impl FnOnce(&mut dyn Connection) -> Result<T>,
) -> Result<T> {
    let locks = scope.locks();
    let config = scope.target.name.as_str();
    let now = locks.database_now(conn)?;
    let status = locks.status(conn, config)?;
    let already_held = status.holder.as_deref() == Some(scope.user.as_str()) && !status.is_expired_at(now);

    locks.acquire(conn, config, &scope.user, DEFAULT_TTL, Some(label))?;
    let result = f(&mut *conn);
    if !already_held {
        if let Err(err) = locks.release(conn, config, &scope.user) {
            tracing::warn!(config, error = %err, "Failed to release lock after command");
        }
    }
    result
}

fn dispatch(conn: &mut dyn Connection, scope: &Scope, command: Commands) -> Result<Report> {
    match command {
        Commands::Change(cmd) => change(conn, scope, cmd),
        Commands::Lock(cmd) => lock(conn, scope, cmd),
        Commands::Run(cmd) => run(conn, scope, cmd),
        Commands::Db(cmd) => db(conn, scope, cmd),
        Commands::Config(_) => Err("config commands do not use a connection".into()),
    }
}

fn change(conn: &mut dyn Connection, scope: &Scope, cmd: ChangeCommand) -> Result<Report> {
    let report = match cmd {
        ChangeCommand::Ff {
            dry_run,
            continue_on_error,
        } => {
            let manager = scope.changes(RunOptions {
                dry_run,
                abort_on_error: !continue_on_error,
                ..scope.options()
            });
            let batch = manager.ff(conn)?;
            Report::new(batch.is_success(), &batch, output::batch("change ff", &batch))?
        }
        ChangeCommand::Run { name, force } => {
            let manager = scope.changes(RunOptions {
                force,
                ..scope.options()
            });
            let item = manager.run(conn, &name)?;
            Report::new(!item.is_failed(), &item, output::item(&item))?
        }
        ChangeCommand::Revert { name, force } => {
            let manager = scope.changes(RunOptions {
                force,
                ..scope.options()
            });
            let item = manager.revert(conn, &name)?;
            Report::new(!item.is_failed(), &item, output::item(&item))?
        }
        ChangeCommand::Rewind { count } => {
            let batch = scope.changes(scope.options()).rewind(conn, count)?;
            Report::new(batch.is_success(), &batch, output::batch("change rewind", &batch))?
        }
        ChangeCommand::History { count } => {
            let records = scope.changes(scope.options()).history(conn, count)?;
            Report::new(true, &records, output::history(&records))?
        }
        ChangeCommand::List => {
            let listing = scope.changes(scope.options()).list(conn)?;
            Report::new(true, &listing, output::listing(&listing))?
        }
    };
    Ok(report)
}

fn lock(conn: &mut dyn Connection, scope: &Scope, cmd: LockCommand) -> Result<Report> {
    let locks = scope.locks();
    let config = scope.target.name.as_str();
    let report = match cmd {
        LockCommand::Status => {
            let now = locks.database_now(conn)?;
            let status = locks.status(conn, config)?;
            let text = output::lock_status(config, &status, now);
            let expired = status.is_expired_at(now);
            Report::new(
                true,
                &json!({ "config": config, "status": status, "expired": expired }),
                text,
            )?
        }
        LockCommand::Acquire { ttl, reason } => {
            let record = locks.acquire(conn, config, &scope.user, Duration::from_secs(ttl), reason.as_deref())?;
            let text = format!(
                "{}: locked by {} until {}\n",
                config,
                record.locked_by,
                record.expires_at.to_rfc3339()
            );
            Report::new(true, &record, text)?
        }
        LockCommand::Release => {
            let outcome = locks.release(conn, config, &scope.user)?;
            let text = match outcome {
                mutatio::ReleaseOutcome::Released => format!("{}: released\n", config),
                mutatio::ReleaseOutcome::NotLocked => format!("{}: was not locked\n", config),
            };
            Report::new(true, &json!({ "config": config, "outcome": outcome }), text)?
        }
        LockCommand::Force => {
            let previous = locks.force_release(conn, config)?;
            let text = match &previous {
                Some(record) => format!("{}: removed lock held by {}\n", config, record.locked_by),
                None => format!("{}: was not locked\n", config),
            };
            Report::new(true, &json!({ "config": config, "previous": previous }), text)?
        }
    };
    Ok(report)
}

fn run(conn: &mut dyn Connection, scope: &Scope, cmd: RunCommand) -> Result<Report> {
    let report = match cmd {
        RunCommand::Build {
            force,
            dry_run,
            continue_on_error,
            concurrency,
            include,
        } => {
            let runner = scope.runner(RunOptions {
                force,
                dry_run,
                abort_on_error: !continue_on_error,
                concurrency,
                ..scope.options()
            });
            let filters = BuildSettings {
                include: if include.is_empty() {
                    scope.build.include.clone()
                } else {
                    include
                },
                exclude: scope.build.exclude.clone(),
            };
            let batch = runner.run_build(conn, &scope.sql_dir, &filters)?;
            Report::new(batch.is_success(), &batch, output::batch("run build", &batch))?
        }
        RunCommand::File { path, force } => {
            let runner = scope.runner(RunOptions {
                force,
                ..scope.options()
            });
            let item = runner.run_file(conn, &scope.sql_dir, &path)?;
            Report::new(!item.is_failed(), &item, output::item(&item))?
        }
    };
    Ok(report)
}

fn db(conn: &mut dyn Connection, scope: &Scope, cmd: DbCommand) -> Result<Report> {
    match cmd {
        DbCommand::Teardown { yes } => {
            let (protected, is_test) = scope
                .entry
                .as_ref()
                .map(|e| (e.protected, e.is_test))
                .unwrap_or((false, false));
            if protected {
                return Err(format!("config '{}' is protected; refusing to tear it down", scope.target.name).into());
            }
            if !yes && !is_test {
                return Err(format!(
                    "teardown drops every table in '{}'; pass --yes to confirm",
                    scope.target.name
                )
                .into());
            }
            let changes = ChangeTracker::new(&scope.target.name, scope.hooks.clone());
            let report = teardown(conn, &changes)?;
            let mut text = format!(
                "Dropped {} table(s); {} ledger record(s) marked stale\n",
                report.dropped.len(),
                report.stale_count
            );
            for (table, error) in &report.failed {
                text.push_str(&format!("Could not drop {}: {}\n", table, error));
            }
            Ok(Report::new(report.is_complete(), &report, text)?)
        }
        DbCommand::Version => {
            let schema = SchemaMigrator::default().check_version(conn)?;
            let state = VersionCheck::new(scope.state_version, version::state::coordinator()?.expected_version());
            let settings = VersionCheck::new(
                scope.settings_version,
                version::settings::coordinator()?.expected_version(),
            );
            let value = json!({
                "config": scope.target.name,
                "schema": schema,
                "state": state,
                "settings": settings,
            });
            let text = [("schema", schema), ("state", state), ("settings", settings)]
                .iter()
                .map(|(layer, check)| format!("{:<9} v{} (expected v{})\n", layer, check.current, check.expected))
                .collect();
            Ok(Report::new(true, &value, text)?)
        }
    }
}

fn config(ctx: &mut Context, cmd: ConfigCommand) -> Result<Report> {
    let report = match cmd {
        ConfigCommand::Add {
            name,
            dialect,
            url,
            protected,
            test,
        } => {
            let entry = ConfigEntry {
                dialect: Dialect::from_str(&dialect)?,
                url,
                protected,
                is_test: test,
            };
            ctx.state.add_config(name.clone(), entry);
            ctx.save_state()?;
            Report::new(true, &json!({ "added": name }), format!("Added config '{}'\n", name))?
        }
        ConfigCommand::List => {
            let active = ctx.state.active_config.as_deref();
            let configs: Vec<_> = ctx
                .state
                .configs
                .iter()
                .map(|(name, entry)| {
                    json!({
                        "name": name,
                        "dialect": entry.dialect,
                        "protected": entry.protected,
                        "isTest": entry.is_test,
                        "active": Some(name.as_str()) == active,
                    })
                })
                .collect();
            let text = ctx
                .state
                .configs
                .iter()
                .map(|(name, entry)| {
                    let marker = if Some(name.as_str()) == active { "*" } else { " " };
                    let protected = if entry.protected { " (protected)" } else { "" };
                    format!("{} {:<20} {}{}\n", marker, name, entry.dialect, protected)
                })
                .collect::<String>();
            Report::new(true, &configs, text)?
        }
        ConfigCommand::Use { name } => {
            if !ctx.state.configs.contains_key(&name) {
                return Err(format!("unknown config '{}'", name).into());
            }
            ctx.state.active_config = Some(name.clone());
            ctx.save_state()?;
            Report::new(true, &json!({ "active": name }), format!("Active config is now '{}'\n", name))?
        }
    };
    Ok(report)
}
