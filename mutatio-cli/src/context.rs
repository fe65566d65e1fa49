//! Everything a command needs, resolved once at startup.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use mutatio::dialect::Connection;
use mutatio::registry::CloseReport;
use mutatio::settings::DEFAULT_FILE_NAME;
use mutatio::state::ConfigEntry;
use mutatio::version::schema::{SchemaMigrator, SchemaReport};
use mutatio::{CancelToken, ConnectionRegistry, Dialect, Drivers, Error, Hooks, Settings, State, TargetConfig};

use crate::cli::GlobalArgs;

const STATE_FILE: &str = ".mutatio/state.json";
const DIRECT_CONFIG: &str = "default";
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Context {
    pub project: PathBuf,
    pub settings: Settings,
    pub state: State,
    state_path: PathBuf,
    private_key: Option<String>,
    pub registry: ConnectionRegistry,
    pub cancel: CancelToken,
    pub hooks: Hooks,
    pub user: String,
    args: GlobalArgs,
}

impl Context {
    pub fn new(args: GlobalArgs, settings: Settings, cancel: CancelToken) -> Result<Self, Error> {
        let project = args.project.clone();
        let state_path = args
            .state
            .clone()
            .unwrap_or_else(|| project.join(STATE_FILE));
        let state = load_state(&state_path, args.private_key.as_deref())?;
        let user = args
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .unwrap_or_else(|| "mutatio".to_string());

        let hooks = Hooks::new().on_error(|err| {
            tracing::error!(error = %err, "Tracking failure");
        });

        Ok(Self {
            project,
            settings,
            state,
            state_path,
            private_key: args.private_key.clone(),
            registry: ConnectionRegistry::new(Drivers::builtin()),
            cancel,
            hooks,
            user,
            args,
        })
    }

    pub fn settings_path(project: &Path) -> PathBuf {
        project.join(DEFAULT_FILE_NAME)
    }

    pub fn json(&self) -> bool {
        self.args.json
    }

    pub fn sql_dir(&self) -> PathBuf {
        self.settings.sql_dir(&self.project)
    }

    pub fn changes_dir(&self) -> PathBuf {
        self.settings.changes_dir(&self.project)
    }

    /// The database the command runs against.
    ///
    /// `--database` wins, then `--config`, then the stage's config, then the active config.
    pub fn target(&self) -> Result<TargetConfig, Error> {
        if let Some(url) = &self.args.database {
            let name = self.args.config.as_deref().unwrap_or(DIRECT_CONFIG);
            return Ok(TargetConfig::new(name, Dialect::from_str(&self.args.dialect)?, url.clone()));
        }
        let name = match (&self.args.config, &self.args.stage) {
            (Some(config), _) => Some(config.clone()),
            (None, Some(stage)) => Some(
                self.settings
                    .stages
                    .get(stage)
                    .ok_or_else(|| Error::Generic(format!("unknown stage '{}'", stage)))?
                    .config
                    .clone()
                    .unwrap_or_else(|| stage.clone()),
            ),
            (None, None) => None,
        };
        self.state.target(name.as_deref())
    }

    /// The stored entry behind `target`, if it came from the state file.
    pub fn entry(&self, target: &TargetConfig) -> Option<&ConfigEntry> {
        if self.args.database.is_some() {
            return None;
        }
        self.state.configs.get(&target.name)
    }

    /// Open the target and bring its tracking tables up to date.
    pub fn connect(&mut self, target: &TargetConfig) -> Result<(&mut dyn Connection, SchemaReport), Error> {
        let conn = self.registry.get(target)?;
        let report = SchemaMigrator::default().ensure_version(conn)?;
        Ok((conn, report))
    }

    pub fn save_state(&self) -> Result<(), Error> {
        let key = self
            .private_key
            .as_deref()
            .ok_or_else(|| Error::Generic("MUTATIO_PRIVATE_KEY is required to write the state file".to_string()))?;
        self.state.save(&self.state_path, key)
    }

    /// Add the current user to the known users, persisting when the state file is in use.
    pub fn remember_user(&mut self) -> Result<(), Error> {
        if self.private_key.is_none() || self.state.known_users.contains(&self.user) {
            return Ok(());
        }
        let user = self.user.clone();
        self.state.remember_user(&user);
        self.save_state()
    }

    pub fn shutdown(&mut self) -> CloseReport {
        self.registry.close_all(CLOSE_TIMEOUT)
    }
}

fn load_state(path: &Path, private_key: Option<&str>) -> Result<State, Error> {
    match private_key {
        Some(key) => State::load(path, key),
        None if path.exists() => Err(Error::Generic(format!(
            "{} is encrypted; set MUTATIO_PRIVATE_KEY",
            path.display()
        ))),
        None => Ok(State::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(project: &Path) -> GlobalArgs {
        GlobalArgs {
            project: project.to_path_buf(),
            dialect: "sqlite".to_string(),
            private_key: Some("secret".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn direct_database_flag_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut global = args(dir.path());
        global.database = Some(":memory:".to_string());
        let ctx = Context::new(global, Settings::default(), CancelToken::new()).unwrap();
        let target = ctx.target().unwrap();
        assert_eq!(target, TargetConfig::new("default", Dialect::Sqlite, ":memory:"));
        assert!(ctx.entry(&target).is_none());
    }

    #[test]
    fn stage_resolves_to_its_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut global = args(dir.path());
        global.stage = Some("prod".to_string());
        let mut settings = Settings::default();
        settings.stages.insert(
            "prod".to_string(),
            mutatio::settings::Stage {
                description: None,
                config: Some("primary".to_string()),
            },
        );
        let mut ctx = Context::new(global, settings, CancelToken::new()).unwrap();
        ctx.state.add_config(
            "primary",
            ConfigEntry {
                dialect: Dialect::Sqlite,
                url: ":memory:".to_string(),
                protected: true,
                is_test: false,
            },
        );
        let target = ctx.target().unwrap();
        assert_eq!(target.name, "primary");
        assert!(ctx.entry(&target).unwrap().protected);
    }

    #[test]
    fn encrypted_state_needs_a_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        State::default().save(&path, "secret").unwrap();
        assert!(load_state(&path, None).is_err());
        assert!(load_state(&path, Some("secret")).is_ok());
        assert_eq!(load_state(&dir.path().join("none.json"), None).unwrap(), State::default());
    }

    #[test]
    fn connect_creates_tracking_tables() {
        let dir = tempfile::tempdir().unwrap();
        let mut global = args(dir.path());
        global.database = Some(":memory:".to_string());
        let mut ctx = Context::new(global, Settings::default(), CancelToken::new()).unwrap();
        let target = ctx.target().unwrap();
        let (conn, report) = ctx.connect(&target).unwrap();
        assert_eq!(report.from_version, 0);
        assert!(conn.table_exists("mutatio_operations").unwrap());
        assert_eq!(ctx.shutdown().closed, vec!["default"]);
    }
}
