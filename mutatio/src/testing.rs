//! Test harness for exercising projects against a throwaway SQLite database.
//!
//! ```
//! # #[cfg(not(feature = "testing"))]
//! # fn main() {}
//! # #[cfg(feature = "testing")]
//! # fn main() -> Result<(), mutatio::Error> {
//! use mutatio::runner::RunOptions;
//! use mutatio::testing::TestProject;
//!
//! let mut project = TestProject::new()?;
//! project.write_sql("tables/users.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);")?;
//!
//! let runner = project.runner(RunOptions::default());
//! let (conn, root) = project.connection_and_sql_dir();
//! let batch = runner.run_build(conn, &root, &Default::default())?;
//! assert_eq!(batch.executed, 1);
//! project.assert_table_exists("users")?;
//! # Ok(())
//! # }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::change::ChangeManager;
use crate::dialect::sqlite::SqliteConnection;
use crate::dialect::Connection;
use crate::error::Error;
use crate::hooks::Hooks;
use crate::runner::{RunOptions, Runner};
use crate::settings::Settings;
use crate::tracker::{ChangeTracker, OperationTracker};
use crate::version::schema::{SchemaMigrator, TABLE_PREFIX};

pub const TEST_CONFIG: &str = "test";

/// A temporary project directory paired with an in-memory database whose tracking tables are
/// already created.
pub struct TestProject {
    dir: TempDir,
    conn: SqliteConnection,
    settings: Settings,
    hooks: Hooks,
}

impl TestProject {
    pub fn new() -> Result<Self, Error> {
        Self::with_hooks(Hooks::default())
    }

    pub fn with_hooks(hooks: Hooks) -> Result<Self, Error> {
        let mut conn = SqliteConnection::open_in_memory()?;
        SchemaMigrator::default().migrate(&mut conn)?;
        Ok(Self {
            dir: tempfile::tempdir()?,
            conn,
            settings: Settings::default(),
            hooks,
        })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn sql_dir(&self) -> PathBuf {
        self.settings.sql_dir(self.root())
    }

    pub fn changes_dir(&self) -> PathBuf {
        self.settings.changes_dir(self.root())
    }

    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    /// The connection together with the sql root, for calls that need both.
    pub fn connection_and_sql_dir(&mut self) -> (&mut SqliteConnection, PathBuf) {
        let sql = self.sql_dir();
        (&mut self.conn, sql)
    }

    fn write(path: &Path, text: &str) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, text)?;
        Ok(())
    }

    /// Write a build file relative to the sql root.
    pub fn write_sql(&self, name: &str, sql: &str) -> Result<PathBuf, Error> {
        let path = self.sql_dir().join(name);
        Self::write(&path, sql)?;
        Ok(path)
    }

    /// Create a change folder with a single forward script and an optional revert script.
    pub fn write_change(&self, name: &str, forward: &str, revert: Option<&str>) -> Result<(), Error> {
        let dir = self.changes_dir().join(name);
        Self::write(&dir.join("change").join("01.sql"), forward)?;
        if let Some(revert) = revert {
            Self::write(&dir.join("revert").join("01.sql"), revert)?;
        }
        Ok(())
    }

    /// Add a manifest to the forward side of `change`.
    pub fn write_manifest(&self, change: &str, file_name: &str, entries: &[&str]) -> Result<(), Error> {
        let path = self.changes_dir().join(change).join("change").join(file_name);
        Self::write(&path, &format!("{}\n", entries.join("\n")))
    }

    pub fn tracker(&self) -> OperationTracker {
        OperationTracker::new(TEST_CONFIG, self.hooks.clone())
    }

    pub fn change_tracker(&self) -> ChangeTracker {
        ChangeTracker::new(TEST_CONFIG, self.hooks.clone())
    }

    pub fn runner(&self, options: RunOptions) -> Runner {
        Runner::new(self.tracker(), options)
    }

    pub fn change_manager(&self, options: RunOptions) -> ChangeManager {
        ChangeManager::new(self.change_tracker(), self.changes_dir(), self.sql_dir(), options)
    }

    /// Tables other than mutatio's own.
    pub fn user_tables(&mut self) -> Result<Vec<String>, Error> {
        Ok(self
            .conn
            .list_tables()?
            .into_iter()
            .filter(|t| !t.starts_with(TABLE_PREFIX))
            .collect())
    }

    pub fn assert_table_exists(&mut self, table: &str) -> Result<(), Error> {
        if !self.conn.table_exists(table)? {
            return Err(Error::Generic(format!("Table '{}' does not exist", table)));
        }
        Ok(())
    }

    pub fn assert_table_not_exists(&mut self, table: &str) -> Result<(), Error> {
        if self.conn.table_exists(table)? {
            return Err(Error::Generic(format!("Table '{}' exists", table)));
        }
        Ok(())
    }
}
