//! The tracking tables mutatio keeps inside every target database.
//!
//! Unlike the payload layers, this layer migrates a live database. Each step is DDL run through
//! the dialect adapter, and the version marker row is rewritten after every step that succeeds,
//! so a failure part way through a chain leaves the marker at the last step that actually ran.

use std::time::Instant;

use chrono::Utc;

use super::{validate_versions, Layer, VersionCheck};
use crate::dialect::{Connection, Dialect};
use crate::error::Error;

pub const OPERATIONS_TABLE: &str = "mutatio_operations";
pub const LOCKS_TABLE: &str = "mutatio_locks";
pub const VERSION_TABLE: &str = "mutatio_version";
const OPERATIONS_LOOKUP_INDEX: &str = "mutatio_operations_lookup";

/// Prefix shared by every table mutatio owns; teardown leaves these alone.
pub const TABLE_PREFIX: &str = "mutatio_";

/// A DDL step for the tracking tables.
pub trait SchemaMigration: Send + Sync {
    fn version(&self) -> u32;

    fn name(&self) -> String {
        format!("Migration {}", self.version())
    }

    /// Apply the step. Must succeed when the objects it creates already exist.
    fn up(&self, conn: &mut dyn Connection) -> Result<(), Error>;
}

impl std::fmt::Debug for dyn SchemaMigration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaMigration")
            .field("version", &self.version())
            .field("name", &self.name())
            .finish()
    }
}

struct CreateOperationsTable;

impl SchemaMigration for CreateOperationsTable {
    fn version(&self) -> u32 {
        1
    }

    fn name(&self) -> String {
        "create operations ledger".to_string()
    }

    fn up(&self, conn: &mut dyn Connection) -> Result<(), Error> {
        let d = conn.dialect();
        if !conn.table_exists(OPERATIONS_TABLE)? {
            conn.execute(
                &format!(
                    "CREATE TABLE {table} (\
                     {id}, \
                     name {key} NOT NULL, \
                     kind {key} NOT NULL, \
                     direction {key} NOT NULL, \
                     config_name {key} NOT NULL, \
                     checksum {key} NOT NULL, \
                     status {key} NOT NULL, \
                     executed_by {key} NOT NULL, \
                     started_at {key} NOT NULL, \
                     duration_ms BIGINT NOT NULL, \
                     error_message {text})",
                    table = OPERATIONS_TABLE,
                    id = d.id_column(),
                    key = d.key_type(),
                    text = d.text_type(),
                ),
                &[],
            )?;
        }
        if !conn.index_exists(OPERATIONS_TABLE, OPERATIONS_LOOKUP_INDEX)? {
            conn.execute(
                &format!(
                    "CREATE INDEX {index} ON {table} (config_name, name, kind)",
                    index = OPERATIONS_LOOKUP_INDEX,
                    table = OPERATIONS_TABLE
                ),
                &[],
            )?;
        }
        Ok(())
    }
}

struct CreateLocksTable;

impl SchemaMigration for CreateLocksTable {
    fn version(&self) -> u32 {
        2
    }

    fn name(&self) -> String {
        "create lock table".to_string()
    }

    fn up(&self, conn: &mut dyn Connection) -> Result<(), Error> {
        if conn.table_exists(LOCKS_TABLE)? {
            return Ok(());
        }
        let d = conn.dialect();
        conn.execute(
            &format!(
                "CREATE TABLE {table} (\
                 config_name {key} NOT NULL PRIMARY KEY, \
                 locked_by {key} NOT NULL, \
                 locked_at BIGINT NOT NULL, \
                 expires_at BIGINT NOT NULL, \
                 reason {text})",
                table = LOCKS_TABLE,
                key = d.key_type(),
                text = d.text_type(),
            ),
            &[],
        )?;
        Ok(())
    }
}

/// The tracking-table chain shipped with this build.
pub fn migrations() -> Vec<Box<dyn SchemaMigration>> {
    vec![Box::new(CreateOperationsTable), Box::new(CreateLocksTable)]
}

/// Outcome of bringing the tracking tables up to date.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaReport {
    pub from_version: u32,
    pub to_version: u32,
    pub migrations_run: Vec<u32>,
}

pub struct SchemaMigrator {
    migrations: Vec<Box<dyn SchemaMigration>>,
    expected: u32,
}

impl std::fmt::Debug for SchemaMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaMigrator")
            .field("migrations", &self.migrations)
            .field("expected", &self.expected)
            .finish()
    }
}

impl Default for SchemaMigrator {
    fn default() -> Self {
        Self::new(migrations())
    }
}

impl SchemaMigrator {
    /// Create a new SchemaMigrator, validating migration invariants.
    pub fn try_new(migrations: Vec<Box<dyn SchemaMigration>>) -> Result<Self, String> {
        let expected = validate_versions(migrations.iter().map(|m| m.version()).collect())?;
        let mut migrations = migrations;
        migrations.sort_by_key(|m| m.version());
        Ok(Self {
            migrations,
            expected,
        })
    }

    /// Create a new SchemaMigrator, panicking if migration metadata is invalid.
    /// For a non-panicking version, use `try_new`.
    pub fn new(migrations: Vec<Box<dyn SchemaMigration>>) -> Self {
        match Self::try_new(migrations) {
            Ok(migrator) => migrator,
            Err(err) => panic!("{}", err),
        }
    }

    pub fn expected_version(&self) -> u32 {
        self.expected
    }

    /// Read the marker. Returns 0 when the tracking tables were never created.
    pub fn current_version(&self, conn: &mut dyn Connection) -> Result<u32, Error> {
        if !conn.table_exists(VERSION_TABLE)? {
            return Ok(0);
        }
        let rows = conn.query(&format!("SELECT MAX(version) FROM {}", VERSION_TABLE), &[])?;
        let version = match rows.first() {
            Some(row) => row.get_opt_i64(0)?.unwrap_or(0),
            None => 0,
        };
        Ok(version as u32)
    }

    pub fn check_version(&self, conn: &mut dyn Connection) -> Result<VersionCheck, Error> {
        Ok(VersionCheck::new(self.current_version(conn)?, self.expected))
    }

    fn ensure_version_table(&self, conn: &mut dyn Connection) -> Result<(), Error> {
        if conn.table_exists(VERSION_TABLE)? {
            return Ok(());
        }
        let d = conn.dialect();
        conn.execute(
            &format!(
                "CREATE TABLE {} (version BIGINT NOT NULL, applied_at {} NOT NULL)",
                VERSION_TABLE,
                d.key_type()
            ),
            &[],
        )?;
        Ok(())
    }

    fn write_marker(&self, conn: &mut dyn Connection, version: u32) -> Result<(), Error> {
        let d: Dialect = conn.dialect();
        let applied_at = Utc::now().to_rfc3339();
        conn.execute(&format!("DELETE FROM {}", VERSION_TABLE), &[])?;
        conn.execute(
            &format!(
                "INSERT INTO {} (version, applied_at) VALUES ({})",
                VERSION_TABLE,
                d.placeholders(2)
            ),
            &[(version as i64).into(), applied_at.into()],
        )?;
        Ok(())
    }

    /// Apply every pending step, advancing the marker after each one.
    pub fn migrate(&self, conn: &mut dyn Connection) -> Result<SchemaReport, Error> {
        let check = self.check_version(conn)?;
        if check.is_newer {
            return Err(Error::VersionMismatch {
                layer: Layer::Schema,
                stored: check.current,
                expected: check.expected,
            });
        }
        self.ensure_version_table(conn)?;

        tracing::debug!(
            current_version = check.current,
            expected_version = check.expected,
            "Considering tracking schema migrations"
        );

        let mut migrations_run = Vec::new();
        for migration in self
            .migrations
            .iter()
            .filter(|m| m.version() > check.current)
        {
            let _span = tracing::info_span!(
                "schema_migration",
                version = migration.version(),
                name = %migration.name()
            )
            .entered();
            tracing::info!("Starting migration");
            let started = Instant::now();

            if let Err(e) = migration.up(conn) {
                tracing::error!(error = %e, "Migration failed");
                return Err(Error::Migration {
                    layer: Layer::Schema,
                    version: migration.version(),
                    cause: e.to_string(),
                });
            }
            self.write_marker(conn, migration.version())?;
            migrations_run.push(migration.version());

            tracing::info!(
                duration_ms = started.elapsed().as_millis() as u64,
                "Migration completed successfully"
            );
        }

        Ok(SchemaReport {
            from_version: check.current,
            to_version: migrations_run.last().copied().unwrap_or(check.current),
            migrations_run,
        })
    }

    /// Migrate only when behind; refuse when ahead.
    pub fn ensure_version(&self, conn: &mut dyn Connection) -> Result<SchemaReport, Error> {
        let check = self.check_version(conn)?;
        if check.needs_migration || check.is_newer {
            return self.migrate(conn);
        }
        Ok(SchemaReport {
            from_version: check.current,
            to_version: check.current,
            migrations_run: vec![],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::sqlite::SqliteConnection;

    struct Broken;

    impl SchemaMigration for Broken {
        fn version(&self) -> u32 {
            3
        }
        fn up(&self, conn: &mut dyn Connection) -> Result<(), Error> {
            conn.execute("ALTER TABLE nowhere ADD COLUMN x INTEGER", &[])?;
            Ok(())
        }
    }

    #[test]
    fn creates_tracking_tables_from_clean() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let report = SchemaMigrator::default().migrate(&mut conn).unwrap();
        assert_eq!(
            report,
            SchemaReport {
                from_version: 0,
                to_version: 2,
                migrations_run: vec![1, 2]
            }
        );
        assert_eq!(
            conn.list_tables().unwrap(),
            vec![LOCKS_TABLE, OPERATIONS_TABLE, VERSION_TABLE]
        );
    }

    #[test]
    fn existing_ledger_without_index_gets_one() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE mutatio_operations (id INTEGER PRIMARY KEY, name TEXT NOT NULL, \
             kind TEXT NOT NULL, direction TEXT NOT NULL, config_name TEXT NOT NULL, \
             checksum TEXT NOT NULL, status TEXT NOT NULL, executed_by TEXT NOT NULL, \
             started_at TEXT NOT NULL, duration_ms BIGINT NOT NULL, error_message TEXT)",
            &[],
        )
        .unwrap();
        assert!(!conn.index_exists(OPERATIONS_TABLE, "mutatio_operations_lookup").unwrap());

        SchemaMigrator::default().migrate(&mut conn).unwrap();
        assert!(conn.index_exists(OPERATIONS_TABLE, "mutatio_operations_lookup").unwrap());
        CreateOperationsTable.up(&mut conn).unwrap();
    }

    #[test]
    fn second_run_is_a_no_op() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let migrator = SchemaMigrator::default();
        migrator.ensure_version(&mut conn).unwrap();
        let report = migrator.ensure_version(&mut conn).unwrap();
        assert!(report.migrations_run.is_empty());
        assert_eq!(migrator.current_version(&mut conn).unwrap(), 2);
        // Re-running the chain over existing tables tolerates them.
        conn.execute(&format!("DELETE FROM {}", VERSION_TABLE), &[])
            .unwrap();
        assert_eq!(migrator.migrate(&mut conn).unwrap().migrations_run, vec![1, 2]);
    }

    #[test]
    fn failure_leaves_marker_at_last_good_step() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let mut chain = migrations();
        chain.push(Box::new(Broken));
        let migrator = SchemaMigrator::new(chain);
        let err = migrator.migrate(&mut conn).unwrap_err();
        assert!(matches!(
            err,
            Error::Migration { layer: Layer::Schema, version: 3, .. }
        ));
        assert_eq!(migrator.current_version(&mut conn).unwrap(), 2);
    }

    #[test]
    fn newer_schema_is_refused() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        SchemaMigrator::default().migrate(&mut conn).unwrap();
        conn.execute(&format!("UPDATE {} SET version = 7", VERSION_TABLE), &[])
            .unwrap();
        let err = SchemaMigrator::default().ensure_version(&mut conn).unwrap_err();
        assert!(matches!(
            err,
            Error::VersionMismatch { layer: Layer::Schema, stored: 7, expected: 2 }
        ));
    }
}
