//! Dropping every user table in a target, then marking history stale.

use serde::Serialize;

use crate::dialect::Connection;
use crate::error::Error;
use crate::tracker::ChangeTracker;
use crate::version::schema::TABLE_PREFIX;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownReport {
    pub dropped: Vec<String>,
    /// Tables that still could not be dropped once no further progress was possible, with the
    /// last error for each.
    pub failed: Vec<(String, String)>,
    /// Ledger rows moved to `stale`.
    pub stale_count: usize,
}

impl TeardownReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Drop every table mutatio does not own. The ledger is kept, and each of its live forward
/// records for the config becomes `stale` so the next run re-applies everything.
///
/// Tables that fail to drop, typically because another table still references them, are
/// retried after the rest until a pass makes no progress. History is marked stale whenever
/// anything was dropped, even if some tables remain.
pub fn teardown(conn: &mut dyn Connection, changes: &ChangeTracker) -> Result<TeardownReport, Error> {
    let _span = tracing::info_span!("teardown", config = changes.operations().config_name()).entered();

    let mut remaining: Vec<String> = conn
        .list_tables()?
        .into_iter()
        .filter(|t| !t.to_ascii_lowercase().starts_with(TABLE_PREFIX))
        .collect();

    let mut dropped = Vec::with_capacity(remaining.len());
    let mut failed = Vec::new();
    while !remaining.is_empty() {
        failed.clear();
        let before = remaining.len();
        for table in std::mem::take(&mut remaining) {
            match conn.drop_table(&table) {
                Ok(()) => {
                    tracing::debug!(table = %table, "Dropped table");
                    dropped.push(table);
                }
                Err(err) => {
                    tracing::debug!(table = %table, error = %err, "Drop failed, will retry");
                    failed.push((table.clone(), err.to_string()));
                    remaining.push(table);
                }
            }
        }
        if remaining.len() == before {
            break;
        }
    }

    let stale_count = if dropped.is_empty() {
        0
    } else {
        changes.mark_all_as_stale(conn)
    };
    if failed.is_empty() {
        tracing::warn!(
            dropped = dropped.len(),
            tables = ?dropped,
            stale_count,
            "Teardown complete"
        );
    } else {
        tracing::error!(
            dropped = dropped.len(),
            tables = ?dropped,
            failed = ?failed,
            stale_count,
            "Teardown left tables behind"
        );
    }
    Ok(TeardownReport {
        dropped,
        failed,
        stale_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::sqlite::SqliteConnection;
    use crate::hooks::Hooks;
    use crate::tracker::{Direction, OperationKind, OperationOutcome, OperationStatus};
    use crate::version::schema::SchemaMigrator;

    #[test]
    fn drops_user_tables_and_marks_history_stale() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        SchemaMigrator::default().migrate(&mut conn).unwrap();
        conn.execute_script("CREATE TABLE users (id INTEGER); CREATE TABLE orders (id INTEGER);")
            .unwrap();

        let changes = ChangeTracker::new("dev", Hooks::default());
        let ops = changes.operations();
        let id = ops
            .create_operation(&mut conn, "add_users", OperationKind::Change, Direction::Forward, "ci")
            .unwrap();
        ops.record_result(&mut conn, id, &OperationOutcome::success("h", 1))
            .unwrap();
        let id = ops
            .create_operation(&mut conn, "users.sql", OperationKind::Build, Direction::Forward, "ci")
            .unwrap();
        ops.record_result(&mut conn, id, &OperationOutcome::success("h", 1))
            .unwrap();

        let report = teardown(&mut conn, &changes).unwrap();
        assert_eq!(report.dropped, vec!["orders", "users"]);
        assert_eq!(report.stale_count, 2);
        assert_eq!(
            conn.list_tables().unwrap(),
            vec!["mutatio_locks", "mutatio_operations", "mutatio_version"]
        );
        assert_eq!(
            changes.change_status(&mut conn, "add_users").unwrap(),
            Some(OperationStatus::Stale)
        );
    }

    #[test]
    fn referenced_tables_are_retried_and_history_still_goes_stale() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        SchemaMigrator::default().migrate(&mut conn).unwrap();
        conn.execute_script(
            "CREATE TABLE a_other (id INTEGER);
             CREATE TABLE b_parent (id INTEGER PRIMARY KEY);
             CREATE TABLE c_child (id INTEGER, parent INTEGER REFERENCES b_parent (id));
             INSERT INTO b_parent (id) VALUES (1);
             INSERT INTO c_child (id, parent) VALUES (1, 1);",
        )
        .unwrap();
        conn.execute("PRAGMA foreign_keys = ON", &[]).unwrap();

        let changes = ChangeTracker::new("dev", Hooks::default());
        let ops = changes.operations();
        let id = ops
            .create_operation(&mut conn, "x", OperationKind::Change, Direction::Forward, "ci")
            .unwrap();
        ops.record_result(&mut conn, id, &OperationOutcome::success("h", 1))
            .unwrap();

        let report = teardown(&mut conn, &changes).unwrap();
        assert!(report.is_complete(), "{:?}", report.failed);
        assert_eq!(report.dropped, vec!["a_other", "c_child", "b_parent"]);
        assert_eq!(report.stale_count, 1);
        assert_eq!(
            changes.change_status(&mut conn, "x").unwrap(),
            Some(OperationStatus::Stale)
        );
    }

    struct Stubborn {
        inner: SqliteConnection,
    }

    impl Connection for Stubborn {
        fn dialect(&self) -> crate::dialect::Dialect {
            self.inner.dialect()
        }
        fn execute(&mut self, sql: &str, params: &[crate::dialect::SqlValue]) -> Result<u64, Error> {
            if sql.starts_with("DROP TABLE") && sql.contains("pinned") {
                return Err(Error::Database("table is pinned".to_string()));
            }
            self.inner.execute(sql, params)
        }
        fn query(&mut self, sql: &str, params: &[crate::dialect::SqlValue]) -> Result<Vec<crate::dialect::Row>, Error> {
            self.inner.query(sql, params)
        }
        fn insert(&mut self, sql: &str, params: &[crate::dialect::SqlValue]) -> Result<i64, Error> {
            self.inner.insert(sql, params)
        }
        fn execute_script(&mut self, sql: &str) -> Result<(), Error> {
            self.inner.execute_script(sql)
        }
        fn list_tables(&mut self) -> Result<Vec<String>, Error> {
            self.inner.list_tables()
        }
        fn close(self: Box<Self>) -> Result<(), Error> {
            Box::new(self.inner).close()
        }
    }

    #[test]
    fn partial_teardown_reports_both_sides() {
        let mut inner = SqliteConnection::open_in_memory().unwrap();
        SchemaMigrator::default().migrate(&mut inner).unwrap();
        inner
            .execute_script("CREATE TABLE gone (id INTEGER); CREATE TABLE pinned (id INTEGER);")
            .unwrap();
        let mut conn = Stubborn { inner };

        let changes = ChangeTracker::new("dev", Hooks::default());
        let id = changes
            .operations()
            .create_operation(&mut conn, "x", OperationKind::Change, Direction::Forward, "ci")
            .unwrap();
        changes
            .operations()
            .record_result(&mut conn, id, &OperationOutcome::success("h", 1))
            .unwrap();

        let report = teardown(&mut conn, &changes).unwrap();
        assert_eq!(report.dropped, vec!["gone"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "pinned");
        assert!(!report.is_complete());
        assert_eq!(report.stale_count, 1);
        assert_eq!(
            changes.change_status(&mut conn, "x").unwrap(),
            Some(OperationStatus::Stale)
        );
    }
}
