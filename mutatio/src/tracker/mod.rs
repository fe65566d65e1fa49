//! The operation ledger.
//!
//! Every attempted build, run or change leaves one row in `mutatio_operations`. A row is
//! inserted as `pending` when work starts and finalized exactly once when it ends. After that
//! only its status may move, to `reverted` or `stale`. Nothing is ever deleted, so the highest
//! id forward row for a name is always the authority on whether that name is applied.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dialect::{Connection, Row, SqlValue};
use crate::error::Error;
use crate::hooks::Hooks;
use crate::version::schema::OPERATIONS_TABLE;

pub mod change;

pub use change::{ChangeTracker, RevertCheck};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Build,
    Run,
    Change,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Revert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Success,
    Failed,
    Reverted,
    Stale,
    Skipped,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(Error::Tracker(format!(
                        "unknown {} '{}'",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum!(OperationKind {
    Build => "build",
    Run => "run",
    Change => "change",
});

string_enum!(Direction {
    Forward => "forward",
    Revert => "revert",
});

string_enum!(OperationStatus {
    Pending => "pending",
    Success => "success",
    Failed => "failed",
    Reverted => "reverted",
    Stale => "stale",
    Skipped => "skipped",
});

/// One row of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub id: i64,
    pub name: String,
    pub kind: OperationKind,
    pub direction: Direction,
    pub config_name: String,
    pub checksum: String,
    pub status: OperationStatus,
    pub executed_by: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error_message: Option<String>,
}

pub(crate) const RECORD_COLUMNS: &str = "id, name, kind, direction, config_name, checksum, status, \
     executed_by, started_at, duration_ms, error_message";

impl OperationRecord {
    pub(crate) fn from_row(row: &Row) -> Result<Self, Error> {
        let started_at = row.get_string(8)?;
        let started_at = DateTime::parse_from_rfc3339(&started_at)
            .map_err(|e| Error::Tracker(format!("invalid started_at '{}': {}", started_at, e)))?
            .with_timezone(&Utc);
        Ok(Self {
            id: row.get_i64(0)?,
            name: row.get_string(1)?,
            kind: row.get_string(2)?.parse()?,
            direction: row.get_string(3)?.parse()?,
            config_name: row.get_string(4)?,
            checksum: row.get_string(5)?,
            status: row.get_string(6)?.parse()?,
            executed_by: row.get_string(7)?,
            started_at,
            duration_ms: row.get_i64(9)?.max(0) as u64,
            error_message: row.get_opt_string(10)?,
        })
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationOutcome {
    pub status: OperationStatus,
    pub checksum: String,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl OperationOutcome {
    pub fn success(checksum: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: OperationStatus::Success,
            checksum: checksum.into(),
            duration_ms,
            error: None,
        }
    }

    pub fn failed(checksum: impl Into<String>, duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::Failed,
            checksum: checksum.into(),
            duration_ms,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunReason {
    New,
    Changed,
    Failed,
    Stale,
    Reverted,
    /// The previous attempt never finalized.
    Interrupted,
    Force,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDecision {
    pub needs_run: bool,
    pub reason: RunReason,
    pub previous_checksum: Option<String>,
}

/// Reads and writes ledger rows for one config.
#[derive(Debug, Clone)]
pub struct OperationTracker {
    config_name: String,
    hooks: Hooks,
}

impl OperationTracker {
    pub fn new(config_name: impl Into<String>, hooks: Hooks) -> Self {
        Self {
            config_name: config_name.into(),
            hooks,
        }
    }

    pub fn config_name(&self) -> &str {
        &self.config_name
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// Insert a `pending` row and return its id.
    pub fn create_operation(
        &self,
        conn: &mut dyn Connection,
        name: &str,
        kind: OperationKind,
        direction: Direction,
        executed_by: &str,
    ) -> Result<i64, Error> {
        let d = conn.dialect();
        let sql = format!(
            "INSERT INTO {} (name, kind, direction, config_name, checksum, status, executed_by, \
             started_at, duration_ms) VALUES ({})",
            OPERATIONS_TABLE,
            d.placeholders(9)
        );
        let params: [SqlValue; 9] = [
            name.into(),
            kind.as_str().into(),
            direction.as_str().into(),
            self.config_name.as_str().into(),
            "".into(),
            OperationStatus::Pending.as_str().into(),
            executed_by.into(),
            Utc::now().to_rfc3339().into(),
            0i64.into(),
        ];
        let id = conn.insert(&sql, &params).map_err(Error::tracker)?;
        tracing::debug!(id, name, kind = %kind, direction = %direction, "Operation started");
        Ok(id)
    }

    /// Finalize a pending row. A row that is no longer pending is left alone and reported.
    pub fn record_result(
        &self,
        conn: &mut dyn Connection,
        id: i64,
        outcome: &OperationOutcome,
    ) -> Result<OperationRecord, Error> {
        let d = conn.dialect();
        let sql = format!(
            "UPDATE {} SET status = {}, checksum = {}, duration_ms = {}, error_message = {} \
             WHERE id = {} AND status = {}",
            OPERATIONS_TABLE,
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            d.placeholder(4),
            d.placeholder(5),
            d.placeholder(6),
        );
        let params: [SqlValue; 6] = [
            outcome.status.as_str().into(),
            outcome.checksum.as_str().into(),
            (outcome.duration_ms as i64).into(),
            outcome.error.clone().into(),
            id.into(),
            OperationStatus::Pending.as_str().into(),
        ];
        let updated = conn.execute(&sql, &params).map_err(Error::tracker)?;
        if updated == 0 {
            return Err(Error::Tracker(format!(
                "operation {} is not pending and cannot be finalized",
                id
            )));
        }

        let record = self
            .find(conn, id)?
            .ok_or_else(|| Error::Tracker(format!("operation {} vanished", id)))?;
        tracing::debug!(id, status = %record.status, duration_ms = record.duration_ms, "Operation recorded");
        self.hooks.operation_recorded(&record);
        Ok(record)
    }

    pub fn find(&self, conn: &mut dyn Connection, id: i64) -> Result<Option<OperationRecord>, Error> {
        let d = conn.dialect();
        let sql = format!(
            "SELECT {} FROM {} WHERE id = {}",
            RECORD_COLUMNS,
            OPERATIONS_TABLE,
            d.placeholder(1)
        );
        let rows = conn.query(&sql, &[id.into()]).map_err(Error::tracker)?;
        rows.first()
            .map(OperationRecord::from_row)
            .transpose()
            .map_err(Error::tracker)
    }

    /// Most recent row for `name` in `direction`, ignoring `skipped` rows.
    pub fn latest(
        &self,
        conn: &mut dyn Connection,
        name: &str,
        kind: OperationKind,
        direction: Direction,
    ) -> Result<Option<OperationRecord>, Error> {
        let d = conn.dialect();
        let sql = format!(
            "SELECT {} FROM {} WHERE config_name = {} AND name = {} AND kind = {} \
             AND direction = {} AND status <> {} ORDER BY id DESC LIMIT 1",
            RECORD_COLUMNS,
            OPERATIONS_TABLE,
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            d.placeholder(4),
            d.placeholder(5),
        );
        let params: [SqlValue; 5] = [
            self.config_name.as_str().into(),
            name.into(),
            kind.as_str().into(),
            direction.as_str().into(),
            OperationStatus::Skipped.as_str().into(),
        ];
        let rows = conn.query(&sql, &params).map_err(Error::tracker)?;
        rows.first()
            .map(OperationRecord::from_row)
            .transpose()
            .map_err(Error::tracker)
    }

    /// Decide whether `name` has to execute given its current checksum.
    pub fn needs_run(
        &self,
        conn: &mut dyn Connection,
        name: &str,
        kind: OperationKind,
        checksum: &str,
        force: bool,
    ) -> Result<RunDecision, Error> {
        let previous = self.latest(conn, name, kind, Direction::Forward)?;
        let Some(previous) = previous else {
            return Ok(RunDecision {
                needs_run: true,
                reason: RunReason::New,
                previous_checksum: None,
            });
        };

        let reason = match previous.status {
            OperationStatus::Failed => RunReason::Failed,
            OperationStatus::Stale => RunReason::Stale,
            OperationStatus::Reverted => RunReason::Reverted,
            OperationStatus::Pending => RunReason::Interrupted,
            OperationStatus::Success if previous.checksum != checksum => RunReason::Changed,
            OperationStatus::Success if force => RunReason::Force,
            OperationStatus::Success => RunReason::Unchanged,
            // Filtered out by `latest`.
            OperationStatus::Skipped => RunReason::New,
        };
        Ok(RunDecision {
            needs_run: reason != RunReason::Unchanged,
            reason,
            previous_checksum: Some(previous.checksum),
        })
    }

    /// Rows for this config, newest first. Returns an empty vector before the ledger exists.
    pub fn history(
        &self,
        conn: &mut dyn Connection,
        kind: Option<OperationKind>,
        limit: Option<usize>,
    ) -> Result<Vec<OperationRecord>, Error> {
        if !conn.table_exists(OPERATIONS_TABLE).map_err(Error::tracker)? {
            return Ok(vec![]);
        }
        let d = conn.dialect();
        let mut sql = format!(
            "SELECT {} FROM {} WHERE config_name = {}",
            RECORD_COLUMNS,
            OPERATIONS_TABLE,
            d.placeholder(1)
        );
        let mut params: Vec<SqlValue> = vec![self.config_name.as_str().into()];
        if let Some(kind) = kind {
            sql.push_str(&format!(" AND kind = {}", d.placeholder(2)));
            params.push(kind.as_str().into());
        }
        sql.push_str(" ORDER BY id DESC");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        let rows = conn.query(&sql, &params).map_err(Error::tracker)?;
        rows.iter()
            .map(OperationRecord::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Error::tracker)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::dialect::sqlite::SqliteConnection;
    use crate::version::schema::SchemaMigrator;

    fn ledger() -> SqliteConnection {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        SchemaMigrator::default().migrate(&mut conn).unwrap();
        conn
    }

    fn run_once(
        tracker: &OperationTracker,
        conn: &mut SqliteConnection,
        name: &str,
        outcome: OperationOutcome,
    ) -> OperationRecord {
        let id = tracker
            .create_operation(conn, name, OperationKind::Build, Direction::Forward, "ci")
            .unwrap();
        tracker.record_result(conn, id, &outcome).unwrap()
    }

    #[test]
    fn create_then_record_finalizes_one_row() {
        let mut conn = ledger();
        let seen = Arc::new(Mutex::new(vec![]));
        let sink = seen.clone();
        let tracker = OperationTracker::new(
            "dev",
            Hooks::new().on_operation_recorded(move |r| sink.lock().unwrap().push(r.status)),
        );

        let id = tracker
            .create_operation(&mut conn, "a.sql", OperationKind::Build, Direction::Forward, "ana")
            .unwrap();
        let pending = tracker.find(&mut conn, id).unwrap().unwrap();
        assert_eq!(pending.status, OperationStatus::Pending);

        let record = tracker
            .record_result(&mut conn, id, &OperationOutcome::success("abc", 12))
            .unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.status, OperationStatus::Success);
        assert_eq!(record.checksum, "abc");
        assert_eq!(record.duration_ms, 12);
        assert_eq!(record.executed_by, "ana");
        assert_eq!(record.config_name, "dev");
        assert_eq!(*seen.lock().unwrap(), vec![OperationStatus::Success]);

        // A finalized row cannot be finalized again.
        let err = tracker
            .record_result(&mut conn, id, &OperationOutcome::failed("abc", 1, "late"))
            .unwrap_err();
        assert!(matches!(err, Error::Tracker(_)));
        assert_eq!(tracker.history(&mut conn, None, None).unwrap().len(), 1);
    }

    #[test]
    fn needs_run_classifies_previous_attempts() {
        let mut conn = ledger();
        let tracker = OperationTracker::new("dev", Hooks::default());

        let decision = tracker
            .needs_run(&mut conn, "a.sql", OperationKind::Build, "h1", false)
            .unwrap();
        assert_eq!(decision.reason, RunReason::New);
        assert!(decision.needs_run);

        run_once(&tracker, &mut conn, "a.sql", OperationOutcome::success("h1", 3));
        let unchanged = tracker
            .needs_run(&mut conn, "a.sql", OperationKind::Build, "h1", false)
            .unwrap();
        assert_eq!(
            unchanged,
            RunDecision {
                needs_run: false,
                reason: RunReason::Unchanged,
                previous_checksum: Some("h1".to_string())
            }
        );
        let changed = tracker
            .needs_run(&mut conn, "a.sql", OperationKind::Build, "h2", false)
            .unwrap();
        assert_eq!(changed.reason, RunReason::Changed);
        let forced = tracker
            .needs_run(&mut conn, "a.sql", OperationKind::Build, "h1", true)
            .unwrap();
        assert_eq!(forced.reason, RunReason::Force);
        assert!(forced.needs_run);
    }

    #[test]
    fn failed_and_interrupted_always_rerun() {
        let mut conn = ledger();
        let tracker = OperationTracker::new("dev", Hooks::default());

        run_once(&tracker, &mut conn, "c.sql", OperationOutcome::failed("h", 1, "syntax"));
        let failed = tracker
            .needs_run(&mut conn, "c.sql", OperationKind::Build, "h", false)
            .unwrap();
        assert_eq!(failed.reason, RunReason::Failed);
        assert!(failed.needs_run);

        tracker
            .create_operation(&mut conn, "d.sql", OperationKind::Build, Direction::Forward, "ci")
            .unwrap();
        let interrupted = tracker
            .needs_run(&mut conn, "d.sql", OperationKind::Build, "", false)
            .unwrap();
        assert_eq!(interrupted.reason, RunReason::Interrupted);
    }

    #[test]
    fn records_are_scoped_by_config_and_kind() {
        let mut conn = ledger();
        let dev = OperationTracker::new("dev", Hooks::default());
        let prod = OperationTracker::new("prod", Hooks::default());
        run_once(&dev, &mut conn, "a.sql", OperationOutcome::success("h", 1));

        assert_eq!(
            prod.needs_run(&mut conn, "a.sql", OperationKind::Build, "h", false)
                .unwrap()
                .reason,
            RunReason::New
        );
        assert_eq!(
            dev.needs_run(&mut conn, "a.sql", OperationKind::Run, "h", false)
                .unwrap()
                .reason,
            RunReason::New
        );
        assert!(prod.history(&mut conn, None, None).unwrap().is_empty());
    }

    #[test]
    fn history_is_newest_first_and_limited() {
        let mut conn = ledger();
        let tracker = OperationTracker::new("dev", Hooks::default());
        for name in ["a.sql", "b.sql", "c.sql"] {
            run_once(&tracker, &mut conn, name, OperationOutcome::success("h", 1));
        }
        let names: Vec<_> = tracker
            .history(&mut conn, Some(OperationKind::Build), Some(2))
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["c.sql", "b.sql"]);
        assert!(tracker
            .history(&mut conn, Some(OperationKind::Change), None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn history_before_ledger_exists_is_empty() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let tracker = OperationTracker::new("dev", Hooks::default());
        assert!(tracker.history(&mut conn, None, None).unwrap().is_empty());
        let err = tracker
            .needs_run(&mut conn, "a.sql", OperationKind::Build, "h", false)
            .unwrap_err();
        assert!(matches!(err, Error::Tracker(_)));
    }
}
