//! Change-specific ledger rules: revert eligibility, revert marking and teardown staleness.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{
    Direction, OperationKind, OperationRecord, OperationStatus, OperationTracker, RECORD_COLUMNS,
};
use crate::dialect::{Connection, SqlValue};
use crate::error::Error;
use crate::hooks::Hooks;
use crate::version::schema::OPERATIONS_TABLE;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertCheck {
    pub can_revert: bool,
    pub reason: Option<String>,
    pub status: Option<OperationStatus>,
}

impl RevertCheck {
    fn allowed(status: OperationStatus) -> Self {
        Self {
            can_revert: true,
            reason: None,
            status: Some(status),
        }
    }

    fn refused(reason: &str, status: Option<OperationStatus>) -> Self {
        Self {
            can_revert: false,
            reason: Some(reason.to_string()),
            status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChangeTracker {
    tracker: OperationTracker,
}

impl ChangeTracker {
    pub fn new(config_name: impl Into<String>, hooks: Hooks) -> Self {
        Self {
            tracker: OperationTracker::new(config_name, hooks),
        }
    }

    /// The underlying tracker, for creating and finalizing change operations.
    pub fn operations(&self) -> &OperationTracker {
        &self.tracker
    }

    fn latest_forward(
        &self,
        conn: &mut dyn Connection,
        name: &str,
    ) -> Result<Option<OperationRecord>, Error> {
        self.tracker
            .latest(conn, name, OperationKind::Change, Direction::Forward)
    }

    pub fn change_status(
        &self,
        conn: &mut dyn Connection,
        name: &str,
    ) -> Result<Option<OperationStatus>, Error> {
        Ok(self.latest_forward(conn, name)?.map(|r| r.status))
    }

    pub fn can_revert(
        &self,
        conn: &mut dyn Connection,
        name: &str,
        force: bool,
    ) -> Result<RevertCheck, Error> {
        let Some(record) = self.latest_forward(conn, name)? else {
            return Ok(RevertCheck::refused("not applied", None));
        };
        let status = record.status;
        if force {
            return Ok(RevertCheck::allowed(status));
        }
        Ok(match status {
            OperationStatus::Success | OperationStatus::Failed => RevertCheck::allowed(status),
            OperationStatus::Pending => RevertCheck::refused("not applied yet", Some(status)),
            OperationStatus::Reverted => RevertCheck::refused("already reverted", Some(status)),
            OperationStatus::Stale => RevertCheck::refused("schema was torn down", Some(status)),
            OperationStatus::Skipped => RevertCheck::refused("not applied", Some(status)),
        })
    }

    /// Flip the latest forward record of `name` to `reverted`.
    ///
    /// Returns `false` when there is no record or it is already reverted.
    pub fn mark_as_reverted(&self, conn: &mut dyn Connection, name: &str) -> Result<bool, Error> {
        let Some(record) = self.latest_forward(conn, name)? else {
            return Ok(false);
        };
        if record.status == OperationStatus::Reverted {
            return Ok(false);
        }
        let d = conn.dialect();
        let sql = format!(
            "UPDATE {} SET status = {} WHERE id = {} AND status <> {}",
            OPERATIONS_TABLE,
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3)
        );
        let params: [SqlValue; 3] = [
            OperationStatus::Reverted.as_str().into(),
            record.id.into(),
            OperationStatus::Reverted.as_str().into(),
        ];
        let updated = conn.execute(&sql, &params).map_err(Error::tracker)?;
        if updated > 0 {
            tracing::info!(change = name, id = record.id, "Change marked as reverted");
        }
        Ok(updated > 0)
    }

    /// Mark every live forward record of this config `stale` after a teardown.
    ///
    /// Failures are reported through the error hook and the log, and count as zero rows.
    pub fn mark_all_as_stale(&self, conn: &mut dyn Connection) -> usize {
        match self.try_mark_all_as_stale(conn) {
            Ok(count) => {
                tracing::warn!(
                    config = self.tracker.config_name(),
                    count,
                    "Operation history marked stale"
                );
                count
            }
            Err(e) => {
                let e = Error::tracker(e);
                tracing::error!(config = self.tracker.config_name(), error = %e, "Failed to mark history stale");
                self.tracker.hooks().error(&e);
                0
            }
        }
    }

    fn try_mark_all_as_stale(&self, conn: &mut dyn Connection) -> Result<usize, Error> {
        let d = conn.dialect();
        let sql = format!(
            "UPDATE {} SET status = {} WHERE config_name = {} AND direction = {} \
             AND status IN ({}, {}, {})",
            OPERATIONS_TABLE,
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            d.placeholder(4),
            d.placeholder(5),
            d.placeholder(6)
        );
        let params: [SqlValue; 6] = [
            OperationStatus::Stale.as_str().into(),
            self.tracker.config_name().into(),
            Direction::Forward.as_str().into(),
            OperationStatus::Success.as_str().into(),
            OperationStatus::Failed.as_str().into(),
            OperationStatus::Pending.as_str().into(),
        ];
        Ok(conn.execute(&sql, &params)? as usize)
    }

    /// Latest forward record of every change whose current state is `success`, oldest first.
    pub fn applied_changes(&self, conn: &mut dyn Connection) -> Result<Vec<OperationRecord>, Error> {
        let d = conn.dialect();
        let sql = format!(
            "SELECT {} FROM {} WHERE config_name = {} AND kind = {} AND direction = {} \
             AND status <> {} ORDER BY id ASC",
            RECORD_COLUMNS,
            OPERATIONS_TABLE,
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            d.placeholder(4)
        );
        let params: [SqlValue; 4] = [
            self.tracker.config_name().into(),
            OperationKind::Change.as_str().into(),
            Direction::Forward.as_str().into(),
            OperationStatus::Skipped.as_str().into(),
        ];
        let rows = conn.query(&sql, &params).map_err(Error::tracker)?;

        let mut latest: BTreeMap<String, OperationRecord> = BTreeMap::new();
        for row in &rows {
            let record = OperationRecord::from_row(row).map_err(Error::tracker)?;
            latest.insert(record.name.clone(), record);
        }
        let mut applied: Vec<_> = latest
            .into_values()
            .filter(|r| r.status == OperationStatus::Success)
            .collect();
        applied.sort_by_key(|r| r.id);
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::dialect::sqlite::SqliteConnection;
    use crate::tracker::OperationOutcome;
    use crate::version::schema::SchemaMigrator;

    fn setup() -> (SqliteConnection, ChangeTracker) {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        SchemaMigrator::default().migrate(&mut conn).unwrap();
        (conn, ChangeTracker::new("dev", Hooks::default()))
    }

    fn apply(conn: &mut SqliteConnection, changes: &ChangeTracker, name: &str, status: OperationStatus) -> i64 {
        let ops = changes.operations();
        let id = ops
            .create_operation(conn, name, OperationKind::Change, Direction::Forward, "ci")
            .unwrap();
        match status {
            OperationStatus::Pending => {}
            OperationStatus::Failed => {
                ops.record_result(conn, id, &OperationOutcome::failed("h", 1, "boom"))
                    .unwrap();
            }
            _ => {
                ops.record_result(conn, id, &OperationOutcome::success("h", 1))
                    .unwrap();
            }
        }
        id
    }

    #[test]
    fn revert_decision_table() {
        let (mut conn, changes) = setup();
        assert_eq!(
            changes.can_revert(&mut conn, "missing", false).unwrap(),
            RevertCheck {
                can_revert: false,
                reason: Some("not applied".to_string()),
                status: None
            }
        );
        // Force never overrides a missing record.
        assert!(!changes.can_revert(&mut conn, "missing", true).unwrap().can_revert);

        apply(&mut conn, &changes, "pending", OperationStatus::Pending);
        let check = changes.can_revert(&mut conn, "pending", false).unwrap();
        assert_eq!(check.reason.as_deref(), Some("not applied yet"));
        assert!(changes.can_revert(&mut conn, "pending", true).unwrap().can_revert);

        apply(&mut conn, &changes, "ok", OperationStatus::Success);
        apply(&mut conn, &changes, "broken", OperationStatus::Failed);
        assert!(changes.can_revert(&mut conn, "ok", false).unwrap().can_revert);
        assert!(changes.can_revert(&mut conn, "broken", false).unwrap().can_revert);

        assert!(changes.mark_as_reverted(&mut conn, "ok").unwrap());
        assert_eq!(
            changes.can_revert(&mut conn, "ok", false).unwrap(),
            RevertCheck {
                can_revert: false,
                reason: Some("already reverted".to_string()),
                status: Some(OperationStatus::Reverted)
            }
        );
    }

    #[test]
    fn mark_as_reverted_is_idempotent() {
        let (mut conn, changes) = setup();
        assert!(!changes.mark_as_reverted(&mut conn, "none").unwrap());
        apply(&mut conn, &changes, "add_users", OperationStatus::Success);
        assert!(changes.mark_as_reverted(&mut conn, "add_users").unwrap());
        assert!(!changes.mark_as_reverted(&mut conn, "add_users").unwrap());
        assert_eq!(
            changes.change_status(&mut conn, "add_users").unwrap(),
            Some(OperationStatus::Reverted)
        );
    }

    #[test]
    fn teardown_staleness_leaves_reverted_alone() {
        let (mut conn, changes) = setup();
        apply(&mut conn, &changes, "a", OperationStatus::Success);
        apply(&mut conn, &changes, "b", OperationStatus::Failed);
        apply(&mut conn, &changes, "c", OperationStatus::Pending);
        apply(&mut conn, &changes, "d", OperationStatus::Success);
        changes.mark_as_reverted(&mut conn, "d").unwrap();
        // Another config's history is untouched.
        let other = ChangeTracker::new("prod", Hooks::default());
        apply(&mut conn, &other, "a", OperationStatus::Success);

        assert_eq!(changes.mark_all_as_stale(&mut conn), 3);
        for name in ["a", "b", "c"] {
            assert_eq!(
                changes.change_status(&mut conn, name).unwrap(),
                Some(OperationStatus::Stale)
            );
        }
        assert_eq!(
            changes.change_status(&mut conn, "d").unwrap(),
            Some(OperationStatus::Reverted)
        );
        assert_eq!(
            changes.can_revert(&mut conn, "a", false).unwrap().reason.as_deref(),
            Some("schema was torn down")
        );
        assert_eq!(
            other.change_status(&mut conn, "a").unwrap(),
            Some(OperationStatus::Success)
        );
    }

    #[test]
    fn staleness_failure_reports_and_returns_zero() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let errors = Arc::new(Mutex::new(0));
        let sink = errors.clone();
        let changes = ChangeTracker::new(
            "dev",
            Hooks::new().on_error(move |e| {
                assert!(matches!(e, Error::Tracker(_)));
                *sink.lock().unwrap() += 1;
            }),
        );
        assert_eq!(changes.mark_all_as_stale(&mut conn), 0);
        assert_eq!(*errors.lock().unwrap(), 1);
    }

    #[test]
    fn applied_changes_follow_latest_record() {
        let (mut conn, changes) = setup();
        apply(&mut conn, &changes, "one", OperationStatus::Success);
        apply(&mut conn, &changes, "two", OperationStatus::Success);
        apply(&mut conn, &changes, "three", OperationStatus::Failed);
        changes.mark_as_reverted(&mut conn, "two").unwrap();
        apply(&mut conn, &changes, "two", OperationStatus::Success);

        let names: Vec<_> = changes
            .applied_changes(&mut conn)
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["one", "two"]);
    }
}
