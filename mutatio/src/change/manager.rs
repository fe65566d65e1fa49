use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::Serialize;

use super::{change_names, Change};
use crate::dialect::Connection;
use crate::error::Error;
use crate::runner::{
    execute_tracked, BatchResult, CancelToken, ItemOutcome, ItemResult, RunOptions, SkipReason,
};
use crate::tracker::{ChangeTracker, Direction, OperationKind, OperationRecord, OperationStatus};

/// One row of `change list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeListing {
    pub name: String,
    pub status: Option<OperationStatus>,
    pub has_revert: bool,
    /// Recorded as applied but the folder is gone.
    pub orphaned: bool,
}

/// Applies and reverts change folders for one config.
#[derive(Debug, Clone)]
pub struct ChangeManager {
    tracker: ChangeTracker,
    changes_root: PathBuf,
    sql_root: PathBuf,
    options: RunOptions,
    cancel: CancelToken,
}

impl ChangeManager {
    pub fn new(
        tracker: ChangeTracker,
        changes_root: impl Into<PathBuf>,
        sql_root: impl Into<PathBuf>,
        options: RunOptions,
    ) -> Self {
        Self {
            tracker,
            changes_root: changes_root.into(),
            sql_root: sql_root.into(),
            options,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    fn load(&self, name: &str) -> Result<Change, Error> {
        Change::load(&self.changes_root, &self.sql_root, name)
    }

    /// Every change on disk plus any applied change whose folder is missing.
    pub fn list(&self, conn: &mut dyn Connection) -> Result<Vec<ChangeListing>, Error> {
        let on_disk = change_names(&self.changes_root)?;
        let known: BTreeSet<&str> = on_disk.iter().map(String::as_str).collect();

        let mut listing = Vec::new();
        for name in &on_disk {
            listing.push(ChangeListing {
                name: name.clone(),
                status: self.tracker.change_status(conn, name)?,
                has_revert: self.load(name).map(|c| c.has_revert()).unwrap_or(false),
                orphaned: false,
            });
        }
        for record in self.tracker.applied_changes(conn)? {
            if !known.contains(record.name.as_str()) {
                listing.push(ChangeListing {
                    name: record.name,
                    status: Some(record.status),
                    has_revert: false,
                    orphaned: true,
                });
            }
        }
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    fn apply(&self, conn: &mut dyn Connection, change: &Change) -> Result<ItemResult, Error> {
        let scripts = change.forward_scripts()?;
        let decision = self.tracker.operations().needs_run(
            conn,
            &change.name,
            OperationKind::Change,
            &scripts.checksum,
            self.options.force,
        )?;
        if !decision.needs_run {
            return Ok(ItemResult::skipped(
                &change.name,
                Some(scripts.checksum),
                Some(decision.reason),
                SkipReason::Unchanged,
            ));
        }
        if self.options.dry_run {
            return Ok(ItemResult::skipped(
                &change.name,
                Some(scripts.checksum),
                Some(decision.reason),
                SkipReason::DryRun,
            ));
        }
        let record = execute_tracked(
            conn,
            self.tracker.operations(),
            &change.name,
            OperationKind::Change,
            Direction::Forward,
            &scripts.checksum,
            &scripts.sql,
            &self.options.executed_by,
        )?;
        Ok(ItemResult::from_record(&record, Some(decision.reason)))
    }

    /// Apply every pending change in name order.
    pub fn ff(&self, conn: &mut dyn Connection) -> Result<BatchResult, Error> {
        let mut batch = BatchResult::default();
        let mut aborted = false;

        for name in change_names(&self.changes_root)? {
            let _span = tracing::info_span!("change_forward", change = %name).entered();
            if self.cancel.is_cancelled() {
                batch.push(ItemResult::skipped(&name, None, None, SkipReason::Cancelled));
                continue;
            }
            if aborted {
                batch.push(ItemResult::skipped(&name, None, None, SkipReason::Aborted));
                continue;
            }
            let item = match self.load(&name).and_then(|c| self.apply(conn, &c)) {
                Ok(item) => item,
                Err(e) => {
                    tracing::error!(error = %e, "Change could not be applied");
                    ItemResult::failed_before_start(&name, &e)
                }
            };
            if item.is_failed() && self.options.abort_on_error {
                aborted = true;
            }
            batch.push(item);
        }

        tracing::info!(
            executed = batch.executed,
            skipped = batch.skipped,
            failed = batch.failed,
            "Fast-forward finished"
        );
        Ok(batch)
    }

    /// Apply one change. An unchanged, applied change is refused unless forced.
    pub fn run(&self, conn: &mut dyn Connection, name: &str) -> Result<ItemResult, Error> {
        let _span = tracing::info_span!("change_forward", change = %name).entered();
        let change = self.load(name)?;
        let item = self.apply(conn, &change)?;
        match item.outcome {
            ItemOutcome::Skipped {
                reason: SkipReason::Unchanged,
            } => Err(Error::ChangeAlreadyApplied(name.to_string())),
            _ => Ok(item),
        }
    }

    /// Run the revert side of `name` and mark its forward record reverted.
    pub fn revert(&self, conn: &mut dyn Connection, name: &str) -> Result<ItemResult, Error> {
        let _span = tracing::info_span!("change_revert", change = %name).entered();
        let check = self.tracker.can_revert(conn, name, self.options.force)?;
        if !check.can_revert {
            return Err(Error::ChangeNotApplied {
                name: name.to_string(),
                reason: check.reason.unwrap_or_else(|| "not applied".to_string()),
            });
        }
        let change = match self.load(name) {
            Err(Error::ChangeNotFound(_)) => return Err(Error::ChangeOrphaned(name.to_string())),
            other => other?,
        };
        if !change.has_revert() {
            return Err(Error::ChangeNotApplied {
                name: name.to_string(),
                reason: "no revert scripts".to_string(),
            });
        }
        let scripts = change.revert_scripts()?;
        if self.options.dry_run {
            return Ok(ItemResult::skipped(
                name,
                Some(scripts.checksum),
                None,
                SkipReason::DryRun,
            ));
        }

        let record = execute_tracked(
            conn,
            self.tracker.operations(),
            name,
            OperationKind::Change,
            Direction::Revert,
            &scripts.checksum,
            &scripts.sql,
            &self.options.executed_by,
        )?;
        if record.status == OperationStatus::Success {
            self.tracker.mark_as_reverted(conn, name)?;
        }
        Ok(ItemResult::from_record(&record, None))
    }

    /// Revert the `count` most recently applied changes, newest first.
    pub fn rewind(&self, conn: &mut dyn Connection, count: usize) -> Result<BatchResult, Error> {
        let mut applied = self.tracker.applied_changes(conn)?;
        applied.reverse();

        let mut batch = BatchResult::default();
        let mut aborted = false;
        for record in applied.into_iter().take(count) {
            if self.cancel.is_cancelled() {
                batch.push(ItemResult::skipped(&record.name, None, None, SkipReason::Cancelled));
                continue;
            }
            if aborted {
                batch.push(ItemResult::skipped(&record.name, None, None, SkipReason::Aborted));
                continue;
            }
            let item = match self.revert(conn, &record.name) {
                Ok(item) => item,
                Err(e) => ItemResult::failed_before_start(&record.name, &e),
            };
            if item.is_failed() && self.options.abort_on_error {
                aborted = true;
            }
            batch.push(item);
        }
        Ok(batch)
    }

    /// Change operations for this config, newest first.
    pub fn history(
        &self,
        conn: &mut dyn Connection,
        limit: Option<usize>,
    ) -> Result<Vec<OperationRecord>, Error> {
        self.tracker
            .operations()
            .history(conn, Some(OperationKind::Change), limit)
    }
}
