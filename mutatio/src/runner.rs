//! Checksum-gated execution of SQL files.
//!
//! A batch runs in two phases. Files are first read and hashed, optionally on several threads.
//! They are then classified against the ledger and executed one at a time, in name order, on the
//! single connection for the config. Cancellation and abort-on-error are checked between files;
//! a statement already sent to the database always runs to completion.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::checksum;
use crate::dialect::Connection;
use crate::error::Error;
use crate::files::{self, SqlFile};
use crate::settings::BuildSettings;
use crate::tracker::{
    Direction, OperationKind, OperationOutcome, OperationRecord, OperationTracker, RunReason,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Execute even when the ledger says the file is unchanged.
    pub force: bool,
    /// Classify only; nothing is executed or recorded.
    pub dry_run: bool,
    /// Skip the rest of the batch after the first failure.
    pub abort_on_error: bool,
    /// Threads used to read and hash files. Execution is always sequential.
    pub concurrency: usize,
    pub executed_by: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            force: false,
            dry_run: false,
            abort_on_error: true,
            concurrency: 1,
            executed_by: "mutatio".to_string(),
        }
    }
}

/// Shared flag checked at file boundaries. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    Unchanged,
    Cancelled,
    /// An earlier item failed and `abort_on_error` was set.
    Aborted,
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ItemOutcome {
    Success,
    Failed { error: String },
    Skipped { reason: SkipReason },
}

/// Result for one file or change in a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<RunReason>,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<i64>,
}

impl ItemResult {
    pub(crate) fn skipped(name: &str, checksum: Option<String>, decision: Option<RunReason>, reason: SkipReason) -> Self {
        Self {
            name: name.to_string(),
            checksum,
            decision,
            outcome: ItemOutcome::Skipped { reason },
            duration_ms: 0,
            operation_id: None,
        }
    }

    pub(crate) fn failed_before_start(name: &str, error: &Error) -> Self {
        Self {
            name: name.to_string(),
            checksum: None,
            decision: None,
            outcome: ItemOutcome::Failed {
                error: error.to_string(),
            },
            duration_ms: 0,
            operation_id: None,
        }
    }

    pub(crate) fn from_record(record: &OperationRecord, decision: Option<RunReason>) -> Self {
        let outcome = match &record.error_message {
            Some(error) => ItemOutcome::Failed {
                error: error.clone(),
            },
            None => ItemOutcome::Success,
        };
        Self {
            name: record.name.clone(),
            checksum: Some(record.checksum.clone()),
            decision,
            outcome,
            duration_ms: record.duration_ms,
            operation_id: Some(record.id),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Failed { .. })
    }
}

/// Totals for a batch. `executed` counts items whose SQL ran, successfully or not.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub executed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Items left unrun because the batch was cancelled. Also counted in `skipped`.
    pub cancelled: usize,
    pub items: Vec<ItemResult>,
}

impl BatchResult {
    pub(crate) fn push(&mut self, item: ItemResult) {
        match &item.outcome {
            ItemOutcome::Success => self.executed += 1,
            ItemOutcome::Failed { .. } => {
                if item.operation_id.is_some() {
                    self.executed += 1;
                }
                self.failed += 1;
            }
            ItemOutcome::Skipped { reason } => {
                if *reason == SkipReason::Cancelled {
                    self.cancelled += 1;
                }
                self.skipped += 1;
            }
        }
        self.items.push(item);
    }

    /// Nothing failed and nothing was left unrun by a cancel.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

/// Run `scripts` in order as one tracked operation and finalize its ledger row.
///
/// A script failure is recorded and returned inside the record; only ledger failures are
/// returned as errors.
#[allow(clippy::too_many_arguments)]
pub(crate) fn execute_tracked(
    conn: &mut dyn Connection,
    tracker: &OperationTracker,
    name: &str,
    kind: OperationKind,
    direction: Direction,
    checksum: &str,
    scripts: &[String],
    executed_by: &str,
) -> Result<OperationRecord, Error> {
    let id = tracker.create_operation(conn, name, kind, direction, executed_by)?;
    let started = Instant::now();
    tracing::info!("Executing");

    let mut failure = None;
    for script in scripts {
        if let Err(e) = conn.execute_script(script) {
            failure = Some(e);
            break;
        }
    }
    let duration_ms = started.elapsed().as_millis() as u64;

    let outcome = match failure {
        None => OperationOutcome::success(checksum, duration_ms),
        Some(e) => {
            tracing::error!(error = %e, "Execution failed");
            OperationOutcome::failed(checksum, duration_ms, e.to_string())
        }
    };
    let record = tracker.record_result(conn, id, &outcome)?;
    tracing::info!(status = %record.status, duration_ms, "Execution finished");
    Ok(record)
}

struct Prepared {
    checksum: String,
    sql: String,
}

fn prepare(file: &SqlFile) -> Result<Prepared, Error> {
    let bytes = fs::read(&file.path).map_err(|source| Error::ChecksumIo {
        path: file.path.clone(),
        source,
    })?;
    Ok(Prepared {
        checksum: checksum::hash_content(&bytes),
        sql: String::from_utf8_lossy(&bytes).into_owned(),
    })
}

#[derive(Debug, Clone)]
pub struct Runner {
    tracker: OperationTracker,
    options: RunOptions,
    cancel: CancelToken,
}

impl Runner {
    pub fn new(tracker: OperationTracker, options: RunOptions) -> Self {
        Self {
            tracker,
            options,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Discover every build file under `root` and run the batch.
    pub fn run_build(
        &self,
        conn: &mut dyn Connection,
        root: &Path,
        filters: &BuildSettings,
    ) -> Result<BatchResult, Error> {
        let files = files::discover(root, filters)?;
        Ok(self.run_files(conn, &files, OperationKind::Build))
    }

    /// Run one file outside a build, tracked as `run`.
    pub fn run_file(&self, conn: &mut dyn Connection, root: &Path, path: &Path) -> Result<ItemResult, Error> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        let file = SqlFile::new(root, path);
        let batch = self.run_files(conn, std::slice::from_ref(&file), OperationKind::Run);
        batch
            .items
            .into_iter()
            .next()
            .ok_or_else(|| Error::Generic(format!("no result for {}", file.name)))
    }

    fn prepare_all(&self, files: &[SqlFile]) -> Vec<Result<Prepared, Error>> {
        let workers = self.options.concurrency.max(1);
        if workers == 1 || files.len() < 2 {
            return files.iter().map(prepare).collect();
        }
        let chunk = files.len().div_ceil(workers);
        std::thread::scope(|scope| {
            let handles: Vec<_> = files
                .chunks(chunk)
                .map(|part| scope.spawn(move || part.iter().map(prepare).collect::<Vec<_>>()))
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    }

    /// Run `files` in the order given.
    pub fn run_files(&self, conn: &mut dyn Connection, files: &[SqlFile], kind: OperationKind) -> BatchResult {
        let mut batch = BatchResult::default();
        let mut aborted = false;

        for (file, prepared) in files.iter().zip(self.prepare_all(files)) {
            let _span = tracing::info_span!("run_file", name = %file.name, kind = %kind).entered();

            if self.cancel.is_cancelled() {
                batch.push(ItemResult::skipped(&file.name, None, None, SkipReason::Cancelled));
                continue;
            }
            if aborted {
                batch.push(ItemResult::skipped(&file.name, None, None, SkipReason::Aborted));
                continue;
            }

            let item = match self.run_prepared(conn, file, kind, prepared) {
                Ok(item) => item,
                Err(e) => {
                    tracing::error!(error = %e, "File could not be run");
                    ItemResult::failed_before_start(&file.name, &e)
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
            "Batch finished"
        );
        batch
    }

    fn run_prepared(
        &self,
        conn: &mut dyn Connection,
        file: &SqlFile,
        kind: OperationKind,
        prepared: Result<Prepared, Error>,
    ) -> Result<ItemResult, Error> {
        let prepared = prepared?;
        let decision = self
            .tracker
            .needs_run(conn, &file.name, kind, &prepared.checksum, self.options.force)?;

        if !decision.needs_run {
            tracing::debug!("Unchanged, skipping");
            return Ok(ItemResult::skipped(
                &file.name,
                Some(prepared.checksum),
                Some(decision.reason),
                SkipReason::Unchanged,
            ));
        }
        if self.options.dry_run {
            return Ok(ItemResult::skipped(
                &file.name,
                Some(prepared.checksum),
                Some(decision.reason),
                SkipReason::DryRun,
            ));
        }

        let record = execute_tracked(
            conn,
            &self.tracker,
            &file.name,
            kind,
            Direction::Forward,
            &prepared.checksum,
            &[prepared.sql],
            &self.options.executed_by,
        )?;
        Ok(ItemResult::from_record(&record, Some(decision.reason)))
    }
}
