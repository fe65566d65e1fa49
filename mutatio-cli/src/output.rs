//! Rendering command results as text or JSON.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use mutatio::change::ChangeListing;
use mutatio::runner::{ItemOutcome, ItemResult};
use mutatio::{BatchResult, LockStatus, OperationRecord};
use serde::Serialize;
use serde_json::Value;

/// What a command produced. `ok == false` maps to exit code 1.
#[derive(Debug)]
pub struct Report {
    pub ok: bool,
    pub json: Value,
    pub text: String,
}

impl Report {
    pub fn new<T: Serialize>(ok: bool, value: &T, text: String) -> Result<Self, serde_json::Error> {
        Ok(Self {
            ok,
            json: serde_json::to_value(value)?,
            text,
        })
    }

    pub fn print(&self, json: bool) -> Result<(), serde_json::Error> {
        if json {
            println!("{}", serde_json::to_string_pretty(&self.json)?);
        } else if !self.text.is_empty() {
            print!("{}", self.text);
        }
        Ok(())
    }
}

fn outcome_label(outcome: &ItemOutcome) -> String {
    match outcome {
        ItemOutcome::Success => "ok".to_string(),
        ItemOutcome::Failed { error } => format!("FAILED: {}", error),
        ItemOutcome::Skipped { reason } => format!("skipped ({})", skip_label(reason)),
    }
}

fn skip_label(reason: &mutatio::runner::SkipReason) -> &'static str {
    use mutatio::runner::SkipReason;
    match reason {
        SkipReason::Unchanged => "unchanged",
        SkipReason::Cancelled => "cancelled",
        SkipReason::Aborted => "aborted",
        SkipReason::DryRun => "dry run",
    }
}

pub fn item(item: &ItemResult) -> String {
    format!("{:<40} {} ({} ms)\n", item.name, outcome_label(&item.outcome), item.duration_ms)
}

pub fn batch(title: &str, batch: &BatchResult) -> String {
    let mut out = String::new();
    for i in &batch.items {
        out.push_str(&item(i));
    }
    let _ = write!(
        out,
        "{}: {} executed, {} skipped, {} failed",
        title, batch.executed, batch.skipped, batch.failed
    );
    if batch.cancelled > 0 {
        let _ = write!(out, " ({} cancelled)", batch.cancelled);
    }
    out.push('\n');
    out
}

pub fn history(records: &[OperationRecord]) -> String {
    if records.is_empty() {
        return "No operations recorded.\n".to_string();
    }
    let mut out = String::new();
    for r in records {
        let _ = writeln!(
            out,
            "#{:<5} {} {:<30} {:<8} {:<8} {} by {}",
            r.id,
            r.started_at.to_rfc3339(),
            r.name,
            r.direction,
            r.status,
            format_duration(r.duration_ms),
            r.executed_by
        );
        if let Some(error) = &r.error_message {
            let _ = writeln!(out, "       {}", error);
        }
    }
    out
}

pub fn listing(changes: &[ChangeListing]) -> String {
    if changes.is_empty() {
        return "No changes found.\n".to_string();
    }
    let mut out = String::new();
    for c in changes {
        let status = c
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "pending".to_string());
        let mut flags = Vec::new();
        if !c.has_revert {
            flags.push("no revert");
        }
        if c.orphaned {
            flags.push("orphaned");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        let _ = writeln!(out, "{:<40} {}{}", c.name, status, flags);
    }
    out
}

pub fn lock_status(config: &str, status: &LockStatus, now: DateTime<Utc>) -> String {
    match &status.holder {
        None => format!("{}: unlocked\n", config),
        Some(holder) => {
            let mut out = format!(
                "{}: locked by {} until {}",
                config,
                holder,
                status.expires_at.map(|t| t.to_rfc3339()).unwrap_or_default()
            );
            if status.is_expired_at(now) {
                out.push_str(" (expired)");
            }
            if let Some(reason) = &status.reason {
                let _ = write!(out, " - {}", reason);
            }
            out.push('\n');
            out
        }
    }
}

fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}
