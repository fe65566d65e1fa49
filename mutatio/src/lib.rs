#![cfg_attr(docsrs, feature(doc_cfg))]
//! `mutatio` applies versioned SQL to a database and keeps an exact record of what ran.
//!
//! Core concepts:
//! - Every build file, one-off run and change folder is tracked in a ledger table inside the
//!   target database. A file is skipped only when its last successful run had the same checksum.
//! - Concurrent invocations against the same target are coordinated through a lock row in that
//!   same database, using the database clock.
//! - mutatio's own metadata (tracking tables, the encrypted state file, the settings file) is
//!   versioned per layer and migrated forward automatically. Metadata written by a newer
//!   release is refused rather than guessed at.
//!
//! # Layout of a project
//!
//! ```text
//! mutatio.toml              settings (see [settings])
//! sql/**.sql                build files, run in path order
//! changes/<name>/change/    forward scripts and manifests of a change
//! changes/<name>/revert/    revert scripts and manifests
//! ```
//!
//! # Ledger semantics
//!
//! Rows in `mutatio_operations` are inserted `pending`, finalized once as `success` or `failed`,
//! and afterwards only move to `reverted` (an explicit revert) or `stale` (after a teardown).
//! The newest forward row for a name decides whether it needs to run again:
//!
//! | latest status      | runs again?                    |
//! |--------------------|--------------------------------|
//! | none               | yes (`new`)                    |
//! | `success`          | only if the checksum changed   |
//! | `failed`, `stale`  | always                         |
//! | `reverted`         | always                         |
//! | `pending`          | always (`interrupted`)         |
//!
//! # Database support
//!
//! - SQLite, always compiled in.
//! - PostgreSQL, with the `postgres` feature flag.
//! - MySQL, with the `mysql` feature flag.
//! - SQL Server dialect rules are built in; register an [`Opener`](dialect::Opener) for it
//!   through [`Drivers`](dialect::Drivers).
//!
//! # Other features
//! - Observability hooks ([`Hooks`]) and `tracing` spans.
//! - Testing utilities, available with the `testing` feature flag.

pub mod change;
pub mod checksum;
pub mod dialect;
mod error;
pub mod files;
pub mod hooks;
pub mod lock;
pub mod registry;
pub mod runner;
pub mod settings;
pub mod state;
pub mod teardown;
pub mod tracker;
pub mod version;

#[cfg(any(test, feature = "testing"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;

pub use change::{Change, ChangeManager};
pub use dialect::{Connection, Dialect, Drivers};
pub use error::Error;
pub use hooks::{Hooks, LockEvent};
pub use lock::{LockManager, LockRecord, LockStatus, ReleaseOutcome};
pub use registry::{ConnectionRegistry, TargetConfig};
pub use runner::{BatchResult, CancelToken, RunOptions, Runner};
pub use settings::Settings;
pub use state::State;
pub use tracker::{
    ChangeTracker, Direction, OperationKind, OperationRecord, OperationStatus, OperationTracker,
    RunDecision, RunReason,
};
pub use version::{Layer, VersionCheck, VersionCoordinator};
