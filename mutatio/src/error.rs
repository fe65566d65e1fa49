use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::version::Layer;

/// Error type for the mutatio crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A file could not be read while computing its checksum.
    #[error("failed to read {path}: {source}")]
    ChecksumIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The operation ledger could not be read or written.
    #[error("tracker error: {0}")]
    Tracker(String),
    #[error("change '{0}' not found")]
    ChangeNotFound(String),
    #[error("change '{0}' is already applied")]
    ChangeAlreadyApplied(String),
    /// A revert was attempted on a change that is not in a revertible state.
    #[error("change '{name}' cannot be reverted: {reason}")]
    ChangeNotApplied { name: String, reason: String },
    /// History references a change whose folder no longer exists.
    #[error("change '{0}' is recorded in history but its folder no longer exists")]
    ChangeOrphaned(String),
    #[error("manifest {manifest} references missing file {reference}")]
    ManifestReference { manifest: PathBuf, reference: PathBuf },
    #[error("lock for '{config}' is held by '{holder}' until {expires_at}")]
    LockConflict {
        config: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },
    #[error("lock for '{config}' is held by '{holder}', not '{requester}'")]
    NotOwner {
        config: String,
        holder: String,
        requester: String,
    },
    /// Stored metadata was written by a newer build than the one running.
    #[error("{layer} version {stored} is newer than the supported version {expected}; upgrade mutatio")]
    VersionMismatch {
        layer: Layer,
        stored: u32,
        expected: u32,
    },
    #[error("{layer} migration to version {version} failed: {cause}")]
    Migration {
        layer: Layer,
        version: u32,
        cause: String,
    },
    #[error("database error: {0}")]
    Database(String),
    #[error("state could not be decrypted: {0}")]
    Decryption(String),
    #[error("no driver registered for dialect '{0}'")]
    UnsupportedDialect(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("cancelled before '{0}' started")]
    Cancelled(String),
    #[error("{0}")]
    Generic(String),
}

impl Error {
    /// Wrap any ledger failure so callers see a single tracker error kind.
    pub(crate) fn tracker(err: Error) -> Self {
        match err {
            Error::Tracker(_) => err,
            other => Error::Tracker(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Database(value.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<postgres::Error> for Error {
    fn from(value: postgres::Error) -> Self {
        Self::Database(value.to_string())
    }
}

#[cfg(feature = "mysql")]
impl From<mysql::Error> for Error {
    fn from(value: mysql::Error) -> Self {
        Self::Database(value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(value: toml::de::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(value: toml::ser::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}
