//! Versioning of mutatio's own metadata.
//!
//! Three layers evolve independently, each with its own contiguous chain of migrations:
//!
//! - [`Layer::Schema`]: the tracking tables inside the target database ([`schema`]).
//! - [`Layer::State`]: the decrypted local state document ([`state`]).
//! - [`Layer::Settings`]: the parsed settings file ([`settings`]).
//!
//! Version numbers are never shared between layers. A stored version higher than the chain
//! this build knows about is always refused with [`Error::VersionMismatch`].

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::error::Error;

pub mod schema;
pub mod settings;
pub mod state;

/// Name of the integer field carrying the version in payload layers.
pub const VERSION_FIELD: &str = "version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Schema,
    State,
    Settings,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Layer::Schema => "schema",
            Layer::State => "state",
            Layer::Settings => "settings",
        })
    }
}

/// Where a stored payload stands relative to this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionCheck {
    pub current: u32,
    pub expected: u32,
    pub needs_migration: bool,
    pub is_newer: bool,
}

impl VersionCheck {
    pub fn new(current: u32, expected: u32) -> Self {
        Self {
            current,
            expected,
            needs_migration: current < expected,
            is_newer: current > expected,
        }
    }
}

/// A single step in a payload layer's chain.
///
/// `up` receives the output of the previous step and must tolerate fields it would add
/// already being present, so re-running a chain over migrated data changes nothing.
pub trait PayloadMigration: Send + Sync {
    fn version(&self) -> u32;

    fn name(&self) -> String {
        format!("Migration {}", self.version())
    }

    fn up(&self, payload: Value) -> Result<Value, Error>;

    /// Reverse this step. The default refuses, since most payload steps only add data.
    fn down(&self, _payload: Value) -> Result<Value, Error> {
        Err(Error::Generic(format!(
            "Migration {} ('{}') does not support downgrade",
            self.version(),
            self.name()
        )))
    }
}

impl fmt::Debug for dyn PayloadMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadMigration")
            .field("version", &self.version())
            .field("name", &self.name())
            .finish()
    }
}

/// Check that versions are unique, start at 1 and have no gaps.
pub(crate) fn validate_versions(mut versions: Vec<u32>) -> Result<u32, String> {
    versions.sort();

    for (i, &version) in versions.iter().enumerate() {
        if version == 0 {
            return Err("Migration version must be greater than 0, found version 0".to_string());
        }
        if i > 0 && versions[i - 1] == version {
            return Err(format!("Duplicate migration version found: {}", version));
        }
    }

    for (i, &version) in versions.iter().enumerate() {
        let expected = (i + 1) as u32;
        if version != expected {
            return Err(format!(
                "Migration versions must be contiguous starting at 1. Expected version {}, found {}",
                expected, version
            ));
        }
    }

    Ok(versions.last().copied().unwrap_or(0))
}

/// Read the version field of a payload, treating a missing or malformed field as 0.
pub fn payload_version(payload: &Value) -> u32 {
    payload
        .get(VERSION_FIELD)
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .unwrap_or(0)
}

fn set_payload_version(payload: &mut Value, version: u32) -> Result<(), Error> {
    match payload.as_object_mut() {
        Some(map) => {
            map.insert(VERSION_FIELD.to_string(), Value::from(version));
            Ok(())
        }
        None => Err(Error::Serialization(
            "versioned payload must be a JSON object".to_string(),
        )),
    }
}

/// Brings one payload layer up to the version this build expects.
pub struct VersionCoordinator {
    layer: Layer,
    expected: u32,
    migrations: Vec<Box<dyn PayloadMigration>>,
}

impl fmt::Debug for VersionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionCoordinator")
            .field("layer", &self.layer)
            .field("expected", &self.expected)
            .field("migrations", &self.migrations)
            .finish()
    }
}

impl VersionCoordinator {
    /// Build a coordinator, validating the chain. The expected version is the highest
    /// migration version.
    pub fn try_new(layer: Layer, migrations: Vec<Box<dyn PayloadMigration>>) -> Result<Self, String> {
        let expected = validate_versions(migrations.iter().map(|m| m.version()).collect())?;
        let mut migrations = migrations;
        migrations.sort_by_key(|m| m.version());
        Ok(Self {
            layer,
            expected,
            migrations,
        })
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    pub fn expected_version(&self) -> u32 {
        self.expected
    }

    pub fn migrations(&self) -> &[Box<dyn PayloadMigration>] {
        &self.migrations
    }

    pub fn check_version(&self, payload: &Value) -> VersionCheck {
        VersionCheck::new(payload_version(payload), self.expected)
    }

    /// Apply every pending migration in ascending order.
    ///
    /// The input is never modified; on failure the caller still holds the un-migrated payload
    /// and should persist nothing.
    pub fn migrate(&self, payload: &Value) -> Result<Value, Error> {
        let check = self.check_version(payload);
        if check.is_newer {
            return Err(Error::VersionMismatch {
                layer: self.layer,
                stored: check.current,
                expected: check.expected,
            });
        }

        let mut working = payload.clone();
        for migration in self
            .migrations
            .iter()
            .filter(|m| m.version() > check.current)
        {
            let _span = tracing::info_span!(
                "payload_migration",
                layer = %self.layer,
                version = migration.version(),
                name = %migration.name()
            )
            .entered();

            working = migration.up(working).map_err(|e| {
                tracing::error!(error = %e, "Migration failed");
                Error::Migration {
                    layer: self.layer,
                    version: migration.version(),
                    cause: e.to_string(),
                }
            })?;
            set_payload_version(&mut working, migration.version())?;
            tracing::debug!("Migration applied");
        }

        if check.needs_migration {
            tracing::info!(
                layer = %self.layer,
                from = check.current,
                to = self.expected,
                "Layer migrated"
            );
        }
        set_payload_version(&mut working, self.expected)?;
        Ok(working)
    }

    /// Return the payload unchanged when current, migrated otherwise.
    pub fn ensure_version(&self, payload: Value) -> Result<Value, Error> {
        let check = self.check_version(&payload);
        if check.is_newer {
            return Err(Error::VersionMismatch {
                layer: self.layer,
                stored: check.current,
                expected: check.expected,
            });
        }
        if check.needs_migration {
            self.migrate(&payload)
        } else {
            Ok(payload)
        }
    }

    /// Run `down` for every applied migration above `target`, newest first.
    pub fn downgrade(&self, payload: &Value, target: u32) -> Result<Value, Error> {
        let current = payload_version(payload);
        if current > self.expected {
            return Err(Error::VersionMismatch {
                layer: self.layer,
                stored: current,
                expected: self.expected,
            });
        }
        if target > current {
            return Err(Error::Generic(format!(
                "Cannot downgrade {} to version {} when current version is {}",
                self.layer, target, current
            )));
        }

        let mut working = payload.clone();
        for migration in self
            .migrations
            .iter()
            .rev()
            .filter(|m| m.version() > target && m.version() <= current)
        {
            working = migration.down(working).map_err(|e| Error::Migration {
                layer: self.layer,
                version: migration.version(),
                cause: e.to_string(),
            })?;
            set_payload_version(&mut working, migration.version() - 1)?;
        }
        Ok(working)
    }
}
