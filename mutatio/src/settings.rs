//! The project settings file (`mutatio.toml`).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::version;

pub const DEFAULT_FILE_NAME: &str = "mutatio.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paths {
    pub sql: PathBuf,
    pub changes: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            sql: PathBuf::from("sql"),
            changes: PathBuf::from("changes"),
        }
    }
}

/// Glob-free path filters relative to the sql root. A file is built when it sits under some
/// `include` prefix (or `include` is empty) and under no `exclude` prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildSettings {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Config the stage runs against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub enabled: bool,
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub stages: BTreeMap<String, Stage>,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: version::settings::migrations().len() as u32,
            paths: Paths::default(),
            build: BuildSettings::default(),
            stages: BTreeMap::new(),
            logging: LoggingSettings::default(),
        }
    }
}

/// Settings plus whether they had to be migrated on the way in.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSettings {
    pub settings: Settings,
    pub migrated_from: Option<u32>,
}

impl Settings {
    /// Parse TOML text and bring it to the current version.
    pub fn parse(text: &str) -> Result<LoadedSettings, Error> {
        let raw: toml::Value = toml::from_str(text)?;
        let stored: Value = serde_json::to_value(raw)?;

        let coordinator = version::settings::coordinator()?;
        let check = coordinator.check_version(&stored);
        let current = coordinator.ensure_version(stored)?;
        Ok(LoadedSettings {
            settings: serde_json::from_value(current)?,
            migrated_from: check.needs_migration.then_some(check.current),
        })
    }

    /// Load `path`, rewriting it when it was migrated. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }
        let loaded = Self::parse(&fs::read_to_string(path)?)?;
        if let Some(from) = loaded.migrated_from {
            tracing::info!(path = %path.display(), from, to = loaded.settings.version, "Settings file migrated");
            loaded.settings.save(path)?;
        }
        Ok(loaded.settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn sql_dir(&self, project: &Path) -> PathBuf {
        project.join(&self.paths.sql)
    }

    pub fn changes_dir(&self, project: &Path) -> PathBuf {
        project.join(&self.paths.changes)
    }
}
