//! Change folders.
//!
//! A change is a directory under the changes root:
//!
//! ```text
//! changes/
//!   2024_01_add_users/
//!     change/
//!       01_table.sql
//!       02_shared.txt      # manifest: one path per line, relative to the sql root
//!     revert/
//!       01_drop.sql
//! ```
//!
//! Within `change/` and `revert/`, entries run in file name order. A `.sql` entry runs itself;
//! a `.txt` manifest expands to the files it lists. Blank lines and `#` comments in manifests
//! are ignored.

use std::fs;
use std::path::{Path, PathBuf};

use crate::checksum;
use crate::error::Error;

mod manager;

pub use manager::{ChangeListing, ChangeManager};

const FORWARD_DIR: &str = "change";
const REVERT_DIR: &str = "revert";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub name: String,
    pub dir: PathBuf,
    /// Resolved forward scripts in execution order.
    pub forward: Vec<PathBuf>,
    pub revert: Vec<PathBuf>,
}

/// The loaded text of one side of a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scripts {
    pub checksum: String,
    pub sql: Vec<String>,
}

/// Entries of a manifest, in order.
pub fn parse_manifest(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| match line.find('#') {
            Some(at) => &line[..at],
            None => line,
        })
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn resolve_side(dir: &Path, sql_root: &Path) -> Result<Vec<PathBuf>, Error> {
    if !dir.is_dir() {
        return Ok(vec![]);
    }
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    entries.sort();

    let mut resolved = Vec::new();
    for entry in entries {
        let ext = entry
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        match ext.as_deref() {
            Some("sql") => resolved.push(entry),
            Some("txt") => {
                for reference in parse_manifest(&fs::read_to_string(&entry)?) {
                    let target = sql_root.join(&reference);
                    if !target.is_file() {
                        return Err(Error::ManifestReference {
                            manifest: entry.clone(),
                            reference: PathBuf::from(reference),
                        });
                    }
                    resolved.push(target);
                }
            }
            _ => {}
        }
    }
    Ok(resolved)
}

impl Change {
    /// Load the change folder `name`. Fails with [`Error::ChangeNotFound`] if it is missing.
    pub fn load(changes_root: &Path, sql_root: &Path, name: &str) -> Result<Self, Error> {
        let dir = changes_root.join(name);
        if !dir.is_dir() {
            return Err(Error::ChangeNotFound(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            forward: resolve_side(&dir.join(FORWARD_DIR), sql_root)?,
            revert: resolve_side(&dir.join(REVERT_DIR), sql_root)?,
            dir,
        })
    }

    pub fn has_revert(&self) -> bool {
        !self.revert.is_empty()
    }

    fn scripts(paths: &[PathBuf]) -> Result<Scripts, Error> {
        let sql = paths
            .iter()
            .map(|p| {
                fs::read_to_string(p).map_err(|source| Error::ChecksumIo {
                    path: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Scripts {
            checksum: checksum::hash_files(paths)?,
            sql,
        })
    }

    pub fn forward_scripts(&self) -> Result<Scripts, Error> {
        Self::scripts(&self.forward)
    }

    pub fn revert_scripts(&self) -> Result<Scripts, Error> {
        Self::scripts(&self.revert)
    }
}

/// Names of every change folder under `changes_root`, sorted.
pub fn change_names(changes_root: &Path) -> Result<Vec<String>, Error> {
    if !changes_root.is_dir() {
        return Ok(vec![]);
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(changes_root)? {
        let entry = entry?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}
