//! Discovery of SQL files under a project directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::settings::BuildSettings;

/// A SQL file and its tracking name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SqlFile {
    /// Path relative to the discovery root with `/` separators. This is the ledger name.
    pub name: String,
    pub path: PathBuf,
}

impl SqlFile {
    /// Build from an absolute `path` under `root`.
    pub fn new(root: &Path, path: PathBuf) -> Self {
        Self {
            name: relative_name(root, &path),
            path,
        }
    }
}

pub(crate) fn relative_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn is_sql(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("sql"))
        .unwrap_or(false)
}

fn collect(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), Error> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect(&path, out)?;
        } else if path.is_file() && is_sql(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn under(name: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_matches('/');
    prefix.is_empty() || name == prefix || name.starts_with(&format!("{}/", prefix))
}

fn selected(name: &str, filters: &BuildSettings) -> bool {
    let included = filters.include.is_empty() || filters.include.iter().any(|p| under(name, p));
    included && !filters.exclude.iter().any(|p| under(name, p))
}

/// Every `.sql` file under `root` passing `filters`, sorted by name. A missing root is empty.
pub fn discover(root: &Path, filters: &BuildSettings) -> Result<Vec<SqlFile>, Error> {
    if !root.exists() {
        return Ok(vec![]);
    }
    let mut paths = Vec::new();
    collect(root, &mut paths)?;
    let mut files: Vec<SqlFile> = paths
        .into_iter()
        .map(|p| SqlFile::new(root, p))
        .filter(|f| selected(&f.name, filters))
        .collect();
    files.sort();
    tracing::debug!(root = %root.display(), count = files.len(), "Discovered SQL files");
    Ok(files)
}
