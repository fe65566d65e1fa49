//! Content hashing for SQL files and sets of files.
//!
//! Digests are lowercase hex SHA-256. A set of files is reduced to a single digest with
//! [combine], which sorts its inputs first so that directory enumeration order never changes
//! the result.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Error;

/// Hash arbitrary bytes.
pub fn hash_content(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    format!("{:x}", hasher.finalize())
}

/// Read a file and hash its bytes.
pub fn hash_file(path: impl AsRef<Path>) -> Result<String, Error> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| Error::ChecksumIo {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(hash_content(bytes))
}

/// Reduce a set of digests to one digest, independent of input order.
pub fn combine<I, S>(digests: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut sorted: Vec<String> = digests
        .into_iter()
        .map(|d| d.as_ref().to_string())
        .collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    for digest in &sorted {
        hasher.update(digest.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Hash every file and combine the results.
pub fn hash_files<I, P>(paths: I) -> Result<String, Error>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let digests = paths
        .into_iter()
        .map(hash_file)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(combine(digests))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_content_is_fixed_length_hex() {
        let digest = hash_content("CREATE TABLE users (id INTEGER)");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(digest, hash_content(b"CREATE TABLE users (id INTEGER)"));
    }

    #[test]
    fn hash_content_of_empty_input() {
        assert_eq!(
            hash_content(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn combine_ignores_order() {
        let a = hash_content("a");
        let b = hash_content("b");
        let c = hash_content("c");
        assert_eq!(
            combine([&a, &b, &c]),
            combine([c.clone(), a.clone(), b.clone()])
        );
        assert_ne!(combine([&a, &b]), combine([&a, &c]));
    }

    #[test]
    fn hash_file_matches_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("001_users.sql");
        std::fs::write(&path, "CREATE TABLE users (id INTEGER);").unwrap();
        assert_eq!(
            hash_file(&path).unwrap(),
            hash_content("CREATE TABLE users (id INTEGER);")
        );
    }

    #[test]
    fn hash_file_reports_unreadable_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.sql");
        match hash_file(&missing) {
            Err(Error::ChecksumIo { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected ChecksumIo, got {:?}", other),
        }
    }

    #[test]
    fn hash_files_is_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.sql");
        let second = dir.path().join("b.sql");
        std::fs::write(&first, "SELECT 1;").unwrap();
        std::fs::write(&second, "SELECT 2;").unwrap();
        assert_eq!(
            hash_files([&first, &second]).unwrap(),
            hash_files([&second, &first]).unwrap()
        );
    }
}
