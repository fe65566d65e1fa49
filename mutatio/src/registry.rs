//! Per-command connection management.
//!
//! A [`ConnectionRegistry`] is owned by the command context and handed to whatever needs a
//! connection. Connections are opened on first use, cached by config name and closed together
//! by [`ConnectionRegistry::close_all`], each with its own deadline so one hung connection
//! cannot hold up the others.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dialect::{Connection, Dialect, Drivers};
use crate::error::Error;

/// Where a named configuration points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub dialect: Dialect,
    pub url: String,
}

impl TargetConfig {
    pub fn new(name: impl Into<String>, dialect: Dialect, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dialect,
            url: url.into(),
        }
    }
}

/// What happened to each connection during [`ConnectionRegistry::close_all`].
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct CloseReport {
    pub closed: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub timed_out: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    drivers: Drivers,
    connections: BTreeMap<String, Box<dyn Connection>>,
}

impl ConnectionRegistry {
    pub fn new(drivers: Drivers) -> Self {
        Self {
            drivers,
            connections: BTreeMap::new(),
        }
    }

    /// Return the cached connection for `config`, opening it on first use.
    pub fn get(&mut self, config: &TargetConfig) -> Result<&mut dyn Connection, Error> {
        if !self.connections.contains_key(&config.name) {
            let conn = self.drivers.open(config.dialect, &config.url)?;
            tracing::debug!(config = %config.name, dialect = %config.dialect, "Connection opened");
            self.connections.insert(config.name.clone(), conn);
        }
        self.connections
            .get_mut(&config.name)
            .map(|c| c.as_mut() as &mut dyn Connection)
            .ok_or_else(|| Error::Generic(format!("connection '{}' vanished", config.name)))
    }

    /// Register an already-open connection under `name`, replacing any previous one.
    pub fn insert(&mut self, name: impl Into<String>, conn: Box<dyn Connection>) {
        self.connections.insert(name.into(), conn);
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.connections.contains_key(name)
    }

    pub fn open_names(&self) -> Vec<String> {
        self.connections.keys().cloned().collect()
    }

    /// Close one connection. Closing a name that is not open is a no-op.
    pub fn close(&mut self, name: &str) -> Result<(), Error> {
        match self.connections.remove(name) {
            Some(conn) => conn.close(),
            None => Ok(()),
        }
    }

    /// Close every open connection, giving each `timeout` to finish.
    ///
    /// A connection that misses its deadline is abandoned on its closing thread and reported
    /// in [`CloseReport::timed_out`].
    pub fn close_all(&mut self, timeout: Duration) -> CloseReport {
        let pending: Vec<_> = std::mem::take(&mut self.connections)
            .into_iter()
            .map(|(name, conn)| {
                let (tx, rx) = mpsc::channel();
                std::thread::spawn(move || {
                    let _ = tx.send(conn.close());
                });
                (name, rx)
            })
            .collect();

        let mut report = CloseReport::default();
        for (name, rx) in pending {
            match rx.recv_timeout(timeout) {
                Ok(Ok(())) => report.closed.push(name),
                Ok(Err(e)) => {
                    tracing::warn!(config = %name, error = %e, "Connection failed to close cleanly");
                    report.failed.push((name, e.to_string()));
                }
                Err(_) => {
                    tracing::warn!(config = %name, timeout_ms = timeout.as_millis() as u64, "Connection close timed out");
                    report.timed_out.push(name);
                }
            }
        }
        report
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        if !self.connections.is_empty() {
            self.close_all(Duration::from_secs(5));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{Row, SqlValue};

    struct Hanging;

    impl Connection for Hanging {
        fn dialect(&self) -> Dialect {
            Dialect::Mssql
        }
        fn execute(&mut self, _sql: &str, _params: &[SqlValue]) -> Result<u64, Error> {
            Ok(0)
        }
        fn query(&mut self, _sql: &str, _params: &[SqlValue]) -> Result<Vec<Row>, Error> {
            Ok(vec![])
        }
        fn insert(&mut self, _sql: &str, _params: &[SqlValue]) -> Result<i64, Error> {
            Ok(0)
        }
        fn execute_script(&mut self, _sql: &str) -> Result<(), Error> {
            Ok(())
        }
        fn list_tables(&mut self) -> Result<Vec<String>, Error> {
            Ok(vec![])
        }
        fn close(self: Box<Self>) -> Result<(), Error> {
            std::thread::sleep(Duration::from_secs(2));
            Ok(())
        }
    }

    #[test]
    fn caches_connections_by_config_name() {
        let mut registry = ConnectionRegistry::new(Drivers::builtin());
        let config = TargetConfig::new("dev", Dialect::Sqlite, ":memory:");
        registry
            .get(&config)
            .unwrap()
            .execute_script("CREATE TABLE cached (id INTEGER)")
            .unwrap();
        // Same in-memory database comes back, so the table is still there.
        assert_eq!(
            registry.get(&config).unwrap().list_tables().unwrap(),
            vec!["cached"]
        );
        assert_eq!(registry.open_names(), vec!["dev"]);
    }

    #[test]
    fn close_all_reports_each_connection() {
        let mut registry = ConnectionRegistry::new(Drivers::builtin());
        registry
            .get(&TargetConfig::new("a", Dialect::Sqlite, ":memory:"))
            .unwrap();
        registry
            .get(&TargetConfig::new("b", Dialect::Sqlite, ":memory:"))
            .unwrap();
        registry.insert("stuck", Box::new(Hanging));

        let report = registry.close_all(Duration::from_millis(200));
        assert_eq!(report.closed, vec!["a", "b"]);
        assert_eq!(report.timed_out, vec!["stuck"]);
        assert!(report.failed.is_empty());
        assert!(registry.open_names().is_empty());
    }

    #[test]
    fn unknown_dialect_is_reported() {
        let mut registry = ConnectionRegistry::new(Drivers::builtin());
        let err = registry
            .get(&TargetConfig::new("prod", Dialect::Mssql, "server=db"))
            .err();
        assert!(matches!(err, Some(Error::UnsupportedDialect(_))));
        assert!(!registry.is_open("prod"));
    }
}
