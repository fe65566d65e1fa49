//! SQLite adapter backed by `rusqlite`.

use std::time::Duration;

use rusqlite::types::{Value, ValueRef};
use rusqlite::params_from_iter;

use super::{Connection, Dialect, Row, SqlValue};
use crate::error::Error;

/// How long a statement waits on a locked database file before failing.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SqliteConnection {
    conn: rusqlite::Connection,
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.conn.path())
            .finish()
    }
}

/// Open a database from a path, `sqlite://path` URL or `:memory:`.
pub fn open(url: &str) -> Result<Box<dyn Connection>, Error> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    let conn = if path.is_empty() || path == ":memory:" {
        rusqlite::Connection::open_in_memory()?
    } else {
        rusqlite::Connection::open(path)?
    };
    Ok(Box::new(SqliteConnection::new(conn)?))
}

impl SqliteConnection {
    /// Wrap an existing connection, applying the default busy timeout so concurrent
    /// writers wait instead of failing immediately.
    pub fn new(conn: rusqlite::Connection) -> Result<Self, Error> {
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        Self::new(rusqlite::Connection::open_in_memory()?)
    }

    /// Access the underlying driver connection.
    pub fn inner(&self) -> &rusqlite::Connection {
        &self.conn
    }
}

fn to_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(v) => Value::Integer(*v),
        SqlValue::Real(v) => Value::Real(*v),
        SqlValue::Text(s) => Value::Text(s.clone()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Integer(v),
        ValueRef::Real(v) => SqlValue::Real(v),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Text(hex::encode(b)),
    }
}

impl Connection for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, Error> {
        let affected = self
            .conn
            .execute(sql, params_from_iter(params.iter().map(to_value)))?;
        Ok(affected as u64)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, Error> {
        let mut stmt = self.conn.prepare(sql)?;
        let column_count = stmt.column_count();
        let rows = stmt
            .query_map(params_from_iter(params.iter().map(to_value)), |row| {
                let mut cells = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    cells.push(from_value_ref(row.get_ref(i)?));
                }
                Ok(Row(cells))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn insert(&mut self, sql: &str, params: &[SqlValue]) -> Result<i64, Error> {
        self.conn
            .execute(sql, params_from_iter(params.iter().map(to_value)))?;
        Ok(self.conn.last_insert_rowid())
    }

    fn execute_script(&mut self, sql: &str) -> Result<(), Error> {
        // SQLite DDL is transactional, so a failing script leaves nothing behind.
        let tx = self.conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.commit()?;
        Ok(())
    }

    fn list_tables(&mut self) -> Result<Vec<String>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let tables = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tables)
    }

    fn close(self: Box<Self>) -> Result<(), Error> {
        self.conn.close().map_err(|(_, e)| Error::from(e))
    }
}
