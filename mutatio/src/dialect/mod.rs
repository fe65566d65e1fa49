//! The narrow interface through which the engine talks to a target database.
//!
//! The tracker, lock manager and schema migrator only ever see a [`Connection`] trait object.
//! Drivers are resolved at startup from a [`Dialect`] through [`Drivers`], so an embedder can
//! register an opener for a backend that is not compiled in.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[cfg(feature = "mysql")]
#[cfg_attr(docsrs, doc(cfg(feature = "mysql")))]
pub mod mysql;
#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;
pub mod sqlite;

/// Supported SQL backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Sqlite,
    Postgres,
    Mysql,
    Mssql,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
            Dialect::Mysql => "mysql",
            Dialect::Mssql => "mssql",
        }
    }

    /// Positional parameter marker for the 1-based `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Sqlite => format!("?{}", index),
            Dialect::Postgres => format!("${}", index),
            Dialect::Mysql => "?".to_string(),
            Dialect::Mssql => format!("@P{}", index),
        }
    }

    /// Comma separated placeholders `1..=count`.
    pub fn placeholders(&self, count: usize) -> String {
        (1..=count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Expression evaluating to the database clock in epoch milliseconds.
    pub fn now_millis_sql(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)",
            Dialect::Postgres => "CAST(EXTRACT(EPOCH FROM clock_timestamp()) * 1000 AS BIGINT)",
            Dialect::Mysql => "CAST(UNIX_TIMESTAMP(NOW(3)) * 1000 AS SIGNED)",
            Dialect::Mssql => "DATEDIFF_BIG(millisecond, '1970-01-01', SYSUTCDATETIME())",
        }
    }

    /// Column definition for an auto-incrementing primary key named `id`.
    pub fn id_column(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
            Dialect::Postgres => "id BIGSERIAL PRIMARY KEY",
            Dialect::Mysql => "id BIGINT AUTO_INCREMENT PRIMARY KEY",
            Dialect::Mssql => "id BIGINT IDENTITY(1,1) PRIMARY KEY",
        }
    }

    /// Type for short, indexable strings.
    pub fn key_type(&self) -> &'static str {
        match self {
            Dialect::Sqlite | Dialect::Postgres => "TEXT",
            Dialect::Mysql | Dialect::Mssql => "VARCHAR(255)",
        }
    }

    /// Type for unbounded text.
    pub fn text_type(&self) -> &'static str {
        match self {
            Dialect::Sqlite | Dialect::Postgres | Dialect::Mysql => "TEXT",
            Dialect::Mssql => "NVARCHAR(MAX)",
        }
    }

    pub fn drop_table_sql(&self, table: &str) -> String {
        match self {
            Dialect::Postgres => format!("DROP TABLE IF EXISTS \"{}\" CASCADE", table),
            Dialect::Mysql => format!("DROP TABLE IF EXISTS `{}`", table),
            Dialect::Sqlite => format!("DROP TABLE IF EXISTS \"{}\"", table),
            Dialect::Mssql => format!("DROP TABLE IF EXISTS [{}]", table),
        }
    }

    /// Counts indexes named by the second parameter on the table named by the first.
    pub fn index_count_sql(&self) -> &'static str {
        match self {
            Dialect::Sqlite => {
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 AND name = ?2"
            }
            Dialect::Postgres => {
                "SELECT COUNT(*) FROM pg_indexes WHERE tablename = $1 AND indexname = $2"
            }
            Dialect::Mysql => {
                "SELECT COUNT(*) FROM information_schema.statistics \
                 WHERE table_schema = DATABASE() AND table_name = ? AND index_name = ?"
            }
            Dialect::Mssql => {
                "SELECT COUNT(*) FROM sys.indexes WHERE object_id = OBJECT_ID(@P1) AND name = @P2"
            }
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Dialect::Sqlite),
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::Mysql),
            "mssql" | "sqlserver" => Ok(Dialect::Mssql),
            other => Err(Error::UnsupportedDialect(other.to_string())),
        }
    }
}

/// A single bound parameter or result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        SqlValue::Text(value.clone())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// One result row, addressed by column position.
#[derive(Debug, Clone, PartialEq)]
pub struct Row(pub Vec<SqlValue>);

impl Row {
    fn cell(&self, index: usize) -> Result<&SqlValue, Error> {
        self.0
            .get(index)
            .ok_or_else(|| Error::Database(format!("column {} out of range", index)))
    }

    pub fn get_i64(&self, index: usize) -> Result<i64, Error> {
        self.get_opt_i64(index)?
            .ok_or_else(|| Error::Database(format!("column {} is NULL", index)))
    }

    pub fn get_opt_i64(&self, index: usize) -> Result<Option<i64>, Error> {
        match self.cell(index)? {
            SqlValue::Null => Ok(None),
            SqlValue::Integer(v) => Ok(Some(*v)),
            SqlValue::Real(v) => Ok(Some(*v as i64)),
            SqlValue::Text(s) => s
                .parse::<i64>()
                .map(Some)
                .map_err(|e| Error::Database(format!("column {}: {}", index, e))),
        }
    }

    pub fn get_string(&self, index: usize) -> Result<String, Error> {
        self.get_opt_string(index)?
            .ok_or_else(|| Error::Database(format!("column {} is NULL", index)))
    }

    pub fn get_opt_string(&self, index: usize) -> Result<Option<String>, Error> {
        match self.cell(index)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(s) => Ok(Some(s.clone())),
            SqlValue::Integer(v) => Ok(Some(v.to_string())),
            SqlValue::Real(v) => Ok(Some(v.to_string())),
        }
    }
}

/// An open connection to a target database.
///
/// Implementations translate [`SqlValue`] parameters to their driver's types. SQL passed to
/// [`Connection::execute`], [`Connection::query`] and [`Connection::insert`] uses the
/// placeholders returned by [`Dialect::placeholder`].
pub trait Connection: Send {
    fn dialect(&self) -> Dialect;

    /// Run a single statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, Error>;

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, Error>;

    /// Run an INSERT into a table with an `id` key and return the generated id.
    fn insert(&mut self, sql: &str, params: &[SqlValue]) -> Result<i64, Error>;

    /// Run a script that may contain several statements, such as a change file.
    fn execute_script(&mut self, sql: &str) -> Result<(), Error>;

    /// Names of the user tables visible on this connection.
    fn list_tables(&mut self) -> Result<Vec<String>, Error>;

    fn table_exists(&mut self, table: &str) -> Result<bool, Error> {
        Ok(self
            .list_tables()?
            .iter()
            .any(|t| t.eq_ignore_ascii_case(table)))
    }

    fn index_exists(&mut self, table: &str, index: &str) -> Result<bool, Error> {
        let sql = self.dialect().index_count_sql();
        let rows = self.query(sql, &[table.into(), index.into()])?;
        match rows.first() {
            Some(row) => Ok(row.get_i64(0)? > 0),
            None => Ok(false),
        }
    }

    fn drop_table(&mut self, table: &str) -> Result<(), Error> {
        let sql = self.dialect().drop_table_sql(table);
        self.execute(&sql, &[])?;
        Ok(())
    }

    /// The database clock in epoch milliseconds.
    fn now_millis(&mut self) -> Result<i64, Error> {
        let sql = format!("SELECT {}", self.dialect().now_millis_sql());
        let rows = self.query(&sql, &[])?;
        rows.first()
            .ok_or_else(|| Error::Database("clock query returned no rows".to_string()))?
            .get_i64(0)
    }

    fn close(self: Box<Self>) -> Result<(), Error>;
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("dialect", &self.dialect())
            .finish()
    }
}

/// Opens a connection from a connection string.
pub type Opener = fn(&str) -> Result<Box<dyn Connection>, Error>;

/// Maps each dialect to the opener used to connect to it.
#[derive(Clone)]
pub struct Drivers {
    openers: HashMap<Dialect, Opener>,
}

impl fmt::Debug for Drivers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dialects: Vec<_> = self.openers.keys().map(|d| d.as_str()).collect();
        dialects.sort();
        f.debug_struct("Drivers")
            .field("dialects", &dialects)
            .finish()
    }
}

impl Default for Drivers {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Drivers {
    /// No drivers at all.
    pub fn empty() -> Self {
        Self {
            openers: HashMap::new(),
        }
    }

    /// Every driver compiled into this build.
    pub fn builtin() -> Self {
        let mut drivers = Self::empty();
        drivers.register(Dialect::Sqlite, sqlite::open);
        #[cfg(feature = "postgres")]
        drivers.register(Dialect::Postgres, postgres::open);
        #[cfg(feature = "mysql")]
        drivers.register(Dialect::Mysql, mysql::open);
        drivers
    }

    pub fn register(&mut self, dialect: Dialect, opener: Opener) -> &mut Self {
        self.openers.insert(dialect, opener);
        self
    }

    pub fn supports(&self, dialect: Dialect) -> bool {
        self.openers.contains_key(&dialect)
    }

    pub fn open(&self, dialect: Dialect, url: &str) -> Result<Box<dyn Connection>, Error> {
        let opener = self
            .openers
            .get(&dialect)
            .ok_or_else(|| Error::UnsupportedDialect(dialect.to_string()))?;
        tracing::debug!(dialect = %dialect, "Opening connection");
        opener(url)
    }
}
