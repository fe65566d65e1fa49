//! PostgreSQL adapter backed by the synchronous `postgres` client.

use postgres::types::{ToSql, Type};
use postgres::{Client, NoTls};

use super::{Connection, Dialect, Row, SqlValue};
use crate::error::Error;

pub use postgres::Client as PostgresClient;

pub struct PostgresConnection {
    client: Client,
}

impl std::fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConnection")
            .field("closed", &self.client.is_closed())
            .finish()
    }
}

/// Connect with a `postgres://` URL or key/value connection string.
pub fn open(url: &str) -> Result<Box<dyn Connection>, Error> {
    let client = Client::connect(url, NoTls)?;
    Ok(Box::new(PostgresConnection::new(client)))
}

impl PostgresConnection {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Bind each value with the type the server inferred for its parameter, so an `i64` can land
/// in an `int4` column and a NULL in a numeric one.
fn to_params(params: &[SqlValue], types: &[Type]) -> Result<Vec<Box<dyn ToSql + Sync>>, Error> {
    params
        .iter()
        .zip(types.iter().chain(std::iter::repeat(&Type::UNKNOWN)))
        .map(|(p, ty)| bind(p, ty))
        .collect()
}

fn bind(value: &SqlValue, ty: &Type) -> Result<Box<dyn ToSql + Sync>, Error> {
    let narrow = |v: i64| Error::Database(format!("value {} does not fit parameter type {}", v, ty));
    Ok(match (value, ty) {
        (SqlValue::Null, &Type::INT8) => Box::new(Option::<i64>::None),
        (SqlValue::Null, &Type::INT4) => Box::new(Option::<i32>::None),
        (SqlValue::Null, &Type::INT2) => Box::new(Option::<i16>::None),
        (SqlValue::Null, &Type::FLOAT8) => Box::new(Option::<f64>::None),
        (SqlValue::Null, _) => Box::new(Option::<String>::None),
        (SqlValue::Integer(v), &Type::INT4) => Box::new(i32::try_from(*v).map_err(|_| narrow(*v))?),
        (SqlValue::Integer(v), &Type::INT2) => Box::new(i16::try_from(*v).map_err(|_| narrow(*v))?),
        (SqlValue::Integer(v), &Type::BOOL) => Box::new(*v != 0),
        (SqlValue::Integer(v), _) => Box::new(*v),
        (SqlValue::Real(v), &Type::FLOAT4) => Box::new(*v as f32),
        (SqlValue::Real(v), _) => Box::new(*v),
        (SqlValue::Text(s), _) => Box::new(s.clone()),
    })
}

fn convert_row(row: &postgres::Row) -> Result<Row, Error> {
    let mut cells = Vec::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        let cell = match *column.type_() {
            Type::INT8 => row.try_get::<_, Option<i64>>(i)?.map(SqlValue::Integer),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(i)?
                .map(|v| SqlValue::Integer(v as i64)),
            Type::INT2 => row
                .try_get::<_, Option<i16>>(i)?
                .map(|v| SqlValue::Integer(v as i64)),
            Type::BOOL => row
                .try_get::<_, Option<bool>>(i)?
                .map(|v| SqlValue::Integer(v as i64)),
            Type::FLOAT8 => row.try_get::<_, Option<f64>>(i)?.map(SqlValue::Real),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(i)?
                .map(|v| SqlValue::Real(v as f64)),
            _ => row.try_get::<_, Option<String>>(i)?.map(SqlValue::Text),
        };
        cells.push(cell.unwrap_or(SqlValue::Null));
    }
    Ok(Row(cells))
}

impl Connection for PostgresConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, Error> {
        let stmt = self.client.prepare(sql)?;
        let owned = to_params(params, stmt.params())?;
        let refs: Vec<&(dyn ToSql + Sync)> = owned.iter().map(|p| p.as_ref()).collect();
        Ok(self.client.execute(&stmt, &refs)?)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, Error> {
        let stmt = self.client.prepare(sql)?;
        let owned = to_params(params, stmt.params())?;
        let refs: Vec<&(dyn ToSql + Sync)> = owned.iter().map(|p| p.as_ref()).collect();
        self.client
            .query(&stmt, &refs)?
            .iter()
            .map(convert_row)
            .collect()
    }

    fn insert(&mut self, sql: &str, params: &[SqlValue]) -> Result<i64, Error> {
        let stmt = self.client.prepare(&format!("{} RETURNING id", sql))?;
        let owned = to_params(params, stmt.params())?;
        let refs: Vec<&(dyn ToSql + Sync)> = owned.iter().map(|p| p.as_ref()).collect();
        let row = self.client.query_one(&stmt, &refs)?;
        Ok(row.try_get::<_, i64>(0)?)
    }

    fn execute_script(&mut self, sql: &str) -> Result<(), Error> {
        // PostgreSQL DDL is transactional; the whole file commits or nothing does.
        let mut tx = self.client.transaction()?;
        tx.batch_execute(sql)?;
        tx.commit()?;
        Ok(())
    }

    fn list_tables(&mut self) -> Result<Vec<String>, Error> {
        let rows = self.client.query(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
            &[],
        )?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }

    fn close(self: Box<Self>) -> Result<(), Error> {
        self.client.close()?;
        Ok(())
    }
}

/// Runs against a live server named by `MUTATIO_TEST_POSTGRES_URL`; skipped when it is unset.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Hooks;
    use crate::lock::LockManager;
    use crate::tracker::{Direction, OperationKind, OperationOutcome, OperationTracker, RunReason};
    use crate::version::schema::{SchemaMigrator, LOCKS_TABLE, OPERATIONS_TABLE, VERSION_TABLE};
    use std::time::Duration;

    fn connect() -> Option<Box<dyn Connection>> {
        let url = std::env::var("MUTATIO_TEST_POSTGRES_URL").ok()?;
        let mut conn = open(&url).unwrap();
        for table in [OPERATIONS_TABLE, LOCKS_TABLE, VERSION_TABLE] {
            conn.execute(&format!("DROP TABLE IF EXISTS {}", table), &[]).unwrap();
        }
        Some(conn)
    }

    #[test]
    fn tracking_tables_ledger_and_locks_on_postgres() {
        let Some(mut conn) = connect() else {
            return;
        };
        let report = SchemaMigrator::default().migrate(conn.as_mut()).unwrap();
        assert_eq!(report.migrations_run, vec![1, 2]);
        assert_eq!(SchemaMigrator::default().current_version(conn.as_mut()).unwrap(), 2);

        let locks = LockManager::default();
        locks
            .acquire(conn.as_mut(), "pg", "alice", Duration::from_secs(60), Some("deploy"))
            .unwrap();
        assert!(matches!(
            locks.acquire(conn.as_mut(), "pg", "bob", Duration::from_secs(60), None),
            Err(Error::LockConflict { holder, .. }) if holder == "alice"
        ));

        let ops = OperationTracker::new("pg", Hooks::default());
        let id = ops
            .create_operation(conn.as_mut(), "a.sql", OperationKind::Build, Direction::Forward, "alice")
            .unwrap();
        ops.record_result(conn.as_mut(), id, &OperationOutcome::success("h", 3))
            .unwrap();
        let decision = ops
            .needs_run(conn.as_mut(), "a.sql", OperationKind::Build, "h", false)
            .unwrap();
        assert_eq!(decision.reason, RunReason::Unchanged);

        locks.release(conn.as_mut(), "pg", "alice").unwrap();
        conn.close().unwrap();
    }
}
