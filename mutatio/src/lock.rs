//! Advisory locks stored in the target database.
//!
//! One row per config in `mutatio_locks`. Every timestamp comes from the database clock, so
//! holders on different machines agree on expiry. A lock whose `expires_at` has passed still
//! exists physically until someone reclaims, releases or force releases it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dialect::{Connection, Row, SqlValue};
use crate::error::Error;
use crate::hooks::{Hooks, LockEvent};
use crate::version::schema::LOCKS_TABLE;

/// Lock lifetime used when the caller does not choose one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub config_name: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl LockRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// A raw read of the lock row. `is_locked` says only that the row exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub is_locked: bool,
    pub holder: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl LockStatus {
    /// True when a row exists and its expiry is before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now > at).unwrap_or(false)
    }
}

impl From<Option<LockRecord>> for LockStatus {
    fn from(record: Option<LockRecord>) -> Self {
        match record {
            Some(r) => Self {
                is_locked: true,
                holder: Some(r.locked_by),
                locked_at: Some(r.locked_at),
                expires_at: Some(r.expires_at),
                reason: r.reason,
            },
            None => Self::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReleaseOutcome {
    Released,
    /// Nothing live was held, so there was nothing to release.
    NotLocked,
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>, Error> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Database(format!("timestamp {} out of range", ms)))
}

fn record_from_row(row: &Row) -> Result<LockRecord, Error> {
    Ok(LockRecord {
        config_name: row.get_string(0)?,
        locked_by: row.get_string(1)?,
        locked_at: millis_to_utc(row.get_i64(2)?)?,
        expires_at: millis_to_utc(row.get_i64(3)?)?,
        reason: row.get_opt_string(4)?,
    })
}

#[derive(Debug, Clone, Default)]
pub struct LockManager {
    hooks: Hooks,
}

impl LockManager {
    pub fn new(hooks: Hooks) -> Self {
        Self { hooks }
    }

    pub fn database_now(&self, conn: &mut dyn Connection) -> Result<DateTime<Utc>, Error> {
        millis_to_utc(conn.now_millis()?)
    }

    fn read(&self, conn: &mut dyn Connection, config: &str) -> Result<Option<LockRecord>, Error> {
        let d = conn.dialect();
        let sql = format!(
            "SELECT config_name, locked_by, locked_at, expires_at, reason FROM {} \
             WHERE config_name = {}",
            LOCKS_TABLE,
            d.placeholder(1)
        );
        let rows = conn.query(&sql, &[config.into()])?;
        rows.first().map(record_from_row).transpose()
    }

    /// Delete the row only if it is still exactly `record`, so two reclaimers cannot both win.
    fn delete_exact(&self, conn: &mut dyn Connection, record: &LockRecord) -> Result<bool, Error> {
        let d = conn.dialect();
        let sql = format!(
            "DELETE FROM {} WHERE config_name = {} AND locked_by = {} AND expires_at = {}",
            LOCKS_TABLE,
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3)
        );
        let params: [SqlValue; 3] = [
            record.config_name.as_str().into(),
            record.locked_by.as_str().into(),
            record.expires_at.timestamp_millis().into(),
        ];
        Ok(conn.execute(&sql, &params)? > 0)
    }

    fn conflict(record: LockRecord) -> Error {
        Error::LockConflict {
            config: record.config_name,
            holder: record.locked_by,
            expires_at: record.expires_at,
        }
    }

    /// Take the lock for `config`.
    ///
    /// An expired lock held by someone else is reclaimed. Re-acquiring a lock `holder` already
    /// owns extends its expiry.
    pub fn acquire(
        &self,
        conn: &mut dyn Connection,
        config: &str,
        holder: &str,
        ttl: Duration,
        reason: Option<&str>,
    ) -> Result<LockRecord, Error> {
        let now_ms = conn.now_millis()?;
        let now = millis_to_utc(now_ms)?;
        let expires_ms = now_ms
            .saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
            .min(DateTime::<Utc>::MAX_UTC.timestamp_millis());
        let d = conn.dialect();

        if let Some(existing) = self.read(conn, config)? {
            if existing.locked_by == holder {
                let sql = format!(
                    "UPDATE {} SET expires_at = {}, reason = {} WHERE config_name = {} AND locked_by = {}",
                    LOCKS_TABLE,
                    d.placeholder(1),
                    d.placeholder(2),
                    d.placeholder(3),
                    d.placeholder(4)
                );
                let params: [SqlValue; 4] = [
                    expires_ms.into(),
                    reason.map(str::to_string).or(existing.reason.clone()).into(),
                    config.into(),
                    holder.into(),
                ];
                if conn.execute(&sql, &params)? > 0 {
                    let record = LockRecord {
                        expires_at: millis_to_utc(expires_ms)?,
                        reason: reason.map(str::to_string).or(existing.reason),
                        ..existing
                    };
                    tracing::debug!(config, holder, expires_at = %record.expires_at, "Lock refreshed");
                    self.hooks.lock_changed(&LockEvent::Acquired(record.clone()));
                    return Ok(record);
                }
                // The row changed under us; fall through to a fresh insert.
            } else if !existing.is_expired_at(now) {
                return Err(Self::conflict(existing));
            } else {
                tracing::info!(
                    config,
                    previous_holder = %existing.locked_by,
                    expired_at = %existing.expires_at,
                    "Reclaiming expired lock"
                );
                self.delete_exact(conn, &existing)?;
            }
        }

        let sql = format!(
            "INSERT INTO {} (config_name, locked_by, locked_at, expires_at, reason) VALUES ({})",
            LOCKS_TABLE,
            d.placeholders(5)
        );
        let params: [SqlValue; 5] = [
            config.into(),
            holder.into(),
            now_ms.into(),
            expires_ms.into(),
            reason.into(),
        ];
        if let Err(e) = conn.execute(&sql, &params) {
            // Lost the race on the primary key to another acquirer.
            return match self.read(conn, config)? {
                Some(winner) if winner.locked_by != holder => Err(Self::conflict(winner)),
                _ => Err(e),
            };
        }

        let record = LockRecord {
            config_name: config.to_string(),
            locked_by: holder.to_string(),
            locked_at: now,
            expires_at: millis_to_utc(expires_ms)?,
            reason: reason.map(str::to_string),
        };
        tracing::info!(config, holder, expires_at = %record.expires_at, "Lock acquired");
        self.hooks.lock_changed(&LockEvent::Acquired(record.clone()));
        Ok(record)
    }

    /// Release a lock held by `holder`.
    ///
    /// A live lock held by someone else is refused with [`Error::NotOwner`]. An expired lock
    /// held by someone else is cleared and reported as [`ReleaseOutcome::NotLocked`].
    pub fn release(
        &self,
        conn: &mut dyn Connection,
        config: &str,
        holder: &str,
    ) -> Result<ReleaseOutcome, Error> {
        let Some(existing) = self.read(conn, config)? else {
            tracing::debug!(config, holder, "Release requested but no lock is held");
            return Ok(ReleaseOutcome::NotLocked);
        };

        if existing.locked_by != holder {
            let now = self.database_now(conn)?;
            if !existing.is_expired_at(now) {
                return Err(Error::NotOwner {
                    config: config.to_string(),
                    holder: existing.locked_by,
                    requester: holder.to_string(),
                });
            }
            self.delete_exact(conn, &existing)?;
            tracing::info!(config, previous_holder = %existing.locked_by, "Cleared expired lock on release");
            return Ok(ReleaseOutcome::NotLocked);
        }

        let d = conn.dialect();
        let sql = format!(
            "DELETE FROM {} WHERE config_name = {} AND locked_by = {}",
            LOCKS_TABLE,
            d.placeholder(1),
            d.placeholder(2)
        );
        if conn.execute(&sql, &[config.into(), holder.into()])? == 0 {
            return Ok(ReleaseOutcome::NotLocked);
        }
        tracing::info!(config, holder, "Lock released");
        self.hooks.lock_changed(&LockEvent::Released {
            config: config.to_string(),
            holder: holder.to_string(),
        });
        Ok(ReleaseOutcome::Released)
    }

    /// Remove the lock regardless of holder or expiry, returning what was removed.
    ///
    /// This can race with a holder that is still running.
    pub fn force_release(
        &self,
        conn: &mut dyn Connection,
        config: &str,
    ) -> Result<Option<LockRecord>, Error> {
        let previous = self.read(conn, config)?;
        let d = conn.dialect();
        let sql = format!(
            "DELETE FROM {} WHERE config_name = {}",
            LOCKS_TABLE,
            d.placeholder(1)
        );
        conn.execute(&sql, &[config.into()])?;

        match &previous {
            Some(record) => tracing::warn!(
                config,
                previous_holder = %record.locked_by,
                expires_at = %record.expires_at,
                "Lock force released"
            ),
            None => tracing::warn!(config, "Force release requested but no lock was held"),
        }
        self.hooks.lock_changed(&LockEvent::ForceReleased {
            config: config.to_string(),
            previous: previous.clone(),
        });
        Ok(previous)
    }

    pub fn status(&self, conn: &mut dyn Connection, config: &str) -> Result<LockStatus, Error> {
        Ok(self.read(conn, config)?.into())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::dialect::sqlite::SqliteConnection;
    use crate::version::schema::SchemaMigrator;

    fn setup() -> SqliteConnection {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        SchemaMigrator::default().migrate(&mut conn).unwrap();
        conn
    }

    fn expire(conn: &mut SqliteConnection, config: &str) {
        conn.execute(
            "UPDATE mutatio_locks SET expires_at = locked_at - 1000 WHERE config_name = ?1",
            &[config.into()],
        )
        .unwrap();
    }

    #[test]
    fn second_holder_conflicts_until_released() {
        let mut conn = setup();
        let locks = LockManager::default();
        let a = locks
            .acquire(&mut conn, "dev", "alice", DEFAULT_TTL, Some("deploy"))
            .unwrap();
        assert_eq!(a.locked_by, "alice");
        assert!(a.expires_at > a.locked_at);

        let err = locks
            .acquire(&mut conn, "dev", "bob", DEFAULT_TTL, None)
            .unwrap_err();
        match err {
            Error::LockConflict { config, holder, expires_at } => {
                assert_eq!(config, "dev");
                assert_eq!(holder, "alice");
                assert_eq!(expires_at, a.expires_at);
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        assert_eq!(
            locks.release(&mut conn, "dev", "alice").unwrap(),
            ReleaseOutcome::Released
        );
        let b = locks.acquire(&mut conn, "dev", "bob", DEFAULT_TTL, None).unwrap();
        assert_eq!(b.locked_by, "bob");
    }

    #[test]
    fn expired_lock_is_reclaimed() {
        let mut conn = setup();
        let locks = LockManager::default();
        locks.acquire(&mut conn, "dev", "alice", DEFAULT_TTL, None).unwrap();
        expire(&mut conn, "dev");

        let status = locks.status(&mut conn, "dev").unwrap();
        assert!(status.is_locked);
        let now = locks.database_now(&mut conn).unwrap();
        assert!(status.is_expired_at(now));

        let b = locks.acquire(&mut conn, "dev", "bob", DEFAULT_TTL, None).unwrap();
        assert_eq!(b.locked_by, "bob");
        assert_eq!(locks.status(&mut conn, "dev").unwrap().holder.as_deref(), Some("bob"));
    }

    #[test]
    fn reacquire_by_holder_extends_expiry() {
        let mut conn = setup();
        let locks = LockManager::default();
        let first = locks
            .acquire(&mut conn, "dev", "alice", Duration::from_secs(60), Some("deploy"))
            .unwrap();
        let second = locks
            .acquire(&mut conn, "dev", "alice", Duration::from_secs(600), None)
            .unwrap();
        assert_eq!(second.locked_at, first.locked_at);
        assert!(second.expires_at > first.expires_at);
        assert_eq!(second.reason.as_deref(), Some("deploy"));
    }

    #[test]
    fn release_distinguishes_no_lock_from_wrong_holder() {
        let mut conn = setup();
        let locks = LockManager::default();
        assert_eq!(
            locks.release(&mut conn, "dev", "alice").unwrap(),
            ReleaseOutcome::NotLocked
        );

        locks.acquire(&mut conn, "dev", "alice", DEFAULT_TTL, None).unwrap();
        let err = locks.release(&mut conn, "dev", "bob").unwrap_err();
        assert!(matches!(
            err,
            Error::NotOwner { ref holder, ref requester, .. } if holder == "alice" && requester == "bob"
        ));
        assert!(locks.status(&mut conn, "dev").unwrap().is_locked);

        expire(&mut conn, "dev");
        assert_eq!(
            locks.release(&mut conn, "dev", "bob").unwrap(),
            ReleaseOutcome::NotLocked
        );
        assert!(!locks.status(&mut conn, "dev").unwrap().is_locked);
    }

    #[test]
    fn force_release_reports_previous_holder() {
        let mut conn = setup();
        let events = Arc::new(Mutex::new(vec![]));
        let sink = events.clone();
        let locks = LockManager::new(Hooks::new().on_lock_change(move |e| {
            sink.lock().unwrap().push(e.clone());
        }));

        locks.acquire(&mut conn, "dev", "alice", DEFAULT_TTL, None).unwrap();
        let previous = locks.force_release(&mut conn, "dev").unwrap();
        assert_eq!(previous.as_ref().map(|r| r.locked_by.as_str()), Some("alice"));
        assert_eq!(locks.status(&mut conn, "dev").unwrap(), LockStatus::default());
        assert_eq!(locks.force_release(&mut conn, "dev").unwrap(), None);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], LockEvent::Acquired(_)));
        assert!(matches!(
            events[1],
            LockEvent::ForceReleased { previous: Some(_), .. }
        ));
    }

    #[test]
    fn locks_are_per_config() {
        let mut conn = setup();
        let locks = LockManager::default();
        locks.acquire(&mut conn, "dev", "alice", DEFAULT_TTL, None).unwrap();
        locks.acquire(&mut conn, "prod", "bob", DEFAULT_TTL, None).unwrap();
        assert_eq!(locks.status(&mut conn, "prod").unwrap().holder.as_deref(), Some("bob"));
    }

    /// Runs `competing` on the inner connection right before the first statement that starts
    /// with `trigger`, standing in for another process acting between our read and our write.
    struct Interleaved {
        inner: SqliteConnection,
        trigger: &'static str,
        competing: &'static str,
        fired: bool,
    }

    impl Connection for Interleaved {
        fn dialect(&self) -> crate::dialect::Dialect {
            self.inner.dialect()
        }
        fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, Error> {
            if !self.fired && sql.starts_with(self.trigger) {
                self.fired = true;
                self.inner.execute_script(self.competing)?;
            }
            self.inner.execute(sql, params)
        }
        fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, Error> {
            self.inner.query(sql, params)
        }
        fn insert(&mut self, sql: &str, params: &[SqlValue]) -> Result<i64, Error> {
            self.inner.insert(sql, params)
        }
        fn execute_script(&mut self, sql: &str) -> Result<(), Error> {
            self.inner.execute_script(sql)
        }
        fn list_tables(&mut self) -> Result<Vec<String>, Error> {
            self.inner.list_tables()
        }
        fn close(self: Box<Self>) -> Result<(), Error> {
            Box::new(self.inner).close()
        }
    }

    const CAROL_TAKES_LOCK: &str = "INSERT INTO mutatio_locks \
        (config_name, locked_by, locked_at, expires_at, reason) \
        VALUES ('dev', 'carol', 0, 32503680000000, NULL);";

    fn assert_carol_wins(result: Result<LockRecord, Error>) {
        match result {
            Err(Error::LockConflict { config, holder, .. }) => {
                assert_eq!(config, "dev");
                assert_eq!(holder, "carol");
            }
            other => panic!("expected conflict with carol, got {:?}", other),
        }
    }

    #[test]
    fn losing_the_insert_race_is_a_conflict() {
        let mut conn = Interleaved {
            inner: setup(),
            trigger: "INSERT INTO mutatio_locks",
            competing: CAROL_TAKES_LOCK,
            fired: false,
        };
        let locks = LockManager::default();
        assert_carol_wins(locks.acquire(&mut conn, "dev", "bob", DEFAULT_TTL, None));
        assert_eq!(locks.status(&mut conn, "dev").unwrap().holder.as_deref(), Some("carol"));
    }

    #[test]
    fn losing_the_reclaim_race_is_a_conflict() {
        let mut inner = setup();
        let locks = LockManager::default();
        locks.acquire(&mut inner, "dev", "alice", DEFAULT_TTL, None).unwrap();
        expire(&mut inner, "dev");

        let mut conn = Interleaved {
            inner,
            trigger: "DELETE FROM mutatio_locks",
            competing: "DELETE FROM mutatio_locks WHERE config_name = 'dev';\
                INSERT INTO mutatio_locks (config_name, locked_by, locked_at, expires_at, reason) \
                VALUES ('dev', 'carol', 0, 32503680000000, NULL);",
            fired: false,
        };
        assert_carol_wins(locks.acquire(&mut conn, "dev", "bob", DEFAULT_TTL, None));
        assert!(conn.fired);
    }

    #[test]
    fn huge_ttl_is_clamped_not_wrapped() {
        let mut conn = setup();
        let locks = LockManager::default();
        let record = locks
            .acquire(&mut conn, "dev", "alice", Duration::from_secs(u64::MAX), None)
            .unwrap();
        assert!(record.expires_at > record.locked_at);
        assert_eq!(
            record.expires_at.timestamp_millis(),
            DateTime::<Utc>::MAX_UTC.timestamp_millis()
        );

        let status = locks.status(&mut conn, "dev").unwrap();
        assert!(status.is_locked);
        let now = locks.database_now(&mut conn).unwrap();
        assert!(!status.is_expired_at(now));
        assert!(matches!(
            locks.acquire(&mut conn, "dev", "bob", DEFAULT_TTL, None),
            Err(Error::LockConflict { .. })
        ));
    }
}
