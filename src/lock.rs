//! A distributed lock manager backed by a SQL table.
//!
//! A lock is one row: it is held iff a row with the lock's id and hash
//! exists and its `last_contact` is within `expiry` seconds. Acquisition is
//! a plain INSERT, preceded by a sweep that deletes rows whose holders
//! went silent; a duplicate-key error means someone else holds the lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::error_code::ER_DUP_ENTRY;
use crate::options::ConnectOptions;
use crate::params::{utcnow, Param, Params};
use crate::utility::SqlUtility;

fn lock_table_ddl(table_name: &str) -> String {
    format!(
        r"CREATE TABLE IF NOT EXISTS `{table_name}` (
    id VARCHAR(255) PRIMARY KEY,
    lock_hash BINARY(32),
    owner VARCHAR(1024),
    last_contact DATETIME,
    expiry INT
)"
    )
}

/// How [`SqlLockManager::acquire`] behaves when the lock is held.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Recorded on the lock row for operators; not part of lock identity.
    pub owner: String,
    /// Seconds of holder silence after which the lock is reclaimable.
    pub expiry: u64,
    /// Keep retrying until the lock is acquired (or `timeout` elapses).
    pub block: bool,
    pub timeout: Option<Duration>,
    pub retry_interval: Duration,
}

impl Default for AcquireOptions {
    fn default() -> AcquireOptions {
        AcquireOptions {
            owner: String::new(),
            expiry: 5 * 60,
            block: false,
            timeout: None,
            retry_interval: Duration::from_millis(500),
        }
    }
}

impl AcquireOptions {
    pub fn blocking() -> AcquireOptions {
        AcquireOptions {
            block: true,
            ..AcquireOptions::default()
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> AcquireOptions {
        self.owner = owner.into();
        self
    }

    pub fn expiry(mut self, expiry: Duration) -> AcquireOptions {
        self.expiry = expiry.as_secs();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> AcquireOptions {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_interval(mut self, retry_interval: Duration) -> AcquireOptions {
        self.retry_interval = retry_interval;
        self
    }
}

/// Hands out [`SqlLock`]s stored in one table.
///
/// Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct SqlLockManager {
    inner: Arc<LockInner>,
}

struct LockInner {
    utility: SqlUtility,
    table_name: String,
}

impl SqlLockManager {
    /// A lock namespace stored in `<table_prefix>_locks`.
    pub fn new(table_prefix: &str) -> SqlLockManager {
        let table_name = format!("{}_locks", table_prefix.trim_end_matches('_'));
        let mut utility = SqlUtility::new();
        utility.define_table(table_name.clone(), lock_table_ddl(&table_name));
        SqlLockManager {
            inner: Arc::new(LockInner {
                utility,
                table_name,
            }),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.inner.table_name
    }

    pub async fn connect(&self, opts: ConnectOptions) -> Result<()> {
        self.inner.utility.connect(opts).await
    }

    pub async fn disconnect(&self) {
        self.inner.utility.disconnect().await;
    }

    pub async fn setup(&self) -> Result<()> {
        self.inner.utility.setup().await
    }

    pub async fn destroy(&self) -> Result<()> {
        self.inner.utility.destroy().await
    }

    pub async fn ready(&self) -> Result<bool> {
        self.inner.utility.ready().await
    }

    /// Attempts to take the lock named `lock_id`. Returns `None` when the
    /// lock is held by someone else; in blocking mode, retries every
    /// `retry_interval` until it is free or `timeout` elapses.
    pub async fn acquire(
        &self,
        lock_id: &str,
        options: AcquireOptions,
    ) -> Result<Option<SqlLock>> {
        let begun = Instant::now();
        loop {
            let lock = self
                .acquire_once(lock_id, &options.owner, options.expiry)
                .await?;
            if lock.is_some() || !options.block {
                return Ok(lock);
            }
            if let Some(timeout) = options.timeout {
                if begun.elapsed() > timeout {
                    return Ok(None);
                }
            }
            tokio::time::sleep(options.retry_interval).await;
        }
    }

    async fn acquire_once(
        &self,
        lock_id: &str,
        owner: &str,
        expiry: u64,
    ) -> Result<Option<SqlLock>> {
        let mut conn = self.inner.utility.conn().await?;

        // sweep abandoned holders before trying to insert
        conn.execute(
            &format!(
                "DELETE FROM `{}` WHERE last_contact <= %s - INTERVAL expiry SECOND",
                self.inner.table_name
            ),
            Params::Positional(vec![Param::datetime(utcnow())]),
        )
        .await?;

        let lock_hash = uuid::Uuid::new_v4().simple().to_string();
        let inserted = conn
            .execute(
                &format!(
                    "INSERT INTO `{}` (id, lock_hash, owner, expiry, last_contact) \
                     VALUES (%s, %s, %s, %s, %s)",
                    self.inner.table_name
                ),
                Params::Positional(vec![
                    Param::value(lock_id),
                    Param::value(lock_hash.clone()),
                    Param::value(owner),
                    Param::value(expiry),
                    Param::datetime(utcnow()),
                ]),
            )
            .await;

        match inserted {
            Ok(_) => Ok(Some(SqlLock {
                manager: self.clone(),
                lock_id: lock_id.to_owned(),
                lock_hash,
                owner: owner.to_owned(),
            })),
            Err(error) if error.server_code() == Some(ER_DUP_ENTRY) => Ok(None),
            Err(error) => Err(error),
        }
    }
}

impl std::fmt::Debug for SqlLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlLockManager")
            .field("table_name", &self.inner.table_name)
            .finish()
    }
}

/// A held (or formerly held) distributed lock.
///
/// Holders prove liveness with [`ping`](SqlLock::ping); a holder silent for
/// longer than its expiry is swept by the next acquirer. Call
/// [`release`](SqlLock::release) when done; a dropped lock is simply left
/// to expire.
pub struct SqlLock {
    manager: SqlLockManager,
    lock_id: String,
    lock_hash: String,
    pub owner: String,
}

impl SqlLock {
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// `true` while this acquisition still holds the lock.
    pub async fn valid(&self) -> Result<bool> {
        let sql = format!(
            r"SELECT
    (lock_hash = %(lock_hash)s && last_contact > %(now)s - INTERVAL expiry SECOND) AS valid
FROM `{table}` WHERE id = %(lock_id)s",
            table = self.manager.inner.table_name,
        );

        let mut conn = self.manager.inner.utility.conn().await?;
        let row = conn.get(&sql, self.guard_params()).await?;

        match row {
            Some(row) => Ok(row.get::<Option<i64>>("valid")? == Some(1)),
            None => Ok(false),
        }
    }

    /// Heartbeat: notifies the manager that this lock is still active.
    pub async fn ping(&self) -> Result<bool> {
        let sql = format!(
            "UPDATE `{}` SET last_contact = %(now)s \
             WHERE id = %(lock_id)s AND lock_hash = %(lock_hash)s",
            self.manager.inner.table_name
        );

        let mut conn = self.manager.inner.utility.conn().await?;
        let affected = conn.query(&sql, self.guard_params()).await?.affected();
        Ok(affected == 1)
    }

    /// Releases the lock; `false` when it was no longer held.
    pub async fn release(&self) -> Result<bool> {
        if !self.valid().await? {
            return Ok(false);
        }

        let sql = format!(
            "DELETE FROM `{}` WHERE id = %(lock_id)s AND lock_hash = %(lock_hash)s",
            self.manager.inner.table_name
        );

        let mut conn = self.manager.inner.utility.conn().await?;
        let affected = conn.query(&sql, self.guard_params()).await?.affected();
        Ok(affected == 1)
    }

    fn guard_params(&self) -> Params {
        Params::Named(BTreeMap::from([
            ("now".to_owned(), Param::datetime(utcnow())),
            ("lock_id".to_owned(), Param::value(self.lock_id.clone())),
            ("lock_hash".to_owned(), Param::value(self.lock_hash.clone())),
        ]))
    }
}

impl std::fmt::Debug for SqlLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlLock")
            .field("lock_id", &self.lock_id)
            .field("owner", &self.owner)
            .finish()
    }
}
