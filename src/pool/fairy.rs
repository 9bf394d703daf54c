//! A scoped, exclusive borrow of a pooled connection.

use std::io::ErrorKind;
use std::sync::Arc;

use crate::connection::{Connection, QueryOutput};
use crate::error::{Error, Result};
use crate::params::Params;
use crate::pool::{failure_details, PoolInner, PoolKey};
use crate::row::Row;

const RELEASED: &str = "(bug) connection already released to pool";

/// A connection checked out from [`ConnectionPool`](crate::ConnectionPool).
///
/// Returns its session to the pool when dropped. Every delegated call runs
/// through an error classifier: a failure that means the session is gone
/// expires the fairy — so checkin closes rather than re-pools it — and is
/// reraised as [`Error::ConnectionFailure`]; everything else propagates
/// verbatim.
pub struct PoolFairy {
    conn: Option<Connection>,
    key: PoolKey,
    expired: bool,
    pool: Arc<PoolInner>,
}

enum Classification {
    /// The session is unusable; expire and consolidate.
    Failure,
    /// Driver-level trouble that may or may not have killed the session;
    /// decided by a sentinel probe.
    Operational,
    /// An application error; never the pool's business.
    Rethrow,
}

impl PoolFairy {
    pub(crate) fn new(conn: Connection, key: PoolKey, pool: Arc<PoolInner>) -> PoolFairy {
        PoolFairy {
            conn: Some(conn),
            key,
            expired: false,
            pool,
        }
    }

    /// Marks the session so checkin closes it instead of re-pooling it.
    pub fn expire(&mut self) {
        self.expired = true;
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// The destination this borrow is addressed to.
    pub fn connection_info(&self) -> (&str, u16) {
        (&self.key.host, self.key.port)
    }

    pub async fn query(&mut self, sql: &str, params: impl Into<Params>) -> Result<QueryOutput> {
        let result = self.conn_mut().query(sql, params).await;
        self.guard(result).await
    }

    pub async fn debug_query(
        &mut self,
        sql: &str,
        params: impl Into<Params>,
    ) -> Result<QueryOutput> {
        let result = self.conn_mut().debug_query(sql, params).await;
        self.guard(result).await
    }

    pub async fn get(&mut self, sql: &str, params: impl Into<Params>) -> Result<Option<Row>> {
        let result = self.conn_mut().get(sql, params).await;
        self.guard(result).await
    }

    pub async fn execute(&mut self, sql: &str, params: impl Into<Params>) -> Result<u64> {
        let result = self.conn_mut().execute(sql, params).await;
        self.guard(result).await
    }

    pub async fn ping(&mut self) -> Result<()> {
        let result = self.conn_mut().ping().await;
        self.guard(result).await
    }

    pub async fn connected(&mut self) -> bool {
        self.conn_mut().connected().await
    }

    pub async fn reconnect(&mut self) -> Result<()> {
        let result = self.conn_mut().reconnect().await;
        self.guard(result).await
    }

    pub async fn select_db(&mut self, database: &str) -> Result<()> {
        let result = self.conn_mut().select_db(database).await;
        self.guard(result).await
    }

    /// Affected-row count of the most recent statement.
    pub fn affected_rows(&self) -> u64 {
        self.conn_ref().affected_rows()
    }

    fn conn_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect(RELEASED)
    }

    fn conn_ref(&self) -> &Connection {
        self.conn.as_ref().expect(RELEASED)
    }

    async fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        match classify(&error) {
            Classification::Rethrow => Err(error),
            Classification::Failure => Err(self.fail(error)),
            Classification::Operational => {
                // probe the raw session; only a dead one is our problem
                let probe = self.conn_mut().query("SELECT 1", Params::Empty).await;
                if probe.is_err() {
                    Err(self.fail(error))
                } else {
                    Err(error)
                }
            }
        }
    }

    fn fail(&mut self, error: Error) -> Error {
        self.expire();
        let (errno, message) = match &error {
            Error::Driver(driver) => failure_details(driver),
            other => (crate::error::ECONNABORTED, other.to_string()),
        };
        Error::connection_failure(errno, message, self.key.clone())
    }
}

fn classify(error: &Error) -> Classification {
    match error {
        Error::Driver(mysql_async::Error::Io(mysql_async::IoError::Io(io))) => match io.kind() {
            ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused | ErrorKind::TimedOut => {
                Classification::Failure
            }
            _ => Classification::Operational,
        },
        Error::Driver(mysql_async::Error::Io(_)) => Classification::Operational,
        Error::Driver(mysql_async::Error::Driver(_)) => Classification::Operational,
        _ => Classification::Rethrow,
    }
}

impl Drop for PoolFairy {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(&self.key, conn, self.expired);
        }
    }
}

impl std::fmt::Debug for PoolFairy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolFairy")
            .field("host", &self.key.host)
            .field("port", &self.key.port)
            .field("expired", &self.expired)
            .finish()
    }
}
