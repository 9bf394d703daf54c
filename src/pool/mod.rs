//! Pool of reusable connections, keyed by destination.
//!
//! Sessions are pooled per [`PoolKey`]; each key owns a bounded, lock-free
//! queue of idle sessions. A checkout hands back a [`PoolFairy`], an
//! exclusive borrow that returns its session on drop. A fairy expired by a
//! classified connection failure closes its session instead, so a broken
//! session can never be observed by a later checkout.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_queue::ArrayQueue;
use tracing::warn;

use crate::connection::Connection;
use crate::error::{Error, Result, ECONNABORTED};
use crate::options::ConnectOptions;

mod fairy;

pub use fairy::PoolFairy;

/// Idle sessions retained per key; excess checkins are closed.
const QUEUE_SIZE: usize = 128;

/// Identity of a pooled destination.
///
/// The owning process id participates so a forked child never reuses a
/// parent's sockets; the options map participates so sessions opened with
/// different driver knobs are never interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub options: BTreeMap<String, String>,
    pub pid: u32,
}

impl PoolKey {
    pub(crate) fn from_options(opts: &ConnectOptions) -> PoolKey {
        PoolKey {
            host: opts.get_host().to_owned(),
            port: opts.get_port(),
            user: opts.get_user().to_owned(),
            password: opts.get_password().to_owned(),
            database: opts.database_or_default().to_owned(),
            options: opts.get_driver_options().clone(),
            pid: std::process::id(),
        }
    }
}

/// A per-process pool of reusable sessions.
///
/// Cheap to clone; clones share state. The pool holds no global lock around
/// checkouts: the key map is guarded only for lookup, and each idle queue is
/// lock-free.
#[derive(Clone, Default)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

#[derive(Default)]
pub(crate) struct PoolInner {
    queues: Mutex<HashMap<PoolKey, Arc<ArrayQueue<Connection>>>>,
    live: AtomicUsize,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new() -> ConnectionPool {
        ConnectionPool::default()
    }

    /// Checks out a session for `opts`, reusing an idle one when a live one
    /// is available and opening a fresh one otherwise.
    ///
    /// Any failure to produce a usable session is consolidated into
    /// [`Error::ConnectionFailure`] carrying the full key.
    pub async fn connect(&self, opts: &ConnectOptions) -> Result<PoolFairy> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let key = PoolKey::from_options(opts);
        let queue = self.inner.queue(&key);

        let conn = match queue.pop() {
            Some(mut conn) => {
                if conn.connected().await {
                    Some(conn)
                } else {
                    PoolInner::close_detached(conn);
                    None
                }
            }
            None => None,
        };

        let conn = match conn {
            Some(conn) => conn,
            None => Connection::connect(opts.clone())
                .await
                .map_err(|error| consolidate_open_failure(error, key.clone()))?,
        };

        self.inner.live.fetch_add(1, Ordering::AcqRel);
        Ok(PoolFairy::new(conn, key, Arc::clone(&self.inner)))
    }

    /// Closes every idle session and refuses further checkouts. Sessions
    /// currently borrowed are closed at their checkin.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);

        let queues: Vec<Arc<ArrayQueue<Connection>>> =
            self.inner.lock_queues().values().cloned().collect();
        for queue in queues {
            while let Some(conn) = queue.pop() {
                if let Err(error) = conn.close().await {
                    warn!(target: "memsql::pool", %error, "could not close pooled connection");
                }
            }
        }
    }

    /// Idle plus borrowed session count. Approximate under concurrency.
    pub fn size(&self) -> usize {
        let idle: usize = self.inner.lock_queues().values().map(|queue| queue.len()).sum();
        idle + self.inner.live.load(Ordering::Acquire)
    }

    /// The number of idle sessions held for `opts`' key.
    pub fn idle(&self, opts: &ConnectOptions) -> usize {
        let key = PoolKey::from_options(opts);
        self.inner
            .lock_queues()
            .get(&key)
            .map_or(0, |queue| queue.len())
    }
}

impl PoolInner {
    fn lock_queues(&self) -> MutexGuard<'_, HashMap<PoolKey, Arc<ArrayQueue<Connection>>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self, key: &PoolKey) -> Arc<ArrayQueue<Connection>> {
        let mut queues = self.lock_queues();
        Arc::clone(
            queues
                .entry(key.clone())
                .or_insert_with(|| Arc::new(ArrayQueue::new(QUEUE_SIZE))),
        )
    }

    /// Returns a session to its key's queue; a session that is expired, or
    /// that finds the queue full or the pool closed, is closed instead.
    pub(crate) fn checkin(&self, key: &PoolKey, conn: Connection, expire: bool) {
        self.live.fetch_sub(1, Ordering::AcqRel);

        if expire || self.closed.load(Ordering::Acquire) {
            Self::close_detached(conn);
            return;
        }

        if let Err(conn) = self.queue(key).push(conn) {
            Self::close_detached(conn);
        }
    }

    /// Closes a session without blocking the caller; close failures are
    /// logged, never raised.
    fn close_detached(conn: Connection) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(error) = conn.close().await {
                        warn!(target: "memsql::pool", %error, "could not close expired connection");
                    }
                });
            }
            // no runtime to disconnect gracefully on; dropping still
            // releases the socket
            Err(_) => drop(conn),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("keys", &self.inner.lock_queues().len())
            .field("live", &self.inner.live.load(Ordering::Relaxed))
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// At open time no session exists to probe, so every driver error means the
/// destination is unusable and is consolidated into a connection failure.
fn consolidate_open_failure(error: Error, key: PoolKey) -> Error {
    match error {
        Error::Driver(driver) => {
            let (errno, message) = failure_details(&driver);
            Error::connection_failure(errno, message, key)
        }
        other => other,
    }
}

pub(crate) fn failure_details(error: &mysql_async::Error) -> (i32, String) {
    let errno = match error {
        mysql_async::Error::Io(mysql_async::IoError::Io(io)) => {
            io.raw_os_error().unwrap_or(ECONNABORTED)
        }
        mysql_async::Error::Server(server) => i32::from(server.code),
        _ => ECONNABORTED,
    };
    (errno, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_differ_by_options() {
        let base = ConnectOptions::new("h").database("db");
        let with_knob = base.clone().driver_option("connect_timeout", "1");

        assert_eq!(PoolKey::from_options(&base), PoolKey::from_options(&base));
        assert_ne!(
            PoolKey::from_options(&base),
            PoolKey::from_options(&with_knob)
        );
    }

    #[test]
    fn key_carries_the_owning_process() {
        let key = PoolKey::from_options(&ConnectOptions::new("h"));
        assert_eq!(key.pid, std::process::id());
        assert_eq!(key.database, "information_schema");
    }
}
