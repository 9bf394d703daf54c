//! Error and Result types.

use std::fmt;

use crate::pool::PoolKey;

/// A specialized `Result` type for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Fallback errno for connection failures whose cause carries no OS error.
pub(crate) const ECONNABORTED: i32 = 103;

/// A generic error that represents all the ways a method can fail inside
/// the client.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An error surfaced by the database driver, passed through verbatim.
    ///
    /// Application-level database errors (syntax, permissions, duplicate
    /// keys outside lock acquisition) always arrive through this variant.
    #[error(transparent)]
    Driver(#[from] mysql_async::Error),

    /// The session, or the attempt to open one, was classified as
    /// unreachable. The originating borrow is expired before this is
    /// raised, so the broken session never re-enters the pool.
    #[error(transparent)]
    ConnectionFailure(Box<ConnectionFailure>),

    /// More than one row was returned by a query that expected exactly one.
    #[error("found more than one row when we expected exactly one")]
    FoundMoreThanOne,

    /// `get` was used with a statement that did not produce a result set.
    #[error("statement did not return a result set")]
    NotSelect,

    /// Column was not found by name in a row.
    #[error("no column found with the name {0:?}")]
    ColumnNotFound(Box<str>),

    /// A column value could not be converted to the requested type.
    #[error("error decoding column value: {0}")]
    Decode(String),

    /// JSON payload on a task row could not be read or written.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Query-string formatting failed: placeholder/argument mismatch,
    /// an unknown parameter name, or an unsupported format character.
    #[error("query format error: {0}")]
    Format(String),

    /// The caller mixed positional and named parameters, or passed an
    /// unrecognised driver option.
    #[error("{0}")]
    Usage(String),

    /// Unexpected data came back from the server.
    #[error("{0}")]
    Protocol(String),

    /// A table-owning client was built without naming a database.
    #[error("a database name is required")]
    RequiresDatabase,

    /// A table-owning client was used before `connect`.
    #[error("not connected: call connect first")]
    NotConnected,

    /// The connection pool was closed while a checkout was requested.
    #[error("attempted to acquire a connection on a closed pool")]
    PoolClosed,
}

impl Error {
    /// The server error code, if this error carries one.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Driver(mysql_async::Error::Server(err)) => Some(err.code),
            _ => None,
        }
    }

    /// `true` if this is a consolidated connection failure.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Error::ConnectionFailure(_))
    }

    pub(crate) fn connection_failure(
        errno: i32,
        message: impl Into<String>,
        key: PoolKey,
    ) -> Error {
        Error::ConnectionFailure(Box::new(ConnectionFailure {
            errno,
            message: message.into(),
            key,
        }))
    }
}

/// Consolidates every way a pooled session can become unreachable: socket
/// resets, refused or timed-out connects, and driver-level session loss.
///
/// Carries the full connection key so callers can tell *which* destination
/// went away.
#[derive(Debug)]
pub struct ConnectionFailure {
    pub errno: i32,
    pub message: String,
    pub key: PoolKey,
}

impl fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connection to {}:{} failed ({}): {}",
            self.key.host, self.key.port, self.errno, self.message
        )
    }
}

impl std::error::Error for ConnectionFailure {}
