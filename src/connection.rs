//! A single client session with one server.

use std::time::Instant;

use mysql_async::prelude::Queryable;
use mysql_async::Conn;
use tracing::debug;

use crate::error::{Error, Result};
use crate::options::ConnectOptions;
use crate::params::{escape_query, Params};
use crate::row::{Row, RowSet};

/// What a statement produced: a result set for reads, an affected-row count
/// for everything else.
#[derive(Debug, Clone)]
pub enum QueryOutput {
    Rows(RowSet),
    Affected(u64),
}

impl QueryOutput {
    /// The result set, or [`Error::NotSelect`] if the statement did not
    /// produce one.
    pub fn rows(self) -> Result<RowSet> {
        match self {
            QueryOutput::Rows(rows) => Ok(rows),
            QueryOutput::Affected(_) => Err(Error::NotSelect),
        }
    }

    /// Affected-row count for writes; row count for reads.
    pub fn affected(&self) -> u64 {
        match self {
            QueryOutput::Rows(rows) => rows.len() as u64,
            QueryOutput::Affected(count) => *count,
        }
    }
}

/// A lightweight wrapper around one driver session.
///
/// The main value added over the raw driver is client-side parameter
/// escaping, rows addressable by field name, and a guard against the
/// server's 8-hour idle disconnect: a handle unused for longer than
/// `max_idle_time` silently reconnects before the next statement. The
/// character set is forced to UTF-8 on every connect.
pub struct Connection {
    opts: ConnectOptions,
    conn: Conn,
    last_used: Instant,
    affected_rows: u64,
    last_insert_id: u64,
}

impl Connection {
    /// Opens a session with one physical connect.
    pub async fn connect(opts: ConnectOptions) -> Result<Connection> {
        let conn = open(&opts).await?;
        Ok(Connection {
            opts,
            conn,
            last_used: Instant::now(),
            affected_rows: 0,
            last_insert_id: 0,
        })
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.opts
    }

    /// The destination this session was opened against.
    pub fn connection_info(&self) -> (&str, u16) {
        (self.opts.get_host(), self.opts.get_port())
    }

    /// Lightweight liveness probe.
    pub async fn ping(&mut self) -> Result<()> {
        self.conn.ping().await?;
        Ok(())
    }

    /// `true` iff [`ping`](Connection::ping) succeeds.
    pub async fn connected(&mut self) -> bool {
        self.ping().await.is_ok()
    }

    /// Closes the existing session and re-opens it with the stored
    /// arguments. The replacement is opened before the old session is
    /// dropped.
    pub async fn reconnect(&mut self) -> Result<()> {
        let fresh = open(&self.opts).await?;
        let old = std::mem::replace(&mut self.conn, fresh);
        if let Err(error) = old.disconnect().await {
            debug!(target: "memsql::connection", %error, "could not close replaced session");
        }
        Ok(())
    }

    /// Switches the default schema; reconnects keep the new schema.
    pub async fn select_db(&mut self, database: &str) -> Result<()> {
        let quoted = database.replace('`', "``");
        self.conn.query_drop(format!("USE `{quoted}`")).await?;
        self.opts.set_database(database);
        Ok(())
    }

    /// Gracefully closes this session.
    pub async fn close(self) -> Result<()> {
        self.conn.disconnect().await?;
        Ok(())
    }

    /// Runs a statement, returning the rows (or the affected-row count for
    /// a non-select statement).
    pub async fn query(&mut self, sql: &str, params: impl Into<Params>) -> Result<QueryOutput> {
        self.run(sql, &params.into(), false).await
    }

    /// Like [`query`](Connection::query), but logs the escaped statement.
    pub async fn debug_query(
        &mut self,
        sql: &str,
        params: impl Into<Params>,
    ) -> Result<QueryOutput> {
        self.run(sql, &params.into(), true).await
    }

    /// Returns the only row of a select, or `None` when the select matched
    /// nothing.
    pub async fn get(&mut self, sql: &str, params: impl Into<Params>) -> Result<Option<Row>> {
        let rows = self.run(sql, &params.into(), false).await?.rows()?;
        if rows.len() > 1 {
            return Err(Error::FoundMoreThanOne);
        }
        Ok(rows.into_iter().next())
    }

    /// Executes a statement, returning the last-insert id.
    pub async fn execute(&mut self, sql: &str, params: impl Into<Params>) -> Result<u64> {
        self.run(sql, &params.into(), false).await?;
        Ok(self.last_insert_id)
    }

    /// Affected-row count of the most recent statement.
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    async fn run(&mut self, sql: &str, params: &Params, log: bool) -> Result<QueryOutput> {
        let sql = escape_query(sql, params)?;
        if log {
            debug!(target: "memsql::connection", query = %sql);
        }
        self.ensure_connected().await?;

        let (output, affected, last_insert_id) = {
            let mut result = self.conn.query_iter(sql.as_str()).await?;
            match result.columns() {
                Some(columns) => {
                    let rows: Vec<mysql_async::Row> = result.collect().await?;
                    let count = rows.len() as u64;
                    (QueryOutput::Rows(RowSet::from_driver(&columns, rows)), count, 0)
                }
                None => {
                    let affected = result.affected_rows();
                    let last_insert_id = result.last_insert_id().unwrap_or(0);
                    (QueryOutput::Affected(affected), affected, last_insert_id)
                }
            }
        };
        self.affected_rows = affected;
        self.last_insert_id = last_insert_id;
        Ok(output)
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.last_used.elapsed() > self.opts.get_max_idle_time() {
            self.reconnect().await?;
        }
        self.last_used = Instant::now();
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.opts.get_host())
            .field("port", &self.opts.get_port())
            .field("database", &self.opts.database_or_default())
            .finish()
    }
}

async fn open(opts: &ConnectOptions) -> Result<Conn> {
    let driver_opts = opts.to_driver_opts()?;
    let conn = match opts.connect_timeout()? {
        Some(limit) => tokio::time::timeout(limit, Conn::new(driver_opts))
            .await
            .map_err(|_| {
                mysql_async::Error::Io(mysql_async::IoError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connection attempt timed out",
                )))
            })??,
        None => Conn::new(driver_opts).await?,
    };
    Ok(conn)
}
