//! Shared base for clients that own tables in the database.

use std::sync::{Mutex, PoisonError};

use crate::error::{Error, Result};
use crate::options::ConnectOptions;
use crate::params::{Param, Params};
use crate::pool::{ConnectionPool, PoolFairy};

/// Holds a pool, the connect arguments, and the DDL for the tables a client
/// manages. [`StepQueue`](crate::StepQueue) and
/// [`SqlLockManager`](crate::SqlLockManager) embed one.
pub(crate) struct SqlUtility {
    pool: ConnectionPool,
    opts: Mutex<Option<ConnectOptions>>,
    tables: Vec<(String, String)>,
}

impl SqlUtility {
    pub fn new() -> SqlUtility {
        SqlUtility {
            pool: ConnectionPool::new(),
            opts: Mutex::new(None),
            tables: Vec::new(),
        }
    }

    /// Registers a table this client owns; `setup` creates it, `destroy`
    /// drops it, `ready` probes for it.
    pub fn define_table(&mut self, name: impl Into<String>, ddl: impl Into<String>) {
        self.tables.push((name.into(), ddl.into()));
    }

    /// Stores the connect arguments and probes the database once. A missing
    /// database name is refused up front.
    pub async fn connect(&self, opts: ConnectOptions) -> Result<()> {
        if opts.get_database().is_none() {
            return Err(Error::RequiresDatabase);
        }

        let mut fairy = self.pool.connect(&opts).await?;
        fairy.query("SELECT 1", Params::Empty).await?;

        *self.lock_opts() = Some(opts);
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.pool.close().await;
    }

    /// Creates the registered tables.
    pub async fn setup(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        for (_, ddl) in &self.tables {
            conn.execute(ddl, Params::Empty).await?;
        }
        Ok(())
    }

    /// Drops the registered tables.
    pub async fn destroy(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        for (name, _) in &self.tables {
            conn.execute(&format!("DROP TABLE IF EXISTS `{name}`"), Params::Empty)
                .await?;
        }
        Ok(())
    }

    /// `true` once every registered table exists in the database.
    pub async fn ready(&self) -> Result<bool> {
        let database = self
            .options()?
            .get_database()
            .map(str::to_owned)
            .unwrap_or_default();

        let mut conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT table_name AS t FROM information_schema.tables \
                 WHERE table_schema = %s",
                Params::Positional(vec![Param::value(database)]),
            )
            .await?
            .rows()?;

        let mut present = Vec::with_capacity(rows.len());
        for row in &rows {
            present.push(row.get::<String>("t")?);
        }

        Ok(self
            .tables
            .iter()
            .all(|(name, _)| present.iter().any(|t| t == name)))
    }

    /// Borrows a pooled connection with the stored arguments.
    pub async fn conn(&self) -> Result<PoolFairy> {
        let opts = self.options()?;
        self.pool.connect(&opts).await
    }

    fn options(&self) -> Result<ConnectOptions> {
        self.lock_opts().clone().ok_or(Error::NotConnected)
    }

    fn lock_opts(&self) -> std::sync::MutexGuard<'_, Option<ConnectOptions>> {
        self.opts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
