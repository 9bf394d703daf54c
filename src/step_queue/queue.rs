use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::Result;
use crate::options::ConnectOptions;
use crate::params::{escape_query, utcnow, Param, Params};
use crate::row::RowSet;
use crate::step_queue::error::TaskError;
use crate::step_queue::task::TaskHandler;
use crate::utility::SqlUtility;

/// Rows examined per claim attempt; the first conditional UPDATE that
/// reports one affected row wins.
const CLAIM_BATCH: usize = 5;

/// `execution_id` written by `bulk_finish`; never collides with the 32-char
/// ids handed to live executors.
const BULK_FINISH_EXECUTION_ID: &str = "0";

fn primary_table_ddl(table_name: &str) -> String {
    format!(
        r"CREATE TABLE IF NOT EXISTS `{table_name}` (
    id BIGINT AUTO_INCREMENT PRIMARY KEY,
    created DATETIME NOT NULL,

    data JSON,

    execution_id CHAR(32) DEFAULT NULL,
    steps JSON,

    started DATETIME,
    last_contact DATETIME,
    update_count INT UNSIGNED DEFAULT 0 NOT NULL,
    finished DATETIME,

    result AS data::$result PERSISTED VARCHAR(255),

    INDEX (created),
    INDEX (started),
    INDEX (last_contact)
)"
    )
}

/// A raw SQL fragment plus its arguments, appended as `AND (<fragment>)` to
/// every claim, count, and bulk-finish statement. The arguments are escaped
/// through the same substitution as ordinary statement parameters.
#[derive(Debug, Clone)]
pub struct ExtraPredicate {
    sql: String,
    params: Params,
}

impl ExtraPredicate {
    pub fn new(sql: impl Into<String>, params: impl Into<Params>) -> ExtraPredicate {
        ExtraPredicate {
            sql: sql.into(),
            params: params.into(),
        }
    }

    pub(crate) fn to_sql(&self) -> Result<String> {
        Ok(format!("AND ({})", escape_query(&self.sql, &self.params)?))
    }
}

/// How [`StepQueue::start`] hunts for a claim.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Keep retrying until a task is claimed (or `timeout` elapses).
    pub block: bool,
    /// Wall-clock bound on blocking mode.
    pub timeout: Option<Duration>,
    /// Upper bound on the sleep between attempts; the actual sleep is
    /// jittered per attempt.
    pub retry_interval: Duration,
    pub extra_predicate: Option<ExtraPredicate>,
}

impl Default for StartOptions {
    fn default() -> StartOptions {
        StartOptions {
            block: false,
            timeout: None,
            retry_interval: Duration::from_millis(500),
            extra_predicate: None,
        }
    }
}

impl StartOptions {
    pub fn blocking() -> StartOptions {
        StartOptions {
            block: true,
            ..StartOptions::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> StartOptions {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_interval(mut self, retry_interval: Duration) -> StartOptions {
        self.retry_interval = retry_interval;
        self
    }

    pub fn extra_predicate(mut self, predicate: ExtraPredicate) -> StartOptions {
        self.extra_predicate = Some(predicate);
        self
    }
}

/// A durable task queue stored in one table.
///
/// Cheap to clone; clones share the pool and the TTL. All coordination is
/// in the database; the queue keeps no task state in memory.
#[derive(Clone)]
pub struct StepQueue {
    pub(crate) inner: Arc<QueueInner>,
}

pub(crate) struct QueueInner {
    pub(crate) utility: SqlUtility,
    pub(crate) table_name: String,
    execution_ttl: AtomicU64,
}

impl StepQueue {
    /// A queue over `table_name` whose claims expire after 60 seconds of
    /// silence.
    pub fn new(table_name: impl Into<String>) -> StepQueue {
        StepQueue::with_execution_ttl(table_name, Duration::from_secs(60))
    }

    pub fn with_execution_ttl(table_name: impl Into<String>, ttl: Duration) -> StepQueue {
        let table_name = table_name.into();
        let mut utility = SqlUtility::new();
        utility.define_table(table_name.clone(), primary_table_ddl(&table_name));
        StepQueue {
            inner: Arc::new(QueueInner {
                utility,
                table_name,
                execution_ttl: AtomicU64::new(ttl.as_secs()),
            }),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.inner.table_name
    }

    /// Seconds of silence after which a claim is abandoned.
    pub fn execution_ttl(&self) -> u64 {
        self.inner.execution_ttl.load(Ordering::Relaxed)
    }

    pub fn set_execution_ttl(&self, ttl: Duration) {
        self.inner
            .execution_ttl
            .store(ttl.as_secs(), Ordering::Relaxed);
    }

    /// Connects to the database holding the queue table.
    pub async fn connect(&self, opts: ConnectOptions) -> Result<()> {
        self.inner.utility.connect(opts).await
    }

    pub async fn disconnect(&self) {
        self.inner.utility.disconnect().await;
    }

    /// Creates the queue table.
    pub async fn setup(&self) -> Result<()> {
        self.inner.utility.setup().await
    }

    /// Drops the queue table.
    pub async fn destroy(&self) -> Result<()> {
        self.inner.utility.destroy().await
    }

    /// `true` once the queue table exists.
    pub async fn ready(&self) -> Result<bool> {
        self.inner.utility.ready().await
    }

    /// An approximate number of claimable tasks.
    pub async fn qsize(&self) -> Result<u64> {
        self.qsize_where(None).await
    }

    pub async fn qsize_where(&self, extra_predicate: Option<&ExtraPredicate>) -> Result<u64> {
        let rows = self
            .query_queued("COUNT(*) AS count", None, extra_predicate)
            .await?;
        match rows.first() {
            Some(row) => Ok(row.get::<u64>("count")?),
            None => Ok(0),
        }
    }

    /// Enqueues a task, returning its row id.
    pub async fn enqueue(&self, data: &serde_json::Value) -> Result<u64> {
        let sql = format!(
            "INSERT INTO `{}` (created, data) VALUES (%(created)s, %(data)s)",
            self.inner.table_name
        );
        let mut conn = self.inner.utility.conn().await?;
        conn.execute(
            &sql,
            Params::Named(BTreeMap::from([
                ("created".to_owned(), Param::datetime(utcnow())),
                ("data".to_owned(), Param::json(data)?),
            ])),
        )
        .await
    }

    /// Claims a task, returning its handler or `None` when nothing is
    /// claimable. In blocking mode, sleeps a jittered fraction of
    /// `retry_interval` between attempts and honours `timeout`.
    pub async fn start(&self, options: StartOptions) -> Result<Option<TaskHandler>, TaskError> {
        let begun = Instant::now();
        loop {
            let handler = self.dequeue_task(options.extra_predicate.as_ref()).await?;
            if handler.is_some() || !options.block {
                return Ok(handler);
            }
            if let Some(timeout) = options.timeout {
                if begun.elapsed() > timeout {
                    return Ok(None);
                }
            }
            let jitter = rand::thread_rng().gen::<f64>() + 0.1;
            tokio::time::sleep(options.retry_interval.mul_f64(jitter)).await;
        }
    }

    /// Re-attaches a handler to an existing claim.
    pub async fn checkout(
        &self,
        task_id: u64,
        execution_id: impl Into<String>,
    ) -> Result<TaskHandler, TaskError> {
        TaskHandler::attach(self.clone(), task_id, execution_id.into()).await
    }

    /// Finishes every currently-claimable task with the given result in one
    /// sweep; tasks with a live executor are left alone. Returns the number
    /// of tasks finished.
    pub async fn bulk_finish(
        &self,
        result: &str,
        extra_predicate: Option<&ExtraPredicate>,
    ) -> Result<u64> {
        let extra = match extra_predicate {
            Some(predicate) => predicate.to_sql()?,
            None => String::new(),
        };
        let sql = format!(
            r"UPDATE `{table}`
SET
    execution_id = %(execution_id)s,
    last_contact = %(now)s,
    update_count = update_count + 1,
    steps = '[]',
    started = %(now)s,
    finished = %(now)s,
    data::$result = %(result)s
WHERE
    finished IS NULL
    AND (
        execution_id IS NULL
        OR last_contact <= %(now)s - INTERVAL %(ttl)s SECOND
    )
    {extra}",
            table = self.inner.table_name,
        );

        let mut conn = self.inner.utility.conn().await?;
        let affected = conn
            .query(
                &sql,
                Params::Named(BTreeMap::from([
                    (
                        "execution_id".to_owned(),
                        Param::value(BULK_FINISH_EXECUTION_ID),
                    ),
                    ("now".to_owned(), Param::datetime(utcnow())),
                    ("ttl".to_owned(), Param::value(self.execution_ttl())),
                    ("result".to_owned(), Param::value(result)),
                ])),
            )
            .await?
            .affected();
        Ok(affected)
    }

    pub(crate) async fn query_queued(
        &self,
        projection: &str,
        limit: Option<usize>,
        extra_predicate: Option<&ExtraPredicate>,
    ) -> Result<RowSet> {
        let extra = match extra_predicate {
            Some(predicate) => predicate.to_sql()?,
            None => String::new(),
        };
        let limit = match limit {
            Some(limit) => format!("LIMIT {limit}"),
            None => String::new(),
        };
        let sql = format!(
            r"SELECT
    {projection}
FROM `{table}`
WHERE
    finished IS NULL
    AND (
        execution_id IS NULL
        OR last_contact <= %(now)s - INTERVAL %(ttl)s SECOND
    )
    {extra}
ORDER BY created ASC
{limit}",
            table = self.inner.table_name,
        );

        let mut conn = self.inner.utility.conn().await?;
        conn.query(
            &sql,
            Params::Named(BTreeMap::from([
                ("now".to_owned(), Param::datetime(utcnow())),
                ("ttl".to_owned(), Param::value(self.execution_ttl())),
            ])),
        )
        .await?
        .rows()
    }

    async fn dequeue_task(
        &self,
        extra_predicate: Option<&ExtraPredicate>,
    ) -> Result<Option<TaskHandler>, TaskError> {
        let execution_id = uuid::Uuid::new_v4().simple().to_string();
        let extra = match extra_predicate {
            Some(predicate) => predicate.to_sql().map_err(TaskError::Database)?,
            None => String::new(),
        };
        let claim_sql = format!(
            r"UPDATE `{table}`
SET
    execution_id = %(execution_id)s,
    last_contact = %(now)s,
    update_count = update_count + 1,
    started = %(now)s,
    steps = '[]'
WHERE
    id = %(task_id)s
    AND finished IS NULL
    AND (
        execution_id IS NULL
        OR last_contact <= %(now)s - INTERVAL %(ttl)s SECOND
    )
    {extra}",
            table = self.inner.table_name,
        );

        loop {
            let candidates = self
                .query_queued("id, created, data", Some(CLAIM_BATCH), extra_predicate)
                .await
                .map_err(TaskError::Database)?;

            if candidates.is_empty() {
                return Ok(None);
            }

            for candidate in &candidates {
                let task_id = candidate.get::<u64>("id").map_err(TaskError::Database)?;

                let mut conn = self
                    .inner
                    .utility
                    .conn()
                    .await
                    .map_err(TaskError::Database)?;
                let claimed = conn
                    .query(
                        &claim_sql,
                        Params::Named(BTreeMap::from([
                            ("execution_id".to_owned(), Param::value(execution_id.clone())),
                            ("now".to_owned(), Param::datetime(utcnow())),
                            ("task_id".to_owned(), Param::value(task_id)),
                            ("ttl".to_owned(), Param::value(self.execution_ttl())),
                        ])),
                    )
                    .await
                    .map_err(TaskError::Database)?
                    .affected();

                if claimed == 1 {
                    let handler =
                        TaskHandler::attach(self.clone(), task_id, execution_id).await?;
                    return Ok(Some(handler));
                }
            }
        }
    }
}

impl std::fmt::Debug for StepQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepQueue")
            .field("table_name", &self.inner.table_name)
            .field("execution_ttl", &self.execution_ttl())
            .finish()
    }
}
