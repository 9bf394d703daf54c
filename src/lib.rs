//! Client toolkit for MemSQL-style distributed SQL clusters.
//!
//! Three cooperating layers over a MySQL-wire-protocol cluster, plus a
//! small lock manager:
//!
//! * [`Connection`]: a thin session handle over the raw driver, with UTF-8
//!   connects, client-side `%s` / `%(name)s` parameter escaping, rows
//!   addressable by name, and silent reconnection of idle sessions.
//! * [`ConnectionPool`]: per-destination queues of reusable sessions.
//!   A checkout hands back a [`PoolFairy`], a scoped borrow that
//!   classifies connection-class errors and guarantees a broken session is
//!   closed rather than re-pooled.
//! * [`AggregatorPool`]: discovers a cluster's aggregators via
//!   `SHOW AGGREGATORS`, sticks with a randomly chosen one, and fails over
//!   transparently when it goes away.
//! * [`StepQueue`] / [`SqlLockManager`]: durable task and lock state
//!   machines expressed against SQL tables. At-most-one live executor per
//!   task is enforced by conditional UPDATEs alone; abandoned work is
//!   reclaimed after a TTL of heartbeat silence.
//!
//! Data flows bottom-up: a task handler borrows a routing-pool
//! connection, which borrows a pool connection, which wraps a driver
//! session. Control flows top-down: a layer that detects a failure expires
//! the borrow beneath it, so bad sessions never re-enter the pool.
//!
//! ```no_run
//! use memsql::{ConnectOptions, StepQueue, StartOptions};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = StepQueue::new("work");
//! queue
//!     .connect(ConnectOptions::new("127.0.0.1").database("app"))
//!     .await?;
//! queue.setup().await?;
//!
//! queue.enqueue(&serde_json::json!({ "kind": "compact" })).await?;
//!
//! if let Some(mut task) = queue.start(StartOptions::default()).await? {
//!     task.step("compact", async { do_compaction().await }).await??;
//!     task.finish().await?;
//! }
//! # Ok(())
//! # }
//! # async fn do_compaction() -> Result<(), Box<dyn std::error::Error>> { Ok(()) }
//! ```

pub mod aggregator;
pub mod connection;
pub mod error;
pub mod error_code;
pub mod lock;
pub mod options;
pub mod params;
pub mod pool;
pub mod query_builder;
pub mod row;
pub mod step_queue;

mod utility;

pub use aggregator::{Aggregator, AggregatorPool};
pub use connection::{Connection, QueryOutput};
pub use error::{ConnectionFailure, Error, Result};
pub use lock::{AcquireOptions, SqlLock, SqlLockManager};
pub use options::ConnectOptions;
pub use params::{IntoParam, Param, Params};
pub use pool::{ConnectionPool, PoolFairy, PoolKey};
pub use row::{Row, RowSet};
pub use step_queue::{ExtraPredicate, StartOptions, Step, StepQueue, TaskError, TaskHandler};
