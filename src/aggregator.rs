//! An automatic fail-over connection pool.
//!
//! One layer above [`ConnectionPool`](crate::ConnectionPool): picks a random
//! aggregator and sticks with it while it is reachable, failing over to
//! another member when it is not. The aggregator list is maintained by
//! periodically running `SHOW AGGREGATORS`.

use std::sync::Arc;
use std::time::Instant;

use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::error_code::ER_DISTRIBUTED_NOT_AGGREGATOR;
use crate::options::ConnectOptions;
use crate::params::Params;
use crate::pool::{ConnectionPool, PoolFairy};

/// A successful refresh is reused for this long.
const REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// One routing node of the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregator {
    pub host: String,
    pub port: u16,
    /// The member that owns cluster metadata writes.
    pub master: bool,
}

#[derive(Default)]
struct State {
    aggregators: Vec<Aggregator>,
    current: Option<Aggregator>,
    master: Option<Aggregator>,
    refreshed_at: Option<Instant>,
}

/// A fail-over routing pool over a cluster's aggregators.
///
/// Cheap to clone; clones share the sticky selection and the discovered
/// list. The bootstrap address in `opts` is only dialed directly while the
/// aggregator list is unknown.
#[derive(Clone)]
pub struct AggregatorPool {
    shared: Arc<Shared>,
}

struct Shared {
    opts: ConnectOptions,
    pool: ConnectionPool,
    state: Mutex<State>,
}

impl AggregatorPool {
    /// `opts` names the bootstrap aggregator plus the credentials and
    /// database used for every member.
    pub fn new(opts: ConnectOptions) -> AggregatorPool {
        AggregatorPool {
            shared: Arc::new(Shared {
                opts,
                pool: ConnectionPool::new(),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// The inner connection pool, shared with every member.
    pub fn pool(&self) -> &ConnectionPool {
        &self.shared.pool
    }

    /// Borrows a connection to some reachable aggregator.
    ///
    /// Prefers the sticky choice; on its failure falls over to a random
    /// member, refreshing the list through the bootstrap address when it is
    /// unknown. When every member fails, the sticky choice and the list are
    /// cleared and the last failure is reraised.
    pub async fn connect(&self) -> Result<PoolFairy> {
        let mut fairy = self.acquire().await?;
        self.refresh(&mut fairy, false).await?;
        Ok(fairy)
    }

    /// Borrows a connection to the master aggregator, or `None` when it
    /// cannot be reached. Forces a refresh first when the master is
    /// unknown.
    pub async fn connect_master(&self) -> Result<Option<PoolFairy>> {
        let mut master = { self.shared.state.lock().await.master.clone() };

        if master.is_none() {
            let mut fairy = self.acquire().await?;
            self.refresh(&mut fairy, true).await?;
            master = self.shared.state.lock().await.master.clone();
        }

        let Some(master) = master else { return Ok(None) };

        match self.shared.pool.connect(&self.member_opts(&master)).await {
            Ok(fairy) => Ok(Some(fairy)),
            Err(Error::ConnectionFailure(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// The members discovered by the last refresh.
    pub async fn aggregators(&self) -> Vec<Aggregator> {
        self.shared.state.lock().await.aggregators.clone()
    }

    /// The sticky aggregator, if one is selected.
    pub async fn current(&self) -> Option<Aggregator> {
        self.shared.state.lock().await.current.clone()
    }

    async fn acquire(&self) -> Result<PoolFairy> {
        // sticky fast path
        let sticky = { self.shared.state.lock().await.current.clone() };
        if let Some(aggregator) = sticky {
            match self.shared.pool.connect(&self.member_opts(&aggregator)).await {
                Ok(fairy) => return Ok(fairy),
                Err(Error::ConnectionFailure(_)) => {
                    self.shared.state.lock().await.current = None;
                }
                Err(error) => return Err(error),
            }
        }

        // bootstrap discovery when the list is unknown
        let list_empty = { self.shared.state.lock().await.aggregators.is_empty() };
        if list_empty {
            let mut fairy = self.shared.pool.connect(&self.shared.opts).await?;
            let refreshed = self.refresh(&mut fairy, true).await;
            fairy.expire();
            drop(fairy);
            refreshed?;
        }

        let mut candidates = { self.shared.state.lock().await.aggregators.clone() };
        candidates.shuffle(&mut rand::thread_rng());

        let mut last_failure = None;
        for aggregator in candidates {
            debug!(
                target: "memsql::aggregator",
                host = %aggregator.host,
                port = aggregator.port,
                "connecting"
            );
            match self.shared.pool.connect(&self.member_opts(&aggregator)).await {
                Ok(fairy) => {
                    self.shared.state.lock().await.current = Some(aggregator);
                    return Ok(fairy);
                }
                Err(error @ Error::ConnectionFailure(_)) => last_failure = Some(error),
                Err(error) => return Err(error),
            }
        }

        {
            let mut state = self.shared.state.lock().await;
            state.current = None;
            state.aggregators.clear();
        }

        Err(last_failure.unwrap_or_else(|| {
            Error::Protocol("failed to retrieve a list of aggregators".to_owned())
        }))
    }

    /// Re-runs discovery over `fairy`; a refresh within the last 30 seconds
    /// is reused unless `force` is set.
    async fn refresh(&self, fairy: &mut PoolFairy, force: bool) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if !force {
            if let Some(at) = state.refreshed_at {
                if at.elapsed() < REFRESH_INTERVAL {
                    return Ok(());
                }
            }
        }
        self.update_aggregator_list(&mut state, fairy).await
    }

    /// One `SHOW AGGREGATORS` round trip; the lock is held across exactly
    /// this call.
    async fn update_aggregator_list(
        &self,
        state: &mut State,
        fairy: &mut PoolFairy,
    ) -> Result<()> {
        let rows = match fairy.query("SHOW AGGREGATORS", Params::Empty).await {
            Ok(output) => output.rows()?,
            Err(error) if error.server_code() == Some(ER_DISTRIBUTED_NOT_AGGREGATOR) => {
                // a single box: the bootstrap node is the only aggregator,
                // and it is the master
                let only = Aggregator {
                    host: self.shared.opts.get_host().to_owned(),
                    port: self.shared.opts.get_port(),
                    master: true,
                };
                state.aggregators = vec![only.clone()];
                state.master = Some(only);
                state.refreshed_at = Some(Instant::now());
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        let mut aggregators = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut host: String = row.get("Host")?;
            if host == "127.0.0.1" {
                // the row describes the node we are talking to; report it
                // under the address we actually reached it by
                host = fairy.connection_info().0.to_owned();
            }
            let port: u16 = row.get("Port")?;
            let master = row.get::<i64>("Master_Aggregator").unwrap_or(0) == 1;
            aggregators.push(Aggregator { host, port, master });
        }

        if aggregators.is_empty() {
            return Err(Error::Protocol(
                "aggregator list is empty after refresh".to_owned(),
            ));
        }

        state.master = aggregators.iter().find(|a| a.master).cloned();
        if let Some(current) = &state.current {
            let still_member = aggregators
                .iter()
                .any(|a| a.host == current.host && a.port == current.port);
            if !still_member {
                state.current = None;
            }
        }
        state.aggregators = aggregators;
        state.refreshed_at = Some(Instant::now());

        debug!(
            target: "memsql::aggregator",
            aggregators = ?state.aggregators,
            current = ?state.current,
            "aggregator list updated"
        );
        Ok(())
    }

    fn member_opts(&self, aggregator: &Aggregator) -> ConnectOptions {
        self.shared
            .opts
            .clone()
            .host(aggregator.host.clone())
            .port(aggregator.port)
    }
}

impl std::fmt::Debug for AggregatorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatorPool")
            .field("bootstrap_host", &self.shared.opts.get_host())
            .field("bootstrap_port", &self.shared.opts.get_port())
            .finish()
    }
}
