//! Routing-pool tests. These need a real cluster that understands
//! `SHOW AGGREGATORS`, so they are gated behind `MEMSQL_TEST_CLUSTER=1`
//! in addition to the usual `MEMSQL_TEST_HOST`.

use memsql::AggregatorPool;

mod common;

fn cluster_options() -> Option<memsql::ConnectOptions> {
    if !common::cluster_configured() {
        return None;
    }
    common::server_options()
}

#[tokio::test]
async fn connect_discovers_and_sticks() -> anyhow::Result<()> {
    let Some(opts) = cluster_options() else {
        common::skip("connect_discovers_and_sticks (cluster)");
        return Ok(());
    };

    let pool = AggregatorPool::new(opts);

    let mut fairy = pool.connect().await?;
    let row = fairy.get("SELECT 1 AS one", ()).await?.expect("one row");
    assert_eq!(row.get::<i64>("one")?, 1);

    let aggregators = pool.aggregators().await;
    assert!(!aggregators.is_empty());
    let sticky = pool.current().await.expect("sticky selection");
    assert!(aggregators
        .iter()
        .any(|a| a.host == sticky.host && a.port == sticky.port));

    // while the sticky aggregator is reachable, it keeps being used
    let (host, port) = fairy.connection_info();
    let (host, port) = (host.to_owned(), port);
    drop(fairy);
    let fairy = pool.connect().await?;
    assert_eq!(fairy.connection_info(), (host.as_str(), port));

    Ok(())
}

#[tokio::test]
async fn master_is_identified() -> anyhow::Result<()> {
    let Some(opts) = cluster_options() else {
        common::skip("master_is_identified (cluster)");
        return Ok(());
    };

    let pool = AggregatorPool::new(opts);
    let fairy = pool.connect_master().await?.expect("reachable master");

    let masters: Vec<_> = pool
        .aggregators()
        .await
        .into_iter()
        .filter(|a| a.master)
        .collect();
    assert_eq!(masters.len(), 1);
    assert_eq!(
        fairy.connection_info(),
        (masters[0].host.as_str(), masters[0].port)
    );

    Ok(())
}
