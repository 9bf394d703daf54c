use std::time::Duration;

use memsql::{params, ConnectOptions, Connection, ConnectionPool, Error};

mod common;

#[tokio::test]
async fn it_connects_and_queries() -> anyhow::Result<()> {
    let Some(opts) = common::server_options() else {
        common::skip("it_connects_and_queries");
        return Ok(());
    };

    let pool = ConnectionPool::new();
    let mut fairy = pool.connect(&opts).await?;

    fairy.ping().await?;
    let row = fairy.get("SELECT 1 AS one", ()).await?.expect("one row");
    assert_eq!(row.get::<i64>("one")?, 1);
    assert_eq!(row.get::<i64>(0)?, 1);

    let (host, port) = fairy.connection_info();
    assert_eq!(host, opts.get_host());
    assert_eq!(port, opts.get_port());

    Ok(())
}

#[tokio::test]
async fn checkin_reuses_sessions_per_key() -> anyhow::Result<()> {
    let Some(opts) = common::server_options() else {
        common::skip("checkin_reuses_sessions_per_key");
        return Ok(());
    };

    let pool = ConnectionPool::new();
    assert_eq!(pool.size(), 0);

    let fairy = pool.connect(&opts).await?;
    assert_eq!(pool.size(), 1);
    assert_eq!(pool.idle(&opts), 0);
    drop(fairy);

    assert_eq!(pool.idle(&opts), 1);
    assert_eq!(pool.size(), 1);

    // the idle session is taken back out, not duplicated
    let fairy = pool.connect(&opts).await?;
    assert_eq!(pool.idle(&opts), 0);
    assert_eq!(pool.size(), 1);
    drop(fairy);

    // a key with different driver options never shares sessions
    let other = opts.clone().driver_option("connect_timeout", "10");
    let fairy = pool.connect(&other).await?;
    assert_eq!(pool.idle(&opts), 1);
    assert_eq!(pool.idle(&other), 0);
    drop(fairy);
    assert_eq!(pool.idle(&other), 1);
    assert_eq!(pool.size(), 2);

    Ok(())
}

#[tokio::test]
async fn expired_fairies_are_not_repooled() -> anyhow::Result<()> {
    let Some(opts) = common::server_options() else {
        common::skip("expired_fairies_are_not_repooled");
        return Ok(());
    };

    let pool = ConnectionPool::new();
    let mut fairy = pool.connect(&opts).await?;
    fairy.expire();
    assert!(fairy.is_expired());
    drop(fairy);

    assert_eq!(pool.idle(&opts), 0);
    assert_eq!(pool.size(), 0);

    Ok(())
}

#[tokio::test]
async fn unreachable_destination_is_a_connection_failure() -> anyhow::Result<()> {
    // no server listens on the discard port
    let opts = ConnectOptions::new("127.0.0.1")
        .port(9)
        .driver_option("connect_timeout", "2");

    let pool = ConnectionPool::new();
    let error = pool.connect(&opts).await.expect_err("must fail");

    match error {
        Error::ConnectionFailure(failure) => {
            assert_eq!(failure.key.host, "127.0.0.1");
            assert_eq!(failure.key.port, 9);
            assert_eq!(failure.key.pid, std::process::id());
        }
        other => panic!("expected a connection failure, got {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn unknown_database_is_a_connection_failure() -> anyhow::Result<()> {
    let Some(opts) = common::server_options() else {
        common::skip("unknown_database_is_a_connection_failure");
        return Ok(());
    };

    let pool = ConnectionPool::new();
    let error = pool
        .connect(&opts.database("aasjdkfjdoes_not_exist"))
        .await
        .expect_err("must fail");
    assert!(error.is_connection_failure());

    Ok(())
}

#[tokio::test]
async fn application_errors_pass_through_unwrapped() -> anyhow::Result<()> {
    let Some(opts) = common::database_options().await? else {
        common::skip("application_errors_pass_through_unwrapped");
        return Ok(());
    };

    let pool = ConnectionPool::new();
    let mut fairy = pool.connect(&opts).await?;

    fairy
        .execute("CREATE TABLE IF NOT EXISTS x (id BIGINT PRIMARY KEY)", ())
        .await?;

    let error = fairy
        .query("SELECT bad_key FROM x", ())
        .await
        .expect_err("must fail");
    assert_eq!(error.server_code(), Some(memsql::error_code::ER_BAD_FIELD_ERROR));
    assert!(!fairy.is_expired());

    // the session is still perfectly usable
    let row = fairy.get("SELECT 1 AS one", ()).await?.expect("one row");
    assert_eq!(row.get::<i64>("one")?, 1);

    fairy.execute("DROP TABLE IF EXISTS x", ()).await?;
    Ok(())
}

#[tokio::test]
async fn get_enforces_row_count_and_statement_kind() -> anyhow::Result<()> {
    let Some(opts) = common::server_options() else {
        common::skip("get_enforces_row_count_and_statement_kind");
        return Ok(());
    };

    let pool = ConnectionPool::new();
    let mut fairy = pool.connect(&opts).await?;

    assert!(fairy
        .get("SELECT 1 FROM DUAL WHERE 1 = 0", ())
        .await?
        .is_none());
    assert!(matches!(
        fairy.get("SELECT 1 UNION ALL SELECT 2", ()).await,
        Err(Error::FoundMoreThanOne)
    ));
    assert!(matches!(
        fairy.get("SET @memsql_rust_test_var = 1", ()).await,
        Err(Error::NotSelect)
    ));

    Ok(())
}

#[tokio::test]
async fn parameters_are_escaped_client_side() -> anyhow::Result<()> {
    let Some(opts) = common::server_options() else {
        common::skip("parameters_are_escaped_client_side");
        return Ok(());
    };

    let pool = ConnectionPool::new();
    let mut fairy = pool.connect(&opts).await?;

    let row = fairy
        .get("SELECT %s AS a, %s AS b", params![5, "it's"])
        .await?
        .expect("one row");
    assert_eq!(row.get::<i64>("a")?, 5);
    assert_eq!(row.get::<String>("b")?, "it's");

    let row = fairy
        .get(
            "SELECT 3 IN (%s) AS present",
            memsql::Params::Positional(vec![memsql::Param::list([1, 2, 3])]),
        )
        .await?
        .expect("one row");
    assert_eq!(row.get::<i64>("present")?, 1);

    Ok(())
}

#[tokio::test]
async fn select_db_switches_the_default_schema() -> anyhow::Result<()> {
    let Some(opts) = common::database_options().await? else {
        common::skip("select_db_switches_the_default_schema");
        return Ok(());
    };

    let pool = ConnectionPool::new();
    let mut fairy = pool.connect(&opts.clone().database("information_schema")).await?;

    fairy.select_db(opts.get_database().expect("database set")).await?;
    let row = fairy
        .get("SELECT DATABASE() AS db", ())
        .await?
        .expect("one row");
    assert_eq!(row.get::<String>("db")?, opts.get_database().unwrap());

    Ok(())
}

#[tokio::test]
async fn idle_sessions_silently_reconnect() -> anyhow::Result<()> {
    let Some(opts) = common::server_options() else {
        common::skip("idle_sessions_silently_reconnect");
        return Ok(());
    };

    let mut conn =
        Connection::connect(opts.max_idle_time(Duration::from_millis(100))).await?;
    conn.query("SELECT 1", ()).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;

    // past max_idle_time the next statement reconnects under the covers
    let row = conn.get("SELECT 1 AS one", ()).await?.expect("one row");
    assert_eq!(row.get::<i64>("one")?, 1);
    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn idle_queue_is_bounded() -> anyhow::Result<()> {
    let Some(opts) = common::server_options() else {
        common::skip("idle_queue_is_bounded");
        return Ok(());
    };

    let pool = ConnectionPool::new();
    let mut borrowed = Vec::with_capacity(130);
    for _ in 0..130 {
        borrowed.push(pool.connect(&opts).await?);
    }
    assert_eq!(pool.size(), 130);

    // returning more sessions than the queue holds closes the excess
    borrowed.clear();
    assert_eq!(pool.idle(&opts), 128);
    assert_eq!(pool.size(), 128);

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn pool_close_drains_idle_sessions() -> anyhow::Result<()> {
    let Some(opts) = common::server_options() else {
        common::skip("pool_close_drains_idle_sessions");
        return Ok(());
    };

    let pool = ConnectionPool::new();
    let one = pool.connect(&opts).await?;
    let two = pool.connect(&opts).await?;
    drop(one);
    drop(two);
    assert_eq!(pool.idle(&opts), 2);

    pool.close().await;
    assert_eq!(pool.idle(&opts), 0);
    assert!(matches!(pool.connect(&opts).await, Err(Error::PoolClosed)));

    Ok(())
}
