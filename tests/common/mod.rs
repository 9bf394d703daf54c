//! Shared setup for the live-database test suites.
//!
//! Tests run against the server named by `MEMSQL_TEST_HOST` (plus the
//! optional `MEMSQL_TEST_PORT`, `MEMSQL_TEST_USER`, `MEMSQL_TEST_PASSWORD`
//! and `MEMSQL_TEST_DATABASE`) and skip themselves when it is unset.
//! Aggregator-routing tests additionally require `MEMSQL_TEST_CLUSTER=1`,
//! since they need a real multi-node cluster rather than a single server.

#![allow(dead_code)]

use memsql::{ConnectOptions, Connection};

pub const TEST_DATABASE: &str = "memsql_rust_test";

/// Connect options for the test server, without a database selected.
/// `None` when no test server is configured.
pub fn server_options() -> Option<ConnectOptions> {
    let host = std::env::var("MEMSQL_TEST_HOST").ok()?;
    let port = std::env::var("MEMSQL_TEST_PORT")
        .ok()
        .and_then(|port| port.parse().ok())
        .unwrap_or(3306);
    let user = std::env::var("MEMSQL_TEST_USER").unwrap_or_else(|_| "root".to_owned());
    let password = std::env::var("MEMSQL_TEST_PASSWORD").unwrap_or_default();

    Some(
        ConnectOptions::new(host)
            .port(port)
            .user(user)
            .password(password),
    )
}

pub fn cluster_configured() -> bool {
    std::env::var("MEMSQL_TEST_CLUSTER").map_or(false, |v| v == "1")
}

fn database_name() -> String {
    std::env::var("MEMSQL_TEST_DATABASE").unwrap_or_else(|_| TEST_DATABASE.to_owned())
}

/// Options pointing at the (created-if-needed) test database.
pub async fn database_options() -> anyhow::Result<Option<ConnectOptions>> {
    let Some(opts) = server_options() else {
        return Ok(None);
    };

    let database = database_name();
    let mut conn = Connection::connect(opts.clone()).await?;
    conn.query(&format!("CREATE DATABASE IF NOT EXISTS `{database}`"), ())
        .await?;
    conn.close().await?;

    Ok(Some(opts.database(database)))
}

/// Prints the standard skip notice. Call sites return immediately after.
pub fn skip(test: &str) {
    eprintln!("skipping {test}: set MEMSQL_TEST_HOST to run live-database tests");
}
