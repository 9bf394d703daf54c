use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memsql::{AcquireOptions, SqlLockManager};

mod common;

async fn fresh_manager(prefix: &str) -> anyhow::Result<Option<SqlLockManager>> {
    let Some(opts) = common::database_options().await? else {
        return Ok(None);
    };

    let manager = SqlLockManager::new(prefix);
    manager.connect(opts).await?;
    manager.destroy().await?;
    manager.setup().await?;
    assert!(manager.ready().await?);
    Ok(Some(manager))
}

#[tokio::test]
async fn acquire_is_exclusive_until_release() -> anyhow::Result<()> {
    let Some(manager) = fresh_manager("lk_basic").await? else {
        common::skip("acquire_is_exclusive_until_release");
        return Ok(());
    };

    let lock = manager
        .acquire("x", AcquireOptions::default().owner("tester"))
        .await?
        .expect("free lock");
    assert!(lock.valid().await?);
    assert_eq!(lock.owner, "tester");

    // a second acquisition of the same id is refused
    assert!(manager.acquire("x", AcquireOptions::default()).await?.is_none());
    // other ids are unaffected
    let other = manager
        .acquire("y", AcquireOptions::default())
        .await?
        .expect("different id");
    other.release().await?;

    assert!(lock.ping().await?);
    assert!(lock.release().await?);
    assert!(!lock.valid().await?);
    assert!(!lock.release().await?);

    // released means acquirable again
    assert!(manager.acquire("x", AcquireOptions::default()).await?.is_some());

    Ok(())
}

#[tokio::test]
async fn expired_holders_are_swept() -> anyhow::Result<()> {
    let Some(manager) = fresh_manager("lk_expiry").await? else {
        common::skip("expired_holders_are_swept");
        return Ok(());
    };

    let lock = manager
        .acquire("x", AcquireOptions::default().expiry(Duration::from_secs(1)))
        .await?
        .expect("free lock");

    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert!(!lock.valid().await?);
    let stolen = manager
        .acquire("x", AcquireOptions::default())
        .await?
        .expect("expired lock is reclaimable");
    assert!(stolen.valid().await?);
    // the old acquisition cannot heartbeat its way back
    assert!(!lock.ping().await?);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn blocking_acquire_is_mutually_exclusive() -> anyhow::Result<()> {
    let Some(manager) = fresh_manager("lk_mutex").await? else {
        common::skip("blocking_acquire_is_mutually_exclusive");
        return Ok(());
    };

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let contenders: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                let lock = manager
                    .acquire(
                        "shared",
                        AcquireOptions::blocking()
                            .timeout(Duration::from_secs(30))
                            .retry_interval(Duration::from_millis(50)),
                    )
                    .await?
                    .expect("blocking acquire");

                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);

                lock.release().await?;
                anyhow::Ok(())
            })
        })
        .collect();

    for result in futures::future::join_all(contenders).await {
        result??;
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    Ok(())
}
