use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use hlm::{HlmResult, LockManager, LockManagerConfig, LockMode, LockTimeout, OwnerId};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Runs a handful of transactions against one table, each locking the table in an intent mode
/// and a single row exclusively.
#[tokio::main]
async fn main() -> HlmResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let manager = Arc::new(LockManager::new(LockManagerConfig::default()));
    manager.open("hlm-demo")?;

    let transactions = (0..8u64).map(|txn| {
        let manager = manager.clone();
        tokio::spawn(async move {
            let owner = OwnerId::from(format!("txn-{txn}"));
            let row = format!("/db/users/{}", txn % 3);

            let table = manager
                .acquire_lock(&owner, "/db/users", LockMode::IntentExclusive, LockTimeout::Infinite)
                .await?;
            let row_lock = manager
                .acquire_lock(&owner, &row, LockMode::Exclusive, Duration::from_secs(1).into())
                .await?;
            info!(%owner, %row, status = %row_lock.status(), "row lock decided");

            if row_lock.is_granted() {
                tokio::time::sleep(Duration::from_millis(20)).await;
                manager.release(&row_lock)?;
            }
            manager.release(&table)?;
            HlmResult::Ok(())
        })
    });
    for result in join_all(transactions).await {
        match result {
            Ok(result) => result?,
            Err(e) => tracing::error!("transaction task failed: {e}"),
        }
    }

    let schema = manager
        .acquire_lock(
            &OwnerId::from("ddl"),
            "/db/users",
            LockMode::SchemaModification,
            LockTimeout::IMMEDIATE,
        )
        .await?;
    info!(status = %schema.status(), "schema lock decided");
    manager.release(&schema)?;

    manager.close().await;
    Ok(())
}
