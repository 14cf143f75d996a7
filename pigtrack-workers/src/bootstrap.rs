use std::sync::Arc;

use anyhow::Context;
use pigtrack_core::store::TrackStore;

/// Open the shared store for a worker binary. The detector and sender
/// processes communicate exclusively through the database, so a missing or
/// unusable `DATABASE_URL` is fatal at startup. (The in-memory store is for
/// tests and the single-process `demo` binary, never for the workers.)
pub async fn connect_store() -> anyhow::Result<Arc<dyn TrackStore>> {
    let url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL is not set; the workers share state only through the database")?;
    connect_postgres(&url).await
}

#[cfg(feature = "postgres")]
async fn connect_postgres(url: &str) -> anyhow::Result<Arc<dyn TrackStore>> {
    tracing::info!("connecting to PostgreSQL...");
    let pool = sqlx::PgPool::connect(url).await?;
    let store = pigtrack_core::store_postgres::PostgresStore::new(pool);
    store.migrate().await?;
    tracing::info!("using PostgresStore (migrations applied)");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn connect_postgres(_url: &str) -> anyhow::Result<Arc<dyn TrackStore>> {
    anyhow::bail!("DATABASE_URL is set but this binary was built without the postgres feature");
}

/// Watch channel flipped by Ctrl-C. Workers drain their current batch
/// before honoring it.
pub fn shutdown_signal() -> tokio::sync::watch::Receiver<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            let _ = tx.send(true);
        }
    });
    rx
}
