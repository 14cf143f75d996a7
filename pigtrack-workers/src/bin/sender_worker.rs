use std::sync::Arc;
use std::time::Duration;

use pigtrack_core::config::SenderConfig;
use pigtrack_workers::bootstrap::{connect_store, shutdown_signal};
use pigtrack_workers::ingest::HttpIngestClient;
use pigtrack_workers::sender::SenderWorker;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = SenderConfig::from_env()?;
    let store = connect_store().await?;
    let client = Arc::new(HttpIngestClient::new(
        &cfg.ingest_url,
        Duration::from_secs(cfg.request_timeout_sec),
    )?);

    let worker = SenderWorker::new(store, client, cfg);
    worker.run(shutdown_signal()).await;
    Ok(())
}
